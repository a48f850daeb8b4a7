//! Inventory records the broker keeps consistent with external systems.
//!
//! These are narrow projections carrying the fields synchronization needs.
//! Records reference each other by primary key, never by live handle.

use serde::{Deserialize, Serialize};

use crate::refs::{EntityId, EntityKey, ForeignId, ObjectKind, ObjectRef};
use crate::{Error, Result};

/// A configured appliance manager endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConnector {
    /// Primary key.
    pub id: EntityId,
    /// Display name, unique per kind.
    pub name: String,
    /// Address of the manager's API.
    pub endpoint: String,
}

/// A virtualization provider together with its SDN controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualizationConnector {
    /// Primary key.
    pub id: EntityId,
    /// Display name, unique per kind.
    pub name: String,
    /// Address of the virtualization provider's API.
    pub provider_endpoint: String,
    /// Address of the SDN controller's API.
    pub controller_endpoint: String,
}

/// A deployed security appliance awaiting or holding a manager registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplianceInstance {
    /// Primary key.
    pub id: EntityId,
    /// Display name, unique per kind.
    pub name: String,
    /// The virtualization connector hosting the appliance.
    pub connector_id: EntityId,
    /// The manager the appliance registers with.
    pub manager_id: EntityId,
    /// Management address of the appliance.
    pub ip: String,
    /// Device identifier assigned by the manager once registered.
    pub device_id: Option<ForeignId>,
}

/// A protected group of workloads on one virtualization connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    /// Primary key.
    pub id: EntityId,
    /// Display name, unique per kind.
    pub name: String,
    /// The virtualization connector the group lives on.
    pub connector_id: EntityId,
    /// Network group identifier assigned by the SDN controller once pushed.
    pub network_group_id: Option<ForeignId>,
    /// Orchestrator label selecting pods that belong to this group.
    pub pod_selector: Option<String>,
}

/// Membership kinds a security group can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// A virtual machine.
    Vm,
    /// A virtual network.
    Network,
    /// A subnet.
    Subnet,
    /// An orchestrator pod.
    Pod,
}

/// One member of a security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupMember {
    /// Primary key.
    pub id: EntityId,
    /// The owning security group.
    pub group_id: EntityId,
    /// What the member is.
    pub kind: MemberKind,
    /// External identifier of the member workload.
    pub foreign_id: ForeignId,
    /// Display name.
    pub name: String,
}

/// A manager-owned policy domain mirrored locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    /// Primary key.
    pub id: EntityId,
    /// The manager that owns the domain.
    pub manager_id: EntityId,
    /// The manager's identifier for the domain.
    pub foreign_id: ForeignId,
    /// Display name.
    pub name: String,
}

/// A manager-owned policy belonging to a mirrored domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Primary key.
    pub id: EntityId,
    /// The local domain the policy belongs to.
    pub domain_id: EntityId,
    /// The manager's identifier for the policy.
    pub foreign_id: ForeignId,
    /// Display name.
    pub name: String,
}

/// Closed set of records the store can hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entity {
    /// An appliance manager connector.
    Manager(ManagerConnector),
    /// A virtualization connector.
    Connector(VirtualizationConnector),
    /// A deployed appliance.
    Appliance(ApplianceInstance),
    /// A security group.
    Group(SecurityGroup),
    /// A security group member.
    GroupMember(SecurityGroupMember),
    /// A mirrored policy domain.
    Domain(Domain),
    /// A mirrored policy.
    Policy(Policy),
}

impl Entity {
    /// The aggregate kind of the wrapped record.
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Manager(_) => ObjectKind::Manager,
            Self::Connector(_) => ObjectKind::Connector,
            Self::Appliance(_) => ObjectKind::Appliance,
            Self::Group(_) => ObjectKind::SecurityGroup,
            Self::GroupMember(_) => ObjectKind::GroupMember,
            Self::Domain(_) => ObjectKind::Domain,
            Self::Policy(_) => ObjectKind::Policy,
        }
    }

    /// The record's primary key value.
    #[must_use]
    pub fn id(&self) -> EntityId {
        match self {
            Self::Manager(record) => record.id,
            Self::Connector(record) => record.id,
            Self::Appliance(record) => record.id,
            Self::Group(record) => record.id,
            Self::GroupMember(record) => record.id,
            Self::Domain(record) => record.id,
            Self::Policy(record) => record.id,
        }
    }

    /// The record's store key.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.id())
    }

    /// The record's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Manager(record) => &record.name,
            Self::Connector(record) => &record.name,
            Self::Appliance(record) => &record.name,
            Self::Group(record) => &record.name,
            Self::GroupMember(record) => &record.name,
            Self::Domain(record) => &record.name,
            Self::Policy(record) => &record.name,
        }
    }

    /// A lock reference identifying the wrapped record.
    #[must_use]
    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind(), self.id(), self.name())
    }
}

macro_rules! entity_try_from {
    ($($variant:ident => $record:ty),* $(,)?) => {
        $(impl TryFrom<Entity> for $record {
            type Error = Error;

            fn try_from(entity: Entity) -> Result<Self> {
                match entity {
                    Entity::$variant(record) => Ok(record),
                    other => Err(Error::Store(format!(
                        concat!("expected a ", stringify!($variant), " record, found {}"),
                        other.key()
                    ))),
                }
            }
        })*
    };
}

entity_try_from! {
    Manager => ManagerConnector,
    Connector => VirtualizationConnector,
    Appliance => ApplianceInstance,
    Group => SecurityGroup,
    GroupMember => SecurityGroupMember,
    Domain => Domain,
    Policy => Policy,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_group() -> Entity {
        Entity::Group(SecurityGroup {
            id: EntityId(3),
            name: "web-tier".to_owned(),
            connector_id: EntityId(7),
            network_group_id: None,
            pod_selector: Some("app=web".to_owned()),
        })
    }

    #[test]
    fn test_entity_key_and_ref() {
        let entity = sample_group();
        assert_eq!(entity.key(), EntityKey::new(ObjectKind::SecurityGroup, EntityId(3)));
        assert_eq!(entity.object_ref().to_string(), "SecurityGroup#3");
        assert_eq!(entity.name(), "web-tier");
    }

    #[test]
    fn test_entity_serde_round_trip() -> anyhow::Result<()> {
        let entity = sample_group();
        let json = serde_json::to_string(&entity)?;
        let back: Entity = serde_json::from_str(&json)?;
        assert_eq!(entity, back);
        Ok(())
    }

    #[test]
    fn test_typed_extraction_checks_the_variant() -> anyhow::Result<()> {
        let group = SecurityGroup::try_from(sample_group())?;
        assert_eq!(group.name, "web-tier");

        let wrong = ManagerConnector::try_from(sample_group());
        assert!(wrong.is_err());
        Ok(())
    }
}
