//! Network group conform: security groups pushed to the SDN controller.
//!
//! The local store is authoritative. Each security group of a connector
//! maps to one controller network group whose member set mirrors the local
//! membership; controller groups no local group points at are orphans and
//! get removed.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use warden_core::entities::{SecurityGroup, SecurityGroupMember, VirtualizationConnector};
use warden_core::store::StoreTransaction;
use warden_core::{
    Entity, EntityId, EntityKey, Error as CoreError, ForeignId, ObjectKind, Result as CoreResult,
};
use warden_engine::{Guard, MetaTask, NotifyTask, Task, TaskContext, TaskGraph};

use crate::reconcile::{match_records, remote_call, tolerate_missing};

/// Desired controller member set of one security group, sorted for
/// comparison.
async fn desired_members(tx: &mut StoreTransaction, group: EntityId) -> CoreResult<Vec<ForeignId>> {
    let mut members = Vec::new();
    for versioned in tx.list(ObjectKind::GroupMember).await {
        let member = SecurityGroupMember::try_from(versioned.entity)?;
        if member.group_id == group {
            members.push(member.foreign_id);
        }
    }
    members.sort();
    Ok(members)
}

/// Conform pass diffing a connector's security groups against the
/// controller's network groups.
pub struct NetworkGroupConform {
    connector: EntityId,
}

impl NetworkGroupConform {
    /// Creates the pass over one connector's security groups.
    #[must_use]
    pub fn new(connector: EntityId) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl MetaTask for NetworkGroupConform {
    fn name(&self) -> String {
        format!(
            "conform network groups of {}",
            EntityKey::new(ObjectKind::Connector, self.connector)
        )
    }

    async fn expand(&self, ctx: &TaskContext) -> CoreResult<TaskGraph> {
        let key = EntityKey::new(ObjectKind::Connector, self.connector);
        let versioned = ctx.store.load(key).await.ok_or(CoreError::NotFound(key))?;
        let connector = VirtualizationConnector::try_from(versioned.entity)?;

        let mut groups = Vec::new();
        for versioned in ctx.store.list(ObjectKind::SecurityGroup).await {
            let group = SecurityGroup::try_from(versioned.entity)?;
            if group.connector_id == self.connector {
                groups.push(group);
            }
        }
        let mut membership: HashMap<EntityId, Vec<ForeignId>> = HashMap::new();
        for versioned in ctx.store.list(ObjectKind::GroupMember).await {
            let member = SecurityGroupMember::try_from(versioned.entity)?;
            membership
                .entry(member.group_id)
                .or_default()
                .push(member.foreign_id);
        }

        let api = ctx.apis.controller_api(&connector).await?;
        let remote = remote_call(
            "controller",
            "list network groups",
            ctx.remote_timeout,
            api.list_network_groups(),
        )
        .await?;

        let outcome = match_records(
            groups,
            remote,
            |group| group.network_group_id.clone(),
            |remote| remote.id.clone(),
        );

        let mut graph = TaskGraph::new();
        for group in outcome.local_only {
            graph.add_task(Arc::new(NetworkGroupTask::new(
                self.connector,
                NetworkGroupAction::Push { group: group.id },
            )));
        }
        for (group, remote) in outcome.matched {
            let mut desired = membership.remove(&group.id).unwrap_or_default();
            desired.sort();
            let mut actual = remote.members;
            actual.sort();
            if group.name != remote.name || desired != actual {
                graph.add_task(Arc::new(NetworkGroupTask::new(
                    self.connector,
                    NetworkGroupAction::Update { group: group.id },
                )));
            }
        }
        for remote in outcome.remote_only {
            graph.add_task(Arc::new(NetworkGroupTask::new(
                self.connector,
                NetworkGroupAction::Delete { group: remote.id },
            )));
        }

        if !graph.is_empty() {
            graph.append_task(
                Arc::new(NotifyTask::new(format!(
                    "network groups conformed for '{}'",
                    connector.name
                ))),
                Guard::OnCompletion,
            );
        }
        Ok(graph)
    }
}

/// One difference a network group conform pass found.
#[derive(Debug, Clone)]
pub enum NetworkGroupAction {
    /// Create or adopt the controller group of an unsynchronized security
    /// group and record its identifier locally.
    Push {
        /// Primary key of the security group to push.
        group: EntityId,
    },
    /// Replace the name and member set of a drifted controller group.
    Update {
        /// Primary key of the security group to push.
        group: EntityId,
    },
    /// Remove a controller group no security group points at.
    Delete {
        /// The controller's identifier for the orphaned group.
        group: ForeignId,
    },
}

/// Applies one [`NetworkGroupAction`] in a single store transaction.
pub struct NetworkGroupTask {
    connector: EntityId,
    action: NetworkGroupAction,
}

impl NetworkGroupTask {
    /// Creates the task for `action`.
    #[must_use]
    pub fn new(connector: EntityId, action: NetworkGroupAction) -> Self {
        Self { connector, action }
    }
}

#[async_trait]
impl Task for NetworkGroupTask {
    fn name(&self) -> String {
        match &self.action {
            NetworkGroupAction::Push { group } => format!(
                "push network group for {}",
                EntityKey::new(ObjectKind::SecurityGroup, *group)
            ),
            NetworkGroupAction::Update { group } => format!(
                "update network group of {}",
                EntityKey::new(ObjectKind::SecurityGroup, *group)
            ),
            NetworkGroupAction::Delete { group } => format!("delete network group {group}"),
        }
    }

    async fn execute(&self, ctx: &TaskContext) -> CoreResult<()> {
        let mut tx = StoreTransaction::begin(Arc::clone(&ctx.store));
        let connector_key = EntityKey::new(ObjectKind::Connector, self.connector);
        let connector =
            VirtualizationConnector::try_from(tx.load_required(connector_key).await?.entity)?;
        let api = ctx.apis.controller_api(&connector).await?;

        match &self.action {
            NetworkGroupAction::Push { group } => {
                let key = EntityKey::new(ObjectKind::SecurityGroup, *group);
                let mut record = SecurityGroup::try_from(tx.load_required(key).await?.entity)?;

                let listed = remote_call(
                    "controller",
                    "list network groups",
                    ctx.remote_timeout,
                    api.list_network_groups(),
                )
                .await?;
                if let Some(current) = &record.network_group_id {
                    // A recorded id only counts if the controller still knows it.
                    if listed.iter().any(|candidate| &candidate.id == current) {
                        debug!(group = %key, "already pushed, nothing to do");
                        return Ok(());
                    }
                    debug!(
                        group = %key,
                        network_group = %current,
                        "recorded group is gone, replacing it"
                    );
                }
                let members = desired_members(&mut tx, record.id).await?;

                // A crashed earlier pass may have created the controller
                // group without committing its identifier. Adopt by name
                // before creating a duplicate.
                let adopted = listed.into_iter().find(|candidate| candidate.name == record.name);
                let target = match adopted {
                    Some(existing) => {
                        debug!(group = %existing.id, "adopting existing network group");
                        let mut actual = existing.members.clone();
                        actual.sort();
                        if actual != members {
                            remote_call(
                                "controller",
                                "update network group",
                                ctx.remote_timeout,
                                api.update_network_group(&existing.id, &record.name, &members),
                            )
                            .await?;
                        }
                        existing
                    }
                    None => {
                        remote_call(
                            "controller",
                            "create network group",
                            ctx.remote_timeout,
                            api.create_network_group(&record.name, &members),
                        )
                        .await?
                    }
                };

                record.network_group_id = Some(target.id);
                tx.put(Entity::Group(record));
                tx.commit().await
            }
            NetworkGroupAction::Update { group } => {
                let key = EntityKey::new(ObjectKind::SecurityGroup, *group);
                let record = SecurityGroup::try_from(tx.load_required(key).await?.entity)?;
                let Some(remote_id) = record.network_group_id.clone() else {
                    return Err(CoreError::Conflict(format!(
                        "{key} no longer carries a network group id"
                    )));
                };
                let members = desired_members(&mut tx, record.id).await?;
                remote_call(
                    "controller",
                    "update network group",
                    ctx.remote_timeout,
                    api.update_network_group(&remote_id, &record.name, &members),
                )
                .await?;
                tx.commit().await
            }
            NetworkGroupAction::Delete { group } => {
                tolerate_missing(
                    remote_call(
                        "controller",
                        "delete network group",
                        ctx.remote_timeout,
                        api.delete_network_group(group),
                    )
                    .await,
                )?;
                tx.commit().await
            }
        }
    }
}
