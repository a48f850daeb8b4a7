//! Records and client contracts for the external systems the broker
//! synchronizes with.
//!
//! Concrete wire clients live outside this crate; the broker only needs the
//! narrow list/get/create/update/delete surface below. Tests substitute
//! in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::Result;
use crate::entities::{ManagerConnector, VirtualizationConnector};
use crate::refs::ForeignId;

/// A device registration as listed by an appliance manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDevice {
    /// The manager's identifier for the device.
    pub id: ForeignId,
    /// Device name on the manager.
    pub name: String,
    /// Management address the manager has for the device.
    pub ip: String,
}

/// A policy domain as listed by an appliance manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDomain {
    /// The manager's identifier for the domain.
    pub id: ForeignId,
    /// Domain name on the manager.
    pub name: String,
}

/// A policy as listed by an appliance manager, scoped to one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePolicy {
    /// The manager's identifier for the policy.
    pub id: ForeignId,
    /// The manager's identifier for the owning domain.
    pub domain_id: ForeignId,
    /// Policy name on the manager.
    pub name: String,
}

/// A network group as known to an SDN controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNetworkGroup {
    /// The controller's identifier for the group.
    pub id: ForeignId,
    /// Group name on the controller.
    pub name: String,
    /// Workload identifiers the controller has in the group.
    pub members: Vec<ForeignId>,
}

/// A pod as reported by the container orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePod {
    /// The orchestrator's identifier for the pod.
    pub id: ForeignId,
    /// Pod name.
    pub name: String,
    /// Labels attached to the pod.
    pub labels: Vec<String>,
}

/// Client surface of an appliance manager.
///
/// Calls either return the observed record set or fail with
/// [`Error::Remote`](crate::Error::Remote); an operation targeting an
/// identifier the manager no longer knows fails with
/// [`Error::RemoteMissing`](crate::Error::RemoteMissing).
#[async_trait]
pub trait ManagerApi: Send + Sync {
    /// Lists every device registered on the manager.
    ///
    /// # Errors
    /// Returns an error if the manager cannot be reached.
    async fn list_devices(&self) -> Result<Vec<RemoteDevice>>;

    /// Registers a device and returns the record with its assigned id.
    ///
    /// # Errors
    /// Returns an error if the manager rejects the registration.
    async fn register_device(&self, name: &str, ip: &str) -> Result<RemoteDevice>;

    /// Updates an existing device registration.
    ///
    /// # Errors
    /// Returns an error if the device is unknown or the call fails.
    async fn update_device(&self, id: &ForeignId, name: &str, ip: &str) -> Result<()>;

    /// Removes a device registration.
    ///
    /// # Errors
    /// Returns an error if the device is unknown or the call fails.
    async fn unregister_device(&self, id: &ForeignId) -> Result<()>;

    /// Lists every policy domain the manager owns.
    ///
    /// # Errors
    /// Returns an error if the manager cannot be reached.
    async fn list_domains(&self) -> Result<Vec<RemoteDomain>>;

    /// Lists the policies of one domain.
    ///
    /// # Errors
    /// Returns an error if the domain is unknown or the call fails.
    async fn list_policies(&self, domain: &ForeignId) -> Result<Vec<RemotePolicy>>;
}

/// Client surface of an SDN controller.
#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// Lists every network group on the controller.
    ///
    /// # Errors
    /// Returns an error if the controller cannot be reached.
    async fn list_network_groups(&self) -> Result<Vec<RemoteNetworkGroup>>;

    /// Creates a network group and returns the record with its assigned id.
    ///
    /// # Errors
    /// Returns an error if the controller rejects the creation.
    async fn create_network_group(
        &self,
        name: &str,
        members: &[ForeignId],
    ) -> Result<RemoteNetworkGroup>;

    /// Replaces the name and member set of an existing network group.
    ///
    /// # Errors
    /// Returns an error if the group is unknown or the call fails.
    async fn update_network_group(
        &self,
        id: &ForeignId,
        name: &str,
        members: &[ForeignId],
    ) -> Result<()>;

    /// Removes a network group.
    ///
    /// # Errors
    /// Returns an error if the group is unknown or the call fails.
    async fn delete_network_group(&self, id: &ForeignId) -> Result<()>;
}

/// Client surface of the container orchestrator.
#[async_trait]
pub trait OrchestratorApi: Send + Sync {
    /// Lists pods carrying the given label.
    ///
    /// # Errors
    /// Returns an error if the orchestrator cannot be reached.
    async fn list_pods(&self, label: &str) -> Result<Vec<RemotePod>>;
}

/// Creates scoped API connections for connector records.
///
/// Connections are owned by the calling task for the duration of one
/// operation; the factory is injected so tests substitute fakes.
#[async_trait]
pub trait ApiFactory: Send + Sync {
    /// Opens a connection to the given manager.
    ///
    /// # Errors
    /// Returns an error if a connection cannot be established.
    async fn manager_api(&self, manager: &ManagerConnector) -> Result<Arc<dyn ManagerApi>>;

    /// Opens a connection to the SDN controller of the given connector.
    ///
    /// # Errors
    /// Returns an error if a connection cannot be established.
    async fn controller_api(
        &self,
        connector: &VirtualizationConnector,
    ) -> Result<Arc<dyn ControllerApi>>;

    /// Opens a connection to the orchestrator of the given connector.
    ///
    /// # Errors
    /// Returns an error if a connection cannot be established.
    async fn orchestrator_api(
        &self,
        connector: &VirtualizationConnector,
    ) -> Result<Arc<dyn OrchestratorApi>>;
}
