//! Mock remote systems for testing conform passes.
//!
//! Allows seeding canned device, domain, policy, network-group, and pod
//! inventories, enabling end-to-end testing of conform workflows without
//! real appliances, managers, or controllers.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::entities::{ManagerConnector, VirtualizationConnector};
use crate::refs::ForeignId;
use crate::remote::{
    ApiFactory, ControllerApi, ManagerApi, OrchestratorApi, RemoteDevice, RemoteDomain,
    RemoteNetworkGroup, RemotePod, RemotePolicy,
};
use crate::sync::IgnoreLock as _;
use crate::{Error, Result};

/// Call history storage type
type CallLog = Arc<Mutex<Vec<String>>>;

/// Mock appliance manager backed by in-memory inventories.
///
/// Registrations mutate the shared device list, so assertions can observe
/// what a conform pass did. Operations on unknown identifiers report
/// [`Error::RemoteMissing`] like a real manager would.
#[derive(Clone)]
pub struct MockManager {
    /// Devices currently registered
    devices: Arc<Mutex<Vec<RemoteDevice>>>,
    /// Policy domains the manager owns
    domains: Arc<Mutex<Vec<RemoteDomain>>>,
    /// Policies across all domains
    policies: Arc<Mutex<Vec<RemotePolicy>>>,
    /// Source of assigned device identifiers
    next_id: Arc<AtomicU64>,
    /// Call history for verification
    calls: CallLog,
    /// Whether calls currently fail with a remote error
    offline: Arc<AtomicBool>,
}

impl MockManager {
    /// Create an empty mock manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: Arc::new(Mutex::new(Vec::new())),
            domains: Arc::new(Mutex::new(Vec::new())),
            policies: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            calls: Arc::new(Mutex::new(Vec::new())),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seed a device registration.
    #[must_use]
    pub fn with_device(self, device: RemoteDevice) -> Self {
        {
            let mut devices = self.devices.lock_ignore_poison();
            devices.push(device);
        }
        self
    }

    /// Seed a policy domain.
    #[must_use]
    pub fn with_domain(self, domain: RemoteDomain) -> Self {
        {
            let mut domains = self.domains.lock_ignore_poison();
            domains.push(domain);
        }
        self
    }

    /// Seed a policy.
    #[must_use]
    pub fn with_policy(self, policy: RemotePolicy) -> Self {
        {
            let mut policies = self.policies.lock_ignore_poison();
            policies.push(policy);
        }
        self
    }

    /// Snapshot of the registered devices.
    #[must_use]
    pub fn devices(&self) -> Vec<RemoteDevice> {
        self.devices.lock_ignore_poison().clone()
    }

    /// Snapshot of the call history.
    #[must_use]
    pub fn call_history(&self) -> Vec<String> {
        self.calls.lock_ignore_poison().clone()
    }

    /// Number of calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock_ignore_poison().len()
    }

    /// Make every subsequent call fail with a retryable remote error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn record(&self, call: impl Into<String>) {
        let mut calls = self.calls.lock_ignore_poison();
        calls.push(call.into());
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Remote {
                system: "manager".to_owned(),
                message: "connection refused".to_owned(),
            });
        }
        Ok(())
    }

    fn missing(id: &ForeignId) -> Error {
        Error::RemoteMissing {
            system: "manager".to_owned(),
            id: id.to_string(),
        }
    }
}

impl Default for MockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagerApi for MockManager {
    async fn list_devices(&self) -> Result<Vec<RemoteDevice>> {
        self.ensure_online()?;
        self.record("list devices");
        Ok(self.devices())
    }

    async fn register_device(&self, name: &str, ip: &str) -> Result<RemoteDevice> {
        self.ensure_online()?;
        self.record(format!("register device {name}"));
        let device = RemoteDevice {
            id: ForeignId::new(format!("dev-{}", self.next_id.fetch_add(1, Ordering::SeqCst))),
            name: name.to_owned(),
            ip: ip.to_owned(),
        };
        {
            let mut devices = self.devices.lock_ignore_poison();
            devices.push(device.clone());
        }
        Ok(device)
    }

    async fn update_device(&self, id: &ForeignId, name: &str, ip: &str) -> Result<()> {
        self.ensure_online()?;
        self.record(format!("update device {id}"));
        let mut devices = self.devices.lock_ignore_poison();
        match devices.iter_mut().find(|device| device.id == *id) {
            Some(device) => {
                device.name = name.to_owned();
                device.ip = ip.to_owned();
                Ok(())
            }
            None => Err(Self::missing(id)),
        }
    }

    async fn unregister_device(&self, id: &ForeignId) -> Result<()> {
        self.ensure_online()?;
        self.record(format!("unregister device {id}"));
        let mut devices = self.devices.lock_ignore_poison();
        match devices.iter().position(|device| device.id == *id) {
            Some(index) => {
                devices.remove(index);
                Ok(())
            }
            None => Err(Self::missing(id)),
        }
    }

    async fn list_domains(&self) -> Result<Vec<RemoteDomain>> {
        self.ensure_online()?;
        self.record("list domains");
        Ok(self.domains.lock_ignore_poison().clone())
    }

    async fn list_policies(&self, domain: &ForeignId) -> Result<Vec<RemotePolicy>> {
        self.ensure_online()?;
        self.record(format!("list policies {domain}"));
        let policies = self.policies.lock_ignore_poison();
        Ok(policies
            .iter()
            .filter(|policy| policy.domain_id == *domain)
            .cloned()
            .collect())
    }
}

/// Mock SDN controller backed by an in-memory network-group list.
#[derive(Clone)]
pub struct MockController {
    /// Network groups on the controller
    groups: Arc<Mutex<Vec<RemoteNetworkGroup>>>,
    /// Source of assigned group identifiers
    next_id: Arc<AtomicU64>,
    /// Call history for verification
    calls: CallLog,
    /// Whether calls currently fail with a remote error
    offline: Arc<AtomicBool>,
}

impl MockController {
    /// Create an empty mock controller.
    #[must_use]
    pub fn new() -> Self {
        Self {
            groups: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            calls: Arc::new(Mutex::new(Vec::new())),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Seed a network group.
    #[must_use]
    pub fn with_group(self, group: RemoteNetworkGroup) -> Self {
        {
            let mut groups = self.groups.lock_ignore_poison();
            groups.push(group);
        }
        self
    }

    /// Snapshot of the controller's network groups.
    #[must_use]
    pub fn groups(&self) -> Vec<RemoteNetworkGroup> {
        self.groups.lock_ignore_poison().clone()
    }

    /// Snapshot of the call history.
    #[must_use]
    pub fn call_history(&self) -> Vec<String> {
        self.calls.lock_ignore_poison().clone()
    }

    /// Make every subsequent call fail with a retryable remote error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn record(&self, call: impl Into<String>) {
        let mut calls = self.calls.lock_ignore_poison();
        calls.push(call.into());
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Remote {
                system: "controller".to_owned(),
                message: "connection refused".to_owned(),
            });
        }
        Ok(())
    }

    fn missing(id: &ForeignId) -> Error {
        Error::RemoteMissing {
            system: "controller".to_owned(),
            id: id.to_string(),
        }
    }
}

impl Default for MockController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControllerApi for MockController {
    async fn list_network_groups(&self) -> Result<Vec<RemoteNetworkGroup>> {
        self.ensure_online()?;
        self.record("list network groups");
        Ok(self.groups())
    }

    async fn create_network_group(
        &self,
        name: &str,
        members: &[ForeignId],
    ) -> Result<RemoteNetworkGroup> {
        self.ensure_online()?;
        self.record(format!("create network group {name}"));
        let group = RemoteNetworkGroup {
            id: ForeignId::new(format!("ng-{}", self.next_id.fetch_add(1, Ordering::SeqCst))),
            name: name.to_owned(),
            members: members.to_vec(),
        };
        {
            let mut groups = self.groups.lock_ignore_poison();
            groups.push(group.clone());
        }
        Ok(group)
    }

    async fn update_network_group(
        &self,
        id: &ForeignId,
        name: &str,
        members: &[ForeignId],
    ) -> Result<()> {
        self.ensure_online()?;
        self.record(format!("update network group {id}"));
        let mut groups = self.groups.lock_ignore_poison();
        match groups.iter_mut().find(|group| group.id == *id) {
            Some(group) => {
                group.name = name.to_owned();
                group.members = members.to_vec();
                Ok(())
            }
            None => Err(Self::missing(id)),
        }
    }

    async fn delete_network_group(&self, id: &ForeignId) -> Result<()> {
        self.ensure_online()?;
        self.record(format!("delete network group {id}"));
        let mut groups = self.groups.lock_ignore_poison();
        match groups.iter().position(|group| group.id == *id) {
            Some(index) => {
                groups.remove(index);
                Ok(())
            }
            None => Err(Self::missing(id)),
        }
    }
}

/// Mock container orchestrator with a fixed pod population.
#[derive(Clone, Default)]
pub struct MockOrchestrator {
    /// Pods the orchestrator reports
    pods: Arc<Mutex<Vec<RemotePod>>>,
    /// Call history for verification
    calls: CallLog,
}

impl MockOrchestrator {
    /// Create an empty mock orchestrator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pod.
    #[must_use]
    pub fn with_pod(self, pod: RemotePod) -> Self {
        {
            let mut pods = self.pods.lock_ignore_poison();
            pods.push(pod);
        }
        self
    }

    /// Snapshot of the call history.
    #[must_use]
    pub fn call_history(&self) -> Vec<String> {
        self.calls.lock_ignore_poison().clone()
    }

    fn record(&self, call: impl Into<String>) {
        let mut calls = self.calls.lock_ignore_poison();
        calls.push(call.into());
    }
}

#[async_trait]
impl OrchestratorApi for MockOrchestrator {
    async fn list_pods(&self, label: &str) -> Result<Vec<RemotePod>> {
        self.record(format!("list pods {label}"));
        let pods = self.pods.lock_ignore_poison();
        Ok(pods
            .iter()
            .filter(|pod| pod.labels.iter().any(|candidate| candidate == label))
            .cloned()
            .collect())
    }
}

/// [`ApiFactory`] handing out the mock systems above.
///
/// Every connector record resolves to the same shared mock instance, so a
/// test seeds one manager, controller, and orchestrator and watches all
/// passes hit them.
#[derive(Clone, Default)]
pub struct MockRemotes {
    /// The shared mock manager
    manager: MockManager,
    /// The shared mock controller
    controller: MockController,
    /// The shared mock orchestrator
    orchestrator: MockOrchestrator,
}

impl MockRemotes {
    /// Create a factory over empty mock systems.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory over pre-seeded mock systems.
    #[must_use]
    pub fn with_systems(
        manager: MockManager,
        controller: MockController,
        orchestrator: MockOrchestrator,
    ) -> Self {
        Self {
            manager,
            controller,
            orchestrator,
        }
    }

    /// Handle on the shared mock manager.
    #[must_use]
    pub fn manager(&self) -> MockManager {
        self.manager.clone()
    }

    /// Handle on the shared mock controller.
    #[must_use]
    pub fn controller(&self) -> MockController {
        self.controller.clone()
    }

    /// Handle on the shared mock orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> MockOrchestrator {
        self.orchestrator.clone()
    }
}

#[async_trait]
impl ApiFactory for MockRemotes {
    async fn manager_api(&self, _manager: &ManagerConnector) -> Result<Arc<dyn ManagerApi>> {
        Ok(Arc::new(self.manager.clone()))
    }

    async fn controller_api(
        &self,
        _connector: &VirtualizationConnector,
    ) -> Result<Arc<dyn ControllerApi>> {
        Ok(Arc::new(self.controller.clone()))
    }

    async fn orchestrator_api(
        &self,
        _connector: &VirtualizationConnector,
    ) -> Result<Arc<dyn OrchestratorApi>> {
        Ok(Arc::new(self.orchestrator.clone()))
    }
}
