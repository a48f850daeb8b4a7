//! Service layer turning conform requests into engine jobs.
//!
//! The orchestrator owns the engine and is the only place lock sets are
//! decided. Single-subject entry points take the narrowest grant that
//! covers their writes; the connector sweep composes every pass touching
//! the connector under one exclusive grant so a full cycle never
//! interleaves with another job over the same objects.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use warden_core::entities::{ApplianceInstance, SecurityGroup};
use warden_core::remote::ApiFactory;
use warden_core::{EntityId, EntityKey, Error as CoreError, ObjectKind, ObjectRef, Store};
use warden_engine::{
    Guard, JobEngine, JobEvent, JobId, JobStatus, JobSummary, LockRequest, TaskGraph,
};

use crate::config::BrokerConfig;
use crate::devices::DeviceConform;
use crate::domains::DomainMirror;
use crate::error::Result;
use crate::netgroups::NetworkGroupConform;
use crate::pods::PodMemberMirror;

/// Builds conform jobs and submits them to an owned [`JobEngine`].
///
/// Cloning is cheap; clones share the engine, the store, and the lock
/// registry.
#[derive(Clone)]
pub struct ConformOrchestrator {
    config: BrokerConfig,
    engine: Arc<JobEngine>,
    store: Arc<dyn Store>,
}

impl ConformOrchestrator {
    /// Creates an orchestrator with its own engine over the given store
    /// and remote-system factory.
    #[must_use]
    pub fn new(config: BrokerConfig, store: Arc<dyn Store>, apis: Arc<dyn ApiFactory>) -> Self {
        let engine = JobEngine::new(config.engine.clone(), Arc::clone(&store), apis);
        Self {
            config,
            engine,
            store,
        }
    }

    /// Like [`Self::new`], but also returns the engine's progress events.
    #[must_use]
    pub fn with_events(
        config: BrokerConfig,
        store: Arc<dyn Store>,
        apis: Arc<dyn ApiFactory>,
    ) -> (Self, UnboundedReceiver<JobEvent>) {
        let (engine, events) =
            JobEngine::with_events(config.engine.clone(), Arc::clone(&store), apis);
        (
            Self {
                config,
                engine,
                store,
            },
            events,
        )
    }

    /// The configuration this orchestrator runs under.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The engine driving submitted jobs.
    #[must_use]
    pub fn engine(&self) -> &Arc<JobEngine> {
        &self.engine
    }

    /// The store this orchestrator resolves subjects against.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Submits a job conforming device registrations for one manager.
    ///
    /// The job holds the manager exclusively so two passes cannot race
    /// on the same registrations.
    ///
    /// # Errors
    /// Returns an error when the manager is unknown or the submission is
    /// rejected; lock contention comes back retryable.
    pub async fn conform_devices(&self, manager: EntityId) -> Result<JobId> {
        let subject = self.reference(ObjectKind::Manager, manager).await?;
        let name = format!("device conform for '{}'", subject.name);

        let mut graph = TaskGraph::new();
        graph.add_meta(Arc::new(DeviceConform::new(manager)));

        let locks = [LockRequest::exclusive(subject)];
        Ok(self.engine.submit(name, graph, &locks).await?)
    }

    /// Submits a job mirroring one manager's domains and policies into
    /// the local store.
    ///
    /// # Errors
    /// Returns an error when the manager is unknown or the submission is
    /// rejected; lock contention comes back retryable.
    pub async fn mirror_domains(&self, manager: EntityId) -> Result<JobId> {
        let subject = self.reference(ObjectKind::Manager, manager).await?;
        let name = format!("domain mirror for '{}'", subject.name);

        let mut graph = TaskGraph::new();
        graph.add_meta(Arc::new(DomainMirror::new(manager)));

        let locks = [LockRequest::exclusive(subject)];
        Ok(self.engine.submit(name, graph, &locks).await?)
    }

    /// Submits a job pushing one connector's security groups to its
    /// controller.
    ///
    /// # Errors
    /// Returns an error when the connector is unknown or the submission
    /// is rejected; lock contention comes back retryable.
    pub async fn conform_network_groups(&self, connector: EntityId) -> Result<JobId> {
        let subject = self.reference(ObjectKind::Connector, connector).await?;
        let name = format!("network group conform for '{}'", subject.name);

        let mut graph = TaskGraph::new();
        graph.add_meta(Arc::new(NetworkGroupConform::new(connector)));

        let locks = [LockRequest::exclusive(subject)];
        Ok(self.engine.submit(name, graph, &locks).await?)
    }

    /// Submits a job mirroring orchestrator pods into one group's member
    /// records.
    ///
    /// The group is held exclusively and its connector shared: member
    /// writes never overlap a sweep of the connector, while unrelated
    /// groups still mirror in parallel.
    ///
    /// # Errors
    /// Returns an error when the group is unknown or the submission is
    /// rejected; lock contention comes back retryable.
    pub async fn mirror_pod_members(&self, group: EntityId) -> Result<JobId> {
        let key = EntityKey::new(ObjectKind::SecurityGroup, group);
        let versioned = self.store.load(key).await.ok_or(CoreError::NotFound(key))?;
        let subject = versioned.entity.object_ref();
        let record = SecurityGroup::try_from(versioned.entity)?;
        let connector = self
            .reference(ObjectKind::Connector, record.connector_id)
            .await?;
        let name = format!("pod member mirror for '{}'", subject.name);

        let mut graph = TaskGraph::new();
        graph.add_meta(Arc::new(PodMemberMirror::new(group)));

        let locks = [
            LockRequest::exclusive(subject),
            LockRequest::shared(connector),
        ];
        Ok(self.engine.submit(name, graph, &locks).await?)
    }

    /// Submits one full conform cycle for a connector.
    ///
    /// For every manager serving an appliance on the connector the cycle
    /// mirrors domains and then conforms devices. Every group on the
    /// connector has its pod members mirrored before the network group
    /// push consumes the member records. The connector and each involved
    /// manager stay exclusively held for the whole cycle.
    ///
    /// # Errors
    /// Returns an error when the connector is unknown or the submission
    /// is rejected; lock contention comes back retryable.
    pub async fn sweep_connector(&self, connector: EntityId) -> Result<JobId> {
        let subject = self.reference(ObjectKind::Connector, connector).await?;
        let name = format!("conform sweep for '{}'", subject.name);
        let mut locks = vec![LockRequest::exclusive(subject)];

        let mut graph = TaskGraph::new();

        let mut managers: Vec<EntityId> = Vec::new();
        for versioned in self.store.list(ObjectKind::Appliance).await {
            let instance = ApplianceInstance::try_from(versioned.entity)?;
            if instance.connector_id == connector && !managers.contains(&instance.manager_id) {
                managers.push(instance.manager_id);
            }
        }
        for manager in managers {
            let mirror = graph.add_meta(Arc::new(DomainMirror::new(manager)));
            let devices = graph.add_meta(Arc::new(DeviceConform::new(manager)));
            graph.add_edge(mirror, devices, Guard::OnSuccess);
            locks.push(LockRequest::exclusive(
                self.reference(ObjectKind::Manager, manager).await?,
            ));
        }

        // Member records feed the controller push, so every pod mirror
        // must settle first.
        let push = graph.add_meta(Arc::new(NetworkGroupConform::new(connector)));
        for versioned in self.store.list(ObjectKind::SecurityGroup).await {
            let group = SecurityGroup::try_from(versioned.entity)?;
            if group.connector_id != connector {
                continue;
            }
            let pods = graph.add_meta(Arc::new(PodMemberMirror::new(group.id)));
            graph.add_edge(pods, push, Guard::OnSuccess);
        }

        Ok(self.engine.submit(name, graph, &locks).await?)
    }

    /// Status of one submitted job.
    ///
    /// # Errors
    /// Returns an error for an unknown job id.
    pub async fn status(&self, job: JobId) -> Result<JobStatus> {
        Ok(self.engine.status(job).await?)
    }

    /// Waits until a job reaches a terminal status and returns it.
    ///
    /// # Errors
    /// Returns an error for an unknown job id.
    pub async fn wait(&self, job: JobId) -> Result<JobStatus> {
        Ok(self.engine.wait(job).await?)
    }

    /// Every accepted job, newest first.
    pub async fn jobs(&self) -> Vec<JobSummary> {
        self.engine.list().await
    }

    /// Stops intake and waits for outstanding jobs to drain.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    async fn reference(&self, kind: ObjectKind, id: EntityId) -> Result<ObjectRef> {
        let key = EntityKey::new(kind, id);
        let versioned = self.store.load(key).await.ok_or(CoreError::NotFound(key))?;
        Ok(versioned.entity.object_ref())
    }
}
