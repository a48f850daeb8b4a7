//! End-to-end conform scenarios through the job engine.
//!
//! Each scenario submits real conform passes against the in-memory store
//! and mock remote systems, then checks that both sides converged and
//! that a repeated pass leaves everything untouched.

#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use warden_conform::{BrokerConfig, ConformOrchestrator};
use warden_core::entities::{
    ApplianceInstance, Domain, ManagerConnector, Policy, VirtualizationConnector,
};
use warden_core::remote::{RemoteDevice, RemoteDomain, RemotePolicy};
use warden_core::{
    Entity, EntityId, EntityKey, ForeignId, MemoryStore, MockController, MockManager,
    MockOrchestrator, MockRemotes, ObjectKind, ObjectRef, Result as CoreResult, Store,
};
use warden_engine::{JobEvent, JobStatus, LockRequest, Task, TaskContext, TaskGraph};

fn manager_entity(id: u64, name: &str) -> Entity {
    Entity::Manager(ManagerConnector {
        id: EntityId(id),
        name: name.to_owned(),
        endpoint: format!("https://{name}.example/api"),
    })
}

fn connector_entity(id: u64, name: &str) -> Entity {
    Entity::Connector(VirtualizationConnector {
        id: EntityId(id),
        name: name.to_owned(),
        provider_endpoint: format!("https://{name}.example/sdk"),
        controller_endpoint: format!("https://{name}-nsx.example/api"),
    })
}

fn remotes_with_manager(manager: MockManager) -> MockRemotes {
    MockRemotes::with_systems(manager, MockController::new(), MockOrchestrator::new())
}

fn orchestrator_over(
    config: BrokerConfig,
    store: &Arc<MemoryStore>,
    remotes: MockRemotes,
) -> ConformOrchestrator {
    ConformOrchestrator::new(
        config,
        Arc::clone(store) as Arc<dyn Store>,
        Arc::new(remotes),
    )
}

/// Snapshot of every record's version, keyed by primary key.
async fn versions(store: &Arc<MemoryStore>) -> HashMap<EntityKey, u64> {
    let mut index = HashMap::new();
    for kind in [
        ObjectKind::Manager,
        ObjectKind::Connector,
        ObjectKind::Appliance,
        ObjectKind::SecurityGroup,
        ObjectKind::GroupMember,
        ObjectKind::Domain,
        ObjectKind::Policy,
    ] {
        for versioned in store.list(kind).await {
            index.insert(versioned.entity.key(), versioned.version);
        }
    }
    index
}

/// Local policies keyed by their manager-side identifier.
async fn policies_by_foreign_id(store: &Arc<MemoryStore>) -> HashMap<ForeignId, Policy> {
    let mut index = HashMap::new();
    for versioned in store.list(ObjectKind::Policy).await {
        if let Entity::Policy(policy) = versioned.entity {
            index.insert(policy.foreign_id.clone(), policy);
        }
    }
    index
}

/// Task that keeps its job open long enough for another submission to
/// collide with its locks.
struct Holder {
    millis: u64,
}

#[async_trait::async_trait]
impl Task for Holder {
    fn name(&self) -> String {
        "manual maintenance".to_owned()
    }

    async fn execute(&self, _ctx: &TaskContext) -> CoreResult<()> {
        sleep(Duration::from_millis(self.millis)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_policy_drift_converges_and_stays_quiet() {
    common::init_tracing();
    let store = MemoryStore::new();
    store
        .seed(vec![
            manager_entity(1, "fmc"),
            Entity::Domain(Domain {
                id: EntityId(10),
                manager_id: EntityId(1),
                foreign_id: ForeignId::new("dom-1"),
                name: "Global".to_owned(),
            }),
            Entity::Policy(Policy {
                id: EntityId(11),
                domain_id: EntityId(10),
                foreign_id: ForeignId::new("pol-1"),
                name: "allow-ssh".to_owned(),
            }),
        ])
        .await;
    let manager = MockManager::new()
        .with_domain(RemoteDomain {
            id: ForeignId::new("dom-1"),
            name: "Global".to_owned(),
        })
        .with_policy(RemotePolicy {
            id: ForeignId::new("pol-1"),
            domain_id: ForeignId::new("dom-1"),
            name: "allow-ssh-mgmt".to_owned(),
        })
        .with_policy(RemotePolicy {
            id: ForeignId::new("pol-2"),
            domain_id: ForeignId::new("dom-1"),
            name: "deny-all".to_owned(),
        });
    let orchestrator =
        orchestrator_over(BrokerConfig::default(), &store, remotes_with_manager(manager));

    let job = orchestrator.mirror_domains(EntityId(1)).await.unwrap();
    assert_eq!(orchestrator.wait(job).await.unwrap(), JobStatus::Succeeded);

    // The renamed policy was pulled and the missing one created under
    // the existing domain.
    let policies = policies_by_foreign_id(&store).await;
    assert_eq!(policies.len(), 2);
    assert_eq!(policies[&ForeignId::new("pol-1")].name, "allow-ssh-mgmt");
    assert_eq!(policies[&ForeignId::new("pol-1")].id, EntityId(11));
    assert_eq!(policies[&ForeignId::new("pol-2")].name, "deny-all");
    assert_eq!(policies[&ForeignId::new("pol-2")].domain_id, EntityId(10));

    // A converged inventory plans nothing; unchanged record versions
    // prove the second pass wrote nothing.
    let before = versions(&store).await;
    let job = orchestrator.mirror_domains(EntityId(1)).await.unwrap();
    assert_eq!(orchestrator.wait(job).await.unwrap(), JobStatus::Succeeded);
    assert_eq!(versions(&store).await, before);
}

#[tokio::test]
async fn test_same_named_policies_converge_across_domains() {
    common::init_tracing();
    let store = MemoryStore::new();
    store
        .seed(vec![
            manager_entity(1, "fmc"),
            Entity::Domain(Domain {
                id: EntityId(10),
                manager_id: EntityId(1),
                foreign_id: ForeignId::new("dom-1"),
                name: "Global".to_owned(),
            }),
            Entity::Domain(Domain {
                id: EntityId(12),
                manager_id: EntityId(1),
                foreign_id: ForeignId::new("dom-2"),
                name: "Edge".to_owned(),
            }),
        ])
        .await;
    let manager = MockManager::new()
        .with_domain(RemoteDomain {
            id: ForeignId::new("dom-1"),
            name: "Global".to_owned(),
        })
        .with_domain(RemoteDomain {
            id: ForeignId::new("dom-2"),
            name: "Edge".to_owned(),
        })
        .with_policy(RemotePolicy {
            id: ForeignId::new("pol-1"),
            domain_id: ForeignId::new("dom-1"),
            name: "default".to_owned(),
        })
        .with_policy(RemotePolicy {
            id: ForeignId::new("pol-2"),
            domain_id: ForeignId::new("dom-2"),
            name: "default".to_owned(),
        });
    let orchestrator =
        orchestrator_over(BrokerConfig::default(), &store, remotes_with_manager(manager));

    let job = orchestrator.mirror_domains(EntityId(1)).await.unwrap();
    assert_eq!(orchestrator.wait(job).await.unwrap(), JobStatus::Succeeded);

    // One "default" policy per domain; neither mirror stole the other's
    // record.
    let policies = policies_by_foreign_id(&store).await;
    assert_eq!(policies.len(), 2);
    assert_eq!(policies[&ForeignId::new("pol-1")].domain_id, EntityId(10));
    assert_eq!(policies[&ForeignId::new("pol-2")].domain_id, EntityId(12));

    let before = versions(&store).await;
    let job = orchestrator.mirror_domains(EntityId(1)).await.unwrap();
    assert_eq!(orchestrator.wait(job).await.unwrap(), JobStatus::Succeeded);
    assert_eq!(versions(&store).await, before);
}

#[tokio::test]
async fn test_domain_retirement_deletes_policies_first() {
    common::init_tracing();
    let store = MemoryStore::new();
    store
        .seed(vec![
            manager_entity(1, "fmc"),
            Entity::Domain(Domain {
                id: EntityId(10),
                manager_id: EntityId(1),
                foreign_id: ForeignId::new("dom-1"),
                name: "Global".to_owned(),
            }),
            Entity::Policy(Policy {
                id: EntityId(11),
                domain_id: EntityId(10),
                foreign_id: ForeignId::new("pol-1"),
                name: "allow-ssh".to_owned(),
            }),
            Entity::Policy(Policy {
                id: EntityId(12),
                domain_id: EntityId(10),
                foreign_id: ForeignId::new("pol-2"),
                name: "deny-all".to_owned(),
            }),
        ])
        .await;

    // The manager no longer knows the domain; the local mirror retires.
    let (orchestrator, mut events) = ConformOrchestrator::with_events(
        BrokerConfig::default(),
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(remotes_with_manager(MockManager::new())),
    );

    let job = orchestrator.mirror_domains(EntityId(1)).await.unwrap();
    assert_eq!(orchestrator.wait(job).await.unwrap(), JobStatus::Succeeded);

    assert!(store.list(ObjectKind::Domain).await.is_empty());
    assert!(store.list(ObjectKind::Policy).await.is_empty());

    // Both policy deletes finished before the domain delete began.
    let mut finished = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let JobEvent::TaskFinished { task, .. } = event {
            finished.push(task);
        }
    }
    let position = |name: &str| {
        finished
            .iter()
            .position(|task| task == name)
            .unwrap_or_else(|| panic!("no finished task named '{name}' in {finished:?}"))
    };
    assert!(position("delete Policy#11") < position("delete Domain#10"));
    assert!(position("delete Policy#12") < position("delete Domain#10"));
}

#[tokio::test]
async fn test_device_conform_applies_register_update_and_unregister() {
    common::init_tracing();
    let store = MemoryStore::new();
    store
        .seed(vec![
            manager_entity(1, "fmc"),
            Entity::Appliance(ApplianceInstance {
                id: EntityId(4),
                name: "edge-a".to_owned(),
                connector_id: EntityId(2),
                manager_id: EntityId(1),
                ip: "10.0.0.4".to_owned(),
                device_id: None,
            }),
            Entity::Appliance(ApplianceInstance {
                id: EntityId(5),
                name: "edge-b".to_owned(),
                connector_id: EntityId(2),
                manager_id: EntityId(1),
                ip: "10.0.0.99".to_owned(),
                device_id: Some(ForeignId::new("dev-100")),
            }),
        ])
        .await;
    let manager = MockManager::new()
        .with_device(RemoteDevice {
            id: ForeignId::new("dev-100"),
            name: "edge-b".to_owned(),
            ip: "10.0.0.5".to_owned(),
        })
        .with_device(RemoteDevice {
            id: ForeignId::new("dev-900"),
            name: "retired".to_owned(),
            ip: "10.9.9.9".to_owned(),
        });
    let orchestrator = orchestrator_over(
        BrokerConfig::default(),
        &store,
        remotes_with_manager(manager.clone()),
    );

    let job = orchestrator.conform_devices(EntityId(1)).await.unwrap();
    assert_eq!(orchestrator.wait(job).await.unwrap(), JobStatus::Succeeded);

    let devices: HashMap<ForeignId, RemoteDevice> = manager
        .devices()
        .into_iter()
        .map(|device| (device.id.clone(), device))
        .collect();
    assert_eq!(devices.len(), 2);
    assert!(!devices.contains_key(&ForeignId::new("dev-900")));
    assert_eq!(devices[&ForeignId::new("dev-100")].ip, "10.0.0.99");

    // The fresh registration's id was committed onto the appliance.
    let registered = store
        .load(EntityKey::new(ObjectKind::Appliance, EntityId(4)))
        .await
        .map(|versioned| ApplianceInstance::try_from(versioned.entity).unwrap())
        .unwrap();
    let device_id = registered.device_id.unwrap();
    assert_eq!(devices[&device_id].name, "edge-a");
    assert_eq!(devices[&device_id].ip, "10.0.0.4");
}

#[tokio::test]
async fn test_contended_manager_is_reported_retryable() {
    common::init_tracing();
    let mut config = BrokerConfig::default();
    config.engine.lock_wait_secs = 0;

    let store = MemoryStore::new();
    store.seed(vec![manager_entity(1, "fmc")]).await;
    let orchestrator = orchestrator_over(config, &store, MockRemotes::new());

    // A manual job parks on the manager's lock.
    let mut graph = TaskGraph::new();
    graph.add_task(Arc::new(Holder { millis: 300 }));
    let manual = orchestrator
        .engine()
        .submit(
            "manual maintenance",
            graph,
            &[LockRequest::exclusive(ObjectRef::new(
                ObjectKind::Manager,
                EntityId(1),
                "fmc",
            ))],
        )
        .await
        .unwrap();

    let error = orchestrator.conform_devices(EntityId(1)).await.unwrap_err();
    assert!(error.is_retryable());
    assert!(error.to_string().contains("Manager#1"));

    // Once the manual job drains, the same submission goes through.
    assert_eq!(orchestrator.wait(manual).await.unwrap(), JobStatus::Succeeded);
    let job = orchestrator.conform_devices(EntityId(1)).await.unwrap();
    assert_eq!(orchestrator.wait(job).await.unwrap(), JobStatus::Succeeded);
}

#[tokio::test]
async fn test_sweep_waits_for_a_manual_manager_job() {
    common::init_tracing();
    let store = MemoryStore::new();
    store
        .seed(vec![
            connector_entity(1, "east-dc"),
            manager_entity(2, "fmc"),
            Entity::Appliance(ApplianceInstance {
                id: EntityId(3),
                name: "edge-fw".to_owned(),
                connector_id: EntityId(1),
                manager_id: EntityId(2),
                ip: "10.0.0.4".to_owned(),
                device_id: None,
            }),
        ])
        .await;
    let manager = MockManager::new();
    let orchestrator = orchestrator_over(
        BrokerConfig::default(),
        &store,
        remotes_with_manager(manager.clone()),
    );

    // The sweep's lock set includes the manager serving the connector's
    // appliance, so it must wait out this job even though the connector
    // itself is free.
    let mut graph = TaskGraph::new();
    graph.add_task(Arc::new(Holder { millis: 200 }));
    let manual = orchestrator
        .engine()
        .submit(
            "manual maintenance",
            graph,
            &[LockRequest::exclusive(ObjectRef::new(
                ObjectKind::Manager,
                EntityId(2),
                "fmc",
            ))],
        )
        .await
        .unwrap();

    let sweep = orchestrator.sweep_connector(EntityId(1)).await.unwrap();
    assert_eq!(orchestrator.wait(manual).await.unwrap(), JobStatus::Succeeded);
    assert_eq!(orchestrator.wait(sweep).await.unwrap(), JobStatus::Succeeded);

    assert_eq!(manager.devices().len(), 1);
}
