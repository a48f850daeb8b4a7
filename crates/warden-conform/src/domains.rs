//! Domain and policy mirror: manager-owned records pulled into the store.
//!
//! The manager is authoritative. Domains and their policies are mirrored
//! locally; a domain retired on the manager is retired locally only after
//! its mirrored policies are gone, so the store never holds a policy whose
//! domain record is missing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use warden_core::entities::{Domain, ManagerConnector, Policy};
use warden_core::store::StoreTransaction;
use warden_core::{
    Entity, EntityId, EntityKey, Error as CoreError, ForeignId, ObjectKind, Result as CoreResult,
};
use warden_engine::{Guard, MetaTask, NotifyTask, Task, TaskContext, TaskGraph};

use crate::reconcile::{match_records, remote_call};

/// Mirror pass diffing one manager's domains and policies against the
/// local copies.
pub struct DomainMirror {
    manager: EntityId,
}

impl DomainMirror {
    /// Creates the pass over one manager's domains.
    #[must_use]
    pub fn new(manager: EntityId) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MetaTask for DomainMirror {
    fn name(&self) -> String {
        format!(
            "mirror domains of {}",
            EntityKey::new(ObjectKind::Manager, self.manager)
        )
    }

    async fn expand(&self, ctx: &TaskContext) -> CoreResult<TaskGraph> {
        let key = EntityKey::new(ObjectKind::Manager, self.manager);
        let versioned = ctx.store.load(key).await.ok_or(CoreError::NotFound(key))?;
        let manager = ManagerConnector::try_from(versioned.entity)?;

        let mut domains = Vec::new();
        for versioned in ctx.store.list(ObjectKind::Domain).await {
            let domain = Domain::try_from(versioned.entity)?;
            if domain.manager_id == self.manager {
                domains.push(domain);
            }
        }
        let mut policies: HashMap<EntityId, Vec<Policy>> = HashMap::new();
        for versioned in ctx.store.list(ObjectKind::Policy).await {
            let policy = Policy::try_from(versioned.entity)?;
            policies.entry(policy.domain_id).or_default().push(policy);
        }

        let api = ctx.apis.manager_api(&manager).await?;
        let remote_domains = remote_call(
            "manager",
            "list domains",
            ctx.remote_timeout,
            api.list_domains(),
        )
        .await?;

        let outcome = match_records(
            domains,
            remote_domains,
            |domain| Some(domain.foreign_id.clone()),
            |remote| remote.id.clone(),
        );

        let mut graph = TaskGraph::new();

        for remote in outcome.remote_only {
            let create = graph.add_task(Arc::new(MirrorTask::new(
                self.manager,
                MirrorAction::CreateDomain {
                    domain: remote.id.clone(),
                },
            )));
            let listed = remote_call(
                "manager",
                "list policies",
                ctx.remote_timeout,
                api.list_policies(&remote.id),
            )
            .await?;
            for policy in listed {
                let node = graph.add_task(Arc::new(MirrorTask::new(
                    self.manager,
                    MirrorAction::CreatePolicy {
                        domain: remote.id.clone(),
                        policy: policy.id,
                    },
                )));
                graph.add_edge(create, node, Guard::OnSuccess);
            }
        }

        for (local, remote) in outcome.matched {
            if local.name != remote.name {
                graph.add_task(Arc::new(MirrorTask::new(
                    self.manager,
                    MirrorAction::UpdateDomain { domain: local.id },
                )));
            }
            let local_policies = policies.remove(&local.id).unwrap_or_default();
            let remote_policies = remote_call(
                "manager",
                "list policies",
                ctx.remote_timeout,
                api.list_policies(&remote.id),
            )
            .await?;
            let policy_outcome = match_records(
                local_policies,
                remote_policies,
                |policy| Some(policy.foreign_id.clone()),
                |remote| remote.id.clone(),
            );
            for remote_policy in policy_outcome.remote_only {
                graph.add_task(Arc::new(MirrorTask::new(
                    self.manager,
                    MirrorAction::CreatePolicy {
                        domain: remote.id.clone(),
                        policy: remote_policy.id,
                    },
                )));
            }
            for (local_policy, remote_policy) in policy_outcome.matched {
                if local_policy.name != remote_policy.name {
                    graph.add_task(Arc::new(MirrorTask::new(
                        self.manager,
                        MirrorAction::UpdatePolicy {
                            policy: local_policy.id,
                        },
                    )));
                }
            }
            for stale in policy_outcome.local_only {
                graph.add_task(Arc::new(MirrorTask::new(
                    self.manager,
                    MirrorAction::DeletePolicy { policy: stale.id },
                )));
            }
        }

        for stale in outcome.local_only {
            let delete = graph.add_task(Arc::new(MirrorTask::new(
                self.manager,
                MirrorAction::DeleteDomain { domain: stale.id },
            )));
            for policy in policies.remove(&stale.id).unwrap_or_default() {
                let node = graph.add_task(Arc::new(MirrorTask::new(
                    self.manager,
                    MirrorAction::DeletePolicy { policy: policy.id },
                )));
                graph.add_edge(node, delete, Guard::OnSuccess);
            }
        }

        if !graph.is_empty() {
            graph.append_task(
                Arc::new(NotifyTask::new(format!(
                    "domains mirrored for '{}'",
                    manager.name
                ))),
                Guard::OnCompletion,
            );
        }
        Ok(graph)
    }
}

/// One difference a domain mirror pass found.
#[derive(Debug, Clone)]
pub enum MirrorAction {
    /// Mirror a manager domain that has no local record.
    CreateDomain {
        /// The manager's identifier for the domain.
        domain: ForeignId,
    },
    /// Pull the current name over a drifted local domain.
    UpdateDomain {
        /// Primary key of the local domain.
        domain: EntityId,
    },
    /// Retire a local domain the manager no longer lists.
    DeleteDomain {
        /// Primary key of the local domain.
        domain: EntityId,
    },
    /// Mirror a manager policy that has no local record.
    CreatePolicy {
        /// The manager's identifier for the owning domain.
        domain: ForeignId,
        /// The manager's identifier for the policy.
        policy: ForeignId,
    },
    /// Pull the current name over a drifted local policy.
    UpdatePolicy {
        /// Primary key of the local policy.
        policy: EntityId,
    },
    /// Retire a local policy the manager no longer lists.
    DeletePolicy {
        /// Primary key of the local policy.
        policy: EntityId,
    },
}

/// Applies one [`MirrorAction`] in a single store transaction.
pub struct MirrorTask {
    manager: EntityId,
    action: MirrorAction,
}

impl MirrorTask {
    /// Creates the task for `action`.
    #[must_use]
    pub fn new(manager: EntityId, action: MirrorAction) -> Self {
        Self { manager, action }
    }
}

#[async_trait]
impl Task for MirrorTask {
    fn name(&self) -> String {
        match &self.action {
            MirrorAction::CreateDomain { domain } => format!("mirror domain {domain}"),
            MirrorAction::UpdateDomain { domain } => format!(
                "refresh {}",
                EntityKey::new(ObjectKind::Domain, *domain)
            ),
            MirrorAction::DeleteDomain { domain } => format!(
                "delete {}",
                EntityKey::new(ObjectKind::Domain, *domain)
            ),
            MirrorAction::CreatePolicy { policy, .. } => format!("mirror policy {policy}"),
            MirrorAction::UpdatePolicy { policy } => format!(
                "refresh {}",
                EntityKey::new(ObjectKind::Policy, *policy)
            ),
            MirrorAction::DeletePolicy { policy } => format!(
                "delete {}",
                EntityKey::new(ObjectKind::Policy, *policy)
            ),
        }
    }

    async fn execute(&self, ctx: &TaskContext) -> CoreResult<()> {
        let mut tx = StoreTransaction::begin(Arc::clone(&ctx.store));
        let manager_key = EntityKey::new(ObjectKind::Manager, self.manager);
        let manager = ManagerConnector::try_from(tx.load_required(manager_key).await?.entity)?;

        match &self.action {
            MirrorAction::CreateDomain { domain } => {
                let api = ctx.apis.manager_api(&manager).await?;
                let listed = remote_call(
                    "manager",
                    "list domains",
                    ctx.remote_timeout,
                    api.list_domains(),
                )
                .await?;
                let Some(remote) = listed.into_iter().find(|candidate| candidate.id == *domain)
                else {
                    debug!(%domain, "remote domain vanished before mirroring");
                    return Ok(());
                };
                // Names recur across managers, so adoption only considers
                // this manager's domains.
                let mut adopted = None;
                for versioned in ctx.store.list(ObjectKind::Domain).await {
                    let candidate = Domain::try_from(versioned.entity)?;
                    if candidate.manager_id == self.manager && candidate.name == remote.name {
                        adopted = tx.load(EntityKey::new(ObjectKind::Domain, candidate.id)).await;
                        break;
                    }
                }
                match adopted {
                    Some(versioned) => {
                        let mut record = Domain::try_from(versioned.entity)?;
                        debug!(domain = %record.id, "adopting mirrored domain by name");
                        record.foreign_id = remote.id;
                        tx.put(Entity::Domain(record));
                    }
                    None => {
                        let id = tx.allocate_id().await?;
                        tx.put(Entity::Domain(Domain {
                            id,
                            manager_id: self.manager,
                            foreign_id: remote.id,
                            name: remote.name,
                        }));
                    }
                }
                tx.commit().await
            }
            MirrorAction::UpdateDomain { domain } => {
                let key = EntityKey::new(ObjectKind::Domain, *domain);
                let mut record = Domain::try_from(tx.load_required(key).await?.entity)?;
                let api = ctx.apis.manager_api(&manager).await?;
                let listed = remote_call(
                    "manager",
                    "list domains",
                    ctx.remote_timeout,
                    api.list_domains(),
                )
                .await?;
                let Some(remote) = listed
                    .into_iter()
                    .find(|candidate| candidate.id == record.foreign_id)
                else {
                    debug!(domain = %key, "remote domain vanished, the next pass retires it");
                    return Ok(());
                };
                if record.name != remote.name {
                    record.name = remote.name;
                    tx.put(Entity::Domain(record));
                }
                tx.commit().await
            }
            MirrorAction::DeleteDomain { domain } => {
                let key = EntityKey::new(ObjectKind::Domain, *domain);
                if tx.load(key).await.is_none() {
                    debug!(domain = %key, "already retired, nothing to do");
                    return Ok(());
                }
                // Planned policy deletes ran before this node; any policy
                // committed since the plan would otherwise be orphaned.
                for versioned in tx.list(ObjectKind::Policy).await {
                    let policy = Policy::try_from(versioned.entity)?;
                    if policy.domain_id == *domain {
                        tx.delete(EntityKey::new(ObjectKind::Policy, policy.id));
                    }
                }
                tx.delete(key);
                tx.commit().await
            }
            MirrorAction::CreatePolicy { domain, policy } => {
                let mut parent = None;
                for versioned in tx.list(ObjectKind::Domain).await {
                    let candidate = Domain::try_from(versioned.entity)?;
                    if candidate.foreign_id == *domain {
                        parent = Some(candidate);
                        break;
                    }
                }
                let Some(parent) = parent else {
                    return Err(CoreError::Conflict(format!(
                        "domain {domain} is not mirrored locally"
                    )));
                };
                let api = ctx.apis.manager_api(&manager).await?;
                let listed = remote_call(
                    "manager",
                    "list policies",
                    ctx.remote_timeout,
                    api.list_policies(domain),
                )
                .await?;
                let Some(remote) = listed.into_iter().find(|candidate| candidate.id == *policy)
                else {
                    debug!(%policy, "remote policy vanished before mirroring");
                    return Ok(());
                };
                // Names recur across domains, so adoption only considers
                // the owning domain's policies.
                let mut adopted = None;
                for versioned in ctx.store.list(ObjectKind::Policy).await {
                    let candidate = Policy::try_from(versioned.entity)?;
                    if candidate.domain_id == parent.id && candidate.name == remote.name {
                        adopted = tx.load(EntityKey::new(ObjectKind::Policy, candidate.id)).await;
                        break;
                    }
                }
                match adopted {
                    Some(versioned) => {
                        let mut record = Policy::try_from(versioned.entity)?;
                        debug!(policy = %record.id, "adopting mirrored policy by name");
                        record.foreign_id = remote.id;
                        tx.put(Entity::Policy(record));
                    }
                    None => {
                        let id = tx.allocate_id().await?;
                        tx.put(Entity::Policy(Policy {
                            id,
                            domain_id: parent.id,
                            foreign_id: remote.id,
                            name: remote.name,
                        }));
                    }
                }
                tx.commit().await
            }
            MirrorAction::UpdatePolicy { policy } => {
                let key = EntityKey::new(ObjectKind::Policy, *policy);
                let mut record = Policy::try_from(tx.load_required(key).await?.entity)?;
                let domain_key = EntityKey::new(ObjectKind::Domain, record.domain_id);
                let parent = Domain::try_from(tx.load_required(domain_key).await?.entity)?;
                let api = ctx.apis.manager_api(&manager).await?;
                let listed = remote_call(
                    "manager",
                    "list policies",
                    ctx.remote_timeout,
                    api.list_policies(&parent.foreign_id),
                )
                .await?;
                let Some(remote) = listed
                    .into_iter()
                    .find(|candidate| candidate.id == record.foreign_id)
                else {
                    debug!(policy = %key, "remote policy vanished, the next pass retires it");
                    return Ok(());
                };
                if record.name != remote.name {
                    record.name = remote.name;
                    tx.put(Entity::Policy(record));
                }
                tx.commit().await
            }
            MirrorAction::DeletePolicy { policy } => {
                let key = EntityKey::new(ObjectKind::Policy, *policy);
                if tx.load(key).await.is_none() {
                    debug!(policy = %key, "already retired, nothing to do");
                    return Ok(());
                }
                tx.delete(key);
                tx.commit().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::context;
    use warden_core::remote::{RemoteDomain, RemotePolicy};
    use warden_core::{
        MemoryStore, MockController, MockManager, MockOrchestrator, MockRemotes, Store,
    };

    fn manager_entity() -> Entity {
        Entity::Manager(ManagerConnector {
            id: EntityId(1),
            name: "panorama".to_owned(),
            endpoint: "https://panorama.example".to_owned(),
        })
    }

    fn domain_entity(id: u64, foreign: &str, name: &str) -> Entity {
        Entity::Domain(Domain {
            id: EntityId(id),
            manager_id: EntityId(1),
            foreign_id: ForeignId::new(foreign),
            name: name.to_owned(),
        })
    }

    fn policy_entity(id: u64, domain: u64, foreign: &str, name: &str) -> Entity {
        Entity::Policy(Policy {
            id: EntityId(id),
            domain_id: EntityId(domain),
            foreign_id: ForeignId::new(foreign),
            name: name.to_owned(),
        })
    }

    fn remote_domain(id: &str, name: &str) -> RemoteDomain {
        RemoteDomain {
            id: ForeignId::new(id),
            name: name.to_owned(),
        }
    }

    fn remote_policy(id: &str, domain: &str, name: &str) -> RemotePolicy {
        RemotePolicy {
            id: ForeignId::new(id),
            domain_id: ForeignId::new(domain),
            name: name.to_owned(),
        }
    }

    fn remotes_with(manager: MockManager) -> MockRemotes {
        MockRemotes::with_systems(manager, MockController::new(), MockOrchestrator::new())
    }

    #[tokio::test]
    async fn test_new_remote_domain_mirrors_domain_then_policies() {
        let store = MemoryStore::new();
        store.seed(vec![manager_entity()]).await;
        let manager = MockManager::new()
            .with_domain(remote_domain("dom-1", "prod"))
            .with_policy(remote_policy("pol-1", "dom-1", "allow-web"));
        let ctx = context(Arc::clone(&store), remotes_with(manager));

        let graph = DomainMirror::new(EntityId(1)).expand(&ctx).await.unwrap();

        let names = graph.node_names();
        assert!(names.contains(&"mirror domain dom-1".to_owned()));
        assert!(names.contains(&"mirror policy pol-1".to_owned()));
        let domain_node = graph.find_node("mirror domain dom-1").unwrap();
        let policy_node = graph.find_node("mirror policy pol-1").unwrap();
        assert!(graph.has_path(domain_node, policy_node));
    }

    #[tokio::test]
    async fn test_changed_and_added_policies_plan_update_and_create() {
        let store = MemoryStore::new();
        store
            .seed(vec![
                manager_entity(),
                domain_entity(6, "dom-1", "prod"),
                policy_entity(7, 6, "pol-1", "Old"),
            ])
            .await;
        let manager = MockManager::new()
            .with_domain(remote_domain("dom-1", "prod"))
            .with_policy(remote_policy("pol-1", "dom-1", "New"))
            .with_policy(remote_policy("pol-2", "dom-1", "Added"));
        let ctx = context(Arc::clone(&store), remotes_with(manager));

        let graph = DomainMirror::new(EntityId(1)).expand(&ctx).await.unwrap();

        let names = graph.node_names();
        assert!(names.contains(&"refresh Policy#7".to_owned()));
        assert!(names.contains(&"mirror policy pol-2".to_owned()));
        assert!(!names.iter().any(|name| name.starts_with("delete")));
    }

    #[tokio::test]
    async fn test_retiring_a_domain_deletes_its_policies_first() {
        let store = MemoryStore::new();
        store
            .seed(vec![
                manager_entity(),
                domain_entity(6, "dom-1", "prod"),
                policy_entity(7, 6, "pol-1", "allow-web"),
                policy_entity(8, 6, "pol-2", "deny-all"),
            ])
            .await;
        let ctx = context(Arc::clone(&store), remotes_with(MockManager::new()));

        let graph = DomainMirror::new(EntityId(1)).expand(&ctx).await.unwrap();

        let domain_node = graph.find_node("delete Domain#6").unwrap();
        for policy in ["delete Policy#7", "delete Policy#8"] {
            let policy_node = graph.find_node(policy).unwrap();
            assert!(graph.has_path(policy_node, domain_node));
        }
    }

    #[tokio::test]
    async fn test_converged_mirror_plans_nothing() {
        let store = MemoryStore::new();
        store
            .seed(vec![
                manager_entity(),
                domain_entity(6, "dom-1", "prod"),
                policy_entity(7, 6, "pol-1", "allow-web"),
            ])
            .await;
        let manager = MockManager::new()
            .with_domain(remote_domain("dom-1", "prod"))
            .with_policy(remote_policy("pol-1", "dom-1", "allow-web"));
        let ctx = context(Arc::clone(&store), remotes_with(manager));

        let graph = DomainMirror::new(EntityId(1)).expand(&ctx).await.unwrap();

        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn test_create_domain_adopts_local_record_by_name() {
        let store = MemoryStore::new();
        store
            .seed(vec![manager_entity(), domain_entity(6, "dom-old", "prod")])
            .await;
        let manager = MockManager::new().with_domain(remote_domain("dom-new", "prod"));
        let ctx = context(Arc::clone(&store), remotes_with(manager));

        let task = MirrorTask::new(
            EntityId(1),
            MirrorAction::CreateDomain {
                domain: ForeignId::new("dom-new"),
            },
        );
        task.execute(&ctx).await.unwrap();

        let domains = store.list(ObjectKind::Domain).await;
        assert_eq!(domains.len(), 1);
        let record = Domain::try_from(domains[0].entity.clone()).unwrap();
        assert_eq!(record.id, EntityId(6));
        assert_eq!(record.foreign_id, ForeignId::new("dom-new"));
    }

    #[tokio::test]
    async fn test_create_domain_leaves_other_managers_domain_alone() {
        let store = MemoryStore::new();
        store
            .seed(vec![
                manager_entity(),
                Entity::Manager(ManagerConnector {
                    id: EntityId(2),
                    name: "fmc".to_owned(),
                    endpoint: "https://fmc.example".to_owned(),
                }),
                domain_entity(6, "dom-1", "prod"),
            ])
            .await;
        let manager = MockManager::new().with_domain(remote_domain("dom-9", "prod"));
        let ctx = context(Arc::clone(&store), remotes_with(manager));

        let task = MirrorTask::new(
            EntityId(2),
            MirrorAction::CreateDomain {
                domain: ForeignId::new("dom-9"),
            },
        );
        task.execute(&ctx).await.unwrap();

        // A fresh record for manager 2; manager 1 keeps Domain#6 as-is.
        assert_eq!(store.list(ObjectKind::Domain).await.len(), 2);
        let kept = store
            .load(EntityKey::new(ObjectKind::Domain, EntityId(6)))
            .await
            .unwrap();
        let kept = Domain::try_from(kept.entity).unwrap();
        assert_eq!(kept.manager_id, EntityId(1));
        assert_eq!(kept.foreign_id, ForeignId::new("dom-1"));
    }

    #[tokio::test]
    async fn test_create_policy_adopts_the_domains_own_record() {
        let store = MemoryStore::new();
        store
            .seed(vec![
                manager_entity(),
                domain_entity(6, "dom-1", "prod"),
                policy_entity(7, 6, "pol-old", "allow-web"),
            ])
            .await;
        let manager = MockManager::new()
            .with_domain(remote_domain("dom-1", "prod"))
            .with_policy(remote_policy("pol-new", "dom-1", "allow-web"));
        let ctx = context(Arc::clone(&store), remotes_with(manager));

        let task = MirrorTask::new(
            EntityId(1),
            MirrorAction::CreatePolicy {
                domain: ForeignId::new("dom-1"),
                policy: ForeignId::new("pol-new"),
            },
        );
        task.execute(&ctx).await.unwrap();

        let policies = store.list(ObjectKind::Policy).await;
        assert_eq!(policies.len(), 1);
        let record = Policy::try_from(policies[0].entity.clone()).unwrap();
        assert_eq!(record.id, EntityId(7));
        assert_eq!(record.foreign_id, ForeignId::new("pol-new"));
        assert_eq!(record.domain_id, EntityId(6));
    }

    #[tokio::test]
    async fn test_create_policy_ignores_same_name_in_other_domain() {
        let store = MemoryStore::new();
        store
            .seed(vec![
                manager_entity(),
                domain_entity(6, "dom-1", "prod"),
                domain_entity(8, "dom-2", "dev"),
                policy_entity(7, 6, "pol-1", "default"),
            ])
            .await;
        let manager = MockManager::new()
            .with_domain(remote_domain("dom-1", "prod"))
            .with_domain(remote_domain("dom-2", "dev"))
            .with_policy(remote_policy("pol-1", "dom-1", "default"))
            .with_policy(remote_policy("pol-2", "dom-2", "default"));
        let ctx = context(Arc::clone(&store), remotes_with(manager));

        let task = MirrorTask::new(
            EntityId(1),
            MirrorAction::CreatePolicy {
                domain: ForeignId::new("dom-2"),
                policy: ForeignId::new("pol-2"),
            },
        );
        task.execute(&ctx).await.unwrap();

        // Domain#6 keeps its policy; dom-2's copy became a second record.
        let policies = store.list(ObjectKind::Policy).await;
        assert_eq!(policies.len(), 2);
        let kept = Policy::try_from(policies[0].entity.clone()).unwrap();
        assert_eq!(kept.id, EntityId(7));
        assert_eq!(kept.domain_id, EntityId(6));
        assert_eq!(kept.foreign_id, ForeignId::new("pol-1"));
    }

    #[tokio::test]
    async fn test_delete_tasks_retire_policy_then_domain() {
        let store = MemoryStore::new();
        store
            .seed(vec![
                manager_entity(),
                domain_entity(6, "dom-1", "prod"),
                policy_entity(7, 6, "pol-1", "allow-web"),
            ])
            .await;
        let ctx = context(Arc::clone(&store), remotes_with(MockManager::new()));

        MirrorTask::new(EntityId(1), MirrorAction::DeletePolicy { policy: EntityId(7) })
            .execute(&ctx)
            .await
            .unwrap();
        MirrorTask::new(EntityId(1), MirrorAction::DeleteDomain { domain: EntityId(6) })
            .execute(&ctx)
            .await
            .unwrap();

        assert!(store.list(ObjectKind::Policy).await.is_empty());
        assert!(store.list(ObjectKind::Domain).await.is_empty());
    }
}
