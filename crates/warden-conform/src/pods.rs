//! Pod member mirror: orchestrator pods pulled into a security group.
//!
//! The orchestrator is authoritative. Pods carrying the group's selector
//! label become members of kind Pod; members whose pod is gone, or whose
//! group lost its selector, are retired. Members of other kinds are never
//! touched here.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use warden_core::entities::{
    MemberKind, SecurityGroup, SecurityGroupMember, VirtualizationConnector,
};
use warden_core::remote::RemotePod;
use warden_core::store::StoreTransaction;
use warden_core::{
    Entity, EntityId, EntityKey, Error as CoreError, ForeignId, ObjectKind, Result as CoreResult,
};
use warden_engine::{Guard, MetaTask, NotifyTask, Task, TaskContext, TaskGraph};

use crate::reconcile::{match_records, remote_call};

/// Mirror pass diffing one security group's pod members against the pods
/// its selector currently matches.
pub struct PodMemberMirror {
    group: EntityId,
}

impl PodMemberMirror {
    /// Creates the pass over one security group's pod members.
    #[must_use]
    pub fn new(group: EntityId) -> Self {
        Self { group }
    }
}

#[async_trait]
impl MetaTask for PodMemberMirror {
    fn name(&self) -> String {
        format!(
            "mirror pod members of {}",
            EntityKey::new(ObjectKind::SecurityGroup, self.group)
        )
    }

    async fn expand(&self, ctx: &TaskContext) -> CoreResult<TaskGraph> {
        let key = EntityKey::new(ObjectKind::SecurityGroup, self.group);
        let versioned = ctx.store.load(key).await.ok_or(CoreError::NotFound(key))?;
        let group = SecurityGroup::try_from(versioned.entity)?;
        let connector_key = EntityKey::new(ObjectKind::Connector, group.connector_id);
        let connector = ctx
            .store
            .load(connector_key)
            .await
            .ok_or(CoreError::NotFound(connector_key))?;
        let connector = VirtualizationConnector::try_from(connector.entity)?;

        let mut members = Vec::new();
        for versioned in ctx.store.list(ObjectKind::GroupMember).await {
            let member = SecurityGroupMember::try_from(versioned.entity)?;
            if member.group_id == self.group && member.kind == MemberKind::Pod {
                members.push(member);
            }
        }

        // No selector means no pods belong here; existing pod members all
        // fall out as stale.
        let pods: Vec<RemotePod> = if let Some(label) = &group.pod_selector {
            let api = ctx.apis.orchestrator_api(&connector).await?;
            remote_call(
                "orchestrator",
                "list pods",
                ctx.remote_timeout,
                api.list_pods(label),
            )
            .await?
        } else {
            Vec::new()
        };

        let outcome = match_records(
            members,
            pods,
            |member| Some(member.foreign_id.clone()),
            |pod| pod.id.clone(),
        );

        let mut graph = TaskGraph::new();
        for pod in outcome.remote_only {
            graph.add_task(Arc::new(PodMemberTask::new(
                self.group,
                PodMemberAction::Add { pod: pod.id },
            )));
        }
        for (member, pod) in outcome.matched {
            if member.name != pod.name {
                graph.add_task(Arc::new(PodMemberTask::new(
                    self.group,
                    PodMemberAction::Refresh { member: member.id },
                )));
            }
        }
        for stale in outcome.local_only {
            graph.add_task(Arc::new(PodMemberTask::new(
                self.group,
                PodMemberAction::Remove { member: stale.id },
            )));
        }

        if !graph.is_empty() {
            graph.append_task(
                Arc::new(NotifyTask::new(format!(
                    "pod members mirrored for '{}'",
                    group.name
                ))),
                Guard::OnCompletion,
            );
        }
        Ok(graph)
    }
}

/// One difference a pod member mirror pass found.
#[derive(Debug, Clone)]
pub enum PodMemberAction {
    /// Record a pod the selector matches but the group does not hold.
    Add {
        /// The orchestrator's identifier for the pod.
        pod: ForeignId,
    },
    /// Pull the current pod name over a drifted member record.
    Refresh {
        /// Primary key of the member record.
        member: EntityId,
    },
    /// Retire a member whose pod is gone or whose selector was removed.
    Remove {
        /// Primary key of the member record.
        member: EntityId,
    },
}

/// Applies one [`PodMemberAction`] in a single store transaction.
pub struct PodMemberTask {
    group: EntityId,
    action: PodMemberAction,
}

impl PodMemberTask {
    /// Creates the task for `action`.
    #[must_use]
    pub fn new(group: EntityId, action: PodMemberAction) -> Self {
        Self { group, action }
    }

    /// Pods the group's selector currently matches, or none without a
    /// selector.
    async fn live_pods(
        &self,
        ctx: &TaskContext,
        group: &SecurityGroup,
        tx: &mut StoreTransaction,
    ) -> CoreResult<Vec<RemotePod>> {
        let Some(label) = &group.pod_selector else {
            return Ok(Vec::new());
        };
        let connector_key = EntityKey::new(ObjectKind::Connector, group.connector_id);
        let connector =
            VirtualizationConnector::try_from(tx.load_required(connector_key).await?.entity)?;
        let api = ctx.apis.orchestrator_api(&connector).await?;
        remote_call(
            "orchestrator",
            "list pods",
            ctx.remote_timeout,
            api.list_pods(label),
        )
        .await
    }
}

#[async_trait]
impl Task for PodMemberTask {
    fn name(&self) -> String {
        match &self.action {
            PodMemberAction::Add { pod } => format!("mirror pod member {pod}"),
            PodMemberAction::Refresh { member } => format!(
                "refresh {}",
                EntityKey::new(ObjectKind::GroupMember, *member)
            ),
            PodMemberAction::Remove { member } => format!(
                "delete {}",
                EntityKey::new(ObjectKind::GroupMember, *member)
            ),
        }
    }

    async fn execute(&self, ctx: &TaskContext) -> CoreResult<()> {
        let mut tx = StoreTransaction::begin(Arc::clone(&ctx.store));
        let group_key = EntityKey::new(ObjectKind::SecurityGroup, self.group);
        let group = SecurityGroup::try_from(tx.load_required(group_key).await?.entity)?;

        match &self.action {
            PodMemberAction::Add { pod } => {
                let pods = self.live_pods(ctx, &group, &mut tx).await?;
                let Some(pod) = pods.into_iter().find(|candidate| candidate.id == *pod) else {
                    debug!(pod = %pod, "pod vanished before mirroring");
                    return Ok(());
                };
                // Adoption only considers pod members of this group.
                let mut adopted = None;
                for versioned in ctx.store.list(ObjectKind::GroupMember).await {
                    let candidate = SecurityGroupMember::try_from(versioned.entity)?;
                    if candidate.group_id == self.group
                        && candidate.kind == MemberKind::Pod
                        && candidate.name == pod.name
                    {
                        adopted =
                            tx.load(EntityKey::new(ObjectKind::GroupMember, candidate.id)).await;
                        break;
                    }
                }
                match adopted {
                    Some(versioned) => {
                        let mut record = SecurityGroupMember::try_from(versioned.entity)?;
                        debug!(member = %record.id, "adopting member record by name");
                        record.foreign_id = pod.id;
                        tx.put(Entity::GroupMember(record));
                    }
                    None => {
                        let id = tx.allocate_id().await?;
                        tx.put(Entity::GroupMember(SecurityGroupMember {
                            id,
                            group_id: self.group,
                            kind: MemberKind::Pod,
                            foreign_id: pod.id,
                            name: pod.name,
                        }));
                    }
                }
                tx.commit().await
            }
            PodMemberAction::Refresh { member } => {
                let key = EntityKey::new(ObjectKind::GroupMember, *member);
                let mut record = SecurityGroupMember::try_from(tx.load_required(key).await?.entity)?;
                let pods = self.live_pods(ctx, &group, &mut tx).await?;
                let Some(pod) = pods
                    .into_iter()
                    .find(|candidate| candidate.id == record.foreign_id)
                else {
                    debug!(member = %key, "pod vanished, the next pass retires the member");
                    return Ok(());
                };
                if record.name != pod.name {
                    record.name = pod.name;
                    tx.put(Entity::GroupMember(record));
                }
                tx.commit().await
            }
            PodMemberAction::Remove { member } => {
                let key = EntityKey::new(ObjectKind::GroupMember, *member);
                let Some(versioned) = tx.load(key).await else {
                    debug!(member = %key, "already retired, nothing to do");
                    return Ok(());
                };
                let record = SecurityGroupMember::try_from(versioned.entity)?;
                // An add task may have re-pointed this record at a live pod
                // since the plan was made.
                let pods = self.live_pods(ctx, &group, &mut tx).await?;
                if pods.iter().any(|pod| pod.id == record.foreign_id) {
                    debug!(member = %key, "member points at a live pod, keeping it");
                    return Ok(());
                }
                tx.delete(key);
                tx.commit().await
            }
        }
    }
}
