//! The unit-of-work contract tasks implement and the context they run in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use warden_core::Result as CoreResult;
use warden_core::remote::ApiFactory;
use warden_core::store::Store;

use crate::events::{EventChannel, JobEvent};
use crate::graph::TaskGraph;
use crate::job::JobId;

/// Execution state of one task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not yet eligible, or eligible and waiting for a worker.
    Pending,
    /// Currently executing.
    Running,
    /// Finished without error.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Never executed because an on-success guard was unmet.
    Skipped,
}

impl TaskStatus {
    /// Whether no further transition can happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Shared collaborators one task execution runs against.
///
/// Tasks re-resolve their subjects through the store at execution time;
/// the context never carries live record handles.
#[derive(Clone)]
pub struct TaskContext {
    /// The job this execution belongs to.
    pub job: JobId,
    /// Store for re-resolving subjects and committing changes.
    pub store: Arc<dyn Store>,
    /// Factory for remote-system connections.
    pub apis: Arc<dyn ApiFactory>,
    /// Sink for progress notifications.
    pub events: EventChannel,
    /// Deadline applied to each remote-system call.
    pub remote_timeout: Duration,
}

/// A unit of work executed by the engine.
///
/// One leaf task performs at most one store transaction; its effects
/// commit atomically or not at all.
#[async_trait]
pub trait Task: Send + Sync {
    /// Short name used in logs and progress events.
    fn name(&self) -> String;

    /// Runs the task's effect.
    ///
    /// # Errors
    /// Returns an error when the task's transaction or remote call fails;
    /// the engine marks the task failed and lets guards decide what still
    /// runs.
    async fn execute(&self, ctx: &TaskContext) -> CoreResult<()>;
}

/// A task that computes the work still needed to converge and exposes it
/// as a subgraph spliced in place of its node.
///
/// Expansion runs exactly once and must be a pure function of observed
/// state: converged state yields an empty graph.
#[async_trait]
pub trait MetaTask: Send + Sync {
    /// Short name used in logs and progress events.
    fn name(&self) -> String;

    /// Computes the remaining work as a graph.
    ///
    /// # Errors
    /// Returns an error when observing local or remote state fails; the
    /// engine marks the node failed without splicing anything.
    async fn expand(&self, ctx: &TaskContext) -> CoreResult<TaskGraph>;
}

/// Emits a change notification for interested subscribers.
///
/// Conform passes append one of these when a pass actually changed
/// something.
pub struct NotifyTask {
    message: String,
}

impl NotifyTask {
    /// Creates a notification carrying `message`.
    pub fn new<T: Into<String>>(message: T) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Task for NotifyTask {
    fn name(&self) -> String {
        format!("notify: {}", self.message)
    }

    async fn execute(&self, ctx: &TaskContext) -> CoreResult<()> {
        info!(job = %ctx.job, message = %self.message, "change notification");
        ctx.events.emit(JobEvent::Notify {
            job: ctx.job,
            message: self.message.clone(),
        });
        Ok(())
    }
}
