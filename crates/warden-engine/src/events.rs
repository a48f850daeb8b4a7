//! Progress events jobs emit while draining.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::job::{JobId, JobStatus};
use crate::task::TaskStatus;

/// One observable step in a job's life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobEvent {
    /// The job began draining its graph.
    JobStarted {
        /// The job that started.
        job: JobId,
        /// Caller-supplied job name.
        name: String,
    },
    /// A task node began executing.
    TaskStarted {
        /// The job the task belongs to.
        job: JobId,
        /// Display name of the task.
        task: String,
    },
    /// A task node reached a terminal status.
    TaskFinished {
        /// The job the task belongs to.
        job: JobId,
        /// Display name of the task.
        task: String,
        /// The terminal status the task reached.
        status: TaskStatus,
        /// Failure message when the task failed.
        error: Option<String>,
    },
    /// The job reached a terminal status.
    JobFinished {
        /// The job that finished.
        job: JobId,
        /// The terminal status the job reached.
        status: JobStatus,
        /// Message of the first task failure, if any.
        failure: Option<String>,
    },
    /// A task reported an applied change.
    Notify {
        /// The job the report came from.
        job: JobId,
        /// Human-readable description of the change.
        message: String,
    },
}

/// Hands job events to an interested subscriber.
///
/// Send failures are ignored so a departed subscriber never stalls a job.
#[derive(Clone)]
pub struct EventChannel {
    sender: Option<UnboundedSender<JobEvent>>,
}

impl EventChannel {
    /// Creates a connected channel and its receiving end.
    #[must_use]
    pub fn channel() -> (Self, UnboundedReceiver<JobEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A channel that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    /// Emits one event.
    pub fn emit(&self, event: JobEvent) {
        if let Some(sender) = &self.sender {
            drop(sender.send(event));
        }
    }
}
