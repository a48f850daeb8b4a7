//! Job identity and lifecycle reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

/// Identifies one submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Mints a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JobId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        write!(formatter, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Accepted, not yet draining.
    Pending,
    /// The graph is draining.
    Running,
    /// Every node finished and none failed.
    Succeeded,
    /// At least one node failed.
    Failed,
}

impl JobStatus {
    /// Whether no further transition can happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Reportable snapshot of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    /// Job identity.
    pub id: JobId,
    /// Caller-supplied name.
    pub name: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Message of the first failure, if any.
    pub failure: Option<String>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}
