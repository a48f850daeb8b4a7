//! Engine tuning knobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker pool and wait-budget configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of tasks executing at once across all jobs
    pub max_concurrent_tasks: usize,
    /// How long lock acquisition waits before reporting contention, in seconds
    pub lock_wait_secs: u64,
    /// Deadline for one remote-system call, in seconds
    pub remote_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: num_cpus::get(),
            lock_wait_secs: 30,
            remote_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// The lock wait budget as a duration.
    #[must_use]
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }

    /// The remote call deadline as a duration.
    #[must_use]
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}
