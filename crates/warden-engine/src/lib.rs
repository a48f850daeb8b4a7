//! Job engine for the warden inventory broker.
//!
//! Jobs are dependency graphs of tasks drained over a bounded worker
//! pool. Edges carry guards deciding whether a successor runs after its
//! predecessor's outcome, expanding nodes splice the work they compute
//! into the running graph, and a shared/exclusive lock registry
//! serializes jobs whose object scopes intersect.

/// Engine tuning knobs.
pub mod config;
/// Job intake, the worker pool, and the drain loop.
pub mod engine;
/// Engine error types and result definitions.
pub mod error;
/// Progress events jobs emit while draining.
pub mod events;
/// Dependency graphs of tasks with guarded edges.
pub mod graph;
/// Job identity and lifecycle reporting.
pub mod job;
/// Shared/exclusive locking over object references.
pub mod lock;
/// The task contract and execution context.
pub mod task;

pub use config::EngineConfig;
pub use engine::JobEngine;
pub use error::{EngineError, Result};
pub use events::{EventChannel, JobEvent};
pub use graph::{Guard, NodeId, TaskGraph, TaskNode};
pub use job::{JobId, JobStatus, JobSummary};
pub use lock::{
    LockHandle, LockInfo, LockManager, LockMode, LockRequest, ObjectLockManager, OwnerId,
    UnlockTask,
};
pub use task::{MetaTask, NotifyTask, Task, TaskContext, TaskStatus};
