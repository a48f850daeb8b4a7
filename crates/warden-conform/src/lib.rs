//! Reconciliation service for the warden inventory broker.
//!
//! "Conform" diffs locally desired records against externally observed
//! state and emits corrective work as task graphs: appliances push to
//! their manager, security groups push to their SDN controller, domains
//! and policies pull from the manager, pod members pull from the
//! container orchestrator. The orchestrator turns those passes into
//! locked engine jobs and the scheduler resubmits the whole cycle on a
//! fixed cadence.

/// Broker configuration persisted under the user's home directory.
pub mod config;
/// Device registration conform: appliances pushed to their manager.
pub mod devices;
/// Domain and policy mirror: manager state pulled into the store.
pub mod domains;
/// Conform service error types and result definitions.
pub mod error;
/// Network group conform: security groups pushed to their controller.
pub mod netgroups;
/// Job submission and lock selection for conform passes.
pub mod orchestrator;
/// Pod member mirror: orchestrator pods pulled into group members.
pub mod pods;
/// The direction-agnostic diff skeleton conform passes share.
pub mod reconcile;
/// Recurring conform sweeps on a fixed cadence.
pub mod scheduler;

pub use config::{BrokerConfig, ConformConfig};
pub use devices::{DeviceAction, DeviceConform, DeviceTask};
pub use domains::{DomainMirror, MirrorAction, MirrorTask};
pub use error::{ConformError, Result};
pub use netgroups::{NetworkGroupAction, NetworkGroupConform, NetworkGroupTask};
pub use orchestrator::ConformOrchestrator;
pub use pods::{PodMemberAction, PodMemberMirror, PodMemberTask};
pub use reconcile::{MatchOutcome, match_records};
pub use scheduler::ConformScheduler;
