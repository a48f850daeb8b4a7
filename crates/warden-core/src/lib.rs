//! Core types and contracts for the warden inventory broker.
//!
//! This crate provides the identity handles, inventory records, store
//! contract with optimistic transactions, and remote-system client
//! contracts used across the broker.

/// Inventory record types held in the store.
pub mod entities;
/// Error types and result definitions.
pub mod error;
/// Mock remote systems for tests.
pub mod mock;
/// Identity handles for lockable aggregates.
pub mod refs;
/// Remote-system records and client contracts.
pub mod remote;
/// Store contract, optimistic transactions, and the in-memory store.
pub mod store;
/// Synchronization helpers.
pub mod sync;

pub use entities::Entity;
pub use error::{Error, Result};
pub use mock::{MockController, MockManager, MockOrchestrator, MockRemotes};
pub use refs::{EntityId, EntityKey, ForeignId, ObjectKind, ObjectRef};
pub use store::{EntityChange, MemoryStore, Store, StoreTransaction, Versioned};
pub use sync::IgnoreLock;
