//! Store contract, optimistic transactions, and the in-memory store.
//!
//! Tasks never hold live references into the store. A task opens a
//! [`StoreTransaction`], re-resolves its subjects by primary key, stages
//! changes, and commits; the commit applies atomically iff nothing the
//! transaction observed has changed underneath it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::entities::Entity;
use crate::refs::{EntityId, EntityKey, ObjectKind};
use crate::{Error, Result};

/// A record together with the store's version counter for it.
///
/// The version bumps on every committed write and is what transactions
/// check at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    /// The stored record.
    pub entity: Entity,
    /// Monotonic per-record write counter.
    pub version: u64,
}

/// One staged mutation inside a transaction.
#[derive(Debug, Clone)]
pub enum EntityChange {
    /// Insert or replace the record at its key.
    Put(Entity),
    /// Remove the record at the key if present.
    Delete(EntityKey),
}

/// Persistence contract consumed by tasks.
///
/// Implementations are shared behind an `Arc` and must be safe for
/// concurrent use. Names are unique only within a record's owning
/// parent, not across a kind, so name lookups are the caller's to
/// scope.
#[async_trait]
pub trait Store: Send + Sync {
    /// Loads one record by primary key.
    async fn load(&self, key: EntityKey) -> Option<Versioned>;

    /// Lists all records of one kind, ordered by id.
    async fn list(&self, kind: ObjectKind) -> Vec<Versioned>;

    /// Reserves a fresh primary key.
    ///
    /// # Errors
    /// Returns an error if the store cannot issue identifiers.
    async fn allocate_id(&self) -> Result<EntityId>;

    /// Applies `changes` atomically iff every version in `observed` is
    /// still current. An observed `None` asserts the record was absent.
    ///
    /// # Errors
    /// Returns [`Error::Conflict`] when a concurrent commit superseded an
    /// observed version; no change is applied in that case.
    async fn apply(
        &self,
        observed: &[(EntityKey, Option<u64>)],
        changes: Vec<EntityChange>,
    ) -> Result<()>;
}

/// In-memory store keyed by (kind, id), used by the engine and tests.
pub struct MemoryStore {
    records: RwLock<HashMap<EntityKey, Versioned>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts records at version 1 and reserves ids past the highest
    /// seeded one.
    pub async fn seed(&self, entities: Vec<Entity>) {
        let mut records = self.records.write().await;
        for entity in entities {
            self.next_id.fetch_max(entity.id().0 + 1, Ordering::SeqCst);
            records.insert(entity.key(), Versioned { entity, version: 1 });
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self, key: EntityKey) -> Option<Versioned> {
        self.records.read().await.get(&key).cloned()
    }

    async fn list(&self, kind: ObjectKind) -> Vec<Versioned> {
        let records = self.records.read().await;
        let mut found: Vec<Versioned> = records
            .values()
            .filter(|versioned| versioned.entity.kind() == kind)
            .cloned()
            .collect();
        found.sort_by_key(|versioned| versioned.entity.id());
        found
    }

    async fn allocate_id(&self) -> Result<EntityId> {
        Ok(EntityId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn apply(
        &self,
        observed: &[(EntityKey, Option<u64>)],
        changes: Vec<EntityChange>,
    ) -> Result<()> {
        let mut records = self.records.write().await;

        for (key, expected) in observed {
            let current = records.get(key).map(|versioned| versioned.version);
            if current != *expected {
                debug!(%key, ?expected, ?current, "commit rejected, record changed underneath");
                return Err(Error::Conflict(format!(
                    "{key} changed underneath the transaction"
                )));
            }
        }

        for change in changes {
            match change {
                EntityChange::Put(entity) => {
                    let key = entity.key();
                    let version = records.get(&key).map_or(1, |current| current.version + 1);
                    records.insert(key, Versioned { entity, version });
                }
                EntityChange::Delete(key) => {
                    records.remove(&key);
                }
            }
        }

        Ok(())
    }
}

/// Staged view over the store for one task execution.
///
/// Reads record the version this transaction depends on; writes stage
/// until [`commit`](Self::commit). Listing observes only the records it
/// returns, so concurrently inserted records do not conflict with it.
pub struct StoreTransaction {
    store: Arc<dyn Store>,
    observed: HashMap<EntityKey, Option<u64>>,
    staged: Vec<EntityChange>,
}

impl StoreTransaction {
    /// Opens a transaction with nothing observed or staged.
    #[must_use]
    pub fn begin(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            observed: HashMap::new(),
            staged: Vec::new(),
        }
    }

    /// Loads a record, recording the version the commit will assert.
    pub async fn load(&mut self, key: EntityKey) -> Option<Versioned> {
        let found = self.store.load(key).await;
        self.observe(key, found.as_ref());
        found
    }

    /// Loads a record that must exist.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if the key has no record.
    pub async fn load_required(&mut self, key: EntityKey) -> Result<Versioned> {
        self.load(key).await.ok_or(Error::NotFound(key))
    }

    /// Lists records of one kind, recording the returned versions.
    pub async fn list(&mut self, kind: ObjectKind) -> Vec<Versioned> {
        let found = self.store.list(kind).await;
        for versioned in &found {
            self.observe(versioned.entity.key(), Some(versioned));
        }
        found
    }

    /// Reserves a fresh primary key.
    ///
    /// # Errors
    /// Returns an error if the store cannot issue identifiers.
    pub async fn allocate_id(&self) -> Result<EntityId> {
        self.store.allocate_id().await
    }

    /// Stages an insert or replacement.
    pub fn put(&mut self, entity: Entity) {
        self.staged.push(EntityChange::Put(entity));
    }

    /// Stages a removal.
    pub fn delete(&mut self, key: EntityKey) {
        self.staged.push(EntityChange::Delete(key));
    }

    /// Applies every staged change atomically.
    ///
    /// # Errors
    /// Returns [`Error::Conflict`] when a concurrent commit superseded a
    /// version this transaction observed.
    pub async fn commit(self) -> Result<()> {
        let Self {
            store,
            observed,
            staged,
        } = self;
        if staged.is_empty() {
            return Ok(());
        }
        let observed: Vec<(EntityKey, Option<u64>)> = observed.into_iter().collect();
        store.apply(&observed, staged).await
    }

    fn observe(&mut self, key: EntityKey, found: Option<&Versioned>) {
        self.observed
            .entry(key)
            .or_insert(found.map(|versioned| versioned.version));
    }
}
