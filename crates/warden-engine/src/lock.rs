//! Shared/exclusive locking over object references.
//!
//! The registry serializes jobs whose lock scopes intersect. Locks have no
//! implicit expiry; release is the holder's obligation and normally rides
//! on an [`UnlockTask`] wired with an on-completion guard so it happens
//! whatever the job's outcome.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout_at};
use tracing::debug;
use uuid::Uuid;

use warden_core::ObjectRef;
use warden_core::Result as CoreResult;

use crate::error::{EngineError, Result};
use crate::task::{Task, TaskContext};

/// Lock modes over an object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Many holders may coexist.
    Shared,
    /// One holder excludes all others.
    Exclusive,
}

/// Identifies a lock-holding actor; the engine mints one per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(Uuid);

impl Default for OwnerId {
    fn default() -> Self {
        Self(Uuid::new_v4())
    }
}

impl OwnerId {
    /// Mints a fresh owner identity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// What a caller asks to lock and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// The reference to lock.
    pub reference: ObjectRef,
    /// Requested mode.
    pub mode: LockMode,
}

impl LockRequest {
    /// Requests `reference` in shared mode.
    #[must_use]
    pub fn shared(reference: ObjectRef) -> Self {
        Self {
            reference,
            mode: LockMode::Shared,
        }
    }

    /// Requests `reference` in exclusive mode.
    #[must_use]
    pub fn exclusive(reference: ObjectRef) -> Self {
        Self {
            reference,
            mode: LockMode::Exclusive,
        }
    }
}

/// Grant over one reference; consumed by release so it releases once.
#[derive(Debug)]
pub struct LockHandle {
    owner: OwnerId,
    reference: ObjectRef,
}

impl LockHandle {
    /// The reference this grant covers.
    #[must_use]
    pub fn reference(&self) -> &ObjectRef {
        &self.reference
    }

    /// The owner the grant belongs to.
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

/// Snapshot of one reference's lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockInfo {
    /// Granted mode.
    pub mode: LockMode,
    /// Number of concurrent holders.
    pub holders: usize,
}

/// Registry of shared/exclusive locks keyed by object reference.
///
/// Injected wherever locking is needed so tests can substitute their own
/// implementation.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Attempts one acquisition without waiting.
    ///
    /// Grants to an owner already holding the reference never block; the
    /// held mode becomes the stronger of the held and requested modes.
    ///
    /// # Errors
    /// Returns [`EngineError::LockContention`] if another owner holds the
    /// reference incompatibly.
    async fn try_acquire(&self, owner: OwnerId, request: &LockRequest) -> Result<LockHandle>;

    /// Acquires, waiting up to `wait` for incompatible holders to leave.
    ///
    /// # Errors
    /// Returns [`EngineError::LockContention`] once `wait` elapses.
    async fn acquire(
        &self,
        owner: OwnerId,
        request: &LockRequest,
        wait: Duration,
    ) -> Result<LockHandle>;

    /// Acquires every request or nothing, in canonical (kind, id) order.
    ///
    /// Duplicate references collapse into one grant holding the stronger
    /// mode. The wait budget spans the whole sequence.
    ///
    /// # Errors
    /// Returns the first contention error after releasing every grant the
    /// call had already made.
    async fn acquire_all(
        &self,
        owner: OwnerId,
        requests: &[LockRequest],
        wait: Duration,
    ) -> Result<Vec<LockHandle>>;

    /// Raises a shared grant to exclusive, waiting up to `wait` for the
    /// other readers to leave. Upgrading an already exclusive grant is a
    /// no-op that never blocks.
    ///
    /// # Errors
    /// Returns [`EngineError::LockNotHeld`] if the handle's owner holds
    /// nothing, or [`EngineError::LockContention`] once `wait` elapses.
    async fn upgrade(&self, handle: &LockHandle, wait: Duration) -> Result<()>;

    /// Lowers an exclusive grant to shared; never blocks. Downgrading an
    /// already shared grant is a no-op.
    ///
    /// # Errors
    /// Returns [`EngineError::LockNotHeld`] if the handle's owner holds
    /// nothing.
    async fn downgrade(&self, handle: &LockHandle) -> Result<()>;

    /// Releases one grant.
    async fn release(&self, handle: LockHandle);

    /// Snapshot of the lock state of one reference.
    async fn inspect(&self, reference: &ObjectRef) -> Option<LockInfo>;
}

struct LockEntry {
    mode: LockMode,
    holders: HashSet<OwnerId>,
}

type LockTable = HashMap<ObjectRef, LockEntry>;

/// Process-wide lock registry backed by a single table.
///
/// Waiters are woken together on every release and re-race the table;
/// fairness is whoever rechecks first, which the engine's properties do
/// not depend on.
#[derive(Default)]
pub struct ObjectLockManager {
    table: Mutex<LockTable>,
    released: Notify,
}

impl ObjectLockManager {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn grant(
        table: &mut LockTable,
        owner: OwnerId,
        request: &LockRequest,
    ) -> StdResult<LockHandle, LockMode> {
        let handle = LockHandle {
            owner,
            reference: request.reference.clone(),
        };
        match table.get_mut(&request.reference) {
            None => {
                table.insert(
                    request.reference.clone(),
                    LockEntry {
                        mode: request.mode,
                        holders: HashSet::from([owner]),
                    },
                );
                Ok(handle)
            }
            Some(entry) => {
                let sole_holder = entry.holders.len() == 1 && entry.holders.contains(&owner);
                if sole_holder {
                    if request.mode == LockMode::Exclusive {
                        entry.mode = LockMode::Exclusive;
                    }
                    Ok(handle)
                } else if entry.mode == LockMode::Shared && request.mode == LockMode::Shared {
                    entry.holders.insert(owner);
                    Ok(handle)
                } else {
                    Err(entry.mode)
                }
            }
        }
    }

    async fn acquire_until(
        &self,
        owner: OwnerId,
        request: &LockRequest,
        deadline: Instant,
    ) -> Result<LockHandle> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            let held = {
                let mut table = self.table.lock().await;
                match Self::grant(&mut table, owner, request) {
                    Ok(handle) => return Ok(handle),
                    Err(held) => {
                        // Register for the wakeup before the table unlocks
                        // so a release cannot slip past unseen.
                        notified.as_mut().enable();
                        held
                    }
                }
            };
            if timeout_at(deadline, notified).await.is_err() {
                debug!(reference = %request.reference, wanted = ?request.mode, ?held, "lock wait timed out");
                return Err(EngineError::LockContention {
                    reference: request.reference.clone(),
                    wanted: request.mode,
                    held,
                });
            }
        }
    }
}

#[async_trait]
impl LockManager for ObjectLockManager {
    async fn try_acquire(&self, owner: OwnerId, request: &LockRequest) -> Result<LockHandle> {
        let mut table = self.table.lock().await;
        Self::grant(&mut table, owner, request).map_err(|held| EngineError::LockContention {
            reference: request.reference.clone(),
            wanted: request.mode,
            held,
        })
    }

    async fn acquire(
        &self,
        owner: OwnerId,
        request: &LockRequest,
        wait: Duration,
    ) -> Result<LockHandle> {
        self.acquire_until(owner, request, Instant::now() + wait).await
    }

    async fn acquire_all(
        &self,
        owner: OwnerId,
        requests: &[LockRequest],
        wait: Duration,
    ) -> Result<Vec<LockHandle>> {
        let mut ordered: Vec<LockRequest> = Vec::with_capacity(requests.len());
        let mut sorted = requests.to_vec();
        sorted.sort_by(|left, right| left.reference.cmp(&right.reference));
        for request in sorted {
            match ordered.last_mut() {
                Some(previous) if previous.reference == request.reference => {
                    if request.mode == LockMode::Exclusive {
                        previous.mode = LockMode::Exclusive;
                    }
                }
                _ => ordered.push(request),
            }
        }

        let deadline = Instant::now() + wait;
        let mut handles = Vec::with_capacity(ordered.len());
        for request in &ordered {
            match self.acquire_until(owner, request, deadline).await {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    for handle in handles {
                        self.release(handle).await;
                    }
                    return Err(error);
                }
            }
        }
        Ok(handles)
    }

    async fn upgrade(&self, handle: &LockHandle, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            {
                let mut table = self.table.lock().await;
                let Some(entry) = table.get_mut(&handle.reference) else {
                    return Err(EngineError::LockNotHeld {
                        reference: handle.reference.clone(),
                    });
                };
                if !entry.holders.contains(&handle.owner) {
                    return Err(EngineError::LockNotHeld {
                        reference: handle.reference.clone(),
                    });
                }
                if entry.mode == LockMode::Exclusive {
                    return Ok(());
                }
                if entry.holders.len() == 1 {
                    entry.mode = LockMode::Exclusive;
                    return Ok(());
                }
                notified.as_mut().enable();
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(EngineError::LockContention {
                    reference: handle.reference.clone(),
                    wanted: LockMode::Exclusive,
                    held: LockMode::Shared,
                });
            }
        }
    }

    async fn downgrade(&self, handle: &LockHandle) -> Result<()> {
        let mut table = self.table.lock().await;
        let Some(entry) = table.get_mut(&handle.reference) else {
            return Err(EngineError::LockNotHeld {
                reference: handle.reference.clone(),
            });
        };
        if !entry.holders.contains(&handle.owner) {
            return Err(EngineError::LockNotHeld {
                reference: handle.reference.clone(),
            });
        }
        entry.mode = LockMode::Shared;
        drop(table);
        self.released.notify_waiters();
        Ok(())
    }

    async fn release(&self, handle: LockHandle) {
        let mut table = self.table.lock().await;
        let emptied = if let Some(entry) = table.get_mut(&handle.reference) {
            entry.holders.remove(&handle.owner);
            entry.holders.is_empty()
        } else {
            debug!(reference = %handle.reference, "release of a lock that is not held");
            false
        };
        if emptied {
            table.remove(&handle.reference);
        }
        drop(table);
        self.released.notify_waiters();
    }

    async fn inspect(&self, reference: &ObjectRef) -> Option<LockInfo> {
        self.table.lock().await.get(reference).map(|entry| LockInfo {
            mode: entry.mode,
            holders: entry.holders.len(),
        })
    }
}

/// Terminal cleanup task that releases a job's grants.
///
/// Executing twice is harmless; the second pass finds nothing left.
pub struct UnlockTask {
    manager: Arc<dyn LockManager>,
    handles: Mutex<Vec<LockHandle>>,
}

impl UnlockTask {
    /// Creates the cleanup task for a job's grants.
    #[must_use]
    pub fn new(manager: Arc<dyn LockManager>, handles: Vec<LockHandle>) -> Self {
        Self {
            manager,
            handles: Mutex::new(handles),
        }
    }
}

#[async_trait]
impl Task for UnlockTask {
    fn name(&self) -> String {
        "release locks".to_owned()
    }

    async fn execute(&self, _ctx: &TaskContext) -> CoreResult<()> {
        let handles: Vec<LockHandle> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            debug!(reference = %handle.reference(), "releasing lock");
            self.manager.release(handle).await;
        }
        Ok(())
    }
}
