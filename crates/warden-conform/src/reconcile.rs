//! The diff skeleton shared by every conform pass.
//!
//! A pass lists one local record set and one remote record set, partitions
//! them by foreign identifier, and turns the partition into tasks. Which
//! side the tasks mutate depends on the direction of authority: push passes
//! write to the remote system, pull passes write to the local store. The
//! partition itself is direction-agnostic.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use warden_core::{Error as CoreError, ForeignId, Result as CoreResult};

/// Partition of a local and a remote record set by foreign identifier.
#[derive(Debug)]
pub struct MatchOutcome<L, R> {
    /// Pairs whose foreign identifiers line up; drift checks decide whether
    /// each pair needs an update.
    pub matched: Vec<(L, R)>,
    /// Local records with no remote counterpart, including records never
    /// synchronized (no foreign identifier yet).
    pub local_only: Vec<L>,
    /// Remote records no local record points at, in remote listing order.
    pub remote_only: Vec<R>,
}

/// Partitions `local` and `remote` by matching `local_id` against
/// `remote_id`.
///
/// A local record whose extractor returns `None` has never been
/// synchronized and lands in `local_only`.
#[must_use]
pub fn match_records<L, R>(
    local: Vec<L>,
    mut remote: Vec<R>,
    local_id: impl Fn(&L) -> Option<ForeignId>,
    remote_id: impl Fn(&R) -> ForeignId,
) -> MatchOutcome<L, R> {
    let mut matched = Vec::new();
    let mut local_only = Vec::new();

    for record in local {
        let Some(id) = local_id(&record) else {
            local_only.push(record);
            continue;
        };
        match remote.iter().position(|candidate| remote_id(candidate) == id) {
            Some(index) => matched.push((record, remote.remove(index))),
            None => local_only.push(record),
        }
    }

    MatchOutcome {
        matched,
        local_only,
        remote_only: remote,
    }
}

/// Runs one remote-system call under the configured deadline.
///
/// A call that outlives the deadline is cancelled and reported as a
/// retryable remote error, so a stuck external system cannot hold a worker
/// past its budget.
pub(crate) async fn remote_call<T>(
    system: &str,
    what: &str,
    limit: Duration,
    call: impl Future<Output = CoreResult<T>>,
) -> CoreResult<T> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_elapsed) => Err(CoreError::Remote {
            system: system.to_owned(),
            message: format!("{what} timed out after {}s", limit.as_secs()),
        }),
    }
}

/// Treats a delete whose target is already gone remotely as satisfied.
pub(crate) fn tolerate_missing(result: CoreResult<()>) -> CoreResult<()> {
    match result {
        Err(CoreError::RemoteMissing { system, id }) => {
            debug!(%system, %id, "delete target already absent, nothing to do");
            Ok(())
        }
        other => other,
    }
}
