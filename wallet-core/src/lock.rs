//! Per-owner row locks
//!
//! The lock table is the pessimistic-locking analogue of a database
//! `SELECT ... FOR UPDATE`: one exclusive async mutex per owner, held for
//! the duration of a mutation. Waiters block (they do not fail) until the
//! holder releases, bounded by the configured wait budget. Locks for
//! different owners never contend.
//!
//! Table entries are pruned once no holder or waiter references them, so
//! the map stays proportional to the set of owners currently mutating,
//! not to every owner ever seen.

use crate::error::{Error, Result};
use crate::types::OwnerId;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = Arc<DashMap<OwnerId, Arc<Mutex<()>>>>;

/// Lock table keyed by owner
pub struct RowLocks {
    locks: LockTable,
}

/// Exclusive hold on one owner's row; released on drop
#[derive(Debug)]
pub struct RowGuard {
    guard: Option<OwnedMutexGuard<()>>,
    owner_id: OwnerId,
    table: LockTable,
}

impl Drop for RowGuard {
    fn drop(&mut self) {
        // Release the mutex (and its Arc clone) before the prune check
        drop(self.guard.take());
        prune(&self.table, &self.owner_id);
    }
}

/// Drop the table entry if only the table itself still references it
///
/// `remove_if` holds the shard write lock, so no new clone can be taken
/// while the strong count is inspected; a count of 1 means no holder and
/// no waiter.
fn prune(table: &LockTable, owner_id: &OwnerId) {
    table.remove_if(owner_id, |_, lock| Arc::strong_count(lock) == 1);
}

impl RowLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Acquire the exclusive lock for `owner_id`, waiting at most `wait`
    ///
    /// Expiry of the wait budget aborts with `LockTimeout`; nothing is
    /// held afterwards and the caller may retry.
    pub async fn acquire(&self, owner_id: &OwnerId, wait: Duration) -> Result<RowGuard> {
        let lock = self
            .locks
            .entry(owner_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(wait, lock.lock_owned()).await {
            Ok(guard) => Ok(RowGuard {
                guard: Some(guard),
                owner_id: owner_id.clone(),
                table: self.locks.clone(),
            }),
            Err(_) => {
                // The dropped future released our Arc clone already
                prune(&self.locks, owner_id);
                tracing::warn!(owner_id = %owner_id, wait_ms = wait.as_millis() as u64, "Row lock wait timed out");
                Err(Error::LockTimeout(owner_id.to_string()))
            }
        }
    }
}

impl Default for RowLocks {
    fn default() -> Self {
        Self::new()
    }
}
