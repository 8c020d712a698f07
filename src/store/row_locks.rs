use std::collections::HashMap;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use super::{RecordId, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct RowKey {
    pub table: String,
    pub id: RecordId,
}

impl RowKey {
    pub fn new(table: &str, id: RecordId) -> Self {
        RowKey {
            table: table.to_string(),
            id,
        }
    }
}

/// Exclusive row locks owned by transaction ids, backed by `Mutex` + `Condvar`.
///
/// A lock is re-entrant for its owner. Waiters are woken whenever any owner
/// releases, and re-check their own row.
pub(crate) struct RowLocks {
    owners: Mutex<HashMap<RowKey, u64>>,
    released: Condvar,
}

impl RowLocks {
    pub fn new() -> Self {
        RowLocks {
            owners: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    /// Block until `owner` holds the lock on `key`, or `timeout` elapses.
    ///
    /// Returns `Ok(true)` if the lock was newly taken and `Ok(false)` if
    /// `owner` already held it.
    pub fn acquire(&self, key: &RowKey, owner: u64, timeout: Duration) -> Result<bool, StoreError> {
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let mut owners = self
            .owners
            .lock()
            .map_err(|_| StoreError::Poisoned("row lock acquire"))?;

        loop {
            match owners.get(key) {
                None => {
                    owners.insert(key.clone(), owner);
                    return Ok(true);
                }
                Some(&holder) if holder == owner => return Ok(false),
                Some(_) => {}
            }

            owners = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let waited = now.duration_since(started);
                        warn!(table = %key.table, id = %key.id, ?waited, "row lock wait timed out");
                        return Err(StoreError::LockTimeout {
                            table: key.table.clone(),
                            id: key.id,
                            waited,
                        });
                    }
                    self.released
                        .wait_timeout(owners, deadline - now)
                        .map_err(|_| StoreError::Poisoned("row lock wait"))?
                        .0
                }
                None => self
                    .released
                    .wait(owners)
                    .map_err(|_| StoreError::Poisoned("row lock wait"))?,
            };
        }
    }

    /// Release one lock if `owner` holds it.
    pub fn release(&self, key: &RowKey, owner: u64) {
        self.release_all(std::iter::once(key), owner);
    }

    /// Release every listed lock held by `owner`.
    ///
    /// Never fails: a poisoned map is recovered so that a panicking
    /// transaction cannot leave rows locked forever.
    pub fn release_all<'a, I>(&self, keys: I, owner: u64)
    where
        I: IntoIterator<Item = &'a RowKey>,
    {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        let mut released = false;
        for key in keys {
            if owners.get(key) == Some(&owner) {
                owners.remove(key);
                released = true;
            }
        }
        drop(owners);
        if released {
            self.released.notify_all();
        }
    }

    #[cfg(test)]
    pub fn holder(&self, key: &RowKey) -> Option<u64> {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }
}
