//! InMemoryStore - HashMap-backed transactional store for tests and embedding.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::trace;

use super::row_locks::{RowKey, RowLocks};
use super::{validate_table, Fields, RecordId, Row, Store, StoreConfig, StoreError, Transaction};

/// Internal stored representation of a row.
struct StoredRow {
    fields: Fields,
    version: u64,
}

#[derive(Default)]
struct Table {
    last_id: u64,
    rows: BTreeMap<RecordId, StoredRow>,
}

struct Shared {
    tables: RwLock<HashMap<String, Table>>,
    locks: RowLocks,
    next_owner: AtomicU64,
    config: StoreConfig,
}

impl Shared {
    fn next_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Poisoned("table lookup"))?;
        if tables.contains_key(table) {
            Ok(())
        } else {
            Err(StoreError::UnknownTable(table.to_string()))
        }
    }

    fn read_row(&self, table: &str, id: RecordId) -> Result<Option<Row>, StoreError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StoreError::Poisoned("read"))?;
        let table = tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        Ok(table.rows.get(&id).map(|stored| Row {
            id,
            version: stored.version,
            fields: stored.fields.clone(),
        }))
    }
}

/// In-memory store with row-level write locks.
///
/// Clone-friendly via Arc: clones share tables and locks, so a clone can be
/// handed to every repository and thread. Each `new()` is an isolated store.
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a new empty store with the default lock timeout.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(HashMap::new()),
                locks: RowLocks::new(),
                next_owner: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> StoreConfig {
        self.shared.config
    }

    /// Run a single-row autocommit write while holding that row's lock, so it
    /// waits for any transaction that has the row locked.
    fn with_statement_lock<T>(
        &self,
        table: &str,
        id: RecordId,
        write: impl FnOnce(&mut Table) -> T,
    ) -> Result<T, StoreError> {
        self.shared.ensure_table(table)?;
        let key = RowKey::new(table, id);
        let owner = self.shared.next_owner();
        self.shared
            .locks
            .acquire(&key, owner, self.shared.config.lock_timeout())?;

        let result = self
            .shared
            .tables
            .write()
            .map_err(|_| StoreError::Poisoned("write"))
            .and_then(|mut tables| {
                tables
                    .get_mut(table)
                    .map(write)
                    .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
            });

        self.shared.locks.release(&key, owner);
        result
    }
}

impl Store for InMemoryStore {
    type Transaction = InMemoryTransaction;

    fn create_table(&self, table: &str) -> Result<(), StoreError> {
        validate_table(table)?;
        let mut tables = self
            .shared
            .tables
            .write()
            .map_err(|_| StoreError::Poisoned("create table"))?;
        tables.entry(table.to_string()).or_default();
        Ok(())
    }

    fn insert(&self, table: &str, fields: Fields) -> Result<Row, StoreError> {
        let mut tables = self
            .shared
            .tables
            .write()
            .map_err(|_| StoreError::Poisoned("insert"))?;
        let stored = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        stored.last_id += 1;
        let id = RecordId(stored.last_id);
        stored.rows.insert(
            id,
            StoredRow {
                fields: fields.clone(),
                version: 1,
            },
        );

        Ok(Row {
            id,
            version: 1,
            fields,
        })
    }

    fn get(&self, table: &str, id: RecordId) -> Result<Option<Row>, StoreError> {
        self.shared.read_row(table, id)
    }

    fn update_if_version(
        &self,
        table: &str,
        id: RecordId,
        fields: Fields,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.with_statement_lock(table, id, |stored| match stored.rows.get_mut(&id) {
            Some(row) if row.version == expected_version => {
                row.fields = fields;
                row.version += 1;
                1
            }
            _ => 0,
        })
    }

    fn delete(&self, table: &str, id: RecordId) -> Result<bool, StoreError> {
        self.with_statement_lock(table, id, |stored| stored.rows.remove(&id).is_some())
    }

    fn begin(&self) -> Result<InMemoryTransaction, StoreError> {
        let owner = self.shared.next_owner();
        trace!(tx = owner, "begin");
        Ok(InMemoryTransaction {
            owner,
            shared: Arc::clone(&self.shared),
            held: BTreeSet::new(),
            writes: BTreeMap::new(),
            finished: false,
        })
    }
}

/// Transaction over an [`InMemoryStore`].
///
/// Writes are buffered until commit. Other readers see the committed state
/// only; other writers block on the row locks this transaction holds.
pub struct InMemoryTransaction {
    owner: u64,
    shared: Arc<Shared>,
    held: BTreeSet<RowKey>,
    writes: BTreeMap<RowKey, Fields>,
    finished: bool,
}

impl InMemoryTransaction {
    /// Row locks currently held, in ascending (table, id) order.
    pub fn locked_rows(&self) -> Vec<(String, RecordId)> {
        self.held
            .iter()
            .map(|key| (key.table.clone(), key.id))
            .collect()
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::TransactionClosed)
        } else {
            Ok(())
        }
    }

    /// Take the row lock and confirm the row exists. A lock taken here for a
    /// missing row is given back.
    fn lock_existing(&mut self, table: &str, id: RecordId) -> Result<bool, StoreError> {
        self.check_open()?;
        self.shared.ensure_table(table)?;

        let key = RowKey::new(table, id);
        let newly = self
            .shared
            .locks
            .acquire(&key, self.owner, self.shared.config.lock_timeout())?;

        let exists = match self.shared.read_row(table, id) {
            Ok(row) => row.is_some(),
            Err(err) => {
                if newly {
                    self.shared.locks.release(&key, self.owner);
                }
                return Err(err);
            }
        };

        if exists {
            self.held.insert(key);
        } else if newly {
            self.shared.locks.release(&key, self.owner);
        }
        Ok(exists)
    }

    fn finish(&mut self) {
        self.writes.clear();
        self.shared.locks.release_all(self.held.iter(), self.owner);
        self.held.clear();
        self.finished = true;
    }
}

impl Transaction for InMemoryTransaction {
    fn lock_row(&mut self, table: &str, id: RecordId) -> Result<bool, StoreError> {
        self.lock_existing(table, id)
    }

    fn get(&mut self, table: &str, id: RecordId) -> Result<Option<Row>, StoreError> {
        self.check_open()?;
        let committed = self.shared.read_row(table, id)?;
        let pending = self.writes.get(&RowKey::new(table, id));
        Ok(match (committed, pending) {
            (Some(row), Some(fields)) => Some(Row {
                fields: fields.clone(),
                ..row
            }),
            (committed, _) => committed,
        })
    }

    fn update(&mut self, table: &str, id: RecordId, fields: Fields) -> Result<u64, StoreError> {
        if !self.lock_existing(table, id)? {
            return Ok(0);
        }
        self.writes.insert(RowKey::new(table, id), fields);
        Ok(1)
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.check_open()?;
        let writes = std::mem::take(&mut self.writes);

        let applied = self
            .shared
            .tables
            .write()
            .map_err(|_| StoreError::Poisoned("commit"))
            .and_then(|mut tables| {
                // Locked rows cannot be deleted by others, so a missing row
                // here means the store itself is inconsistent.
                for key in writes.keys() {
                    let present = tables
                        .get(&key.table)
                        .map(|table| table.rows.contains_key(&key.id))
                        .unwrap_or(false);
                    if !present {
                        return Err(StoreError::Storage(format!(
                            "locked row {}:{} vanished before commit",
                            key.table, key.id
                        )));
                    }
                }
                for (key, fields) in writes {
                    if let Some(row) = tables
                        .get_mut(&key.table)
                        .and_then(|table| table.rows.get_mut(&key.id))
                    {
                        row.fields = fields;
                        row.version += 1;
                    }
                }
                Ok(())
            });

        trace!(tx = self.owner, ok = applied.is_ok(), "commit");
        self.finish();
        applied
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.check_open()?;
        trace!(tx = self.owner, "rollback");
        self.finish();
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            trace!(tx = self.owner, "rollback on drop");
            self.finish();
        }
    }
}
