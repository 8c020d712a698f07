//! Store - the transactional record storage both repositories run against.
//!
//! A store keeps rows in named tables. Every row has a store-assigned
//! [`RecordId`], a version counter and a JSON object of business fields.
//! Two kinds of writes are offered:
//!
//! - autocommit statements on the store itself (`insert`, `update_if_version`,
//!   `delete`), each atomic on its own;
//! - multi-statement [`Transaction`]s whose writes hold an exclusive row lock
//!   until `commit` or `rollback`.
//!
//! ## Example
//!
//! ```ignore
//! use concurrency_repos::{InMemoryStore, Store, Transaction};
//!
//! let store = InMemoryStore::new();
//! store.create_table("accounts")?;
//! let row = store.insert("accounts", fields)?;
//!
//! let mut tx = store.begin()?;
//! tx.lock_row("accounts", row.id)?;
//! tx.update("accounts", row.id, new_fields)?;
//! tx.commit()?;
//! ```

mod in_memory;
mod row_locks;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use in_memory::{InMemoryStore, InMemoryTransaction};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStore, SqliteTransaction};

/// Business fields of a row.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Store-assigned identity of a row. Ids are per table, start at 1 and are
/// never reused.
///
/// The ordering of ids is the global lock order: code that locks more than
/// one row must lock them in ascending id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl RecordId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        RecordId(id)
    }
}

/// A row as read from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: RecordId,
    pub version: u64,
    pub fields: Fields,
}

/// Store settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a write waits for a row lock held by another transaction
    /// before failing with [`StoreError::LockTimeout`].
    pub lock_timeout_ms: u64,
}

impl StoreConfig {
    pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: Self::DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

/// Error type for store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The table was never created.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Table names are restricted to ASCII letters, digits and underscores.
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    /// A row lock held by another transaction was not released in time.
    #[error("timed out after {waited:?} waiting for lock on {table}:{id}")]
    LockTimeout {
        table: String,
        id: RecordId,
        waited: Duration,
    },

    /// A std lock was poisoned by a panicking thread.
    #[error("store lock poisoned during {0}")]
    Poisoned(&'static str),

    /// Fields could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serde(String),

    /// Any other backend failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The transaction was already committed or rolled back.
    #[error("transaction already finished")]
    TransactionClosed,
}

impl StoreError {
    /// Lock contention, as opposed to a hard failure.
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}

/// Durable keyed record storage with atomic statements and transactions.
///
/// Implementations must be safe to share between threads; all mutual
/// exclusion between callers is provided here, never by the repositories.
pub trait Store: Send + Sync {
    /// The transaction type returned by [`Store::begin`].
    type Transaction: Transaction;

    /// Create a table if it does not exist yet.
    fn create_table(&self, table: &str) -> Result<(), StoreError>;

    /// Insert a row. The store assigns the id; the version starts at 1.
    fn insert(&self, table: &str, fields: Fields) -> Result<Row, StoreError>;

    /// Read the committed state of a row.
    fn get(&self, table: &str, id: RecordId) -> Result<Option<Row>, StoreError>;

    /// Replace the fields of a row and bump its version, but only if the stored
    /// version equals `expected_version`. Returns the number of rows affected
    /// (0 or 1). The check and the write are one indivisible step.
    fn update_if_version(
        &self,
        table: &str,
        id: RecordId,
        fields: Fields,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Delete a row. Returns true if it existed.
    fn delete(&self, table: &str, id: RecordId) -> Result<bool, StoreError>;

    /// Open a transaction.
    fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

/// A multi-statement transaction.
///
/// Row locks taken by `lock_row` or `update` are held until `commit` or
/// `rollback`. Dropping an unfinished transaction rolls it back.
pub trait Transaction: Send {
    /// Take the exclusive lock on a row with a write intent. Blocks while
    /// another transaction holds it. Returns false if the row does not exist.
    fn lock_row(&mut self, table: &str, id: RecordId) -> Result<bool, StoreError>;

    /// Read a row, including this transaction's own uncommitted writes.
    fn get(&mut self, table: &str, id: RecordId) -> Result<Option<Row>, StoreError>;

    /// Replace the fields of a row. Takes the row lock if not already held.
    /// Returns the number of rows affected (0 or 1).
    fn update(&mut self, table: &str, id: RecordId, fields: Fields) -> Result<u64, StoreError>;

    /// Apply all writes atomically and release every lock.
    fn commit(self) -> Result<(), StoreError>
    where
        Self: Sized;

    /// Discard all writes and release every lock.
    fn rollback(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

pub(crate) fn validate_table(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}
