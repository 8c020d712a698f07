//! SqliteStore - file-backed store on SQLite.
//!
//! Every statement and every transaction runs on its own connection, so
//! concurrent callers contend through SQLite's file locks exactly like
//! separate processes would. SQLite locks the whole database for writing;
//! `lock_row` still issues a row-scoped write intent, so the same calls work
//! unchanged on an engine with real row locks.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::trace;

use super::{validate_table, Fields, RecordId, Row, Store, StoreConfig, StoreError, Transaction};

fn sql_id(id: RecordId) -> Result<i64, StoreError> {
    i64::try_from(id.get()).map_err(|_| StoreError::Storage(format!("id {} out of range", id)))
}

fn encode(fields: &Fields) -> Result<String, StoreError> {
    serde_json::to_string(fields).map_err(|e| StoreError::Serde(e.to_string()))
}

fn decode(id: RecordId, fields: &str, version: i64) -> Result<Row, StoreError> {
    let fields: Fields = serde_json::from_str(fields).map_err(|e| StoreError::Serde(e.to_string()))?;
    let version = u64::try_from(version)
        .map_err(|_| StoreError::Storage(format!("row {} has invalid version {}", id, version)))?;
    Ok(Row {
        id,
        version,
        fields,
    })
}

/// Translate a SQLite error. Busy/locked on a known row becomes a lock
/// timeout; a missing table becomes `UnknownTable`.
fn map_err(err: rusqlite::Error, table: &str, id: Option<RecordId>, config: &StoreConfig) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            match id {
                Some(id) => StoreError::LockTimeout {
                    table: table.to_string(),
                    id,
                    waited: config.lock_timeout(),
                },
                None => StoreError::Storage(err.to_string()),
            }
        }
        rusqlite::Error::SqliteFailure(failure, Some(message))
            if failure.extended_code == rusqlite::ffi::SQLITE_ERROR
                && message.starts_with("no such table") =>
        {
            StoreError::UnknownTable(table.to_string())
        }
        _ => StoreError::Storage(err.to_string()),
    }
}

fn read_row(
    conn: &Connection,
    table: &str,
    id: RecordId,
    config: &StoreConfig,
) -> Result<Option<Row>, StoreError> {
    let found: Option<(String, i64)> = conn
        .query_row(
            &format!("SELECT fields, version FROM \"{}\" WHERE id = ?1", table),
            params![sql_id(id)?],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| map_err(e, table, Some(id), config))?;

    found
        .map(|(fields, version)| decode(id, &fields, version))
        .transpose()
}

/// Store backed by a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    config: StoreConfig,
}

impl SqliteStore {
    /// Open (or create) the database file with the default lock timeout.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            config,
        };
        store.connect()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path).map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.busy_timeout(self.config.lock_timeout())
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(conn)
    }
}

impl Store for SqliteStore {
    type Transaction = SqliteTransaction;

    fn create_table(&self, table: &str) -> Result<(), StoreError> {
        validate_table(table)?;
        let conn = self.connect()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fields TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1
            )",
            table
        ))
        .map_err(|e| map_err(e, table, None, &self.config))
    }

    fn insert(&self, table: &str, fields: Fields) -> Result<Row, StoreError> {
        validate_table(table)?;
        let conn = self.connect()?;
        conn.execute(
            &format!("INSERT INTO \"{}\" (fields, version) VALUES (?1, 1)", table),
            params![encode(&fields)?],
        )
        .map_err(|e| map_err(e, table, None, &self.config))?;

        let id = u64::try_from(conn.last_insert_rowid())
            .map_err(|_| StoreError::Storage("negative rowid".into()))?;
        Ok(Row {
            id: RecordId(id),
            version: 1,
            fields,
        })
    }

    fn get(&self, table: &str, id: RecordId) -> Result<Option<Row>, StoreError> {
        validate_table(table)?;
        read_row(&self.connect()?, table, id, &self.config)
    }

    fn update_if_version(
        &self,
        table: &str,
        id: RecordId,
        fields: Fields,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        validate_table(table)?;
        let expected = i64::try_from(expected_version)
            .map_err(|_| StoreError::Storage(format!("version {} out of range", expected_version)))?;
        let conn = self.connect()?;
        let affected = conn
            .execute(
                &format!(
                    "UPDATE \"{}\" SET fields = ?1, version = version + 1 WHERE id = ?2 AND version = ?3",
                    table
                ),
                params![encode(&fields)?, sql_id(id)?, expected],
            )
            .map_err(|e| map_err(e, table, Some(id), &self.config))?;
        Ok(affected as u64)
    }

    fn delete(&self, table: &str, id: RecordId) -> Result<bool, StoreError> {
        validate_table(table)?;
        let conn = self.connect()?;
        let affected = conn
            .execute(&format!("DELETE FROM \"{}\" WHERE id = ?1", table), params![sql_id(id)?])
            .map_err(|e| map_err(e, table, Some(id), &self.config))?;
        Ok(affected > 0)
    }

    fn begin(&self) -> Result<SqliteTransaction, StoreError> {
        let conn = self.connect()?;
        conn.execute_batch("BEGIN")
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        trace!(path = %self.path.display(), "begin");
        Ok(SqliteTransaction {
            conn,
            config: self.config,
            locked: BTreeSet::new(),
            finished: false,
        })
    }
}

/// Transaction on its own SQLite connection.
pub struct SqliteTransaction {
    conn: Connection,
    config: StoreConfig,
    locked: BTreeSet<(String, RecordId)>,
    finished: bool,
}

impl SqliteTransaction {
    fn check_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::TransactionClosed)
        } else {
            Ok(())
        }
    }

    /// Run `COMMIT` or `ROLLBACK`. Busy/locked errors are reported against
    /// the lowest row this transaction locked, so they surface as lock
    /// timeouts like any other wait.
    fn end(&mut self, statement: &str) -> Result<(), StoreError> {
        self.finished = true;
        let result = self.conn.execute_batch(statement).map_err(|e| {
            match self.locked.iter().next() {
                Some((table, id)) => map_err(e, table, Some(*id), &self.config),
                None => map_err(e, "", None, &self.config),
            }
        });
        self.locked.clear();
        result
    }
}

impl Transaction for SqliteTransaction {
    fn lock_row(&mut self, table: &str, id: RecordId) -> Result<bool, StoreError> {
        self.check_open()?;
        validate_table(table)?;
        // Write intent: a no-op update takes the write lock for this row.
        let affected = self
            .conn
            .execute(
                &format!("UPDATE \"{}\" SET version = version WHERE id = ?1", table),
                params![sql_id(id)?],
            )
            .map_err(|e| map_err(e, table, Some(id), &self.config))?;
        if affected > 0 {
            self.locked.insert((table.to_string(), id));
        }
        Ok(affected > 0)
    }

    fn get(&mut self, table: &str, id: RecordId) -> Result<Option<Row>, StoreError> {
        self.check_open()?;
        validate_table(table)?;
        read_row(&self.conn, table, id, &self.config)
    }

    fn update(&mut self, table: &str, id: RecordId, fields: Fields) -> Result<u64, StoreError> {
        self.check_open()?;
        validate_table(table)?;
        let affected = self
            .conn
            .execute(
                &format!("UPDATE \"{}\" SET fields = ?1, version = version + 1 WHERE id = ?2", table),
                params![encode(&fields)?, sql_id(id)?],
            )
            .map_err(|e| map_err(e, table, Some(id), &self.config))?;
        if affected > 0 {
            self.locked.insert((table.to_string(), id));
        }
        Ok(affected as u64)
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.check_open()?;
        trace!(rows = self.locked.len(), "commit");
        let result = self.end("COMMIT");
        if result.is_err() {
            // A failed COMMIT can leave the transaction open.
            let _ = self.conn.execute_batch("ROLLBACK");
        }
        result
    }

    fn rollback(mut self) -> Result<(), StoreError> {
        self.check_open()?;
        trace!(rows = self.locked.len(), "rollback");
        self.end("ROLLBACK")
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            trace!(rows = self.locked.len(), "rollback on drop");
            let _ = self.end("ROLLBACK");
        }
    }
}
