use thiserror::Error;

use crate::store::{RecordId, StoreError};

/// Error type for repository operations.
///
/// Store failures are wrapped with the operation, table and id they happened
/// on. Lock failures get their own variant so callers can decide to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// The record does not exist.
    #[error("{table}:{id} not found")]
    NotFound { table: &'static str, id: RecordId },

    /// A conditional update saw a different version than the caller's.
    #[error("concurrent modification detected for {table}:{id} (version {version} is stale)")]
    Conflict {
        table: &'static str,
        id: RecordId,
        version: u64,
    },

    /// Every attempt of a retrying update ran into a conflict.
    #[error("failed to update {table}:{id} after {attempts} attempts due to concurrent modifications")]
    RetryExhausted {
        table: &'static str,
        id: RecordId,
        attempts: u32,
    },

    /// A business rule rejected the change.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A transfer would take a balance below zero.
    #[error("insufficient balance in {table}:{id}: have {balance}, need {requested}")]
    InsufficientFunds {
        table: &'static str,
        id: RecordId,
        balance: i64,
        requested: i64,
    },

    /// An exclusive lock could not be acquired or kept.
    #[error("failed to acquire lock on {table}:{id} during {operation}: {source}")]
    Lock {
        operation: &'static str,
        table: &'static str,
        id: RecordId,
        #[source]
        source: StoreError,
    },

    /// Any other store failure.
    #[error("{operation} failed on {table}: {source}")]
    Store {
        operation: &'static str,
        table: &'static str,
        id: Option<RecordId>,
        #[source]
        source: StoreError,
    },

    /// A record could not be encoded or decoded.
    #[error("failed to encode {table} record: {message}")]
    Serde { table: &'static str, message: String },
}

impl RepositoryError {
    /// Wrap a store error with its context. Lock failures on a known row
    /// become [`RepositoryError::Lock`].
    pub(crate) fn store(
        operation: &'static str,
        table: &'static str,
        id: Option<RecordId>,
        source: StoreError,
    ) -> Self {
        match id {
            Some(id) if source.is_lock_failure() => RepositoryError::Lock {
                operation,
                table,
                id,
                source,
            },
            _ => RepositoryError::Store {
                operation,
                table,
                id,
                source,
            },
        }
    }

    /// Conflicts and lock failures may succeed when tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RepositoryError::Conflict { .. } | RepositoryError::Lock { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RepositoryError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict { .. })
    }

    /// Business-rule violations. Never worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RepositoryError::Validation(_) | RepositoryError::InsufficientFunds { .. }
        )
    }
}
