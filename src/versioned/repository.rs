use std::marker::PhantomData;

use tracing::{debug, warn};

use super::RetryPolicy;
use crate::error::RepositoryError;
use crate::model::{encode, Model, Versioned};
use crate::store::{RecordId, Store};

/// Typed repository over a store, with version-checked updates.
///
/// Holds no state besides the store handle and the retry policy. Every read
/// goes to the store.
pub struct VersionedRepository<S, M> {
    store: S,
    policy: RetryPolicy,
    _marker: PhantomData<fn() -> M>,
}

impl<S: Store, M: Model> VersionedRepository<S, M> {
    /// Bind a repository to `store`, creating `M::TABLE` if needed.
    pub fn new(store: S) -> Result<Self, RepositoryError> {
        store
            .create_table(M::TABLE)
            .map_err(|e| RepositoryError::store("create_table", M::TABLE, None, e))?;
        Ok(Self {
            store,
            policy: RetryPolicy::default(),
            _marker: PhantomData,
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn table(&self) -> &'static str {
        M::TABLE
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Insert a new record at version 1. `model` is left untouched; the
    /// returned value carries the assigned id.
    pub fn create(&self, model: &M) -> Result<Versioned<M>, RepositoryError> {
        let row = self
            .store
            .insert(M::TABLE, encode(model)?)
            .map_err(|e| RepositoryError::store("create", M::TABLE, None, e))?;
        Ok(Versioned {
            id: row.id,
            version: row.version,
            data: model.clone(),
        })
    }

    /// Read the latest committed version of a record.
    pub fn find_by_id(&self, id: RecordId) -> Result<Versioned<M>, RepositoryError> {
        let row = self
            .store
            .get(M::TABLE, id)
            .map_err(|e| RepositoryError::store("find_by_id", M::TABLE, Some(id), e))?
            .ok_or(RepositoryError::NotFound {
                table: M::TABLE,
                id,
            })?;
        Versioned::from_row(row)
    }

    /// Write `record.data` if the stored version still equals
    /// `record.version`. On success the returned version is one higher.
    ///
    /// Fails with `Conflict` when another writer got there first. The
    /// caller's copy is stale after that and should be dropped.
    pub fn update(&self, record: &Versioned<M>) -> Result<Versioned<M>, RepositoryError> {
        let affected = self
            .store
            .update_if_version(M::TABLE, record.id, encode(&record.data)?, record.version)
            .map_err(|e| RepositoryError::store("update", M::TABLE, Some(record.id), e))?;

        if affected == 0 {
            // Only used to pick the error; the write itself already failed.
            let exists = self
                .store
                .get(M::TABLE, record.id)
                .map_err(|e| RepositoryError::store("update", M::TABLE, Some(record.id), e))?
                .is_some();
            if !exists {
                return Err(RepositoryError::NotFound {
                    table: M::TABLE,
                    id: record.id,
                });
            }
            debug!(table = M::TABLE, id = %record.id, version = record.version, "version conflict");
            return Err(RepositoryError::Conflict {
                table: M::TABLE,
                id: record.id,
                version: record.version,
            });
        }

        Ok(Versioned {
            id: record.id,
            version: record.version + 1,
            data: record.data.clone(),
        })
    }

    /// Read, apply `mutate`, and update, retrying from a fresh read on
    /// conflict.
    ///
    /// An error from `mutate` aborts at once and is returned unchanged, as is
    /// any error other than a conflict. When every attempt conflicts the
    /// result is `RetryExhausted`.
    pub fn safe_update<F, E>(&self, id: RecordId, mut mutate: F) -> Result<Versioned<M>, E>
    where
        F: FnMut(&mut M) -> Result<(), E>,
        E: From<RepositoryError>,
    {
        let attempts = self.policy.attempts();

        for attempt in 1..=attempts {
            let mut current = self.find_by_id(id)?;
            mutate(&mut current.data)?;

            match self.update(&current) {
                Ok(updated) => return Ok(updated),
                Err(RepositoryError::Conflict { version, .. }) if attempt < attempts => {
                    debug!(table = M::TABLE, %id, version, attempt, "retrying after conflict");
                }
                Err(RepositoryError::Conflict { .. }) => break,
                Err(err) => return Err(err.into()),
            }
        }

        warn!(table = M::TABLE, %id, attempts, "retries exhausted");
        Err(RepositoryError::RetryExhausted {
            table: M::TABLE,
            id,
            attempts,
        }
        .into())
    }
}

/// Extension trait for typed versioned access on any cloneable store.
pub trait VersionedExt: Store + Clone + Sized {
    /// Get a versioned repository for `M`, creating its table if needed.
    fn versioned<M: Model>(&self) -> Result<VersionedRepository<Self, M>, RepositoryError> {
        VersionedRepository::new(self.clone())
    }
}

impl<S: Store + Clone> VersionedExt for S {}
