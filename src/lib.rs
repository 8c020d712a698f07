mod config;
mod error;
mod locking;
mod model;
mod store;
mod versioned;

pub use config::{Config, ConfigError};
pub use error::RepositoryError;
pub use locking::{LockingExt, LockingRepository};
pub use model::{Balance, Model, Record, Versioned};
pub use store::{
    Fields, InMemoryStore, InMemoryTransaction, RecordId, Row, Store, StoreConfig, StoreError,
    Transaction,
};
#[cfg(feature = "sqlite")]
pub use store::{SqliteStore, SqliteTransaction};
pub use versioned::{RetryPolicy, VersionedExt, VersionedRepository};
