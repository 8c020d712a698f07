//! Versioned repository - optimistic concurrency control.
//!
//! Writers are detected, not prevented. Every record carries a version; an
//! update is a single conditional write that only applies when the stored
//! version still equals the caller's, and bumps it by one. A caller that
//! loses the race gets [`RepositoryError::Conflict`](crate::RepositoryError::Conflict)
//! and must re-read. [`VersionedRepository::safe_update`] does the re-read and
//! retry for you, up to [`RetryPolicy::max_attempts`] times.
//!
//! ## Example
//!
//! ```ignore
//! let products = store.versioned::<Product>()?;
//! let widget = products.create(&Product::new("Widget", 100))?;
//!
//! let updated = products.safe_update(widget.id, |p| {
//!     p.quantity -= 10;
//!     Ok::<_, RepositoryError>(())
//! })?;
//! assert_eq!(updated.version, 2);
//! ```

mod repository;

use serde::{Deserialize, Serialize};

pub use repository::{VersionedExt, VersionedRepository};

/// How many times `safe_update` tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// A single attempt, no retry.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1 }
    }

    /// Attempts actually made; zero is treated as one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
        }
    }
}
