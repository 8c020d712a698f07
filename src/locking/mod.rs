//! Locking repository - pessimistic concurrency control.
//!
//! Conflicts are prevented instead of detected: a record is locked inside a
//! store transaction before it is read for mutation, and stays locked until
//! the transaction commits or rolls back.
//!
//! Lock order: whenever more than one record is locked in one transaction,
//! the locks are taken in ascending [`RecordId`](crate::RecordId) order no
//! matter which record the caller named first. Two transactions can then
//! never wait on each other in a cycle.
//!
//! ## Example
//!
//! ```ignore
//! let accounts = store.locking::<Account>()?;
//! let alice = accounts.create(&Account::new("Alice", 1000))?;
//! let bob = accounts.create(&Account::new("Bob", 500))?;
//!
//! accounts.transfer(alice.id, bob.id, 200)?;
//!
//! accounts.with_lock(bob.id, |tx, mut bob| {
//!     bob.data.name = "Robert".into();
//!     accounts.update(tx, &bob)
//! })?;
//! ```

mod repository;

pub use repository::{LockingExt, LockingRepository};
