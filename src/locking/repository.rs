use std::marker::PhantomData;

use tracing::{debug, warn};

use crate::error::RepositoryError;
use crate::model::{encode, Balance, Model, Record};
use crate::store::{RecordId, Store, Transaction};

/// Typed repository whose mutations run under exclusive row locks.
///
/// The repository keeps no locks of its own. Every lock lives in a store
/// transaction and is released by commit or rollback.
pub struct LockingRepository<S, M> {
    store: S,
    _marker: PhantomData<fn() -> M>,
}

impl<S: Store, M: Model> LockingRepository<S, M> {
    /// Bind a repository to `store`, creating `M::TABLE` if needed.
    pub fn new(store: S) -> Result<Self, RepositoryError> {
        store
            .create_table(M::TABLE)
            .map_err(|e| RepositoryError::store("create_table", M::TABLE, None, e))?;
        Ok(Self {
            store,
            _marker: PhantomData,
        })
    }

    pub fn table(&self) -> &'static str {
        M::TABLE
    }

    /// Access the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Open a transaction for a hand-built critical section. Pair with
    /// [`find_for_update`](Self::find_for_update) and [`update`](Self::update),
    /// then commit or roll back.
    pub fn begin(&self) -> Result<S::Transaction, RepositoryError> {
        self.store
            .begin()
            .map_err(|e| RepositoryError::store("begin", M::TABLE, None, e))
    }

    /// Insert a new record. `model` is left untouched; the returned value
    /// carries the assigned id.
    pub fn create(&self, model: &M) -> Result<Record<M>, RepositoryError> {
        let row = self
            .store
            .insert(M::TABLE, encode(model)?)
            .map_err(|e| RepositoryError::store("create", M::TABLE, None, e))?;
        Ok(Record {
            id: row.id,
            data: model.clone(),
        })
    }

    /// Unlocked read. The record may change as soon as this returns.
    pub fn find_by_id(&self, id: RecordId) -> Result<Record<M>, RepositoryError> {
        let row = self
            .store
            .get(M::TABLE, id)
            .map_err(|e| RepositoryError::store("find_by_id", M::TABLE, Some(id), e))?
            .ok_or(RepositoryError::NotFound {
                table: M::TABLE,
                id,
            })?;
        Record::from_row(row)
    }

    /// Lock a record inside `tx` and read it.
    ///
    /// Blocks while another transaction holds the lock. The returned state
    /// cannot change until `tx` ends.
    pub fn find_for_update(
        &self,
        tx: &mut S::Transaction,
        id: RecordId,
    ) -> Result<Record<M>, RepositoryError> {
        let not_found = RepositoryError::NotFound {
            table: M::TABLE,
            id,
        };

        let exists = tx
            .lock_row(M::TABLE, id)
            .map_err(|e| RepositoryError::store("find_for_update", M::TABLE, Some(id), e))?;
        if !exists {
            return Err(not_found);
        }

        let row = tx
            .get(M::TABLE, id)
            .map_err(|e| RepositoryError::store("find_for_update", M::TABLE, Some(id), e))?
            .ok_or(not_found)?;
        Record::from_row(row)
    }

    /// Lock several records inside `tx`, in ascending id order.
    ///
    /// Duplicate ids are locked once. The records come back sorted by id.
    pub fn find_all_for_update(
        &self,
        tx: &mut S::Transaction,
        ids: &[RecordId],
    ) -> Result<Vec<Record<M>>, RepositoryError> {
        let mut unique = ids.to_vec();
        unique.sort_unstable();
        unique.dedup();

        let mut records = Vec::with_capacity(unique.len());
        for id in unique {
            records.push(self.find_for_update(tx, id)?);
        }
        Ok(records)
    }

    /// Write a record inside `tx`. The lock should already be held through
    /// `find_for_update`.
    pub fn update(&self, tx: &mut S::Transaction, record: &Record<M>) -> Result<(), RepositoryError> {
        let affected = tx
            .update(M::TABLE, record.id, encode(&record.data)?)
            .map_err(|e| RepositoryError::store("update", M::TABLE, Some(record.id), e))?;
        if affected == 0 {
            return Err(RepositoryError::NotFound {
                table: M::TABLE,
                id: record.id,
            });
        }
        Ok(())
    }

    /// Run `f` on a locked record and commit.
    ///
    /// Any error, from the lock, from `f` or from the commit, rolls the
    /// transaction back before it is returned. A panic in `f` rolls back as
    /// the transaction is dropped.
    pub fn with_lock<T, E, F>(&self, id: RecordId, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut S::Transaction, Record<M>) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        self.in_transaction("with_lock", id, |tx| {
            let record = self.find_for_update(tx, id)?;
            f(tx, record)
        })
    }

    fn in_transaction<T, E, F>(&self, operation: &'static str, id: RecordId, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut S::Transaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut tx = self.begin()?;

        match body(&mut tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| RepositoryError::store("commit", M::TABLE, Some(id), e))?;
                debug!(table = M::TABLE, %id, operation, "committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    warn!(table = M::TABLE, %id, operation, error = %rollback, "rollback failed");
                }
                debug!(table = M::TABLE, %id, operation, "rolled back");
                Err(err)
            }
        }
    }
}

impl<S: Store, M: Model + Balance> LockingRepository<S, M> {
    /// Move `amount` from one record's balance to another's, atomically.
    ///
    /// Both records are locked in ascending id order whatever the direction,
    /// then the source balance is checked. Nothing is written unless both
    /// records exist and the source can cover the amount.
    pub fn transfer(
        &self,
        from: RecordId,
        to: RecordId,
        amount: i64,
    ) -> Result<(Record<M>, Record<M>), RepositoryError> {
        if from == to {
            return Err(RepositoryError::Validation(format!(
                "cannot transfer from {}:{} to itself",
                M::TABLE,
                from
            )));
        }
        if amount < 0 {
            return Err(RepositoryError::Validation(format!(
                "transfer amount must not be negative, got {}",
                amount
            )));
        }

        let result = self.in_transaction("transfer", from, |tx| {
            let (mut source, mut target) = if from < to {
                let source = self.find_for_update(tx, from)?;
                let target = self.find_for_update(tx, to)?;
                (source, target)
            } else {
                let target = self.find_for_update(tx, to)?;
                let source = self.find_for_update(tx, from)?;
                (source, target)
            };

            let balance = source.data.balance();
            if balance < amount {
                return Err(RepositoryError::InsufficientFunds {
                    table: M::TABLE,
                    id: from,
                    balance,
                    requested: amount,
                });
            }
            let credited = target.data.balance().checked_add(amount).ok_or_else(|| {
                RepositoryError::Validation(format!("balance of {}:{} would overflow", M::TABLE, to))
            })?;

            source.data.set_balance(balance - amount);
            target.data.set_balance(credited);
            self.update(tx, &source)?;
            self.update(tx, &target)?;
            Ok((source, target))
        });

        if result.is_ok() {
            debug!(table = M::TABLE, %from, %to, amount, "transfer committed");
        }
        result
    }
}

/// Extension trait for typed locking access on any cloneable store.
pub trait LockingExt: Store + Clone + Sized {
    /// Get a locking repository for `M`, creating its table if needed.
    fn locking<M: Model>(&self) -> Result<LockingRepository<Self, M>, RepositoryError> {
        LockingRepository::new(self.clone())
    }
}

impl<S: Store + Clone> LockingExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoreConfig};
    use serde::{Deserialize, Serialize};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Account {
        name: String,
        balance: i64,
    }

    impl Model for Account {
        const TABLE: &'static str = "accounts";
    }

    impl Balance for Account {
        fn balance(&self) -> i64 {
            self.balance
        }

        fn set_balance(&mut self, balance: i64) {
            self.balance = balance;
        }
    }

    fn account(name: &str, balance: i64) -> Account {
        Account {
            name: name.into(),
            balance,
        }
    }

    fn repo() -> LockingRepository<InMemoryStore, Account> {
        InMemoryStore::with_config(StoreConfig::default().with_lock_timeout(Duration::from_millis(50)))
            .locking::<Account>()
            .unwrap()
    }

    fn balance(repo: &LockingRepository<InMemoryStore, Account>, id: RecordId) -> i64 {
        repo.find_by_id(id).unwrap().data.balance
    }

    #[test]
    fn create_returns_fresh_copy() {
        let repo = repo();
        let input = account("Alice", 1000);
        let created = repo.create(&input).unwrap();

        assert_eq!(created.id, RecordId(1));
        assert_eq!(created.data, input);
        assert_eq!(repo.find_by_id(created.id).unwrap(), created);
    }

    #[test]
    fn find_for_update_missing_is_not_found() {
        let repo = repo();
        let mut tx = repo.begin().unwrap();
        assert!(repo.find_for_update(&mut tx, RecordId(9)).unwrap_err().is_not_found());
    }

    #[test]
    fn find_for_update_excludes_other_transactions() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 10)).unwrap();

        let mut holder = repo.begin().unwrap();
        repo.find_for_update(&mut holder, alice.id).unwrap();

        let mut other = repo.begin().unwrap();
        let err = repo.find_for_update(&mut other, alice.id).unwrap_err();
        assert!(matches!(err, RepositoryError::Lock { operation: "find_for_update", .. }));
    }

    #[test]
    fn find_all_for_update_sorts_and_dedups() {
        let repo = repo();
        let a = repo.create(&account("A", 1)).unwrap();
        let b = repo.create(&account("B", 2)).unwrap();
        let c = repo.create(&account("C", 3)).unwrap();

        let mut tx = repo.begin().unwrap();
        let records = repo
            .find_all_for_update(&mut tx, &[c.id, a.id, c.id, b.id])
            .unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn with_lock_commits() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 100)).unwrap();

        let returned = repo
            .with_lock(alice.id, |tx, mut record| {
                record.data.balance += 50;
                repo.update(tx, &record)?;
                Ok::<_, RepositoryError>(record.data.balance)
            })
            .unwrap();

        assert_eq!(returned, 150);
        assert_eq!(balance(&repo, alice.id), 150);
    }

    #[test]
    fn with_lock_rolls_back_on_error() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 100)).unwrap();

        let err = repo
            .with_lock(alice.id, |tx, mut record| {
                record.data.balance = 0;
                repo.update(tx, &record)?;
                Err::<(), _>(RepositoryError::Validation("rejected".into()))
            })
            .unwrap_err();

        assert!(err.is_validation());
        assert_eq!(balance(&repo, alice.id), 100);
        // The lock went with the rollback.
        repo.with_lock(alice.id, |_, _| Ok::<_, RepositoryError>(())).unwrap();
    }

    #[test]
    fn with_lock_rolls_back_on_panic() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 100)).unwrap();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            repo.with_lock(alice.id, |tx, mut record| {
                record.data.balance = 1;
                repo.update(tx, &record)?;
                if record.data.balance == 1 {
                    panic!("boom");
                }
                Ok::<_, RepositoryError>(())
            })
        }));

        assert!(outcome.is_err());
        assert_eq!(balance(&repo, alice.id), 100);
        repo.with_lock(alice.id, |_, _| Ok::<_, RepositoryError>(())).unwrap();
    }

    #[test]
    fn with_lock_missing_record() {
        let err = repo()
            .with_lock(RecordId(3), |_, _| Ok::<_, RepositoryError>(()))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn transfer_moves_balance() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 1000)).unwrap();
        let bob = repo.create(&account("Bob", 500)).unwrap();

        let (from, to) = repo.transfer(alice.id, bob.id, 200).unwrap();
        assert_eq!(from.data.balance, 800);
        assert_eq!(to.data.balance, 700);
        assert_eq!(balance(&repo, alice.id), 800);
        assert_eq!(balance(&repo, bob.id), 700);
    }

    #[test]
    fn transfer_in_descending_direction() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 1000)).unwrap();
        let bob = repo.create(&account("Bob", 1000)).unwrap();

        repo.transfer(alice.id, bob.id, 100).unwrap();
        repo.transfer(bob.id, alice.id, 50).unwrap();

        assert_eq!(balance(&repo, alice.id), 950);
        assert_eq!(balance(&repo, bob.id), 1050);
    }

    #[test]
    fn transfer_insufficient_funds_changes_nothing() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 100)).unwrap();
        let bob = repo.create(&account("Bob", 50)).unwrap();

        let err = repo.transfer(alice.id, bob.id, 200).unwrap_err();
        assert_eq!(
            err,
            RepositoryError::InsufficientFunds {
                table: "accounts",
                id: alice.id,
                balance: 100,
                requested: 200
            }
        );
        assert_eq!(balance(&repo, alice.id), 100);
        assert_eq!(balance(&repo, bob.id), 50);
    }

    #[test]
    fn transfer_to_missing_account_rolls_back() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 100)).unwrap();

        let err = repo.transfer(alice.id, RecordId(99), 10).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(balance(&repo, alice.id), 100);
        repo.with_lock(alice.id, |_, _| Ok::<_, RepositoryError>(())).unwrap();
    }

    #[test]
    fn transfer_rejects_self_and_negative_amounts() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 100)).unwrap();
        let bob = repo.create(&account("Bob", 0)).unwrap();

        assert!(repo.transfer(alice.id, alice.id, 10).unwrap_err().is_validation());
        assert!(repo.transfer(alice.id, bob.id, -10).unwrap_err().is_validation());
        assert_eq!(balance(&repo, alice.id), 100);
    }

    #[test]
    fn transfer_of_zero_is_allowed() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 0)).unwrap();
        let bob = repo.create(&account("Bob", 0)).unwrap();

        repo.transfer(alice.id, bob.id, 0).unwrap();
        assert_eq!(balance(&repo, alice.id), 0);
    }

    #[test]
    fn transfer_overflow_is_rejected() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 10)).unwrap();
        let bob = repo.create(&account("Bob", i64::MAX)).unwrap();

        assert!(repo.transfer(alice.id, bob.id, 10).unwrap_err().is_validation());
        assert_eq!(balance(&repo, alice.id), 10);
        assert_eq!(balance(&repo, bob.id), i64::MAX);
    }

    #[test]
    fn transfer_waits_out_lock_timeout_as_lock_error() {
        let repo = repo();
        let alice = repo.create(&account("Alice", 100)).unwrap();
        let bob = repo.create(&account("Bob", 100)).unwrap();

        let mut holder = repo.begin().unwrap();
        repo.find_for_update(&mut holder, bob.id).unwrap();

        let err = repo.transfer(alice.id, bob.id, 10).unwrap_err();
        assert!(matches!(err, RepositoryError::Lock { id, .. } if id == bob.id));
        holder.rollback().unwrap();

        assert_eq!(balance(&repo, alice.id), 100);
        repo.transfer(alice.id, bob.id, 10).unwrap();
        assert_eq!(balance(&repo, bob.id), 110);
    }
}
