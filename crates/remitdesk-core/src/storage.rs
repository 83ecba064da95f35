use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Condvar, Mutex,
};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{
    write::{CreateStaffCommand, NewCustomerTransaction, NewDeposit, NewExpense, NewTransfer},
    Currency, CustomerTransaction, RateSet, Staff, StaffDeposit, StaffExpense, StaffTransfer,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Other(String),
    #[error("staff not found: {0}")]
    StaffNotFound(String),
    #[error("staff already exists: {0}")]
    StaffAlreadyExists(String),
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("{currency} balance of staff {staff_id} is out of range")]
    BalanceOverflow { staff_id: String, currency: Currency },
    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(String),
}

pub type TransactionId = u64;

/// Persistence operations the ledger needs from a backend.
///
/// Mutations made between `begin_transaction` and `commit_transaction` are applied
/// together or not at all. Only one transaction is open at a time; `begin_transaction`
/// blocks until the previous one finishes, which serializes every read-then-write
/// step on staff balances.
///
/// Reads made outside a transaction see whatever the open transaction has written
/// so far. Callers that must only see committed state bracket them with
/// `begin_read`/`end_read`, which wait for the open transaction to finish.
pub trait StorageBackend: Send + Sync {
    fn get_rates(&self) -> Result<RateSet, StorageError>;
    fn set_rates(&self, rates: &RateSet) -> Result<(), StorageError>;

    fn create_staff(&self, command: &CreateStaffCommand) -> Result<(), StorageError>;
    fn get_staff(&self, staff_id: &str) -> Result<Staff, StorageError>;
    fn list_staff(&self) -> Result<Vec<Staff>, StorageError>;
    fn delete_staff(&self, staff_id: &str) -> Result<(), StorageError>;

    /// Reads a balance for update within the open transaction.
    fn lock_balance(&self, staff_id: &str, currency: Currency) -> Result<Decimal, StorageError>;
    fn set_balance(&self, staff_id: &str, currency: Currency, balance: Decimal) -> Result<(), StorageError>;
    /// Applies `delta` and returns the new balance. No floor is enforced.
    fn adjust_balance(&self, staff_id: &str, currency: Currency, delta: Decimal) -> Result<Decimal, StorageError>;
    /// Applies `delta` only when the result stays non-negative. Returns `None` without
    /// mutating when it would not.
    fn adjust_balance_if_sufficient(&self, staff_id: &str, currency: Currency, delta: Decimal) -> Result<Option<Decimal>, StorageError>;

    fn insert_transaction(&self, record: &NewCustomerTransaction) -> Result<CustomerTransaction, StorageError>;
    /// The customer's most recently inserted transaction.
    fn latest_customer_transaction(&self, customer_name: &str) -> Result<Option<CustomerTransaction>, StorageError>;
    /// All transactions, oldest first.
    fn list_transactions(&self) -> Result<Vec<CustomerTransaction>, StorageError>;
    fn delete_transaction(&self, id: Uuid) -> Result<(), StorageError>;
    fn search_customers(&self, fragment: &str, limit: usize) -> Result<Vec<Arc<str>>, StorageError>;

    fn insert_deposit(&self, record: &NewDeposit) -> Result<StaffDeposit, StorageError>;
    /// Deposits for one staff, oldest first.
    fn list_deposits(&self, staff_id: &str) -> Result<Vec<StaffDeposit>, StorageError>;
    /// Substring match over id, staff name, description and depositor, oldest first.
    fn search_deposits(&self, fragment: &str) -> Result<Vec<StaffDeposit>, StorageError>;

    fn insert_expense(&self, record: &NewExpense) -> Result<StaffExpense, StorageError>;
    /// Expenses whose staff name matches case-insensitively, newest first.
    fn list_expenses(&self, staff_name: &str) -> Result<Vec<StaffExpense>, StorageError>;

    fn insert_transfer(&self, record: &NewTransfer) -> Result<StaffTransfer, StorageError>;
    /// All staff-to-staff transfers, oldest first.
    fn list_transfers(&self) -> Result<Vec<StaffTransfer>, StorageError>;

    fn begin_transaction(&self) -> Result<TransactionId, StorageError>;
    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;
    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError>;

    /// Waits until no transaction is open and keeps new ones out until `end_read`.
    fn begin_read(&self) -> Result<TransactionId, StorageError>;
    fn end_read(&self, read_id: TransactionId) -> Result<(), StorageError>;
}

/// Admits one transaction at a time. Backends hold a gate and call `acquire` from
/// `begin_transaction` and `release` once the transaction is committed or rolled back.
#[derive(Debug)]
pub struct TransactionGate {
    tx_counter: AtomicU64,
    active: Mutex<Option<TransactionId>>,
    released: Condvar,
}

impl Default for TransactionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionGate {
    pub fn new() -> Self {
        Self {
            tx_counter: AtomicU64::new(1),
            active: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    pub fn acquire(&self) -> Result<TransactionId, StorageError> {
        let mut active = self.active.lock().map_err(|_| poisoned())?;
        while active.is_some() {
            active = self.released.wait(active).map_err(|_| poisoned())?;
        }
        let tx_id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        *active = Some(tx_id);
        Ok(tx_id)
    }

    /// Fails with `NoActiveTransaction` if `tx_id` is not the open transaction.
    pub fn check(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let active = self.active.lock().map_err(|_| poisoned())?;
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        Ok(())
    }

    pub fn release(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        let mut active = self.active.lock().map_err(|_| poisoned())?;
        if *active != Some(tx_id) {
            return Err(StorageError::NoActiveTransaction);
        }
        *active = None;
        self.released.notify_one();
        Ok(())
    }
}

fn poisoned() -> StorageError {
    StorageError::Other("transaction gate lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn test_gate_rejects_unknown_transaction() {
        let gate = TransactionGate::new();
        let tx_id = gate.acquire().unwrap();
        assert!(matches!(gate.release(tx_id + 1), Err(StorageError::NoActiveTransaction)));
        gate.release(tx_id).unwrap();
        assert!(matches!(gate.release(tx_id), Err(StorageError::NoActiveTransaction)));
    }

    #[test]
    fn test_gate_serializes_transactions() {
        let gate = Arc::new(TransactionGate::new());
        let first = gate.acquire().unwrap();

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || {
                let second = gate.acquire().unwrap();
                gate.release(second).unwrap();
                second
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        gate.release(first).unwrap();
        let second = waiter.join().unwrap();
        assert!(second > first);
    }
}
