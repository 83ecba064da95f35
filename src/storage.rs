use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use rust_decimal::Decimal;
use uuid::Uuid;

use remitdesk_core::{
    Balances, CreateStaffCommand, Currency, CustomerTransaction, NewCustomerTransaction,
    NewDeposit, NewExpense, NewTransfer, RateSet, Staff, StaffDeposit, StaffExpense,
    StaffTransfer,
};

pub use remitdesk_core::storage::{StorageBackend, StorageError, TransactionGate, TransactionId};

/// An open storage transaction. Dropping it without `commit` or `rollback` rolls
/// back, so a panic inside a unit of work still releases the gate.
pub struct TransactionGuard<'a> {
    storage: &'a dyn StorageBackend,
    tx_id: TransactionId,
    finished: bool,
}

impl<'a> TransactionGuard<'a> {
    pub fn begin(storage: &'a dyn StorageBackend) -> Result<Self, StorageError> {
        let tx_id = storage.begin_transaction()?;
        Ok(Self { storage, tx_id, finished: false })
    }

    pub fn id(&self) -> TransactionId {
        self.tx_id
    }

    pub fn commit(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.storage.commit_transaction(self.tx_id)
    }

    pub fn rollback(mut self) -> Result<(), StorageError> {
        self.finished = true;
        self.storage.rollback_transaction(self.tx_id)
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.storage.rollback_transaction(self.tx_id) {
            Ok(()) => tracing::error!(tx_id = self.tx_id, "Transaction abandoned, rolled back"),
            Err(e) => tracing::error!(tx_id = self.tx_id, error = %e, "Abandoned transaction could not be rolled back"),
        }
    }
}

/// Holds off writers while committed state is read.
pub struct ReadLease<'a> {
    storage: &'a dyn StorageBackend,
    read_id: TransactionId,
}

impl<'a> ReadLease<'a> {
    pub fn acquire(storage: &'a dyn StorageBackend) -> Result<Self, StorageError> {
        let read_id = storage.begin_read()?;
        Ok(Self { storage, read_id })
    }
}

impl Drop for ReadLease<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.storage.end_read(self.read_id) {
            tracing::error!(read_id = self.read_id, error = %e, "Failed to end read");
        }
    }
}

#[derive(Clone, Default)]
struct DeskState {
    rates: RateSet,
    staff: BTreeMap<Arc<str>, Staff>,
    transactions: Vec<CustomerTransaction>,
    deposits: Vec<StaffDeposit>,
    expenses: Vec<StaffExpense>,
    transfers: Vec<StaffTransfer>,
}

impl DeskState {
    fn staff_mut(&mut self, staff_id: &str) -> Result<&mut Staff, StorageError> {
        self.staff
            .get_mut(staff_id)
            .ok_or_else(|| StorageError::StaffNotFound(staff_id.to_string()))
    }
}

struct Snapshot {
    state: DeskState,
    sequence_value: u64,
}

/// Keeps the whole desk in memory. Rolling back restores the snapshot taken at
/// `begin_transaction`.
pub struct InMemoryStorage {
    state: RwLock<DeskState>,
    sequence_counter: AtomicU64,
    gate: TransactionGate,
    snapshots: RwLock<HashMap<TransactionId, Snapshot>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DeskState::default()),
            sequence_counter: AtomicU64::new(1),
            gate: TransactionGate::new(),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, DeskState>, StorageError> {
        self.state.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, DeskState>, StorageError> {
        self.state.write().map_err(|_| poisoned())
    }

    fn take_snapshot(&self, tx_id: TransactionId) -> Result<Snapshot, StorageError> {
        self.snapshots
            .write()
            .map_err(|_| poisoned())?
            .remove(&tx_id)
            .ok_or(StorageError::NoActiveTransaction)
    }
}

fn poisoned() -> StorageError {
    StorageError::Other("in-memory state lock poisoned".to_string())
}

fn checked_adjust(slot: &mut Decimal, delta: Decimal, staff_id: &str, currency: Currency) -> Result<Decimal, StorageError> {
    *slot = slot.checked_add(delta).ok_or_else(|| StorageError::BalanceOverflow {
        staff_id: staff_id.to_string(),
        currency,
    })?;
    Ok(*slot)
}

fn contains_ignore_case(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

impl StorageBackend for InMemoryStorage {
    fn get_rates(&self) -> Result<RateSet, StorageError> {
        Ok(self.read()?.rates)
    }

    fn set_rates(&self, rates: &RateSet) -> Result<(), StorageError> {
        self.write()?.rates = *rates;
        Ok(())
    }

    fn create_staff(&self, command: &CreateStaffCommand) -> Result<(), StorageError> {
        let mut state = self.write()?;
        if state.staff.contains_key(&command.id) {
            return Err(StorageError::StaffAlreadyExists(command.id.to_string()));
        }
        state.staff.insert(
            command.id.clone(),
            Staff {
                id: command.id.clone(),
                name: command.name.clone(),
                balances: Balances::default(),
            },
        );
        Ok(())
    }

    fn get_staff(&self, staff_id: &str) -> Result<Staff, StorageError> {
        self.read()?
            .staff
            .get(staff_id)
            .cloned()
            .ok_or_else(|| StorageError::StaffNotFound(staff_id.to_string()))
    }

    fn list_staff(&self) -> Result<Vec<Staff>, StorageError> {
        Ok(self.read()?.staff.values().cloned().collect())
    }

    fn delete_staff(&self, staff_id: &str) -> Result<(), StorageError> {
        self.write()?
            .staff
            .remove(staff_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::StaffNotFound(staff_id.to_string()))
    }

    fn lock_balance(&self, staff_id: &str, currency: Currency) -> Result<Decimal, StorageError> {
        // Exclusivity comes from the transaction gate.
        Ok(self.get_staff(staff_id)?.balances.get(currency))
    }

    fn set_balance(&self, staff_id: &str, currency: Currency, balance: Decimal) -> Result<(), StorageError> {
        let mut state = self.write()?;
        *state.staff_mut(staff_id)?.balances.get_mut(currency) = balance;
        Ok(())
    }

    fn adjust_balance(&self, staff_id: &str, currency: Currency, delta: Decimal) -> Result<Decimal, StorageError> {
        let mut state = self.write()?;
        let slot = state.staff_mut(staff_id)?.balances.get_mut(currency);
        checked_adjust(slot, delta, staff_id, currency)
    }

    fn adjust_balance_if_sufficient(&self, staff_id: &str, currency: Currency, delta: Decimal) -> Result<Option<Decimal>, StorageError> {
        let mut state = self.write()?;
        let slot = state.staff_mut(staff_id)?.balances.get_mut(currency);
        match slot.checked_add(delta) {
            Some(balance) if balance < Decimal::ZERO => Ok(None),
            _ => checked_adjust(slot, delta, staff_id, currency).map(Some),
        }
    }

    fn insert_transaction(&self, record: &NewCustomerTransaction) -> Result<CustomerTransaction, StorageError> {
        let stored = CustomerTransaction {
            id: Uuid::new_v4(),
            sequence: self.next_sequence(),
            staff_id: record.staff_id.clone(),
            staff_name: record.staff_name.clone(),
            customer_name: record.customer_name.clone(),
            amount_sent: record.amount_sent,
            received_money: record.received_money,
            received_currency: record.received_currency,
            route: record.route,
            converted_home: record.converted_home,
            converted_foreign: record.converted_foreign,
            converted_currency: record.converted_currency,
            customer_balance_home: record.customer_balance_home,
            customer_balance_foreign: record.customer_balance_foreign,
            description: record.description.clone(),
            created_at: record.created_at,
        };
        self.write()?.transactions.push(stored.clone());
        Ok(stored)
    }

    fn latest_customer_transaction(&self, customer_name: &str) -> Result<Option<CustomerTransaction>, StorageError> {
        Ok(self
            .read()?
            .transactions
            .iter()
            .filter(|t| t.customer_name.as_ref() == customer_name)
            .max_by_key(|t| t.sequence)
            .cloned())
    }

    fn list_transactions(&self) -> Result<Vec<CustomerTransaction>, StorageError> {
        let mut result = self.read()?.transactions.clone();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.sequence.cmp(&b.sequence)));
        Ok(result)
    }

    fn delete_transaction(&self, id: Uuid) -> Result<(), StorageError> {
        let mut state = self.write()?;
        let before = state.transactions.len();
        state.transactions.retain(|t| t.id != id);
        if state.transactions.len() == before {
            return Err(StorageError::RecordNotFound(id.to_string()));
        }
        Ok(())
    }

    fn search_customers(&self, fragment: &str, limit: usize) -> Result<Vec<Arc<str>>, StorageError> {
        let needle = fragment.to_lowercase();
        let names: BTreeSet<Arc<str>> = self
            .read()?
            .transactions
            .iter()
            .filter(|t| contains_ignore_case(&t.customer_name, &needle))
            .map(|t| t.customer_name.clone())
            .collect();
        Ok(names.into_iter().take(limit).collect())
    }

    fn insert_deposit(&self, record: &NewDeposit) -> Result<StaffDeposit, StorageError> {
        let stored = StaffDeposit {
            id: Uuid::new_v4(),
            sequence: self.next_sequence(),
            staff_id: record.staff_id.clone(),
            staff_name: record.staff_name.clone(),
            amount: record.amount,
            currency: record.currency,
            description: record.description.clone(),
            deposited_by: record.deposited_by.clone(),
            created_at: record.created_at,
        };
        self.write()?.deposits.push(stored.clone());
        Ok(stored)
    }

    fn list_deposits(&self, staff_id: &str) -> Result<Vec<StaffDeposit>, StorageError> {
        let mut result: Vec<StaffDeposit> = self
            .read()?
            .deposits
            .iter()
            .filter(|d| d.staff_id.as_ref() == staff_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.sequence.cmp(&b.sequence)));
        Ok(result)
    }

    fn search_deposits(&self, fragment: &str) -> Result<Vec<StaffDeposit>, StorageError> {
        let needle = fragment.to_lowercase();
        let state = self.read()?;
        let mut result: Vec<StaffDeposit> = state
            .deposits
            .iter()
            .filter(|d| {
                let staff_name = match state.staff.get(&d.staff_id) {
                    Some(staff) => Some(staff.name.as_ref()),
                    None => d.staff_name.as_deref(),
                };
                contains_ignore_case(&d.id.to_string(), &needle)
                    || staff_name.map_or(false, |n| contains_ignore_case(n, &needle))
                    || contains_ignore_case(&d.description, &needle)
                    || contains_ignore_case(&d.deposited_by, &needle)
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.sequence.cmp(&b.sequence)));
        Ok(result)
    }

    fn insert_expense(&self, record: &NewExpense) -> Result<StaffExpense, StorageError> {
        let stored = StaffExpense {
            id: Uuid::new_v4(),
            sequence: self.next_sequence(),
            staff_id: record.staff_id.clone(),
            staff_name: record.staff_name.clone(),
            amount: record.amount,
            reason: record.reason.clone(),
            currency: record.currency,
            deducted_from: record.deducted_from.clone(),
            created_at: record.created_at,
        };
        self.write()?.expenses.push(stored.clone());
        Ok(stored)
    }

    fn list_expenses(&self, staff_name: &str) -> Result<Vec<StaffExpense>, StorageError> {
        let wanted = staff_name.to_lowercase();
        let mut result: Vec<StaffExpense> = self
            .read()?
            .expenses
            .iter()
            .filter(|e| e.staff_name.to_lowercase() == wanted)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.sequence.cmp(&a.sequence)));
        Ok(result)
    }

    fn insert_transfer(&self, record: &NewTransfer) -> Result<StaffTransfer, StorageError> {
        let stored = StaffTransfer {
            id: Uuid::new_v4(),
            sequence: self.next_sequence(),
            sender_id: record.sender_id.clone(),
            receiver_id: record.receiver_id.clone(),
            amount: record.amount,
            currency: record.currency,
            description: record.description.clone(),
            created_at: record.created_at,
        };
        self.write()?.transfers.push(stored.clone());
        Ok(stored)
    }

    fn list_transfers(&self) -> Result<Vec<StaffTransfer>, StorageError> {
        let mut result = self.read()?.transfers.clone();
        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.sequence.cmp(&b.sequence)));
        Ok(result)
    }

    fn begin_transaction(&self) -> Result<TransactionId, StorageError> {
        let tx_id = self.gate.acquire()?;
        let taken = self.read().and_then(|state| {
            let snapshot = Snapshot {
                state: state.clone(),
                sequence_value: self.sequence_counter.load(Ordering::SeqCst),
            };
            self.snapshots.write().map_err(|_| poisoned())?.insert(tx_id, snapshot);
            Ok(())
        });
        if let Err(e) = taken {
            self.gate.release(tx_id)?;
            return Err(e);
        }
        tracing::debug!(tx_id, "Transaction started");
        Ok(tx_id)
    }

    fn commit_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        self.gate.check(tx_id)?;
        let dropped = self.take_snapshot(tx_id).map(|_| ());
        self.gate.release(tx_id)?;
        dropped?;
        tracing::debug!(tx_id, "Transaction committed");
        Ok(())
    }

    fn rollback_transaction(&self, tx_id: TransactionId) -> Result<(), StorageError> {
        self.gate.check(tx_id)?;
        let restored = self.take_snapshot(tx_id).and_then(|snapshot| {
            *self.write()? = snapshot.state;
            self.sequence_counter.store(snapshot.sequence_value, Ordering::SeqCst);
            Ok(())
        });
        self.gate.release(tx_id)?;
        restored?;
        tracing::debug!(tx_id, "Transaction rolled back");
        Ok(())
    }

    fn begin_read(&self) -> Result<TransactionId, StorageError> {
        self.gate.acquire()
    }

    fn end_read(&self, read_id: TransactionId) -> Result<(), StorageError> {
        self.gate.release(read_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use time::{Duration, OffsetDateTime};

    fn storage_with_staff() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        storage
            .create_staff(&CreateStaffCommand {
                id: Arc::from("1"),
                name: Arc::from("Aslam"),
            })
            .unwrap();
        storage
    }

    fn deposit(staff_id: &str, amount: Decimal, at: OffsetDateTime) -> NewDeposit {
        NewDeposit {
            staff_id: Arc::from(staff_id),
            staff_name: Some(Arc::from("Aslam")),
            amount,
            currency: Currency::Home,
            description: Arc::from("Float top-up"),
            deposited_by: Arc::from("Admin"),
            created_at: at,
        }
    }

    #[test]
    fn test_rollback_restores_balances_and_records() {
        let storage = storage_with_staff();
        storage.adjust_balance("1", Currency::Home, dec!(100)).unwrap();

        let tx_id = storage.begin_transaction().unwrap();
        storage.adjust_balance("1", Currency::Home, dec!(-40)).unwrap();
        storage.insert_deposit(&deposit("1", dec!(-40), OffsetDateTime::now_utc())).unwrap();
        storage.rollback_transaction(tx_id).unwrap();

        assert_eq!(storage.get_staff("1").unwrap().balances.home, dec!(100));
        assert!(storage.list_deposits("1").unwrap().is_empty());
    }

    #[test]
    fn test_commit_keeps_changes_and_frees_gate() {
        let storage = storage_with_staff();
        let tx_id = storage.begin_transaction().unwrap();
        storage.adjust_balance("1", Currency::Primary, dec!(12.5)).unwrap();
        storage.commit_transaction(tx_id).unwrap();

        let next = storage.begin_transaction().unwrap();
        storage.commit_transaction(next).unwrap();
        assert_eq!(storage.get_staff("1").unwrap().balances.primary, dec!(12.5));
        assert!(matches!(storage.commit_transaction(next), Err(StorageError::NoActiveTransaction)));
    }

    #[test]
    fn test_guarded_adjust_refuses_overdraft() {
        let storage = storage_with_staff();
        storage.adjust_balance("1", Currency::Secondary, dec!(10)).unwrap();

        assert_eq!(storage.adjust_balance_if_sufficient("1", Currency::Secondary, dec!(-10.000001)).unwrap(), None);
        assert_eq!(storage.get_staff("1").unwrap().balances.secondary, dec!(10));
        assert_eq!(storage.adjust_balance_if_sufficient("1", Currency::Secondary, dec!(-10)).unwrap(), Some(Decimal::ZERO));
    }

    #[test]
    fn test_plain_adjust_allows_negative() {
        let storage = storage_with_staff();
        assert_eq!(storage.adjust_balance("1", Currency::Home, dec!(-30)).unwrap(), dec!(-30));
    }

    #[test]
    fn test_missing_staff() {
        let storage = InMemoryStorage::new();
        assert!(matches!(storage.adjust_balance("x", Currency::Home, dec!(1)), Err(StorageError::StaffNotFound(_))));
        assert!(matches!(storage.delete_staff("x"), Err(StorageError::StaffNotFound(_))));
    }

    #[test]
    fn test_deposits_ordered_by_timestamp() {
        let storage = storage_with_staff();
        let now = OffsetDateTime::now_utc();
        storage.insert_deposit(&deposit("1", dec!(2), now)).unwrap();
        storage.insert_deposit(&deposit("1", dec!(1), now - Duration::hours(1))).unwrap();

        let amounts: Vec<Decimal> = storage.list_deposits("1").unwrap().iter().map(|d| d.amount).collect();
        assert_eq!(amounts, vec![dec!(1), dec!(2)]);
    }

    #[test]
    fn test_search_deposits_matches_description_and_depositor() {
        let storage = storage_with_staff();
        let now = OffsetDateTime::now_utc();
        storage.insert_deposit(&deposit("1", dec!(5), now)).unwrap();

        assert_eq!(storage.search_deposits("top-UP").unwrap().len(), 1);
        assert_eq!(storage.search_deposits("admin").unwrap().len(), 1);
        assert!(storage.search_deposits("payroll").unwrap().is_empty());
    }
}
