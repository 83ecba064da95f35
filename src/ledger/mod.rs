//! The transaction protocol: every balance mutation on the desk goes through
//! [`LedgerService`], one unit of work per operation.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use remitdesk_core::{
    CreateStaffCommand, Currency, DeskSettings, RateSet, Staff, StorageBackend, StorageError,
};

use crate::conversion::ConversionError;
use crate::storage::TransactionGuard;

pub mod deposit;
pub mod expense;
pub mod send_money;
pub mod transfer;

pub use deposit::{DepositCommand, DepositReceipt};
pub use expense::{ExpenseCommand, ExpenseFunding, ExpenseReceipt};
pub use send_money::{AutoCredit, SendMoneyCommand, SendMoneyReceipt};
pub use transfer::{TransferCommand, TransferReceipt};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),
    #[error("staff {staff_id} does not have enough {currency} balance")]
    InsufficientBalance { staff_id: String, currency: Currency },
    #[error("conversion rate unavailable: {from} -> {to}")]
    RateUnavailable { from: Currency, to: Currency },
    #[error("{0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for LedgerError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::StaffNotFound(id) => LedgerError::NotFound(format!("Staff not found: {}", id)),
            StorageError::RecordNotFound(id) => LedgerError::NotFound(format!("Record not found: {}", id)),
            e @ (StorageError::BalanceOverflow { .. } | StorageError::TimestampOutOfRange(_)) => {
                LedgerError::Validation(e.to_string())
            }
            other => LedgerError::Storage(other),
        }
    }
}

impl From<ConversionError> for LedgerError {
    fn from(e: ConversionError) -> Self {
        match e {
            ConversionError::RateUnavailable(r) => LedgerError::RateUnavailable { from: r.from, to: r.to },
            overflow @ ConversionError::Overflow { .. } => LedgerError::Validation(overflow.to_string()),
        }
    }
}

/// Result of an operation that committed.
///
/// `Degraded` means the primary effect is durable but a secondary step failed;
/// `cause` carries that failure so callers never have to guess.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Committed { value: T, message: String },
    Degraded { value: T, message: String, cause: String },
}

impl<T> Outcome<T> {
    pub fn committed(value: T, message: impl Into<String>) -> Self {
        Outcome::Committed { value, message: message.into() }
    }

    pub fn degraded(value: T, message: impl Into<String>, cause: impl Into<String>) -> Self {
        Outcome::Degraded {
            value,
            message: message.into(),
            cause: cause.into(),
        }
    }

    pub fn value(&self) -> &T {
        match self {
            Outcome::Committed { value, .. } | Outcome::Degraded { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Outcome::Committed { value, .. } | Outcome::Degraded { value, .. } => value,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Outcome::Committed { message, .. } | Outcome::Degraded { message, .. } => message,
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            Outcome::Committed { .. } => None,
            Outcome::Degraded { cause, .. } => Some(cause),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Committed { value, message } => Outcome::Committed { value: f(value), message },
            Outcome::Degraded { value, message, cause } => Outcome::Degraded { value: f(value), message, cause },
        }
    }
}

pub type LedgerResult<T> = Result<Outcome<T>, LedgerError>;

pub struct LedgerService {
    storage: Arc<dyn StorageBackend>,
    settings: DeskSettings,
}

impl LedgerService {
    pub fn new(storage: Arc<dyn StorageBackend>, settings: DeskSettings) -> Self {
        Self { storage, settings }
    }

    pub fn settings(&self) -> &DeskSettings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Runs `work` inside one storage transaction. Any error rolls back every
    /// mutation `work` made; so does a panic, through the guard's drop.
    fn unit_of_work<T>(
        &self,
        operation: &'static str,
        work: impl FnOnce(&dyn StorageBackend) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let storage = self.storage.as_ref();
        let tx = TransactionGuard::begin(storage)?;
        let tx_id = tx.id();
        tracing::debug!(tx_id, operation, "Unit of work started");

        match work(storage) {
            Ok(value) => {
                tx.commit()?;
                tracing::debug!(tx_id, operation, "Unit of work committed");
                Ok(value)
            }
            Err(e) => {
                match tx.rollback() {
                    Ok(()) => tracing::warn!(tx_id, operation, error = %e, "Unit of work rolled back"),
                    Err(rollback_err) => {
                        tracing::error!(tx_id, operation, error = %e, rollback_error = %rollback_err, "Rollback failed")
                    }
                }
                Err(e)
            }
        }
    }

    pub fn register_staff(&self, id: &str, name: &str) -> LedgerResult<Staff> {
        let result = (|| -> LedgerResult<Staff> {
            let id = required(id, "staff id")?;
            let name = required(name, "staff name")?;
            let command = CreateStaffCommand {
                id: Arc::from(id),
                name: Arc::from(name),
            };
            let staff = self.unit_of_work("register_staff", |storage| {
                storage.create_staff(&command).map_err(|e| match e {
                    StorageError::StaffAlreadyExists(id) => {
                        LedgerError::Validation(format!("Staff {} already exists", id))
                    }
                    other => other.into(),
                })?;
                Ok(storage.get_staff(&command.id)?)
            })?;
            tracing::info!(staff_id = %staff.id, name = %staff.name, "Staff registered");
            Ok(Outcome::committed(staff, "Staff added successfully!"))
        })();
        track("register_staff", result)
    }

    /// Removes the directory entry only. Records that reference the staff stay.
    pub fn remove_staff(&self, staff_id: &str) -> LedgerResult<()> {
        let result = self
            .unit_of_work("remove_staff", |storage| Ok(storage.delete_staff(staff_id)?))
            .map(|()| {
                tracing::info!(staff_id, "Staff removed");
                Outcome::committed((), format!("Staff ID {} deleted successfully.", staff_id))
            });
        track("remove_staff", result)
    }

    pub fn set_rates(&self, rates: RateSet) -> LedgerResult<RateSet> {
        let result = (|| -> LedgerResult<RateSet> {
            let all = [rates.primary_to_home, rates.secondary_to_home, rates.primary_to_secondary];
            if all.iter().any(|r| *r < Decimal::ZERO) {
                return Err(LedgerError::Validation("Conversion rates cannot be negative".to_string()));
            }
            self.unit_of_work("set_rates", |storage| Ok(storage.set_rates(&rates)?))?;
            tracing::info!(
                primary_to_home = %rates.primary_to_home,
                secondary_to_home = %rates.secondary_to_home,
                primary_to_secondary = %rates.primary_to_secondary,
                "Conversion rates updated"
            );
            Ok(Outcome::committed(rates, "Conversion rates updated!"))
        })();
        track("set_rates", result)
    }

    /// Later rows for the same customer keep their running balances.
    pub fn delete_transaction(&self, id: Uuid) -> LedgerResult<()> {
        let result = self
            .unit_of_work("delete_transaction", |storage| Ok(storage.delete_transaction(id)?))
            .map(|()| {
                tracing::info!(transaction_id = %id, "Transaction deleted");
                Outcome::committed((), "Transaction deleted successfully!")
            });
        track("delete_transaction", result)
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, LedgerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(LedgerError::Validation(format!("{} is required", field)));
    }
    Ok(value)
}

fn positive(amount: Decimal, field: &str) -> Result<Decimal, LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::Validation(format!("{} must be greater than zero", field)));
    }
    Ok(amount)
}

/// Counts the outcome of one operation and logs the failure, if any.
fn track<T>(operation: &'static str, result: LedgerResult<T>) -> LedgerResult<T> {
    let outcome = match &result {
        Ok(Outcome::Committed { .. }) => "committed",
        Ok(Outcome::Degraded { message, cause, .. }) => {
            tracing::warn!(operation, message = %message, cause = %cause, "Operation committed with a failed secondary step");
            "degraded"
        }
        Err(LedgerError::Storage(e)) => {
            tracing::error!(operation, error = %e, "Operation failed");
            "failed"
        }
        Err(e) => {
            tracing::info!(operation, error = %e, "Operation rejected");
            "rejected"
        }
    };
    metrics::counter!("remitdesk_operations_total", 1, "operation" => operation, "outcome" => outcome);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use rust_decimal_macros::dec;

    fn service() -> LedgerService {
        LedgerService::new(Arc::new(InMemoryStorage::new()), DeskSettings::default())
    }

    #[test]
    fn test_register_rejects_duplicates_and_blanks() {
        let service = service();
        let outcome = service.register_staff(" 8 ", "Tamiz").unwrap();
        assert_eq!(outcome.value().id.as_ref(), "8");
        assert!(matches!(service.register_staff("8", "Other"), Err(LedgerError::Validation(_))));
        assert!(matches!(service.register_staff("", "Nobody"), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_remove_unknown_staff_is_not_found() {
        assert!(matches!(service().remove_staff("42"), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_set_rates_rejects_negative() {
        let service = service();
        let bad = RateSet {
            primary_to_home: dec!(-1),
            ..RateSet::default()
        };
        assert!(matches!(service.set_rates(bad), Err(LedgerError::Validation(_))));

        let good = RateSet {
            primary_to_home: dec!(22.5),
            secondary_to_home: dec!(23),
            primary_to_secondary: dec!(0.98),
        };
        service.set_rates(good).unwrap();
        assert_eq!(service.storage().get_rates().unwrap(), good);
    }

    #[test]
    fn test_failed_unit_of_work_rolls_back() {
        let service = service();
        service.register_staff("1", "Ali").unwrap();
        let result: Result<(), LedgerError> = service.unit_of_work("test", |storage| {
            storage.adjust_balance("1", Currency::Home, dec!(100))?;
            Err(LedgerError::Validation("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(service.storage().get_staff("1").unwrap().balances.home, Decimal::ZERO);

        // The gate was released, so the next unit of work can start.
        service.unit_of_work("test", |storage| Ok(storage.adjust_balance("1", Currency::Home, dec!(5))?)).unwrap();
        assert_eq!(service.storage().get_staff("1").unwrap().balances.home, dec!(5));
    }

    #[test]
    fn test_panic_inside_unit_of_work_releases_gate() {
        let service = Arc::new(service());
        service.register_staff("1", "Ali").unwrap();

        let panicking = service.clone();
        let joined = std::thread::spawn(move || {
            let _: Result<(), LedgerError> = panicking.unit_of_work("test", |storage| {
                storage.adjust_balance("1", Currency::Home, dec!(70))?;
                panic!("conversion blew up");
            });
        })
        .join();
        assert!(joined.is_err());

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let writer = service.clone();
        std::thread::spawn(move || {
            let result = writer.unit_of_work("test", |storage| Ok(storage.adjust_balance("1", Currency::Home, dec!(5))?));
            let _ = done_tx.send(result.is_ok());
        });
        let finished = done_rx.recv_timeout(std::time::Duration::from_secs(5));
        assert_eq!(finished, Ok(true), "gate stayed held after the panic");
        assert_eq!(service.storage().get_staff("1").unwrap().balances.home, dec!(5));
    }

    #[test]
    fn test_outcome_accessors() {
        let outcome = Outcome::degraded(3, "Saved", "balance update failed");
        assert!(outcome.is_degraded());
        assert_eq!(outcome.cause(), Some("balance update failed"));
        let mapped = outcome.map(|v| v * 2);
        assert_eq!(*mapped.value(), 6);
        assert_eq!(mapped.message(), "Saved");
    }
}
