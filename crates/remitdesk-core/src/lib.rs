//! Core types and traits for RemitDesk storage backends.
//!
//! This crate provides the `StorageBackend` trait and the currency, rate and
//! ledger record types shared by the backends and the transaction protocol.

pub mod models;
pub mod storage;

// Re-export key types at crate root for convenience
pub use models::{
    Balances, Currency, CurrencyCodes, CustomerTransaction, DeliveryRoute, DeskSettings,
    HouseAccounts, RateSet, Staff, StaffDeposit, StaffExpense, StaffTransfer,
};
pub use models::read::{DepositView, ExpenseView, StaffView, TransactionView};
pub use models::write::{CreateStaffCommand, NewCustomerTransaction, NewDeposit, NewExpense, NewTransfer};
pub use storage::{StorageBackend, StorageError, TransactionGate, TransactionId};
