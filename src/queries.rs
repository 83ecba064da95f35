//! Read side of the ledger. Nothing here mutates state or recomputes balances;
//! staff balances come straight from the directory, records are the audit trail.

use std::{collections::HashMap, sync::Arc};

use rust_decimal::Decimal;

use remitdesk_core::{
    Currency, CurrencyCodes, CustomerTransaction, DepositView, DeskSettings, ExpenseView,
    RateSet, Staff, StaffDeposit, StaffTransfer, StaffView, StorageBackend, StorageError,
    TransactionView,
};

use crate::ledger::LedgerError;
use crate::storage::ReadLease;

pub const CUSTOMER_SEARCH_LIMIT: usize = 10;

pub struct RecordQueries {
    storage: Arc<dyn StorageBackend>,
    codes: CurrencyCodes,
}

impl RecordQueries {
    pub fn new(storage: Arc<dyn StorageBackend>, settings: &DeskSettings) -> Self {
        Self {
            storage,
            codes: settings.currencies.clone(),
        }
    }

    /// Runs `read` against committed state only; an open unit of work finishes first.
    fn committed<T>(
        &self,
        read: impl FnOnce(&dyn StorageBackend) -> Result<T, StorageError>,
    ) -> Result<T, LedgerError> {
        let storage = self.storage.as_ref();
        let _lease = ReadLease::acquire(storage)?;
        Ok(read(storage)?)
    }

    pub fn rates(&self) -> Result<RateSet, LedgerError> {
        self.committed(|storage| storage.get_rates())
    }

    pub fn staff_overview(&self) -> Result<Vec<StaffView>, LedgerError> {
        let (rates, staff) = self.committed(|storage| Ok((storage.get_rates()?, storage.list_staff()?)))?;
        Ok(staff.into_iter().map(|s| staff_view(s, &rates)).collect())
    }

    pub fn staff(&self, staff_id: &str) -> Result<StaffView, LedgerError> {
        let (rates, staff) = self.committed(|storage| Ok((storage.get_rates()?, storage.get_staff(staff_id)?)))?;
        Ok(staff_view(staff, &rates))
    }

    /// Every customer transaction, oldest first, with the rates in force now.
    pub fn transactions(&self) -> Result<Vec<TransactionView>, LedgerError> {
        let (rates, transactions) =
            self.committed(|storage| Ok((storage.get_rates()?, storage.list_transactions()?)))?;
        Ok(transactions
            .into_iter()
            .map(|t| self.transaction_view(t, rates))
            .collect())
    }

    pub fn staff_deposits(&self, staff_id: &str) -> Result<Vec<DepositView>, LedgerError> {
        let (names, deposits) =
            self.committed(|storage| Ok((staff_names(storage)?, storage.list_deposits(staff_id)?)))?;
        Ok(deposits
            .into_iter()
            .map(|d| self.deposit_view(d, &names))
            .collect())
    }

    /// Matches the deposit id, the staff's current directory name, the description
    /// or the depositor.
    pub fn search_deposits(&self, query: &str) -> Result<Vec<DepositView>, LedgerError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(LedgerError::Validation("Search query required".to_string()));
        }
        let (names, deposits) =
            self.committed(|storage| Ok((staff_names(storage)?, storage.search_deposits(query)?)))?;
        Ok(deposits
            .into_iter()
            .map(|d| self.deposit_view(d, &names))
            .collect())
    }

    /// Expenses attributed to `staff_name`, newest first.
    pub fn staff_expenses(&self, staff_name: &str) -> Result<Vec<ExpenseView>, LedgerError> {
        let staff_name = staff_name.trim();
        if staff_name.is_empty() {
            return Err(LedgerError::Validation("Staff name is required.".to_string()));
        }
        let (names, expenses) =
            self.committed(|storage| Ok((staff_names(storage)?, storage.list_expenses(staff_name)?)))?;
        Ok(expenses
            .into_iter()
            .map(|e| ExpenseView {
                deducted_from_name: e
                    .deducted_from
                    .as_ref()
                    .map(|id| names.get(id).cloned().unwrap_or_else(|| id.clone())),
                currency: Arc::from(self.codes.code(e.currency)),
                id: e.id,
                staff_id: e.staff_id,
                staff_name: e.staff_name,
                amount: e.amount,
                reason: e.reason,
                deducted_from: e.deducted_from,
                date: e.created_at,
            })
            .collect())
    }

    pub fn transfers(&self) -> Result<Vec<StaffTransfer>, LedgerError> {
        self.committed(|storage| storage.list_transfers())
    }

    /// Distinct customer names containing `fragment`, at most ten.
    pub fn customers(&self, fragment: &str) -> Result<Vec<Arc<str>>, LedgerError> {
        self.committed(|storage| storage.search_customers(fragment.trim(), CUSTOMER_SEARCH_LIMIT))
    }

    fn deposit_view(&self, d: StaffDeposit, names: &HashMap<Arc<str>, Arc<str>>) -> DepositView {
        DepositView {
            deposited_by_name: names.get(&d.deposited_by).cloned().unwrap_or_else(|| d.deposited_by.clone()),
            staff_name: names.get(&d.staff_id).cloned().or(d.staff_name),
            currency: Arc::from(self.codes.code(d.currency)),
            id: d.id,
            staff_id: d.staff_id,
            amount: d.amount,
            description: d.description,
            deposited_by: d.deposited_by,
            date: d.created_at,
        }
    }

    fn transaction_view(&self, t: CustomerTransaction, rates: RateSet) -> TransactionView {
        let (balance_home, balance_foreign) = display_balances(t.customer_balance_home, t.customer_balance_foreign);
        TransactionView {
            converted_display: self.converted_display(&t),
            received_currency: Arc::from(self.codes.code(t.received_currency)),
            route: self.codes.route_label(t.route),
            id: t.id,
            staff_id: t.staff_id,
            staff_name: t.staff_name,
            customer_name: t.customer_name,
            amount_sent: t.amount_sent,
            received_money: t.received_money,
            converted_home: t.converted_home,
            converted_foreign: t.converted_foreign,
            converted_currency: t.converted_currency,
            balance_home,
            balance_foreign,
            rates,
            description: t.description,
            date: t.created_at,
        }
    }

    fn converted_display(&self, t: &CustomerTransaction) -> String {
        if !t.converted_foreign.is_zero() {
            format!("{} {}", t.converted_foreign.normalize(), self.codes.code(t.converted_currency))
        } else if !t.converted_home.is_zero() {
            format!("{} {}", t.converted_home.normalize(), self.codes.code(Currency::Home))
        } else {
            format!("0 {}", self.codes.code(t.received_currency))
        }
    }
}

fn staff_names(storage: &dyn StorageBackend) -> Result<HashMap<Arc<str>, Arc<str>>, StorageError> {
    Ok(storage
        .list_staff()?
        .into_iter()
        .map(|s| (s.id, s.name))
        .collect())
}

fn staff_view(staff: Staff, rates: &RateSet) -> StaffView {
    let in_home = |currency: Currency| match rates.to_home(currency) {
        Some(rate) if !staff.balances.get(currency).is_zero() => {
            Currency::Home.round(staff.balances.get(currency).saturating_mul(rate))
        }
        _ => Decimal::ZERO,
    };
    StaffView {
        primary_in_home: in_home(Currency::Primary),
        secondary_in_home: in_home(Currency::Secondary),
        id: staff.id,
        name: staff.name,
        balances: staff.balances,
    }
}

/// Residue below one unit on both sides of a settled customer is shown as zero.
fn display_balances(home: Decimal, foreign: Decimal) -> (Decimal, Decimal) {
    let both_set = !home.is_zero() && !foreign.is_zero();
    if both_set && home.abs() < Decimal::ONE && foreign.abs() < Decimal::ONE {
        (Decimal::ZERO, Decimal::ZERO)
    } else {
        (home, foreign)
    }
}
