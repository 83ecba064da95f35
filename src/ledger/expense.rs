use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use remitdesk_core::{Currency, NewExpense, StaffExpense};

use super::{positive, required, track, LedgerResult, LedgerService, Outcome};

/// Whose balance pays for an expense.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpenseFunding {
    /// The staff the expense is attributed to.
    Own,
    /// Another staff pays; used for administrative expenses.
    DeductedFrom(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpenseCommand {
    pub staff_id: String,
    pub staff_name: String,
    pub amount: Decimal,
    pub reason: String,
    pub currency: Currency,
    pub funding: ExpenseFunding,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseReceipt {
    pub expense: StaffExpense,
    pub payer_id: Arc<str>,
    /// `None` when the debit failed.
    pub payer_balance: Option<Decimal>,
}

impl LedgerService {
    /// Records the expense, then debits the payer with no floor. A failed debit
    /// keeps the record and reports a degraded outcome.
    pub fn add_expense(&self, command: ExpenseCommand) -> LedgerResult<ExpenseReceipt> {
        let result = (|| -> LedgerResult<ExpenseReceipt> {
            let staff_id = required(&command.staff_id, "staffId")?;
            let staff_name = required(&command.staff_name, "staffName")?;
            let reason = required(&command.reason, "reason")?;
            let amount = positive(command.amount, "amount")?;
            let payer_id: Arc<str> = match &command.funding {
                ExpenseFunding::Own => Arc::from(staff_id),
                ExpenseFunding::DeductedFrom(payer) => Arc::from(required(payer, "deductedFromStaffId")?),
            };
            let deducted_from = match command.funding {
                ExpenseFunding::Own => None,
                ExpenseFunding::DeductedFrom(_) => Some(payer_id.clone()),
            };

            let (expense, debit) = self.unit_of_work("add_expense", |storage| {
                let expense = storage.insert_expense(&NewExpense {
                    staff_id: Arc::from(staff_id),
                    staff_name: Arc::from(staff_name),
                    amount,
                    reason: Arc::from(reason),
                    currency: command.currency,
                    deducted_from,
                    created_at: OffsetDateTime::now_utc(),
                })?;
                let debit = storage.adjust_balance(&payer_id, command.currency, -amount);
                Ok((expense, debit))
            })?;

            let success = match &expense.deducted_from {
                Some(payer) => format!(
                    "Admin expense added (deducted {} {} from Staff {})!",
                    amount,
                    self.settings.currencies.code(command.currency),
                    payer
                ),
                None => "Expense added and balance updated!".to_string(),
            };

            Ok(match debit {
                Ok(balance) => {
                    tracing::info!(
                        staff_id = %expense.staff_id,
                        payer_id = %payer_id,
                        amount = %amount,
                        currency = %command.currency,
                        "Staff expense recorded"
                    );
                    Outcome::committed(
                        ExpenseReceipt { expense, payer_id, payer_balance: Some(balance) },
                        success,
                    )
                }
                Err(e) => Outcome::degraded(
                    ExpenseReceipt { expense, payer_id, payer_balance: None },
                    "Expense added, but failed to update balance.",
                    e.to_string(),
                ),
            })
        })();
        track("add_expense", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerError;
    use crate::storage::InMemoryStorage;
    use remitdesk_core::DeskSettings;
    use rust_decimal_macros::dec;

    fn service() -> LedgerService {
        let service = LedgerService::new(Arc::new(InMemoryStorage::new()), DeskSettings::default());
        service.register_staff("2", "Basheer").unwrap();
        service.register_staff("8", "Tamiz").unwrap();
        service
    }

    fn command(staff_id: &str, amount: Decimal, funding: ExpenseFunding) -> ExpenseCommand {
        ExpenseCommand {
            staff_id: staff_id.to_string(),
            staff_name: "Basheer".to_string(),
            amount,
            reason: "Tea".to_string(),
            currency: Currency::Home,
            funding,
        }
    }

    #[test]
    fn test_self_expense_allows_negative_balance() {
        let service = service();
        service.storage().adjust_balance("2", Currency::Home, dec!(20)).unwrap();
        let outcome = service.add_expense(command("2", dec!(30), ExpenseFunding::Own)).unwrap();
        assert_eq!(outcome.message(), "Expense added and balance updated!");
        assert_eq!(outcome.value().payer_balance, Some(dec!(-10)));
        assert_eq!(service.storage().list_expenses("basheer").unwrap().len(), 1);
    }

    #[test]
    fn test_admin_expense_debits_payer() {
        let service = service();
        let outcome = service
            .add_expense(command("2", dec!(15), ExpenseFunding::DeductedFrom("8".to_string())))
            .unwrap();
        assert_eq!(outcome.message(), "Admin expense added (deducted 15 INR from Staff 8)!");
        assert_eq!(outcome.value().expense.deducted_from.as_deref(), Some("8"));
        assert_eq!(service.storage().get_staff("8").unwrap().balances.home, dec!(-15));
        assert_eq!(service.storage().get_staff("2").unwrap().balances.home, Decimal::ZERO);
    }

    #[test]
    fn test_failed_debit_keeps_record() {
        let service = service();
        let outcome = service.add_expense(command("99", dec!(5), ExpenseFunding::Own)).unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(outcome.message(), "Expense added, but failed to update balance.");
        assert_eq!(service.storage().list_expenses("Basheer").unwrap().len(), 1);
    }

    #[test]
    fn test_expense_requires_reason() {
        let mut cmd = command("2", dec!(5), ExpenseFunding::Own);
        cmd.reason = String::new();
        assert!(matches!(service().add_expense(cmd), Err(LedgerError::Validation(_))));
    }
}
