use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use remitdesk_core::{Currency, NewDeposit, StaffDeposit};

use super::{positive, required, track, LedgerResult, LedgerService, Outcome};

#[derive(Debug, Clone, PartialEq)]
pub struct DepositCommand {
    pub staff_id: String,
    pub staff_name: Option<String>,
    pub amount: Decimal,
    pub currency: Currency,
    pub description: Option<String>,
    pub deposited_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositReceipt {
    pub deposit: StaffDeposit,
    pub updated_balance: Decimal,
}

fn or_default(value: Option<String>, default: &str) -> Arc<str> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Arc::from(v),
        _ => Arc::from(default),
    }
}

impl LedgerService {
    /// Adds `amount` to the staff's balance and logs the deposit. Both happen or neither does.
    pub fn deposit(&self, command: DepositCommand) -> LedgerResult<DepositReceipt> {
        let result = (|| -> LedgerResult<DepositReceipt> {
            let staff_id = required(&command.staff_id, "staffId")?.to_string();
            let amount = positive(command.amount, "amount")?;
            let description = or_default(command.description.clone(), "Deposit");
            let deposited_by = or_default(command.deposited_by.clone(), "Admin");

            let receipt = self.unit_of_work("deposit", |storage| {
                let staff = storage.get_staff(&staff_id)?;
                let updated_balance = storage.adjust_balance(&staff.id, command.currency, amount)?;
                let staff_name = match command.staff_name.as_deref().map(str::trim) {
                    Some(name) if !name.is_empty() => Arc::from(name),
                    _ => staff.name.clone(),
                };
                let deposit = storage.insert_deposit(&NewDeposit {
                    staff_id: staff.id.clone(),
                    staff_name: Some(staff_name),
                    amount,
                    currency: command.currency,
                    description,
                    deposited_by,
                    created_at: OffsetDateTime::now_utc(),
                })?;
                Ok(DepositReceipt { deposit, updated_balance })
            })?;

            tracing::info!(
                staff_id = %receipt.deposit.staff_id,
                amount = %amount,
                currency = %command.currency,
                balance = %receipt.updated_balance,
                "Staff deposit recorded"
            );
            Ok(Outcome::committed(receipt, "Deposit saved successfully"))
        })();
        track("deposit", result)
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
        service.register_staff("3", "Sami").unwrap();
        service
    }

    fn command(staff_id: &str, amount: Decimal) -> DepositCommand {
        DepositCommand {
            staff_id: staff_id.to_string(),
            staff_name: None,
            amount,
            currency: Currency::Secondary,
            description: None,
            deposited_by: None,
        }
    }

    #[test]
    fn test_deposit_applies_defaults() {
        let service = service();
        let receipt = service.deposit(command("3", dec!(50))).unwrap().into_value();
        assert_eq!(receipt.updated_balance, dec!(50));
        assert_eq!(receipt.deposit.description.as_ref(), "Deposit");
        assert_eq!(receipt.deposit.deposited_by.as_ref(), "Admin");
        assert_eq!(receipt.deposit.staff_name.as_deref(), Some("Sami"));
    }

    #[test]
    fn test_deposit_rejects_non_positive_amount() {
        assert!(matches!(service().deposit(command("3", Decimal::ZERO)), Err(LedgerError::Validation(_))));
        assert!(matches!(service().deposit(command("3", dec!(-5))), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_deposit_unknown_staff_leaves_no_record() {
        let service = service();
        assert!(matches!(service.deposit(command("77", dec!(5))), Err(LedgerError::NotFound(_))));
        assert!(service.storage().list_deposits("77").unwrap().is_empty());
    }
}
