use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;

use remitdesk_core::{
    Currency, CustomerTransaction, DeliveryRoute, NewCustomerTransaction, NewDeposit,
    StaffDeposit, StorageBackend,
};

use super::{required, track, LedgerError, LedgerResult, LedgerService, Outcome};
use crate::conversion::{quote_send, SendQuote};

/// A customer paying at the desk to have money delivered.
///
/// Amounts are already parsed leniently by the caller; negative values count as
/// zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SendMoneyCommand {
    pub staff_id: String,
    pub staff_name: Option<String>,
    pub customer_name: String,
    /// Home currency.
    pub amount_sent: Decimal,
    pub received_money: Decimal,
    pub received_currency: Currency,
    pub route: DeliveryRoute,
    pub description: Option<String>,
    pub transaction_date: Option<OffsetDateTime>,
}

/// What happened to the customer's payment after the transaction was recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AutoCredit {
    NotRequired,
    Credited { deposit: StaffDeposit },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMoneyReceipt {
    pub transaction: CustomerTransaction,
    /// The transacting staff's home balance after the debit, when one was made.
    pub staff_home_balance: Option<Decimal>,
    pub customer_balance_home: Decimal,
    pub customer_balance_foreign: Decimal,
    pub converted_amount: Decimal,
    pub converted_currency: Currency,
    pub auto_credit: AutoCredit,
}

impl LedgerService {
    pub fn send_money(&self, command: SendMoneyCommand) -> LedgerResult<SendMoneyReceipt> {
        track("send_money", self.send_money_inner(command))
    }

    fn send_money_inner(&self, command: SendMoneyCommand) -> LedgerResult<SendMoneyReceipt> {
        let staff_id = required(&command.staff_id, "staffId")?.to_string();
        let customer_name = required(&command.customer_name, "customerName")?.to_string();
        let amount_sent = command.amount_sent.max(Decimal::ZERO);
        let received_money = command.received_money.max(Decimal::ZERO);
        let created_at = command.transaction_date.unwrap_or_else(OffsetDateTime::now_utc);
        if i64::try_from(created_at.unix_timestamp_nanos()).is_err() {
            return Err(LedgerError::Validation("transactionDate is out of range".to_string()));
        }
        let description = command.description.unwrap_or_default();

        let receipt = self.unit_of_work("send_money", |storage| {
            let rates = storage.get_rates()?;
            let quote = quote_send(&rates, command.route, amount_sent, received_money, command.received_currency)?;

            let staff_home_balance = if amount_sent > Decimal::ZERO {
                let balance = storage.lock_balance(&staff_id, Currency::Home)?;
                if balance < amount_sent {
                    return Err(LedgerError::InsufficientBalance {
                        staff_id: staff_id.clone(),
                        currency: Currency::Home,
                    });
                }
                let new_balance = Currency::Home.round(balance - amount_sent);
                storage.set_balance(&staff_id, Currency::Home, new_balance)?;
                Some(new_balance)
            } else {
                None
            };

            let (prev_home, prev_foreign) = storage
                .latest_customer_transaction(&customer_name)?
                .map(|t| (t.customer_balance_home, t.customer_balance_foreign))
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));

            let customer_balance_home = running_balance(
                Currency::Home,
                prev_home,
                amount_sent,
                quote.received_home_equivalent,
                &customer_name,
            )?;
            let customer_balance_foreign = running_balance(
                Currency::Secondary,
                prev_foreign,
                quote.foreign_equivalent,
                received_money,
                &customer_name,
            )?;

            let staff_name = match command.staff_name.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => Some(Arc::from(name)),
                _ => storage.get_staff(&staff_id).ok().map(|s| s.name),
            };

            let transaction = storage.insert_transaction(&NewCustomerTransaction {
                staff_id: Arc::from(staff_id.as_str()),
                staff_name,
                customer_name: Arc::from(customer_name.as_str()),
                amount_sent: Currency::Home.round(amount_sent),
                received_money: Currency::Secondary.round(received_money),
                received_currency: command.received_currency,
                route: command.route,
                converted_home: quote.converted_home(),
                converted_foreign: quote.converted_foreign(),
                converted_currency: quote.converted_currency,
                customer_balance_home,
                customer_balance_foreign,
                description: Arc::from(description.as_str()),
                created_at,
            })?;

            let auto_credit = self.credit_proceeds(storage, &transaction, &quote)?;

            Ok(SendMoneyReceipt {
                staff_home_balance,
                customer_balance_home,
                customer_balance_foreign,
                converted_amount: quote.converted_amount,
                converted_currency: quote.converted_currency,
                auto_credit,
                transaction,
            })
        })?;

        tracing::info!(
            staff_id = %receipt.transaction.staff_id,
            customer = %receipt.transaction.customer_name,
            amount_sent = %receipt.transaction.amount_sent,
            converted = %receipt.converted_amount,
            converted_currency = %receipt.converted_currency,
            "Customer transaction recorded"
        );

        let message = "Transaction recorded";
        let failure = match &receipt.auto_credit {
            AutoCredit::Failed { reason } => Some(reason.clone()),
            _ => None,
        };
        Ok(match failure {
            Some(cause) => Outcome::degraded(receipt, message, cause),
            None => Outcome::committed(receipt, message),
        })
    }

    /// Credits what the customer paid to the staff who keeps that currency, with its
    /// audit deposit. A failure here leaves the transaction standing and is reported
    /// as `AutoCredit::Failed`; only a failure to undo a half-applied credit aborts.
    fn credit_proceeds(
        &self,
        storage: &dyn StorageBackend,
        transaction: &CustomerTransaction,
        quote: &SendQuote,
    ) -> Result<AutoCredit, LedgerError> {
        if transaction.received_money.is_zero() {
            return Ok(AutoCredit::NotRequired);
        }

        let currency = transaction.received_currency;
        let target = match self.settings.house_accounts.for_currency(currency) {
            Some(house) => house.clone(),
            None => transaction.staff_id.clone(),
        };
        let value = if currency.is_home() {
            quote.received_home_equivalent
        } else {
            currency.round(transaction.received_money)
        };

        let staff = match storage.get_staff(&target) {
            Ok(staff) => staff,
            Err(e) => {
                return Ok(AutoCredit::Failed {
                    reason: format!("Failed to credit staff {}: {}", target, e),
                })
            }
        };

        if let Err(e) = storage.adjust_balance(&target, currency, value) {
            return Ok(AutoCredit::Failed {
                reason: format!("Failed to credit staff {}: {}", target, e),
            });
        }

        let trimmed = transaction.description.trim();
        let description = if trimmed.is_empty() {
            format!("Auto credit from {}", transaction.customer_name)
        } else {
            trimmed.to_string()
        };

        let deposit = storage.insert_deposit(&NewDeposit {
            staff_id: target.clone(),
            staff_name: Some(staff.name),
            amount: value,
            currency,
            description: Arc::from(description.as_str()),
            deposited_by: Arc::from(format!("{} (customer)", transaction.customer_name).as_str()),
            created_at: transaction.created_at,
        });

        match deposit {
            Ok(deposit) => {
                tracing::debug!(staff_id = %target, amount = %value, currency = %currency, "Customer proceeds credited");
                Ok(AutoCredit::Credited { deposit })
            }
            Err(e) => {
                storage.adjust_balance(&target, currency, -value)?;
                Ok(AutoCredit::Failed {
                    reason: format!("Failed to log auto deposit for staff {}: {}", target, e),
                })
            }
        }
    }
}

/// `previous + owed - paid`, snapped to `currency`'s precision.
fn running_balance(
    currency: Currency,
    previous: Decimal,
    owed: Decimal,
    paid: Decimal,
    customer_name: &str,
) -> Result<Decimal, LedgerError> {
    previous
        .checked_add(owed)
        .and_then(|balance| balance.checked_sub(paid))
        .map(|balance| currency.snap(balance))
        .ok_or_else(|| {
            LedgerError::Validation(format!("Running {} balance for {} is out of range", currency, customer_name))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use remitdesk_core::{DeskSettings, RateSet};
    use rust_decimal_macros::dec;

    fn service() -> LedgerService {
        let service = LedgerService::new(Arc::new(InMemoryStorage::new()), DeskSettings::default());
        service.register_staff("1", "Ali").unwrap();
        service.register_staff("8", "Tamiz").unwrap();
        service
            .set_rates(RateSet {
                primary_to_home: dec!(20),
                secondary_to_home: dec!(22),
                primary_to_secondary: dec!(0.93),
            })
            .unwrap();
        service.storage().adjust_balance("1", Currency::Home, dec!(1000)).unwrap();
        service
    }

    fn command(amount_sent: Decimal, received_money: Decimal, received_currency: Currency) -> SendMoneyCommand {
        SendMoneyCommand {
            staff_id: "1".to_string(),
            staff_name: None,
            customer_name: "Rahim".to_string(),
            amount_sent,
            received_money,
            received_currency,
            route: DeliveryRoute::Primary,
            description: None,
            transaction_date: None,
        }
    }

    #[test]
    fn test_send_money_primary_route() {
        let service = service();
        let outcome = service.send_money(command(dec!(500), Decimal::ZERO, Currency::Home)).unwrap();
        assert!(!outcome.is_degraded());
        let receipt = outcome.value();
        assert_eq!(receipt.customer_balance_home, dec!(500));
        assert_eq!(receipt.customer_balance_foreign, dec!(25));
        assert_eq!(receipt.transaction.converted_foreign, dec!(25));
        assert_eq!(receipt.transaction.converted_currency, Currency::Primary);
        assert_eq!(receipt.staff_home_balance, Some(dec!(500)));
        assert_eq!(receipt.transaction.staff_name.as_deref(), Some("Ali"));
        assert_eq!(receipt.auto_credit, AutoCredit::NotRequired);
    }

    #[test]
    fn test_insufficient_staff_balance_aborts() {
        let service = service();
        let err = service.send_money(command(dec!(1500), Decimal::ZERO, Currency::Home)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { currency: Currency::Home, .. }));
        assert!(service.storage().list_transactions().unwrap().is_empty());
        assert_eq!(service.storage().get_staff("1").unwrap().balances.home, dec!(1000));
    }

    #[test]
    fn test_foreign_payment_credits_house_account() {
        let service = service();
        let outcome = service.send_money(command(dec!(500), dec!(25), Currency::Primary)).unwrap();
        let receipt = outcome.value();
        assert_eq!(receipt.customer_balance_home, Decimal::ZERO);
        assert_eq!(receipt.customer_balance_foreign, Decimal::ZERO);

        let AutoCredit::Credited { deposit } = &receipt.auto_credit else {
            panic!("expected a credit, got {:?}", receipt.auto_credit);
        };
        assert_eq!(deposit.staff_id.as_ref(), "8");
        assert_eq!(deposit.deposited_by.as_ref(), "Rahim (customer)");
        assert_eq!(deposit.description.as_ref(), "Auto credit from Rahim");
        assert_eq!(service.storage().get_staff("8").unwrap().balances.primary, dec!(25));
    }

    #[test]
    fn test_missing_house_account_degrades() {
        let service = service();
        let outcome = service.send_money(command(dec!(100), dec!(3), Currency::Secondary)).unwrap();
        assert!(outcome.is_degraded());
        assert_eq!(outcome.message(), "Transaction recorded");
        assert_eq!(service.storage().list_transactions().unwrap().len(), 1);
        assert!(service.storage().search_deposits("Rahim").unwrap().is_empty());
    }

    #[test]
    fn test_missing_rate_degrades_conversion_to_zero() {
        let service = service();
        service.set_rates(RateSet::default()).unwrap();
        let outcome = service.send_money(command(dec!(500), Decimal::ZERO, Currency::Home)).unwrap();
        assert_eq!(outcome.value().converted_amount, Decimal::ZERO);
        assert_eq!(outcome.value().customer_balance_home, dec!(500));
    }

    #[test]
    fn test_requires_customer_name() {
        let mut cmd = command(dec!(1), Decimal::ZERO, Currency::Home);
        cmd.customer_name = "  ".to_string();
        assert!(matches!(service().send_money(cmd), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_oversized_payment_is_rejected_and_desk_keeps_working() {
        let service = service();
        let err = service.send_money(command(Decimal::ZERO, Decimal::MAX, Currency::Primary)).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert!(service.storage().list_transactions().unwrap().is_empty());

        let outcome = service.send_money(command(dec!(500), Decimal::ZERO, Currency::Home)).unwrap();
        assert_eq!(outcome.value().customer_balance_home, dec!(500));
    }

    #[test]
    fn test_running_balance_overflow_is_rejected() {
        let service = service();
        let mut cmd = command(Decimal::ZERO, Decimal::MAX, Currency::Home);
        cmd.route = DeliveryRoute::Home;
        service.send_money(cmd.clone()).unwrap();

        let err = service.send_money(cmd).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(service.storage().list_transactions().unwrap().len(), 1);
    }
}
