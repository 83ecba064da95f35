use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;

use super::{Currency, DeliveryRoute};

#[derive(Debug, Clone, PartialEq)]
pub struct CreateStaffCommand {
    pub id: Arc<str>,
    pub name: Arc<str>,
}

/// A customer transaction ready to be appended. The backend assigns `id` and `sequence`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCustomerTransaction {
    pub staff_id: Arc<str>,
    pub staff_name: Option<Arc<str>>,
    pub customer_name: Arc<str>,
    pub amount_sent: Decimal,
    pub received_money: Decimal,
    pub received_currency: Currency,
    pub route: DeliveryRoute,
    pub converted_home: Decimal,
    pub converted_foreign: Decimal,
    pub converted_currency: Currency,
    pub customer_balance_home: Decimal,
    pub customer_balance_foreign: Decimal,
    pub description: Arc<str>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDeposit {
    pub staff_id: Arc<str>,
    pub staff_name: Option<Arc<str>>,
    pub amount: Decimal,
    pub currency: Currency,
    pub description: Arc<str>,
    pub deposited_by: Arc<str>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExpense {
    pub staff_id: Arc<str>,
    pub staff_name: Arc<str>,
    pub amount: Decimal,
    pub reason: Arc<str>,
    pub currency: Currency,
    pub deducted_from: Option<Arc<str>>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTransfer {
    pub sender_id: Arc<str>,
    pub receiver_id: Arc<str>,
    pub amount: Decimal,
    pub currency: Currency,
    pub description: Arc<str>,
    pub created_at: OffsetDateTime,
}
