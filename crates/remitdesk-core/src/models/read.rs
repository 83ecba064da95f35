//! Presentation views assembled by the query side from raw records.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Balances, Currency, RateSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffView {
    pub id: Arc<str>,
    pub name: Arc<str>,
    pub balances: Balances,
    pub primary_in_home: Decimal,
    pub secondary_in_home: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub id: Uuid,
    pub staff_id: Arc<str>,
    pub staff_name: Option<Arc<str>>,
    pub customer_name: Arc<str>,
    pub amount_sent: Decimal,
    pub received_money: Decimal,
    pub received_currency: Arc<str>,
    pub route: String,
    pub converted_home: Decimal,
    pub converted_foreign: Decimal,
    pub converted_currency: Currency,
    pub converted_display: String,
    pub balance_home: Decimal,
    pub balance_foreign: Decimal,
    pub rates: RateSet,
    pub description: Arc<str>,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositView {
    pub id: Uuid,
    pub staff_id: Arc<str>,
    pub staff_name: Option<Arc<str>>,
    pub amount: Decimal,
    pub currency: Arc<str>,
    pub description: Arc<str>,
    pub deposited_by: Arc<str>,
    pub deposited_by_name: Arc<str>,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseView {
    pub id: Uuid,
    pub staff_id: Arc<str>,
    pub staff_name: Arc<str>,
    pub amount: Decimal,
    pub reason: Arc<str>,
    pub currency: Arc<str>,
    pub deducted_from: Option<Arc<str>>,
    pub deducted_from_name: Option<Arc<str>>,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
}
