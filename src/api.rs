//! HTTP surface. Handlers parse and validate wire values (currency codes, routes,
//! lenient amounts) and hand typed commands to the ledger on the blocking pool.

use std::{str::FromStr, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use remitdesk_core::{Currency, CurrencyCodes, DeliveryRoute, RateSet, StorageError};

use crate::auth::{auth_middleware, require_admin, CallerIdentity};
use crate::config::AuthConfig;
use crate::ledger::{
    DepositCommand, ExpenseCommand, ExpenseFunding, LedgerError, LedgerService, Outcome,
    SendMoneyCommand, TransferCommand,
};
use crate::queries::RecordQueries;

pub struct AppState {
    pub ledger: Arc<LedgerService>,
    pub queries: Arc<RecordQueries>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(ledger: Arc<LedgerService>, metrics: Option<PrometheusHandle>) -> Self {
        let queries = Arc::new(RecordQueries::new(ledger.storage().clone(), ledger.settings()));
        Self { ledger, queries, metrics }
    }

    fn codes(&self) -> &CurrencyCodes {
        &self.ledger.settings().currencies
    }
}

type SharedState = Arc<AppState>;

pub fn router(state: SharedState, auth: Arc<AuthConfig>) -> Router {
    let protected = Router::new()
        .route("/staff", post(register_staff).get(list_staff))
        .route("/staff/:id", get(get_staff).delete(remove_staff))
        .route("/staff/:id/deposits", get(staff_deposits))
        .route("/rates", post(set_rates).get(get_rates))
        .route("/send-money", post(send_money))
        .route("/transactions", get(list_transactions))
        .route("/transactions/:id", delete(delete_transaction))
        .route("/deposits", post(add_deposit))
        .route("/deposits/search", get(search_deposits))
        .route("/expenses", post(add_expense))
        .route("/expenses/:staff_name", get(staff_expenses))
        .route("/staff-to-staff", post(staff_to_staff))
        .route("/transfers", get(list_transfers))
        .route("/customers", get(customers))
        .route_layer(middleware::from_fn(auth_middleware))
        .layer(Extension(auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .merge(protected)
        .with_state(state)
}

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn outcome_response<T: Serialize>(result: Result<Outcome<T>, LedgerError>, codes: &CurrencyCodes) -> Response {
    match result {
        Ok(outcome) => {
            let message = outcome.message().to_string();
            let degraded = outcome.cause().map(str::to_string);
            Json(ApiResponse {
                success: true,
                message,
                degraded,
                data: Some(outcome.into_value()),
            })
            .into_response()
        }
        Err(e) => error_response(&e, codes),
    }
}

fn data_response<T: Serialize>(result: Result<T, LedgerError>, codes: &CurrencyCodes) -> Response {
    match result {
        Ok(data) => Json(ApiResponse {
            success: true,
            message: "OK".to_string(),
            degraded: None,
            data: Some(data),
        })
        .into_response(),
        Err(e) => error_response(&e, codes),
    }
}

fn error_response(e: &LedgerError, codes: &CurrencyCodes) -> Response {
    let (status, message) = match e {
        LedgerError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        LedgerError::InsufficientBalance { staff_id, currency } => (
            StatusCode::BAD_REQUEST,
            format!("Staff {} does not have enough {} balance", staff_id, codes.code(*currency)),
        ),
        LedgerError::RateUnavailable { from, to } => (
            StatusCode::BAD_REQUEST,
            format!(
                "Conversion rate not available for these currencies ({} -> {})",
                codes.code(*from),
                codes.code(*to)
            ),
        ),
        LedgerError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        LedgerError::Storage(err) => {
            tracing::error!(error = %err, "Request failed in storage");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
        }
    };
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            message,
            degraded: None,
            data: None,
        }),
    )
        .into_response()
}

/// Ledger calls block on storage locks, so they run off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, LedgerError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| LedgerError::Storage(StorageError::Other(format!("worker task failed: {}", e))))?
}

/// Absent, null, or unparseable amounts read as zero.
fn lenient_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Decimal, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .unwrap_or(Decimal::ZERO),
        Some(Value::String(s)) => Decimal::from_str(s.trim()).unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    })
}

/// Staff ids arrive as either JSON strings or numbers.
fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

fn lenient_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let id = lenient_id(deserializer)?;
    Ok((!id.trim().is_empty()).then_some(id))
}

fn parse_currency(codes: &CurrencyCodes, code: Option<&str>, field: &str) -> Result<Currency, LedgerError> {
    match code.map(str::trim) {
        None | Some("") => Err(LedgerError::Validation(format!("{} is required", field))),
        Some(code) => codes
            .parse(code)
            .ok_or_else(|| LedgerError::Validation(format!("Unsupported currency: {}", code))),
    }
}

fn parse_route(codes: &CurrencyCodes, label: Option<&str>) -> Result<DeliveryRoute, LedgerError> {
    match label.map(str::trim) {
        None | Some("") => Ok(DeliveryRoute::Home),
        Some(label) => codes
            .parse_route(label)
            .ok_or_else(|| LedgerError::Validation(format!("Unsupported delivery route: {}", label))),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics(State(state): State<SharedState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct RegisterStaffRequest {
    #[serde(default, deserialize_with = "lenient_id")]
    id: String,
    #[serde(default)]
    name: String,
}

async fn register_staff(
    State(state): State<SharedState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(req): Json<RegisterStaffRequest>,
) -> Response {
    if let Err(denied) = require_admin(&caller) {
        return denied;
    }
    let ledger = state.ledger.clone();
    let result = blocking(move || ledger.register_staff(&req.id, &req.name)).await;
    outcome_response(result, state.codes())
}

async fn list_staff(State(state): State<SharedState>) -> Response {
    let queries = state.queries.clone();
    data_response(blocking(move || queries.staff_overview()).await, state.codes())
}

async fn get_staff(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    let queries = state.queries.clone();
    data_response(blocking(move || queries.staff(&id)).await, state.codes())
}

async fn remove_staff(
    State(state): State<SharedState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&caller) {
        return denied;
    }
    let ledger = state.ledger.clone();
    outcome_response(blocking(move || ledger.remove_staff(&id)).await, state.codes())
}

async fn staff_deposits(State(state): State<SharedState>, Path(id): Path<String>) -> Response {
    let queries = state.queries.clone();
    data_response(blocking(move || queries.staff_deposits(&id)).await, state.codes())
}

async fn set_rates(
    State(state): State<SharedState>,
    Extension(caller): Extension<CallerIdentity>,
    Json(rates): Json<RateSet>,
) -> Response {
    if let Err(denied) = require_admin(&caller) {
        return denied;
    }
    let ledger = state.ledger.clone();
    outcome_response(blocking(move || ledger.set_rates(rates)).await, state.codes())
}

async fn get_rates(State(state): State<SharedState>) -> Response {
    let queries = state.queries.clone();
    data_response(blocking(move || queries.rates()).await, state.codes())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMoneyRequest {
    #[serde(default, deserialize_with = "lenient_id")]
    staff_id: String,
    staff_name: Option<String>,
    #[serde(default)]
    customer_name: String,
    #[serde(default, deserialize_with = "lenient_amount")]
    amount_sent: Decimal,
    #[serde(default, deserialize_with = "lenient_amount")]
    received_money: Decimal,
    #[serde(alias = "currency")]
    received_currency: Option<String>,
    #[serde(alias = "sendCountry")]
    route: Option<String>,
    transaction_date: Option<String>,
    description: Option<String>,
}

impl SendMoneyRequest {
    fn into_command(self, codes: &CurrencyCodes) -> Result<SendMoneyCommand, LedgerError> {
        let received_currency = parse_currency(codes, self.received_currency.as_deref(), "currency")?;
        let route = parse_route(codes, self.route.as_deref())?;
        let transaction_date = match self.transaction_date.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| {
                LedgerError::Validation(format!("Invalid transactionDate '{}': {}", raw, e))
            })?),
        };
        Ok(SendMoneyCommand {
            staff_id: self.staff_id,
            staff_name: self.staff_name,
            customer_name: self.customer_name,
            amount_sent: self.amount_sent,
            received_money: self.received_money,
            received_currency,
            route,
            description: self.description,
            transaction_date,
        })
    }
}

async fn send_money(State(state): State<SharedState>, Json(req): Json<SendMoneyRequest>) -> Response {
    let command = match req.into_command(state.codes()) {
        Ok(command) => command,
        Err(e) => return error_response(&e, state.codes()),
    };
    let ledger = state.ledger.clone();
    outcome_response(blocking(move || ledger.send_money(command)).await, state.codes())
}

async fn list_transactions(State(state): State<SharedState>) -> Response {
    let queries = state.queries.clone();
    data_response(blocking(move || queries.transactions()).await, state.codes())
}

async fn delete_transaction(
    State(state): State<SharedState>,
    Extension(caller): Extension<CallerIdentity>,
    Path(id): Path<String>,
) -> Response {
    if let Err(denied) = require_admin(&caller) {
        return denied;
    }
    let id = match Uuid::parse_str(id.trim()) {
        Ok(id) => id,
        Err(_) => {
            let e = LedgerError::Validation(format!("Invalid transaction id: {}", id));
            return error_response(&e, state.codes());
        }
    };
    let ledger = state.ledger.clone();
    outcome_response(blocking(move || ledger.delete_transaction(id)).await, state.codes())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepositRequest {
    #[serde(default, deserialize_with = "lenient_id")]
    staff_id: String,
    staff_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_amount")]
    amount: Decimal,
    currency: Option<String>,
    description: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_id")]
    deposited_by: Option<String>,
}

async fn add_deposit(State(state): State<SharedState>, Json(req): Json<DepositRequest>) -> Response {
    let currency = match parse_currency(state.codes(), req.currency.as_deref(), "currency") {
        Ok(currency) => currency,
        Err(e) => return error_response(&e, state.codes()),
    };
    let command = DepositCommand {
        staff_id: req.staff_id,
        staff_name: req.staff_name,
        amount: req.amount,
        currency,
        description: req.description,
        deposited_by: req.deposited_by,
    };
    let ledger = state.ledger.clone();
    outcome_response(blocking(move || ledger.deposit(command)).await, state.codes())
}

#[derive(Deserialize)]
struct SearchParams {
    query: Option<String>,
}

async fn search_deposits(State(state): State<SharedState>, Query(params): Query<SearchParams>) -> Response {
    let queries = state.queries.clone();
    let query = params.query.unwrap_or_default();
    data_response(blocking(move || queries.search_deposits(&query)).await, state.codes())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpenseRequest {
    #[serde(default, deserialize_with = "lenient_id")]
    staff_id: String,
    #[serde(default)]
    staff_name: String,
    #[serde(default, deserialize_with = "lenient_amount")]
    amount: Decimal,
    #[serde(default)]
    reason: String,
    currency: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_id")]
    deducted_from_staff_id: Option<String>,
}

async fn add_expense(State(state): State<SharedState>, Json(req): Json<ExpenseRequest>) -> Response {
    let currency = match parse_currency(state.codes(), req.currency.as_deref(), "currency") {
        Ok(currency) => currency,
        Err(e) => return error_response(&e, state.codes()),
    };
    let funding = match req.deducted_from_staff_id {
        Some(payer) => ExpenseFunding::DeductedFrom(payer),
        None => ExpenseFunding::Own,
    };
    let command = ExpenseCommand {
        staff_id: req.staff_id,
        staff_name: req.staff_name,
        amount: req.amount,
        reason: req.reason,
        currency,
        funding,
    };
    let ledger = state.ledger.clone();
    outcome_response(blocking(move || ledger.add_expense(command)).await, state.codes())
}

async fn staff_expenses(State(state): State<SharedState>, Path(staff_name): Path<String>) -> Response {
    let queries = state.queries.clone();
    data_response(blocking(move || queries.staff_expenses(&staff_name)).await, state.codes())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferRequest {
    #[serde(default, deserialize_with = "lenient_id")]
    sender_id: String,
    #[serde(default, deserialize_with = "lenient_id")]
    receiver_id: String,
    #[serde(default, deserialize_with = "lenient_amount")]
    amount: Decimal,
    send_currency: Option<String>,
    receive_currency: Option<String>,
    description: Option<String>,
}

impl TransferRequest {
    fn into_command(self, codes: &CurrencyCodes) -> Result<TransferCommand, LedgerError> {
        Ok(TransferCommand {
            send_currency: parse_currency(codes, self.send_currency.as_deref(), "sendCurrency")?,
            receive_currency: parse_currency(codes, self.receive_currency.as_deref(), "receiveCurrency")?,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            amount: self.amount,
            description: self.description,
        })
    }
}

async fn staff_to_staff(State(state): State<SharedState>, Json(req): Json<TransferRequest>) -> Response {
    let command = match req.into_command(state.codes()) {
        Ok(command) => command,
        Err(e) => return error_response(&e, state.codes()),
    };
    let ledger = state.ledger.clone();
    outcome_response(blocking(move || ledger.transfer(command)).await, state.codes())
}

async fn list_transfers(State(state): State<SharedState>) -> Response {
    let queries = state.queries.clone();
    data_response(blocking(move || queries.transfers()).await, state.codes())
}

#[derive(Deserialize)]
struct CustomerParams {
    search: Option<String>,
}

async fn customers(State(state): State<SharedState>, Query(params): Query<CustomerParams>) -> Response {
    let queries = state.queries.clone();
    let search = params.search.unwrap_or_default();
    data_response(blocking(move || queries.customers(&search)).await, state.codes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_send_money_request_is_lenient() {
        let req: SendMoneyRequest = serde_json::from_value(serde_json::json!({
            "staffId": 8,
            "customerName": "Rahim",
            "amountSent": "500.50",
            "receivedMoney": "abc",
            "currency": "sar",
            "sendCountry": "SAR-AED"
        }))
        .unwrap();
        assert_eq!(req.staff_id, "8");
        assert_eq!(req.amount_sent, dec!(500.50));
        assert_eq!(req.received_money, Decimal::ZERO);

        let command = req.into_command(&CurrencyCodes::default()).unwrap();
        assert_eq!(command.received_currency, Currency::Primary);
        assert_eq!(command.route, DeliveryRoute::PrimaryToSecondary);
    }

    #[test]
    fn test_missing_amounts_default_to_zero() {
        let req: SendMoneyRequest = serde_json::from_value(serde_json::json!({
            "staffId": "1",
            "customerName": "Rahim",
            "amountSent": 250.75,
            "currency": "INR"
        }))
        .unwrap();
        assert_eq!(req.amount_sent, dec!(250.75));
        assert_eq!(req.received_money, Decimal::ZERO);
        let command = req.into_command(&CurrencyCodes::default()).unwrap();
        assert_eq!(command.route, DeliveryRoute::Home);
        assert!(command.transaction_date.is_none());
    }

    #[test]
    fn test_unknown_codes_are_rejected() {
        let codes = CurrencyCodes::default();
        assert!(matches!(parse_currency(&codes, Some("USD"), "currency"), Err(LedgerError::Validation(_))));
        assert!(matches!(parse_currency(&codes, None, "currency"), Err(LedgerError::Validation(_))));
        assert!(matches!(parse_route(&codes, Some("AED-SAR")), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_transaction_date_must_be_rfc3339() {
        let req: SendMoneyRequest = serde_json::from_value(serde_json::json!({
            "staffId": "1",
            "customerName": "Rahim",
            "currency": "INR",
            "transactionDate": "yesterday"
        }))
        .unwrap();
        assert!(matches!(req.into_command(&CurrencyCodes::default()), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_expense_request_blank_payer_means_own() {
        let req: ExpenseRequest = serde_json::from_value(serde_json::json!({
            "staffId": 2,
            "staffName": "Basheer",
            "amount": 30,
            "reason": "Tea",
            "currency": "INR",
            "deductedFromStaffId": ""
        }))
        .unwrap();
        assert!(req.deducted_from_staff_id.is_none());
        assert_eq!(req.amount, dec!(30));
    }
}
