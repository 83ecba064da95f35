use std::{fmt::Display, str::FromStr, sync::Arc};

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub mod read;
pub mod write;

/// The three currencies a desk keeps balances in.
///
/// `Primary` and `Secondary` are the two foreign currencies. Their display codes
/// are configured per desk through [`CurrencyCodes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    Home,
    Primary,
    Secondary,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Home, Currency::Primary, Currency::Secondary];

    pub fn is_home(self) -> bool {
        matches!(self, Currency::Home)
    }

    /// Decimal places kept for figures in this currency.
    pub fn scale(self) -> u32 {
        match self {
            Currency::Home => 2,
            Currency::Primary | Currency::Secondary => 6,
        }
    }

    /// Rounds half away from zero at this currency's scale.
    pub fn round(self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.scale(), RoundingStrategy::MidpointAwayFromZero)
    }

    /// Smallest magnitude treated as non-zero for running balances.
    pub fn epsilon(self) -> Decimal {
        Decimal::new(1, self.scale())
    }

    /// Rounds and collapses sub-epsilon residue to zero.
    pub fn snap(self, amount: Decimal) -> Decimal {
        let rounded = self.round(amount);
        if rounded.abs() < self.epsilon() {
            Decimal::ZERO
        } else {
            rounded
        }
    }

    /// Stable storage key, independent of the configured display codes.
    pub fn key(self) -> &'static str {
        match self {
            Currency::Home => "home",
            Currency::Primary => "primary",
            Currency::Secondary => "secondary",
        }
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "home" => Ok(Currency::Home),
            "primary" => Ok(Currency::Primary),
            "secondary" => Ok(Currency::Secondary),
            other => Err(format!("unknown currency key: {}", other)),
        }
    }
}

/// How a customer's money is delivered abroad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryRoute {
    Home,
    Primary,
    Secondary,
    /// Bought in the primary currency, delivered in the secondary one.
    PrimaryToSecondary,
}

impl DeliveryRoute {
    pub fn delivered_currency(self) -> Currency {
        match self {
            DeliveryRoute::Home => Currency::Home,
            DeliveryRoute::Primary => Currency::Primary,
            DeliveryRoute::Secondary | DeliveryRoute::PrimaryToSecondary => Currency::Secondary,
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            DeliveryRoute::Home => "home",
            DeliveryRoute::Primary => "primary",
            DeliveryRoute::Secondary => "secondary",
            DeliveryRoute::PrimaryToSecondary => "primary_to_secondary",
        }
    }
}

impl FromStr for DeliveryRoute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "home" => Ok(DeliveryRoute::Home),
            "primary" => Ok(DeliveryRoute::Primary),
            "secondary" => Ok(DeliveryRoute::Secondary),
            "primary_to_secondary" => Ok(DeliveryRoute::PrimaryToSecondary),
            other => Err(format!("unknown delivery route key: {}", other)),
        }
    }
}

/// Display codes for the desk's currencies, e.g. `INR`, `SAR`, `AED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyCodes {
    pub home: Arc<str>,
    pub primary: Arc<str>,
    pub secondary: Arc<str>,
}

impl Default for CurrencyCodes {
    fn default() -> Self {
        Self {
            home: Arc::from("INR"),
            primary: Arc::from("SAR"),
            secondary: Arc::from("AED"),
        }
    }
}

impl CurrencyCodes {
    pub fn code(&self, currency: Currency) -> &str {
        match currency {
            Currency::Home => &self.home,
            Currency::Primary => &self.primary,
            Currency::Secondary => &self.secondary,
        }
    }

    /// Case-insensitive lookup of a display code.
    pub fn parse(&self, code: &str) -> Option<Currency> {
        let code = code.trim();
        Currency::ALL
            .into_iter()
            .find(|c| self.code(*c).eq_ignore_ascii_case(code))
    }

    /// Accepts a plain currency code or the composite `<primary>-<secondary>` label.
    pub fn parse_route(&self, label: &str) -> Option<DeliveryRoute> {
        let label = label.trim();
        if let Some((buy, deliver)) = label.split_once('-') {
            let composite = self.parse(buy) == Some(Currency::Primary)
                && self.parse(deliver) == Some(Currency::Secondary);
            return composite.then_some(DeliveryRoute::PrimaryToSecondary);
        }
        self.parse(label).map(|c| match c {
            Currency::Home => DeliveryRoute::Home,
            Currency::Primary => DeliveryRoute::Primary,
            Currency::Secondary => DeliveryRoute::Secondary,
        })
    }

    pub fn route_label(&self, route: DeliveryRoute) -> String {
        match route {
            DeliveryRoute::PrimaryToSecondary => format!("{}-{}", self.primary, self.secondary),
            other => self.code(other.delivered_currency()).to_string(),
        }
    }
}

/// Staff accounts that collect foreign-currency proceeds from customers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HouseAccounts {
    pub primary: Arc<str>,
    pub secondary: Arc<str>,
}

impl Default for HouseAccounts {
    fn default() -> Self {
        Self {
            primary: Arc::from("8"),
            secondary: Arc::from("9"),
        }
    }
}

impl HouseAccounts {
    /// Returns `None` for the home currency, whose proceeds stay with the transacting staff.
    pub fn for_currency(&self, currency: Currency) -> Option<&Arc<str>> {
        match currency {
            Currency::Home => None,
            Currency::Primary => Some(&self.primary),
            Currency::Secondary => Some(&self.secondary),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeskSettings {
    #[serde(default)]
    pub currencies: CurrencyCodes,
    #[serde(default)]
    pub house_accounts: HouseAccounts,
}

/// The desk-wide conversion rates. A zero rate means the rate has not been set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateSet {
    /// Home units per one primary unit.
    pub primary_to_home: Decimal,
    /// Home units per one secondary unit.
    pub secondary_to_home: Decimal,
    /// Secondary units per one primary unit.
    pub primary_to_secondary: Decimal,
}

impl RateSet {
    /// Home units per one unit of `currency`, or `None` when the rate is unset.
    pub fn to_home(&self, currency: Currency) -> Option<Decimal> {
        let rate = match currency {
            Currency::Home => Decimal::ONE,
            Currency::Primary => self.primary_to_home,
            Currency::Secondary => self.secondary_to_home,
        };
        (rate > Decimal::ZERO).then_some(rate)
    }

    pub fn primary_to_secondary(&self) -> Option<Decimal> {
        (self.primary_to_secondary > Decimal::ZERO).then_some(self.primary_to_secondary)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub home: Decimal,
    pub primary: Decimal,
    pub secondary: Decimal,
}

impl Balances {
    pub fn get(&self, currency: Currency) -> Decimal {
        match currency {
            Currency::Home => self.home,
            Currency::Primary => self.primary,
            Currency::Secondary => self.secondary,
        }
    }

    pub fn get_mut(&mut self, currency: Currency) -> &mut Decimal {
        match currency {
            Currency::Home => &mut self.home,
            Currency::Primary => &mut self.primary,
            Currency::Secondary => &mut self.secondary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Staff {
    pub id: Arc<str>,
    pub name: Arc<str>,
    pub balances: Balances,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerTransaction {
    pub id: Uuid,
    pub sequence: u64,
    pub staff_id: Arc<str>,
    pub staff_name: Option<Arc<str>>,
    pub customer_name: Arc<str>,
    pub amount_sent: Decimal,
    pub received_money: Decimal,
    pub received_currency: Currency,
    pub route: DeliveryRoute,
    /// Set when the delivered amount is in the home currency, zero otherwise.
    pub converted_home: Decimal,
    /// Set when the delivered amount is in a foreign currency, zero otherwise.
    pub converted_foreign: Decimal,
    pub converted_currency: Currency,
    pub customer_balance_home: Decimal,
    pub customer_balance_foreign: Decimal,
    pub description: Arc<str>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffDeposit {
    pub id: Uuid,
    pub sequence: u64,
    pub staff_id: Arc<str>,
    pub staff_name: Option<Arc<str>>,
    /// Negative for the outgoing leg of a staff-to-staff transfer.
    pub amount: Decimal,
    pub currency: Currency,
    pub description: Arc<str>,
    pub deposited_by: Arc<str>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffExpense {
    pub id: Uuid,
    pub sequence: u64,
    pub staff_id: Arc<str>,
    pub staff_name: Arc<str>,
    pub amount: Decimal,
    pub reason: Arc<str>,
    pub currency: Currency,
    /// The staff whose balance actually paid, when different from the attributed one.
    pub deducted_from: Option<Arc<str>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffTransfer {
    pub id: Uuid,
    pub sequence: u64,
    pub sender_id: Arc<str>,
    pub receiver_id: Arc<str>,
    /// Denominated in `currency`, the sender's side of the transfer.
    pub amount: Decimal,
    pub currency: Currency,
    pub description: Arc<str>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(Currency::Home.round(dec!(2.345)), dec!(2.35));
        assert_eq!(Currency::Home.round(dec!(-2.345)), dec!(-2.35));
        assert_eq!(Currency::Primary.round(dec!(0.0000005)), dec!(0.000001));
    }

    #[test]
    fn test_snap_collapses_noise() {
        assert_eq!(Currency::Home.snap(dec!(0.004)), Decimal::ZERO);
        assert_eq!(Currency::Home.snap(dec!(0.01)), dec!(0.01));
        assert_eq!(Currency::Secondary.snap(dec!(-0.0000004)), Decimal::ZERO);
    }

    #[test]
    fn test_codes_parse_case_insensitive() {
        let codes = CurrencyCodes::default();
        assert_eq!(codes.parse(" sar "), Some(Currency::Primary));
        assert_eq!(codes.parse("AED"), Some(Currency::Secondary));
        assert_eq!(codes.parse("usd"), None);
    }

    #[test]
    fn test_parse_route() {
        let codes = CurrencyCodes::default();
        assert_eq!(codes.parse_route("SAR-AED"), Some(DeliveryRoute::PrimaryToSecondary));
        assert_eq!(codes.parse_route("AED"), Some(DeliveryRoute::Secondary));
        assert_eq!(codes.parse_route("INR"), Some(DeliveryRoute::Home));
        assert_eq!(codes.parse_route("AED-SAR"), None);
        assert_eq!(codes.route_label(DeliveryRoute::PrimaryToSecondary), "SAR-AED");
    }

    #[test]
    fn test_unset_rates_are_unavailable() {
        let rates = RateSet::default();
        assert_eq!(rates.to_home(Currency::Home), Some(Decimal::ONE));
        assert_eq!(rates.to_home(Currency::Primary), None);
        assert_eq!(rates.primary_to_secondary(), None);
    }

    #[test]
    fn test_storage_keys_round_trip() {
        for c in Currency::ALL {
            assert_eq!(c.key().parse::<Currency>().unwrap(), c);
        }
        assert_eq!(
            "primary_to_secondary".parse::<DeliveryRoute>().unwrap(),
            DeliveryRoute::PrimaryToSecondary
        );
    }

    #[test]
    fn test_house_accounts() {
        let house = HouseAccounts::default();
        assert_eq!(house.for_currency(Currency::Primary).map(|s| s.as_ref()), Some("8"));
        assert!(house.for_currency(Currency::Home).is_none());
    }
}
