//! Conversion between the desk's three currencies using the current [`RateSet`].
//!
//! Every function here is pure: callers fetch the rate set once at the start of an
//! operation and pass the same value to every conversion within it.

use rust_decimal::Decimal;
use thiserror::Error;

use remitdesk_core::{Currency, DeliveryRoute, RateSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("conversion rate unavailable: {from} -> {to}")]
pub struct RateUnavailable {
    pub from: Currency,
    pub to: Currency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error(transparent)]
    RateUnavailable(#[from] RateUnavailable),
    #[error("amount {amount} is too large to convert")]
    Overflow { amount: Decimal },
}

/// Converts `amount` from one currency to another, rounding to the target's scale.
///
/// Same-currency conversion returns `amount` untouched, without consulting `rates`.
pub fn convert(rates: &RateSet, amount: Decimal, from: Currency, to: Currency) -> Result<Decimal, ConversionError> {
    if from == to {
        return Ok(amount);
    }
    let unavailable = RateUnavailable { from, to };
    let to_home = |currency: Currency| rates.to_home(currency).ok_or(unavailable);
    let cross = || rates.primary_to_secondary().ok_or(unavailable);

    let converted = match (from, to) {
        (Currency::Home, foreign) => amount.checked_div(to_home(foreign)?),
        (foreign, Currency::Home) => amount.checked_mul(to_home(foreign)?),
        (Currency::Primary, Currency::Secondary) => amount.checked_mul(cross()?),
        (Currency::Secondary, Currency::Primary) => amount.checked_div(cross()?),
        _ => return Err(unavailable.into()),
    };

    let converted = converted.ok_or(ConversionError::Overflow { amount })?;
    Ok(to.round(converted))
}

/// Home amount bought as primary currency and delivered as secondary.
pub fn home_to_secondary_via_primary(rates: &RateSet, amount: Decimal) -> Result<Decimal, ConversionError> {
    let to_home = rates.to_home(Currency::Primary).ok_or(RateUnavailable {
        from: Currency::Home,
        to: Currency::Primary,
    })?;
    let cross = rates.primary_to_secondary().ok_or(RateUnavailable {
        from: Currency::Primary,
        to: Currency::Secondary,
    })?;
    let delivered = amount
        .checked_div(to_home)
        .and_then(|primary| primary.checked_mul(cross))
        .ok_or(ConversionError::Overflow { amount })?;
    Ok(Currency::Secondary.round(delivered))
}

/// Amounts derived for one customer send-money request.
///
/// Missing rates never fail a quote; the affected figures degrade to zero. Only an
/// amount too large to convert does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendQuote {
    /// Home units per delivered unit implied by the route, zero when unavailable.
    pub route_rate: Decimal,
    /// Home units per unit of the currency the customer paid in, zero when unavailable.
    pub received_rate: Decimal,
    pub foreign_equivalent: Decimal,
    pub received_home_equivalent: Decimal,
    /// What the customer gets, in `converted_currency`.
    pub converted_amount: Decimal,
    pub converted_currency: Currency,
}

impl SendQuote {
    pub fn converted_home(&self) -> Decimal {
        if self.converted_currency.is_home() {
            Currency::Home.round(self.converted_amount)
        } else {
            Decimal::ZERO
        }
    }

    pub fn converted_foreign(&self) -> Decimal {
        if self.converted_currency.is_home() {
            Decimal::ZERO
        } else {
            self.converted_currency.round(self.converted_amount)
        }
    }
}

pub fn quote_send(
    rates: &RateSet,
    route: DeliveryRoute,
    amount_sent: Decimal,
    received_money: Decimal,
    received_currency: Currency,
) -> Result<SendQuote, ConversionError> {
    let composite = rates.to_home(Currency::Primary).is_some() && rates.primary_to_secondary().is_some();

    let route_rate = match route {
        DeliveryRoute::PrimaryToSecondary if composite => rates.primary_to_home,
        DeliveryRoute::PrimaryToSecondary => Decimal::ZERO,
        other => rates.to_home(other.delivered_currency()).unwrap_or(Decimal::ZERO),
    };
    let received_rate = rates.to_home(received_currency).unwrap_or(Decimal::ZERO);

    let foreign_equivalent = if amount_sent <= Decimal::ZERO {
        Decimal::ZERO
    } else if route == DeliveryRoute::PrimaryToSecondary && composite {
        match home_to_secondary_via_primary(rates, amount_sent) {
            Err(ConversionError::RateUnavailable(_)) => Decimal::ZERO,
            delivered => delivered?,
        }
    } else if route_rate > Decimal::ZERO {
        let delivered = amount_sent
            .checked_div(route_rate)
            .ok_or(ConversionError::Overflow { amount: amount_sent })?;
        Currency::Secondary.round(delivered)
    } else {
        Decimal::ZERO
    };

    let received_home_equivalent = if received_money > Decimal::ZERO && received_rate > Decimal::ZERO {
        let home = received_money
            .checked_mul(received_rate)
            .ok_or(ConversionError::Overflow { amount: received_money })?;
        Currency::Home.round(home)
    } else {
        Decimal::ZERO
    };

    let (converted_amount, converted_currency) = match route {
        DeliveryRoute::Home => (amount_sent, Currency::Home),
        other => (foreign_equivalent, other.delivered_currency()),
    };

    Ok(SendQuote {
        route_rate,
        received_rate,
        foreign_equivalent,
        received_home_equivalent,
        converted_amount,
        converted_currency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rates() -> RateSet {
        RateSet {
            primary_to_home: dec!(20),
            secondary_to_home: dec!(22),
            primary_to_secondary: dec!(0.93),
        }
    }

    #[test]
    fn test_identity_ignores_rates() {
        let amount = dec!(123.456789123);
        for c in Currency::ALL {
            assert_eq!(convert(&RateSet::default(), amount, c, c).unwrap(), amount);
        }
    }

    #[test]
    fn test_round_trip_within_home_precision() {
        let rates = RateSet {
            primary_to_home: dec!(22.5),
            ..rates()
        };
        let foreign = convert(&rates, dec!(100), Currency::Home, Currency::Primary).unwrap();
        assert_eq!(foreign, dec!(4.444444));
        let back = convert(&rates, foreign, Currency::Primary, Currency::Home).unwrap();
        assert_eq!(back, dec!(100.00));
    }

    #[test]
    fn test_primary_to_secondary() {
        assert_eq!(convert(&rates(), dec!(100), Currency::Primary, Currency::Secondary).unwrap(), dec!(93.00));
        assert_eq!(convert(&rates(), dec!(93), Currency::Secondary, Currency::Primary).unwrap(), dec!(100));
    }

    #[test]
    fn test_missing_rate_is_unavailable() {
        let rates = RateSet {
            secondary_to_home: Decimal::ZERO,
            ..rates()
        };
        assert_eq!(
            convert(&rates, dec!(10), Currency::Secondary, Currency::Home),
            Err(ConversionError::RateUnavailable(RateUnavailable { from: Currency::Secondary, to: Currency::Home }))
        );
        assert!(home_to_secondary_via_primary(&RateSet::default(), dec!(10)).is_err());
    }

    #[test]
    fn test_quote_primary_route() {
        let quote = quote_send(&rates(), DeliveryRoute::Primary, dec!(500), Decimal::ZERO, Currency::Home).unwrap();
        assert_eq!(quote.foreign_equivalent, dec!(25));
        assert_eq!(quote.received_home_equivalent, Decimal::ZERO);
        assert_eq!(quote.converted_currency, Currency::Primary);
        assert_eq!(quote.converted_foreign(), dec!(25));
        assert_eq!(quote.converted_home(), Decimal::ZERO);
    }

    #[test]
    fn test_quote_degrades_to_zero_without_rates() {
        let quote = quote_send(&RateSet::default(), DeliveryRoute::Secondary, dec!(500), dec!(10), Currency::Primary).unwrap();
        assert_eq!(quote.route_rate, Decimal::ZERO);
        assert_eq!(quote.foreign_equivalent, Decimal::ZERO);
        assert_eq!(quote.received_home_equivalent, Decimal::ZERO);
        assert_eq!(quote.converted_currency, Currency::Secondary);
    }

    #[test]
    fn test_quote_composite_route() {
        let quote = quote_send(&rates(), DeliveryRoute::PrimaryToSecondary, dec!(500), dec!(5), Currency::Secondary).unwrap();
        assert_eq!(quote.route_rate, dec!(20));
        assert_eq!(quote.foreign_equivalent, dec!(23.25));
        assert_eq!(quote.received_home_equivalent, dec!(110));
        assert_eq!(quote.converted_currency, Currency::Secondary);

        let no_cross = RateSet {
            primary_to_secondary: Decimal::ZERO,
            ..rates()
        };
        let quote = quote_send(&no_cross, DeliveryRoute::PrimaryToSecondary, dec!(500), Decimal::ZERO, Currency::Home).unwrap();
        assert_eq!(quote.route_rate, Decimal::ZERO);
        assert_eq!(quote.foreign_equivalent, Decimal::ZERO);
    }

    #[test]
    fn test_quote_home_route_delivers_amount_sent() {
        let quote = quote_send(&rates(), DeliveryRoute::Home, dec!(250.5), dec!(100), Currency::Home).unwrap();
        assert_eq!(quote.converted_home(), dec!(250.50));
        assert_eq!(quote.converted_foreign(), Decimal::ZERO);
        assert_eq!(quote.received_home_equivalent, dec!(100));
    }

    #[test]
    fn test_overflow_is_an_error_not_a_panic() {
        let tiny = RateSet {
            primary_to_home: dec!(0.000001),
            ..rates()
        };
        assert_eq!(
            convert(&rates(), Decimal::MAX, Currency::Primary, Currency::Home),
            Err(ConversionError::Overflow { amount: Decimal::MAX })
        );
        assert!(matches!(
            convert(&tiny, Decimal::MAX, Currency::Home, Currency::Primary),
            Err(ConversionError::Overflow { .. })
        ));
        assert!(matches!(
            quote_send(&rates(), DeliveryRoute::Home, Decimal::ZERO, Decimal::MAX, Currency::Primary),
            Err(ConversionError::Overflow { .. })
        ));
        assert!(matches!(
            quote_send(&tiny, DeliveryRoute::PrimaryToSecondary, Decimal::MAX, Decimal::ZERO, Currency::Home),
            Err(ConversionError::Overflow { .. })
        ));
    }
}
