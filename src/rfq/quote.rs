//! Quote request parameters and fee/conversion arithmetic

use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer};
use serde_json::{Number, Value};

/// Decimal places used for base units; amounts finer than this are rejected
const MAX_AMOUNT_SCALE: u32 = 18;

/// Decimal places of the quoted rate and converted amount
const QUOTE_DECIMALS: u32 = 2;

/// What the client wants quoted
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub curr_from: String,
    pub curr_to: String,
    /// Kept exactly as sent so offers can echo it back
    #[serde(deserialize_with = "amount_as_string")]
    pub amount_from: String,
}

impl QuoteRequest {
    /// Same pair and amount
    pub fn same_as(&self, other: &QuoteRequest) -> bool {
        self.curr_from == other.curr_from
            && self.curr_to == other.curr_to
            && self.amount_from == other.amount_from
    }
}

/// Accept `"100"` as well as `100`
fn amount_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "amountFrom must be a string or number, got {}",
            other
        ))),
    }
}

/// Parse a positive amount with at most 18 decimals.
///
/// Only plain digits with an optional inner dot are accepted; signs,
/// exponents and zero are rejected.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    if raw.matches('.').count() > 1 || raw.starts_with('.') || raw.ends_with('.') {
        return None;
    }

    let amount = Decimal::from_str(raw).ok()?;
    if amount.scale() > MAX_AMOUNT_SCALE || amount <= Decimal::ZERO {
        return None;
    }
    Some(amount)
}

/// A computed offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
    /// Rounded to two decimals
    pub converted_amount: Decimal,
    /// Rounded to two decimals
    pub exchange_rate: Decimal,
}

impl Quote {
    /// fee = amount * fee% / 100, converted = (amount - fee) * price.
    ///
    /// `None` when an intermediate value does not fit in a `Decimal`.
    pub fn compute(amount: Decimal, price: Decimal, fee_percent: Decimal) -> Option<Self> {
        let fee_amount = amount
            .checked_mul(fee_percent)?
            .checked_div(Decimal::ONE_HUNDRED)?;
        let net_amount = amount.checked_sub(fee_amount)?;
        let converted = net_amount.checked_mul(price)?;

        Some(Self {
            fee_amount,
            net_amount,
            converted_amount: round_quote(converted),
            exchange_rate: round_quote(price),
        })
    }
}

fn round_quote(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(QUOTE_DECIMALS, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(QUOTE_DECIMALS);
    rounded
}

/// Render a two-decimal value as sent on the wire
pub fn format_fixed(value: Decimal) -> String {
    round_quote(value).to_string()
}

/// Whole percentages go out as integers, fractional ones as floats
pub fn percent_number(value: Decimal) -> Number {
    if value.fract().is_zero() {
        if let Some(whole) = value.to_i64() {
            return Number::from(whole);
        }
    }
    value
        .to_f64()
        .and_then(Number::from_f64)
        .unwrap_or_else(|| Number::from(0))
}

/// Config carries the fee as a float
pub fn fee_from_percent(percent: f64) -> Decimal {
    Decimal::from_f64(percent).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_compute_reference_offer() {
        let quote = Quote::compute(dec("100"), dec("0.06"), dec("1")).unwrap();
        assert_eq!(quote.fee_amount, dec("1"));
        assert_eq!(quote.net_amount, dec("99"));
        assert_eq!(format_fixed(quote.converted_amount), "5.94");
        assert_eq!(format_fixed(quote.exchange_rate), "0.06");
    }

    #[test]
    fn test_rounding_to_two_decimals() {
        let quote = Quote::compute(dec("1"), dec("30.12345"), dec("0")).unwrap();
        assert_eq!(format_fixed(quote.exchange_rate), "30.12");
        assert_eq!(format_fixed(quote.converted_amount), "30.12");

        let quote = Quote::compute(dec("2"), dec("1.005"), dec("0")).unwrap();
        assert_eq!(format_fixed(quote.converted_amount), "2.01");
        assert_eq!(format_fixed(dec("5")), "5.00");
    }

    #[test]
    fn test_compute_overflow_is_none() {
        let amount = parse_amount("1000000000000000000000000000").unwrap();
        assert!(Quote::compute(amount, dec("64250"), dec("1")).is_none());
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("100"), Some(dec("100")));
        assert_eq!(parse_amount("0.5"), Some(dec("0.5")));
        assert_eq!(parse_amount(" 12 "), Some(dec("12")));
        assert_eq!(parse_amount("0.000000000000000001"), Some(dec("0.000000000000000001")));

        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("0"), None);
        assert_eq!(parse_amount("0.0"), None);
        assert_eq!(parse_amount("-5"), None);
        assert_eq!(parse_amount("1e5"), None);
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount("1.2.3"), None);
        assert_eq!(parse_amount(".5"), None);
        assert_eq!(parse_amount("0.0000000000000000001"), None);
    }

    #[test]
    fn test_request_accepts_numeric_amount() {
        let req: QuoteRequest =
            serde_json::from_str(r#"{"currFrom":"BTC","currTo":"ETH","amountFrom":100}"#).unwrap();
        assert_eq!(req.amount_from, "100");

        let req: QuoteRequest =
            serde_json::from_str(r#"{"currFrom":"BTC","currTo":"ETH","amountFrom":"2.5"}"#).unwrap();
        assert_eq!(req.amount_from, "2.5");

        assert!(serde_json::from_str::<QuoteRequest>(
            r#"{"currFrom":"BTC","currTo":"ETH","amountFrom":null}"#
        )
        .is_err());
    }

    #[test]
    fn test_percent_number() {
        assert_eq!(percent_number(dec("1")), Number::from(1));
        assert_eq!(percent_number(dec("0.5")), Number::from_f64(0.5).unwrap());
        assert_eq!(fee_from_percent(1.0), dec("1"));
    }
}
