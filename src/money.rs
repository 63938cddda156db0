//! Money arithmetic policy: every dollar amount in the system is a
//! `Decimal` with two-place precision. Floats coming off the wire are
//! promoted exactly once, here; anything that fails promotion is an error,
//! not a silent zero.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::error::{BotError, BotResult};

pub const MONEY_DP: u32 = 2;

/// Promote an external f64 (feed price) to the internal money type.
pub fn from_f64(v: f64) -> BotResult<Decimal> {
    if !v.is_finite() {
        return Err(BotError::Numeric(format!("non-finite value {v}")));
    }
    Decimal::from_f64(v)
        .map(round)
        .ok_or_else(|| BotError::Numeric(format!("{v} does not fit in Decimal")))
}

/// Round to the fixed money precision.
pub fn round(d: Decimal) -> Decimal {
    d.round_dp(MONEY_DP)
}

/// Parse a stored TEXT column back into money.
pub fn parse(s: &str) -> BotResult<Decimal> {
    s.parse::<Decimal>()
        .map_err(|e| BotError::Numeric(format!("bad stored decimal {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotes_and_rounds() {
        assert_eq!(from_f64(248.75).unwrap().to_string(), "248.75");
        assert_eq!(from_f64(1.005).unwrap(), round(from_f64(1.005).unwrap()));
    }

    #[test]
    fn rejects_non_finite() {
        assert!(from_f64(f64::NAN).is_err());
        assert!(from_f64(f64::INFINITY).is_err());
    }

    #[test]
    fn storage_text_roundtrip_is_exact() {
        let d = from_f64(184.05).unwrap();
        assert_eq!(parse(&d.to_string()).unwrap(), d);
    }
}
