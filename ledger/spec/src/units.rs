//! Value units. Balances and fees on the ledger are counted in usat; every
//! other unit is a power of ten of it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unknown unit name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cannot recognize unit {0}")]
pub struct UnknownUnit(pub String);

/// Commonly used unit names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Unit {
    /// Base unit.
    Usat,
    /// 10^3 usat.
    Msat,
    /// 10^6 usat.
    Sat,
    /// 10^8 usat.
    Ubtc,
    /// 10^11 usat.
    Mbtc,
    /// 10^14 usat.
    Btc,
    /// Alias of [`Unit::Ubtc`].
    Ubit,
    /// Alias of [`Unit::Mbtc`].
    Mbit,
    /// Alias of [`Unit::Btc`].
    Bit,
    /// Alias of [`Unit::Usat`].
    Base,
}

impl Unit {
    /// Size of the unit in usat, as a power of ten.
    pub fn power(self) -> i32 {
        match self {
            Unit::Usat | Unit::Base => 0,
            Unit::Msat => 3,
            Unit::Sat => 6,
            Unit::Ubtc | Unit::Ubit => 8,
            Unit::Mbtc | Unit::Mbit => 11,
            Unit::Btc | Unit::Bit => 14,
        }
    }

    /// Display name.
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Usat => "usat",
            Unit::Msat => "msat",
            Unit::Sat => "sat",
            Unit::Ubtc => "uBTC",
            Unit::Mbtc => "mBTC",
            Unit::Btc => "BTC",
            Unit::Ubit => "ubit",
            Unit::Mbit => "mbit",
            Unit::Bit => "bit",
            Unit::Base => "base",
        }
    }
}

impl FromStr for Unit {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = match s.to_ascii_lowercase().as_str() {
            "usat" => Unit::Usat,
            "msat" => Unit::Msat,
            "sat" => Unit::Sat,
            "ubtc" => Unit::Ubtc,
            "mbtc" => Unit::Mbtc,
            "btc" => Unit::Btc,
            "ubit" => Unit::Ubit,
            "mbit" => Unit::Mbit,
            "bit" => Unit::Bit,
            "base" => Unit::Base,
            _ => return Err(UnknownUnit(s.to_string())),
        };
        Ok(unit)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Convert `amount` between units.
pub fn convert_value(amount: f64, from: Unit, to: Unit) -> f64 {
    let delta = from.power() - to.power();
    if delta >= 0 {
        amount * 10f64.powi(delta)
    } else {
        amount / 10f64.powi(-delta)
    }
}

/// Amount expressed in a unit picked for readability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormattedValue {
    /// Amount in `unit`.
    pub amount: f64,
    /// Chosen unit.
    pub unit: Unit,
}

impl fmt::Display for FormattedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.unit)
    }
}

/// Express `usats` in the largest unit it exceeds, optionally rounded.
pub fn format_value(usats: u64, round_decimals: Option<u32>) -> FormattedValue {
    let value = usats as f64;
    let unit = [Unit::Btc, Unit::Mbtc, Unit::Ubtc, Unit::Sat, Unit::Msat]
        .into_iter()
        .find(|unit| value > 10f64.powi(unit.power() - 1))
        .unwrap_or(Unit::Usat);
    let mut amount = convert_value(value, Unit::Usat, unit);
    if let Some(decimals) = round_decimals {
        let scale = 10f64.powi(decimals as i32);
        amount = (amount * scale).round() / scale;
    }
    FormattedValue { amount, unit }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("mBTC".parse::<Unit>().unwrap(), Unit::Mbtc);
        assert_eq!("SAT".parse::<Unit>().unwrap(), Unit::Sat);
        assert_eq!(
            "doge".parse::<Unit>().unwrap_err(),
            UnknownUnit("doge".into())
        );
    }

    #[test]
    fn converts_between_units() {
        assert_eq!(convert_value(1.0, Unit::Btc, Unit::Usat), 1e14);
        assert_eq!(convert_value(2500.0, Unit::Msat, Unit::Sat), 2.5);
        assert_eq!(convert_value(3.0, Unit::Bit, Unit::Ubit), 3e6);
    }

    #[test]
    fn picks_readable_unit() {
        assert_eq!(format_value(50, Some(3)).to_string(), "50 usat");
        assert_eq!(format_value(1_500, Some(3)).to_string(), "1.5 msat");
        assert_eq!(format_value(250_000, Some(3)).to_string(), "0.25 sat");
        let big = format_value(123_456_789_000_000, Some(3));
        assert_eq!(big.unit, Unit::Btc);
        assert_eq!(big.amount, 1.235);
    }
}
