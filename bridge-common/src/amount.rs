//! Exact decimal arithmetic for token amounts.
//!
//! Amounts travel as decimal strings everywhere in the pipeline. Nothing here
//! goes through floating point: raw on-chain integers are scaled by the token's
//! decimals with `BigDecimal`, and the results are rendered without exponent
//! notation or trailing zeros so that equal values always compare equal as
//! strings.
use std::collections::HashMap;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use num_bigint::{BigInt, BigUint, Sign};
use thiserror::Error;

/// Precision assumed for tokens missing from the table.
pub const DEFAULT_DECIMALS: u32 = 18;

const MAX_AMOUNT_BITS: u64 = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid decimal value: {0}")]
    InvalidDecimal(String),
}

/// Scale a raw unsigned 256-bit integer amount down by `decimals`.
///
/// `normalize("2500000", 6)` yields `"2.5"`.
pub fn normalize(raw_amount: &str, decimals: u32) -> Result<String, AmountError> {
    if raw_amount.is_empty() || !raw_amount.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::InvalidAmount(raw_amount.to_owned()));
    }

    let magnitude = BigUint::from_str(raw_amount)
        .map_err(|_| AmountError::InvalidAmount(raw_amount.to_owned()))?;
    if magnitude.bits() > MAX_AMOUNT_BITS {
        return Err(AmountError::InvalidAmount(raw_amount.to_owned()));
    }

    let value = BigDecimal::new(BigInt::from(magnitude), i64::from(decimals));
    Ok(to_plain_string(&value))
}

/// Parse a signed decimal string of the form `-?digits(.digits)?`.
pub fn parse_decimal(value: &str) -> Result<BigDecimal, AmountError> {
    let unsigned = value.strip_prefix('-').unwrap_or(value);
    let (integer, fraction) = match unsigned.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (unsigned, None),
    };

    let is_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !is_digits(integer) || fraction.is_some_and(|fraction| !is_digits(fraction)) {
        return Err(AmountError::InvalidDecimal(value.to_owned()));
    }

    BigDecimal::from_str(value).map_err(|_| AmountError::InvalidDecimal(value.to_owned()))
}

/// Exact sum of two decimal strings.
pub fn add(left: &str, right: &str) -> Result<String, AmountError> {
    let sum = parse_decimal(left)? + parse_decimal(right)?;
    Ok(to_plain_string(&sum))
}

/// The delta that undoes `value`.
pub fn negate(value: &str) -> Result<String, AmountError> {
    let negated = -parse_decimal(value)?;
    Ok(to_plain_string(&negated))
}

/// Render without exponent, trailing fractional zeros or a dangling point.
pub fn to_plain_string(value: &BigDecimal) -> String {
    let (digits, scale) = value.normalized().as_bigint_and_exponent();
    if digits.sign() == Sign::NoSign {
        return "0".to_owned();
    }

    let mut rendered = digits.magnitude().to_string();
    if scale <= 0 {
        let zeros = usize::try_from(scale.unsigned_abs()).unwrap_or(0);
        rendered.push_str(&"0".repeat(zeros));
    } else {
        let scale = usize::try_from(scale).unwrap_or(0);
        if rendered.len() <= scale {
            rendered.insert_str(0, &"0".repeat(scale - rendered.len() + 1));
        }
        rendered.insert(rendered.len() - scale, '.');
    }

    if digits.sign() == Sign::Minus {
        rendered.insert(0, '-');
    }
    rendered
}

const MAINNET_TOKENS: [(&str, u32); 23] = [
    ("0xEeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE", 18), // ETH
    ("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", 6),  // USDC
    ("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", 18), // WETH
    ("0xdAC17F958D2ee523a2206206994597C13D831ec7", 6),  // USDT
    ("0x467Bccd9d29f223BcE8043b84E8C8B282827790F", 2),  // Telcoin
    ("0x7D1AfA7B718fb893dB30A3aBc0Cfc608AaCfeBB0", 18), // MATIC
    ("0x1f9840a85d5aF5bf1D1762F925BDADdC4201F984", 18), // UNI
    ("0xC011a73ee8576Fb46F5E1c5751cA3B9Fe0af2a6F", 18), // SNX
    ("0x55296f69f40Ea6d20E478533C15A6B08B654E758", 18), // ZRX
    ("0xaaeE1A9723aaDB7afA2810263653A34bA2C21C7a", 18), // Mog
    ("0x8f693ca8D21b157107184d29D398A8D082b38b76", 18), // DATA
    ("0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599", 8),  // WBTC
    ("0xed328E9C1179a30ddC1E7595E036AEd8760C22aF", 18), // MCADE
    ("0xD533a949740bb3306d119CC777fa900bA034cd52", 18), // CRV
    ("0x6B175474E89094C44Da98b954EedeAC495271d0F", 18), // DAI
    ("0x514910771AF9Ca656af840dff83E8264EcF986CA", 18), // LINK
    ("0x8947da500Eb47F82df21143D0C01A29862a8C3c5", 18), // THALES
    ("0x6982508145454Ce325dDbE47a25d4ec3d2311933", 18), // PEPE
    ("0x7Fc66500c84A76Ad7e9c93437bFc5Ac33E2DDaE9", 18), // AAVE
    ("0xcAfE001067cDEF266AfB7Eb5A286dCFD277f3dE5", 18), // PSP
    ("0x582d872A1B094FC48F5DE31D3B73F2D9bE47def1", 9),  // TONCOIN
    ("0xA735A3AF76CC30791C61c10d585833829d36CBe0", 9),  // imgnAI
    ("0x72e4f9F808C49A2a61dE9C5896298920Dc4EEEa9", 8),  // BITCOIN
];

/// Token address to decimal precision, matched case-insensitively.
#[derive(Debug, Clone)]
pub struct TokenDecimals {
    decimals: HashMap<String, u32>,
}

impl TokenDecimals {
    pub fn mainnet() -> Self {
        MAINNET_TOKENS
            .iter()
            .fold(Self::empty(), |table, (address, decimals)| {
                table.with_token(address, *decimals)
            })
    }

    pub fn empty() -> Self {
        Self {
            decimals: HashMap::new(),
        }
    }

    pub fn with_token(mut self, address: &str, decimals: u32) -> Self {
        self.decimals.insert(address.to_lowercase(), decimals);
        self
    }

    pub fn decimals_for(&self, token: &str) -> u32 {
        self.decimals
            .get(&token.to_lowercase())
            .copied()
            .unwrap_or(DEFAULT_DECIMALS)
    }
}

impl Default for TokenDecimals {
    fn default() -> Self {
        Self::mainnet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_scales_by_decimals() {
        assert_eq!(normalize("1000000", 6).unwrap(), "1");
        assert_eq!(normalize("2500000", 6).unwrap(), "2.5");
        assert_eq!(normalize("1", 18).unwrap(), "0.000000000000000001");
        assert_eq!(normalize("123", 0).unwrap(), "123");
        assert_eq!(normalize("0", 6).unwrap(), "0");
        assert_eq!(normalize("000150", 2).unwrap(), "1.5");
    }

    #[test]
    fn test_normalize_is_exact_for_large_precision() {
        let raw = "123456789012345678901234567890123456789";
        assert_eq!(
            normalize(raw, 30).unwrap(),
            "123456789.012345678901234567890123456789"
        );
    }

    #[test]
    fn test_normalize_accepts_the_largest_u256() {
        let max = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        assert_eq!(normalize(max, 0).unwrap(), max);

        let overflow =
            "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert_eq!(
            normalize(overflow, 0),
            Err(AmountError::InvalidAmount(overflow.to_owned()))
        );
    }

    #[test]
    fn test_normalize_rejects_malformed_input() {
        for raw in ["", "-1", "1.5", "12a", "+5", "1_000", " 1"] {
            assert_eq!(
                normalize(raw, 6),
                Err(AmountError::InvalidAmount(raw.to_owned())),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_add_and_negate_are_exact() {
        assert_eq!(add("0", "2.5").unwrap(), "2.5");
        assert_eq!(add("2.5", "0.000000000000000001").unwrap(), "2.500000000000000001");
        assert_eq!(add("2.5", "-2.5").unwrap(), "0");
        assert_eq!(add("1", "-3").unwrap(), "-2");
        assert_eq!(add("999", "1").unwrap(), "1000");
        assert_eq!(negate("2.5").unwrap(), "-2.5");
        assert_eq!(negate("-1").unwrap(), "1");
        assert_eq!(negate("0").unwrap(), "0");
    }

    #[test]
    fn test_parse_decimal_rejects_exponents() {
        assert!(parse_decimal("1e5").is_err());
        assert!(parse_decimal("1.").is_err());
        assert!(parse_decimal(".5").is_err());
        assert!(parse_decimal("--1").is_err());
        assert!(parse_decimal("-0.25").is_ok());
    }

    #[test]
    fn test_token_decimals_lookup_ignores_case() {
        let table = TokenDecimals::mainnet();
        assert_eq!(
            table.decimals_for("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"),
            6
        );
        assert_eq!(
            table.decimals_for("0x2260FAC5E5542A773AA44FBCFEDF7C193BC2C599"),
            8
        );
        assert_eq!(table.decimals_for("0x0000000000000000000000000000000000000001"), 18);

        let table = table.with_token("0xAAA", 6);
        assert_eq!(table.decimals_for("0xaaa"), 6);
    }
}
