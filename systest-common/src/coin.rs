//! Coin amounts as they appear on the command line and in genesis JSON.
//!
//! Amounts are arbitrary-precision (`BigUint`) and serialize as decimal
//! strings, matching the node's JSON encoding.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use num_traits::Zero;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Errors produced while parsing coin strings such as `100000000stake`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoinParseError {
    #[error("empty coin string")]
    Empty,

    #[error("coin '{0}' has no amount")]
    MissingAmount(String),

    #[error("coin '{0}' has no denom")]
    MissingDenom(String),

    #[error("invalid denom '{denom}' in coin '{coin}'")]
    InvalidDenom { coin: String, denom: String },
}

/// A single `(denom, amount)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    #[serde(with = "amount_string")]
    pub amount: BigUint,
}

impl Coin {
    pub fn new(amount: impl Into<BigUint>, denom: impl Into<String>) -> Self {
        Self {
            denom: denom.into(),
            amount: amount.into(),
        }
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

fn valid_denom(denom: &str) -> bool {
    let mut chars = denom.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    denom.len() >= 2
        && denom.len() <= 128
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | ':' | '.' | '_' | '-'))
}

impl FromStr for Coin {
    type Err = CoinParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CoinParseError::Empty);
        }
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (amount, denom) = trimmed.split_at(split);
        if amount.is_empty() {
            return Err(CoinParseError::MissingAmount(trimmed.to_string()));
        }
        if denom.is_empty() {
            return Err(CoinParseError::MissingDenom(trimmed.to_string()));
        }
        if !valid_denom(denom) {
            return Err(CoinParseError::InvalidDenom {
                coin: trimmed.to_string(),
                denom: denom.to_string(),
            });
        }
        let amount = amount
            .parse::<BigUint>()
            .map_err(|_| CoinParseError::MissingAmount(trimmed.to_string()))?;
        Ok(Coin::new(amount, denom))
    }
}

/// An unordered set of coins, kept normalized: sorted by denom, one entry
/// per denom, no zero amounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coins {
    by_denom: BTreeMap<String, BigUint>,
}

impl Coins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated list like `1stake,5ufoo`.
    pub fn parse(list: &str) -> Result<Self, CoinParseError> {
        let mut coins = Coins::new();
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            coins.add(part.parse()?);
        }
        Ok(coins)
    }

    pub fn add(&mut self, coin: Coin) {
        if coin.amount.is_zero() {
            return;
        }
        *self.by_denom.entry(coin.denom).or_default() += coin.amount;
    }

    /// Amount held in `denom`, zero when absent.
    pub fn amount_of(&self, denom: &str) -> BigUint {
        self.by_denom.get(denom).cloned().unwrap_or_default()
    }

    /// Per-denom subtraction that floors at zero.
    pub fn saturating_sub(&self, other: &Coins) -> Coins {
        let mut out = Coins::new();
        for (denom, amount) in &self.by_denom {
            let take = other.amount_of(denom);
            if *amount > take {
                out.add(Coin::new(amount - take, denom.clone()));
            }
        }
        out
    }

    /// Per-denom subtraction; `None` when any denom would go negative.
    pub fn checked_sub(&self, other: &Coins) -> Option<Coins> {
        if other
            .by_denom
            .iter()
            .any(|(denom, amount)| self.amount_of(denom) < *amount)
        {
            return None;
        }
        Some(self.saturating_sub(other))
    }

    pub fn is_empty(&self) -> bool {
        self.by_denom.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_denom.len()
    }

    pub fn to_vec(&self) -> Vec<Coin> {
        self.by_denom
            .iter()
            .map(|(denom, amount)| Coin::new(amount.clone(), denom.clone()))
            .collect()
    }
}

impl FromIterator<Coin> for Coins {
    fn from_iter<I: IntoIterator<Item = Coin>>(iter: I) -> Self {
        let mut coins = Coins::new();
        for coin in iter {
            coins.add(coin);
        }
        coins
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.to_vec().iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// Serde adapter for amounts encoded as decimal strings.
///
/// Numbers are accepted on input too, since hand-written fixtures often use them.
pub mod amount_string {
    use super::*;

    pub fn serialize<S: Serializer>(amount: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        let text = match raw {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) if n.is_u64() => n.to_string(),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "expected decimal amount, got {other}"
                )));
            }
        };
        text.parse::<BigUint>()
            .map_err(|e| serde::de::Error::custom(format!("invalid amount '{text}': {e}")))
    }
}
