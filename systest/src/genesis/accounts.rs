//! Typed, read-only view of a genesis document.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use systest_common::{Coin, Coins, HarnessError, HarnessResult};

use crate::json::lookup;

pub const BASE_ACCOUNT_TYPE: &str = "/cosmos.auth.v1beta1.BaseAccount";
pub const DELAYED_VESTING_TYPE: &str = "/cosmos.vesting.v1beta1.DelayedVestingAccount";
pub const CONTINUOUS_VESTING_TYPE: &str = "/cosmos.vesting.v1beta1.ContinuousVestingAccount";

/// Integers that proto3 JSON writes as strings; numbers are accepted too.
mod int_string {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| serde::de::Error::custom(format!("{n} is not an i64"))),
            Value::Null => Ok(0),
            other => Err(serde::de::Error::custom(format!(
                "expected integer, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseAccount {
    pub address: String,
    #[serde(default)]
    pub pub_key: Option<Value>,
    #[serde(default, with = "int_string")]
    pub account_number: i64,
    #[serde(default, with = "int_string")]
    pub sequence: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseVestingAccount {
    pub base_account: BaseAccount,
    #[serde(default)]
    pub original_vesting: Vec<Coin>,
    #[serde(default)]
    pub delegated_free: Vec<Coin>,
    #[serde(default)]
    pub delegated_vesting: Vec<Coin>,
    /// Unix seconds.
    #[serde(default, with = "int_string")]
    pub end_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayedVestingAccount {
    pub base_vesting_account: BaseVestingAccount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuousVestingAccount {
    pub base_vesting_account: BaseVestingAccount,
    /// Unix seconds.
    #[serde(default, with = "int_string")]
    pub start_time: i64,
}

/// An `app_state.auth.accounts` entry, dispatched on `@type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum Account {
    #[serde(rename = "/cosmos.auth.v1beta1.BaseAccount")]
    Base(BaseAccount),
    #[serde(rename = "/cosmos.vesting.v1beta1.DelayedVestingAccount")]
    DelayedVesting(DelayedVestingAccount),
    #[serde(rename = "/cosmos.vesting.v1beta1.ContinuousVestingAccount")]
    ContinuousVesting(ContinuousVestingAccount),
    /// Module accounts and anything else the harness doesn't model.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountKind {
    Base,
    DelayedVesting,
    ContinuousVesting,
    Unknown,
}

impl Account {
    pub fn kind(&self) -> AccountKind {
        match self {
            Self::Base(_) => AccountKind::Base,
            Self::DelayedVesting(_) => AccountKind::DelayedVesting,
            Self::ContinuousVesting(_) => AccountKind::ContinuousVesting,
            Self::Unknown => AccountKind::Unknown,
        }
    }

    fn vesting(&self) -> Option<&BaseVestingAccount> {
        match self {
            Self::DelayedVesting(a) => Some(&a.base_vesting_account),
            Self::ContinuousVesting(a) => Some(&a.base_vesting_account),
            _ => None,
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Base(a) => Some(&a.address),
            Self::Unknown => None,
            _ => self.vesting().map(|v| v.base_account.address.as_str()),
        }
    }

    /// Locked amount at genesis; empty for non-vesting accounts.
    pub fn original_vesting(&self) -> Coins {
        self.vesting()
            .map(|v| v.original_vesting.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Vesting start; zero when the account has none.
    pub fn start_time(&self) -> i64 {
        match self {
            Self::ContinuousVesting(a) => a.start_time,
            _ => 0,
        }
    }

    /// Vesting end; zero when the account has none.
    pub fn end_time(&self) -> i64 {
        self.vesting().map(|v| v.end_time).unwrap_or(0)
    }

    /// Check the time ordering each vesting variant requires.
    pub fn validate(&self) -> HarnessResult<()> {
        let address = self.address().unwrap_or("<unknown>");
        match self {
            Self::DelayedVesting(a) if a.base_vesting_account.end_time <= 0 => Err(
                HarnessError::AssertionFailed(format!("{address}: delayed vesting without end_time")),
            ),
            Self::ContinuousVesting(a)
                if !(0 < a.start_time && a.start_time < a.base_vesting_account.end_time) =>
            {
                Err(HarnessError::AssertionFailed(format!(
                    "{address}: continuous vesting needs 0 < start_time ({}) < end_time ({})",
                    a.start_time, a.base_vesting_account.end_time
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub address: String,
    #[serde(default)]
    pub coins: Vec<Coin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub operator_address: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tokens: String,
}

/// Parsed genesis document with typed accessors for the sections the
/// harness inspects.
#[derive(Debug, Clone)]
pub struct GenesisDocument {
    raw: Value,
    accounts: Vec<Account>,
    balances: Vec<Balance>,
    validators: Vec<GenesisValidator>,
}

fn section<T: serde::de::DeserializeOwned>(raw: &Value, path: &str) -> HarnessResult<Vec<T>> {
    match lookup(raw, path) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| HarnessError::state(format!("genesis `{path}`: {e}"))),
    }
}

impl GenesisDocument {
    pub fn parse(raw: &[u8]) -> HarnessResult<Self> {
        let value: Value = serde_json::from_slice(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(raw: Value) -> HarnessResult<Self> {
        if !raw.is_object() {
            return Err(HarnessError::state("genesis document is not a JSON object"));
        }
        Ok(Self {
            accounts: section(&raw, "app_state.auth.accounts")?,
            balances: section(&raw, "app_state.bank.balances")?,
            validators: section(&raw, "app_state.staking.validators")?,
            raw,
        })
    }

    pub fn value(&self) -> &Value {
        &self.raw
    }

    pub fn chain_id(&self) -> Option<&str> {
        self.raw.get("chain_id").and_then(Value::as_str)
    }

    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    pub fn accounts_of(&self, kind: AccountKind) -> Vec<&Account> {
        self.accounts.iter().filter(|a| a.kind() == kind).collect()
    }

    pub fn account(&self, address: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.address() == Some(address))
    }

    pub fn balances(&self) -> &[Balance] {
        &self.balances
    }

    /// Coins of `address`, summed over duplicate balance entries.
    pub fn balance_of(&self, address: &str) -> Coins {
        self.balances
            .iter()
            .filter(|b| b.address == address)
            .flat_map(|b| b.coins.iter().cloned())
            .collect()
    }

    /// Balance minus original vesting, floored at zero per denom.
    pub fn spendable_at_genesis(&self, address: &str) -> Coins {
        let vesting = self
            .account(address)
            .map(Account::original_vesting)
            .unwrap_or_default();
        self.balance_of(address).saturating_sub(&vesting)
    }

    pub fn validators(&self) -> &[GenesisValidator] {
        &self.validators
    }
}
