//! Bank and staking state changed by transactions.
//!
//! The first transaction seeds balances from the genesis document. The
//! state lives in `<home>/data/ledger.json`, so `comet unsafe-reset-all`
//! discards it together with the block height.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use systest::genesis::GenesisDocument;
use systest::json::lookup;
use systest_common::{Coin, Coins};
use thiserror::Error;
use tracing::debug;

use crate::home::{self, DENOM};

/// A transaction refused by the ledger. The node still answers with a
/// response; the refusal is carried in its `code` and `raw_log`.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("spendable balance {spendable} is smaller than {wanted}: insufficient funds")]
    InsufficientFunds { spendable: String, wanted: String },

    #[error("validator {0} does not exist")]
    UnknownValidator(String),

    #[error("invalid coins: only {DENOM} can be delegated, got {0}")]
    InvalidCoins(String),

    #[error("invalid shares amount: {delegated} delegated, {wanted} requested")]
    InsufficientShares { delegated: String, wanted: String },
}

impl Rejection {
    pub fn code(&self) -> u32 {
        match self {
            Self::InsufficientFunds { .. } => 5,
            Self::UnknownValidator(_) => 3,
            Self::InvalidCoins(_) => 10,
            Self::InsufficientShares { .. } => 18,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnbondingEntry {
    pub creation_height: u64,
    pub completion_time: DateTime<Utc>,
    pub initial_balance: Coin,
    pub balance: Coin,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    balances: BTreeMap<String, Vec<Coin>>,
    /// delegator -> validator -> bonded coin
    delegations: BTreeMap<String, BTreeMap<String, Coin>>,
    /// delegator -> validator -> entries, oldest first
    unbonding: BTreeMap<String, BTreeMap<String, Vec<UnbondingEntry>>>,
    /// Committed responses by hash.
    txs: BTreeMap<String, Value>,
}

pub struct Ledger {
    path: PathBuf,
    state: LedgerState,
    validators: Vec<String>,
    unbonding_time: Duration,
}

fn ledger_path(home: &Path) -> PathBuf {
    home::data_dir(home).join("ledger.json")
}

/// Parse a protobuf JSON duration such as `1814400s` or `0.5s`.
fn parse_proto_duration(text: &str) -> Result<Duration> {
    let seconds: f64 = text
        .strip_suffix('s')
        .and_then(|s| s.parse().ok())
        .filter(|s: &f64| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| anyhow!("invalid duration `{text}`"))?;
    Ok(Duration::from_secs_f64(seconds))
}

fn completion_time(now: DateTime<Utc>, unbonding_time: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(unbonding_time)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Ledger {
    /// Open the ledger of `home`, seeding it from the genesis document
    /// when no transaction has run yet.
    pub fn open(home: &Path) -> Result<Self> {
        let doc = GenesisDocument::from_value(home::read_genesis(home)?)?;
        let path = ledger_path(home);
        let state = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let mut state = LedgerState::default();
                for balance in doc.balances() {
                    let coins: Coins = state
                        .balances
                        .remove(&balance.address)
                        .unwrap_or_default()
                        .into_iter()
                        .chain(balance.coins.iter().cloned())
                        .collect();
                    state.balances.insert(balance.address.clone(), coins.to_vec());
                }
                state
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let unbonding_time = match lookup(doc.value(), "app_state.staking.params.unbonding_time")
            .and_then(Value::as_str)
        {
            Some(text) => parse_proto_duration(text)?,
            None => Duration::from_secs(21 * 24 * 3600),
        };
        let mut ledger = Self {
            path,
            state,
            validators: doc
                .validators()
                .iter()
                .map(|v| v.operator_address.clone())
                .collect(),
            unbonding_time,
        };
        ledger.mature_unbondings(Utc::now());
        Ok(ledger)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        home::write_atomic(&self.path, &serde_json::to_vec_pretty(&self.state)?)
    }

    pub fn balance(&self, address: &str) -> Coins {
        self.state
            .balances
            .get(address)
            .map(|coins| coins.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn set_balance(&mut self, address: &str, coins: Coins) {
        if coins.is_empty() {
            self.state.balances.remove(address);
        } else {
            self.state.balances.insert(address.to_string(), coins.to_vec());
        }
    }

    fn credit(&mut self, address: &str, coins: &Coins) {
        let mut balance = self.balance(address);
        for coin in coins.to_vec() {
            balance.add(coin);
        }
        self.set_balance(address, balance);
    }

    fn debit(&mut self, address: &str, coins: &Coins) -> Result<(), Rejection> {
        let balance = self.balance(address);
        let left = balance
            .checked_sub(coins)
            .ok_or_else(|| Rejection::InsufficientFunds {
                spendable: balance.to_string(),
                wanted: coins.to_string(),
            })?;
        self.set_balance(address, left);
        Ok(())
    }

    /// Balances plus bonded and unbonding coins.
    pub fn supply(&self) -> Coins {
        let balances = self.state.balances.values().flatten().cloned();
        let bonded = self.state.delegations.values().flat_map(|d| d.values().cloned());
        let unbonding = self
            .state
            .unbonding
            .values()
            .flat_map(|u| u.values().flatten().map(|e| e.balance.clone()));
        balances.chain(bonded).chain(unbonding).collect()
    }

    pub fn delegation(&self, delegator: &str, validator: &str) -> Option<&Coin> {
        self.state.delegations.get(delegator)?.get(validator)
    }

    /// Sum of all delegations to `validator`.
    pub fn delegated_to(&self, validator: &str) -> Coins {
        self.state
            .delegations
            .values()
            .filter_map(|by_validator| by_validator.get(validator).cloned())
            .collect()
    }

    pub fn unbonding(&self, delegator: &str, validator: &str) -> &[UnbondingEntry] {
        self.state
            .unbonding
            .get(delegator)
            .and_then(|by_validator| by_validator.get(validator))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn tx(&self, hash: &str) -> Option<&Value> {
        self.state.txs.get(hash)
    }

    pub fn tx_count(&self) -> usize {
        self.state.txs.len()
    }

    pub fn record_tx(&mut self, hash: &str, response: Value) {
        self.state.txs.insert(hash.to_string(), response);
    }

    /// Deduct `fees` from the signer; checked before the message runs.
    pub fn charge_fees(&mut self, signer: &str, fees: &Coins) -> Result<(), Rejection> {
        self.debit(signer, fees)
    }

    pub fn send(&mut self, from: &str, to: &str, amount: &Coins) -> Result<(), Rejection> {
        self.debit(from, amount)?;
        self.credit(to, amount);
        Ok(())
    }

    fn bonded_coin(&self, validator: &str, amount: &Coin) -> Result<(), Rejection> {
        if !self.validators.iter().any(|v| v == validator) {
            return Err(Rejection::UnknownValidator(validator.to_string()));
        }
        if amount.denom != DENOM {
            return Err(Rejection::InvalidCoins(amount.to_string()));
        }
        Ok(())
    }

    pub fn delegate(&mut self, delegator: &str, validator: &str, amount: Coin) -> Result<(), Rejection> {
        self.bonded_coin(validator, &amount)?;
        self.debit(delegator, &Coins::from_iter([amount.clone()]))?;
        let slot = self
            .state
            .delegations
            .entry(delegator.to_string())
            .or_default()
            .entry(validator.to_string())
            .or_insert_with(|| Coin::new(0u32, DENOM));
        slot.amount += amount.amount;
        Ok(())
    }

    /// Move `amount` from the delegation into a new unbonding entry.
    pub fn undelegate(
        &mut self,
        delegator: &str,
        validator: &str,
        amount: Coin,
        height: u64,
    ) -> Result<(), Rejection> {
        self.bonded_coin(validator, &amount)?;
        let delegated = self
            .delegation(delegator, validator)
            .map(|c| c.amount.clone())
            .unwrap_or_default();
        if delegated < amount.amount {
            return Err(Rejection::InsufficientShares {
                delegated: format!("{delegated}{DENOM}"),
                wanted: amount.to_string(),
            });
        }
        if let Some(by_validator) = self.state.delegations.get_mut(delegator) {
            let emptied = by_validator.get_mut(validator).is_some_and(|coin| {
                coin.amount -= &amount.amount;
                coin.amount == num_bigint::BigUint::default()
            });
            if emptied {
                by_validator.remove(validator);
            }
            if by_validator.is_empty() {
                self.state.delegations.remove(delegator);
            }
        }
        self.state
            .unbonding
            .entry(delegator.to_string())
            .or_default()
            .entry(validator.to_string())
            .or_default()
            .push(UnbondingEntry {
                creation_height: height,
                completion_time: completion_time(Utc::now(), self.unbonding_time),
                initial_balance: amount.clone(),
                balance: amount,
            });
        Ok(())
    }

    /// Pay out every unbonding entry completed by `now`.
    fn mature_unbondings(&mut self, now: DateTime<Utc>) {
        let mut payouts = Vec::new();
        for (delegator, by_validator) in &mut self.state.unbonding {
            for entries in by_validator.values_mut() {
                entries.retain(|entry| {
                    let done = entry.completion_time <= now;
                    if done {
                        payouts.push((delegator.clone(), entry.balance.clone()));
                    }
                    !done
                });
            }
            by_validator.retain(|_, entries| !entries.is_empty());
        }
        self.state.unbonding.retain(|_, by_validator| !by_validator.is_empty());
        for (delegator, coin) in payouts {
            debug!("unbonding of {coin} completed for {delegator}");
            self.credit(&delegator, &Coins::from_iter([coin]));
        }
    }
}

/// The ledger if a transaction ever ran on this home.
pub fn existing(home: &Path) -> Result<Option<Ledger>> {
    if ledger_path(home).is_file() {
        Ledger::open(home).map(Some)
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const ALICE: &str = "mock1alice0000";
    const BOB: &str = "mock1bob0000000";
    const VALIDATOR: &str = "mockvaloper1node0";

    fn home_with_genesis(unbonding_time: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(home::config_dir(dir.path())).unwrap();
        let genesis = json!({
            "chain_id": "testing",
            "app_state": {
                "auth": {"accounts": []},
                "bank": {"balances": [
                    {"address": ALICE, "coins": [{"denom": "stake", "amount": "100000000"}]},
                ]},
                "staking": {
                    "params": {"unbonding_time": unbonding_time, "bond_denom": "stake"},
                    "validators": [{"operator_address": VALIDATOR, "tokens": "100"}],
                },
            },
        });
        home::write_genesis(dir.path(), &genesis).unwrap();
        dir
    }

    fn coins(text: &str) -> Coins {
        Coins::parse(text).unwrap()
    }

    fn stake(amount: u64) -> Coin {
        Coin::new(amount, DENOM)
    }

    #[test]
    fn test_seeded_from_genesis_and_persisted() {
        let dir = home_with_genesis("60s");
        assert!(existing(dir.path()).unwrap().is_none());

        let mut ledger = Ledger::open(dir.path()).unwrap();
        assert_eq!(ledger.balance(ALICE).to_string(), "100000000stake");
        ledger.send(ALICE, BOB, &coins("25stake")).unwrap();
        ledger.save().unwrap();

        let reopened = existing(dir.path()).unwrap().unwrap();
        assert_eq!(reopened.balance(BOB).to_string(), "25stake");
        assert_eq!(reopened.supply().to_string(), "100000000stake");

        home::unsafe_reset_all(dir.path()).unwrap();
        assert!(existing(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_delegate_and_unbond_move_funds() {
        let dir = home_with_genesis("60s");
        let mut ledger = Ledger::open(dir.path()).unwrap();
        ledger.charge_fees(ALICE, &coins("1stake")).unwrap();
        ledger.delegate(ALICE, VALIDATOR, stake(10_000)).unwrap();
        assert_eq!(ledger.balance(ALICE).to_string(), "99989999stake");
        assert_eq!(ledger.delegation(ALICE, VALIDATOR), Some(&stake(10_000)));

        ledger.undelegate(ALICE, VALIDATOR, stake(5_000), 7).unwrap();
        assert_eq!(ledger.delegation(ALICE, VALIDATOR), Some(&stake(5_000)));
        let entries = ledger.unbonding(ALICE, VALIDATOR);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].balance, stake(5_000));
        assert_eq!(entries[0].creation_height, 7);

        ledger.undelegate(ALICE, VALIDATOR, stake(5_000), 8).unwrap();
        assert_eq!(ledger.delegation(ALICE, VALIDATOR), None);
        assert_eq!(ledger.delegated_to(VALIDATOR), Coins::new());
        assert_eq!(ledger.supply().to_string(), "99999999stake");
    }

    #[test]
    fn test_refusals_leave_state_alone() {
        let dir = home_with_genesis("60s");
        let mut ledger = Ledger::open(dir.path()).unwrap();

        let err = ledger.send(BOB, ALICE, &coins("1stake")).unwrap_err();
        assert_eq!(err.code(), 5);
        let err = ledger
            .delegate(ALICE, "mockvaloper1nobody", stake(1))
            .unwrap_err();
        assert_eq!(err.code(), 3);
        let err = ledger
            .delegate(ALICE, VALIDATOR, Coin::new(1u32, "ufoo"))
            .unwrap_err();
        assert_eq!(err.code(), 10);
        let err = ledger
            .undelegate(ALICE, VALIDATOR, stake(1), 1)
            .unwrap_err();
        assert!(matches!(err, Rejection::InsufficientShares { .. }));

        assert_eq!(ledger.balance(ALICE).to_string(), "100000000stake");
        assert!(ledger.unbonding(ALICE, VALIDATOR).is_empty());
    }

    #[test]
    fn test_completed_unbondings_are_paid_out() {
        let dir = home_with_genesis("0s");
        let mut ledger = Ledger::open(dir.path()).unwrap();
        ledger.delegate(ALICE, VALIDATOR, stake(400)).unwrap();
        ledger.undelegate(ALICE, VALIDATOR, stake(400), 3).unwrap();
        ledger.save().unwrap();

        let ledger = Ledger::open(dir.path()).unwrap();
        assert!(ledger.unbonding(ALICE, VALIDATOR).is_empty());
        assert_eq!(ledger.balance(ALICE).to_string(), "100000000stake");
    }

    #[test]
    fn test_proto_durations() {
        assert_eq!(parse_proto_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_proto_duration("0.5s").unwrap(), Duration::from_millis(500));
        assert!(parse_proto_duration("60").is_err());
        assert!(parse_proto_duration("-1s").is_err());
    }
}
