//! Typed driver over the node's command-line client.
//!
//! Every call blocks until the command exits. Flags that bind a call to the
//! cluster (`--home`, `--node`, `--chain-id`, ...) are injected by command
//! family so tests only spell out what is specific to them.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use num_bigint::BigUint;
use serde::Deserialize;
use serde_json::Value;
use systest_common::{
    Coin, Coins, HarnessError, HarnessResult, LogLevel, LogSource, PollPolicy, SystemConfig,
    TestLogger, await_until,
};

use crate::binary::{CommandResult, NodeBinary};
use crate::json::{as_u64_lenient, collect, lookup, require_str};

/// Key that `testnet init-files` creates in node 0's keyring.
pub const NODE0_KEY: &str = "node0";

/// The fields of a broadcast or `q tx` response the harness acts on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TxResponse {
    #[serde(default)]
    pub txhash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub raw_log: String,
    #[serde(default, deserialize_with = "lenient_height")]
    pub height: u64,
}

fn lenient_height<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(as_u64_lenient(&value).unwrap_or(0))
}

impl TxResponse {
    pub fn from_value(value: &Value) -> HarnessResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    fn ensure_accepted(self) -> HarnessResult<Self> {
        if self.code == 0 {
            Ok(self)
        } else {
            Err(HarnessError::TxRejected {
                code: self.code,
                raw_log: self.raw_log,
            })
        }
    }
}

/// CLI driver bound to one node home and RPC address.
///
/// Copies made with [`ChainCli::with_run_errors_ignored`] or
/// [`ChainCli::without_tx_commit_wait`] share the original's call lock.
#[derive(Clone)]
pub struct ChainCli {
    binary: Arc<dyn NodeBinary>,
    home: PathBuf,
    node_addr: String,
    chain_id: String,
    keyring_backend: String,
    default_fees: String,
    denom: String,
    command_timeout: Duration,
    block_time: Duration,
    block_timeout: Duration,
    logger: TestLogger,
    call_lock: Arc<Mutex<()>>,
    ignore_run_errors: bool,
    await_tx_commit: bool,
}

impl std::fmt::Debug for ChainCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainCli")
            .field("binary", &self.binary.name())
            .field("home", &self.home)
            .field("node_addr", &self.node_addr)
            .field("ignore_run_errors", &self.ignore_run_errors)
            .field("await_tx_commit", &self.await_tx_commit)
            .finish_non_exhaustive()
    }
}

impl ChainCli {
    pub fn new(
        config: &SystemConfig,
        binary: Arc<dyn NodeBinary>,
        home: impl Into<PathBuf>,
        node_addr: impl Into<String>,
        logger: TestLogger,
    ) -> Self {
        Self {
            binary,
            home: home.into(),
            node_addr: node_addr.into(),
            chain_id: config.chain_id.clone(),
            keyring_backend: config.keyring_backend.clone(),
            default_fees: config.default_fees.clone(),
            denom: config.denom.clone(),
            command_timeout: config.command_timeout,
            block_time: config.block_time,
            block_timeout: config.block_timeout(),
            logger,
            call_lock: Arc::new(Mutex::new(())),
            ignore_run_errors: false,
            await_tx_commit: true,
        }
    }

    /// Copy whose `run` hands back failing results instead of erroring.
    pub fn with_run_errors_ignored(&self) -> Self {
        Self {
            ignore_run_errors: true,
            ..self.clone()
        }
    }

    /// Copy whose transactions return right after the sync broadcast.
    pub fn without_tx_commit_wait(&self) -> Self {
        Self {
            await_tx_commit: false,
            ..self.clone()
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn node_addr(&self) -> &str {
        &self.node_addr
    }

    pub fn denom(&self) -> &str {
        &self.denom
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.call_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `args` plus the flags its command family needs.
    pub fn with_injected_flags(&self, args: &[String]) -> Vec<String> {
        let mut out = args.to_vec();
        let home = self.home.to_string_lossy().into_owned();
        let push = |out: &mut Vec<String>, pairs: &[&str]| {
            out.extend(pairs.iter().map(|s| s.to_string()));
        };
        match args.first().map(String::as_str) {
            Some("tx") => {
                push(
                    &mut out,
                    &[
                        "--home",
                        &home,
                        "--keyring-backend",
                        &self.keyring_backend,
                        "--chain-id",
                        &self.chain_id,
                        "--node",
                        &self.node_addr,
                        "--broadcast-mode",
                        "sync",
                        "--output",
                        "json",
                        "--yes",
                    ],
                );
                if !has_flag(args, "--fees") {
                    push(&mut out, &["--fees", &self.default_fees]);
                }
            }
            Some("q") | Some("query") => {
                push(
                    &mut out,
                    &["--node", &self.node_addr, "--output", "json", "--home", &home],
                );
            }
            Some("keys") => {
                push(
                    &mut out,
                    &["--home", &home, "--keyring-backend", &self.keyring_backend],
                );
            }
            _ => push(&mut out, &["--home", &home]),
        }
        out
    }

    /// Run `args` (flags injected) and require success unless errors are ignored.
    pub fn run(&self, args: &[String]) -> HarnessResult<CommandResult> {
        let full = self.with_injected_flags(args);
        let result = {
            let _guard = self.lock();
            self.binary.exec(&full, self.command_timeout)?
        };
        if self.ignore_run_errors {
            if !result.success() {
                self.logger.log(
                    LogLevel::Debug,
                    LogSource::Cli,
                    format!(
                        "ignoring failure of `{}`: {}",
                        result.command,
                        result.combined_output().trim()
                    ),
                );
            }
            Ok(result)
        } else {
            result.ensure_success()
        }
    }

    /// Arbitrary invocation; returns stdout.
    pub fn custom_command(&self, args: &[&str]) -> HarnessResult<String> {
        Ok(self.run(&owned(args))?.stdout)
    }

    /// Read-only query; `q` is prepended when missing.
    pub fn custom_query(&self, args: &[&str]) -> HarnessResult<Value> {
        let mut full = owned(args);
        if !matches!(args.first(), Some(&"q") | Some(&"query")) {
            full.insert(0, "q".to_string());
        }
        self.run(&full)?.json()
    }

    /// Create a key and return its address.
    pub fn add_key(&self, name: &str) -> HarnessResult<String> {
        let result = self.run(&owned(&["keys", "add", name, "--output", "json"]))?;
        let value = result.json()?;
        let address = require_str(&value, "address")?.to_string();
        self.logger.log_with_context(
            LogLevel::Info,
            LogSource::Cli,
            format!("added key {name}"),
            vec![("address".to_string(), address.clone())],
        );
        Ok(address)
    }

    pub fn get_key_addr(&self, name: &str) -> HarnessResult<String> {
        let result = self.run(&owned(&["keys", "show", name, "-a"]))?;
        let address = result.stdout.trim().to_string();
        if address.is_empty() {
            return Err(HarnessError::OutputParse {
                command: result.command,
                reason: "empty address".to_string(),
            });
        }
        Ok(address)
    }

    /// Broadcast a transaction; waits for inclusion unless disabled.
    pub fn tx(&self, args: &[&str]) -> HarnessResult<TxResponse> {
        let mut full = owned(args);
        if full.first().map(String::as_str) != Some("tx") {
            full.insert(0, "tx".to_string());
        }
        let result = self.run(&full)?;
        let broadcast = TxResponse::from_value(&result.json()?)?.ensure_accepted()?;
        self.logger.log_with_context(
            LogLevel::Info,
            LogSource::Cli,
            format!("broadcast {}", args.join(" ")),
            vec![("txhash".to_string(), broadcast.txhash.clone())],
        );
        if !self.await_tx_commit {
            return Ok(broadcast);
        }
        self.await_tx(&broadcast.txhash)
    }

    /// Poll `q tx <hash>` until included; fails if the included tx has a
    /// non-zero code. Never resubmits.
    pub fn await_tx(&self, txhash: &str) -> HarnessResult<TxResponse> {
        if txhash.is_empty() {
            return Err(HarnessError::state("broadcast response has no txhash"));
        }
        let query = owned(&["q", "tx", txhash]);
        let strict = Self {
            ignore_run_errors: false,
            ..self.clone()
        };
        let included = await_until(
            &format!("tx {txhash} to be included"),
            &PollPolicy::fixed(self.block_timeout, self.block_time),
            || strict.run(&query).and_then(|r| r.json()).map(Some),
        )?;
        TxResponse::from_value(&included)?.ensure_accepted()
    }

    /// `tx staking delegate <validator> <amount>`, extra flags appended.
    pub fn stake(&self, validator: &str, amount: &str, extra: &[&str]) -> HarnessResult<TxResponse> {
        let mut args = vec!["tx", "staking", "delegate", validator, amount];
        args.extend_from_slice(extra);
        self.tx(&args)
    }

    /// `tx staking unbond <validator> <amount>`, extra flags appended.
    pub fn unstake(
        &self,
        validator: &str,
        amount: &str,
        extra: &[&str],
    ) -> HarnessResult<TxResponse> {
        let mut args = vec!["tx", "staking", "unbond", validator, amount];
        args.extend_from_slice(extra);
        self.tx(&args)
    }

    /// Send `amount` from the `node0` validator key.
    pub fn fund_address(&self, address: &str, amount: &str) -> HarnessResult<TxResponse> {
        self.tx(&["tx", "bank", "send", NODE0_KEY, address, amount, "--from", NODE0_KEY])
    }

    /// Validator entries from `q staking validators`.
    pub fn query_validators(&self) -> HarnessResult<Vec<Value>> {
        let value = self.custom_query(&["q", "staking", "validators"])?;
        Ok(collect(&value, "validators.#").into_iter().cloned().collect())
    }

    pub fn validator_addresses(&self) -> HarnessResult<Vec<String>> {
        Ok(self
            .query_validators()?
            .iter()
            .filter_map(|v| v.get("operator_address").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Balance of `address` in `denom`; zero when the node reports none.
    pub fn query_balance(&self, address: &str, denom: &str) -> HarnessResult<BigUint> {
        let value = self.custom_query(&["q", "bank", "balance", address, denom])?;
        match lookup(&value, "balance.amount") {
            None | Some(Value::Null) => Ok(BigUint::default()),
            Some(amount) => parse_amount(amount),
        }
    }

    pub fn query_balances(&self, address: &str) -> HarnessResult<Coins> {
        let value = self.custom_query(&["q", "bank", "balances", address])?;
        collect(&value, "balances.#")
            .into_iter()
            .map(|coin| serde_json::from_value::<Coin>(coin.clone()).map_err(HarnessError::from))
            .collect()
    }

    /// Delegated amount, zero when no delegation exists.
    pub fn query_delegation(&self, delegator: &str, validator: &str) -> HarnessResult<BigUint> {
        let value = self.custom_query(&["q", "staking", "delegation", delegator, validator])?;
        let amount = lookup(&value, "balance.amount")
            .or_else(|| lookup(&value, "delegation_response.balance.amount"));
        match amount {
            None | Some(Value::Null) => Ok(BigUint::default()),
            Some(amount) => parse_amount(amount),
        }
    }

    /// Balances of every unbonding entry between the pair.
    pub fn query_unbonding(&self, delegator: &str, validator: &str) -> HarnessResult<Vec<BigUint>> {
        let value = self.custom_query(&[
            "q",
            "staking",
            "unbonding-delegation",
            delegator,
            validator,
        ])?;
        let mut entries = collect(&value, "entries.#.balance");
        if entries.is_empty() {
            entries = collect(&value, "unbond.entries.#.balance");
        }
        entries.into_iter().map(parse_amount).collect()
    }
}

fn parse_amount(value: &Value) -> HarnessResult<BigUint> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(HarnessError::state(format!("not an amount: {other}"))),
    };
    text.parse()
        .map_err(|_| HarnessError::state(format!("not an amount: {text}")))
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    let prefix = format!("{flag}=");
    args.iter().any(|a| a == flag || a.starts_with(&prefix))
}
