//! `tx`: messages signed by a keyring key and applied to the home's ledger.
//!
//! There is no mempool. A transaction that passes the fee check is
//! committed at the next height right away; `q tx <hash>` then returns its
//! result. A message refused by the ledger is still committed, with a
//! non-zero code, and its fees stay charged.

use std::path::Path;

use anyhow::{Result, bail, ensure};
use chrono::{SecondsFormat, Utc};
use clap::{Args, Subcommand};
use serde_json::{Value, json};
use systest_common::{Coin, Coins};
use tracing::{debug, info};

use crate::genesis_cmd::parse_coins;
use crate::home::{ChainState, NodeSettings};
use crate::keyring::resolve_address;
use crate::ledger::{Ledger, Rejection};

const GAS_WANTED: u64 = 200_000;

#[derive(Args)]
pub struct TxArgs {
    #[command(subcommand)]
    command: TxCommand,

    /// Signing key name or address
    #[arg(long, global = true)]
    from: Option<String>,

    /// Fees paid by the signer, e.g. `1stake`
    #[arg(long, global = true, default_value = "")]
    fees: String,

    #[arg(long, global = true)]
    chain_id: Option<String>,

    #[arg(long, global = true, default_value = "sync")]
    broadcast_mode: String,

    /// Skip confirmation; there is never a prompt
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[arg(long, global = true)]
    gas: Option<String>,
}

#[derive(Subcommand)]
enum TxCommand {
    Bank {
        #[command(subcommand)]
        command: BankTx,
    },
    Staking {
        #[command(subcommand)]
        command: StakingTx,
    },
}

#[derive(Subcommand)]
enum BankTx {
    Send {
        /// Sending key name or address
        #[arg(value_name = "FROM")]
        sender: String,
        to: String,
        amount: String,
    },
}

#[derive(Subcommand)]
enum StakingTx {
    Delegate { validator: String, amount: String },
    Unbond { validator: String, amount: String },
}

enum Msg {
    Send {
        from: String,
        to: String,
        amount: Coins,
    },
    Delegate {
        delegator: String,
        validator: String,
        amount: Coin,
    },
    Undelegate {
        delegator: String,
        validator: String,
        amount: Coin,
    },
}

impl Msg {
    fn signer(&self) -> &str {
        match self {
            Self::Send { from, .. } => from,
            Self::Delegate { delegator, .. } | Self::Undelegate { delegator, .. } => delegator,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Send { from, to, amount } => json!({
                "@type": "/cosmos.bank.v1beta1.MsgSend",
                "from_address": from,
                "to_address": to,
                "amount": amount.to_vec(),
            }),
            Self::Delegate {
                delegator,
                validator,
                amount,
            } => json!({
                "@type": "/cosmos.staking.v1beta1.MsgDelegate",
                "delegator_address": delegator,
                "validator_address": validator,
                "amount": amount,
            }),
            Self::Undelegate {
                delegator,
                validator,
                amount,
            } => json!({
                "@type": "/cosmos.staking.v1beta1.MsgUndelegate",
                "delegator_address": delegator,
                "validator_address": validator,
                "amount": amount,
            }),
        }
    }

    fn apply(self, ledger: &mut Ledger, height: u64) -> Result<(), Rejection> {
        match self {
            Self::Send { from, to, amount } => ledger.send(&from, &to, &amount),
            Self::Delegate {
                delegator,
                validator,
                amount,
            } => ledger.delegate(&delegator, &validator, amount),
            Self::Undelegate {
                delegator,
                validator,
                amount,
            } => ledger.undelegate(&delegator, &validator, amount, height),
        }
    }
}

fn single_coin(text: &str) -> Result<Coin> {
    let mut coins = parse_coins(text)?.to_vec();
    match (coins.pop(), coins.is_empty()) {
        (Some(coin), true) => Ok(coin),
        _ => bail!("expected exactly one coin, got `{text}`"),
    }
}

fn build_msg(home: &Path, args: &TxArgs) -> Result<Msg> {
    let signer = || -> Result<String> {
        let from = args
            .from
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("--from is required"))?;
        resolve_address(home, from)
    };
    Ok(match &args.command {
        TxCommand::Bank {
            command: BankTx::Send { sender, to, amount },
        } => Msg::Send {
            from: resolve_address(home, sender)?,
            to: resolve_address(home, to)?,
            amount: parse_coins(amount)?,
        },
        TxCommand::Staking {
            command: StakingTx::Delegate { validator, amount },
        } => Msg::Delegate {
            delegator: signer()?,
            validator: validator.clone(),
            amount: single_coin(amount)?,
        },
        TxCommand::Staking {
            command: StakingTx::Unbond { validator, amount },
        } => Msg::Undelegate {
            delegator: signer()?,
            validator: validator.clone(),
            amount: single_coin(amount)?,
        },
    })
}

fn response(txhash: &str, height: u64, rejection: Option<&Rejection>) -> Value {
    let codespace = if rejection.is_some() { "sdk" } else { "" };
    json!({
        "height": height.to_string(),
        "txhash": txhash,
        "codespace": codespace,
        "code": rejection.map(Rejection::code).unwrap_or(0),
        "raw_log": rejection.map(ToString::to_string).unwrap_or_default(),
        "gas_wanted": GAS_WANTED.to_string(),
        "gas_used": "0",
    })
}

/// Check, apply and commit one transaction; returns the broadcast response.
pub fn run(home: &Path, args: TxArgs) -> Result<Value> {
    let settings = NodeSettings::load(home)?;
    if let Some(chain_id) = &args.chain_id {
        ensure!(
            *chain_id == settings.chain_id,
            "chain-id mismatch: tx for `{chain_id}`, node runs `{}`",
            settings.chain_id
        );
    }
    ensure!(
        matches!(args.broadcast_mode.as_str(), "sync" | "async" | "block"),
        "unknown broadcast mode `{}`",
        args.broadcast_mode
    );
    if let Some(gas) = &args.gas {
        debug!("ignoring --gas {gas}");
    }
    if !args.yes {
        debug!("no --yes given, signing without a prompt");
    }

    let fees = parse_coins(&args.fees)?;
    let msg = build_msg(home, &args)?;
    let signer = msg.signer().to_string();
    let body = msg.to_json();

    let mut ledger = Ledger::open(home)?;
    let height = ChainState::load(home)?.height + 1;
    let txhash = blake3::hash(
        format!("{}/{}/{signer}/{body}/{fees}", settings.chain_id, ledger.tx_count()).as_bytes(),
    )
    .to_hex()
    .to_uppercase();

    if let Err(rejection) = ledger.charge_fees(&signer, &fees) {
        info!("tx {txhash} refused at check: {rejection}");
        return Ok(response(&txhash, 0, Some(&rejection)));
    }
    let outcome = msg.apply(&mut ledger, height);
    let mut committed = response(&txhash, height, outcome.as_ref().err());
    committed["tx"] = json!({
        "body": {"messages": [body]},
        "auth_info": {"fee": {"amount": fees.to_vec(), "gas_limit": GAS_WANTED.to_string()}},
    });
    committed["timestamp"] = json!(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
    ledger.record_tx(&txhash, committed);
    ledger.save()?;

    match &outcome {
        Ok(()) => info!("tx {txhash} committed at height {height}"),
        Err(rejection) => info!("tx {txhash} failed at height {height}: {rejection}"),
    }
    Ok(response(&txhash, 0, None))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::genesis_cmd::init_test_home;
    use crate::keyring::{VALOPER_PREFIX, derive_address};
    use crate::ledger;

    #[derive(Parser)]
    struct TxCli {
        #[command(subcommand)]
        command: TxOnly,
    }

    #[derive(Subcommand)]
    enum TxOnly {
        Tx(TxArgs),
    }

    fn tx(home: &Path, args: &[&str]) -> Result<Value> {
        let TxOnly::Tx(args) = TxCli::try_parse_from(["mock-chaind", "tx"].iter().chain(args))?.command;
        run(home, args)
    }

    #[test]
    fn test_delegate_is_committed_with_fees_charged() {
        let (_dir, home) = init_test_home();
        let validator = derive_address(VALOPER_PREFIX, "node0");
        let rsp = tx(
            &home,
            &["staking", "delegate", &validator, "10000stake", "--from", "node0", "--fees=1stake", "--yes"],
        )
        .unwrap();
        assert_eq!(rsp["code"], 0);
        assert_eq!(rsp["height"], "0");

        let ledger = Ledger::open(&home).unwrap();
        let hash = rsp["txhash"].as_str().unwrap();
        let committed = ledger.tx(hash).unwrap();
        assert_eq!(committed["code"], 0);
        assert_eq!(committed["height"], "1");
        let node0 = resolve_address(&home, "node0").unwrap();
        assert_eq!(ledger.balance(&node0).to_string(), "999989999stake");
        assert_eq!(ledger.delegation(&node0, &validator), Some(&Coin::new(10_000u32, "stake")));
    }

    #[test]
    fn test_failed_message_keeps_fees_and_records_code() {
        let (_dir, home) = init_test_home();
        let rsp = tx(
            &home,
            &["staking", "unbond", "mockvaloper1nobody00", "5stake", "--from=node0", "--fees=2stake"],
        )
        .unwrap();
        assert_eq!(rsp["code"], 0);

        let ledger = Ledger::open(&home).unwrap();
        let committed = ledger.tx(rsp["txhash"].as_str().unwrap()).unwrap();
        assert_eq!(committed["code"], 3);
        let node0 = resolve_address(&home, "node0").unwrap();
        assert_eq!(ledger.balance(&node0).to_string(), "999999998stake");
    }

    #[test]
    fn test_unpayable_fees_are_refused_before_commit() {
        let (_dir, home) = init_test_home();
        let rsp = tx(
            &home,
            &["bank", "send", "mock1emptyaccount", "node0", "1stake", "--fees=1stake"],
        )
        .unwrap();
        assert_eq!(rsp["code"], 5);
        assert!(rsp["raw_log"].as_str().unwrap().contains("insufficient funds"));
        assert!(ledger::existing(&home).unwrap().is_none());
    }

    #[test]
    fn test_bad_invocations_are_errors() {
        let (_dir, home) = init_test_home();
        let err = tx(&home, &["bank", "send", "node0", "node0", "1stake", "--chain-id", "other"])
            .unwrap_err();
        assert!(err.to_string().contains("chain-id mismatch"));
        let err = tx(&home, &["staking", "delegate", "mockvaloper1x", "1stake"]).unwrap_err();
        assert!(err.to_string().contains("--from is required"));
        let err = tx(&home, &["staking", "delegate", "v", "1stake,2foo", "--from", "node0"])
            .unwrap_err();
        assert!(err.to_string().contains("exactly one coin"));
    }
}
