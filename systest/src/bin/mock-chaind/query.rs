//! Read-only queries over the home's genesis document and, once a
//! transaction ran, its ledger.

use std::path::Path;

use anyhow::{Result, anyhow, bail};
use chrono::SecondsFormat;
use clap::Subcommand;
use num_bigint::BigUint;
use serde_json::{Value, json};
use systest::genesis::GenesisDocument;
use systest::json::{as_u64_lenient, lookup};

use crate::home::{self, DENOM};
use crate::ledger::{self, Ledger};

#[derive(Subcommand)]
pub enum QueryCommand {
    Bank {
        #[command(subcommand)]
        command: BankQuery,
    },
    Staking {
        #[command(subcommand)]
        command: StakingQuery,
    },
    Auth {
        #[command(subcommand)]
        command: AuthQuery,
    },
    /// Look up a transaction by hash
    Tx { hash: String },
}

#[derive(Subcommand)]
pub enum BankQuery {
    Balance { address: String, denom: String },
    Balances { address: String },
    Total,
}

#[derive(Subcommand)]
pub enum StakingQuery {
    Validators,
    Params,
    Delegation { delegator: String, validator: String },
    UnbondingDelegation { delegator: String, validator: String },
}

#[derive(Subcommand)]
pub enum AuthQuery {
    Account { address: String },
    Accounts,
}

fn not_found_delegation(delegator: &str, validator: &str) -> anyhow::Error {
    anyhow!("delegation with delegator {delegator} not found for validator {validator}")
}

/// Genesis validators with tokens bonded through transactions added.
fn validators(doc: &GenesisDocument, ledger: Option<&Ledger>) -> Value {
    let mut validators = lookup(doc.value(), "app_state.staking.validators")
        .cloned()
        .unwrap_or(json!([]));
    let (Some(ledger), Some(list)) = (ledger, validators.as_array_mut()) else {
        return validators;
    };
    for validator in list {
        let Some(operator) = validator.get("operator_address").and_then(Value::as_str) else {
            continue;
        };
        let bonded = ledger.delegated_to(operator).amount_of(DENOM);
        let genesis = validator
            .get("tokens")
            .and_then(as_u64_lenient)
            .map(BigUint::from)
            .unwrap_or_default();
        validator["tokens"] = json!((genesis + bonded).to_string());
    }
    validators
}

pub fn run(home_dir: &Path, command: QueryCommand) -> Result<Value> {
    let raw = home::read_genesis(home_dir)?;
    let doc = GenesisDocument::from_value(raw)?;
    let ledger = ledger::existing(home_dir)?;
    let balance_of = |address: &str| match &ledger {
        Some(ledger) => ledger.balance(address),
        None => doc.balance_of(address),
    };
    let value = match command {
        QueryCommand::Bank { command } => match command {
            BankQuery::Balance { address, denom } => {
                let amount = balance_of(&address).amount_of(&denom);
                json!({"balance": {"denom": denom, "amount": amount.to_string()}})
            }
            BankQuery::Balances { address } => json!({
                "balances": balance_of(&address).to_vec(),
                "pagination": {"next_key": null, "total": "0"},
            }),
            BankQuery::Total => match &ledger {
                Some(ledger) => json!({"supply": ledger.supply().to_vec()}),
                None => json!({
                    "supply": lookup(doc.value(), "app_state.bank.supply").cloned().unwrap_or(json!([])),
                }),
            },
        },
        QueryCommand::Staking { command } => match command {
            StakingQuery::Validators => json!({
                "validators": validators(&doc, ledger.as_ref()),
                "pagination": {"next_key": null, "total": "0"},
            }),
            StakingQuery::Params => json!({
                "params": lookup(doc.value(), "app_state.staking.params").cloned().unwrap_or(json!({})),
            }),
            StakingQuery::Delegation {
                delegator,
                validator,
            } => {
                let balance = ledger
                    .as_ref()
                    .and_then(|l| l.delegation(&delegator, &validator))
                    .ok_or_else(|| not_found_delegation(&delegator, &validator))?;
                json!({"delegation_response": {
                    "delegation": {
                        "delegator_address": delegator,
                        "validator_address": validator,
                        "shares": format!("{}.000000000000000000", balance.amount),
                    },
                    "balance": balance,
                }})
            }
            StakingQuery::UnbondingDelegation {
                delegator,
                validator,
            } => {
                let entries = ledger
                    .as_ref()
                    .map(|l| l.unbonding(&delegator, &validator))
                    .unwrap_or_default();
                if entries.is_empty() {
                    bail!("unbonding delegation with delegator {delegator} not found for validator {validator}");
                }
                let entries: Vec<Value> = entries
                    .iter()
                    .map(|e| {
                        json!({
                            "creation_height": e.creation_height.to_string(),
                            "completion_time": e.completion_time.to_rfc3339_opts(SecondsFormat::Secs, true),
                            "initial_balance": e.initial_balance.amount.to_string(),
                            "balance": e.balance.amount.to_string(),
                        })
                    })
                    .collect();
                json!({"unbond": {
                    "delegator_address": delegator,
                    "validator_address": validator,
                    "entries": entries,
                }})
            }
        },
        QueryCommand::Auth { command } => match command {
            AuthQuery::Account { address } => match doc.account(&address) {
                Some(account) => json!({"account": account}),
                None => bail!("account {address} not found"),
            },
            AuthQuery::Accounts => json!({"accounts": doc.accounts()}),
        },
        QueryCommand::Tx { hash } => ledger
            .as_ref()
            .and_then(|l| l.tx(&hash))
            .cloned()
            .ok_or_else(|| anyhow!("tx ({hash}) not found"))?,
    };
    Ok(value)
}
