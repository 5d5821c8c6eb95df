//! `testnet init-files` and `genesis add-genesis-account`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail, ensure};
use chrono::{SecondsFormat, Utc};
use clap::Args;
use serde_json::{Value, json};
use systest::genesis::{
    Account, BaseAccount, BaseVestingAccount, ContinuousVestingAccount, DelayedVestingAccount,
    GenesisDocument,
};
use systest_common::{Coin, Coins};
use tracing::info;

use crate::home::{self, ChainState, DENOM, NodeSettings};
use crate::keyring::{Keyring, VALOPER_PREFIX, derive_address, resolve_address};

const VALIDATOR_BALANCE: u64 = 1_000_000_000;
const VALIDATOR_STAKE: u64 = 100_000_000;

#[derive(Args)]
pub struct InitFilesArgs {
    /// Number of validators
    #[arg(long = "v", default_value_t = 4)]
    validators: usize,

    #[arg(long, default_value = "./.testnets")]
    output_dir: PathBuf,

    #[arg(long, default_value = "testing")]
    chain_id: String,

    #[arg(long, default_value = "5s")]
    commit_timeout: String,

    #[arg(long, default_value = "")]
    minimum_gas_prices: String,

    /// Home sub-directory of every node
    #[arg(long, default_value = "mock-chaind")]
    node_daemon_home: String,

    /// Accepted for compatibility; every node already binds its own port
    #[arg(long)]
    single_host: bool,
}

#[derive(Args)]
pub struct AddAccountArgs {
    /// Address or key name in this home's keyring
    address: String,

    /// Total coins, e.g. `100stake,5foo`
    coins: String,

    #[arg(long)]
    vesting_amount: Option<String>,

    /// Unix seconds
    #[arg(long, default_value_t = 0)]
    vesting_start_time: i64,

    /// Unix seconds
    #[arg(long, default_value_t = 0)]
    vesting_end_time: i64,
}

pub fn init_files(args: &InitFilesArgs) -> Result<()> {
    ensure!(args.validators >= 1, "--v must be at least 1");
    humantime::parse_duration(&args.commit_timeout)
        .with_context(|| format!("invalid --commit-timeout `{}`", args.commit_timeout))?;

    let homes: Vec<PathBuf> = (0..args.validators)
        .map(|i| {
            args.output_dir
                .join(format!("node{i}"))
                .join(&args.node_daemon_home)
        })
        .collect();

    let mut accounts = Vec::new();
    let mut balances = Vec::new();
    let mut validators = Vec::new();
    for (i, home) in homes.iter().enumerate() {
        let moniker = format!("node{i}");
        fs::create_dir_all(home::config_dir(home))?;
        ChainState::default().save(home)?;
        NodeSettings {
            moniker: moniker.clone(),
            chain_id: args.chain_id.clone(),
            commit_timeout: args.commit_timeout.clone(),
            minimum_gas_prices: args.minimum_gas_prices.clone(),
        }
        .save(home)?;

        let key = Keyring::open(home).add(&moniker)?;
        accounts.push(serde_json::to_value(Account::Base(BaseAccount {
            address: key.address.clone(),
            pub_key: None,
            account_number: i as i64,
            sequence: 0,
        }))?);
        balances.push(json!({
            "address": key.address,
            "coins": [Coin::new(VALIDATOR_BALANCE, DENOM)],
        }));
        validators.push(json!({
            "operator_address": derive_address(VALOPER_PREFIX, &moniker),
            "status": "BOND_STATUS_BONDED",
            "tokens": VALIDATOR_STAKE.to_string(),
            "description": {"moniker": moniker},
        }));
    }

    let supply = Coin::new(VALIDATOR_BALANCE * args.validators as u64, DENOM);
    let genesis = json!({
        "genesis_time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "chain_id": args.chain_id,
        "initial_height": "1",
        "app_state": {
            "auth": {"params": {}, "accounts": accounts},
            "bank": {"params": {}, "balances": balances, "supply": [supply]},
            "staking": {
                "params": {"unbonding_time": "1814400s", "bond_denom": DENOM},
                "validators": validators,
            },
            "gov": {"params": {"voting_period": "172800s"}},
        },
    });
    for home in &homes {
        home::write_genesis(home, &genesis)?;
    }

    eprintln!(
        "Successfully initialized {} node directories",
        args.validators
    );
    Ok(())
}

pub fn parse_coins(text: &str) -> Result<Coins> {
    Coins::parse(text).map_err(|e| anyhow!("failed to parse coins: {e}"))
}

fn array_at<'a>(genesis: &'a mut Value, section: &str, field: &str) -> Result<&'a mut Vec<Value>> {
    let slot = genesis
        .get_mut("app_state")
        .and_then(|app| app.get_mut(section))
        .and_then(Value::as_object_mut)
        .with_context(|| format!("genesis has no app_state.{section} object"))?
        .entry(field)
        .or_insert_with(|| Value::Array(Vec::new()));
    slot.as_array_mut()
        .with_context(|| format!("app_state.{section}.{field} is not an array"))
}

pub fn add_genesis_account(home: &Path, args: &AddAccountArgs) -> Result<()> {
    let address = resolve_address(home, &args.address)?;
    let coins = parse_coins(&args.coins)?;

    let mut genesis = home::read_genesis(home)?;
    let doc = GenesisDocument::from_value(genesis.clone())?;
    if doc.account(&address).is_some() {
        bail!("cannot add account at existing address {address}");
    }

    let base = BaseAccount {
        address: address.clone(),
        pub_key: None,
        account_number: doc.accounts().len() as i64,
        sequence: 0,
    };
    let account = match &args.vesting_amount {
        None => Account::Base(base),
        Some(vesting) => {
            let vesting = parse_coins(vesting)?;
            for coin in vesting.to_vec() {
                ensure!(
                    coins.amount_of(&coin.denom) >= coin.amount,
                    "vesting amount cannot be greater than total amount"
                );
            }
            let base_vesting_account = BaseVestingAccount {
                base_account: base,
                original_vesting: vesting.to_vec(),
                delegated_free: Vec::new(),
                delegated_vesting: Vec::new(),
                end_time: args.vesting_end_time,
            };
            match (args.vesting_start_time, args.vesting_end_time) {
                (start, end) if start != 0 && end != 0 => {
                    ensure!(start < end, "vesting start time must be before end time");
                    Account::ContinuousVesting(ContinuousVestingAccount {
                        base_vesting_account,
                        start_time: start,
                    })
                }
                (_, end) if end != 0 => {
                    Account::DelayedVesting(DelayedVestingAccount { base_vesting_account })
                }
                _ => bail!(
                    "invalid vesting parameters; must supply start and end time or end time"
                ),
            }
        }
    };
    account.validate()?;

    array_at(&mut genesis, "auth", "accounts")?.push(serde_json::to_value(&account)?);
    array_at(&mut genesis, "bank", "balances")?.push(json!({
        "address": address,
        "coins": coins.to_vec(),
    }));

    let supply_slot = array_at(&mut genesis, "bank", "supply")?;
    let mut supply: Coins = serde_json::from_value::<Vec<Coin>>(Value::Array(supply_slot.clone()))
        .context("app_state.bank.supply")?
        .into_iter()
        .collect();
    for coin in coins.to_vec() {
        supply.add(coin);
    }
    *supply_slot = supply
        .to_vec()
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()?;

    home::write_genesis(home, &genesis)?;
    info!("added genesis account {address} with {coins}");
    Ok(())
}

/// One-validator testnet in a temp dir; returns node0's home.
#[cfg(test)]
pub fn init_test_home() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    init_files(&InitFilesArgs {
        validators: 1,
        output_dir: dir.path().to_path_buf(),
        chain_id: "testing".to_string(),
        commit_timeout: "1s".to_string(),
        minimum_gas_prices: String::new(),
        node_daemon_home: "mock-chaind".to_string(),
        single_host: true,
    })
    .unwrap();
    let home = dir.path().join("node0").join("mock-chaind");
    (dir, home)
}

#[cfg(test)]
mod tests {
    use systest::genesis::AccountKind;

    use super::*;

    const ADDRESS: &str = "cosmos1vestingacct";

    fn testnet() -> (tempfile::TempDir, PathBuf) {
        init_test_home()
    }

    fn account(coins: &str, vesting: Option<&str>, start: i64, end: i64) -> AddAccountArgs {
        AddAccountArgs {
            address: ADDRESS.to_string(),
            coins: coins.to_string(),
            vesting_amount: vesting.map(str::to_string),
            vesting_start_time: start,
            vesting_end_time: end,
        }
    }

    fn added(home: &Path) -> Option<Account> {
        GenesisDocument::from_value(home::read_genesis(home).unwrap())
            .unwrap()
            .account(ADDRESS)
            .cloned()
    }

    fn rejection(home: &Path, args: &AddAccountArgs) -> String {
        let err = add_genesis_account(home, args).unwrap_err().to_string();
        assert!(added(home).is_none(), "rejected account was written");
        err
    }

    #[test]
    fn test_vesting_above_total_is_rejected() {
        let (_dir, home) = testnet();
        let err = rejection(&home, &account("100stake", Some("200stake"), 0, 2_000));
        assert!(err.contains("greater than total"), "{err}");

        let err = rejection(&home, &account("100stake", Some("1foo"), 0, 2_000));
        assert!(err.contains("greater than total"), "{err}");
    }

    #[test]
    fn test_start_time_without_end_time_is_rejected() {
        let (_dir, home) = testnet();
        let err = rejection(&home, &account("100stake", Some("50stake"), 1_000, 0));
        assert!(err.contains("must supply start and end time"), "{err}");
    }

    #[test]
    fn test_start_not_before_end_is_rejected() {
        let (_dir, home) = testnet();
        for (start, end) in [(2_000, 1_000), (1_500, 1_500)] {
            let err = rejection(&home, &account("100stake", Some("50stake"), start, end));
            assert!(err.contains("before end time"), "{err}");
        }
    }

    #[test]
    fn test_vesting_accounts_are_written_with_their_schedule() {
        let (_dir, home) = testnet();
        add_genesis_account(&home, &account("100stake", Some("40stake"), 0, 2_000)).unwrap();
        let delayed = added(&home).unwrap();
        assert_eq!(delayed.kind(), AccountKind::DelayedVesting);
        assert_eq!(delayed.end_time(), 2_000);

        let (_dir, home) = testnet();
        add_genesis_account(&home, &account("100stake", Some("40stake"), 1_000, 2_000)).unwrap();
        let continuous = added(&home).unwrap();
        assert_eq!(continuous.kind(), AccountKind::ContinuousVesting);
        assert_eq!(continuous.start_time(), 1_000);
        assert_eq!(continuous.original_vesting().to_string(), "40stake");
    }

    #[test]
    fn test_plain_account_updates_balances_and_supply() {
        let (_dir, home) = testnet();
        add_genesis_account(&home, &account("100stake,5foo", None, 0, 0)).unwrap();
        let doc = GenesisDocument::from_value(home::read_genesis(&home).unwrap()).unwrap();
        assert_eq!(doc.account(ADDRESS).unwrap().kind(), AccountKind::Base);
        assert_eq!(doc.balance_of(ADDRESS).to_string(), "5foo,100stake");

        let supply = &home::read_genesis(&home).unwrap()["app_state"]["bank"]["supply"];
        let supply: Coins = serde_json::from_value::<Vec<Coin>>(supply.clone())
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(
            supply.amount_of(DENOM),
            num_bigint::BigUint::from(VALIDATOR_BALANCE + 100)
        );

        let err = add_genesis_account(&home, &account("1stake", None, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("existing address"));
    }
}
