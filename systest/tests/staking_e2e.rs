//! Stake, unstake and fund flows.
//!
//! The scenarios run against mock-chaind. The same stake/unstake scenario
//! runs against a real node binary with:
//!
//! ```text
//! SYSTEST_BINARY=/path/to/simd cargo test -p systest --test staking_e2e -- --ignored
//! ```

mod common;

use std::time::Duration;

use common::mock_cluster;
use num_bigint::BigUint;
use serial_test::serial;
use systest::genesis::{AddGenesisAccount, set_unbonding_time};
use systest::{HarnessError, HarnessResult, SuiteFixture, SystemUnderTest};

#[ctor::ctor]
fn init_test_logging() {
    systest::init_global_test_logging();
}

static SUITE: SuiteFixture = SuiteFixture::new();

fn build_system() -> HarnessResult<SystemUnderTest> {
    let mut sut = SystemUnderTest::from_environment("staking_e2e")?;
    sut.setup_chain()?;
    Ok(sut)
}

/// Fund a fresh account in genesis, delegate, then unbond half of it.
fn stake_unstake(sut: &mut SystemUnderTest) {
    let cli = sut.cli().clone();
    let account1 = cli.add_key("account1").unwrap();
    sut.modify_genesis_cli(&[AddGenesisAccount::new(&account1, "100000000stake").into_args()])
        .unwrap();
    sut.modify_genesis_json(vec![set_unbonding_time(Duration::from_secs(60))])
        .unwrap();
    sut.start_chain().unwrap();

    let validator = cli.validator_addresses().unwrap().remove(0);
    sut.await_next_block().unwrap();

    let from = format!("--from={account1}");
    cli.stake(&validator, "10000stake", &[from.as_str(), "--fees=1stake"])
        .unwrap();
    sut.await_next_block().unwrap();

    // 100000000 - 10000 delegated - 1 fee
    assert_eq!(
        cli.query_balance(&account1, "stake").unwrap(),
        BigUint::from(99_989_999u64)
    );
    assert_eq!(
        cli.query_delegation(&account1, &validator).unwrap(),
        BigUint::from(10_000u64)
    );

    cli.unstake(&validator, "5000stake", &[from.as_str(), "--fees=1stake"])
        .unwrap();
    sut.await_next_block().unwrap();

    assert_eq!(
        cli.query_delegation(&account1, &validator).unwrap(),
        BigUint::from(5_000u64)
    );
    assert_eq!(
        cli.query_unbonding(&account1, &validator).unwrap(),
        vec![BigUint::from(5_000u64)]
    );

    sut.stop_chain();
}

#[test]
#[serial]
fn e2e_stake_unstake_mock() {
    let mut cluster = mock_cluster("e2e_stake_unstake_mock", 2);
    stake_unstake(&mut cluster.sut);
}

#[test]
#[serial]
fn e2e_fund_and_rejected_transfers() {
    let mut cluster = mock_cluster("e2e_fund_and_rejected_transfers", 1);
    let sut = &mut cluster.sut;
    sut.start_chain().unwrap();
    sut.await_next_block().unwrap();

    let cli = sut.cli().clone();
    let bob = cli.add_key("bob").unwrap();
    let funded = cli.fund_address(&bob, "2500stake").unwrap();
    assert!(funded.height > 0);
    assert_eq!(cli.query_balance(&bob, "stake").unwrap(), BigUint::from(2_500u32));

    // Fees pass the check, the send itself fails on commit.
    let from = format!("--from={bob}");
    let err = cli
        .tx(&["tx", "bank", "send", &bob, "node0", "9999stake", &from, "--fees=1stake"])
        .unwrap_err();
    match err {
        HarnessError::TxRejected { code, raw_log } => {
            assert_eq!(code, 5);
            assert!(raw_log.contains("insufficient funds"), "{raw_log}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(cli.query_balance(&bob, "stake").unwrap(), BigUint::from(2_499u32));

    sut.stop_chain();
    sut.reset_chain().unwrap();
    sut.start_chain().unwrap();
    assert_eq!(
        cli.query_balance(&bob, "stake").unwrap(),
        BigUint::ZERO,
        "reset must discard transaction state"
    );
}

#[test]
#[serial]
#[ignore = "needs a real node binary via SYSTEST_BINARY"]
fn e2e_stake_unstake() {
    let mut sut = SUITE.acquire(build_system).unwrap();
    sut.reset_chain().unwrap();
    stake_unstake(&mut sut);
}
