//! Genesis edit batches against the mock node binary.

mod common;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::mock_cluster;
use serial_test::serial;
use systest::genesis::{self, AccountKind, AddGenesisAccount};
use systest::{ClusterPhase, Coins, NodeState};

#[ctor::ctor]
fn init_test_logging() {
    systest::init_global_test_logging();
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn coins(text: &str) -> Coins {
    Coins::parse(text).unwrap()
}

#[test]
#[serial]
fn e2e_vesting_accounts() {
    let mut cluster = mock_cluster("e2e_vesting_accounts", 1);
    let sut = &mut cluster.sut;
    sut.reset_chain().unwrap();

    let cli = sut.cli().clone();
    let vest1 = cli.add_key("vesting1").unwrap();
    let vest2 = cli.add_key("vesting2").unwrap();
    let vest3 = cli.add_key("vesting3").unwrap();
    let start = unix_now() + 60;
    let end = unix_now() + 3600;

    sut.modify_genesis_cli(&[
        // delayed vesting, no cash
        AddGenesisAccount::new(&vest1, "100000000stake")
            .vesting_amount("100000000stake")
            .vesting_end_time(end)
            .into_args(),
        // continuous vesting, no cash
        AddGenesisAccount::new(&vest2, "100000001stake")
            .vesting_amount("100000001stake")
            .vesting_start_time(start)
            .vesting_end_time(end)
            .into_args(),
        // continuous vesting with some cash
        AddGenesisAccount::new(&vest3, "200000002stake")
            .vesting_amount("100000002stake")
            .vesting_start_time(start)
            .vesting_end_time(end)
            .into_args(),
    ])
    .unwrap();
    assert_eq!(sut.phase(), ClusterPhase::Uniform(NodeState::Configured));

    let doc = sut.genesis().unwrap();

    let delayed = doc.accounts_of(AccountKind::DelayedVesting);
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].address(), Some(vest1.as_str()));
    assert_eq!(delayed[0].original_vesting(), coins("100000000stake"));
    assert_eq!(delayed[0].end_time(), end);
    assert_eq!(delayed[0].start_time(), 0);

    let continuous = doc.accounts_of(AccountKind::ContinuousVesting);
    assert_eq!(continuous.len(), 2);
    assert_eq!(continuous[0].address(), Some(vest2.as_str()));
    assert_eq!(continuous[0].original_vesting(), coins("100000001stake"));
    assert_eq!(continuous[1].address(), Some(vest3.as_str()));
    assert_eq!(continuous[1].original_vesting(), coins("100000002stake"));
    for account in &continuous {
        assert_eq!(account.start_time(), start);
        assert_eq!(account.end_time(), end);
        assert!(0 < account.start_time() && account.start_time() < account.end_time());
        account.validate().unwrap();
    }

    assert_eq!(doc.balance_of(&vest1), coins("100000000stake"));
    assert_eq!(doc.balance_of(&vest2), coins("100000001stake"));
    assert_eq!(doc.balance_of(&vest3), coins("200000002stake"));
    assert!(doc.spendable_at_genesis(&vest1).is_empty());
    assert_eq!(doc.spendable_at_genesis(&vest3), coins("100000000stake"));

    // Every node starts from the same document.
    let raw = sut.read_genesis().unwrap();
    sut.with_each_node_home(|i, home| {
        assert_eq!(std::fs::read(systest::node::genesis_path(home)).unwrap(), raw, "node{i}");
    });
}

#[test]
#[serial]
fn e2e_failed_batch_leaves_genesis_untouched() {
    let mut cluster = mock_cluster("e2e_failed_batch_leaves_genesis_untouched", 2);
    let sut = &mut cluster.sut;
    sut.reset_chain().unwrap();
    let alice = sut.cli().add_key("alice").unwrap();
    let before = sut.read_genesis().unwrap();

    let err = sut
        .modify_genesis_cli(&[
            AddGenesisAccount::new(&alice, "5stake").into_args(),
            // start without end time is rejected by the node binary
            AddGenesisAccount::new(&alice, "5stake")
                .vesting_amount("5stake")
                .vesting_start_time(unix_now())
                .into_args(),
        ])
        .unwrap_err();
    assert_eq!(err.code(), "SYS201", "{err}");
    assert_eq!(sut.read_genesis().unwrap(), before);
    assert_eq!(sut.phase(), ClusterPhase::Uniform(NodeState::Reset));

    // The same account added alone succeeds afterwards.
    sut.modify_genesis_cli(&[AddGenesisAccount::new(&alice, "5stake").into_args()])
        .unwrap();
    assert_eq!(sut.genesis().unwrap().balance_of(&alice), coins("5stake"));
}

#[test]
#[serial]
fn e2e_json_edits_visible_to_running_chain() {
    let mut cluster = mock_cluster("e2e_json_edits_visible_to_running_chain", 1);
    let sut = &mut cluster.sut;
    sut.reset_chain().unwrap();
    sut.modify_genesis_json(vec![genesis::set_unbonding_time(Duration::from_secs(5))])
        .unwrap();
    sut.start_chain().unwrap();

    let params = sut.cli().custom_query(&["staking", "params"]).unwrap();
    assert_eq!(params["params"]["unbonding_time"], "5s");
}

#[test]
#[serial]
fn e2e_reset_restores_pristine_genesis() {
    let mut cluster = mock_cluster("e2e_reset_restores_pristine_genesis", 1);
    let sut = &mut cluster.sut;
    sut.reset_chain().unwrap();
    let pristine = sut.read_genesis().unwrap();
    let bob = sut.cli().add_key("bob").unwrap();
    sut.modify_genesis_cli(&[AddGenesisAccount::new(&bob, "7stake").into_args()])
        .unwrap();
    assert_ne!(sut.read_genesis().unwrap(), pristine);

    sut.reset_chain().unwrap();
    assert_eq!(sut.read_genesis().unwrap(), pristine);
    assert!(sut.genesis().unwrap().account(&bob).is_none());
}
