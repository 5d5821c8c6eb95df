//! System-test harness for multi-node chains.
//!
//! The harness never reimplements ledger logic; it drives an external node
//! binary through its CLI and reads back JSON. Typical use:
//!
//! ```ignore
//! let mut sut = SystemUnderTest::from_environment("staking")?;
//! sut.setup_chain()?;
//! sut.reset_chain()?;
//! sut.modify_genesis_cli(&[AddGenesisAccount::new(addr, "100stake").into_args()])?;
//! sut.start_chain()?;
//! sut.await_next_block()?;
//! let balance = sut.cli().query_balance(&addr, "stake")?;
//! ```
//!
//! - [`binary`]: the `NodeBinary` seam and the external-process implementation
//! - [`process`]: node lifecycle (setup, reset, start, stop, fan-out)
//! - [`genesis`]: atomic genesis edit batches and a typed document view
//! - [`cli`]: the command-line driver
//! - [`monitor`]: block-height queries and waits
//! - [`system`]: the orchestrator
//! - [`suite`]: one shared cluster per test binary

pub mod binary;
pub mod cli;
pub mod genesis;
pub mod json;
pub mod monitor;
pub mod node;
pub mod process;
pub mod suite;
pub mod system;

#[cfg(test)]
mod fake;

pub use binary::{CommandResult, ExternalBinary, NodeBinary, TIMEOUT_EXIT_CODE};
pub use cli::{ChainCli, NODE0_KEY, TxResponse};
pub use genesis::{
    Account, AccountKind, AddGenesisAccount, GenesisDocument, GenesisMutator, JsonEdit,
};
pub use monitor::{ChainMonitor, CliStatusQuery, HeightQuery, RpcStatusQuery};
pub use node::NodeState;
pub use process::{ClusterPhase, NodeExec, ProcessController};
pub use suite::SuiteFixture;
pub use system::SystemUnderTest;

pub use systest_common::testing::init_global_test_logging;
pub use systest_common::{
    Coin, Coins, HarnessError, HarnessResult, SystemConfig, TestLogger,
};
