//! The test-facing orchestrator.
//!
//! ```text
//! setup_chain (once) -> reset_chain -> modify_genesis_* (0..n) -> start_chain
//!     -> cli()/await_* calls -> stop_chain / drop
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use systest_common::{
    HarnessError, HarnessResult, LogLevel, LogSource, SystemConfig, TestLogger, TestLoggerBuilder,
};

use crate::binary::{CommandResult, ExternalBinary, NodeBinary};
use crate::cli::ChainCli;
use crate::genesis::{GenesisDocument, GenesisMutator, JsonEdit};
use crate::monitor::ChainMonitor;
use crate::node::NodeState;
use crate::process::{ClusterPhase, NodeExec, ProcessController};

/// Log lines per node shown when a start or block wait fails.
const FAILURE_LOG_TAIL: usize = 40;

/// A cluster of nodes plus the drivers to operate it.
pub struct SystemUnderTest {
    config: Arc<SystemConfig>,
    logger: TestLogger,
    controller: ProcessController,
    cli: ChainCli,
}

impl std::fmt::Debug for SystemUnderTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemUnderTest")
            .field("binary", &self.controller.binary().name())
            .field("nodes", &self.controller.node_count())
            .field("phase", &self.controller.phase())
            .finish_non_exhaustive()
    }
}

impl SystemUnderTest {
    /// Drive `config.binary` as an external program.
    pub fn new(test_name: &str, config: SystemConfig) -> Self {
        let mut builder = TestLoggerBuilder::new(test_name).print_realtime(config.verbose);
        if let Some(dir) = &config.log_dir {
            builder = builder.log_dir(dir);
        }
        let logger = builder.build();
        let binary = Arc::new(ExternalBinary::new(config.binary.clone(), logger.clone()));
        Self::with_binary(config, binary, logger)
    }

    /// Load [`SystemConfig`] from file and environment, then [`Self::new`].
    pub fn from_environment(test_name: &str) -> HarnessResult<Self> {
        Ok(Self::new(test_name, SystemConfig::load()?))
    }

    pub fn with_binary(
        config: SystemConfig,
        binary: Arc<dyn NodeBinary>,
        logger: TestLogger,
    ) -> Self {
        let config = Arc::new(config);
        for value in config.describe() {
            logger.log_with_context(
                LogLevel::Debug,
                LogSource::Harness,
                format!("config {}", value.key),
                vec![
                    ("value".to_string(), value.value),
                    ("source".to_string(), value.source.to_string()),
                ],
            );
        }
        let cli = ChainCli::new(
            &config,
            Arc::clone(&binary),
            config.node_home(0),
            config.node_rpc_addr(0),
            logger.clone(),
        );
        let controller = ProcessController::new(Arc::clone(&config), binary, logger.clone());
        Self {
            config,
            logger,
            controller,
            cli,
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn logger(&self) -> &TestLogger {
        &self.logger
    }

    pub fn controller(&self) -> &ProcessController {
        &self.controller
    }

    pub fn phase(&self) -> ClusterPhase {
        self.controller.phase()
    }

    pub fn node_state(&self, index: usize) -> HarnessResult<NodeState> {
        self.controller.node_state(index)
    }

    pub fn setup_chain(&mut self) -> HarnessResult<()> {
        self.controller.setup_chain()
    }

    pub fn reset_chain(&mut self) -> HarnessResult<()> {
        self.controller.reset_chain()
    }

    /// Apply CLI genesis edits as one atomic batch.
    pub fn modify_genesis_cli(&mut self, edits: &[Vec<String>]) -> HarnessResult<()> {
        GenesisMutator::new(&mut self.controller).modify_cli(edits)
    }

    pub fn modify_genesis_json(&mut self, edits: Vec<JsonEdit>) -> HarnessResult<()> {
        GenesisMutator::new(&mut self.controller).modify_json(edits)
    }

    /// Node 0's genesis document, byte for byte.
    pub fn read_genesis(&self) -> HarnessResult<Vec<u8>> {
        crate::genesis::read_genesis(&self.controller)
    }

    pub fn genesis(&self) -> HarnessResult<GenesisDocument> {
        GenesisDocument::parse(&self.read_genesis()?)
    }

    pub fn genesis_json(&self) -> HarnessResult<Value> {
        Ok(serde_json::from_slice(&self.read_genesis()?)?)
    }

    pub fn start_chain(&mut self) -> HarnessResult<()> {
        let result = self.controller.start_chain();
        if result.is_err() {
            self.controller.dump_node_logs(FAILURE_LOG_TAIL);
        }
        result
    }

    pub fn stop_chain(&mut self) {
        self.controller.stop_chain();
    }

    pub fn for_each_node_exec_and_wait(&self, exec: &NodeExec) -> HarnessResult<Vec<CommandResult>> {
        self.controller.for_each_node_exec_and_wait(exec)
    }

    pub fn with_each_node_home<F>(&self, f: F)
    where
        F: FnMut(usize, &std::path::Path),
    {
        self.controller.with_each_node_home(f)
    }

    /// Driver bound to node 0.
    pub fn cli(&self) -> &ChainCli {
        &self.cli
    }

    /// Fresh driver bound to another node.
    pub fn cli_for(&self, index: usize) -> HarnessResult<ChainCli> {
        Ok(ChainCli::new(
            &self.config,
            Arc::clone(self.controller.binary()),
            self.controller.node_home(index)?,
            self.controller.node_rpc_addr(index)?,
            self.logger.clone(),
        ))
    }

    pub fn monitor(&self) -> ChainMonitor {
        ChainMonitor::for_node(
            &self.config,
            Arc::clone(self.controller.binary()),
            0,
            self.logger.clone(),
        )
    }

    fn ensure_running(&self, operation: &str) -> HarnessResult<()> {
        match self.controller.node_state(0)? {
            NodeState::Running => Ok(()),
            other => Err(HarnessError::InvalidPhase {
                operation: operation.to_string(),
                phase: other.to_string(),
            }),
        }
    }

    pub fn current_height(&self) -> HarnessResult<u64> {
        self.ensure_running("query height")?;
        self.monitor().current_height()
    }

    pub fn await_next_block(&self) -> HarnessResult<u64> {
        self.ensure_running("await next block")?;
        let result = self.monitor().await_next_block();
        self.dump_on_timeout(&result);
        result
    }

    pub fn await_block_height(&self, target: u64) -> HarnessResult<u64> {
        self.ensure_running("await block height")?;
        let result = self.monitor().await_block_height(target);
        self.dump_on_timeout(&result);
        result
    }

    /// Await `blocks` more blocks after the current height.
    pub fn await_blocks(&self, blocks: u64) -> HarnessResult<u64> {
        let from = self.current_height()?;
        self.await_block_height(from.saturating_add(blocks))
    }

    pub fn block_time(&self) -> Duration {
        self.config.block_time
    }

    fn dump_on_timeout<T>(&self, result: &HarnessResult<T>) {
        if let Err(e) = result {
            self.logger.warn(format!("block wait failed: {e}"));
            self.controller.dump_node_logs(FAILURE_LOG_TAIL);
        }
    }
}

impl Drop for SystemUnderTest {
    fn drop(&mut self) {
        self.controller.stop_chain();
        if self.config.verbose || self.logger.has_errors() {
            self.logger.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeBinary, ok};

    fn system(nodes: usize) -> (tempfile::TempDir, SystemUnderTest) {
        let dir = tempfile::tempdir().unwrap();
        let config = SystemConfig::builder()
            .output_dir(dir.path().join("net"))
            .node_count(nodes)
            .build()
            .unwrap();
        let binary = Arc::new(FakeBinary::new(|_: &[String]| ok("")));
        let sut = SystemUnderTest::with_binary(config, binary, TestLogger::silent("sut"));
        (dir, sut)
    }

    #[test]
    fn test_drop_after_errors_reports_summary() {
        let (_dir, sut) = system(1);
        let logger = sut.logger().clone();
        logger.error("node0 exited");
        drop(sut);
        assert_eq!(logger.summary().first_error.as_deref(), Some("node0 exited"));
    }

    #[test]
    fn test_cli_is_bound_to_node0() {
        let (_dir, sut) = system(2);
        assert!(sut.cli().home().ends_with("node0/simd"));
        assert_eq!(sut.cli().node_addr(), "tcp://127.0.0.1:26657");
        let other = sut.cli_for(1).unwrap();
        assert_eq!(other.node_addr(), "tcp://127.0.0.1:26667");
        assert!(sut.cli_for(2).is_err());
    }

    #[test]
    fn test_block_waits_require_running_chain() {
        let (_dir, mut sut) = system(1);
        sut.setup_chain().unwrap();
        let err = sut.await_next_block().unwrap_err();
        assert!(matches!(err, HarnessError::InvalidPhase { .. }));
    }

    #[test]
    fn test_genesis_round_trip_through_orchestrator() {
        let (_dir, mut sut) = system(2);
        sut.setup_chain().unwrap();
        sut.reset_chain().unwrap();
        sut.modify_genesis_json(vec![crate::genesis::set_path(
            "app_state.bank.denom_metadata",
            serde_json::json!([]),
        )])
        .unwrap();
        assert_eq!(sut.phase(), ClusterPhase::Uniform(NodeState::Configured));
        let json = sut.genesis_json().unwrap();
        assert!(json["app_state"]["bank"]["denom_metadata"].is_array());
        assert_eq!(sut.genesis().unwrap().chain_id(), Some("testing"));
    }
}
