//! Block-height observation and bounded waits on chain progress.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use systest_common::{
    HarnessError, HarnessResult, HeightSource, LogLevel, LogSource, PollPolicy, SystemConfig,
    TestLogger, await_until,
};

use crate::binary::{NodeBinary, parse_json_output};
use crate::json::{as_u64_lenient, lookup};

const HEIGHT_PATHS: [&str; 3] = [
    "result.sync_info.latest_block_height",
    "sync_info.latest_block_height",
    "SyncInfo.latest_block_height",
];

/// Reads a node's latest block height.
pub trait HeightQuery: Send + Sync {
    /// Short description for log lines and timeout messages.
    fn describe(&self) -> String;

    fn latest_height(&self) -> HarnessResult<u64>;
}

/// Pull the latest block height out of a status document.
pub fn extract_height(status: &Value) -> HarnessResult<u64> {
    HEIGHT_PATHS
        .iter()
        .find_map(|path| lookup(status, path).and_then(as_u64_lenient))
        .ok_or_else(|| {
            HarnessError::state(format!(
                "status has no latest_block_height (tried {})",
                HEIGHT_PATHS.join(", ")
            ))
        })
}

/// `GET <rpc>/status`.
pub struct RpcStatusQuery {
    url: String,
    agent: ureq::Agent,
}

impl RpcStatusQuery {
    pub fn new(rpc_url: &str, request_timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(request_timeout))
            .build()
            .into();
        Self {
            url: format!("{}/status", rpc_url.trim_end_matches('/')),
            agent,
        }
    }
}

impl HeightQuery for RpcStatusQuery {
    fn describe(&self) -> String {
        self.url.clone()
    }

    fn latest_height(&self) -> HarnessResult<u64> {
        let body = self
            .agent
            .get(&self.url)
            .call()
            .and_then(|mut response| response.body_mut().read_to_string())
            .map_err(|e| HarnessError::CommandFailed {
                command: format!("GET {}", self.url),
                exit_code: -1,
                stdout: String::new(),
                stderr: e.to_string(),
            })?;
        let status = parse_json_output(&body).map_err(|reason| HarnessError::OutputParse {
            command: format!("GET {}", self.url),
            reason,
        })?;
        extract_height(&status)
    }
}

/// `<binary> status --node <rpc>`.
pub struct CliStatusQuery {
    binary: Arc<dyn NodeBinary>,
    node: String,
    timeout: Duration,
}

impl CliStatusQuery {
    pub fn new(binary: Arc<dyn NodeBinary>, node_addr: &str, timeout: Duration) -> Self {
        Self {
            binary,
            node: node_addr.to_string(),
            timeout,
        }
    }
}

impl HeightQuery for CliStatusQuery {
    fn describe(&self) -> String {
        format!("{} status --node {}", self.binary.name(), self.node)
    }

    fn latest_height(&self) -> HarnessResult<u64> {
        let args = vec!["status".to_string(), "--node".to_string(), self.node.clone()];
        let result = self.binary.exec(&args, self.timeout)?.ensure_success()?;
        // Older node versions print status on stderr.
        let status = match result.json() {
            Ok(value) => value,
            Err(stdout_err) => {
                parse_json_output(&result.stderr).map_err(|_| stdout_err)?
            }
        };
        extract_height(&status)
    }
}

/// Height query for node `index` using the configured source.
pub fn query_for(
    config: &SystemConfig,
    binary: Arc<dyn NodeBinary>,
    index: usize,
) -> Box<dyn HeightQuery> {
    let request_timeout = config.block_time.max(Duration::from_secs(1));
    match config.height_source {
        HeightSource::Rpc => Box::new(RpcStatusQuery::new(
            &config.node_rpc_url(index),
            request_timeout,
        )),
        HeightSource::Cli => Box::new(CliStatusQuery::new(
            binary,
            &config.node_rpc_addr(index),
            config.command_timeout,
        )),
    }
}

/// Waits on block production, polling once per block time.
pub struct ChainMonitor {
    query: Box<dyn HeightQuery>,
    block_time: Duration,
    block_timeout: Duration,
    logger: TestLogger,
}

impl fmt::Debug for ChainMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainMonitor")
            .field("query", &self.query.describe())
            .field("block_time", &self.block_time)
            .field("block_timeout", &self.block_timeout)
            .finish()
    }
}

impl ChainMonitor {
    pub fn new(
        query: Box<dyn HeightQuery>,
        block_time: Duration,
        block_timeout: Duration,
        logger: TestLogger,
    ) -> Self {
        Self {
            query,
            block_time,
            block_timeout,
            logger,
        }
    }

    /// Monitor for node `index` as configured.
    pub fn for_node(
        config: &SystemConfig,
        binary: Arc<dyn NodeBinary>,
        index: usize,
        logger: TestLogger,
    ) -> Self {
        Self::new(
            query_for(config, binary, index),
            config.block_time,
            config.block_timeout(),
            logger,
        )
    }

    fn policy(&self, timeout: Duration) -> PollPolicy {
        PollPolicy::fixed(timeout, self.block_time)
    }

    /// One query, no retries.
    pub fn current_height(&self) -> HarnessResult<u64> {
        self.query.latest_height()
    }

    fn observe(&self, timeout: Duration) -> HarnessResult<u64> {
        await_until(
            &format!("height from {}", self.query.describe()),
            &self.policy(timeout),
            || self.query.latest_height().map(Some),
        )
    }

    /// Block until the height is strictly above the height at call time.
    pub fn await_next_block(&self) -> HarnessResult<u64> {
        let started = Instant::now();
        let from = self.observe(self.block_timeout)?;
        let remaining = self.block_timeout.saturating_sub(started.elapsed());
        let height = await_until(
            &format!("block after {from} on {}", self.query.describe()),
            &self.policy(remaining),
            || {
                self.query
                    .latest_height()
                    .map(|current| (current > from).then_some(current))
            },
        )?;
        self.log_progress(from, height, started);
        Ok(height)
    }

    /// Block until the height is at least `target`.
    ///
    /// The bound scales with the number of blocks still to go.
    pub fn await_block_height(&self, target: u64) -> HarnessResult<u64> {
        let started = Instant::now();
        let from = self.observe(self.block_timeout)?;
        if from >= target {
            return Ok(from);
        }
        let blocks = u32::try_from(target - from).unwrap_or(u32::MAX);
        let timeout = self.block_timeout.saturating_mul(blocks);
        let height = await_until(
            &format!("block height {target} on {}", self.query.describe()),
            &self.policy(timeout),
            || {
                self.query
                    .latest_height()
                    .map(|current| (current >= target).then_some(current))
            },
        )?;
        self.log_progress(from, height, started);
        Ok(height)
    }

    /// Block until the query answers at all.
    ///
    /// `exited` is checked before every query; once it reports an exit
    /// status the wait stops with [`HarnessError::ProcessStartFailed`]
    /// instead of running into the timeout.
    pub fn await_node_up<F>(&self, timeout: Duration, mut exited: F) -> HarnessResult<u64>
    where
        F: FnMut() -> Option<String>,
    {
        let outcome = await_until(
            &format!("{} to respond", self.query.describe()),
            &PollPolicy::with_backoff(timeout),
            || -> HarnessResult<Option<Result<u64, String>>> {
                if let Some(status) = exited() {
                    return Ok(Some(Err(status)));
                }
                self.query.latest_height().map(|height| Some(Ok(height)))
            },
        )?;
        outcome.map_err(|status| {
            HarnessError::ProcessStartFailed(format!(
                "exited with {status} before {} answered",
                self.query.describe()
            ))
        })
    }

    fn log_progress(&self, from: u64, to: u64, started: Instant) {
        self.logger.log_with_context(
            LogLevel::Debug,
            LogSource::Monitor,
            format!("height {from} -> {to}"),
            vec![(
                "waited_ms".to_string(),
                started.elapsed().as_millis().to_string(),
            )],
        );
    }
}
