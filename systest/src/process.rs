//! Lifecycle of the node processes: generate, reset, start, stop.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use systest_common::{
    HarnessError, HarnessResult, LogLevel, LogSource, NodeFailure, PollPolicy, SystemConfig,
    TestLogger, await_path_absent,
};

use crate::binary::{CommandResult, NodeBinary};
use crate::monitor::ChainMonitor;
use crate::node::{Node, NodeProcess, NodeState};

/// A command to run once per node, with `--home <node home>` appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeExec {
    pub args: Vec<String>,
    /// Paths, relative to the node home, that must be gone afterwards.
    pub expect_absent: Vec<PathBuf>,
}

impl NodeExec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            expect_absent: Vec::new(),
        }
    }

    pub fn expect_absent(mut self, relative: impl Into<PathBuf>) -> Self {
        self.expect_absent.push(relative.into());
        self
    }

    fn display(&self) -> String {
        self.args.join(" ")
    }
}

/// Aggregate phase of all nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterPhase {
    Uniform(NodeState),
    Mixed,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uniform(state) => write!(f, "{state}"),
            Self::Mixed => write!(f, "mixed"),
        }
    }
}

/// Owns the nodes of one cluster.
pub struct ProcessController {
    config: Arc<SystemConfig>,
    binary: Arc<dyn NodeBinary>,
    logger: TestLogger,
    nodes: Vec<Node>,
}

impl ProcessController {
    pub fn new(config: Arc<SystemConfig>, binary: Arc<dyn NodeBinary>, logger: TestLogger) -> Self {
        let nodes = (0..config.node_count)
            .map(|i| {
                Node::new(
                    i,
                    config.node_home(i),
                    config.node_rpc_addr(i),
                    config.node_rpc_url(i),
                    config.output_dir.join(format!("node{i}.out")),
                )
            })
            .collect();
        Self {
            config,
            binary,
            logger,
            nodes,
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn binary(&self) -> &Arc<dyn NodeBinary> {
        &self.binary
    }

    pub fn logger(&self) -> &TestLogger {
        &self.logger
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, index: usize) -> HarnessResult<&Node> {
        self.nodes.get(index).ok_or_else(|| {
            HarnessError::state(format!(
                "node{index} does not exist (cluster has {} nodes)",
                self.nodes.len()
            ))
        })
    }

    pub fn node_home(&self, index: usize) -> HarnessResult<&Path> {
        Ok(&self.node(index)?.home)
    }

    pub fn node_rpc_addr(&self, index: usize) -> HarnessResult<&str> {
        Ok(&self.node(index)?.rpc_addr)
    }

    pub fn node_rpc_url(&self, index: usize) -> HarnessResult<&str> {
        Ok(&self.node(index)?.rpc_url)
    }

    pub fn node_state(&self, index: usize) -> HarnessResult<NodeState> {
        Ok(self.node(index)?.state)
    }

    pub fn genesis_path(&self, index: usize) -> HarnessResult<PathBuf> {
        Ok(self.node(index)?.genesis_path())
    }

    pub fn node_log_path(&self, index: usize) -> HarnessResult<&Path> {
        Ok(&self.node(index)?.log_file)
    }

    pub fn phase(&self) -> ClusterPhase {
        let mut states = self.nodes.iter().map(|n| n.state);
        match states.next() {
            None => ClusterPhase::Uniform(NodeState::Uninitialized),
            Some(first) if states.all(|s| s == first) => ClusterPhase::Uniform(first),
            Some(_) => ClusterPhase::Mixed,
        }
    }

    /// First node state that forbids genesis edits, if any.
    pub fn genesis_edit_blocker(&self) -> Option<NodeState> {
        self.nodes
            .iter()
            .map(|n| n.state)
            .find(|s| !s.accepts_genesis_edits())
    }

    pub(crate) fn mark_configured(&mut self) {
        for node in &mut self.nodes {
            if node.state == NodeState::Reset {
                node.state = NodeState::Configured;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, index: usize, state: NodeState) {
        self.nodes[index].state = state;
    }

    fn any_running(&self) -> bool {
        self.nodes.iter().any(|n| n.state == NodeState::Running)
    }

    /// Generate node homes with the binary's testnet generator and keep a
    /// pristine copy of the genesis document.
    pub fn setup_chain(&mut self) -> HarnessResult<()> {
        if self.any_running() {
            return Err(HarnessError::InvalidPhase {
                operation: "setup chain".to_string(),
                phase: self.phase().to_string(),
            });
        }

        let out = &self.config.output_dir;
        if out.exists() {
            self.logger
                .debug(format!("Removing previous output dir {}", out.display()));
            fs::remove_dir_all(out)?;
        }
        fs::create_dir_all(out)?;

        let args: Vec<String> = [
            "testnet",
            "init-files",
            "--v",
            &self.config.node_count.to_string(),
            "--output-dir",
            &out.to_string_lossy(),
            "--chain-id",
            &self.config.chain_id,
            "--keyring-backend",
            &self.config.keyring_backend,
            "--commit-timeout",
            &format!("{}ms", self.config.block_time.as_millis()),
            "--minimum-gas-prices",
            &self.config.min_gas_prices,
            "--node-daemon-home",
            &self.config.binary_name(),
            "--single-host",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        self.logger.info(format!(
            "Setting up {} node(s) of {} in {}",
            self.config.node_count,
            self.binary.name(),
            out.display()
        ));
        self.binary
            .exec(&args, self.config.command_timeout)?
            .ensure_success()?;

        let failures: Vec<NodeFailure> = self
            .nodes
            .iter()
            .filter(|n| !n.genesis_path().is_file())
            .map(|n| {
                NodeFailure::new(
                    n.index,
                    format!("no genesis at {}", n.genesis_path().display()),
                )
            })
            .collect();
        if !failures.is_empty() {
            return Err(HarnessError::NodeFailures {
                operation: "setup chain".to_string(),
                failures,
            });
        }

        fs::copy(
            self.nodes[0].genesis_path(),
            self.config.pristine_genesis_path(),
        )?;
        for node in &mut self.nodes {
            node.state = NodeState::Reset;
        }
        self.logger.info("Chain setup complete");
        Ok(())
    }

    /// Stop everything, restore the pristine genesis, wipe node state and
    /// module caches. Idempotent.
    pub fn reset_chain(&mut self) -> HarnessResult<()> {
        let pristine = self.config.pristine_genesis_path();
        if !pristine.is_file() {
            return Err(HarnessError::InvalidPhase {
                operation: "reset chain".to_string(),
                phase: NodeState::Uninitialized.to_string(),
            });
        }

        self.stop_chain();
        self.logger.info("Resetting chain");

        for node in &self.nodes {
            fs::copy(&pristine, node.genesis_path())?;
        }

        self.for_each_node_exec_and_wait(&NodeExec::new(self.config.reset_command.clone()))?;

        let policy = PollPolicy::with_backoff(self.config.command_timeout);
        let mut failures = Vec::new();
        for node in &self.nodes {
            for dir in &self.config.module_cache_dirs {
                let path = node.home.join(dir);
                let removed = match fs::remove_dir_all(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(HarnessError::from(e)),
                }
                .and_then(|()| await_path_absent(&path, &policy));
                if let Err(e) = removed {
                    failures.push(NodeFailure {
                        category: e.category(),
                        ..NodeFailure::new(node.index, format!("{}: {e}", path.display()))
                    });
                }
            }
        }
        if !failures.is_empty() {
            return Err(HarnessError::NodeFailures {
                operation: "remove module caches".to_string(),
                failures,
            });
        }

        for node in &mut self.nodes {
            node.state = NodeState::Reset;
        }
        Ok(())
    }

    /// Run `exec` against every node concurrently and wait for all of them.
    ///
    /// Results come back in node order. Every failing node is reported.
    pub fn for_each_node_exec_and_wait(&self, exec: &NodeExec) -> HarnessResult<Vec<CommandResult>> {
        self.logger.debug(format!(
            "Running `{}` on {} node(s)",
            exec.display(),
            self.nodes.len()
        ));
        let timeout = self.config.command_timeout;
        let binary = self.binary.as_ref();

        let outcomes: Vec<Result<CommandResult, NodeFailure>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .nodes
                .iter()
                .map(|node| {
                    scope.spawn(move || -> HarnessResult<CommandResult> {
                        let mut args = exec.args.clone();
                        args.push("--home".to_string());
                        args.push(node.home.to_string_lossy().into_owned());
                        let result = binary.exec(&args, timeout)?.ensure_success()?;
                        for relative in &exec.expect_absent {
                            let path = node.home.join(relative);
                            if path.exists() {
                                return Err(HarnessError::state(format!(
                                    "{} still exists",
                                    path.display()
                                )));
                            }
                        }
                        Ok(result)
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(index, h)| match h.join() {
                    Ok(outcome) => outcome.map_err(|e| NodeFailure::from_error(index, &e)),
                    Err(_) => Err(NodeFailure::new(index, "worker thread panicked")),
                })
                .collect()
        });

        let mut results = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(result) => results.push(result),
                Err(failure) => {
                    self.logger
                        .log_node(failure.index, LogLevel::Error, failure.reason.clone());
                    failures.push(failure);
                }
            }
        }
        if failures.is_empty() {
            Ok(results)
        } else {
            Err(HarnessError::NodeFailures {
                operation: format!("`{}`", exec.display()),
                failures,
            })
        }
    }

    /// Spawn every node and wait until each answers on its RPC address.
    ///
    /// On any failure all launched nodes are stopped again.
    pub fn start_chain(&mut self) -> HarnessResult<()> {
        match self.phase() {
            ClusterPhase::Uniform(NodeState::Running) => {
                return Err(HarnessError::InvalidPhase {
                    operation: "start chain".to_string(),
                    phase: NodeState::Running.to_string(),
                });
            }
            _ if self.nodes.iter().any(|n| n.state == NodeState::Uninitialized) => {
                return Err(HarnessError::InvalidPhase {
                    operation: "start chain".to_string(),
                    phase: NodeState::Uninitialized.to_string(),
                });
            }
            _ => {}
        }

        self.logger
            .info(format!("Starting {} node(s)", self.nodes.len()));
        let started = Instant::now();
        let config = self.config.as_ref();
        let binary = &self.binary;
        let logger = &self.logger;

        let failures: Vec<NodeFailure> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .nodes
                .iter_mut()
                .filter(|node| node.process.is_none())
                .map(|node| {
                    let index = node.index;
                    (
                        index,
                        scope.spawn(move || launch_node(node, config, binary, logger)),
                    )
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|(index, handle)| match handle.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(NodeFailure::from_error(index, &e)),
                    Err(_) => Some(NodeFailure::new(index, "startup thread panicked")),
                })
                .collect()
        });

        if !failures.is_empty() {
            for failure in &failures {
                self.logger
                    .log_node(failure.index, LogLevel::Error, failure.reason.clone());
            }
            self.stop_chain();
            return Err(HarnessError::NodeFailures {
                operation: "start chain".to_string(),
                failures,
            });
        }

        self.logger.log_with_context(
            LogLevel::Info,
            LogSource::Harness,
            "Chain started",
            vec![(
                "startup_ms".to_string(),
                started.elapsed().as_millis().to_string(),
            )],
        );
        Ok(())
    }

    /// Kill every node process and wait for it. Idempotent.
    pub fn stop_chain(&mut self) {
        for node in &mut self.nodes {
            let Some(mut process) = node.process.take() else {
                continue;
            };
            let pid = process.pid();
            if !process.is_running() {
                self.logger.log_node(
                    node.index,
                    LogLevel::Warn,
                    format!("node{} (pid={pid}) had already exited", node.index),
                );
            }
            self.logger.log_node(
                node.index,
                LogLevel::Info,
                format!(
                    "Stopping node{} (pid={pid}, up {})",
                    node.index,
                    humantime::format_duration(process.started_at.elapsed())
                ),
            );
            if let Err(e) = process.child.kill() {
                self.logger.log_node(
                    node.index,
                    LogLevel::Debug,
                    format!("kill node{}: {e}", node.index),
                );
            }
            match process.child.wait() {
                Ok(status) => self.logger.log_node(
                    node.index,
                    LogLevel::Debug,
                    format!("node{} exited: {status}", node.index),
                ),
                Err(e) => self.logger.log_node(
                    node.index,
                    LogLevel::Warn,
                    format!("wait for node{}: {e}", node.index),
                ),
            }
            node.state = NodeState::Stopped;
        }
        for node in &mut self.nodes {
            if node.state == NodeState::Running {
                node.state = NodeState::Stopped;
            }
        }
    }

    /// Call `f(index, home)` for every node.
    pub fn with_each_node_home<F>(&self, mut f: F)
    where
        F: FnMut(usize, &Path),
    {
        for node in &self.nodes {
            f(node.index, &node.home);
        }
    }

    /// Last `lines` lines of a node's log file.
    pub fn node_log_tail(&self, index: usize, lines: usize) -> HarnessResult<Vec<String>> {
        let node = self.node(index)?;
        let file = match fs::File::open(&node.log_file) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut tail = std::collections::VecDeque::with_capacity(lines);
        for line in BufReader::new(file).lines() {
            if tail.len() == lines {
                tail.pop_front();
            }
            tail.push_back(line?);
        }
        Ok(tail.into_iter().collect())
    }

    /// Emit the tail of every node's log through the logger.
    pub fn dump_node_logs(&self, lines: usize) {
        for node in &self.nodes {
            match self.node_log_tail(node.index, lines) {
                Ok(tail) if tail.is_empty() => {}
                Ok(tail) => {
                    self.logger.log_node(
                        node.index,
                        LogLevel::Warn,
                        format!(
                            "last {} line(s) of {}:\n{}",
                            tail.len(),
                            node.log_file.display(),
                            tail.join("\n")
                        ),
                    );
                }
                Err(e) => self.logger.log_node(
                    node.index,
                    LogLevel::Warn,
                    format!("cannot read {}: {e}", node.log_file.display()),
                ),
            }
        }
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        self.stop_chain();
    }
}

fn launch_node(
    node: &mut Node,
    config: &SystemConfig,
    binary: &Arc<dyn NodeBinary>,
    logger: &TestLogger,
) -> HarnessResult<()> {
    let mut args = vec![
        "start".to_string(),
        "--home".to_string(),
        node.home.to_string_lossy().into_owned(),
        "--rpc.laddr".to_string(),
        node.rpc_addr.clone(),
    ];
    args.extend(config.start_args.iter().cloned());

    let mut process = NodeProcess {
        child: binary.spawn(&args, &node.log_file)?,
        started_at: Instant::now(),
    };
    let monitor = ChainMonitor::for_node(config, Arc::clone(binary), node.index, logger.clone());
    let ready = monitor.await_node_up(config.startup_timeout, || {
        match process.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            _ => None,
        }
    });
    node.process = Some(process);
    let height = ready?;

    node.state = NodeState::Running;
    logger.log_with_context(
        LogLevel::Info,
        LogSource::Node { index: node.index },
        format!("node{} reachable", node.index),
        vec![
            ("height".to_string(), height.to_string()),
            ("rpc".to_string(), node.rpc_addr.clone()),
        ],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::binary::TIMEOUT_EXIT_CODE;
    use crate::fake::{FakeBinary, controller_for, controller_with, fail, flag, ok};

    #[test]
    fn test_setup_keeps_pristine_genesis() {
        let (_dir, controller, binary) = controller_with(3, |_| ok(""));
        assert_eq!(controller.phase(), ClusterPhase::Uniform(NodeState::Reset));
        assert!(controller.config().pristine_genesis_path().is_file());
        for i in 0..3 {
            assert!(controller.genesis_path(i).unwrap().is_file());
        }
        let setup = &binary.calls()[0];
        assert_eq!(flag(setup, "--v"), Some("3"));
        assert_eq!(flag(setup, "--commit-timeout"), Some("1000ms"));
        assert!(setup.contains(&"--single-host".to_string()));
    }

    #[test]
    fn test_reset_requires_setup() {
        let dir = tempfile::tempdir().unwrap();
        let config = SystemConfig::builder()
            .output_dir(dir.path().join("net"))
            .node_count(2usize)
            .build()
            .unwrap();
        let mut controller = ProcessController::new(
            Arc::new(config),
            Arc::new(FakeBinary::new(|_| ok(""))),
            TestLogger::silent("reset"),
        );
        let err = controller.reset_chain().unwrap_err();
        assert!(matches!(err, HarnessError::InvalidPhase { .. }));
        assert_eq!(controller.phase(), ClusterPhase::Uniform(NodeState::Uninitialized));
    }

    #[test]
    fn test_reset_restores_genesis_and_removes_module_caches() {
        let (_dir, mut controller, binary) = controller_with(2, |_| ok(""));
        let mut wasm_dirs = Vec::new();
        controller.with_each_node_home(|_, home| {
            let wasm = home.join("wasm");
            fs::create_dir_all(wasm.join("cache")).unwrap();
            fs::write(wasm.join("cache/module.bin"), b"x").unwrap();
            wasm_dirs.push(wasm);
        });
        fs::write(controller.genesis_path(1).unwrap(), b"{\"edited\":true}").unwrap();

        controller.reset_chain().unwrap();

        for wasm in &wasm_dirs {
            assert!(!wasm.exists(), "{} survived reset", wasm.display());
        }
        let pristine = fs::read(controller.config().pristine_genesis_path()).unwrap();
        assert_eq!(fs::read(controller.genesis_path(1).unwrap()).unwrap(), pristine);
        let resets: Vec<_> = binary
            .calls()
            .into_iter()
            .filter(|c| c[0] == "comet")
            .collect();
        assert_eq!(resets.len(), 2);
        assert_eq!(controller.phase(), ClusterPhase::Uniform(NodeState::Reset));

        // A second reset is harmless.
        controller.reset_chain().unwrap();
    }

    #[test]
    fn test_fan_out_reports_every_failing_node() {
        let (_dir, controller, _) = controller_with(4, |args| {
            let home = flag(args, "--home").unwrap_or_default();
            if home.contains("node1") || home.contains("node3") {
                fail(1, "disk full")
            } else {
                ok("done")
            }
        });
        let err = controller
            .for_each_node_exec_and_wait(&NodeExec::new(["debug", "noop"]))
            .unwrap_err();
        assert_eq!(err.failed_nodes(), vec![1, 3]);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_fan_out_returns_results_in_node_order() {
        let (_dir, controller, _) = controller_with(3, |args| {
            ok(flag(args, "--home").unwrap_or_default())
        });
        let results = controller
            .for_each_node_exec_and_wait(&NodeExec::new(["debug", "noop"]))
            .unwrap();
        for (i, result) in results.iter().enumerate() {
            assert!(result.stdout.contains(&format!("node{i}")));
        }
    }

    #[test]
    fn test_fan_out_checks_expected_absent_paths() {
        let (_dir, controller, _) = controller_with(2, |_| ok(""));
        fs::create_dir_all(controller.node_home(1).unwrap().join("data")).unwrap();
        let exec = NodeExec::new(["comet", "unsafe-reset-all"]).expect_absent("data");
        let err = controller.for_each_node_exec_and_wait(&exec).unwrap_err();
        assert_eq!(err.failed_nodes(), vec![1]);
    }

    #[test]
    fn test_failed_start_leaves_nothing_running() {
        let (_dir, mut controller, _) = controller_with(2, |_| ok(""));
        let err = controller.start_chain().unwrap_err();
        assert_eq!(err.failed_nodes(), vec![0, 1]);
        assert!(controller.genesis_edit_blocker().is_none());
    }

    #[test]
    fn test_unreachable_nodes_fail_start_as_timeout() {
        let binary = FakeBinary::new(|_| ok("")).spawning(&["sleep", "30"]);
        let (_dir, mut controller, _) = controller_for(2, binary, |builder| {
            builder
                .rpc_base_port(1u16)
                .startup_timeout(Duration::from_millis(400))
        });
        let started = Instant::now();
        let err = controller.start_chain().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.is_timeout(), "{err}");
        assert_eq!(err.code(), "SYS402");
        assert_eq!(err.failed_nodes(), vec![0, 1]);
        assert_eq!(controller.phase(), ClusterPhase::Uniform(NodeState::Stopped));
    }

    #[test]
    fn test_fan_out_timeouts_keep_their_category() {
        let (_dir, controller, _) = controller_with(2, |_| CommandResult {
            exit_code: TIMEOUT_EXIT_CODE,
            timed_out: true,
            ..ok("")
        });
        let err = controller
            .for_each_node_exec_and_wait(&NodeExec::new(["debug", "noop"]))
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.failed_nodes(), vec![0, 1]);

        let (_dir, controller, _) = controller_with(2, |args| {
            if flag(args, "--home").unwrap_or_default().contains("node0") {
                CommandResult {
                    timed_out: true,
                    ..ok("")
                }
            } else {
                fail(2, "bad flag")
            }
        });
        let err = controller
            .for_each_node_exec_and_wait(&NodeExec::new(["debug", "noop"]))
            .unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(err.code(), "SYS102");
    }

    #[test]
    fn test_start_before_setup_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = SystemConfig::builder()
            .output_dir(dir.path().join("net"))
            .build()
            .unwrap();
        let mut controller = ProcessController::new(
            Arc::new(config),
            Arc::new(FakeBinary::new(|_| ok(""))),
            TestLogger::silent("start"),
        );
        assert!(matches!(
            controller.start_chain(),
            Err(HarnessError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_node_log_tail() {
        let (_dir, controller, _) = controller_with(1, |_| ok(""));
        assert!(controller.node_log_tail(0, 5).unwrap().is_empty());
        let lines: String = (0..10).map(|i| format!("line {i}\n")).collect();
        fs::write(controller.node_log_path(0).unwrap(), lines).unwrap();
        assert_eq!(
            controller.node_log_tail(0, 2).unwrap(),
            vec!["line 8".to_string(), "line 9".to_string()]
        );
        assert!(controller.node_log_tail(7, 2).is_err());
    }
}
