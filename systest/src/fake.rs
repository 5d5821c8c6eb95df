//! Scripted node binary for unit tests.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use systest_common::{HarnessError, HarnessResult, SystemConfig, SystemConfigBuilder, TestLogger};

use crate::binary::{CommandResult, NodeBinary};
use crate::process::ProcessController;

type Handler = Box<dyn Fn(&[String]) -> CommandResult + Send + Sync>;

pub(crate) struct FakeBinary {
    name: String,
    handler: Handler,
    calls: Mutex<Vec<Vec<String>>>,
    /// Program run by `spawn`; `None` makes every spawn fail.
    server: Option<Vec<String>>,
}

impl FakeBinary {
    pub(crate) fn new(handler: impl Fn(&[String]) -> CommandResult + Send + Sync + 'static) -> Self {
        Self {
            name: "fakechaind".to_string(),
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
            server: None,
        }
    }

    /// Make `spawn` start `program` (with the node args dropped).
    pub(crate) fn spawning(mut self, program: &[&str]) -> Self {
        self.server = Some(program.iter().map(|s| s.to_string()).collect());
        self
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

impl NodeBinary for FakeBinary {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec(&self, args: &[String], _timeout: Duration) -> HarnessResult<CommandResult> {
        self.calls.lock().unwrap().push(args.to_vec());
        if args.first().map(String::as_str) == Some("testnet") {
            return Ok(write_testnet(args));
        }
        Ok((self.handler)(args))
    }

    fn spawn(&self, _args: &[String], log_file: &Path) -> HarnessResult<Child> {
        let Some((program, rest)) = self.server.as_ref().and_then(|p| p.split_first()) else {
            return Err(HarnessError::ProcessStartFailed(
                "fake binary cannot spawn".to_string(),
            ));
        };
        let log = OpenOptions::new().create(true).append(true).open(log_file)?;
        Ok(Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()?)
    }
}

pub(crate) fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        command: "fake".to_string(),
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration: Duration::from_millis(1),
        timed_out: false,
    }
}

pub(crate) fn fail(exit_code: i32, stderr: &str) -> CommandResult {
    CommandResult {
        exit_code,
        stderr: stderr.to_string(),
        ..ok("")
    }
}

/// Value following `flag` in `args`.
pub(crate) fn flag<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Handles `testnet init-files` by writing a minimal genesis per node.
pub(crate) fn write_testnet(args: &[String]) -> CommandResult {
    let (Some(out), Some(count), Some(daemon)) = (
        flag(args, "--output-dir"),
        flag(args, "--v").and_then(|v| v.parse::<usize>().ok()),
        flag(args, "--node-daemon-home"),
    ) else {
        return fail(1, "missing testnet flags");
    };
    let genesis = json!({
        "chain_id": flag(args, "--chain-id").unwrap_or("testing"),
        "app_state": {"auth": {"accounts": []}, "bank": {"balances": []}}
    });
    for i in 0..count {
        let config = PathBuf::from(out)
            .join(format!("node{i}"))
            .join(daemon)
            .join("config");
        fs::create_dir_all(&config).unwrap();
        fs::write(config.join("genesis.json"), genesis.to_string()).unwrap();
    }
    ok("")
}

/// Controller over a fresh temp dir, already set up.
pub(crate) fn controller_with(
    nodes: usize,
    handler: impl Fn(&[String]) -> CommandResult + Send + Sync + 'static,
) -> (tempfile::TempDir, ProcessController, Arc<FakeBinary>) {
    controller_for(nodes, FakeBinary::new(handler), |builder| builder)
}

/// Like [`controller_with`] with a prepared binary and extra settings.
pub(crate) fn controller_for(
    nodes: usize,
    binary: FakeBinary,
    configure: impl FnOnce(SystemConfigBuilder) -> SystemConfigBuilder,
) -> (tempfile::TempDir, ProcessController, Arc<FakeBinary>) {
    let dir = tempfile::tempdir().unwrap();
    let builder = SystemConfig::builder()
        .output_dir(dir.path().join("testnet"))
        .node_count(nodes);
    let config = configure(builder).build().unwrap();
    let binary = Arc::new(binary);
    let mut controller = ProcessController::new(
        Arc::new(config),
        binary.clone(),
        TestLogger::silent("fake"),
    );
    controller.setup_chain().unwrap();
    (dir, controller, binary)
}
