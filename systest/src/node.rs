//! One member of the cluster and its lifecycle state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::Instant;

use serde::Serialize;

/// Lifecycle of a node.
///
/// `Uninitialized -> Reset -> (Configured) -> Running -> Stopped -> Reset ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Home directory not generated yet.
    Uninitialized,
    /// Fresh state with the pristine genesis.
    Reset,
    /// Genesis edited since the last reset.
    Configured,
    /// Process spawned and RPC reachable.
    Running,
    /// Process killed; state on disk is stale until the next reset.
    Stopped,
}

impl NodeState {
    /// Whether the genesis document may still be edited.
    pub fn accepts_genesis_edits(self) -> bool {
        matches!(self, Self::Reset | Self::Configured)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Reset => "reset",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A running node process.
#[derive(Debug)]
pub struct NodeProcess {
    pub child: Child,
    pub started_at: Instant,
}

impl NodeProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// True while the process has not exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for NodeProcess {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[derive(Debug)]
pub struct Node {
    pub index: usize,
    pub home: PathBuf,
    /// `tcp://host:port`, as passed to `--rpc.laddr`.
    pub rpc_addr: String,
    /// `http://host:port`, for status queries.
    pub rpc_url: String,
    pub log_file: PathBuf,
    pub state: NodeState,
    pub process: Option<NodeProcess>,
}

impl Node {
    pub fn new(
        index: usize,
        home: PathBuf,
        rpc_addr: String,
        rpc_url: String,
        log_file: PathBuf,
    ) -> Self {
        Self {
            index,
            home,
            rpc_addr,
            rpc_url,
            log_file,
            state: NodeState::Uninitialized,
            process: None,
        }
    }

    pub fn genesis_path(&self) -> PathBuf {
        genesis_path(&self.home)
    }
}

/// `<home>/config/genesis.json`
pub fn genesis_path(home: &Path) -> PathBuf {
    home.join("config").join("genesis.json")
}
