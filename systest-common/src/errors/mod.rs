//! Error taxonomy for the system-test harness.
//!
//! Every harness operation returns [`HarnessResult`]. Variants are grouped
//! into categories so callers can tell a slow chain from a broken one.
//!
//! # Error Code Ranges
//!
//! | Range      | Category | Description                                   |
//! |------------|----------|-----------------------------------------------|
//! | SYS1xx     | Process  | Spawn, stop, reset and per-node fan-out       |
//! | SYS2xx     | Cli      | Non-zero exits, unparseable output, rejected tx |
//! | SYS3xx     | State    | Missing JSON paths, phase violations, asserts |
//! | SYS4xx     | Timeout  | Node unreachable, chain height stagnation     |
//!
//! A fan-out error (`SYS102`) whose every node failure was a timeout is
//! reported as `SYS402` in the Timeout category.
//! | SYS5xx     | Config   | Invalid environment or config file values     |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Coarse classification of a [`HarnessError`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    #[default]
    Process,
    Cli,
    State,
    Timeout,
    Config,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Process => "process",
            Self::Cli => "cli",
            Self::State => "state",
            Self::Timeout => "timeout",
            Self::Config => "config",
        };
        write!(f, "{label}")
    }
}

/// One node's share of a failed multi-node operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub index: usize,
    pub reason: String,
    /// Category of the underlying error.
    #[serde(default)]
    pub category: ErrorCategory,
}

impl NodeFailure {
    pub fn new(index: usize, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
            category: ErrorCategory::Process,
        }
    }

    /// Keep the category of `err` alongside its message.
    pub fn from_error(index: usize, err: &HarnessError) -> Self {
        Self {
            index,
            reason: err.to_string(),
            category: err.category(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.category == ErrorCategory::Timeout
    }
}

impl fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}: {}", self.index, self.reason)
    }
}

fn format_failures(failures: &[NodeFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn all_timeouts(failures: &[NodeFailure]) -> bool {
    !failures.is_empty() && failures.iter().all(NodeFailure::is_timeout)
}

fn format_last_error(last_error: &Option<String>) -> String {
    match last_error {
        Some(err) => format!(" (last error: {err})"),
        None => String::new(),
    }
}

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Process failed to start: {0}")]
    ProcessStartFailed(String),

    #[error("{operation} failed on {} node(s): {}", .failures.len(), format_failures(.failures))]
    NodeFailures {
        operation: String,
        failures: Vec<NodeFailure>,
    },

    #[error("Command `{command}` exited with status {exit_code}: {}", .stderr.trim())]
    CommandFailed {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Unparseable output from `{command}`: {reason}")]
    OutputParse { command: String, reason: String },

    #[error("Transaction rejected with code {code}: {raw_log}")]
    TxRejected { code: u32, raw_log: String },

    #[error("State error: {0}")]
    State(String),

    #[error("{operation} is not allowed while the cluster is {phase}")]
    InvalidPhase { operation: String, phase: String },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Timed out after {waited:?} waiting for {what}{}", format_last_error(.last_error))]
    Timeout {
        what: String,
        waited: Duration,
        last_error: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    /// Category used to distinguish hard failures from slowness.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NodeFailures { failures, .. } if all_timeouts(failures) => ErrorCategory::Timeout,
            Self::ProcessStartFailed(_) | Self::NodeFailures { .. } | Self::Io(_) => {
                ErrorCategory::Process
            }
            Self::CommandFailed { .. } | Self::OutputParse { .. } | Self::TxRejected { .. } => {
                ErrorCategory::Cli
            }
            Self::State(_)
            | Self::InvalidPhase { .. }
            | Self::AssertionFailed(_)
            | Self::Json(_) => ErrorCategory::State,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Config(_) => ErrorCategory::Config,
        }
    }

    /// Stable identifier for log correlation.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ProcessStartFailed(_) => "SYS101",
            Self::NodeFailures { failures, .. } if all_timeouts(failures) => "SYS402",
            Self::NodeFailures { .. } => "SYS102",
            Self::Io(_) => "SYS103",
            Self::CommandFailed { .. } => "SYS201",
            Self::OutputParse { .. } => "SYS202",
            Self::TxRejected { .. } => "SYS203",
            Self::State(_) => "SYS301",
            Self::InvalidPhase { .. } => "SYS302",
            Self::AssertionFailed(_) => "SYS303",
            Self::Json(_) => "SYS304",
            Self::Timeout { .. } => "SYS401",
            Self::Config(_) => "SYS501",
        }
    }

    /// True for a plain timeout and for a fan-out where every node timed out.
    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    /// Indices of the nodes that failed, when the error came from a fan-out.
    pub fn failed_nodes(&self) -> Vec<usize> {
        match self {
            Self::NodeFailures { failures, .. } => failures.iter().map(|f| f.index).collect(),
            _ => Vec::new(),
        }
    }

    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            waited,
            last_error: None,
        }
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            HarnessError::ProcessStartFailed("x".into()).category(),
            ErrorCategory::Process
        );
        assert_eq!(
            HarnessError::TxRejected {
                code: 5,
                raw_log: "insufficient funds".into()
            }
            .category(),
            ErrorCategory::Cli
        );
        assert_eq!(
            HarnessError::timeout("next block", Duration::from_secs(3)).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            HarnessError::InvalidPhase {
                operation: "modify genesis".into(),
                phase: "running".into()
            }
            .category(),
            ErrorCategory::State
        );
    }

    #[test]
    fn test_timeout_is_distinct_from_command_failure() {
        let slow = HarnessError::timeout("node0 status", Duration::from_secs(1));
        let broken = HarnessError::CommandFailed {
            command: "simd status".into(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "connection refused".into(),
        };
        assert!(slow.is_timeout());
        assert!(!broken.is_timeout());
        assert_ne!(slow.code(), broken.code());
    }

    #[test]
    fn test_node_failures_name_every_node() {
        let err = HarnessError::NodeFailures {
            operation: "start chain".into(),
            failures: vec![
                NodeFailure::new(1, "exited early"),
                NodeFailure::new(3, "unreachable"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 node(s)"));
        assert!(msg.contains("node1: exited early"));
        assert!(msg.contains("node3: unreachable"));
        assert_eq!(err.failed_nodes(), vec![1, 3]);
    }

    #[test]
    fn test_timeout_message_includes_last_error() {
        let err = HarnessError::Timeout {
            what: "block height > 7".into(),
            waited: Duration::from_millis(1500),
            last_error: Some("connection refused".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("block height > 7"));
        assert!(msg.contains("last error: connection refused"));
    }

    #[test]
    fn test_node_failures_that_all_timed_out_are_a_timeout() {
        let slow = HarnessError::timeout("node0 RPC", Duration::from_millis(400));
        let broken = HarnessError::ProcessStartFailed("exec format error".into());

        let all_slow = HarnessError::NodeFailures {
            operation: "start chain".into(),
            failures: vec![NodeFailure::from_error(0, &slow), NodeFailure::from_error(2, &slow)],
        };
        assert!(all_slow.is_timeout());
        assert_eq!(all_slow.category(), ErrorCategory::Timeout);
        assert_eq!(all_slow.code(), "SYS402");
        assert_eq!(all_slow.failed_nodes(), vec![0, 2]);

        let mixed = HarnessError::NodeFailures {
            operation: "start chain".into(),
            failures: vec![NodeFailure::from_error(0, &slow), NodeFailure::from_error(1, &broken)],
        };
        assert!(!mixed.is_timeout());
        assert_eq!(mixed.category(), ErrorCategory::Process);
        assert_eq!(mixed.code(), "SYS102");

        let empty = HarnessError::NodeFailures {
            operation: "noop".into(),
            failures: Vec::new(),
        };
        assert!(!empty.is_timeout());
    }
}
