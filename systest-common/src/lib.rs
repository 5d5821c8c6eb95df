//! Shared building blocks for the chain system-test harness.
//!
//! - [`errors`]: the harness error taxonomy
//! - [`config`]: layered configuration (defaults, TOML file, `SYSTEST_*` env)
//! - [`logging`]: per-test structured logger with JSONL output and artifacts
//! - [`poll`]: bounded polling with backoff
//! - [`coin`]: arbitrary-precision coin amounts
//! - [`testing`]: global tracing setup for test binaries

pub mod coin;
pub mod config;
pub mod errors;
pub mod logging;
pub mod poll;
pub mod testing;

pub use coin::{Coin, CoinParseError, Coins};
pub use config::{HeightSource, SystemConfig, SystemConfigBuilder};
pub use errors::{ErrorCategory, HarnessError, HarnessResult, NodeFailure};
pub use logging::{LogLevel, LogSource, TestLogger, TestLoggerBuilder};
pub use poll::{PollPolicy, await_path_absent, await_until};
