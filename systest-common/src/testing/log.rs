//! Global tracing setup for test binaries.
//!
//! Call `init_global_test_logging()` once per test binary, typically from a
//! `#[ctor::ctor]` hook:
//!
//! ```ignore
//! use systest_common::testing::init_global_test_logging;
//!
//! #[ctor::ctor]
//! fn setup() {
//!     init_global_test_logging();
//! }
//! ```

use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Overrides the aggregated JSONL file path.
pub const LOG_FILE_VAR: &str = "SYSTEST_TEST_LOG_FILE";

/// Level filter for the workspace crates (default `info`).
pub const LOG_LEVEL_VAR: &str = "SYSTEST_TEST_LOG_LEVEL";

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install a tracing subscriber writing JSON events to
/// `target/test-logs/all_tests.jsonl` and compact lines to the test writer.
///
/// Safe to call multiple times; only the first call installs anything.
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let file_layer = create_global_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .with_level(true)
            .compact();

        let subscriber = tracing_subscriber::registry()
            .with(level_filter())
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn level_filter() -> tracing_subscriber::EnvFilter {
    let level = std::env::var(LOG_LEVEL_VAR).unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::EnvFilter::try_new(format!(
        "systest={level},systest_common={level},mock_chaind={level}"
    ))
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn create_global_log_file() -> Option<std::fs::File> {
    if let Ok(custom_path) = std::env::var(LOG_FILE_VAR) {
        if let Some(parent) = PathBuf::from(&custom_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(&custom_path).ok();
    }

    let log_dir = find_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::File::create(log_dir.join("all_tests.jsonl")).ok()
}

fn find_target_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir);
    }

    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}
