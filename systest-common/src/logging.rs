//! Harness logging.
//!
//! Every cluster operation logs through a [`TestLogger`]:
//!
//! - Real-time console output (human-readable, colored when verbose)
//! - Per-test JSONL log files under `target/test-logs/` (machine-readable)
//! - Text/JSON artifacts for each command invocation under `artifacts/`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

/// Nearest ancestor whose `Cargo.toml` declares `[workspace]`, else the
/// nearest one that already has a `target/` directory.
fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let declares_workspace = |dir: &Path| {
        fs::read_to_string(dir.join("Cargo.toml"))
            .is_ok_and(|manifest| manifest.contains("[workspace]"))
    };
    start
        .ancestors()
        .find(|dir| declares_workspace(dir))
        .or_else(|| start.ancestors().find(|dir| dir.join("target").is_dir()))
        .map(Path::to_path_buf)
}

/// `target/test-logs/` under the workspace root, created on demand.
pub fn default_log_dir() -> Option<PathBuf> {
    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        let workspace_root = find_workspace_root(Path::new(&manifest_dir))?;
        let log_dir = workspace_root.join("target").join("test-logs");
        let _ = fs::create_dir_all(&log_dir);
        return Some(log_dir);
    }
    if let Ok(cwd) = std::env::current_dir() {
        let log_dir = cwd.join("target").join("test-logs");
        if log_dir.parent().map(|p| p.exists()).unwrap_or(false) {
            let _ = fs::create_dir_all(&log_dir);
            return Some(log_dir);
        }
    }
    None
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl LogLevel {
    /// Returns the ANSI color code for this log level
    pub fn color_code(&self) -> &'static str {
        match self {
            LogLevel::Trace => "\x1b[90m", // Gray
            LogLevel::Debug => "\x1b[36m", // Cyan
            LogLevel::Info => "\x1b[32m",  // Green
            LogLevel::Warn => "\x1b[33m",  // Yellow
            LogLevel::Error => "\x1b[31m", // Red
        }
    }
}

/// Component that produced a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// Orchestration and process control
    Harness,
    /// A specific node of the cluster
    Node { index: usize },
    /// The command-line driver
    Cli,
    /// Genesis edits
    Genesis,
    /// Block-height polling
    Monitor,
    Custom(String),
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Harness => write!(f, "harness"),
            LogSource::Node { index } => write!(f, "node:{index}"),
            LogSource::Cli => write!(f, "cli"),
            LogSource::Genesis => write!(f, "genesis"),
            LogSource::Monitor => write!(f, "monitor"),
            LogSource::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Elapsed time since logger creation
    pub elapsed_ms: u64,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<(String, String)>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>6}ms] [{:<5}] [{}] {}",
            self.elapsed_ms, self.level, self.source, self.message
        )?;
        if !self.context.is_empty() {
            write!(f, " {{")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}={v}")?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

impl LogEntry {
    /// Format the log entry with ANSI colors
    pub fn format_colored(&self) -> String {
        let reset = "\x1b[0m";
        let color = self.level.color_code();
        let dim = "\x1b[2m";

        let ctx = if self.context.is_empty() {
            String::new()
        } else {
            let pairs: Vec<_> = self
                .context
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            format!(" {dim}{{{}}}{reset}", pairs.join(", "))
        };

        format!(
            "{dim}[{:>6}ms]{reset} {color}[{:<5}]{reset} {dim}[{}]{reset} {}{ctx}",
            self.elapsed_ms, self.level, self.source, self.message
        )
    }
}

/// Configuration for the test logger
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Minimum log level to capture
    pub min_level: LogLevel,
    /// Whether to print logs to stdout in real-time
    pub print_realtime: bool,
    pub use_colors: bool,
    /// Maximum number of entries to keep in memory (0 = unlimited)
    pub max_entries: usize,
    /// Directory for persisting logs and artifacts
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            print_realtime: false,
            use_colors: true,
            max_entries: 10_000,
            log_dir: None,
        }
    }
}

/// Thread-safe logger shared by every component of one harness instance.
#[derive(Clone)]
pub struct TestLogger {
    config: Arc<RwLock<LoggerConfig>>,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    start_time: Instant,
    test_name: Arc<String>,
    file_writer: Arc<Mutex<Option<BufWriter<File>>>>,
    log_path: Arc<Option<PathBuf>>,
    artifact_root: Arc<Option<PathBuf>>,
}

impl fmt::Debug for TestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestLogger")
            .field("test_name", &self.test_name)
            .field("log_path", &self.log_path)
            .finish_non_exhaustive()
    }
}

impl TestLogger {
    pub fn new(test_name: &str, config: LoggerConfig) -> Self {
        let mut file_writer = None;
        let mut log_path = None;
        let mut artifact_root = None;

        if let Some(ref dir) = config.log_dir
            && fs::create_dir_all(dir).is_ok()
        {
            let sanitized = Self::sanitize_component(test_name);
            let timestamp = Utc::now().format("%Y%m%d_%H%M%S");

            let path = dir.join(format!("{sanitized}_{timestamp}.jsonl"));
            match File::create(&path) {
                Ok(file) => {
                    file_writer = Some(BufWriter::new(file));
                    log_path = Some(path);
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "failed to create log file");
                }
            }

            let artifacts_dir = dir.join("artifacts").join(format!("{sanitized}_{timestamp}"));
            if fs::create_dir_all(&artifacts_dir).is_ok() {
                artifact_root = Some(artifacts_dir);
            }
        }

        Self {
            config: Arc::new(RwLock::new(config)),
            entries: Arc::new(Mutex::new(VecDeque::new())),
            start_time: Instant::now(),
            test_name: Arc::new(test_name.to_string()),
            file_writer: Arc::new(Mutex::new(file_writer)),
            log_path: Arc::new(log_path),
            artifact_root: Arc::new(artifact_root),
        }
    }

    /// In-memory only logger, nothing printed or persisted.
    pub fn silent(test_name: &str) -> Self {
        Self::new(test_name, LoggerConfig::default())
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Path of the JSONL file, when persistence is enabled.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn artifact_root(&self) -> Option<&Path> {
        self.artifact_root.as_deref()
    }

    /// Log an entry with the given level and source
    pub fn log(&self, level: LogLevel, source: LogSource, message: impl Into<String>) {
        self.log_with_context(level, source, message, Vec::new());
    }

    /// Log an entry with context key-value pairs
    pub fn log_with_context(
        &self,
        level: LogLevel,
        source: LogSource,
        message: impl Into<String>,
        context: Vec<(String, String)>,
    ) {
        let (min_level, print_realtime, use_colors, max_entries) = match self.config.read() {
            Ok(c) => (c.min_level, c.print_realtime, c.use_colors, c.max_entries),
            Err(poisoned) => {
                let c = poisoned.into_inner();
                (c.min_level, c.print_realtime, c.use_colors, c.max_entries)
            }
        };
        if level < min_level {
            return;
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
            level,
            source,
            message: message.into(),
            context,
        };

        if print_realtime {
            if use_colors {
                println!("{}", entry.format_colored());
            } else {
                println!("{entry}");
            }
        }

        {
            let mut writer = lock(&self.file_writer);
            if let Some(ref mut w) = *writer
                && let Ok(json) = serde_json::to_string(&entry)
            {
                let _ = writeln!(w, "{json}");
                let _ = w.flush();
            }
        }

        let mut entries = lock(&self.entries);
        entries.push_back(entry);
        if max_entries > 0 && entries.len() > max_entries {
            entries.pop_front();
        }
    }

    /// Persist a text artifact for postmortem analysis.
    pub fn capture_artifact_text(
        &self,
        scope: &str,
        artifact_name: &str,
        content: &str,
    ) -> std::io::Result<PathBuf> {
        let path = self.artifact_path(scope, artifact_name, "txt")?;
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Persist a JSON artifact for postmortem analysis.
    pub fn capture_artifact_json<T: Serialize>(
        &self,
        scope: &str,
        artifact_name: &str,
        value: &T,
    ) -> std::io::Result<PathBuf> {
        let serialized = serde_json::to_string_pretty(value).map_err(|error| {
            std::io::Error::other(format!("failed to serialize artifact json: {error}"))
        })?;
        let path = self.artifact_path(scope, artifact_name, "json")?;
        fs::write(&path, serialized)?;
        Ok(path)
    }

    fn artifact_path(&self, scope: &str, name: &str, ext: &str) -> std::io::Result<PathBuf> {
        let Some(root) = self.artifact_root.as_deref() else {
            return Err(std::io::Error::other(
                "artifact capture requires logger log_dir to be configured",
            ));
        };
        let dir = root.join(Self::sanitize_component(scope));
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{}.{ext}", Self::sanitize_component(name))))
    }

    fn sanitize_component(raw: &str) -> String {
        let cleaned: String = raw
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        if cleaned.is_empty() {
            "artifact".to_string()
        } else {
            cleaned
        }
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, LogSource::Harness, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, LogSource::Harness, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, LogSource::Harness, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, LogSource::Harness, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, LogSource::Harness, message);
    }

    pub fn log_node(&self, index: usize, level: LogLevel, message: impl Into<String>) {
        self.log(level, LogSource::Node { index }, message);
    }

    pub fn log_cli(&self, level: LogLevel, message: impl Into<String>) {
        self.log(level, LogSource::Cli, message);
    }

    pub fn log_genesis(&self, level: LogLevel, message: impl Into<String>) {
        self.log(level, LogSource::Genesis, message);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).iter().cloned().collect()
    }

    /// Entries whose source display starts with `source_prefix` (`node:`, `cli`, ...).
    pub fn entries_by_source(&self, source_prefix: &str) -> Vec<LogEntry> {
        let prefix = source_prefix.to_lowercase();
        lock(&self.entries)
            .iter()
            .filter(|e| e.source.to_string().to_lowercase().starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Search entries by message content (case-insensitive)
    pub fn search(&self, pattern: &str) -> Vec<LogEntry> {
        let pattern_lower = pattern.to_lowercase();
        lock(&self.entries)
            .iter()
            .filter(|e| e.message.to_lowercase().contains(&pattern_lower))
            .cloned()
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        lock(&self.entries).iter().any(|e| e.level == LogLevel::Error)
    }

    pub fn error_count(&self) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| e.level == LogLevel::Error)
            .count()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }

    pub fn summary(&self) -> TestLogSummary {
        let entries = lock(&self.entries);
        let mut summary = TestLogSummary {
            test_name: self.test_name.to_string(),
            total_entries: entries.len(),
            duration_ms: self.elapsed().as_millis() as u64,
            counts_by_level: HashMap::new(),
            first_error: None,
            last_error: None,
        };

        for entry in entries.iter() {
            *summary.counts_by_level.entry(entry.level).or_insert(0) += 1;
            if entry.level == LogLevel::Error {
                if summary.first_error.is_none() {
                    summary.first_error = Some(entry.message.clone());
                }
                summary.last_error = Some(entry.message.clone());
            }
        }

        summary
    }

    /// Print a formatted summary to stdout
    pub fn print_summary(&self) {
        let summary = self.summary();
        println!("\n{}", "=".repeat(60));
        println!("Harness Log Summary: {}", summary.test_name);
        println!("{}", "=".repeat(60));
        println!("Duration: {}ms", summary.duration_ms);
        println!("Total entries: {}", summary.total_entries);
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            println!("  {:<6} {}", format!("{level}:"), summary.count(level));
        }
        if let Some(ref err) = summary.first_error {
            println!("First error: {err}");
        }
        if let Some(ref err) = summary.last_error
            && summary.first_error.as_ref() != Some(err)
        {
            println!("Last error: {err}");
        }
        if let Some(path) = self.log_path() {
            println!("Log file: {}", path.display());
        }
        println!("{}", "=".repeat(60));
    }
}

/// Summary of logged entries
#[derive(Debug, Clone, Serialize)]
pub struct TestLogSummary {
    pub test_name: String,
    pub total_entries: usize,
    pub duration_ms: u64,
    pub counts_by_level: HashMap<LogLevel, usize>,
    pub first_error: Option<String>,
    pub last_error: Option<String>,
}

impl TestLogSummary {
    pub fn count(&self, level: LogLevel) -> usize {
        self.counts_by_level.get(&level).copied().unwrap_or(0)
    }
}

/// Builder for creating a TestLogger with custom configuration
pub struct TestLoggerBuilder {
    test_name: String,
    config: LoggerConfig,
}

impl TestLoggerBuilder {
    /// Create a new builder for the given test name.
    ///
    /// By default, logs are written to `target/test-logs/` relative to the
    /// workspace root (auto-detected via CARGO_MANIFEST_DIR).
    pub fn new(test_name: &str) -> Self {
        let config = LoggerConfig {
            log_dir: default_log_dir(),
            ..Default::default()
        };
        Self {
            test_name: test_name.to_string(),
            config,
        }
    }

    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.config.min_level = level;
        self
    }

    pub fn print_realtime(mut self, enabled: bool) -> Self {
        self.config.print_realtime = enabled;
        self
    }

    pub fn use_colors(mut self, enabled: bool) -> Self {
        self.config.use_colors = enabled;
        self
    }

    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.max_entries = max;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = Some(dir.into());
        self
    }

    /// Keep entries in memory only.
    pub fn no_persistence(mut self) -> Self {
        self.config.log_dir = None;
        self
    }

    pub fn build(self) -> TestLogger {
        TestLogger::new(&self.test_name, self.config)
    }
}
