//! The seam between the harness and the node program.
//!
//! Everything the harness does to a chain goes through [`NodeBinary`]:
//! one-shot CLI invocations with captured output, and long-running node
//! processes whose output goes to a log file.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use systest_common::{HarnessError, HarnessResult, LogLevel, LogSource, TestLogger};

/// Exit code reported for a command killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long output readers may linger after a timed-out command is killed.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Result of a command execution
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Command line as it was run, for messages.
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn stdout_contains(&self, pattern: &str) -> bool {
        self.stdout.contains(pattern)
    }

    pub fn stderr_contains(&self, pattern: &str) -> bool {
        self.stderr.contains(pattern)
    }

    /// Get combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// Turn a timeout or non-zero exit into the matching error.
    pub fn ensure_success(self) -> HarnessResult<Self> {
        if self.timed_out {
            return Err(HarnessError::Timeout {
                what: format!("`{}` to exit", self.command),
                waited: self.duration,
                last_error: None,
            });
        }
        if self.exit_code != 0 {
            return Err(HarnessError::CommandFailed {
                command: self.command,
                exit_code: self.exit_code,
                stdout: self.stdout,
                stderr: self.stderr,
            });
        }
        Ok(self)
    }

    /// Parse stdout as JSON, skipping any log lines printed before it.
    pub fn json(&self) -> HarnessResult<Value> {
        parse_json_output(&self.stdout).map_err(|reason| HarnessError::OutputParse {
            command: self.command.clone(),
            reason,
        })
    }
}

/// Parse the first JSON document in `text`, starting at the first `{` or `[`.
pub fn parse_json_output(text: &str) -> Result<Value, String> {
    let Some(start) = text.find(['{', '[']) else {
        return Err(format!("no JSON in output: {:?}", truncate(text, 200)));
    };
    let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("empty output".to_string()),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The node program as seen by the harness.
pub trait NodeBinary: Send + Sync {
    /// Display name; also the node home sub-directory name.
    fn name(&self) -> &str;

    /// Run to completion, killing the process once `timeout` elapses.
    fn exec(&self, args: &[String], timeout: Duration) -> HarnessResult<CommandResult>;

    /// Start a long-running process with stdout and stderr appended to `log_file`.
    fn spawn(&self, args: &[String], log_file: &Path) -> HarnessResult<Child>;
}

/// A node program on disk (or on `PATH`).
pub struct ExternalBinary {
    program: PathBuf,
    name: String,
    env_vars: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
    logger: TestLogger,
    sequence: AtomicU64,
}

impl fmt::Debug for ExternalBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalBinary")
            .field("program", &self.program)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ExternalBinary {
    pub fn new(program: impl Into<PathBuf>, logger: TestLogger) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string_lossy().into_owned());
        Self {
            program,
            name,
            env_vars: Vec::new(),
            working_dir: None,
            logger,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env_vars {
            cmd.env(k, v);
        }
        cmd
    }

    fn command_line(&self, args: &[String]) -> String {
        let mut line = self.name.clone();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    fn read_to_string<R: Read>(reader: &mut R) -> String {
        let mut buffer = Vec::new();
        if reader.read_to_end(&mut buffer).is_ok() {
            String::from_utf8_lossy(&buffer).into_owned()
        } else {
            String::new()
        }
    }

    /// Join a reader thread. With a deadline, a reader still blocked on a
    /// pipe held open by an orphaned grandchild is abandoned.
    fn join_output(handle: Option<thread::JoinHandle<String>>, deadline: Option<Instant>) -> String {
        let Some(handle) = handle else {
            return String::new();
        };
        if let Some(deadline) = deadline {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    return String::new();
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
        handle.join().unwrap_or_default()
    }

    /// Kill the whole process group led by `child`, falling back to the
    /// child alone.
    fn kill_group(child: &mut Child) {
        let group = format!("-{}", child.id());
        let killed = Command::new("kill")
            .args(["-KILL", "--", &group])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success());
        if !killed {
            let _ = child.kill();
        }
    }

    fn capture_artifacts(&self, args: &[String], result: &CommandResult) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let prefix = format!(
            "{seq:05}_{}",
            args.first().map(String::as_str).unwrap_or("exec")
        );
        let trace = serde_json::json!({
            "command": result.command,
            "program": self.program.display().to_string(),
            "args": args,
            "exit_code": result.exit_code,
            "duration_ms": result.duration.as_millis() as u64,
            "timed_out": result.timed_out,
            "stdout_len_bytes": result.stdout.len(),
            "stderr_len_bytes": result.stderr.len(),
        });
        let scope = "commands";
        let _ = self
            .logger
            .capture_artifact_json(scope, &format!("{prefix}_trace"), &trace);
        if !result.stdout.is_empty() {
            let _ = self.logger.capture_artifact_text(
                scope,
                &format!("{prefix}_stdout"),
                &result.stdout,
            );
        }
        if !result.stderr.is_empty() {
            let _ = self.logger.capture_artifact_text(
                scope,
                &format!("{prefix}_stderr"),
                &result.stderr,
            );
        }
    }
}

impl NodeBinary for ExternalBinary {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec(&self, args: &[String], timeout: Duration) -> HarnessResult<CommandResult> {
        let command_line = self.command_line(args);
        self.logger
            .log(LogLevel::Debug, LogSource::Cli, format!("Executing: {command_line}"));

        let start = Instant::now();
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            HarnessError::ProcessStartFailed(format!("{}: {e}", self.program.display()))
        })?;
        let stdout_handle = child
            .stdout
            .take()
            .map(|mut stdout| thread::spawn(move || Self::read_to_string(&mut stdout)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|mut stderr| thread::spawn(move || Self::read_to_string(&mut stderr)));

        let mut timed_out = false;
        let exit_status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }

            if start.elapsed() >= timeout {
                timed_out = true;
                Self::kill_group(&mut child);
                break child.wait().ok();
            }

            thread::sleep(Duration::from_millis(10));
        };

        let duration = start.elapsed();
        let deadline = timed_out.then(|| Instant::now() + READER_GRACE);
        let stdout = Self::join_output(stdout_handle, deadline);
        let mut stderr = Self::join_output(stderr_handle, deadline);
        if timed_out {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!("Process timed out after {timeout:?}."));
        }

        let exit_code = if timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            exit_status.and_then(|status| status.code()).unwrap_or(-1)
        };

        let result = CommandResult {
            command: command_line,
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out,
        };

        self.capture_artifacts(args, &result);
        self.logger.log_with_context(
            if result.success() {
                LogLevel::Debug
            } else {
                LogLevel::Warn
            },
            LogSource::Cli,
            format!("Command completed: {}", result.command),
            vec![
                ("exit_code".to_string(), result.exit_code.to_string()),
                ("duration_ms".to_string(), duration.as_millis().to_string()),
                ("timed_out".to_string(), timed_out.to_string()),
            ],
        );

        for line in result.stderr.lines() {
            self.logger.log(
                LogLevel::Trace,
                LogSource::Custom(format!("{}:stderr", self.name)),
                line,
            );
        }

        Ok(result)
    }

    fn spawn(&self, args: &[String], log_file: &Path) -> HarnessResult<Child> {
        if let Some(parent) = log_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        let stderr = stdout.try_clone()?;

        let mut cmd = self.command();
        cmd.args(args.iter().map(OsString::from))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let child = cmd.spawn().map_err(|e| {
            HarnessError::ProcessStartFailed(format!("{}: {e}", self.program.display()))
        })?;

        self.logger.log_with_context(
            LogLevel::Info,
            LogSource::Harness,
            format!("Process spawned: {}", self.command_line(args)),
            vec![
                ("pid".to_string(), child.id().to_string()),
                ("log_file".to_string(), log_file.display().to_string()),
            ],
        );
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> ExternalBinary {
        ExternalBinary::new("sh", TestLogger::silent("binary_tests"))
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exec_captures_output() {
        let result = sh()
            .exec(&args(&["-c", "echo out; echo err >&2"]), Duration::from_secs(10))
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "out");
        assert!(result.stderr_contains("err"));
        assert!(result.command.starts_with("sh -c"));
    }

    #[test]
    fn test_exec_nonzero_exit_is_an_error_on_ensure() {
        let result = sh()
            .exec(&args(&["-c", "echo nope >&2; exit 3"]), Duration::from_secs(10))
            .unwrap();
        assert_eq!(result.exit_code, 3);
        match result.ensure_success().unwrap_err() {
            HarnessError::CommandFailed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("nope"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_exec_timeout_kills_process() {
        let result = sh()
            .exec(&args(&["-c", "sleep 5"]), Duration::from_millis(100))
            .unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr_contains("timed out"));
        assert!(result.duration < Duration::from_secs(5));
        assert!(result.ensure_success().unwrap_err().is_timeout());
    }

    #[test]
    fn test_exec_timeout_does_not_wait_for_grandchildren() {
        let started = Instant::now();
        let result = sh()
            .exec(&args(&["-c", "sleep 4; echo done"]), Duration::from_millis(200))
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.stdout_contains("done"));
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[test]
    fn test_exec_missing_program() {
        let binary = ExternalBinary::new(
            "/nonexistent/chaind-for-tests",
            TestLogger::silent("missing"),
        );
        let err = binary.exec(&args(&["version"]), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code(), "SYS101");
    }

    #[test]
    fn test_spawn_appends_to_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("node0.log");
        fs::create_dir_all(log.parent().unwrap()).unwrap();
        fs::write(&log, "previous run\n").unwrap();

        let mut child = sh()
            .spawn(&args(&["-c", "echo started; echo warn >&2"]), &log)
            .unwrap();
        child.wait().unwrap();
        let content = fs::read_to_string(&log).unwrap();
        assert!(content.starts_with("previous run\n"));
        assert!(content.contains("started"));
        assert!(content.contains("warn"));
    }

    #[test]
    fn test_json_skips_leading_log_lines() {
        let value = parse_json_output("gas estimate: 1234\n{\"code\":0,\"txhash\":\"AB\"}\n").unwrap();
        assert_eq!(value["txhash"], "AB");

        let list = parse_json_output("[1,2]").unwrap();
        assert_eq!(list.as_array().map(Vec::len), Some(2));

        assert!(parse_json_output("no json here").is_err());
    }

    #[test]
    fn test_artifacts_written_when_log_dir_set() {
        let dir = tempfile::tempdir().unwrap();
        let logger = systest_common::TestLoggerBuilder::new("artifacts")
            .log_dir(dir.path())
            .build();
        let binary = ExternalBinary::new("sh", logger.clone());
        binary
            .exec(&args(&["-c", "echo hi"]), Duration::from_secs(10))
            .unwrap();
        let commands = logger.artifact_root().unwrap().join("commands");
        let names: Vec<String> = fs::read_dir(commands)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("_trace.json")));
        assert!(names.iter().any(|n| n.ends_with("_stdout.txt")));
    }
}
