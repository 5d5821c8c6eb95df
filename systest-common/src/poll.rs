//! Bounded polling.
//!
//! [`await_until`] is the single waiting loop of the harness. Block waits,
//! node readiness, transaction inclusion and directory removal are all
//! expressed as a check plus a [`PollPolicy`].

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::errors::{HarnessError, HarnessResult};

/// Timing for one wait: total bound, first interval, growth and cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Total time before giving up.
    pub timeout: Duration,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Interval multiplier after each unsuccessful attempt (1.0 = fixed).
    pub backoff: f64,
}

impl PollPolicy {
    /// Fixed interval polling.
    pub fn fixed(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            initial_interval: interval,
            max_interval: interval,
            backoff: 1.0,
        }
    }

    /// Starts at 10ms and doubles up to 500ms per attempt.
    pub fn with_backoff(timeout: Duration) -> Self {
        Self {
            timeout,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(500),
            backoff: 2.0,
        }
    }

    /// Delay to sleep after the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let factor = self.backoff.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_interval.as_secs_f64();
        let max = self.max_interval.max(self.initial_interval).as_secs_f64();
        Duration::from_secs_f64((base * factor).min(max))
    }
}

/// Run `check` until it yields a value or the policy's timeout elapses.
///
/// The check returns `Ok(Some(value))` when done, `Ok(None)` to keep waiting
/// and `Err(e)` for a transient failure; failures are retried and the last
/// one is carried in the resulting [`HarnessError::Timeout`]. The check runs
/// at least once, and once more at the deadline.
pub fn await_until<T, E, F>(what: &str, policy: &PollPolicy, mut check: F) -> HarnessResult<T>
where
    F: FnMut() -> Result<Option<T>, E>,
    E: fmt::Display,
{
    let start = Instant::now();
    let deadline = start + policy.timeout;
    let mut attempt: u32 = 0;
    let mut last_error: Option<String> = None;

    loop {
        attempt += 1;
        match check() {
            Ok(Some(value)) => {
                debug!(what, attempt, elapsed_ms = start.elapsed().as_millis() as u64, "condition met");
                return Ok(value);
            }
            Ok(None) => {
                trace!(what, attempt, "condition not met yet");
            }
            Err(err) => {
                let message = err.to_string();
                debug!(what, attempt, error = %message, "check failed, retrying");
                last_error = Some(message);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(HarnessError::Timeout {
                what: what.to_string(),
                waited: start.elapsed(),
                last_error,
            });
        }
        std::thread::sleep(policy.delay_for(attempt).min(deadline - now));
    }
}

/// Wait until `path` no longer exists.
pub fn await_path_absent(path: &Path, policy: &PollPolicy) -> HarnessResult<()> {
    await_until(
        &format!("{} to be removed", path.display()),
        policy,
        || -> Result<Option<()>, std::io::Error> {
            match path.try_exists()? {
                true => Ok(None),
                false => Ok(Some(())),
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(timeout_ms: u64) -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(timeout_ms), Duration::from_millis(5))
    }

    #[test]
    fn test_delay_for_backoff_is_capped() {
        let policy = PollPolicy::with_backoff(Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for(4), Duration::from_millis(80));
        assert_eq!(policy.delay_for(20), Duration::from_millis(500));

        let fixed = PollPolicy::fixed(Duration::from_secs(1), Duration::from_millis(250));
        assert_eq!(fixed.delay_for(7), Duration::from_millis(250));
    }

    #[test]
    fn test_returns_first_value() {
        let mut calls = 0;
        let value = await_until("third call", &quick(1_000), || -> Result<_, String> {
            calls += 1;
            Ok((calls == 3).then_some(calls))
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_errors_are_retried() {
        let mut calls = 0;
        let value = await_until("flaky check", &quick(1_000), || {
            calls += 1;
            if calls < 3 {
                Err("connection refused")
            } else {
                Ok(Some("up"))
            }
        })
        .unwrap();
        assert_eq!(value, "up");
    }

    #[test]
    fn test_timeout_carries_last_error() {
        let err = await_until("never", &quick(30), || -> Result<Option<()>, &str> {
            Err("connection refused")
        })
        .unwrap_err();
        assert!(err.is_timeout());
        match err {
            HarnessError::Timeout {
                what,
                waited,
                last_error,
            } => {
                assert_eq!(what, "never");
                assert!(waited >= Duration::from_millis(30));
                assert_eq!(last_error.as_deref(), Some("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_timeout_checks_once() {
        let mut calls = 0;
        let result = await_until("once", &quick(0), || -> Result<Option<()>, String> {
            calls += 1;
            Ok(None)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_await_path_absent() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("wasm");
        await_path_absent(&gone, &quick(50)).unwrap();

        std::fs::create_dir(&gone).unwrap();
        let err = await_path_absent(&gone, &quick(30)).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("wasm"));
    }
}
