//! Configuration for the system-test harness.
//!
//! Values are layered, later layers winning:
//! - built-in defaults
//! - an optional TOML file (`SYSTEST_CONFIG` or `./systest.toml`)
//! - `SYSTEST_*` environment variables
//! - explicit builder overrides

pub mod env;
pub mod source;
pub mod system;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, ConfigValueSource, Sourced};
pub use system::{FileConfig, HeightSource, SystemConfig, SystemConfigBuilder};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
