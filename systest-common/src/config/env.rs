//! Environment variable parsing with type safety.
//!
//! Provides a type-safe parser for `SYSTEST_*` environment variables with
//! validation, error collection, and source tracking.

use super::source::{ConfigSource, Sourced};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Path does not exist.
    #[error("Path not found for {var}: {path}")]
    PathNotFound { var: String, path: PathBuf },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Type-safe environment variable parser.
///
/// Collects errors during parsing so all issues can be reported at once.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the SYSTEST_ prefix.
    pub fn new() -> Self {
        Self::with_prefix("SYSTEST_")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    /// Get all accumulated errors.
    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    /// Check if any errors occurred.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Get the full variable name with prefix.
    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(value, var_name),
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => Sourced::from_env(Some(value), var_name),
            Err(_) => Sourced::default_value(None),
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::from_env(parsed, var_name)
            }
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a u16 value with default and range validation.
    pub fn get_u16_range(&mut self, name: &str, default: u16, min: u16, max: u16) -> Sourced<u16> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<u16>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::from_env(default, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "unsigned 16-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a u32 value with default and range validation.
    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.parse::<u32>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::from_env(default, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: "unsigned 32-bit integer".to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a duration in humantime syntax (`500ms`, `2s`, `1m 30s`).
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match humantime::parse_duration(value.trim()) {
                Ok(duration) => Sourced::from_env(duration, var_name),
                Err(_) => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name.clone(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a path value with ~ expansion.
    ///
    /// If `must_exist` is true, records an error if the path doesn't exist.
    pub fn get_path(&mut self, name: &str, default: &str, must_exist: bool) -> Sourced<PathBuf> {
        let var_name = self.var_name(name);
        let (value, source) = match env::var(&var_name) {
            Ok(v) => (v, ConfigSource::Environment),
            Err(_) => (default.to_string(), ConfigSource::Default),
        };

        let expanded = expand_home(&value);

        if must_exist && !expanded.exists() {
            self.errors.push(EnvError::PathNotFound {
                var: var_name.clone(),
                path: expanded.clone(),
            });
        }

        if source == ConfigSource::Environment {
            Sourced::from_env(expanded, var_name)
        } else {
            Sourced::default_value(expanded)
        }
    }

    /// Get a value that must be one of `choices` (case-insensitive).
    pub fn get_choice(&mut self, name: &str, default: &str, choices: &[&str]) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.trim().to_lowercase();
                if choices.contains(&lower.as_str()) {
                    Sourced::from_env(lower, var_name)
                } else {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: format!("one of {}", choices.join("/")),
                        value,
                    });
                    Sourced::default_value(default.to_string())
                }
            }
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a comma-separated list of strings.
    pub fn get_string_list(&mut self, name: &str, default: Vec<String>) -> Sourced<Vec<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(Vec::new(), var_name),
            Ok(value) => Sourced::from_env(split_list(&value, ','), var_name),
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Get a whitespace-separated argument list (e.g. extra command flags).
    pub fn get_args(&mut self, name: &str) -> Sourced<Vec<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(
                value.split_whitespace().map(str::to_string).collect(),
                var_name,
            ),
            Err(_) => Sourced::default_value(Vec::new()),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(value)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env access is serialized by env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: env access is serialized by env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_values() {
        let _guard = env_test_lock();
        let vars = ["SYSTEST_TEST_BOOL"];
        cleanup_env(&vars);

        for val in &["1", "true", "yes", "on", "TRUE"] {
            set_env("SYSTEST_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(parser.get_bool("TEST_BOOL", false).value, "'{val}'");
            assert!(!parser.has_errors());
        }
        for val in &["0", "false", "no", "off", ""] {
            set_env("SYSTEST_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(!parser.get_bool("TEST_BOOL", true).value, "'{val}'");
        }

        set_env("SYSTEST_TEST_BOOL", "maybe");
        let mut parser = EnvParser::new();
        assert!(parser.get_bool("TEST_BOOL", true).value);
        assert_eq!(parser.errors().len(), 1);

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_u32_range() {
        let _guard = env_test_lock();
        let vars = ["SYSTEST_TEST_NODES"];
        cleanup_env(&vars);

        set_env("SYSTEST_TEST_NODES", "3");
        let mut parser = EnvParser::new();
        let nodes = parser.get_u32_range("TEST_NODES", 4, 1, 32);
        assert_eq!(nodes.value, 3);
        assert!(nodes.is_from_env());

        set_env("SYSTEST_TEST_NODES", "99");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u32_range("TEST_NODES", 4, 1, 32).value, 4);
        assert!(matches!(parser.errors()[0], EnvError::OutOfRange { .. }));

        set_env("SYSTEST_TEST_NODES", "four");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_u32_range("TEST_NODES", 4, 1, 32).value, 4);
        assert!(matches!(parser.errors()[0], EnvError::InvalidValue { .. }));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_duration() {
        let _guard = env_test_lock();
        let vars = ["SYSTEST_TEST_BLOCK_TIME"];
        cleanup_env(&vars);

        let mut parser = EnvParser::new();
        let unset = parser.get_duration("TEST_BLOCK_TIME", Duration::from_secs(1));
        assert_eq!(unset.value, Duration::from_secs(1));
        assert_eq!(unset.source, ConfigSource::Default);

        set_env("SYSTEST_TEST_BLOCK_TIME", "250ms");
        let mut parser = EnvParser::new();
        let parsed = parser.get_duration("TEST_BLOCK_TIME", Duration::from_secs(1));
        assert_eq!(parsed.value, Duration::from_millis(250));
        assert_eq!(parsed.var_name.as_deref(), Some("SYSTEST_TEST_BLOCK_TIME"));

        set_env("SYSTEST_TEST_BLOCK_TIME", "soon");
        let mut parser = EnvParser::new();
        parser.get_duration("TEST_BLOCK_TIME", Duration::from_secs(1));
        assert!(matches!(parser.errors()[0], EnvError::InvalidDuration { .. }));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_choice_and_lists() {
        let _guard = env_test_lock();
        let vars = ["SYSTEST_TEST_SOURCE", "SYSTEST_TEST_DIRS", "SYSTEST_TEST_ARGS"];
        cleanup_env(&vars);

        set_env("SYSTEST_TEST_SOURCE", "CLI");
        set_env("SYSTEST_TEST_DIRS", "wasm, ibc ,,");
        set_env("SYSTEST_TEST_ARGS", "--trace  --log_level=info");
        let mut parser = EnvParser::new();
        assert_eq!(
            parser.get_choice("TEST_SOURCE", "rpc", &["rpc", "cli"]).value,
            "cli"
        );
        assert_eq!(
            parser.get_string_list("TEST_DIRS", vec![]).value,
            vec!["wasm".to_string(), "ibc".to_string()]
        );
        assert_eq!(
            parser.get_args("TEST_ARGS").value,
            vec!["--trace".to_string(), "--log_level=info".to_string()]
        );
        assert!(!parser.has_errors());

        set_env("SYSTEST_TEST_SOURCE", "grpc");
        let mut parser = EnvParser::new();
        assert_eq!(
            parser.get_choice("TEST_SOURCE", "rpc", &["rpc", "cli"]).value,
            "rpc"
        );
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_path_must_exist() {
        let _guard = env_test_lock();
        let vars = ["SYSTEST_TEST_BINARY"];
        cleanup_env(&vars);

        set_env("SYSTEST_TEST_BINARY", "/definitely/not/here/simd");
        let mut parser = EnvParser::new();
        let path = parser.get_path("TEST_BINARY", "simd", true);
        assert_eq!(path.value, PathBuf::from("/definitely/not/here/simd"));
        assert!(matches!(parser.errors()[0], EnvError::PathNotFound { .. }));

        cleanup_env(&vars);
    }
}
