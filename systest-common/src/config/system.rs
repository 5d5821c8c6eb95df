//! Harness-wide settings: node binary, cluster shape, timing and flags.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::env::{EnvParser, expand_home};
use super::source::{ConfigSource, ConfigValueSource, Sourced};
use crate::coin::Coins;
use crate::errors::{HarnessError, HarnessResult};

/// Environment variable naming an explicit config file.
pub const CONFIG_FILE_VAR: &str = "SYSTEST_CONFIG";

/// Config file picked up from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "systest.toml";

const MAX_NODES: u32 = 64;

/// How the monitor reads the current block height.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeightSource {
    /// HTTP GET on the node's `/status` endpoint.
    #[default]
    Rpc,
    /// `<binary> status --node <rpc>`.
    Cli,
}

impl fmt::Display for HeightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc => write!(f, "rpc"),
            Self::Cli => write!(f, "cli"),
        }
    }
}

impl FromStr for HeightSource {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rpc" => Ok(Self::Rpc),
            "cli" => Ok(Self::Cli),
            other => Err(HarnessError::Config(format!(
                "unknown height source '{other}' (expected rpc or cli)"
            ))),
        }
    }
}

/// Resolved harness configuration.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Node binary, either a path or a name looked up on `PATH`.
    pub binary: PathBuf,
    /// Root under which `node<i>/` homes are generated.
    pub output_dir: PathBuf,
    pub chain_id: String,
    pub node_count: usize,
    /// Target block time; also the monitor's polling interval.
    pub block_time: Duration,
    pub rpc_host: String,
    pub rpc_base_port: u16,
    pub rpc_port_stride: u16,
    pub keyring_backend: String,
    pub denom: String,
    /// Fees appended to `tx` commands that don't carry `--fees`.
    pub default_fees: String,
    pub min_gas_prices: String,
    pub verbose: bool,
    pub command_timeout: Duration,
    pub startup_timeout: Duration,
    /// Explicit bound for block waits; defaults to six block times.
    pub block_timeout_override: Option<Duration>,
    pub height_source: HeightSource,
    /// Offline state-reset subcommand, run with `--home` appended.
    pub reset_command: Vec<String>,
    /// Node-home subdirectories a reset must remove.
    pub module_cache_dirs: Vec<String>,
    pub start_args: Vec<String>,
    /// Where the test logger writes JSONL logs and artifacts.
    pub log_dir: Option<PathBuf>,
    sources: BTreeMap<&'static str, ConfigSource>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("simd"),
            output_dir: PathBuf::from("testnet"),
            chain_id: "testing".to_string(),
            node_count: 4,
            block_time: Duration::from_secs(1),
            rpc_host: "127.0.0.1".to_string(),
            rpc_base_port: 26657,
            rpc_port_stride: 10,
            keyring_backend: "test".to_string(),
            denom: "stake".to_string(),
            default_fees: "1stake".to_string(),
            min_gas_prices: "0.000006stake".to_string(),
            verbose: false,
            command_timeout: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(30),
            block_timeout_override: None,
            height_source: HeightSource::Rpc,
            reset_command: vec!["comet".to_string(), "unsafe-reset-all".to_string()],
            module_cache_dirs: vec!["wasm".to_string()],
            start_args: Vec::new(),
            log_dir: None,
            sources: BTreeMap::new(),
        }
    }
}

impl SystemConfig {
    pub fn builder() -> SystemConfigBuilder {
        SystemConfigBuilder::new()
    }

    /// Defaults, then the config file (if any), then `SYSTEST_*` variables.
    pub fn load() -> HarnessResult<Self> {
        let mut config = Self::default();
        if let Some(path) = config_file_path() {
            let file = FileConfig::read(&path)?;
            config.apply_file(file)?;
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Name used for the node home sub-directory and in log lines.
    pub fn binary_name(&self) -> String {
        self.binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.binary.to_string_lossy().into_owned())
    }

    pub fn node_dir(&self, index: usize) -> PathBuf {
        self.output_dir.join(format!("node{index}"))
    }

    pub fn node_home(&self, index: usize) -> PathBuf {
        self.node_dir(index).join(self.binary_name())
    }

    pub fn node_rpc_port(&self, index: usize) -> u16 {
        let offset = index as u32 * self.rpc_port_stride as u32;
        (self.rpc_base_port as u32 + offset).min(u16::MAX as u32) as u16
    }

    /// Address in the form the node's `--rpc.laddr` and `--node` flags take.
    pub fn node_rpc_addr(&self, index: usize) -> String {
        format!("tcp://{}:{}", self.rpc_host, self.node_rpc_port(index))
    }

    /// HTTP base URL for the node's RPC endpoint.
    pub fn node_rpc_url(&self, index: usize) -> String {
        format!("http://{}:{}", self.rpc_host, self.node_rpc_port(index))
    }

    /// Location of the pristine genesis copy taken at setup.
    pub fn pristine_genesis_path(&self) -> PathBuf {
        self.output_dir.join("genesis.orig.json")
    }

    pub fn block_timeout(&self) -> Duration {
        self.block_timeout_override
            .unwrap_or_else(|| self.block_time.saturating_mul(6))
    }

    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.sources
            .get(key)
            .copied()
            .unwrap_or(ConfigSource::Default)
    }

    /// Every setting with its resolved value and origin.
    pub fn describe(&self) -> Vec<ConfigValueSource> {
        let entry = |key: &'static str, value: String| ConfigValueSource {
            key: key.to_string(),
            value,
            source: self.source_of(key),
        };
        vec![
            entry("binary", self.binary.display().to_string()),
            entry("output_dir", self.output_dir.display().to_string()),
            entry("chain_id", self.chain_id.clone()),
            entry("nodes", self.node_count.to_string()),
            entry("block_time", humantime::format_duration(self.block_time).to_string()),
            entry("rpc_host", self.rpc_host.clone()),
            entry("rpc_base_port", self.rpc_base_port.to_string()),
            entry("rpc_port_stride", self.rpc_port_stride.to_string()),
            entry("keyring_backend", self.keyring_backend.clone()),
            entry("denom", self.denom.clone()),
            entry("default_fees", self.default_fees.clone()),
            entry("min_gas_prices", self.min_gas_prices.clone()),
            entry("verbose", self.verbose.to_string()),
            entry(
                "command_timeout",
                humantime::format_duration(self.command_timeout).to_string(),
            ),
            entry(
                "startup_timeout",
                humantime::format_duration(self.startup_timeout).to_string(),
            ),
            entry(
                "block_timeout",
                humantime::format_duration(self.block_timeout()).to_string(),
            ),
            entry("height_source", self.height_source.to_string()),
            entry("reset_command", self.reset_command.join(" ")),
            entry("module_cache_dirs", self.module_cache_dirs.join(",")),
            entry("start_args", self.start_args.join(" ")),
            entry(
                "log_dir",
                self.log_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
        ]
    }

    /// Reject settings the harness cannot run with.
    pub fn validate(&self) -> HarnessResult<()> {
        let mut problems = Vec::new();

        if self.node_count == 0 {
            problems.push("nodes must be at least 1".to_string());
        }
        if self.block_time.is_zero() {
            problems.push("block_time must be greater than zero".to_string());
        }
        if self.chain_id.trim().is_empty() {
            problems.push("chain_id must not be empty".to_string());
        }
        if self.reset_command.is_empty() {
            problems.push("reset_command must not be empty".to_string());
        }
        if let Err(e) = Coins::parse(&self.default_fees) {
            problems.push(format!("default_fees '{}': {e}", self.default_fees));
        }
        let last = self.node_count.saturating_sub(1) as u64;
        let top = self.rpc_base_port as u64 + last * self.rpc_port_stride as u64;
        if top > u16::MAX as u64 {
            problems.push(format!(
                "rpc ports overflow: node{last} would listen on {top}"
            ));
        }
        if self.node_count > 1 && self.rpc_port_stride == 0 {
            problems.push("rpc_port_stride must be non-zero for multiple nodes".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Config(problems.join("; ")))
        }
    }

    fn mark(&mut self, key: &'static str, source: ConfigSource) {
        self.sources.insert(key, source);
    }

    fn apply_file(&mut self, file: FileConfig) -> HarnessResult<()> {
        let src = ConfigSource::File;
        if let Some(v) = file.binary {
            self.binary = expand_home(&v);
            self.mark("binary", src);
        }
        if let Some(v) = file.output_dir {
            self.output_dir = expand_home(&v);
            self.mark("output_dir", src);
        }
        if let Some(v) = file.chain_id {
            self.chain_id = v;
            self.mark("chain_id", src);
        }
        if let Some(v) = file.nodes {
            self.node_count = v;
            self.mark("nodes", src);
        }
        if let Some(v) = file.block_time {
            self.block_time = parse_file_duration("block_time", &v)?;
            self.mark("block_time", src);
        }
        if let Some(v) = file.rpc_host {
            self.rpc_host = v;
            self.mark("rpc_host", src);
        }
        if let Some(v) = file.rpc_base_port {
            self.rpc_base_port = v;
            self.mark("rpc_base_port", src);
        }
        if let Some(v) = file.rpc_port_stride {
            self.rpc_port_stride = v;
            self.mark("rpc_port_stride", src);
        }
        if let Some(v) = file.keyring_backend {
            self.keyring_backend = v;
            self.mark("keyring_backend", src);
        }
        if let Some(v) = file.denom {
            self.denom = v;
            self.mark("denom", src);
        }
        if let Some(v) = file.default_fees {
            self.default_fees = v;
            self.mark("default_fees", src);
        }
        if let Some(v) = file.min_gas_prices {
            self.min_gas_prices = v;
            self.mark("min_gas_prices", src);
        }
        if let Some(v) = file.verbose {
            self.verbose = v;
            self.mark("verbose", src);
        }
        if let Some(v) = file.command_timeout {
            self.command_timeout = parse_file_duration("command_timeout", &v)?;
            self.mark("command_timeout", src);
        }
        if let Some(v) = file.startup_timeout {
            self.startup_timeout = parse_file_duration("startup_timeout", &v)?;
            self.mark("startup_timeout", src);
        }
        if let Some(v) = file.block_timeout {
            self.block_timeout_override = Some(parse_file_duration("block_timeout", &v)?);
            self.mark("block_timeout", src);
        }
        if let Some(v) = file.height_source {
            self.height_source = v;
            self.mark("height_source", src);
        }
        if let Some(v) = file.reset_command {
            self.reset_command = v;
            self.mark("reset_command", src);
        }
        if let Some(v) = file.module_cache_dirs {
            self.module_cache_dirs = v;
            self.mark("module_cache_dirs", src);
        }
        if let Some(v) = file.start_args {
            self.start_args = v;
            self.mark("start_args", src);
        }
        if let Some(v) = file.log_dir {
            self.log_dir = Some(expand_home(&v));
            self.mark("log_dir", src);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> HarnessResult<()> {
        let mut parser = EnvParser::new();

        if let Some(v) = parser
            .get_path("BINARY", &self.binary.to_string_lossy(), false)
            .into_env_value()
        {
            self.binary = v;
            self.mark("binary", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_path("OUTPUT_DIR", &self.output_dir.to_string_lossy(), false)
            .into_env_value()
        {
            self.output_dir = v;
            self.mark("output_dir", ConfigSource::Environment);
        }
        if let Some(v) = parser.get_string("CHAIN_ID", &self.chain_id).into_env_value() {
            self.chain_id = v;
            self.mark("chain_id", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_u32_range("NODES", self.node_count as u32, 1, MAX_NODES)
            .into_env_value()
        {
            self.node_count = v as usize;
            self.mark("nodes", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_duration("BLOCK_TIME", self.block_time)
            .into_env_value()
        {
            self.block_time = v;
            self.mark("block_time", ConfigSource::Environment);
        }
        if let Some(v) = parser.get_string("RPC_HOST", &self.rpc_host).into_env_value() {
            self.rpc_host = v;
            self.mark("rpc_host", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_u16_range("RPC_BASE_PORT", self.rpc_base_port, 1, u16::MAX)
            .into_env_value()
        {
            self.rpc_base_port = v;
            self.mark("rpc_base_port", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_u16_range("RPC_PORT_STRIDE", self.rpc_port_stride, 0, 1000)
            .into_env_value()
        {
            self.rpc_port_stride = v;
            self.mark("rpc_port_stride", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_string("KEYRING_BACKEND", &self.keyring_backend)
            .into_env_value()
        {
            self.keyring_backend = v;
            self.mark("keyring_backend", ConfigSource::Environment);
        }
        if let Some(v) = parser.get_string("DENOM", &self.denom).into_env_value() {
            self.denom = v;
            self.mark("denom", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_string("DEFAULT_FEES", &self.default_fees)
            .into_env_value()
        {
            self.default_fees = v;
            self.mark("default_fees", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_string("MIN_GAS_PRICES", &self.min_gas_prices)
            .into_env_value()
        {
            self.min_gas_prices = v;
            self.mark("min_gas_prices", ConfigSource::Environment);
        }
        if let Some(v) = parser.get_bool("VERBOSE", self.verbose).into_env_value() {
            self.verbose = v;
            self.mark("verbose", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_duration("COMMAND_TIMEOUT", self.command_timeout)
            .into_env_value()
        {
            self.command_timeout = v;
            self.mark("command_timeout", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_duration("STARTUP_TIMEOUT", self.startup_timeout)
            .into_env_value()
        {
            self.startup_timeout = v;
            self.mark("startup_timeout", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_duration("BLOCK_TIMEOUT", self.block_timeout())
            .into_env_value()
        {
            self.block_timeout_override = Some(v);
            self.mark("block_timeout", ConfigSource::Environment);
        }
        let height_source: Sourced<String> = parser.get_choice(
            "HEIGHT_SOURCE",
            &self.height_source.to_string(),
            &["rpc", "cli"],
        );
        if let Some(v) = height_source.into_env_value() {
            self.height_source = v.parse()?;
            self.mark("height_source", ConfigSource::Environment);
        }
        if let Some(v) = parser.get_args("RESET_COMMAND").into_env_value() {
            self.reset_command = v;
            self.mark("reset_command", ConfigSource::Environment);
        }
        if let Some(v) = parser
            .get_string_list("MODULE_CACHE_DIRS", self.module_cache_dirs.clone())
            .into_env_value()
        {
            self.module_cache_dirs = v;
            self.mark("module_cache_dirs", ConfigSource::Environment);
        }
        if let Some(v) = parser.get_args("START_ARGS").into_env_value() {
            self.start_args = v;
            self.mark("start_args", ConfigSource::Environment);
        }
        if let Some(v) = parser.get_optional_string("LOG_DIR").into_env_value() {
            self.log_dir = v.map(|p| expand_home(&p));
            self.mark("log_dir", ConfigSource::Environment);
        }

        if parser.has_errors() {
            let messages: Vec<String> = parser
                .take_errors()
                .iter()
                .map(ToString::to_string)
                .collect();
            return Err(HarnessError::Config(messages.join("; ")));
        }
        Ok(())
    }
}

fn parse_file_duration(key: &str, value: &str) -> HarnessResult<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| HarnessError::Config(format!("{key} = '{value}': {e}")))
}

fn config_file_path() -> Option<PathBuf> {
    match std::env::var(CONFIG_FILE_VAR) {
        Ok(explicit) if !explicit.is_empty() => Some(expand_home(&explicit)),
        _ => {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            local.exists().then_some(local)
        }
    }
}

/// On-disk form of [`SystemConfig`]; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub binary: Option<String>,
    pub output_dir: Option<String>,
    pub chain_id: Option<String>,
    pub nodes: Option<usize>,
    pub block_time: Option<String>,
    pub rpc_host: Option<String>,
    pub rpc_base_port: Option<u16>,
    pub rpc_port_stride: Option<u16>,
    pub keyring_backend: Option<String>,
    pub denom: Option<String>,
    pub default_fees: Option<String>,
    pub min_gas_prices: Option<String>,
    pub verbose: Option<bool>,
    pub command_timeout: Option<String>,
    pub startup_timeout: Option<String>,
    pub block_timeout: Option<String>,
    pub height_source: Option<HeightSource>,
    pub reset_command: Option<Vec<String>>,
    pub module_cache_dirs: Option<Vec<String>>,
    pub start_args: Option<Vec<String>>,
    pub log_dir: Option<String>,
}

impl FileConfig {
    pub fn parse(text: &str) -> HarnessResult<Self> {
        toml::from_str(text).map_err(|e| HarnessError::Config(format!("invalid TOML: {e}")))
    }

    pub fn read(path: &Path) -> HarnessResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
            .map_err(|e| HarnessError::Config(format!("{}: {e}", path.display())))
    }
}

/// Builder for [`SystemConfig`]; explicit settings win over every other layer.
#[derive(Debug, Clone, Default)]
pub struct SystemConfigBuilder {
    config: SystemConfig,
}

macro_rules! override_setter {
    ($(#[$doc:meta])* $name:ident, $field:ident, $key:literal, $ty:ty) => {
        $(#[$doc])*
        pub fn $name(mut self, value: impl Into<$ty>) -> Self {
            self.config.$field = value.into();
            self.config.mark($key, ConfigSource::Override);
            self
        }
    };
}

impl SystemConfigBuilder {
    /// Start from built-in defaults, ignoring files and the environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from [`SystemConfig::load`].
    pub fn from_environment() -> HarnessResult<Self> {
        Ok(Self {
            config: SystemConfig::load()?,
        })
    }

    override_setter!(binary, binary, "binary", PathBuf);
    override_setter!(output_dir, output_dir, "output_dir", PathBuf);
    override_setter!(chain_id, chain_id, "chain_id", String);
    override_setter!(node_count, node_count, "nodes", usize);
    override_setter!(
        /// Block time; also the default polling interval for block waits.
        block_time,
        block_time,
        "block_time",
        Duration
    );
    override_setter!(rpc_host, rpc_host, "rpc_host", String);
    override_setter!(rpc_base_port, rpc_base_port, "rpc_base_port", u16);
    override_setter!(rpc_port_stride, rpc_port_stride, "rpc_port_stride", u16);
    override_setter!(keyring_backend, keyring_backend, "keyring_backend", String);
    override_setter!(denom, denom, "denom", String);
    override_setter!(default_fees, default_fees, "default_fees", String);
    override_setter!(min_gas_prices, min_gas_prices, "min_gas_prices", String);
    override_setter!(verbose, verbose, "verbose", bool);
    override_setter!(command_timeout, command_timeout, "command_timeout", Duration);
    override_setter!(startup_timeout, startup_timeout, "startup_timeout", Duration);
    override_setter!(height_source, height_source, "height_source", HeightSource);
    override_setter!(start_args, start_args, "start_args", Vec<String>);

    pub fn block_timeout(mut self, value: Duration) -> Self {
        self.config.block_timeout_override = Some(value);
        self.config.mark("block_timeout", ConfigSource::Override);
        self
    }

    pub fn reset_command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.reset_command = args.into_iter().map(Into::into).collect();
        self.config.mark("reset_command", ConfigSource::Override);
        self
    }

    pub fn module_cache_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.module_cache_dirs = dirs.into_iter().map(Into::into).collect();
        self.config.mark("module_cache_dirs", ConfigSource::Override);
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = Some(dir.into());
        self.config.mark("log_dir", ConfigSource::Override);
        self
    }

    pub fn build(self) -> HarnessResult<SystemConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
