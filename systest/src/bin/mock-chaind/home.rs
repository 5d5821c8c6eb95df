//! Node home layout and on-disk state.
//!
//! ```text
//! <home>/config/genesis.json
//! <home>/config/mock.toml
//! <home>/data/mock_state.json
//! <home>/keyring-test/<name>.json
//! <home>/wasm/
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

pub const DENOM: &str = "stake";

pub fn config_dir(home: &Path) -> PathBuf {
    home.join("config")
}

pub fn genesis_path(home: &Path) -> PathBuf {
    config_dir(home).join("genesis.json")
}

pub fn data_dir(home: &Path) -> PathBuf {
    home.join("data")
}

pub fn wasm_dir(home: &Path) -> PathBuf {
    home.join("wasm")
}

/// Per-node settings written by `testnet init-files`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub moniker: String,
    pub chain_id: String,
    /// humantime syntax, e.g. `1000ms`.
    pub commit_timeout: String,
    pub minimum_gas_prices: String,
}

impl NodeSettings {
    fn path(home: &Path) -> PathBuf {
        config_dir(home).join("mock.toml")
    }

    pub fn load(home: &Path) -> Result<Self> {
        let path = Self::path(home);
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        fs::write(Self::path(home), toml::to_string(self)?)?;
        Ok(())
    }

    pub fn commit_timeout(&self) -> Result<Duration> {
        humantime::parse_duration(&self.commit_timeout)
            .with_context(|| format!("invalid commit_timeout `{}`", self.commit_timeout))
    }
}

/// Chain progress persisted across restarts until the next reset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChainState {
    pub height: u64,
}

impl ChainState {
    fn path(home: &Path) -> PathBuf {
        data_dir(home).join("mock_state.json")
    }

    pub fn load(home: &Path) -> Result<Self> {
        match fs::read(Self::path(home)) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        fs::create_dir_all(data_dir(home))?;
        write_atomic(&Self::path(home), &serde_json::to_vec(self)?)
    }
}

/// Write through a sibling temp file so readers in other processes never
/// see a partial document.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

pub fn read_genesis(home: &Path) -> Result<Value> {
    let path = genesis_path(home);
    let raw = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let value: Value =
        serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))?;
    anyhow::ensure!(value.is_object(), "{} is not a JSON object", path.display());
    Ok(value)
}

pub fn write_genesis(home: &Path, genesis: &Value) -> Result<()> {
    let mut pretty = serde_json::to_vec_pretty(genesis)?;
    pretty.push(b'\n');
    fs::write(genesis_path(home), pretty)?;
    Ok(())
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// Drop all chain data and module caches, keeping config and keys.
pub fn unsafe_reset_all(home: &Path) -> Result<()> {
    anyhow::ensure!(
        config_dir(home).is_dir(),
        "{} is not a node home",
        home.display()
    );
    remove_dir_if_present(&data_dir(home))?;
    remove_dir_if_present(&wasm_dir(home))?;
    fs::create_dir_all(data_dir(home))?;
    fs::write(
        data_dir(home).join("priv_validator_state.json"),
        b"{\"height\":\"0\",\"round\":0,\"step\":0}\n",
    )?;
    info!("reset node state in {}", home.display());
    Ok(())
}
