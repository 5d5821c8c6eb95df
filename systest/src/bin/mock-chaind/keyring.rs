//! File keyring: one JSON file per key under `keyring-test/`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ADDRESS_PREFIX: &str = "mock";
pub const VALOPER_PREFIX: &str = "mockvaloper";

#[derive(Debug, Error)]
pub enum KeyringError {
    #[error("key with name {0} already exists")]
    AlreadyExists(String),

    #[error("{0}.info: key not found")]
    NotFound(String),

    #[error("invalid key name `{0}`")]
    InvalidName(String),

    #[error("keyring I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt key file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: String,
    pub pubkey: String,
}

/// Deterministic bech32-looking address for a key name.
pub fn derive_address(prefix: &str, name: &str) -> String {
    let hash = blake3::hash(name.as_bytes());
    format!("{prefix}1{}", &hash.to_hex()[..38])
}

/// Address of a key in `home`'s keyring, or `name_or_address` itself when
/// it already looks like an address.
pub fn resolve_address(home: &Path, name_or_address: &str) -> anyhow::Result<String> {
    if let Ok(key) = Keyring::open(home).get(name_or_address) {
        return Ok(key.address);
    }
    let valid = name_or_address
        .split_once('1')
        .is_some_and(|(hrp, data)| {
            !hrp.is_empty()
                && hrp.chars().all(|c| c.is_ascii_lowercase())
                && data.len() >= 6
                && data
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        });
    anyhow::ensure!(
        valid,
        "failed to parse address `{name_or_address}`: expected {ADDRESS_PREFIX}1... or a key name"
    );
    Ok(name_or_address.to_string())
}

pub struct Keyring {
    dir: PathBuf,
}

impl Keyring {
    pub fn open(home: &Path) -> Self {
        Self {
            dir: home.join("keyring-test"),
        }
    }

    fn path(&self, name: &str) -> Result<PathBuf, KeyringError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(self.dir.join(format!("{name}.json")))
        } else {
            Err(KeyringError::InvalidName(name.to_string()))
        }
    }

    pub fn add(&self, name: &str) -> Result<KeyRecord, KeyringError> {
        let path = self.path(name)?;
        if path.exists() {
            return Err(KeyringError::AlreadyExists(name.to_string()));
        }
        let record = KeyRecord {
            name: name.to_string(),
            kind: "local".to_string(),
            address: derive_address(ADDRESS_PREFIX, name),
            pubkey: blake3::hash(format!("pub:{name}").as_bytes()).to_hex().to_string(),
        };
        fs::create_dir_all(&self.dir)?;
        fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Result<KeyRecord, KeyringError> {
        match fs::read(self.path(name)?) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(KeyringError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self) -> Result<Vec<KeyRecord>, KeyringError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                keys.push(serde_json::from_slice(&fs::read(&path)?)?);
            }
        }
        keys.sort_by(|a: &KeyRecord, b| a.name.cmp(&b.name));
        Ok(keys)
    }
}
