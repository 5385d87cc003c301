// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration of a standalone SCSI target controller, as read from TOML.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{kind} id {id} used by both {first:?} and {second:?}")]
    DuplicateId { kind: &'static str, id: u32, first: String, second: String },

    #[error("lun {name:?}: {msg}")]
    InvalidLun { name: String, msg: String },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub main: Main,

    pub ha: Option<Ha>,

    #[serde(default, rename = "lun")]
    pub luns: BTreeMap<String, Lun>,

    #[serde(default, rename = "port")]
    pub ports: BTreeMap<String, Port>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Main {
    pub name: String,
    pub workers: Option<NonZeroUsize>,
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    pub emergency_pool: Option<usize>,
    #[serde(default)]
    pub heap_fallback: usize,
}

fn default_pool_capacity() -> usize {
    1024
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaMode {
    #[default]
    SerializeOnly,
    FullTransfer,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Ha {
    #[serde(default)]
    pub mode: HaMode,
    pub id: u32,
    /// Size of data segments crossing the link, in bytes
    pub segment_size: Option<usize>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LunType {
    Mem,
    Noop,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncCache {
    #[default]
    Always,
    Never,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Lun {
    pub id: u32,
    #[serde(rename = "type")]
    pub lun_type: LunType,
    pub size: u64,
    pub block_size: Option<u32>,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub sync_cache: SyncCache,
    /// Whether this controller prefers to own the LUN when paired
    #[serde(default = "default_true")]
    pub primary: bool,
    pub workers: Option<NonZeroUsize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Port {
    pub id: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Check constraints which the TOML schema alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn unique<'a>(
            kind: &'static str,
            items: impl Iterator<Item = (&'a String, u32)>,
        ) -> Result<(), ConfigError> {
            let mut seen: BTreeMap<u32, &String> = BTreeMap::new();
            for (name, id) in items {
                if let Some(first) = seen.insert(id, name) {
                    return Err(ConfigError::DuplicateId {
                        kind,
                        id,
                        first: first.clone(),
                        second: name.clone(),
                    });
                }
            }
            Ok(())
        }
        unique("lun", self.luns.iter().map(|(n, l)| (n, l.id)))?;
        unique("port", self.ports.iter().map(|(n, p)| (n, u32::from(p.id))))?;

        for (name, lun) in self.luns.iter() {
            let bs = u64::from(lun.block_size.unwrap_or(512));
            let invalid = |msg: String| ConfigError::InvalidLun {
                name: name.clone(),
                msg,
            };
            if bs == 0 || !bs.is_power_of_two() {
                return Err(invalid(format!("bad block size {bs}")));
            }
            if lun.size == 0 || lun.size % bs != 0 {
                return Err(invalid(format!(
                    "size {} is not a non-zero multiple of {bs}",
                    lun.size
                )));
            }
        }
        Ok(())
    }
}

/// Read and validate a config file.
pub fn parse(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let data = std::fs::read_to_string(path)?;
    parse_str(&data)
}

pub fn parse_str(data: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(data)?;
    config.validate()?;
    Ok(config)
}
