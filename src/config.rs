//! Instance configuration.
//!
//! A raw table (from a TOML file or any other serde source) is validated into
//! an [`InstanceConfig`] before an instance may be built from it. Validation
//! checks the binary's MD5 against the expected checksum so a tampered
//! daemon is rejected before it is ever launched.

use crate::error::{BrokerError, Result};
use crate::launch;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_NAME: &str = "osquery";
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Flags may be given as one string or as a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FlagList {
    One(String),
    Many(Vec<String>),
}

impl FlagList {
    fn into_vec(self) -> Vec<String> {
        match self {
            FlagList::One(flag) => vec![flag],
            FlagList::Many(flags) => flags,
        }
    }
}

/// Unvalidated instance table as the embedding layer hands it over.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawInstanceConfig {
    pub name: Option<String>,
    pub path: Option<PathBuf>,
    #[serde(alias = "checksum")]
    pub hash: Option<String>,
    #[serde(alias = "socket")]
    pub sock: Option<PathBuf>,
    pub flags: Option<FlagList>,
    pub timeout: Option<i64>,
    pub prefix: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub name: String,
    /// Absolute path of the daemon executable.
    pub binary_path: PathBuf,
    /// MD5 of the binary, lowercase hex; equal to the expected checksum.
    pub checksum: String,
    pub socket_path: PathBuf,
    pub flags: Vec<String>,
    pub timeout_secs: u64,
    pub working_prefix: Option<PathBuf>,
}

impl InstanceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Argument vector the daemon is launched with.
    pub fn args(&self) -> Vec<String> {
        launch::build_args(&self.flags, &self.socket_path)
    }
}

impl RawInstanceConfig {
    pub fn validate(self) -> Result<InstanceConfig> {
        let name = self.name.unwrap_or_else(|| DEFAULT_NAME.to_string());
        validate_name(&name)?;

        let flags = self.flags.map(FlagList::into_vec).unwrap_or_default();
        if flags.is_empty() {
            return Err(BrokerError::MissingFlags);
        }

        let path = clean_path(&self.path.ok_or(BrokerError::MissingField("path"))?);
        let socket_path = self.sock.ok_or(BrokerError::MissingField("sock"))?;
        let expected = self.hash.ok_or(BrokerError::MissingField("hash"))?;

        let actual = file_checksum(&path)?;

        let binary_path = std::path::absolute(&path).map_err(|source| {
            BrokerError::PathResolution {
                path: path.clone(),
                source,
            }
        })?;

        if actual != expected {
            return Err(BrokerError::ChecksumMismatch { actual });
        }

        let timeout_secs = match self.timeout {
            Some(n) if n > 0 => n as u64,
            _ => DEFAULT_TIMEOUT_SECS,
        };

        tracing::debug!(
            name = %name,
            binary = %binary_path.display(),
            socket = %socket_path.display(),
            timeout_secs,
            "Instance config validated"
        );

        Ok(InstanceConfig {
            name,
            binary_path,
            checksum: actual,
            socket_path,
            flags,
            timeout_secs,
            working_prefix: self.prefix,
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BrokerError::InvalidName(name.to_string()))
    }
}

/// Lexically normalizes `.` components and redundant separators.
fn clean_path(path: &Path) -> PathBuf {
    path.components().collect()
}

/// MD5 of the file at `path`, as lowercase hex.
pub fn file_checksum(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|source| BrokerError::ReadBinary {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(format!("{:x}", md5::compute(&bytes)))
}

/// Broker configuration file: a list of instances and an optional default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    pub default: Option<String>,
    #[serde(default, rename = "instance")]
    pub instances: Vec<RawInstanceConfig>,
}

impl BrokerConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;

        let mut seen = HashSet::new();
        for raw in &config.instances {
            let name = raw.name.as_deref().unwrap_or(DEFAULT_NAME);
            if !seen.insert(name) {
                return Err(BrokerError::DuplicateInstance(name.to_string()));
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        tracing::trace!(path = %path.display(), "Loading broker config");

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(
            instances = config.instances.len(),
            default = ?config.default,
            "Broker config loaded"
        );
        Ok(config)
    }
}
