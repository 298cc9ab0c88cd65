//! TOML configuration for the Wharf daemon.
//!
//! Every section is optional. Accessor methods return the effective value,
//! falling back to defaults for anything left out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use wharf_types::Address;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Data directory and query listener.
    pub node: NodeSection,
    /// Shard store tuning.
    pub dagstore: DagStoreSection,
    /// Provider identity and pricing policy.
    pub retrieval: RetrievalSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory for persistent data (metadata DB, pieces, transients).
    pub data_dir: PathBuf,
    /// Address the query protocol listens on.
    pub listen_addr: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".wharf"))
            .unwrap_or_else(|| PathBuf::from(".wharf"));
        Self {
            data_dir,
            listen_addr: "0.0.0.0:4830".to_string(),
        }
    }
}

/// `[dagstore]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DagStoreSection {
    /// Block size used when indexing shards.
    pub block_size: Option<u32>,
    /// Seconds between transient garbage collections.
    pub gc_interval_secs: Option<u64>,
    /// Shards fetched and indexed concurrently.
    pub max_concurrent_index: Option<usize>,
    /// Automatic recoveries per shard before giving up.
    pub max_recovery_attempts: Option<u32>,
}

/// `[retrieval]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    /// Storage provider address (hex) whose ask is served.
    pub provider_address: Option<String>,
    /// Address clients pay (hex). Defaults to the provider address.
    pub payment_address: Option<String>,
    /// Serve verified deals without a transfer price.
    pub verified_deals_free_transfer: bool,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"wharf_retrieval=trace"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read {}", p.display()))?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.node.data_dir.join("meta")
    }

    pub fn pieces_dir(&self) -> PathBuf {
        self.node.data_dir.join("pieces")
    }

    pub fn dagstore_dir(&self) -> PathBuf {
        self.node.data_dir.join("dagstore")
    }

    /// Effective block size (256 KiB default).
    pub fn block_size(&self) -> u32 {
        self.dagstore.block_size.unwrap_or(256 * 1024)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.dagstore.gc_interval_secs.unwrap_or(60))
    }

    pub fn max_concurrent_index(&self) -> usize {
        self.dagstore.max_concurrent_index.unwrap_or(4)
    }

    pub fn max_recovery_attempts(&self) -> u32 {
        self.dagstore.max_recovery_attempts.unwrap_or(3)
    }

    /// Effective provider address. Without one configured, an address is
    /// derived from the data directory so a node keeps the same one across
    /// restarts.
    pub fn provider_address(&self) -> anyhow::Result<Address> {
        match &self.retrieval.provider_address {
            Some(hex) => hex.parse().context("invalid retrieval.provider_address"),
            None => Ok(Address::from_data(self.node.data_dir.to_string_lossy().as_bytes())),
        }
    }

    pub fn payment_address(&self) -> anyhow::Result<Address> {
        match &self.retrieval.payment_address {
            Some(hex) => hex.parse().context("invalid retrieval.payment_address"),
            None => self.provider_address(),
        }
    }
}
