//! Node configuration.
//!
//! All tunables are collected in [`KadConfig`] and passed explicitly into the
//! routing table, correlation layer and facade. Every field has a default, so
//! a TOML file only needs to name what it changes:
//!
//! ```toml
//! key_size = 20
//! bucket_size = 8
//! bind = "0.0.0.0:4000"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KadError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KadConfig {
    /// Key width in bytes.
    pub key_size: usize,
    /// Maximum peers per bucket; also the number of results a lookup returns.
    pub bucket_size: usize,
    /// A bucket head confirmed within this window is not probed.
    pub valid_timespan_ms: u64,
    /// Lookup parallelism (α).
    pub concurrency: usize,
    /// Default timeout for requests and probes.
    pub request_timeout_ms: u64,
    /// Maximum number of probes in flight at once.
    pub probe_workers: usize,
    pub bind: SocketAddr,
    /// Seed for key and message id generation; random when absent.
    pub seed: Option<u64>,
}

impl Default for KadConfig {
    fn default() -> Self {
        Self {
            key_size: 20,
            bucket_size: 20,
            valid_timespan_ms: 60_000,
            concurrency: 3,
            request_timeout_ms: 3_000,
            probe_workers: 8,
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            seed: None,
        }
    }
}

impl KadConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, KadError> {
        let config: KadConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, KadError> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> Result<(), KadError> {
        if self.key_size == 0 {
            return Err(KadError::Config("key_size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(KadError::Config("concurrency must be at least 1".into()));
        }
        Ok(())
    }

    pub fn valid_timespan(&self) -> Duration {
        Duration::from_millis(self.valid_timespan_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Number of buckets in a routing table, one per shared-prefix length.
    pub fn bucket_count(&self) -> usize {
        self.key_size * 8
    }
}
