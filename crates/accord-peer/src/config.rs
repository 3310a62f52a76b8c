use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use accord_consensus::Threshold;
use accord_store::{FileStore, MemoryStore, Store};
use serde::{Deserialize, Serialize};

use crate::error::{PeerError, PeerResult};

/// Runtime settings for one peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// How long the propagator waits for incoming beliefs per iteration.
    pub await_beliefs_ms: u64,
    /// Minimum gap between two belief broadcasts.
    pub min_broadcast_spacing_ms: u64,
    /// Idle time after which the full belief is rebroadcast.
    pub rebroadcast_delay_ms: u64,
    pub belief_queue_capacity: usize,
    /// Capacity of the inbound dispatch channel.
    pub inbound_queue_capacity: usize,
    pub transaction_queue_capacity: usize,
    pub max_block_transactions: usize,
    /// Iterations a belief waiting on missing data is kept before it is dropped.
    pub max_missing_retries: u32,
    pub threshold: Threshold,
    pub store: StoreConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            await_beliefs_ms: 60,
            min_broadcast_spacing_ms: 10,
            rebroadcast_delay_ms: 300,
            belief_queue_capacity: 1024,
            inbound_queue_capacity: 4096,
            transaction_queue_capacity: 10_000,
            max_block_transactions: 1024,
            max_missing_retries: 20,
            threshold: Threshold::TWO_THIRDS,
            store: StoreConfig::Memory,
        }
    }
}

impl PeerConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> PeerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> PeerResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| PeerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> PeerResult<String> {
        toml::to_string_pretty(self).map_err(|e| PeerError::Config(e.to_string()))
    }

    pub fn validate(&self) -> PeerResult<()> {
        if self.belief_queue_capacity == 0 {
            return Err(PeerError::Config("belief_queue_capacity must be positive".into()));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(PeerError::Config("inbound_queue_capacity must be positive".into()));
        }
        if self.transaction_queue_capacity == 0 {
            return Err(PeerError::Config(
                "transaction_queue_capacity must be positive".into(),
            ));
        }
        if self.max_block_transactions == 0 {
            return Err(PeerError::Config("max_block_transactions must be positive".into()));
        }
        let Threshold {
            numerator,
            denominator,
        } = self.threshold;
        if denominator == 0 || numerator > denominator {
            return Err(PeerError::Config(format!(
                "threshold {numerator}/{denominator} is not a fraction of stake"
            )));
        }
        Ok(())
    }

    pub fn await_beliefs(&self) -> Duration {
        Duration::from_millis(self.await_beliefs_ms)
    }

    pub fn min_broadcast_spacing(&self) -> Duration {
        Duration::from_millis(self.min_broadcast_spacing_ms)
    }

    pub fn rebroadcast_delay(&self) -> Duration {
        Duration::from_millis(self.rebroadcast_delay_ms)
    }
}

/// Where a peer keeps its cells.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    File { path: PathBuf },
}

impl StoreConfig {
    pub fn open(&self) -> PeerResult<Arc<dyn Store>> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryStore::new())),
            Self::File { path } => Ok(Arc::new(FileStore::open(path)?)),
        }
    }
}
