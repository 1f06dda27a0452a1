//! Configuration file support for the Meridian node.
//!
//! Loads optional `meridian.toml` from the data directory. If no config file
//! exists, defaults are used.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub node: NodeConfig,
    pub consensus: ConsensusConfig,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: "./meridian-data".into(),
        }
    }
}

/// Round timing and quorum parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Round duration in nanoseconds.
    pub snapshot_round_gap: u64,
    /// Closed rounds retained per node.
    pub snapshot_reference_threshold: usize,
    pub quorum_numerator: usize,
    pub quorum_denominator: usize,
    pub capacity_retry_delay_ms: u64,
    pub timestamp_poll_interval_ms: u64,
    pub timestamp_max_polls: u32,
    /// Start (ns) shared by every node's genesis round.
    pub genesis_timestamp: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            snapshot_round_gap: crate::constants::SNAPSHOT_ROUND_GAP,
            snapshot_reference_threshold: crate::constants::SNAPSHOT_REFERENCE_THRESHOLD,
            quorum_numerator: crate::constants::QUORUM_NUMERATOR,
            quorum_denominator: crate::constants::QUORUM_DENOMINATOR,
            capacity_retry_delay_ms: crate::constants::CAPACITY_RETRY_DELAY_MS,
            timestamp_poll_interval_ms: crate::constants::TIMESTAMP_POLL_INTERVAL_MS,
            timestamp_max_polls: crate::constants::TIMESTAMP_MAX_POLLS,
            genesis_timestamp: 0,
        }
    }
}

impl ConsensusConfig {
    /// Minimum number of distinct signers that finalizes a snapshot among
    /// `nodes` consensus participants.
    pub fn quorum_threshold(&self, nodes: usize) -> usize {
        nodes * self.quorum_numerator / self.quorum_denominator.max(1) + 1
    }

    pub fn capacity_retry_delay(&self) -> Duration {
        Duration::from_millis(self.capacity_retry_delay_ms)
    }

    /// Back-off used while the node is not yet synchronized with its peers.
    pub fn sync_retry_delay(&self) -> Duration {
        Duration::from_nanos(self.snapshot_round_gap / 2)
    }

    pub fn timestamp_poll_interval(&self) -> Duration {
        Duration::from_millis(self.timestamp_poll_interval_ms)
    }

    /// Reject parameter combinations the round state machine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_round_gap == 0 {
            return Err(ConfigError::Invalid("snapshot_round_gap must be positive"));
        }
        if self.snapshot_reference_threshold == 0 {
            return Err(ConfigError::Invalid(
                "snapshot_reference_threshold must be positive",
            ));
        }
        if self.quorum_denominator == 0 || self.quorum_numerator >= self.quorum_denominator {
            return Err(ConfigError::Invalid(
                "quorum fraction must be in [0, 1) with a positive denominator",
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

impl MeridianConfig {
    /// Load configuration from `meridian.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("meridian.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
