//! Runtime configuration of a replica.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Default election timeout in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT: u64 = 150;
/// Default heartbeat interval in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default maximum number of entries per replication payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default distance behind the head of the log before a peer is considered lagging.
pub const DEFAULT_REPLICATION_LAG_THRESHOLD: u64 = 1000;

/// The runtime configuration of a replica.
///
/// The election timeout is a base value: each time a timer is armed, the actual
/// timeout is randomized within `[election_timeout, 2 * election_timeout)` so that
/// followers do not stampede into simultaneous candidacies (§5.2).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The name of the cluster this replica belongs to, used for diagnostics only.
    pub cluster_name: String,
    /// The base election timeout in milliseconds. Must be greater than zero.
    pub election_timeout: u64,
    /// The heartbeat interval in milliseconds. Must be greater than zero and strictly
    /// less than `election_timeout`.
    pub heartbeat_interval: u64,
    /// The maximum number of entries carried by a single AppendEntries payload.
    pub max_payload_entries: u64,
    /// Once a peer's matched index trails the head of the log by more than this many
    /// entries, its replication stream switches to catch-up mode and feeds from storage.
    pub replication_lag_threshold: u64,
    /// The target number of replicas per committed entry, counting the leader.
    ///
    /// Only consulted when advertising the follower set in a term descriptor; `None`
    /// advertises every member.
    pub replication_factor: Option<u64>,
}

impl Config {
    /// Start a builder seeded with the default values.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
            replication_factor: None,
        }
    }

    /// Generate a new election timeout in `[election_timeout, 2 * election_timeout)`.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout..(self.election_timeout * 2))
    }
}

/// A builder for the `Config` type.
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
    replication_factor: Option<u64>,
}

impl ConfigBuilder {
    /// Set the base election timeout in milliseconds.
    pub fn election_timeout(mut self, val: u64) -> Self {
        self.election_timeout = Some(val);
        self
    }

    /// Set the heartbeat interval in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the maximum number of entries per replication payload.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the lag threshold after which a peer is caught up from storage.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the target number of replicas per committed entry.
    pub fn replication_factor(mut self, val: u64) -> Self {
        self.replication_factor = Some(val);
        self
    }

    /// Validate the state of the builder and produce a new `Config` instance.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout = self.election_timeout.unwrap_or(DEFAULT_ELECTION_TIMEOUT);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        let replication_lag_threshold =
            self.replication_lag_threshold.unwrap_or(DEFAULT_REPLICATION_LAG_THRESHOLD);

        if election_timeout == 0 {
            return Err(ConfigError::InvalidElectionTimeout);
        }
        if heartbeat_interval == 0 || heartbeat_interval >= election_timeout {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        if max_payload_entries == 0 {
            return Err(ConfigError::InvalidMaxPayloadEntries);
        }
        if let Some(factor) = self.replication_factor {
            if factor == 0 {
                return Err(ConfigError::InvalidReplicationFactor);
            }
        }

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout,
            heartbeat_interval,
            max_payload_entries,
            replication_lag_threshold,
            replication_factor: self.replication_factor,
        })
    }
}

/// A configuration error.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The election timeout must be greater than zero.
    #[error("election timeout must be greater than zero")]
    InvalidElectionTimeout,
    /// The heartbeat interval must be greater than zero and less than the election timeout.
    #[error("heartbeat interval must be greater than zero and less than the election timeout")]
    InvalidHeartbeatInterval,
    /// The maximum payload entries must be greater than zero.
    #[error("max payload entries must be greater than zero")]
    InvalidMaxPayloadEntries,
    /// The replication factor must be greater than zero.
    #[error("replication factor must be greater than zero")]
    InvalidReplicationFactor,
}
