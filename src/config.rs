// src/config.rs

//! Manages the engine configuration: loading, defaults, and validation.

use crate::core::SyncraError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// The full configuration of a replication engine instance.
///
/// All fields have sensible defaults so a host can start from
/// `EngineConfig::default()` and override only what it needs, or load the
/// whole thing from a TOML file with [`EngineConfig::from_file`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    /// The replication group (channel) name this node joins.
    #[serde(default = "default_group")]
    pub group: String,

    /// The group-communication address this node announces.
    #[serde(default = "default_address")]
    pub address: String,

    /// Directory for engine-owned scratch state (write-set logs, etc.).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of worker slots in the applier pool.
    #[serde(default = "default_applier_pool_size")]
    pub applier_pool_size: usize,

    /// Ring capacity of the total-order and commit monitors. Positions wrap
    /// modulo this capacity, so it bounds how far ahead of the slowest
    /// in-flight action the transport may run.
    #[serde(default = "default_ordering_window")]
    pub ordering_window: usize,

    /// Commits between two last-applied reports to the group.
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,

    /// Minimum seqno distance between two certification-history purges.
    #[serde(default = "default_purge_interval")]
    pub purge_interval: u64,

    /// Pause between flow-control re-checks while the cluster signals
    /// "stop sending". Also the re-check period when waiting for a victim
    /// transaction to finish replicating.
    #[serde(with = "humantime_serde", default = "default_flow_control_pause")]
    pub flow_control_pause: Duration,

    /// Pause between state-transfer request retries while the group answers
    /// "busy". A small random jitter is added on top.
    #[serde(with = "humantime_serde", default = "default_state_transfer_retry")]
    pub state_transfer_retry: Duration,

    /// Upper bound on attempts to apply a remote write set. `0` retries
    /// forever: a certified write set must eventually apply on every node,
    /// so giving up is only meaningful for hosts that prefer to crash over
    /// stalling.
    #[serde(default)]
    pub apply_retry_limit: u32,

    /// Mark local transactions committed in the write-set store at
    /// commit-queue entry instead of at the `committed()` call.
    #[serde(default)]
    pub mark_commit_early: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            address: default_address(),
            data_dir: default_data_dir(),
            applier_pool_size: default_applier_pool_size(),
            ordering_window: default_ordering_window(),
            report_interval: default_report_interval(),
            purge_interval: default_purge_interval(),
            flow_control_pause: default_flow_control_pause(),
            state_transfer_retry: default_state_transfer_retry(),
            apply_retry_limit: 0,
            mark_commit_early: false,
        }
    }
}

impl EngineConfig {
    /// Loads the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{path}'"))?;
        let config: EngineConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file '{path}'"))?;
        Ok(config)
    }

    /// Validates the configuration before the engine is built.
    pub fn validate(&self) -> Result<(), SyncraError> {
        if self.group.is_empty() {
            return Err(SyncraError::Config("group name must not be empty".into()));
        }
        if self.applier_pool_size == 0 {
            return Err(SyncraError::Config(
                "applier_pool_size must be at least 1".into(),
            ));
        }
        if self.ordering_window < 2 {
            return Err(SyncraError::Config(
                "ordering_window must be at least 2".into(),
            ));
        }
        if self.report_interval == 0 {
            return Err(SyncraError::Config(
                "report_interval must be at least 1".into(),
            ));
        }
        if self.purge_interval == 0 {
            return Err(SyncraError::Config(
                "purge_interval must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_group() -> String {
    "syncra".to_string()
}

fn default_address() -> String {
    "loopback://".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./syncra-data")
}

fn default_applier_pool_size() -> usize {
    8
}

fn default_ordering_window() -> usize {
    16384
}

fn default_report_interval() -> u64 {
    200
}

fn default_purge_interval() -> u64 {
    100
}

fn default_flow_control_pause() -> Duration {
    Duration::from_millis(10)
}

fn default_state_transfer_retry() -> Duration {
    Duration::from_secs(1)
}
