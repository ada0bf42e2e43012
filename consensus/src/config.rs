// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Backend configuration
//!
//! Built once at node construction and shared by reference with both
//! round engines. Values can come from defaults, a JSON document or
//! `BFT_*` environment variables.

use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Default number of snapshots kept in memory
pub const DEFAULT_SNAPSHOT_CACHE_SIZE: usize = 128;
/// Default number of peers tracked by the per-peer message cache
pub const DEFAULT_PEER_CACHE_SIZE: usize = 40;
/// Default number of message hashes kept per cache
pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 1024;
/// Default epoch length; votes are reset at multiples of this height
pub const DEFAULT_EPOCH: u64 = 30_000;
/// Default checkpoint interval; snapshots are persisted at multiples of this height
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 1024;

/// How the next proposer is chosen from the validator list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Advance to the next validator after every block
    #[default]
    RoundRobin,
    /// Keep the last proposer until a round change
    Sticky,
}

impl std::str::FromStr for PolicyKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(PolicyKind::RoundRobin),
            "sticky" => Ok(PolicyKind::Sticky),
            other => Err(BackendError::Config(format!("unknown proposer policy: {}", other))),
        }
    }
}

/// Configuration for the consensus backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Height at which the current protocol replaces the legacy one.
    /// `None` keeps the legacy protocol; `Some(0)` runs current from genesis.
    pub fork_height: Option<u64>,

    /// Proposer selection policy
    pub proposer_policy: PolicyKind,

    /// Epoch length in blocks (default: 30,000)
    pub epoch: u64,

    /// Snapshot persistence interval in blocks (default: 1,024)
    pub checkpoint_interval: u64,

    /// Snapshot LRU capacity (default: 128)
    pub snapshot_cache_size: usize,

    /// Number of peers with a message cache (default: 40)
    pub peer_cache_size: usize,

    /// Message hashes remembered per cache (default: 1,024)
    pub message_cache_size: usize,

    /// Log a line for every recorded checkpoint
    pub emit_checkpoints: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            fork_height: None,
            proposer_policy: PolicyKind::RoundRobin,
            epoch: DEFAULT_EPOCH,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            snapshot_cache_size: DEFAULT_SNAPSHOT_CACHE_SIZE,
            peer_cache_size: DEFAULT_PEER_CACHE_SIZE,
            message_cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
            emit_checkpoints: false,
        }
    }
}

impl BackendConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// Recognized: `BFT_FORK_HEIGHT`, `BFT_PROPOSER_POLICY`, `BFT_EPOCH`,
    /// `BFT_CHECKPOINT_INTERVAL`, `BFT_SNAPSHOT_CACHE_SIZE`,
    /// `BFT_PEER_CACHE_SIZE`, `BFT_MESSAGE_CACHE_SIZE`, `BFT_EMIT_CHECKPOINTS`.
    pub fn from_env() -> Result<Self, BackendError> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u64>("BFT_FORK_HEIGHT")? {
            config.fork_height = Some(v);
        }
        if let Ok(v) = std::env::var("BFT_PROPOSER_POLICY") {
            config.proposer_policy = v.parse()?;
        }
        if let Some(v) = env_parse("BFT_EPOCH")? {
            config.epoch = v;
        }
        if let Some(v) = env_parse("BFT_CHECKPOINT_INTERVAL")? {
            config.checkpoint_interval = v;
        }
        if let Some(v) = env_parse("BFT_SNAPSHOT_CACHE_SIZE")? {
            config.snapshot_cache_size = v;
        }
        if let Some(v) = env_parse("BFT_PEER_CACHE_SIZE")? {
            config.peer_cache_size = v;
        }
        if let Some(v) = env_parse("BFT_MESSAGE_CACHE_SIZE")? {
            config.message_cache_size = v;
        }
        if let Some(v) = env_parse("BFT_EMIT_CHECKPOINTS")? {
            config.emit_checkpoints = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse from a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, BackendError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| BackendError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the backend misbehave.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.epoch == 0 {
            return Err(BackendError::Config("epoch must be non-zero".to_string()));
        }
        if self.checkpoint_interval == 0 {
            return Err(BackendError::Config(
                "checkpoint_interval must be non-zero".to_string(),
            ));
        }
        for (name, size) in [
            ("snapshot_cache_size", self.snapshot_cache_size),
            ("peer_cache_size", self.peer_cache_size),
            ("message_cache_size", self.message_cache_size),
        ] {
            if size == 0 {
                return Err(BackendError::Config(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, BackendError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| BackendError::Config(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}
