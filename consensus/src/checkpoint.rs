// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle checkpoints
//!
//! Fire-and-forget markers recorded as blocks move through the backend.
//! Recording never fails the operation that triggered it.

use prometheus::{IntCounter, IntGauge, Registry};
use std::fmt;
use tracing::info;

/// A point in the transaction / block lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    TxCreated,
    TxAccepted,
    /// A locally sealed block was handed to the sealer
    BlockCreated { number: u64 },
    /// A committed block was handed to import
    BlockInserted { number: u64 },
    /// A proposal passed verification and voting starts
    BlockVotingStarted { number: u64 },
}

impl Checkpoint {
    pub fn name(&self) -> &'static str {
        match self {
            Checkpoint::TxCreated => "tx_created",
            Checkpoint::TxAccepted => "tx_accepted",
            Checkpoint::BlockCreated { .. } => "block_created",
            Checkpoint::BlockInserted { .. } => "block_inserted",
            Checkpoint::BlockVotingStarted { .. } => "block_voting_started",
        }
    }

    pub fn block_number(&self) -> Option<u64> {
        match self {
            Checkpoint::BlockCreated { number }
            | Checkpoint::BlockInserted { number }
            | Checkpoint::BlockVotingStarted { number } => Some(*number),
            _ => None,
        }
    }
}

/// Receiver of lifecycle checkpoints
pub trait CheckpointSink: Send + Sync + fmt::Debug {
    fn record(&self, checkpoint: Checkpoint);
}

/// Discards every checkpoint
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCheckpoints;

impl CheckpointSink for NoopCheckpoints {
    fn record(&self, _checkpoint: Checkpoint) {}
}

/// Checkpoint counters exported through a prometheus registry
pub struct PrometheusCheckpoints {
    pub tx_created: IntCounter,
    pub tx_accepted: IntCounter,
    pub blocks_created: IntCounter,
    pub blocks_inserted: IntCounter,
    pub voting_started: IntCounter,
    /// Highest block number seen in any checkpoint
    pub last_block: IntGauge,
    emit: bool,
}

impl PrometheusCheckpoints {
    /// Register the counters on `registry`. With `emit` set every checkpoint
    /// is also logged.
    pub fn new(registry: &Registry, emit: bool) -> Result<Self, prometheus::Error> {
        Ok(Self {
            tx_created: register_int_counter(
                registry,
                "bft_checkpoint_tx_created_total",
                "Transactions created",
            )?,
            tx_accepted: register_int_counter(
                registry,
                "bft_checkpoint_tx_accepted_total",
                "Transactions accepted",
            )?,
            blocks_created: register_int_counter(
                registry,
                "bft_checkpoint_block_created_total",
                "Locally sealed blocks handed to the sealer",
            )?,
            blocks_inserted: register_int_counter(
                registry,
                "bft_checkpoint_block_inserted_total",
                "Committed blocks handed to import",
            )?,
            voting_started: register_int_counter(
                registry,
                "bft_checkpoint_block_voting_started_total",
                "Proposals that passed verification",
            )?,
            last_block: register_int_gauge(
                registry,
                "bft_checkpoint_last_block",
                "Highest block number recorded in a checkpoint",
            )?,
            emit,
        })
    }
}

impl CheckpointSink for PrometheusCheckpoints {
    fn record(&self, checkpoint: Checkpoint) {
        let counter = match checkpoint {
            Checkpoint::TxCreated => &self.tx_created,
            Checkpoint::TxAccepted => &self.tx_accepted,
            Checkpoint::BlockCreated { .. } => &self.blocks_created,
            Checkpoint::BlockInserted { .. } => &self.blocks_inserted,
            Checkpoint::BlockVotingStarted { .. } => &self.voting_started,
        };
        counter.inc();

        if let Some(number) = checkpoint.block_number() {
            let number = i64::try_from(number).unwrap_or(i64::MAX);
            if number > self.last_block.get() {
                self.last_block.set(number);
            }
        }

        if self.emit {
            match checkpoint.block_number() {
                Some(number) => info!(name = checkpoint.name(), number, "CHECKPOINT"),
                None => info!(name = checkpoint.name(), "CHECKPOINT"),
            }
        }
    }
}

impl fmt::Debug for PrometheusCheckpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrometheusCheckpoints")
            .field("last_block", &self.last_block.get())
            .field("emit", &self.emit)
            .finish()
    }
}

fn register_int_gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn register_int_counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}
