// Copyright (c) Hetu Project
// SPDX-License-Identifier: Apache-2.0

//! Event stream from the backend into the round core
//!
//! Every subscriber gets its own unbounded queue, so posting never blocks
//! the caller. Subscribers whose receiver was dropped are pruned on the
//! next post.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Events delivered to the running round core
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A consensus message, either from a peer or our own broadcast
    Message { code: u64, payload: Vec<u8> },
    /// A new chain head was imported
    FinalCommitted,
}

pub type EventReceiver = mpsc::UnboundedReceiver<BackendEvent>;

#[derive(Debug, Default)]
pub struct EventMux {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<BackendEvent>>>,
}

impl EventMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to all live subscribers; returns how many received it.
    pub fn post(&self, event: BackendEvent) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
