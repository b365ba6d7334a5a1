// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::connection::ConnectionState;
use crate::error::EmitError;

#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub event: String,
    pub payload: Value,
}

/// Cheap to clone write handle shared by every producer.
///
/// An emission is written right away while the session is up. Otherwise it is
/// held by the connection task and written once, in call order, after the next
/// successful connect.
#[derive(Clone, Debug)]
pub struct DeferredEmitter {
    tx: Option<mpsc::Sender<Emission>>,
    state: watch::Receiver<ConnectionState>,
}

impl DeferredEmitter {
    pub(crate) fn new(
        tx: mpsc::Sender<Emission>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            tx: Some(tx),
            state,
        }
    }

    /// Emitter for an agent that has no connection; every emission is discarded.
    pub fn disabled() -> Self {
        let (_, state) = watch::channel(ConnectionState::Disconnected);
        Self { tx: None, state }
    }

    pub fn emit_when_connected(
        &self,
        event: impl Into<String>,
        payload: Value,
    ) -> Result<(), EmitError> {
        let event = event.into();
        let Some(tx) = &self.tx else {
            debug!("TRANSPORT | No connection configured, discarding '{event}'");
            return Ok(());
        };
        tx.try_send(Emission { event, payload }).map_err(|e| match e {
            mpsc::error::TrySendError::Full(emission) => {
                warn!(
                    "TRANSPORT | Emission queue full, dropping '{}'",
                    emission.event
                );
                EmitError::QueueFull(emission.event)
            }
            mpsc::error::TrySendError::Closed(emission) => EmitError::Stopped(emission.event),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }
}

/// Emissions waiting for the next connect, oldest first.
#[derive(Debug)]
pub(crate) struct PendingEmissions {
    queue: VecDeque<Emission>,
    capacity: usize,
    dropped: u64,
}

impl PendingEmissions {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub(crate) fn push(&mut self, emission: Emission) {
        if self.queue.len() >= self.capacity {
            if let Some(oldest) = self.queue.pop_front() {
                self.dropped += 1;
                warn!(
                    "TRANSPORT | Pending emissions at capacity {}, dropped oldest '{}' ({} dropped so far)",
                    self.capacity, oldest.event, self.dropped
                );
            }
        }
        self.queue.push_back(emission);
    }

    pub(crate) fn pop_front(&mut self) -> Option<Emission> {
        self.queue.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn emission(event: &str) -> Emission {
        Emission {
            event: event.to_string(),
            payload: json!(null),
        }
    }

    #[test]
    fn pending_drops_oldest_at_capacity() {
        let mut pending = PendingEmissions::new(2);
        pending.push(emission("a"));
        pending.push(emission("b"));
        pending.push(emission("c"));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.pop_front().unwrap().event, "b");
        assert_eq!(pending.pop_front().unwrap().event, "c");
        assert!(pending.pop_front().is_none());
    }

    #[test]
    fn disabled_emitter_discards() {
        let emitter = DeferredEmitter::disabled();
        assert!(emitter
            .emit_when_connected("customMetrics", json!([]))
            .is_ok());
        assert!(!emitter.is_connected());
    }

    #[tokio::test]
    async fn full_channel_reports_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let emitter = DeferredEmitter::new(tx, state_rx);
        emitter.emit_when_connected("a", json!(1)).unwrap();
        assert_eq!(
            emitter.emit_when_connected("b", json!(2)),
            Err(EmitError::QueueFull("b".to_string()))
        );
    }
}
