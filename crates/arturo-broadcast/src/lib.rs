//! arturo-broadcast: the publish side of the state-change fan-out that the
//! (out of scope) WebSocket/HTTP facade would subscribe to.
//!
//! Adapted from a UI log broadcaster: the same "generic broadcast sender
//! plus optional ring buffer" shape, generalized from formatted log lines
//! to the closed set of domain events this coordination layer produces.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Events observers care about. Distinct from wire [`arturo_protocol`]
/// payloads: these are already-resolved, UI-shaped facts, not requests.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    PumpStatus {
        station: String,
        device_id: String,
        status_s1: Option<String>,
        status_s2: Option<String>,
        status_s3: Option<String>,
        regen_active: Option<bool>,
    },
    Temperature {
        station: String,
        device_id: String,
        stage: u8,
        temperature_k: f64,
    },
    SessionStateChanged {
        station: String,
        test_run_id: String,
        state: String,
    },
    EstopActivated {
        reason: String,
        description: Option<String>,
        initiator: Option<String>,
    },
    EstopAcknowledged,
}

/// A generic fan-out channel with an optional bounded ring buffer for late
/// subscribers to catch up on recent history.
pub struct EventBroadcaster<T: Clone + Send + 'static> {
    tx: broadcast::Sender<T>,
    buffer: Option<Arc<RwLock<VecDeque<T>>>>,
    max_entries: usize,
}

impl<T: Clone + Send + 'static> EventBroadcaster<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            buffer: None,
            max_entries: 0,
        }
    }

    pub fn with_buffer(capacity: usize, max_entries: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            buffer: Some(Arc::new(RwLock::new(VecDeque::with_capacity(max_entries)))),
            max_entries,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publishes `event`, buffering it if a ring buffer is configured. No
    /// subscribers is not an error: at-most-once delivery on this channel
    /// is by design.
    pub fn publish(&self, event: T) {
        if let Some(buf) = &self.buffer {
            if let Ok(mut entries) = buf.write() {
                entries.push_back(event.clone());
                while entries.len() > self.max_entries {
                    entries.pop_front();
                }
            }
        }
        let _ = self.tx.send(event);
    }

    pub fn recent(&self) -> Vec<T> {
        match &self.buffer {
            Some(buf) => buf.read().map(|b| b.iter().cloned().collect()).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}
