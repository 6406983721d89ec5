//! arturo-estop: fleet-wide emergency-stop state. Activation is idempotent
//! in effect (repeated activations simply update the held reason and
//! timestamp) but each call still drives exactly one notification — no
//! aggregation, no dropped calls.

use arturo_protocol::{EmergencyStop, EstopReason, Payload};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EstopState {
    pub active: bool,
    pub reason: Option<EstopReason>,
    pub description: Option<String>,
    pub initiator: Option<String>,
    pub triggered_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct EstopEvent {
    pub reason: EstopReason,
    pub description: Option<String>,
    pub initiator: Option<String>,
    pub triggered_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum EstopError {
    #[error("envelope did not contain an emergency_stop payload")]
    NotAnEstopMessage,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// Holds the fleet's emergency-stop state and notifies an injected callback
/// on every activation. The coordinator never knows about the session
/// manager directly — the callback is wired by the caller at startup.
pub struct EstopCoordinator {
    state: Arc<RwLock<EstopState>>,
    on_activate: Arc<dyn Fn(EstopEvent) + Send + Sync>,
}

impl EstopCoordinator {
    pub fn new(on_activate: impl Fn(EstopEvent) + Send + Sync + 'static) -> Self {
        Self {
            state: Arc::new(RwLock::new(EstopState::default())),
            on_activate: Arc::new(on_activate),
        }
    }

    /// Parses an inbound `emergency_stop` envelope and activates.
    pub async fn handle_message(&self, envelope: &arturo_protocol::Envelope) -> Result<(), EstopError> {
        let Payload::EmergencyStop(EmergencyStop {
            reason,
            description,
            initiator,
        }) = &envelope.payload
        else {
            return Err(EstopError::NotAnEstopMessage);
        };
        self.activate(*reason, description.clone(), initiator.clone()).await;
        Ok(())
    }

    /// Local activation, equivalent in effect to an inbound message.
    pub async fn trigger(&self, reason: EstopReason, description: Option<String>, initiator: Option<String>) {
        self.activate(reason, description, initiator).await;
    }

    async fn activate(&self, reason: EstopReason, description: Option<String>, initiator: Option<String>) {
        let triggered_at = now_secs();
        {
            let mut state = self.state.write().await;
            state.active = true;
            state.reason = Some(reason);
            state.description = description.clone();
            state.initiator = initiator.clone();
            state.triggered_at = Some(triggered_at);
        }
        (self.on_activate)(EstopEvent {
            reason,
            description,
            initiator,
            triggered_at,
        });
    }

    /// Transitions the state back to inactive. Does not re-enable any
    /// sessions; operators must start new runs.
    pub async fn acknowledge(&self) {
        let mut state = self.state.write().await;
        *state = EstopState::default();
    }

    pub async fn get_state(&self) -> EstopState {
        self.state.read().await.clone()
    }
}
