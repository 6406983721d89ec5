//! arturo-dispatcher: routes inbound responses to the outstanding request
//! that is waiting on them, keyed by correlation id.
//!
//! Modeled on the correlation-keyed `oneshot` reply channels the donor uses
//! for its forwarder command proxy (`ForwarderCommand::ConfigGet { reply:
//! oneshot::Sender<..> }`), generalized into a table the router can
//! register against per outgoing request.

use arturo_protocol::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// A single-shot handle to the eventual response for one correlation id.
pub struct Waiter {
    correlation_id: String,
    receiver: oneshot::Receiver<Envelope>,
    dispatcher: Dispatcher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Cancelled,
    Closed,
}

impl Waiter {
    /// Waits for the response, a timeout, or external cancellation. In all
    /// non-success paths the waiter is deregistered before returning, so no
    /// entry is ever left in the dispatcher's table past this call.
    pub async fn recv(
        mut self,
        timeout: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Envelope, WaitError> {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(WaitError::Cancelled),
            () = tokio::time::sleep(timeout) => Err(WaitError::Timeout),
            received = &mut self.receiver => received.map_err(|_| WaitError::Closed),
        };
        if result.is_err() {
            self.dispatcher.deregister(&self.correlation_id).await;
        }
        result
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Registers a waiter for `correlation_id`. Exactly one response will
    /// be delivered to the returned [`Waiter`], or none if the caller's
    /// timeout or cancellation fires first.
    pub async fn register(&self, correlation_id: impl Into<String>) -> Waiter {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(correlation_id.clone(), tx);
        Waiter {
            correlation_id,
            receiver: rx,
            dispatcher: self.clone(),
        }
    }

    /// Removes the waiter for `correlation_id`, if any. Any subsequent
    /// matching response is dropped by [`dispatch`](Self::dispatch).
    pub async fn deregister(&self, correlation_id: &str) {
        self.waiters.lock().await.remove(correlation_id);
    }

    /// Routes `message` to its waiter, if one is registered. Never blocks
    /// and never fails: a response with no matching waiter (already timed
    /// out, already delivered, or unsolicited) is logged and dropped.
    pub async fn dispatch(&self, message: Envelope) {
        let Some(correlation_id) = message.correlation_id.clone() else {
            tracing::debug!("dropping response with no correlation_id");
            return;
        };
        let sender = self.waiters.lock().await.remove(&correlation_id);
        match sender {
            Some(sender) => {
                if sender.send(message).is_err() {
                    tracing::debug!(correlation_id, "waiter dropped before response arrived");
                }
            }
            None => {
                tracing::debug!(correlation_id, "no waiter registered for response, dropping");
            }
        }
    }

    #[cfg(any(test, feature = "test-support"))]
    pub async fn waiter_count(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arturo_protocol::{CommandResponse, Payload, Source};

    fn response(correlation_id: &str) -> Envelope {
        Envelope {
            id: "resp-1".to_owned(),
            timestamp: 0,
            source: Source {
                service: "station".to_owned(),
                instance: "station-01".to_owned(),
                version: "1.0.0".to_owned(),
            },
            schema_version: arturo_protocol::SCHEMA_VERSION.to_owned(),
            correlation_id: Some(correlation_id.to_owned()),
            reply_to: None,
            payload: Payload::CommandResponse(CommandResponse {
                device_id: "PUMP-01".to_owned(),
                command_name: "pump_status".to_owned(),
                success: true,
                response: Some("1".to_owned()),
                error: None,
                duration_ms: 5,
            }),
        }
    }

    #[tokio::test]
    async fn dispatch_routes_exactly_to_registered_waiter() {
        let dispatcher = Dispatcher::new();
        let waiter = dispatcher.register("corr-1").await;
        dispatcher.dispatch(response("corr-1")).await;

        let cancel = tokio_util::sync::CancellationToken::new();
        let received = waiter.recv(Duration::from_millis(100), &cancel).await.unwrap();
        assert_eq!(received.correlation_id.as_deref(), Some("corr-1"));
    }

    #[tokio::test]
    async fn second_dispatch_with_same_id_is_a_no_op() {
        let dispatcher = Dispatcher::new();
        let waiter = dispatcher.register("corr-1").await;
        dispatcher.dispatch(response("corr-1")).await;
        dispatcher.dispatch(response("corr-1")).await;

        let cancel = tokio_util::sync::CancellationToken::new();
        let received = waiter.recv(Duration::from_millis(100), &cancel).await.unwrap();
        assert_eq!(received.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(dispatcher.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn timeout_deregisters_waiter() {
        let dispatcher = Dispatcher::new();
        let waiter = dispatcher.register("corr-1").await;
        let cancel = tokio_util::sync::CancellationToken::new();

        let result = waiter.recv(Duration::from_millis(20), &cancel).await;
        assert_eq!(result, Err(WaitError::Timeout));
        assert_eq!(dispatcher.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn cancellation_deregisters_waiter() {
        let dispatcher = Dispatcher::new();
        let waiter = dispatcher.register("corr-1").await;
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();

        let result = waiter.recv(Duration::from_millis(100), &cancel).await;
        assert_eq!(result, Err(WaitError::Cancelled));
        assert_eq!(dispatcher.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn orphan_response_is_dropped_without_panic() {
        let dispatcher = Dispatcher::new();
        dispatcher.dispatch(response("no-such-waiter")).await;
        assert_eq!(dispatcher.waiter_count().await, 0);
    }
}
