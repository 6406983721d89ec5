//! arturo-router: the script- and session-facing facade over the broker and
//! dispatcher. [`StationRouter`] issues requests and awaits correlated
//! responses; [`PausableRouter`] decorates any [`CommandRouter`] with a
//! pause gate.

use arturo_broker::BrokerGateway;
use arturo_dispatcher::{Dispatcher, WaitError};
use arturo_protocol::{CommandError, Payload, Source};
use arturo_registry::Registry;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<CommandError>,
    pub duration_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("station unknown for device {0}")]
    StationUnknown(String),
    #[error("broker error: {0}")]
    Broker(#[from] arturo_broker::BrokerError),
    #[error("command timed out")]
    Timeout,
    #[error("command cancelled")]
    Cancelled,
    #[error("malformed response: {0}")]
    BadResponse(String),
}

/// The script router contract: a single function sufficient for every
/// device interaction.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    async fn send_command(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        command_name: &str,
        parameters: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResult, RouterError>;
}

/// Binds a broker, dispatcher, and registry into the concrete router a
/// station's commands flow through.
pub struct StationRouter {
    broker: Arc<dyn BrokerGateway>,
    dispatcher: Dispatcher,
    registry: Arc<Registry>,
    source: Source,
    default_timeout: Duration,
}

impl StationRouter {
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        dispatcher: Dispatcher,
        registry: Arc<Registry>,
        source: Source,
        default_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            dispatcher,
            registry,
            source,
            default_timeout,
        }
    }
}

#[async_trait]
impl CommandRouter for StationRouter {
    async fn send_command(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        command_name: &str,
        parameters: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResult, RouterError> {
        let device = self
            .registry
            .lookup_device(device_id)
            .await
            .ok_or_else(|| RouterError::StationUnknown(device_id.to_owned()))?;

        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let request = arturo_protocol::build_command_request(
            self.source.clone(),
            device_id,
            command_name,
            parameters,
            Some(timeout.as_millis() as u64),
        );
        let correlation_id = request
            .correlation_id
            .clone()
            .expect("build_command_request always sets correlation_id");

        let waiter = self.dispatcher.register(&correlation_id).await;

        let encoded = arturo_protocol::encode(&request);
        self.broker
            .stream_append(&device.command_stream, Bytes::from(encoded))
            .await?;

        let started = std::time::Instant::now();
        let response = waiter.recv(timeout, cancel).await.map_err(|err| match err {
            WaitError::Timeout => RouterError::Timeout,
            WaitError::Cancelled => RouterError::Cancelled,
            WaitError::Closed => RouterError::BadResponse("dispatcher channel closed".to_owned()),
        })?;
        let _elapsed = started.elapsed();

        match response.payload {
            Payload::CommandResponse(resp) => Ok(CommandResult {
                success: resp.success,
                response: resp.response,
                error: resp.error,
                duration_ms: resp.duration_ms,
            }),
            other => Err(RouterError::BadResponse(format!(
                "expected command.response, got {}",
                other.type_tag()
            ))),
        }
    }
}

/// Decorates any [`CommandRouter`] with a pause gate: while paused,
/// `send_command` blocks before forwarding. All blocked callers observe the
/// same resume notification, so no release is missed or duplicated.
pub struct PausableRouter {
    inner: Arc<dyn CommandRouter>,
    paused_tx: tokio::sync::watch::Sender<bool>,
}

impl PausableRouter {
    pub fn new(inner: Arc<dyn CommandRouter>) -> Self {
        let (paused_tx, _rx) = tokio::sync::watch::channel(false);
        Self { inner, paused_tx }
    }

    pub fn pause(&self) {
        self.paused_tx.send_if_modified(|paused| {
            let changed = !*paused;
            *paused = true;
            changed
        });
    }

    pub fn resume(&self) {
        self.paused_tx.send_if_modified(|paused| {
            let changed = *paused;
            *paused = false;
            changed
        });
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// The wrapped router, for callers (the temperature sampler) that must
    /// bypass the pause gate entirely.
    pub fn inner(&self) -> Arc<dyn CommandRouter> {
        self.inner.clone()
    }
}

#[async_trait]
impl CommandRouter for PausableRouter {
    async fn send_command(
        &self,
        cancel: &CancellationToken,
        device_id: &str,
        command_name: &str,
        parameters: Option<Value>,
        timeout_ms: Option<u64>,
    ) -> Result<CommandResult, RouterError> {
        let mut gate = self.paused_tx.subscribe();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RouterError::Cancelled),
            result = gate.wait_for(|paused| !*paused) => {
                result.map_err(|_| RouterError::Cancelled)?;
            }
        }
        self.inner
            .send_command(cancel, device_id, command_name, parameters, timeout_ms)
            .await
    }
}
