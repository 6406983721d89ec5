//! arturo-broker: abstraction over the key-value/stream/pub-sub fabric that
//! carries envelopes between the controller and stations.
//!
//! [`RedisBrokerGateway`] is the production implementation. Tests elsewhere
//! in the workspace use `arturo-test-support::InMemoryBrokerGateway` against
//! the same [`BrokerGateway`] trait so unit tests never need a live Redis.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt as _;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::pin::Pin;
use std::time::Duration;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis: {0}")]
    Io(#[from] redis::RedisError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("timed out waiting for broker response")]
    Timeout,
}

/// An entry read back from a stream: the entry id assigned by the fabric
/// plus the raw envelope bytes.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub entry_id: String,
    pub payload: Bytes,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// The fabric operations the rest of the coordination layer depends on.
/// Deliberately narrow: every method maps to one spec.md §4.2 primitive.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Appends `payload` to `stream` and returns the assigned entry id.
    async fn stream_append(&self, stream: &str, payload: Bytes) -> Result<String, BrokerError>;

    /// Blocks (up to `block_for`) reading new entries on `stream` after
    /// `after_id` ("$" for "only new entries"). Returns an empty vec on
    /// timeout, never an error, so callers can loop without special-casing.
    async fn stream_read_block(
        &self,
        stream: &str,
        after_id: &str,
        block_for: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Publishes `payload` on `channel`.
    async fn pubsub_publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribes to `channel`, returning a stream of raw payloads that
    /// ends when `cancel` fires or the underlying connection is dropped.
    async fn pubsub_subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> Result<ByteStream, BrokerError>;

    /// Sets `key` to `value` with a millisecond TTL, for presence tracking.
    async fn key_set_ttl(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), BrokerError>;

    /// Deletes `key`. Not an error if it was already absent.
    async fn key_delete(&self, key: &str) -> Result<(), BrokerError>;
}

/// Production [`BrokerGateway`] over Redis streams, pub/sub, and string
/// keys. Holds a [`ConnectionManager`], which reconnects transparently on
/// the command path; pub/sub subscriptions open their own dedicated
/// connection per call since Redis multiplexes pub/sub differently from
/// commands.
pub struct RedisBrokerGateway {
    client: redis::Client,
    commands: ConnectionManager,
}

impl RedisBrokerGateway {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, commands })
    }
}

#[async_trait]
impl BrokerGateway for RedisBrokerGateway {
    async fn stream_append(&self, stream: &str, payload: Bytes) -> Result<String, BrokerError> {
        let mut conn = self.commands.clone();
        let entry_id: String = conn
            .xadd(stream, "*", &[("payload", payload.as_ref())])
            .await?;
        Ok(entry_id)
    }

    async fn stream_read_block(
        &self,
        stream: &str,
        after_id: &str,
        block_for: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let mut conn = self.commands.clone();
        let opts = redis::streams::StreamReadOptions::default()
            .block(block_for.as_millis() as usize)
            .count(64);

        let read: redis::streams::StreamReadReply = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BrokerError::Cancelled),
            result = conn.xread_options(&[stream], &[after_id], &opts) => result?,
        };

        let mut entries = Vec::new();
        for key in read.keys {
            for id in key.ids {
                if let Some(redis::Value::BulkString(bytes)) = id.map.get("payload") {
                    entries.push(StreamEntry {
                        entry_id: id.id.clone(),
                        payload: Bytes::copy_from_slice(bytes),
                    });
                }
            }
        }
        Ok(entries)
    }

    async fn pubsub_publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        conn.publish(channel, payload.as_ref()).await?;
        Ok(())
    }

    async fn pubsub_subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> Result<ByteStream, BrokerError> {
        let pubsub_conn = self.client.get_async_pubsub().await?;
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(256);
        let channel = channel.to_owned();

        tokio::spawn(async move {
            let mut pubsub_conn = pubsub_conn;
            if pubsub_conn.subscribe(&channel).await.is_err() {
                return;
            }
            let mut messages = pubsub_conn.on_message();
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    maybe_msg = messages.next() => {
                        let Some(msg) = maybe_msg else { break };
                        let Ok(payload) = msg.get_payload::<Vec<u8>>() else { continue };
                        if tx.send(Bytes::from(payload)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn key_set_ttl(&self, key: &str, value: &str, ttl_ms: u64) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn key_delete(&self, key: &str) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}
