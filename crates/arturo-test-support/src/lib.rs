//! arturo-test-support: in-memory doubles for the broker and journal
//! traits, shared by every crate's test suite so unit tests never need a
//! live Redis or Postgres.

use arturo_broker::{BrokerError, BrokerGateway, ByteStream, StreamEntry};
use arturo_persistence::{CommandResultRow, Journal, RunStatus, TemperatureSample, TestEvent, TestRun};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

/// An in-process stand-in for Redis streams and pub/sub. Each stream is an
/// append-only `Vec`; each channel fans out through a `broadcast` sender.
/// Good enough for exercising the dispatcher/router/session wiring without
/// a real broker.
#[derive(Default)]
pub struct InMemoryBrokerGateway {
    streams: Mutex<HashMap<String, Vec<Bytes>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
    keys: Mutex<HashMap<String, String>>,
}

impl InMemoryBrokerGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: read back everything appended to a stream, in order.
    pub async fn appended(&self, stream: &str) -> Vec<Bytes> {
        self.streams.lock().await.get(stream).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl BrokerGateway for InMemoryBrokerGateway {
    async fn stream_append(&self, stream: &str, payload: Bytes) -> Result<String, BrokerError> {
        let mut streams = self.streams.lock().await;
        let entries = streams.entry(stream.to_owned()).or_default();
        entries.push(payload);
        Ok(format!("{}-0", entries.len()))
    }

    async fn stream_read_block(
        &self,
        stream: &str,
        after_id: &str,
        block_for: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let after: usize = after_id.split('-').next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let deadline = tokio::time::sleep(block_for);
        tokio::pin!(deadline);
        loop {
            {
                let streams = self.streams.lock().await;
                if let Some(entries) = streams.get(stream) {
                    if entries.len() > after {
                        return Ok(entries[after..]
                            .iter()
                            .enumerate()
                            .map(|(i, payload)| StreamEntry {
                                entry_id: format!("{}-0", after + i + 1),
                                payload: payload.clone(),
                            })
                            .collect());
                    }
                }
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(BrokerError::Cancelled),
                () = &mut deadline => return Ok(Vec::new()),
                () = tokio::time::sleep(Duration::from_millis(5)) => {}
            }
        }
    }

    async fn pubsub_publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        let channels = self.channels.lock().await;
        if let Some(tx) = channels.get(channel) {
            let _ = tx.send(payload);
        }
        Ok(())
    }

    async fn pubsub_subscribe(&self, channel: &str, cancel: CancellationToken) -> Result<ByteStream, BrokerError> {
        let mut channels = self.channels.lock().await;
        let tx = channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone();
        let rx = tx.subscribe();
        let stream = BroadcastStream::new(rx)
            .take_while(move |_| !cancel.is_cancelled())
            .filter_map(|item| item.ok());
        Ok(Box::pin(stream))
    }

    async fn key_set_ttl(&self, key: &str, value: &str, _ttl_ms: u64) -> Result<(), BrokerError> {
        self.keys.lock().await.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn key_delete(&self, key: &str) -> Result<(), BrokerError> {
        self.keys.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Default)]
struct InMemoryJournalState {
    runs: HashMap<String, TestRun>,
    events: HashMap<String, Vec<TestEvent>>,
    command_results: HashMap<String, Vec<CommandResultRow>>,
    temperatures: Vec<TemperatureSample>,
    station_states: HashMap<String, (String, Option<String>)>,
}

/// An in-process stand-in for [`arturo_persistence::PostgresJournal`],
/// backed by a plain mutex-guarded state struct rather than a pool.
#[derive(Default)]
pub struct InMemoryJournal {
    state: StdMutex<InMemoryJournalState>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn station_state(&self, instance: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .station_states
            .get(instance)
            .map(|(state, _)| state.clone())
    }
}

#[async_trait]
impl Journal for InMemoryJournal {
    async fn create_test_run(
        &self,
        id: &str,
        script_path: &str,
        rma_id: Option<&str>,
        station_instance: Option<&str>,
        script_hash: Option<&str>,
        _source: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        state.runs.entry(id.to_owned()).or_insert(TestRun {
            id: id.to_owned(),
            script_path: script_path.to_owned(),
            script_hash: script_hash.map(|s| s.to_owned()),
            rma_id: rma_id.map(|s| s.to_owned()),
            station_instance: station_instance.map(|s| s.to_owned()),
            status: "running".to_owned(),
            summary: None,
        });
        Ok(())
    }

    async fn finish_test_run(&self, id: &str, status: RunStatus, summary: &str) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(run) = state.runs.get_mut(id) {
            run.status = match status {
                RunStatus::Running => "running",
                RunStatus::Passed => "passed",
                RunStatus::Failed => "failed",
                RunStatus::Error => "error",
                RunStatus::Terminated => "terminated",
                RunStatus::Aborted => "aborted",
            }
            .to_owned();
            run.summary = Some(summary.to_owned());
        }
        Ok(())
    }

    async fn delete_test_run(&self, id: &str) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        state.runs.remove(id);
        state.events.remove(id);
        state.command_results.remove(id);
        Ok(())
    }

    async fn record_command_result(
        &self,
        run_id: &str,
        device_id: &str,
        command_name: &str,
        success: bool,
        response: Option<&str>,
        duration_ms: i64,
    ) -> Result<(), sqlx::Error> {
        self.state
            .lock()
            .unwrap()
            .command_results
            .entry(run_id.to_owned())
            .or_default()
            .push(CommandResultRow {
                device_id: device_id.to_owned(),
                command_name: command_name.to_owned(),
                success,
                response: response.map(|s| s.to_owned()),
                duration_ms,
            });
        Ok(())
    }

    async fn record_temperature(
        &self,
        _run_id: Option<&str>,
        station_instance: &str,
        device_id: &str,
        stage: i16,
        temperature_k: f64,
    ) -> Result<(), sqlx::Error> {
        self.state.lock().unwrap().temperatures.push(TemperatureSample {
            station_instance: station_instance.to_owned(),
            device_id: device_id.to_owned(),
            stage,
            temperature_k,
        });
        Ok(())
    }

    async fn record_test_event(
        &self,
        run_id: &str,
        event_type: &str,
        employee_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        self.state
            .lock()
            .unwrap()
            .events
            .entry(run_id.to_owned())
            .or_default()
            .push(TestEvent {
                event_type: event_type.to_owned(),
                employee_id: employee_id.map(|s| s.to_owned()),
                reason: reason.map(|s| s.to_owned()),
            });
        Ok(())
    }

    async fn set_station_state(&self, instance: &str, state: &str, current_run_id: Option<&str>) -> Result<(), sqlx::Error> {
        self.state
            .lock()
            .unwrap()
            .station_states
            .insert(instance.to_owned(), (state.to_owned(), current_run_id.map(|s| s.to_owned())));
        Ok(())
    }

    async fn get_test_run(&self, id: &str) -> Result<Option<TestRun>, sqlx::Error> {
        Ok(self.state.lock().unwrap().runs.get(id).cloned())
    }

    async fn list_events_for_run(&self, run_id: &str) -> Result<Vec<TestEvent>, sqlx::Error> {
        Ok(self.state.lock().unwrap().events.get(run_id).cloned().unwrap_or_default())
    }

    async fn list_command_results_for_run(&self, run_id: &str) -> Result<Vec<CommandResultRow>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .command_results
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_runs_for_rma(&self, rma_id: &str) -> Result<Vec<TestRun>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|r| r.rma_id.as_deref() == Some(rma_id))
            .cloned()
            .collect())
    }

    async fn list_temperatures_since(&self, station_instance: &str, _since_secs: i64) -> Result<Vec<TemperatureSample>, sqlx::Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .temperatures
            .iter()
            .filter(|t| t.station_instance == station_instance)
            .cloned()
            .collect())
    }
}
