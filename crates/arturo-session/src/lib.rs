//! arturo-session: per-station test-session lifecycle. The largest
//! component in the coordination layer — it owns the pausable router, the
//! result collector, and the independent temperature sampler for every
//! active test run.
//!
//! Grounded in the donor's per-connection task pattern: a session owns one
//! `JoinHandle` for its executor and one for its sampler, both cancelled
//! through a `CancellationToken` derived via `.child_token()` from the
//! session's own token.

use arturo_broadcast::{Event, EventBroadcaster};
use arturo_persistence::{Journal, RunStatus};
use arturo_router::{CommandRouter, PausableRouter};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Paused,
    Terminated,
    Aborted,
    Completed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a test is already active for this station")]
    AlreadyActive,
    #[error("no active test for this station")]
    NotFound,
    #[error("invalid session transition: expected {expected}, found {actual:?}")]
    InvalidTransition {
        expected: &'static str,
        actual: SessionState,
    },
}

/// Outcome of an executor's natural (non-cancelled) completion.
pub enum ExecutorOutcome {
    Finished,
    Error(String),
}

/// Accumulates command results for one run and reports them to the
/// journal, tracking whether any failed so the executor-completion path
/// can classify the run `passed` vs `failed`.
pub struct ResultCollector {
    journal: Arc<dyn Journal>,
    run_id: String,
    failures: AtomicU64,
}

impl ResultCollector {
    pub fn new(journal: Arc<dyn Journal>, run_id: String) -> Self {
        Self {
            journal,
            run_id,
            failures: AtomicU64::new(0),
        }
    }

    pub async fn record_command_result(
        &self,
        device_id: &str,
        command_name: &str,
        success: bool,
        response: Option<&str>,
        duration_ms: i64,
    ) {
        if !success {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        if let Err(err) = self
            .journal
            .record_command_result(&self.run_id, device_id, command_name, success, response, duration_ms)
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %err, "failed to record command result");
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failures.load(Ordering::SeqCst) > 0
    }
}

/// The script-facing contract. Concrete script parsing/execution is out of
/// scope here; this trait is the adapter point a real executor plugs into.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn run(
        &self,
        router: Arc<PausableRouter>,
        collector: Arc<ResultCollector>,
        cancel: CancellationToken,
    ) -> ExecutorOutcome;
}

/// Does nothing and finishes immediately. Used as the manager's default
/// when no real executor is wired in, and by tests that only care about
/// session bookkeeping.
pub struct NullScriptExecutor;

#[async_trait]
impl ScriptExecutor for NullScriptExecutor {
    async fn run(&self, _router: Arc<PausableRouter>, _collector: Arc<ResultCollector>, _cancel: CancellationToken) -> ExecutorOutcome {
        ExecutorOutcome::Finished
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

fn hash_script(script_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script_path.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Session {
    pub test_run_id: String,
    pub rma_id: Option<String>,
    pub device_id: String,
    pub script_path: String,
    pub employee_id: String,
    pub started_at: i64,
    station: String,
    state: RwLock<SessionState>,
    pausable_router: Arc<PausableRouter>,
    cancel: CancellationToken,
    finished: AtomicBool,
    executor_handle: Mutex<Option<JoinHandle<()>>>,
    sampler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub fn is_paused(&self) -> bool {
        self.pausable_router.is_paused()
    }
}

enum Terminal {
    Completed { status: RunStatus, summary: String },
    Terminated { employee_id: String, reason: String },
    Aborted,
}

async fn finalize(
    sessions: &Arc<RwLock<HashMap<String, Arc<Session>>>>,
    journal: &Arc<dyn Journal>,
    broadcaster: &Arc<EventBroadcaster<Event>>,
    session: &Arc<Session>,
    terminal: Terminal,
) {
    if session
        .finished
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    let (state, state_label) = match &terminal {
        Terminal::Completed { status, summary } => {
            journal.finish_test_run(&session.test_run_id, *status, summary).await.ok();
            journal.record_test_event(&session.test_run_id, "completed", None, None).await.ok();
            (SessionState::Completed, "completed")
        }
        Terminal::Terminated { employee_id, reason } => {
            journal
                .finish_test_run(&session.test_run_id, RunStatus::Terminated, reason)
                .await
                .ok();
            journal
                .record_test_event(&session.test_run_id, "terminated", Some(employee_id), Some(reason))
                .await
                .ok();
            (SessionState::Terminated, "terminated")
        }
        Terminal::Aborted => {
            journal.delete_test_run(&session.test_run_id).await.ok();
            (SessionState::Aborted, "aborted")
        }
    };

    journal.set_station_state(&session.station, "idle", None).await.ok();
    *session.state.write().await = state;

    broadcaster.publish(Event::SessionStateChanged {
        station: session.station.clone(),
        test_run_id: session.test_run_id.clone(),
        state: state_label.to_owned(),
    });

    sessions.write().await.remove(&session.station);
}

async fn run_temperature_sampler(
    cancel: CancellationToken,
    router: Arc<dyn CommandRouter>,
    broadcaster: Arc<EventBroadcaster<Event>>,
    journal: Arc<dyn Journal>,
    run_id: String,
    station: String,
    device_id: String,
    interval: Duration,
    timeout_ms: u64,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                for (stage, command) in [(1i16, "get_temp_1st_stage"), (2i16, "get_temp_2nd_stage")] {
                    match router.send_command(&cancel, &device_id, command, None, Some(timeout_ms)).await {
                        Ok(result) if result.success => {
                            if let Some(response) = result.response {
                                match response.trim().parse::<f64>() {
                                    Ok(temperature_k) => {
                                        journal
                                            .record_temperature(Some(&run_id), &station, &device_id, stage, temperature_k)
                                            .await
                                            .ok();
                                        broadcaster.publish(Event::Temperature {
                                            station: station.clone(),
                                            device_id: device_id.clone(),
                                            stage: stage as u8,
                                            temperature_k,
                                        });
                                    }
                                    Err(_) => tracing::warn!(device_id, command, response, "non-numeric temperature"),
                                }
                            }
                        }
                        Ok(result) => tracing::warn!(device_id, command, error = ?result.error, "sampler command failed"),
                        Err(err) => tracing::warn!(device_id, command, error = %err, "sampler command error"),
                    }
                }
            }
        }
    }
}

/// Builds a raw (non-pausable) router bound to a station instance. Wiring
/// to a concrete broker/registry/dispatcher happens at startup, outside
/// this crate.
pub type RouterFactory = dyn Fn(&str) -> Arc<dyn CommandRouter> + Send + Sync;

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    journal: Arc<dyn Journal>,
    broadcaster: Arc<EventBroadcaster<Event>>,
    router_factory: Arc<RouterFactory>,
    executor: Arc<dyn ScriptExecutor>,
    sampler_interval: Duration,
    sampler_timeout_ms: u64,
}

impl SessionManager {
    pub fn new(
        journal: Arc<dyn Journal>,
        broadcaster: Arc<EventBroadcaster<Event>>,
        router_factory: Arc<RouterFactory>,
        executor: Arc<dyn ScriptExecutor>,
        sampler_interval: Duration,
        sampler_timeout_ms: u64,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            journal,
            broadcaster,
            router_factory,
            executor,
            sampler_interval,
            sampler_timeout_ms,
        }
    }

    async fn get_active(&self, station: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(station)
            .cloned()
            .ok_or(SessionError::NotFound)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn start_test(
        &self,
        station: &str,
        device_id: &str,
        script_path: &str,
        rma_id: Option<&str>,
        test_run_id: &str,
        employee_id: &str,
    ) -> Result<(), SessionError> {
        let script_hash = hash_script(script_path);
        let raw_router = (self.router_factory)(station);
        let pausable_router = Arc::new(PausableRouter::new(raw_router.clone()));
        let cancel = CancellationToken::new();

        let session = Arc::new(Session {
            test_run_id: test_run_id.to_owned(),
            rma_id: rma_id.map(|s| s.to_owned()),
            device_id: device_id.to_owned(),
            script_path: script_path.to_owned(),
            employee_id: employee_id.to_owned(),
            started_at: now_secs(),
            station: station.to_owned(),
            state: RwLock::new(SessionState::Running),
            pausable_router: pausable_router.clone(),
            cancel: cancel.clone(),
            finished: AtomicBool::new(false),
            executor_handle: Mutex::new(None),
            sampler_handle: Mutex::new(None),
        });

        // Reserve the station slot under a single write-lock acquisition so
        // the check and the insert are atomic; nothing below may run before
        // this or two concurrent callers can both pass the check.
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(station) {
                return Err(SessionError::AlreadyActive);
            }
            sessions.insert(station.to_owned(), session.clone());
        }

        if let Err(err) = self
            .journal
            .create_test_run(test_run_id, script_path, rma_id, Some(station), Some(&script_hash), None)
            .await
        {
            tracing::warn!(test_run_id, error = %err, "failed to persist test run creation");
        }
        self.journal
            .record_test_event(test_run_id, "started", Some(employee_id), None)
            .await
            .ok();
        self.journal
            .set_station_state(station, "running", Some(test_run_id))
            .await
            .ok();

        let collector = Arc::new(ResultCollector::new(self.journal.clone(), test_run_id.to_owned()));

        let sampler_handle = tokio::spawn(run_temperature_sampler(
            cancel.child_token(),
            raw_router,
            self.broadcaster.clone(),
            self.journal.clone(),
            test_run_id.to_owned(),
            station.to_owned(),
            device_id.to_owned(),
            self.sampler_interval,
            self.sampler_timeout_ms,
        ));
        *session.sampler_handle.lock().await = Some(sampler_handle);

        let exec_cancel = cancel.child_token();
        let executor = self.executor.clone();
        let collector_for_exec = collector.clone();
        let pausable_for_exec = pausable_router.clone();
        let sessions_for_exec = self.sessions.clone();
        let journal_for_exec = self.journal.clone();
        let broadcaster_for_exec = self.broadcaster.clone();
        let session_for_exec = session.clone();
        let exec_cancel_check = exec_cancel.clone();

        let executor_handle = tokio::spawn(async move {
            let outcome = executor.run(pausable_for_exec, collector_for_exec.clone(), exec_cancel).await;
            if exec_cancel_check.is_cancelled() {
                return;
            }
            let (status, summary) = match outcome {
                ExecutorOutcome::Finished if collector_for_exec.has_failures() => {
                    (RunStatus::Failed, "one or more commands failed".to_owned())
                }
                ExecutorOutcome::Finished => (RunStatus::Passed, "all commands succeeded".to_owned()),
                ExecutorOutcome::Error(msg) => (RunStatus::Error, msg),
            };
            finalize(
                &sessions_for_exec,
                &journal_for_exec,
                &broadcaster_for_exec,
                &session_for_exec,
                Terminal::Completed { status, summary },
            )
            .await;
        });
        *session.executor_handle.lock().await = Some(executor_handle);

        Ok(())
    }

    pub async fn pause_test(&self, station: &str, employee_id: &str) -> Result<(), SessionError> {
        let session = self.get_active(station).await?;
        {
            let mut state = session.state.write().await;
            if *state != SessionState::Running {
                return Err(SessionError::InvalidTransition {
                    expected: "running",
                    actual: *state,
                });
            }
            *state = SessionState::Paused;
        }
        session.pausable_router.pause();
        self.journal
            .record_test_event(&session.test_run_id, "paused", Some(employee_id), None)
            .await
            .ok();
        self.journal
            .set_station_state(station, "paused", Some(&session.test_run_id))
            .await
            .ok();
        Ok(())
    }

    pub async fn resume_test(&self, station: &str, employee_id: &str) -> Result<(), SessionError> {
        let session = self.get_active(station).await?;
        {
            let mut state = session.state.write().await;
            if *state != SessionState::Paused {
                return Err(SessionError::InvalidTransition {
                    expected: "paused",
                    actual: *state,
                });
            }
            *state = SessionState::Running;
        }
        session.pausable_router.resume();
        self.journal
            .record_test_event(&session.test_run_id, "resumed", Some(employee_id), None)
            .await
            .ok();
        self.journal
            .set_station_state(station, "running", Some(&session.test_run_id))
            .await
            .ok();
        Ok(())
    }

    /// Cancels the executor and waits for it to exit; preserves all
    /// recorded data. If the session was paused, resumes first so the
    /// executor can observe cancellation at its next suspension point.
    pub async fn terminate_test(&self, station: &str, employee_id: &str, reason: &str) -> Result<(), SessionError> {
        let session = self.get_active(station).await?;
        self.ensure_resumed_for_shutdown(&session).await?;

        session.cancel.cancel();
        if let Some(handle) = session.executor_handle.lock().await.take() {
            let _ = handle.await;
        }
        finalize(
            &self.sessions,
            &self.journal,
            &self.broadcaster,
            &session,
            Terminal::Terminated {
                employee_id: employee_id.to_owned(),
                reason: reason.to_owned(),
            },
        )
        .await;
        if let Some(handle) = session.sampler_handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Cancels the executor, waits, and deletes the test run and all of
    /// its recorded artifacts.
    pub async fn abort_test(&self, station: &str, _employee_id: &str) -> Result<(), SessionError> {
        let session = self.get_active(station).await?;
        self.ensure_resumed_for_shutdown(&session).await?;

        session.cancel.cancel();
        if let Some(handle) = session.executor_handle.lock().await.take() {
            let _ = handle.await;
        }
        finalize(&self.sessions, &self.journal, &self.broadcaster, &session, Terminal::Aborted).await;
        if let Some(handle) = session.sampler_handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn ensure_resumed_for_shutdown(&self, session: &Arc<Session>) -> Result<(), SessionError> {
        let mut state = session.state.write().await;
        match *state {
            SessionState::Completed | SessionState::Terminated | SessionState::Aborted => {
                Err(SessionError::InvalidTransition {
                    expected: "running or paused",
                    actual: *state,
                })
            }
            SessionState::Paused => {
                *state = SessionState::Running;
                drop(state);
                session.pausable_router.resume();
                Ok(())
            }
            SessionState::Running => Ok(()),
        }
    }

    /// Terminates every active session, as on a fleet-wide emergency stop.
    pub async fn emergency_stop_all(&self) {
        let stations: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for station in stations {
            if let Err(err) = self.terminate_test(&station, "system", "emergency stop").await {
                tracing::warn!(station, error = %err, "emergency stop termination failed");
            }
        }
    }

    pub async fn handle_heartbeat(&self, station: &str) {
        if !self.sessions.read().await.contains_key(station) {
            self.journal.set_station_state(station, "idle", None).await.ok();
        }
    }

    pub async fn handle_offline(&self, station: &str) {
        if self.sessions.read().await.contains_key(station) {
            if let Err(err) = self.terminate_test(station, "system", "station went offline").await {
                tracing::warn!(station, error = %err, "offline termination failed");
            }
        }
        self.journal.set_station_state(station, "offline", None).await.ok();
    }

    pub async fn has_active_test_for_rma(&self, rma_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .values()
            .any(|session| session.rma_id.as_deref() == Some(rma_id))
    }

    pub async fn active_station_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arturo_persistence::{CommandResultRow, TemperatureSample, TestEvent, TestRun};
    use arturo_router::{CommandResult, RouterError};
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeJournalState {
        runs: HashMap<String, TestRun>,
        events: HashMap<String, Vec<TestEvent>>,
        command_results: HashMap<String, Vec<CommandResultRow>>,
        temperatures: Vec<TemperatureSample>,
        station_states: HashMap<String, String>,
    }

    #[derive(Default)]
    struct FakeJournal {
        state: StdMutex<FakeJournalState>,
    }

    #[async_trait]
    impl Journal for FakeJournal {
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
            state.temperatures.retain(|t| t.device_id != id);
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

        async fn set_station_state(
            &self,
            instance: &str,
            state: &str,
            _current_run_id: Option<&str>,
        ) -> Result<(), sqlx::Error> {
            self.state
                .lock()
                .unwrap()
                .station_states
                .insert(instance.to_owned(), state.to_owned());
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

        async fn list_temperatures_since(
            &self,
            station_instance: &str,
            _since_secs: i64,
        ) -> Result<Vec<TemperatureSample>, sqlx::Error> {
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

    struct ConstantRouter;

    #[async_trait]
    impl CommandRouter for ConstantRouter {
        async fn send_command(
            &self,
            _cancel: &CancellationToken,
            _device_id: &str,
            _command_name: &str,
            _parameters: Option<Value>,
            _timeout_ms: Option<u64>,
        ) -> Result<CommandResult, RouterError> {
            Ok(CommandResult {
                success: true,
                response: Some("1".to_owned()),
                error: None,
                duration_ms: 1,
            })
        }
    }

    struct SleepyExecutor;

    #[async_trait]
    impl ScriptExecutor for SleepyExecutor {
        async fn run(&self, router: Arc<PausableRouter>, collector: Arc<ResultCollector>, cancel: CancellationToken) -> ExecutorOutcome {
            let result = router
                .send_command(&cancel, "PUMP-01", "pump_status", None, Some(1000))
                .await;
            if let Ok(result) = result {
                collector
                    .record_command_result("PUMP-01", "pump_status", result.success, result.response.as_deref(), result.duration_ms as i64)
                    .await;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(Duration::from_secs(10)) => {}
            }
            ExecutorOutcome::Finished
        }
    }

    fn make_manager(executor: Arc<dyn ScriptExecutor>) -> (SessionManager, Arc<FakeJournal>) {
        let journal = Arc::new(FakeJournal::default());
        let broadcaster = Arc::new(EventBroadcaster::new(32));
        let router_factory: Arc<RouterFactory> = Arc::new(|_station: &str| Arc::new(ConstantRouter) as Arc<dyn CommandRouter>);
        let manager = SessionManager::new(
            journal.clone(),
            broadcaster,
            router_factory,
            executor,
            Duration::from_millis(50),
            1000,
        );
        (manager, journal)
    }

    #[tokio::test]
    async fn two_concurrent_starts_cannot_both_succeed() {
        let (manager, _journal) = make_manager(Arc::new(NullScriptExecutor));
        let manager2 = manager.clone();
        let (first, second) = tokio::join!(
            manager.start_test("station-01", "PUMP-01", "scripts/a.lua", Some("rma-1"), "run-1", "alice"),
            manager2.start_test("station-01", "PUMP-01", "scripts/b.lua", Some("rma-1"), "run-2", "bob"),
        );
        let results = [first, second];
        let ok_count = results.iter().filter(|r| r.is_ok()).count();
        let rejected_count = results
            .iter()
            .filter(|r| matches!(r, Err(SessionError::AlreadyActive)))
            .count();
        assert_eq!(ok_count, 1, "exactly one concurrent start_test should succeed");
        assert_eq!(rejected_count, 1, "the other concurrent start_test should be rejected");
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_preserves_started_and_terminated_events_and_command_results() {
        let (manager, journal) = make_manager(Arc::new(SleepyExecutor));
        manager
            .start_test("station-01", "PUMP-01", "scripts/a.lua", Some("rma-1"), "run-1", "alice")
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        manager.terminate_test("station-01", "alice", "operator stop").await.unwrap();

        let run = journal.get_test_run("run-1").await.unwrap().expect("run persisted");
        assert_eq!(run.status, "terminated");

        let events = journal.list_events_for_run("run-1").await.unwrap();
        let event_types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(event_types.contains(&"started"));
        assert!(event_types.contains(&"terminated"));

        let results = journal.list_command_results_for_run("run-1").await.unwrap();
        assert!(!results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_discards_all_data() {
        let (manager, journal) = make_manager(Arc::new(SleepyExecutor));
        manager
            .start_test("station-01", "PUMP-01", "scripts/a.lua", Some("rma-1"), "run-1", "alice")
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        manager.abort_test("station-01", "alice").await.unwrap();

        assert!(journal.get_test_run("run-1").await.unwrap().is_none());
        assert!(journal.list_events_for_run("run-1").await.unwrap().is_empty());
        assert!(journal.list_command_results_for_run("run-1").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_keeps_running_while_paused() {
        let (manager, journal) = make_manager(Arc::new(SleepyExecutor));
        manager
            .start_test("station-01", "PUMP-01", "scripts/a.lua", None, "run-1", "alice")
            .await
            .unwrap();
        manager.pause_test("station-01", "alice").await.unwrap();

        tokio::time::advance(Duration::from_millis(220)).await;
        tokio::task::yield_now().await;

        let temps = journal.list_temperatures_since("station-01", 0).await.unwrap();
        assert!(temps.len() >= 2, "sampler should keep ticking while paused, got {}", temps.len());

        manager.terminate_test("station-01", "alice", "cleanup").await.unwrap();
    }

    #[tokio::test]
    async fn pause_on_non_running_session_is_rejected() {
        let (manager, _journal) = make_manager(Arc::new(NullScriptExecutor));
        let result = manager.pause_test("no-such-station", "alice").await;
        assert!(matches!(result, Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn has_active_test_for_rma_reflects_active_sessions() {
        let (manager, _journal) = make_manager(Arc::new(SleepyExecutor));
        manager
            .start_test("station-01", "PUMP-01", "scripts/a.lua", Some("rma-1"), "run-1", "alice")
            .await
            .unwrap();
        assert!(manager.has_active_test_for_rma("rma-1").await);
        assert!(!manager.has_active_test_for_rma("rma-2").await);
    }
}
