//! arturo-controller: wires the coordination-layer crates together into one
//! running process — the background subscriber loops, tickers, and the
//! session/e-stop/poller components they feed.

pub mod config;

pub use config::{ConfigError, ControllerConfig};

use arturo_broadcast::{Event, EventBroadcaster};
use arturo_broker::BrokerGateway;
use arturo_dispatcher::Dispatcher;
use arturo_estop::EstopCoordinator;
use arturo_persistence::Journal;
use arturo_poller::Poller;
use arturo_protocol::{Payload, Source};
use arturo_registry::Registry;
use arturo_router::{CommandRouter, StationRouter};
use arturo_session::{NullScriptExecutor, RouterFactory, SessionManager};
use futures_util::StreamExt as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HEARTBEAT_CHANNEL: &str = "events:heartbeat";
const ESTOP_CHANNEL: &str = "events:emergency_stop";

/// Every long-lived component the controller wires together. `main` builds
/// one of these, spawns its background tasks, and waits on a shutdown
/// signal to cancel them.
#[derive(Clone)]
pub struct App {
    pub registry: Arc<Registry>,
    pub dispatcher: Dispatcher,
    pub broadcaster: Arc<EventBroadcaster<Event>>,
    pub session_manager: SessionManager,
    pub estop: Arc<EstopCoordinator>,
    pub poller: Arc<Poller>,
    /// The shared script-facing router, exposed for an eventual facade (or
    /// for tests that want to issue a command without going through a
    /// session).
    pub router: Arc<dyn CommandRouter>,
    broker: Arc<dyn BrokerGateway>,
    instance_id: String,
    health_check_interval: Duration,
}

impl App {
    /// Builds every component from `config` over the given broker and
    /// journal. Generic over both so tests can substitute
    /// `arturo-test-support`'s in-memory doubles for the real Redis/Postgres
    /// backends without touching this wiring.
    pub fn new(
        config: &ControllerConfig,
        broker: Arc<dyn BrokerGateway>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        let registry = Arc::new(Registry::new(
            Duration::from_secs(config.registry.stale_after_secs),
            Duration::from_secs(config.registry.offline_after_secs),
        ));
        let dispatcher = Dispatcher::new();
        let broadcaster = Arc::new(EventBroadcaster::with_buffer(256, 200));

        let source = Source {
            service: "controller".to_owned(),
            instance: config.instance_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        };

        let default_timeout = Duration::from_millis(config.commands.default_timeout_ms);
        let shared_router: Arc<dyn CommandRouter> = Arc::new(StationRouter::new(
            broker.clone(),
            dispatcher.clone(),
            registry.clone(),
            source,
            default_timeout,
        ));
        let router_factory: Arc<RouterFactory> = {
            let shared_router = shared_router.clone();
            Arc::new(move |_station: &str| shared_router.clone())
        };

        let session_manager = SessionManager::new(
            journal.clone(),
            broadcaster.clone(),
            router_factory,
            Arc::new(NullScriptExecutor),
            Duration::from_secs(config.sampler.interval_secs),
            config.sampler.timeout_ms,
        );

        let estop_session_manager = session_manager.clone();
        let estop_broadcaster = broadcaster.clone();
        let estop = Arc::new(EstopCoordinator::new(move |event| {
            estop_broadcaster.publish(Event::EstopActivated {
                reason: format!("{:?}", event.reason),
                description: event.description.clone(),
                initiator: event.initiator.clone(),
            });
            let session_manager = estop_session_manager.clone();
            tokio::spawn(async move {
                session_manager.emergency_stop_all().await;
            });
        }));

        let poller = Arc::new(Poller::new(
            registry.clone(),
            shared_router.clone(),
            broadcaster.clone(),
            Duration::from_secs(config.poller.interval_secs),
            config.poller.command_timeout_ms,
        ));

        Self {
            registry,
            dispatcher,
            broadcaster,
            session_manager,
            estop,
            poller,
            router: shared_router,
            broker,
            instance_id: config.instance_id.clone(),
            health_check_interval: Duration::from_secs(config.registry.health_check_interval_secs),
        }
    }

    /// Spawns every background task described in the concurrency model:
    /// heartbeat subscriber, command-response subscriber, e-stop subscriber,
    /// registry health-check ticker, and the poller ticker. Each observes
    /// `cancel` and returns when it fires.
    pub fn spawn_background_tasks(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(heartbeat_loop(
                self.broker.clone(),
                self.registry.clone(),
                self.session_manager.clone(),
                cancel.clone(),
            )),
            tokio::spawn(response_loop(
                self.broker.clone(),
                self.dispatcher.clone(),
                self.instance_id.clone(),
                cancel.clone(),
            )),
            tokio::spawn(estop_loop(self.broker.clone(), self.estop.clone(), cancel.clone())),
            tokio::spawn(health_check_loop(
                self.registry.clone(),
                self.session_manager.clone(),
                self.health_check_interval,
                cancel.clone(),
            )),
            {
                let poller = self.poller.clone();
                tokio::spawn(async move { poller.run(cancel).await })
            },
        ]
    }
}

/// Subscribes to `events:heartbeat`, feeding every decoded heartbeat into
/// the registry and the session manager's liveness hook.
async fn heartbeat_loop(
    broker: Arc<dyn BrokerGateway>,
    registry: Arc<Registry>,
    session_manager: SessionManager,
    cancel: CancellationToken,
) {
    let mut stream = match broker.pubsub_subscribe(HEARTBEAT_CHANNEL, cancel.clone()).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "failed to subscribe to heartbeat channel");
            return;
        }
    };
    while let Some(bytes) = stream.next().await {
        match arturo_protocol::decode(&bytes) {
            Ok(envelope) => {
                if let Payload::Heartbeat(heartbeat) = &envelope.payload {
                    registry
                        .update_from_heartbeat(&envelope.source.instance, heartbeat)
                        .await;
                    session_manager.handle_heartbeat(&envelope.source.instance).await;
                }
            }
            Err(error) => tracing::warn!(%error, "dropping malformed heartbeat envelope"),
        }
    }
}

/// Reads this controller instance's response stream and routes every
/// decoded envelope to the dispatcher by correlation id.
async fn response_loop(
    broker: Arc<dyn BrokerGateway>,
    dispatcher: Dispatcher,
    instance_id: String,
    cancel: CancellationToken,
) {
    let stream_name = arturo_protocol::response_stream_name(&instance_id);
    let mut after_id = "$".to_owned();
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let entries = match broker
            .stream_read_block(&stream_name, &after_id, Duration::from_secs(5), &cancel)
            .await
        {
            Ok(entries) => entries,
            Err(arturo_broker::BrokerError::Cancelled) => return,
            Err(error) => {
                tracing::warn!(%error, "response stream read failed");
                continue;
            }
        };
        for entry in entries {
            after_id = entry.entry_id;
            match arturo_protocol::decode(&entry.payload) {
                Ok(envelope) => dispatcher.dispatch(envelope).await,
                Err(error) => tracing::warn!(%error, "dropping malformed response envelope"),
            }
        }
    }
}

/// Subscribes to the fleet-wide e-stop channel and forwards every decoded
/// message to the coordinator, which drives the session-termination fan-out.
async fn estop_loop(broker: Arc<dyn BrokerGateway>, estop: Arc<EstopCoordinator>, cancel: CancellationToken) {
    let mut stream = match broker.pubsub_subscribe(ESTOP_CHANNEL, cancel.clone()).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "failed to subscribe to emergency-stop channel");
            return;
        }
    };
    while let Some(bytes) = stream.next().await {
        match arturo_protocol::decode(&bytes) {
            Ok(envelope) => {
                if let Err(error) = estop.handle_message(&envelope).await {
                    tracing::warn!(%error, "dropping non-estop envelope on estop channel");
                }
            }
            Err(error) => tracing::warn!(%error, "dropping malformed emergency_stop envelope"),
        }
    }
}

/// Periodically recomputes station liveness and reconciles sessions whose
/// station has gone offline since the last tick.
async fn health_check_loop(
    registry: Arc<Registry>,
    session_manager: SessionManager,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {},
        }
        let now = chrono::Utc::now().timestamp();
        registry.run_health_check(now).await;
        for station in registry.list_stations().await {
            if station.status == arturo_registry::LifecycleStatus::Offline {
                session_manager.handle_offline(&station.instance).await;
            }
        }
    }
}

/// Cooperatively shuts down a fleet of task handles: cancels `cancel`, then
/// awaits every handle so no task is left running after this returns.
pub async fn shutdown(cancel: CancellationToken, handles: Vec<JoinHandle<()>>) {
    cancel.cancel();
    for handle in handles {
        if let Err(error) = handle.await {
            tracing::warn!(%error, "background task panicked during shutdown");
        }
    }
}
