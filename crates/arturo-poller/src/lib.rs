//! arturo-poller: background sampler for pump-family devices, driving live
//! telemetry independent of active test sessions.
//!
//! Structurally the same ticker shape the donor uses for its forwarder
//! heartbeat interval, generalized into a standalone task since the poller
//! has no socket to share a `select!` with.

use arturo_broadcast::{Event, EventBroadcaster};
use arturo_registry::{LifecycleStatus, Registry};
use arturo_router::CommandRouter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn is_pump_device(device_id: &str) -> bool {
    device_id.starts_with("PUMP-") || device_id.starts_with("CTI-")
}

pub struct Poller {
    registry: Arc<Registry>,
    router: Arc<dyn CommandRouter>,
    broadcaster: Arc<EventBroadcaster<Event>>,
    interval: Duration,
    command_timeout_ms: u64,
}

impl Poller {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<dyn CommandRouter>,
        broadcaster: Arc<EventBroadcaster<Event>>,
        interval: Duration,
        command_timeout_ms: u64,
    ) -> Self {
        Self {
            registry,
            router,
            broadcaster,
            interval,
            command_timeout_ms,
        }
    }

    /// Runs the sample loop until `cancel` fires. Never mutates the
    /// registry — it consumes the router exactly like a script would.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.poll_once(&cancel).await,
            }
        }
    }

    async fn poll_once(&self, cancel: &CancellationToken) {
        let stations = self.registry.list_stations().await;
        for station in stations {
            if station.status != LifecycleStatus::Online {
                continue;
            }
            for device_id in &station.devices {
                if is_pump_device(device_id) {
                    self.sample_device(cancel, &station.instance, device_id).await;
                }
            }
        }
    }

    async fn sample_device(&self, cancel: &CancellationToken, station: &str, device_id: &str) {
        let status_s1 = self.query(cancel, device_id, "get_status_s1").await;
        let status_s2 = self.query(cancel, device_id, "get_status_s2").await;
        let status_s3 = self.query(cancel, device_id, "get_status_s3").await;
        let regen_status = self.query(cancel, device_id, "get_regen_status").await;
        let regen_active = regen_status.as_deref().map(|s| s.trim() != "0");

        self.broadcaster.publish(Event::PumpStatus {
            station: station.to_owned(),
            device_id: device_id.to_owned(),
            status_s1,
            status_s2,
            status_s3,
            regen_active,
        });

        for (stage, command) in [(1u8, "get_temp_1st_stage"), (2u8, "get_temp_2nd_stage")] {
            if let Some(response) = self.query(cancel, device_id, command).await {
                match response.trim().parse::<f64>() {
                    Ok(temperature_k) => self.broadcaster.publish(Event::Temperature {
                        station: station.to_owned(),
                        device_id: device_id.to_owned(),
                        stage,
                        temperature_k,
                    }),
                    Err(_) => {
                        tracing::warn!(device_id, command, response, "non-numeric temperature response");
                    }
                }
            }
        }
    }

    /// Issues one query and returns its response string, logging and
    /// returning `None` on any failure so a single bad device never aborts
    /// the cycle for the rest of the fleet.
    async fn query(&self, cancel: &CancellationToken, device_id: &str, command_name: &str) -> Option<String> {
        match self
            .router
            .send_command(cancel, device_id, command_name, None, Some(self.command_timeout_ms))
            .await
        {
            Ok(result) if result.success => result.response,
            Ok(result) => {
                tracing::warn!(device_id, command_name, error = ?result.error, "poll command failed");
                None
            }
            Err(err) => {
                tracing::warn!(device_id, command_name, error = %err, "poll command error");
                None
            }
        }
    }
}
