//! arturo-registry: authoritative in-process view of live stations and their
//! devices, with a staleness/offline lifecycle driven by heartbeat age.

use arturo_protocol::Heartbeat;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Online,
    Stale,
    Offline,
}

/// A detached, owned snapshot of one station. Safe to hand to callers: it
/// shares no storage with the registry's internal map.
#[derive(Debug, Clone, Serialize)]
pub struct Station {
    pub instance: String,
    pub devices: Vec<String>,
    pub status: LifecycleStatus,
    pub last_heartbeat_secs: i64,
    pub firmware_version: String,
    pub free_heap: u64,
    pub wifi_rssi: i32,
}

/// A detached, owned snapshot of one device.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub station_instance: String,
    pub command_stream: String,
    pub status: LifecycleStatus,
}

struct StationEntry {
    devices: HashSet<String>,
    status: LifecycleStatus,
    last_heartbeat_secs: i64,
    firmware_version: String,
    free_heap: u64,
    wifi_rssi: i32,
}

impl StationEntry {
    fn to_station(&self, instance: &str) -> Station {
        let mut devices: Vec<String> = self.devices.iter().cloned().collect();
        devices.sort();
        Station {
            instance: instance.to_owned(),
            devices,
            status: self.status,
            last_heartbeat_secs: self.last_heartbeat_secs,
            firmware_version: self.firmware_version.clone(),
            free_heap: self.free_heap,
            wifi_rssi: self.wifi_rssi,
        }
    }
}

pub struct Registry {
    stations: Arc<RwLock<HashMap<String, StationEntry>>>,
    stale_after: Duration,
    offline_after: Duration,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

impl Registry {
    pub fn new(stale_after: Duration, offline_after: Duration) -> Self {
        Self {
            stations: Arc::new(RwLock::new(HashMap::new())),
            stale_after,
            offline_after,
        }
    }

    /// Upserts the station record and reconciles its device set against
    /// the new heartbeat's device list, inserting new ids and removing ids
    /// no longer reported.
    pub async fn update_from_heartbeat(&self, instance: &str, payload: &Heartbeat) {
        let mut stations = self.stations.write().await;
        let new_devices: HashSet<String> = payload.devices.iter().cloned().collect();
        let entry = stations.entry(instance.to_owned()).or_insert_with(|| StationEntry {
            devices: HashSet::new(),
            status: LifecycleStatus::Online,
            last_heartbeat_secs: 0,
            firmware_version: String::new(),
            free_heap: 0,
            wifi_rssi: 0,
        });
        entry.devices = new_devices;
        entry.status = LifecycleStatus::Online;
        entry.last_heartbeat_secs = now_secs();
        entry.firmware_version = payload.firmware_version.clone();
        entry.free_heap = payload.free_heap;
        entry.wifi_rssi = payload.wifi_rssi;
    }

    /// Looks up a device by scanning stations for one owning it. No
    /// separate device index is kept, so there is only one source of
    /// truth for station/device membership.
    pub async fn lookup_device(&self, device_id: &str) -> Option<Device> {
        let stations = self.stations.read().await;
        for (instance, entry) in stations.iter() {
            if entry.devices.contains(device_id) {
                return Some(Device {
                    device_id: device_id.to_owned(),
                    station_instance: instance.clone(),
                    command_stream: arturo_protocol::command_stream_name(instance),
                    status: entry.status,
                });
            }
        }
        None
    }

    pub async fn list_stations(&self) -> Vec<Station> {
        let stations = self.stations.read().await;
        stations
            .iter()
            .map(|(instance, entry)| entry.to_station(instance))
            .collect()
    }

    pub async fn list_devices(&self) -> Vec<Device> {
        let stations = self.stations.read().await;
        let mut devices = Vec::new();
        for (instance, entry) in stations.iter() {
            for device_id in &entry.devices {
                devices.push(Device {
                    device_id: device_id.clone(),
                    station_instance: instance.clone(),
                    command_stream: arturo_protocol::command_stream_name(instance),
                    status: entry.status,
                });
            }
        }
        devices
    }

    /// Recomputes every station's lifecycle status from `now − last_heartbeat`.
    /// Never removes entries; only a subsequent heartbeat with a reduced
    /// device set does that.
    pub async fn run_health_check(&self, now_secs_value: i64) {
        let mut stations = self.stations.write().await;
        for entry in stations.values_mut() {
            let age = now_secs_value - entry.last_heartbeat_secs;
            entry.status = self.status_for_age(age);
        }
    }

    fn status_for_age(&self, age_secs: i64) -> LifecycleStatus {
        let age = Duration::from_secs(age_secs.max(0) as u64);
        if age < self.stale_after {
            LifecycleStatus::Online
        } else if age < self.offline_after {
            LifecycleStatus::Stale
        } else {
            LifecycleStatus::Offline
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn offline_after(&self) -> Duration {
        self.offline_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(devices: &[&str]) -> Heartbeat {
        Heartbeat {
            status: "ok".to_owned(),
            uptime_seconds: 1,
            devices: devices.iter().map(|s| (*s).to_owned()).collect(),
            device_types: None,
            free_heap: 1024,
            min_free_heap: None,
            wifi_rssi: -50,
            wifi_reconnects: None,
            redis_reconnects: None,
            commands_processed: None,
            commands_failed: None,
            last_error: None,
            watchdog_resets: None,
            firmware_version: "1.0.0".to_owned(),
        }
    }

    #[tokio::test]
    async fn reconciliation_across_two_stations() {
        let registry = Registry::new(Duration::from_secs(5), Duration::from_secs(15));

        registry
            .update_from_heartbeat("station-1", &heartbeat(&["dmm-1", "psu-1"]))
            .await;
        registry
            .update_from_heartbeat("station-2", &heartbeat(&["relay-1"]))
            .await;
        registry
            .update_from_heartbeat("station-1", &heartbeat(&["dmm-1"]))
            .await;

        let mut devices: Vec<String> = registry
            .list_devices()
            .await
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        devices.sort();
        assert_eq!(devices, vec!["dmm-1".to_owned(), "relay-1".to_owned()]);

        assert!(registry.lookup_device("psu-1").await.is_none());
        let relay = registry.lookup_device("relay-1").await.expect("relay present");
        assert_eq!(relay.station_instance, "station-2");
    }

    #[tokio::test]
    async fn liveness_thresholds() {
        let registry = Registry::new(Duration::from_secs(5), Duration::from_secs(15));
        registry.update_from_heartbeat("station-1", &heartbeat(&["dmm-1"])).await;

        let base_now = {
            let stations = registry.stations.read().await;
            stations.get("station-1").unwrap().last_heartbeat_secs
        };

        registry.run_health_check(base_now + 1).await;
        assert_eq!(
            registry.list_stations().await[0].status,
            LifecycleStatus::Online
        );

        registry.run_health_check(base_now + 6).await;
        assert_eq!(
            registry.list_stations().await[0].status,
            LifecycleStatus::Stale
        );

        registry.run_health_check(base_now + 16).await;
        assert_eq!(
            registry.list_stations().await[0].status,
            LifecycleStatus::Offline
        );
    }

    #[tokio::test]
    async fn health_check_lifecycle_with_recovery() {
        let registry = Registry::new(Duration::from_secs(5), Duration::from_secs(15));
        registry.update_from_heartbeat("station-1", &heartbeat(&["dmm-1"])).await;
        let base_now = now_secs();

        registry.run_health_check(base_now + 6).await;
        let stations = registry.list_stations().await;
        assert_eq!(stations[0].status, LifecycleStatus::Stale);
        let devices = registry.list_devices().await;
        assert_eq!(devices[0].status, LifecycleStatus::Stale);

        registry.run_health_check(base_now + 16).await;
        assert_eq!(
            registry.list_stations().await[0].status,
            LifecycleStatus::Offline
        );

        registry.update_from_heartbeat("station-1", &heartbeat(&["dmm-1"])).await;
        assert_eq!(
            registry.list_stations().await[0].status,
            LifecycleStatus::Online
        );
    }

    #[tokio::test]
    async fn detached_snapshots_do_not_alias_internal_state() {
        let registry = Registry::new(Duration::from_secs(5), Duration::from_secs(15));
        registry.update_from_heartbeat("station-1", &heartbeat(&["dmm-1"])).await;

        let mut stations = registry.list_stations().await;
        stations[0].devices.push("fabricated".to_owned());

        let fresh = registry.list_stations().await;
        assert_eq!(fresh[0].devices, vec!["dmm-1".to_owned()]);
    }
}
