//! In-memory stand-ins for the stores and the broker.

use crate::config::Config;
use crate::mqtt::{Broker, BrokerError};
use crate::store::{
    DeviceDirectory, DeviceRecord, HistoricalReading, HistoryQuery, HistoryStore, KeyRef,
    KeyRegistry, LatestReading, LatestValueStore, StoreError, StoreResult, Threshold,
    ThresholdSource,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://localhost/farm_test".into(),
        history_database_url: "postgres://localhost/farm_test".into(),
        db_pool_size: 2,
        history_pool_size: 2,
        apply_schema: false,
        mqtt_host: "127.0.0.1".into(),
        mqtt_port: 1883,
        mqtt_username: None,
        mqtt_password: None,
        mqtt_client_id: "farm-telemetry-ingest-test".into(),
        mqtt_keepalive_secs: 30,
        mqtt_connect_timeout_secs: 5,
        mqtt_request_timeout_ms: 500,
        mqtt_startup_attempts: 3,
        mqtt_reconnect_max_secs: 1,
        device_topic_prefix: "devices".into(),
        asset_topic_prefix: "assets".into(),
        worker_lanes: 2,
        lane_capacity: 16,
        shutdown_drain_secs: 1,
        directory_poll_secs: 0,
        threshold_cache_ttl_secs: 0,
        publish_alarms: true,
        enable_grpc: false,
        grpc_socket_path: "/tmp/farm_telemetry_ingest_test.sock".into(),
        otlp_endpoint: None,
    }
}

#[derive(Default)]
struct MemoryState {
    devices: BTreeMap<String, DeviceRecord>,
    keys: HashMap<String, KeyRef>,
    // What a caching registry remembers; survives `remove_key` until forgotten.
    cached_keys: HashMap<String, KeyRef>,
    next_key_id: i32,
    associations: HashSet<(String, String)>,
    latest: BTreeMap<(String, String), LatestReading>,
    history: Vec<HistoricalReading>,
    thresholds: HashMap<(String, String), Threshold>,
}

/// Implements every store trait over one mutex-guarded state, with call
/// counters and per-store failure switches.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    ensure_key_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
    append_calls: AtomicUsize,
    device_lookups: AtomicUsize,
    threshold_lookups: AtomicUsize,
    forgotten_keys: AtomicUsize,
    fail_directory: AtomicBool,
    fail_keys: AtomicBool,
    fail_latest: AtomicBool,
    fail_history: AtomicBool,
    fail_thresholds: AtomicBool,
}

fn injected(what: &str) -> StoreError {
    StoreError::Unavailable(format!("injected {what} failure"))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_device(&self, device_id: &str, asset_id: &str) {
        self.state().devices.insert(
            device_id.to_string(),
            DeviceRecord {
                device_id: device_id.to_string(),
                name: format!("device {device_id}"),
                asset_id: asset_id.to_string(),
                is_gateway: false,
            },
        );
    }

    pub fn remove_device(&self, device_id: &str) {
        let mut state = self.state();
        state.devices.remove(device_id);
        state.latest.retain(|(device, _), _| device != device_id);
    }

    /// Administrative key cleanup: the row and everything referencing it go,
    /// the registry cache does not.
    pub fn remove_key(&self, name: &str) {
        let mut state = self.state();
        state.keys.remove(name);
        state.latest.retain(|(_, key), _| key != name);
        state.associations.retain(|(_, key)| key != name);
    }

    pub fn set_threshold(&self, asset_id: &str, key: &str, min: Option<f64>, max: Option<f64>) {
        self.state().thresholds.insert(
            (asset_id.to_string(), key.to_string()),
            Threshold {
                min,
                max,
                modified_at: Some(Utc::now()),
            },
        );
    }

    pub fn fail_directory(&self, fail: bool) {
        self.fail_directory.store(fail, Ordering::SeqCst);
    }

    pub fn fail_keys(&self, fail: bool) {
        self.fail_keys.store(fail, Ordering::SeqCst);
    }

    pub fn fail_latest(&self, fail: bool) {
        self.fail_latest.store(fail, Ordering::SeqCst);
    }

    pub fn fail_history(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    pub fn fail_thresholds(&self, fail: bool) {
        self.fail_thresholds.store(fail, Ordering::SeqCst);
    }

    pub fn latest_rows(&self) -> Vec<LatestReading> {
        self.state().latest.values().cloned().collect()
    }

    pub fn history_rows(&self) -> Vec<HistoricalReading> {
        self.state().history.clone()
    }

    pub fn key_names(&self) -> BTreeSet<String> {
        self.state().keys.keys().cloned().collect()
    }

    pub fn asset_keys(&self, asset_id: &str) -> BTreeSet<String> {
        self.state()
            .associations
            .iter()
            .filter(|(asset, _)| asset == asset_id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn ensure_key_calls(&self) -> usize {
        self.ensure_key_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn device_lookups(&self) -> usize {
        self.device_lookups.load(Ordering::SeqCst)
    }

    pub fn threshold_lookups(&self) -> usize {
        self.threshold_lookups.load(Ordering::SeqCst)
    }

    pub fn forgotten_keys(&self) -> usize {
        self.forgotten_keys.load(Ordering::SeqCst)
    }

    /// True when nothing was written to any store.
    pub fn is_pristine(&self) -> bool {
        let state = self.state();
        state.keys.is_empty()
            && state.associations.is_empty()
            && state.latest.is_empty()
            && state.history.is_empty()
    }
}

#[async_trait]
impl DeviceDirectory for MemoryStore {
    async fn list_devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        if self.fail_directory.load(Ordering::SeqCst) {
            return Err(injected("directory"));
        }
        Ok(self.state().devices.values().cloned().collect())
    }

    async fn lookup_device(&self, device_id: &str) -> StoreResult<Option<DeviceRecord>> {
        self.device_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_directory.load(Ordering::SeqCst) {
            return Err(injected("directory"));
        }
        Ok(self.state().devices.get(device_id).cloned())
    }
}

#[async_trait]
impl KeyRegistry for MemoryStore {
    async fn ensure_key(&self, name: &str) -> StoreResult<KeyRef> {
        self.ensure_key_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_keys.load(Ordering::SeqCst) {
            return Err(injected("key registry"));
        }
        let existing = {
            let state = self.state();
            state
                .cached_keys
                .get(name)
                .or_else(|| state.keys.get(name))
                .cloned()
        };
        if let Some(found) = existing {
            return Ok(found);
        }
        // Let racing callers interleave between the miss and the insert.
        tokio::task::yield_now().await;
        let mut state = self.state();
        let key = match state.keys.get(name) {
            Some(found) => found.clone(),
            None => {
                state.next_key_id += 1;
                let key = KeyRef {
                    id: state.next_key_id,
                    name: name.to_string(),
                };
                state.keys.insert(name.to_string(), key.clone());
                key
            }
        };
        state.cached_keys.insert(name.to_string(), key.clone());
        Ok(key)
    }

    async fn ensure_asset_association(&self, asset_id: &str, key: &KeyRef) -> StoreResult<()> {
        if self.fail_keys.load(Ordering::SeqCst) {
            return Err(injected("key registry"));
        }
        let mut state = self.state();
        if !state.keys.contains_key(&key.name) {
            return Err(StoreError::MissingKey(key.name.clone()));
        }
        state
            .associations
            .insert((asset_id.to_string(), key.name.clone()));
        Ok(())
    }

    async fn forget_key(&self, name: &str) {
        self.forgotten_keys.fetch_add(1, Ordering::SeqCst);
        self.state().cached_keys.remove(name);
    }
}

#[async_trait]
impl LatestValueStore for MemoryStore {
    async fn upsert(
        &self,
        device_id: &str,
        key: &KeyRef,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_latest.load(Ordering::SeqCst) {
            return Err(injected("latest"));
        }
        let mut state = self.state();
        if !state.keys.contains_key(&key.name) {
            return Err(StoreError::MissingKey(key.name.clone()));
        }
        state.latest.insert(
            (device_id.to_string(), key.name.clone()),
            LatestReading {
                device_id: device_id.to_string(),
                key: key.name.clone(),
                value,
                observed_at,
            },
        );
        Ok(())
    }

    async fn latest_for_device(&self, device_id: &str) -> StoreResult<Vec<LatestReading>> {
        Ok(self
            .state()
            .latest
            .values()
            .filter(|row| row.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn latest_for_asset(&self, asset_id: &str) -> StoreResult<Vec<LatestReading>> {
        let state = self.state();
        let mut newest: BTreeMap<String, LatestReading> = BTreeMap::new();
        for row in state.latest.values() {
            let owned = state
                .devices
                .get(&row.device_id)
                .is_some_and(|device| device.asset_id == asset_id);
            if !owned {
                continue;
            }
            match newest.get(&row.key) {
                Some(current) if current.observed_at >= row.observed_at => {}
                _ => {
                    newest.insert(row.key.clone(), row.clone());
                }
            }
        }
        Ok(newest.into_values().collect())
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(
        &self,
        device_id: &str,
        key: &str,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(injected("history"));
        }
        self.state().history.push(HistoricalReading {
            device_id: device_id.to_string(),
            key: key.to_string(),
            value,
            observed_at,
        });
        Ok(())
    }

    async fn range(&self, query: &HistoryQuery) -> StoreResult<Vec<HistoricalReading>> {
        let mut rows = self
            .state()
            .history
            .iter()
            .filter(|row| row.device_id == query.device_id)
            .filter(|row| query.key.as_deref().map_or(true, |key| row.key == key))
            .filter(|row| row.observed_at >= query.from && row.observed_at <= query.to)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
        rows.truncate(query.limit.max(1) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl ThresholdSource for MemoryStore {
    async fn threshold(&self, asset_id: &str, key: &str) -> StoreResult<Option<Threshold>> {
        self.threshold_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_thresholds.load(Ordering::SeqCst) {
            return Err(injected("threshold"));
        }
        Ok(self
            .state()
            .thresholds
            .get(&(asset_id.to_string(), key.to_string()))
            .copied())
    }
}

/// Broker double with set semantics for subscriptions, like a real broker
/// session: subscribing twice to a topic still delivers once.
#[derive(Default)]
pub struct RecordingBroker {
    subscriptions: Mutex<BTreeSet<String>>,
    published: Mutex<Vec<(String, Bytes)>>,
    subscribe_calls: AtomicUsize,
    fail_subscribe: AtomicBool,
    fail_publish: AtomicBool,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.subscriptions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Clean-session reconnect: the broker forgets every subscription.
    pub fn drop_session(&self) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.clear();
        }
    }

    /// How many copies of one publish on `topic` this session would receive.
    pub fn deliveries(&self, topic: &str) -> usize {
        usize::from(self.subscriptions().contains(topic))
    }

    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BrokerError::Timeout(Duration::ZERO));
        }
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.insert(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.remove(topic);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Timeout(Duration::ZERO));
        }
        if let Ok(mut published) = self.published.lock() {
            published.push((topic.to_string(), payload));
        }
        Ok(())
    }
}
