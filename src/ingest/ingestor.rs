use super::{
    AlarmEvent, Disposition, DropReason, IngestStores, MessageOutcome, TelemetryIngestor,
    ThresholdEvaluator,
};
use crate::pipeline::IngestStats;
use crate::republish::Republisher;
use crate::store::{
    DeviceRecord, HistoricalReading, HistoryQuery, KeyRef, LatestReading, StoreResult,
};
use crate::telemetry::{decode, DecodeError, InboundMessage};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
struct ReadingOutcome {
    key_ensured: bool,
    stored: bool,
    appended: bool,
    alarm: Option<AlarmEvent>,
}

impl TelemetryIngestor {
    pub fn new(
        stores: IngestStores,
        republisher: Republisher,
        device_prefix: &str,
        threshold_ttl: Duration,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            directory: stores.directory,
            keys: stores.keys,
            latest: stores.latest,
            history: stores.history,
            thresholds: ThresholdEvaluator::new(stores.thresholds, threshold_ttl),
            republisher,
            device_prefix: device_prefix.into(),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Runs one publish through decode, persistence, alarm checks and
    /// republish. Every failure is logged and counted here; nothing escapes.
    #[tracing::instrument(level = "debug", skip_all, fields(topic = %message.topic))]
    pub async fn handle_message(&self, message: InboundMessage) -> Disposition {
        let decoded = match decode(&self.device_prefix, &message.topic, &message.payload) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                tracing::debug!(topic = %message.topic, "empty or non-object telemetry payload");
                return self.dropped(DropReason::Empty);
            }
            Err(DecodeError::Topic(topic)) => {
                tracing::debug!(topic = %topic, "ignoring publish on foreign topic");
                return self.dropped(DropReason::ForeignTopic);
            }
            Err(err) => {
                tracing::warn!(topic = %message.topic, error = %err, "dropping malformed telemetry");
                return self.dropped(DropReason::Malformed);
            }
        };

        for key in &decoded.skipped {
            tracing::warn!(device = %decoded.device_id, key = %key, "skipping non-numeric telemetry field");
        }
        self.stats
            .fields_skipped
            .fetch_add(decoded.skipped.len() as u64, Ordering::Relaxed);

        let device = match self.directory.lookup_device(&decoded.device_id).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                tracing::warn!(device = %decoded.device_id, "telemetry from unknown device; dropping");
                IngestStats::incr(&self.stats.unknown_devices);
                return self.dropped(DropReason::UnknownDevice);
            }
            Err(err) => {
                tracing::warn!(device = %decoded.device_id, error = %err, "device lookup failed; dropping telemetry");
                self.stats.record_store_error(format!("device lookup: {err}"));
                return self.dropped(DropReason::DirectoryUnavailable);
            }
        };

        let observed_at = message.received_at;
        let results = join_all(
            decoded
                .readings
                .iter()
                .map(|(key, value)| self.process_reading(&device, key, *value, observed_at)),
        )
        .await;

        let mut outcome = MessageOutcome {
            device_id: device.device_id.clone(),
            asset_id: device.asset_id.clone(),
            keys_ensured: 0,
            stored: 0,
            appended: 0,
            skipped: decoded.skipped.len(),
            alarms: Vec::new(),
            republished: false,
        };
        for result in results {
            outcome.keys_ensured += usize::from(result.key_ensured);
            outcome.stored += usize::from(result.stored);
            outcome.appended += usize::from(result.appended);
            outcome.alarms.extend(result.alarm);
        }

        // Persistence is already done; republish cannot undo or delay it.
        outcome.republished = self
            .republisher
            .publish_telemetry(&device.asset_id, message.payload.clone())
            .await;

        tracing::debug!(
            device = %outcome.device_id,
            name = %device.name,
            gateway = device.is_gateway,
            asset = %outcome.asset_id,
            keys = outcome.keys_ensured,
            stored = outcome.stored,
            appended = outcome.appended,
            skipped = outcome.skipped,
            alarms = outcome.alarms.len(),
            republished = outcome.republished,
            "processed telemetry"
        );
        Disposition::Processed(outcome)
    }

    fn dropped(&self, reason: DropReason) -> Disposition {
        IngestStats::incr(&self.stats.messages_dropped);
        Disposition::Dropped(reason)
    }

    async fn process_reading(
        &self,
        device: &DeviceRecord,
        key: &str,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> ReadingOutcome {
        let alarm_check = self.thresholds.check(&device.asset_id, key, value);

        let key_ref = match self.keys.ensure_key(key).await {
            Ok(key_ref) => key_ref,
            Err(err) => {
                tracing::warn!(device = %device.device_id, key = %key, error = %err, "key registry failed; skipping store writes");
                self.stats.record_store_error(format!("ensure key {key}: {err}"));
                let alarm = alarm_check.await;
                self.raise(alarm.as_ref(), device, observed_at).await;
                return ReadingOutcome {
                    alarm,
                    ..ReadingOutcome::default()
                };
            }
        };

        let (mut latest, history, mut association, alarm) = tokio::join!(
            self.latest
                .upsert(&device.device_id, &key_ref, value, observed_at),
            self.history
                .append(&device.device_id, &key_ref.name, value, observed_at),
            self.keys
                .ensure_asset_association(&device.asset_id, &key_ref),
            alarm_check,
        );

        // The key row was removed behind the registry cache. Register it
        // again and repeat the writes that depend on it, once.
        let missing = |result: &StoreResult<()>| result.as_ref().is_err_and(|err| err.is_missing_key());
        if missing(&latest) || missing(&association) {
            tracing::warn!(device = %device.device_id, key = %key, "measurement key missing from registry; re-registering");
            self.keys.forget_key(key).await;
            match self.keys.ensure_key(key).await {
                Ok(fresh) => {
                    (latest, association) = tokio::join!(
                        self.latest
                            .upsert(&device.device_id, &fresh, value, observed_at),
                        self.keys
                            .ensure_asset_association(&device.asset_id, &fresh),
                    );
                }
                Err(err) => latest = Err(err),
            }
        }

        let stored = self.settle(latest, "latest upsert", device, &key_ref);
        let appended = self.settle(history, "history append", device, &key_ref);
        self.settle(association, "asset association", device, &key_ref);
        if stored {
            IngestStats::incr(&self.stats.readings_stored);
        }
        if appended {
            IngestStats::incr(&self.stats.history_appended);
        }
        self.raise(alarm.as_ref(), device, observed_at).await;

        ReadingOutcome {
            key_ensured: true,
            stored,
            appended,
            alarm,
        }
    }

    fn settle(
        &self,
        result: StoreResult<()>,
        step: &str,
        device: &DeviceRecord,
        key: &KeyRef,
    ) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(device = %device.device_id, key = %key.name, error = %err, "{step} failed");
                self.stats.record_store_error(format!("{step} {}: {err}", key.name));
                false
            }
        }
    }

    async fn raise(
        &self,
        alarm: Option<&AlarmEvent>,
        device: &DeviceRecord,
        observed_at: DateTime<Utc>,
    ) {
        let Some(alarm) = alarm else {
            return;
        };
        tracing::warn!(
            device = %device.device_id,
            asset = %alarm.asset_id,
            key = %alarm.key,
            value = alarm.value,
            min = ?alarm.min,
            max = ?alarm.max,
            breach = ?alarm.breach,
            "threshold alarm"
        );
        IngestStats::incr(&self.stats.alarms_raised);
        self.republisher
            .publish_alarm(alarm, &device.device_id, observed_at)
            .await;
    }

    pub async fn latest_for_device(&self, device_id: &str) -> StoreResult<Vec<LatestReading>> {
        self.latest.latest_for_device(device_id).await
    }

    pub async fn latest_for_asset(&self, asset_id: &str) -> StoreResult<Vec<LatestReading>> {
        self.latest.latest_for_asset(asset_id).await
    }

    pub async fn history(&self, query: &HistoryQuery) -> StoreResult<Vec<HistoricalReading>> {
        self.history.range(query).await
    }
}
