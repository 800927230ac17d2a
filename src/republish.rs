use crate::ingest::AlarmEvent;
use crate::mqtt::Broker;
use crate::pipeline::IngestStats;
use crate::telemetry::{alarm_topic, asset_topic};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

/// Best-effort side channel to live consumers. Failures are logged and
/// counted, never returned.
#[derive(Clone)]
pub struct Republisher {
    broker: Arc<dyn Broker>,
    asset_prefix: Arc<str>,
    publish_alarms: bool,
    stats: Arc<IngestStats>,
}

impl Republisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        asset_prefix: &str,
        publish_alarms: bool,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            broker,
            asset_prefix: asset_prefix.into(),
            publish_alarms,
            stats,
        }
    }

    /// Forwards the device payload unchanged to `{prefix}/{asset_id}/telemetry`.
    pub async fn publish_telemetry(&self, asset_id: &str, payload: Bytes) -> bool {
        let topic = asset_topic(&self.asset_prefix, asset_id);
        self.send(topic, payload).await
    }

    pub async fn publish_alarm(
        &self,
        alarm: &AlarmEvent,
        device_id: &str,
        observed_at: DateTime<Utc>,
    ) -> bool {
        if !self.publish_alarms {
            return false;
        }
        let body = json!({
            "asset_id": alarm.asset_id,
            "device_id": device_id,
            "key": alarm.key,
            "value": alarm.value,
            "min": alarm.min,
            "max": alarm.max,
            "breach": alarm.breach,
            "observed_at": observed_at.to_rfc3339(),
        });
        let payload = match serde_json::to_vec(&body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode alarm payload");
                return false;
            }
        };
        let topic = alarm_topic(&self.asset_prefix, &alarm.asset_id);
        self.send(topic, Bytes::from(payload)).await
    }

    async fn send(&self, topic: String, payload: Bytes) -> bool {
        match self.broker.publish(&topic, payload).await {
            Ok(()) => {
                IngestStats::incr(&self.stats.republished);
                true
            }
            Err(err) => {
                IngestStats::incr(&self.stats.republish_failures);
                tracing::warn!(topic = %topic, error = %err, "republish failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Breach;
    use crate::test_support::RecordingBroker;
    use std::sync::atomic::Ordering;

    fn alarm() -> AlarmEvent {
        AlarmEvent {
            asset_id: "A1".into(),
            key: "temp".into(),
            value: 25.0,
            min: Some(10.0),
            max: Some(20.0),
            breach: Breach::AboveMax,
        }
    }

    #[tokio::test]
    async fn alarm_payload_carries_device_and_breach() {
        let broker = Arc::new(RecordingBroker::new());
        let stats = Arc::new(IngestStats::new());
        let republisher = Republisher::new(broker.clone(), "assets", true, stats.clone());

        assert!(republisher.publish_alarm(&alarm(), "D1", Utc::now()).await);
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "assets/A1/alarms");
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).expect("json");
        assert_eq!(body["device_id"], "D1");
        assert_eq!(body["breach"], "above_max");
        assert_eq!(body["max"], 20.0);
        assert_eq!(stats.republished.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn disabled_alarm_publishing_sends_nothing() {
        let broker = Arc::new(RecordingBroker::new());
        let republisher =
            Republisher::new(broker.clone(), "assets", false, Arc::new(IngestStats::new()));
        assert!(!republisher.publish_alarm(&alarm(), "D1", Utc::now()).await);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn broker_failure_is_counted_not_returned() {
        let broker = Arc::new(RecordingBroker::new());
        broker.fail_publish(true);
        let stats = Arc::new(IngestStats::new());
        let republisher = Republisher::new(broker.clone(), "assets", true, stats.clone());
        assert!(!republisher.publish_telemetry("A1", Bytes::from_static(b"{}")).await);
        assert_eq!(stats.republish_failures.load(Ordering::Relaxed), 1);
    }
}
