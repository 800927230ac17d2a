use bytes::Bytes;
use chrono::{DateTime, Utc};
use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;
use thiserror::Error;

const TELEMETRY_SUFFIX: &str = "telemetry";
const ALARMS_SUFFIX: &str = "alarms";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("topic {0:?} is not a device telemetry topic")]
    Topic(String),
    #[error("malformed telemetry payload: {0}")]
    Malformed(#[from] simd_json::Error),
}

/// One publish as handed from the connection to a worker lane.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTelemetry {
    pub device_id: String,
    /// Numeric fields, sorted by key.
    pub readings: Vec<(String, f64)>,
    /// Keys whose value was not a JSON number.
    pub skipped: Vec<String>,
}

pub fn device_topic(prefix: &str, device_id: &str) -> String {
    format!("{prefix}/{device_id}/{TELEMETRY_SUFFIX}")
}

pub fn asset_topic(prefix: &str, asset_id: &str) -> String {
    format!("{prefix}/{asset_id}/{TELEMETRY_SUFFIX}")
}

pub fn alarm_topic(prefix: &str, asset_id: &str) -> String {
    format!("{prefix}/{asset_id}/{ALARMS_SUFFIX}")
}

/// Returns the device segment of `{prefix}/{device_id}/telemetry`.
pub fn parse_device_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let mut parts = topic.split('/');
    let (Some(head), Some(device), Some(tail), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    if head != prefix || tail != TELEMETRY_SUFFIX || device.trim().is_empty() {
        return None;
    }
    Some(device)
}

/// Decodes a device publish into its numeric readings.
///
/// `Ok(None)` means the message carries nothing to store: an empty body, a
/// JSON value that is not an object, or an object without fields. Malformed
/// JSON is an error so the caller can log it; it is never retried.
pub fn decode(
    topic_prefix: &str,
    topic: &str,
    payload: &[u8],
) -> Result<Option<DecodedTelemetry>, DecodeError> {
    let device_id = parse_device_topic(topic_prefix, topic)
        .ok_or_else(|| DecodeError::Topic(topic.to_string()))?;

    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    // simd-json parses in place.
    let mut buf = payload.to_vec();
    let value = simd_json::to_borrowed_value(&mut buf)?;
    let BorrowedValue::Object(fields) = value else {
        return Ok(None);
    };
    if fields.is_empty() {
        return Ok(None);
    }

    let mut readings = Vec::with_capacity(fields.len());
    let mut skipped = Vec::new();
    for (key, value) in fields.iter() {
        match numeric_value(value) {
            Some(number) => readings.push((key.to_string(), number)),
            None => skipped.push(key.to_string()),
        }
    }
    readings.sort_by(|a, b| a.0.cmp(&b.0));
    skipped.sort();

    Ok(Some(DecodedTelemetry {
        device_id: device_id.to_string(),
        readings,
        skipped,
    }))
}

fn numeric_value(value: &BorrowedValue<'_>) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
        .filter(|v| v.is_finite())
}
