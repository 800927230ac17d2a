mod ingestor;
mod threshold;


pub use threshold::{AlarmEvent, Breach, ThresholdEvaluator};

use crate::pipeline::IngestStats;
use crate::republish::Republisher;
use crate::store::{DeviceDirectory, HistoryStore, KeyRegistry, LatestValueStore, ThresholdSource};
use std::sync::Arc;

/// Everything the ingestor reads from or writes to.
#[derive(Clone)]
pub struct IngestStores {
    pub directory: Arc<dyn DeviceDirectory>,
    pub keys: Arc<dyn KeyRegistry>,
    pub latest: Arc<dyn LatestValueStore>,
    pub history: Arc<dyn HistoryStore>,
    pub thresholds: Arc<dyn ThresholdSource>,
}

#[derive(Clone)]
pub struct TelemetryIngestor {
    directory: Arc<dyn DeviceDirectory>,
    keys: Arc<dyn KeyRegistry>,
    latest: Arc<dyn LatestValueStore>,
    history: Arc<dyn HistoryStore>,
    thresholds: ThresholdEvaluator,
    republisher: Republisher,
    device_prefix: Arc<str>,
    stats: Arc<IngestStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    ForeignTopic,
    Empty,
    Malformed,
    UnknownDevice,
    DirectoryUnavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageOutcome {
    pub device_id: String,
    pub asset_id: String,
    pub keys_ensured: usize,
    pub stored: usize,
    pub appended: usize,
    pub skipped: usize,
    pub alarms: Vec<AlarmEvent>,
    pub republished: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Dropped(DropReason),
    Processed(MessageOutcome),
}
