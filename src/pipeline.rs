use crate::ingest::TelemetryIngestor;
use crate::telemetry::{parse_device_topic, InboundMessage};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct IngestStats {
    pub messages_received: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub queue_depth: AtomicU64,
    pub readings_stored: AtomicU64,
    pub history_appended: AtomicU64,
    pub fields_skipped: AtomicU64,
    pub unknown_devices: AtomicU64,
    pub store_errors: AtomicU64,
    pub alarms_raised: AtomicU64,
    pub republished: AtomicU64,
    pub republish_failures: AtomicU64,
    pub subscribed_topics: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_error(&self, err: impl Into<String>) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }
}

/// Cheap handle the connection uses to hand publishes to the worker lanes.
/// Never awaits, so the event loop keeps servicing keep-alives.
#[derive(Clone)]
pub struct PipelineHandle {
    lanes: Arc<[mpsc::Sender<InboundMessage>]>,
    device_prefix: Arc<str>,
    stats: Arc<IngestStats>,
}

impl PipelineHandle {
    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Messages from one device always land on the same lane.
    pub fn lane_for(&self, topic: &str) -> usize {
        let device = parse_device_topic(&self.device_prefix, topic).unwrap_or(topic);
        let mut hasher = DefaultHasher::new();
        device.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Returns false when the message was dropped (lane full or shut down).
    pub fn dispatch(&self, message: InboundMessage) -> bool {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        let lane = self.lane_for(&message.topic);
        // Counted before the send so a lane that dequeues immediately never
        // takes the gauge below zero.
        self.stats.queue_depth.fetch_add(1, Ordering::Relaxed);
        match self.lanes[lane].try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(message)) => {
                self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(lane, topic = %message.topic, "worker lane full; dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(message)) => {
                self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(lane, topic = %message.topic, "worker lanes closed; dropping message");
                false
            }
        }
    }
}

pub struct WorkerLanes {
    handles: Vec<JoinHandle<()>>,
}

pub fn spawn_lanes(
    ingestor: TelemetryIngestor,
    device_prefix: &str,
    lanes: usize,
    capacity: usize,
    cancel: CancellationToken,
) -> (PipelineHandle, WorkerLanes) {
    let stats = ingestor.stats();
    let mut senders = Vec::with_capacity(lanes.max(1));
    let mut handles = Vec::with_capacity(lanes.max(1));
    for lane in 0..lanes.max(1) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        senders.push(tx);
        handles.push(spawn_lane(lane, ingestor.clone(), rx, cancel.clone()));
    }

    let handle = PipelineHandle {
        lanes: senders.into(),
        device_prefix: device_prefix.into(),
        stats,
    };
    (handle, WorkerLanes { handles })
}

fn spawn_lane(
    lane: usize,
    ingestor: TelemetryIngestor,
    mut rx: mpsc::Receiver<InboundMessage>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stats = ingestor.stats();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => {
                        stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                        ingestor.handle_message(message).await;
                    }
                    None => return,
                }
            }
        }

        // Refuse new work, finish what was already accepted.
        rx.close();
        let mut drained = 0usize;
        while let Some(message) = rx.recv().await {
            stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            ingestor.handle_message(message).await;
            drained += 1;
        }
        tracing::debug!(lane, drained, "worker lane stopped");
    })
}

impl WorkerLanes {
    /// Waits for every lane to finish its queue, aborting the ones still
    /// busy after `timeout`. Returns how many lanes were aborted.
    pub async fn drain(self, timeout: Duration) -> usize {
        let mut handles = self.handles;
        let finished =
            tokio::time::timeout(timeout, futures::future::join_all(handles.iter_mut())).await;
        if finished.is_ok() {
            return 0;
        }

        let mut aborted = 0;
        for handle in &handles {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        tracing::warn!(aborted, "shutdown drain timed out; aborted busy worker lanes");
        aborted
    }
}
