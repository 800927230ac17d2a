use crate::mqtt::Broker;
use crate::pipeline::IngestStats;
use crate::store::{DeviceDirectory, StoreError};
use crate::telemetry::device_topic;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    DeviceChanged(String),
    /// The broker session was (re)established; earlier subscriptions are gone.
    Reconnected,
    Poll,
}

#[derive(Clone)]
pub struct SubscriptionHandle {
    tx: mpsc::UnboundedSender<Trigger>,
}

impl SubscriptionHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Trigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Trigger>) {
        Self::channel()
    }

    pub fn request(&self, trigger: Trigger) -> bool {
        match self.tx.send(trigger) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(trigger = ?err.0, "subscription manager stopped; trigger ignored");
                false
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResyncReport {
    pub devices: usize,
    pub subscribed: usize,
    pub unsubscribed: usize,
    pub failed: usize,
}

/// Keeps the broker session subscribed to exactly one telemetry topic per
/// known device.
pub struct SubscriptionManager {
    directory: Arc<dyn DeviceDirectory>,
    broker: Arc<dyn Broker>,
    device_prefix: String,
    subscribed: Mutex<HashSet<String>>,
    stats: Arc<IngestStats>,
}

impl SubscriptionManager {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        broker: Arc<dyn Broker>,
        device_prefix: &str,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            directory,
            broker,
            device_prefix: device_prefix.to_string(),
            subscribed: Mutex::new(HashSet::new()),
            stats,
        }
    }

    /// Diffs the directory against the current session: subscribes new
    /// device topics and unsubscribes topics of devices that are gone.
    /// Topics already subscribed are left alone, so repeated calls are no-ops.
    pub async fn resync(&self) -> Result<ResyncReport, StoreError> {
        let devices = self.directory.list_devices().await?;
        let wanted = devices
            .iter()
            .map(|device| device_topic(&self.device_prefix, &device.device_id))
            .collect::<BTreeSet<_>>();

        let mut subscribed = self.subscribed.lock().await;
        let mut report = ResyncReport {
            devices: devices.len(),
            ..ResyncReport::default()
        };

        let missing = wanted
            .iter()
            .filter(|topic| !subscribed.contains(*topic))
            .cloned()
            .collect::<Vec<_>>();
        for topic in missing {
            match self.broker.subscribe(&topic).await {
                Ok(()) => {
                    tracing::debug!(topic = %topic, "subscribed to device telemetry");
                    subscribed.insert(topic);
                    report.subscribed += 1;
                }
                Err(err) => {
                    tracing::warn!(topic = %topic, error = %err, "subscribe failed");
                    report.failed += 1;
                }
            }
        }

        let stale = subscribed
            .iter()
            .filter(|topic| !wanted.contains(*topic))
            .cloned()
            .collect::<Vec<_>>();
        for topic in stale {
            match self.broker.unsubscribe(&topic).await {
                Ok(()) => {
                    tracing::info!(topic = %topic, "unsubscribed from removed device");
                    subscribed.remove(&topic);
                    report.unsubscribed += 1;
                }
                Err(err) => {
                    tracing::warn!(topic = %topic, error = %err, "unsubscribe failed");
                    report.failed += 1;
                }
            }
        }

        self.stats
            .subscribed_topics
            .store(subscribed.len() as u64, Ordering::Relaxed);
        Ok(report)
    }

    /// Forgets the subscribed set after the broker dropped the session.
    pub async fn reset_session(&self) {
        self.subscribed.lock().await.clear();
        self.stats.subscribed_topics.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub async fn subscribed_topics(&self) -> Vec<String> {
        let mut topics = self
            .subscribed
            .lock()
            .await
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        topics.sort();
        topics
    }
}

fn retry_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: RETRY_INITIAL,
        initial_interval: RETRY_INITIAL,
        randomization_factor: 0.2,
        max_interval: RETRY_MAX,
        max_elapsed_time: None,
        ..Default::default()
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Pulls every trigger already queued so a burst costs one resync.
/// Returns whether any of them reported a session reset.
fn coalesce(rx: &mut mpsc::UnboundedReceiver<Trigger>) -> bool {
    let mut reset = false;
    while let Ok(trigger) = rx.try_recv() {
        tracing::trace!(?trigger, "coalesced subscription trigger");
        reset |= trigger == Trigger::Reconnected;
    }
    reset
}

pub fn spawn(
    manager: Arc<SubscriptionManager>,
    mut rx: mpsc::UnboundedReceiver<Trigger>,
    poll_interval: Option<Duration>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = poll_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        let mut backoff = retry_backoff();

        loop {
            let trigger = tokio::select! {
                _ = cancel.cancelled() => break,
                trigger = rx.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
                _ = tick(&mut ticker) => Trigger::Poll,
            };
            match &trigger {
                Trigger::DeviceChanged(device) => {
                    tracing::info!(device = %device, "device changed; resyncing subscriptions")
                }
                other => tracing::debug!(trigger = ?other, "subscription resync requested"),
            }
            let mut reset = (trigger == Trigger::Reconnected) | coalesce(&mut rx);
            backoff.reset();

            loop {
                if reset {
                    manager.reset_session().await;
                    reset = false;
                }
                match manager.resync().await {
                    Ok(report) if report.failed == 0 => {
                        tracing::info!(
                            devices = report.devices,
                            subscribed = report.subscribed,
                            unsubscribed = report.unsubscribed,
                            "device subscriptions in sync"
                        );
                        break;
                    }
                    Ok(report) => {
                        tracing::warn!(failed = report.failed, "device subscriptions partially synced; retrying");
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "device directory unavailable; retrying resync");
                        manager.stats.record_error(format!("resync: {err}"));
                    }
                }

                let delay = backoff.next_backoff().unwrap_or(RETRY_MAX);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                    // A newer trigger retries right away.
                    trigger = rx.recv() => match trigger {
                        Some(trigger) => {
                            reset |= (trigger == Trigger::Reconnected) | coalesce(&mut rx);
                        }
                        None => return,
                    },
                }
            }
        }
        tracing::debug!("subscription manager stopped");
    })
}
