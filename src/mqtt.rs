use crate::config::Config;
use crate::pipeline::PipelineHandle;
use crate::subscriptions::{SubscriptionHandle, Trigger};
use crate::telemetry::InboundMessage;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::future::Future;
use thiserror::Error;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("mqtt client error: {0}")]
    Client(#[from] ClientError),
    #[error("mqtt request timed out after {0:?}")]
    Timeout(Duration),
}

/// The subset of the broker the pipeline needs. Subscribing to a topic that
/// is already subscribed must be harmless.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError>;
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;
}

#[derive(Clone)]
pub struct MqttBroker {
    client: AsyncClient,
    request_timeout: Duration,
}

impl MqttBroker {
    async fn timed<F>(&self, request: F) -> Result<(), BrokerError>
    where
        F: Future<Output = Result<(), ClientError>> + Send,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result.map_err(BrokerError::from),
            Err(_) => Err(BrokerError::Timeout(self.request_timeout)),
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.timed(self.client.subscribe(topic, QoS::AtLeastOnce))
            .await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        self.timed(self.client.unsubscribe(topic)).await
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.timed(
            self.client
                .publish_bytes(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
    }
}

/// Builds the single client used for both subscriptions and republish.
/// Nothing touches the network until the event loop is polled.
pub fn connect(config: &Config) -> (MqttBroker, EventLoop) {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    options.set_clean_session(true);
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    eventloop
        .network_options
        .set_connection_timeout(config.mqtt_connect_timeout_secs.max(1));

    let broker = MqttBroker {
        client,
        request_timeout: config.mqtt_request_timeout(),
    };
    (broker, eventloop)
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub startup_attempts: u32,
    pub reconnect_max: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            startup_attempts: config.mqtt_startup_attempts,
            reconnect_max: config.mqtt_reconnect_max(),
        }
    }
}

fn reconnect_backoff(max_interval: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: INITIAL_RECONNECT_DELAY,
        initial_interval: INITIAL_RECONNECT_DELAY,
        randomization_factor: 0.2,
        max_interval,
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Drives the event loop until cancelled.
///
/// Each successful connect tells the subscription manager the broker
/// session was reset. Link errors back off and reconnect forever once the
/// broker has been reached; before that, `startup_attempts` consecutive
/// failures end the task with an error.
pub async fn run_connection(
    mut eventloop: EventLoop,
    pipeline: PipelineHandle,
    subscriptions: SubscriptionHandle,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) -> Result<()> {
    let stats = pipeline.stats();
    let mut backoff = reconnect_backoff(settings.reconnect_max);
    let mut ever_connected = false;
    let mut failures = 0u32;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if failures > 0 || ever_connected {
                    tracing::info!(failures, "reconnected to MQTT broker");
                } else {
                    tracing::info!(session_present = ack.session_present, "connected to MQTT broker");
                }
                ever_connected = true;
                failures = 0;
                backoff.reset();
                stats.set_mqtt_connected(true);
                stats.clear_error();
                subscriptions.request(Trigger::Reconnected);
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                pipeline.dispatch(InboundMessage::new(publish.topic, publish.payload));
            }
            Ok(_) => {}
            Err(err) => {
                stats.set_mqtt_connected(false);
                stats.record_error(format!("mqtt: {err}"));
                failures = failures.saturating_add(1);
                if !ever_connected && failures >= settings.startup_attempts.max(1) {
                    return Err(anyhow!(
                        "MQTT broker unreachable after {failures} attempts: {err}"
                    ));
                }

                let delay = backoff.next_backoff().unwrap_or(settings.reconnect_max);
                tracing::warn!(
                    error = %err,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "MQTT connection error; reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    stats.set_mqtt_connected(false);
    tracing::info!("MQTT connection task stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::tests::fixture;
    use crate::pipeline::spawn_lanes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn unreachable_config() -> Config {
        let mut config = crate::test_support::test_config();
        // Nothing listens on the discard port in test environments.
        config.mqtt_port = 9;
        config.mqtt_connect_timeout_secs = 1;
        config
    }

    #[test]
    fn backoff_starts_small_and_respects_cap() {
        let max = Duration::from_secs(2);
        let mut backoff = reconnect_backoff(max);
        let first = backoff.next_backoff().expect("delay");
        assert!(first <= INITIAL_RECONNECT_DELAY.mul_f64(1.2));
        for _ in 0..20 {
            let delay = backoff.next_backoff().expect("delay");
            assert!(delay <= max.mul_f64(1.2));
        }
        backoff.reset();
        assert!(backoff.next_backoff().expect("delay") <= INITIAL_RECONNECT_DELAY.mul_f64(1.2));
    }

    #[tokio::test]
    async fn cancelled_connection_stops_cleanly() -> anyhow::Result<()> {
        let fx = fixture();
        let config = unreachable_config();
        let (_broker, eventloop) = connect(&config);
        let cancel = CancellationToken::new();
        let (pipeline, _lanes) = spawn_lanes(fx.ingestor.clone(), "devices", 1, 4, cancel.clone());
        let (subscriptions, _rx) = SubscriptionHandle::detached();

        cancel.cancel();
        run_connection(
            eventloop,
            pipeline,
            subscriptions,
            ConnectionSettings {
                startup_attempts: 100,
                reconnect_max: Duration::from_secs(1),
            },
            cancel,
        )
        .await?;
        assert!(!fx.stats.mqtt_connected.load(std::sync::atomic::Ordering::Relaxed));
        Ok(())
    }

    #[tokio::test]
    async fn gives_up_when_broker_was_never_reached() {
        let fx = fixture();
        let config = unreachable_config();
        let (_broker, eventloop) = connect(&config);
        let cancel = CancellationToken::new();
        let (pipeline, _lanes) = spawn_lanes(fx.ingestor.clone(), "devices", 1, 4, cancel.clone());
        let (subscriptions, _rx) = SubscriptionHandle::detached();

        let result = tokio::time::timeout(
            Duration::from_secs(20),
            run_connection(
                eventloop,
                pipeline,
                subscriptions,
                ConnectionSettings {
                    startup_attempts: 2,
                    reconnect_max: Duration::from_secs(1),
                },
                cancel,
            ),
        )
        .await
        .expect("connection task should give up");
        assert!(result.is_err());
        assert!(fx.stats.last_error().is_some());
    }

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x30, (2 + topic.len() + payload.len()) as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    /// Accepts a session, delivers one publish and hangs up, then accepts
    /// the reconnect and keeps it open.
    async fn flaky_broker(listener: TcpListener) -> std::io::Result<()> {
        let mut buf = [0u8; 1024];

        let (mut first, _) = listener.accept().await?;
        let connect_len = first.read(&mut buf).await?;
        assert!(connect_len > 0);
        first.write_all(&CONNACK).await?;
        first
            .write_all(&publish_packet("devices/D1/telemetry", br#"{"temp": 1}"#))
            .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(first);

        let (mut second, _) = listener.accept().await?;
        let connect_len = second.read(&mut buf).await?;
        assert!(connect_len > 0);
        second.write_all(&CONNACK).await?;
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    #[tokio::test]
    async fn reconnect_requests_resync_and_publishes_reach_lanes() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let mut config = crate::test_support::test_config();
        config.mqtt_port = listener.local_addr()?.port();
        let broker_task = tokio::spawn(flaky_broker(listener));

        let fx = fixture();
        fx.store.add_device("D1", "A1");
        let (_broker, eventloop) = connect(&config);
        let cancel = CancellationToken::new();
        let (pipeline, lanes) = spawn_lanes(fx.ingestor.clone(), "devices", 1, 8, cancel.clone());
        let (subscriptions, mut triggers) = SubscriptionHandle::channel();
        let connection = tokio::spawn(run_connection(
            eventloop,
            pipeline,
            subscriptions,
            ConnectionSettings {
                startup_attempts: 3,
                reconnect_max: Duration::from_secs(1),
            },
            cancel.clone(),
        ));

        for _ in 0..2 {
            let trigger = tokio::time::timeout(Duration::from_secs(10), triggers.recv()).await?;
            assert_eq!(trigger, Some(Trigger::Reconnected));
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.store.history_rows().is_empty() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await?;
        assert!(fx.stats.mqtt_connected.load(std::sync::atomic::Ordering::Relaxed));

        cancel.cancel();
        connection.await??;
        lanes.drain(Duration::from_secs(5)).await;
        broker_task.abort();

        let history = fx.store.history_rows();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].key, "temp");
        assert!(triggers.try_recv().is_err());
        Ok(())
    }
}
