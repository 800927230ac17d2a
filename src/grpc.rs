use crate::directory::CachedDirectory;
use crate::ingest::TelemetryIngestor;
use crate::pipeline::IngestStats;
use crate::store::{HistoryQuery, LatestReading, StoreError};
use crate::subscriptions::{SubscriptionHandle, Trigger};
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::atomic::Ordering;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{transport::Server, Request, Response, Status};
use tonic_health::server::health_reporter;

pub mod proto {
    tonic::include_proto!("telemetry.ingest");
}

use proto::ingestor_server::{Ingestor, IngestorServer};
use proto::{
    DeviceChangedRequest, DeviceChangedResponse, HealthRequest, HealthResponse, HistoryRequest,
    HistoryResponse, LatestRequest, LatestResponse, Reading,
};

const DEFAULT_HISTORY_LIMIT: u32 = 1000;
const MAX_HISTORY_LIMIT: u32 = 10_000;

#[derive(Clone)]
pub struct IngestService {
    ingestor: TelemetryIngestor,
    directory: CachedDirectory,
    subscriptions: SubscriptionHandle,
}

impl IngestService {
    pub fn new(
        ingestor: TelemetryIngestor,
        directory: CachedDirectory,
        subscriptions: SubscriptionHandle,
    ) -> Self {
        Self {
            ingestor,
            directory,
            subscriptions,
        }
    }

    fn to_health(stats: &IngestStats) -> HealthResponse {
        let load = |counter: &std::sync::atomic::AtomicU64| counter.load(Ordering::Relaxed);
        HealthResponse {
            messages_received: load(&stats.messages_received),
            messages_dropped: load(&stats.messages_dropped),
            queue_depth: load(&stats.queue_depth),
            readings_stored: load(&stats.readings_stored),
            history_appended: load(&stats.history_appended),
            store_errors: load(&stats.store_errors),
            alarms_raised: load(&stats.alarms_raised),
            republished: load(&stats.republished),
            republish_failures: load(&stats.republish_failures),
            subscribed_topics: load(&stats.subscribed_topics),
            mqtt_connected: stats.mqtt_connected.load(Ordering::Relaxed),
            last_error: stats.last_error().unwrap_or_default(),
            build: env!("CARGO_PKG_VERSION").to_string(),
            fields_skipped: load(&stats.fields_skipped),
            unknown_devices: load(&stats.unknown_devices),
        }
    }
}

fn to_rpc_reading(reading: LatestReading) -> Reading {
    Reading {
        device_id: reading.device_id,
        key: reading.key,
        value: reading.value,
        observed_at_ms: reading.observed_at.timestamp_millis(),
    }
}

fn millis(field: &str, ms: i64) -> Result<DateTime<Utc>, Status> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Status::invalid_argument(format!("invalid {field}")))
}

fn store_status(err: StoreError) -> Status {
    match err {
        StoreError::InvalidId(id) => Status::invalid_argument(format!("invalid id {id:?}")),
        other => Status::unavailable(other.to_string()),
    }
}

#[tonic::async_trait]
impl Ingestor for IngestService {
    async fn get_health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let stats = self.ingestor.stats();
        Ok(Response::new(Self::to_health(&stats)))
    }

    async fn notify_device_changed(
        &self,
        request: Request<DeviceChangedRequest>,
    ) -> Result<Response<DeviceChangedResponse>, Status> {
        let device_id = request.into_inner().device_id.trim().to_string();
        if device_id.is_empty() {
            return Err(Status::invalid_argument("device_id is required"));
        }
        self.directory.invalidate(&device_id).await;
        let resync_requested = self
            .subscriptions
            .request(Trigger::DeviceChanged(device_id.clone()));
        tracing::info!(device = %device_id, resync_requested, "device change notified");
        Ok(Response::new(DeviceChangedResponse { resync_requested }))
    }

    async fn get_latest(
        &self,
        request: Request<LatestRequest>,
    ) -> Result<Response<LatestResponse>, Status> {
        let request = request.into_inner();
        let device_id = request.device_id.trim();
        let asset_id = request.asset_id.trim();
        let readings = match (device_id.is_empty(), asset_id.is_empty()) {
            (false, true) => self.ingestor.latest_for_device(device_id).await,
            (true, false) => self.ingestor.latest_for_asset(asset_id).await,
            _ => {
                return Err(Status::invalid_argument(
                    "exactly one of device_id or asset_id is required",
                ))
            }
        }
        .map_err(store_status)?;

        Ok(Response::new(LatestResponse {
            readings: readings.into_iter().map(to_rpc_reading).collect(),
        }))
    }

    async fn get_history(
        &self,
        request: Request<HistoryRequest>,
    ) -> Result<Response<HistoryResponse>, Status> {
        let request = request.into_inner();
        let device_id = request.device_id.trim().to_string();
        if device_id.is_empty() {
            return Err(Status::invalid_argument("device_id is required"));
        }
        let from = millis("from_ms", request.from_ms)?;
        let to = if request.to_ms == 0 {
            Utc::now()
        } else {
            millis("to_ms", request.to_ms)?
        };
        if from > to {
            return Err(Status::invalid_argument("from_ms is after to_ms"));
        }
        let limit = match request.limit {
            0 => DEFAULT_HISTORY_LIMIT,
            n => n.min(MAX_HISTORY_LIMIT),
        };
        let key = Some(request.key.trim().to_string()).filter(|k| !k.is_empty());

        let rows = self
            .ingestor
            .history(&HistoryQuery {
                device_id,
                key,
                from,
                to,
                limit: i64::from(limit),
            })
            .await
            .map_err(store_status)?;

        Ok(Response::new(HistoryResponse {
            readings: rows
                .into_iter()
                .map(|row| Reading {
                    device_id: row.device_id,
                    key: row.key,
                    value: row.value,
                    observed_at_ms: row.observed_at.timestamp_millis(),
                })
                .collect(),
        }))
    }
}

pub async fn serve_uds(
    socket_path: &str,
    service: IngestService,
    cancel: CancellationToken,
) -> Result<()> {
    if Path::new(socket_path).exists() {
        tokio::fs::remove_file(socket_path).await.ok();
    }

    let uds = UnixListener::bind(socket_path)?;
    let (mut health_reporter, health_service) = health_reporter();
    health_reporter
        .set_serving::<IngestorServer<IngestService>>()
        .await;

    let incoming = UnixListenerStream::new(uds);
    tracing::info!(socket = %socket_path, "gRPC control plane listening");

    Server::builder()
        .add_service(health_service)
        .add_service(IngestorServer::new(service))
        .serve_with_incoming_shutdown(incoming, cancel.cancelled_owned())
        .await?;

    tokio::fs::remove_file(socket_path).await.ok();
    Ok(())
}
