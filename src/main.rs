mod config;
mod directory;
mod grpc;
mod ingest;
mod mqtt;
mod pipeline;
mod republish;
mod store;
mod subscriptions;
mod telemetry;

#[cfg(test)]
mod test_support;

use crate::config::Config;
use crate::directory::CachedDirectory;
use crate::grpc::{serve_uds, IngestService};
use crate::ingest::{IngestStores, TelemetryIngestor};
use crate::mqtt::{run_connection, ConnectionSettings};
use crate::pipeline::{spawn_lanes, IngestStats};
use crate::republish::Republisher;
use crate::store::{
    apply_schema, build_pool, PgDeviceDirectory, PgHistoryStore, PgKeyRegistry, PgLatestStore,
    PgThresholds,
};
use crate::subscriptions::{SubscriptionHandle, SubscriptionManager, Trigger};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,farm_telemetry_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "farm-telemetry-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.ends_with("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{trimmed}/v1/traces")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    if let Err(err) = run(config).await {
        tracing::error!(error = %format!("{err:#}"), "telemetry ingest exiting");
        return Err(err);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let pool = build_pool(&config.database_url, config.db_pool_size)
        .await
        .context("cannot connect to the device/latest-value database")?;
    let history_pool = if config.history_database_url == config.database_url {
        pool.clone()
    } else {
        build_pool(&config.history_database_url, config.history_pool_size)
            .await
            .context("cannot connect to the history database")?
    };
    if config.apply_schema {
        apply_schema(&pool).await?;
        if config.history_database_url != config.database_url {
            apply_schema(&history_pool).await?;
        }
        tracing::info!("telemetry ingest schema applied");
    }

    let stats = Arc::new(IngestStats::new());
    let cancel = CancellationToken::new();
    let (broker, eventloop) = mqtt::connect(&config);
    let broker = Arc::new(broker);

    let directory = CachedDirectory::new(Arc::new(PgDeviceDirectory::new(pool.clone())));
    let stores = IngestStores {
        directory: Arc::new(directory.clone()),
        keys: Arc::new(PgKeyRegistry::new(pool.clone())),
        latest: Arc::new(PgLatestStore::new(pool.clone())),
        history: Arc::new(PgHistoryStore::new(history_pool.clone())),
        thresholds: Arc::new(PgThresholds::new(pool.clone())),
    };
    let republisher = Republisher::new(
        broker.clone(),
        &config.asset_topic_prefix,
        config.publish_alarms,
        stats.clone(),
    );
    let ingestor = TelemetryIngestor::new(
        stores,
        republisher,
        &config.device_topic_prefix,
        config.threshold_cache_ttl(),
        stats.clone(),
    );

    let (pipeline, lanes) = spawn_lanes(
        ingestor.clone(),
        &config.device_topic_prefix,
        config.worker_lanes,
        config.lane_capacity,
        cancel.clone(),
    );

    let (subscription_handle, triggers) = SubscriptionHandle::channel();
    let manager = Arc::new(SubscriptionManager::new(
        Arc::new(directory.clone()),
        broker.clone(),
        &config.device_topic_prefix,
        stats.clone(),
    ));
    subscription_handle.request(Trigger::Startup);
    let subscription_task = subscriptions::spawn(
        manager,
        triggers,
        config.directory_poll_interval(),
        cancel.clone(),
    );

    let grpc_task = config.enable_grpc.then(|| {
        let service = IngestService::new(
            ingestor.clone(),
            directory.clone(),
            subscription_handle.clone(),
        );
        let path = config.grpc_socket_path.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_uds(&path, service, cancel).await {
                tracing::error!(error = %err, "gRPC control plane exited");
            }
        })
    });

    let mut connection = tokio::spawn(run_connection(
        eventloop,
        pipeline,
        subscription_handle,
        ConnectionSettings::from_config(&config),
        cancel.clone(),
    ));

    tracing::info!(
        host = %config.mqtt_host,
        port = config.mqtt_port,
        lanes = config.worker_lanes,
        "telemetry ingest started"
    );

    let outcome = tokio::select! {
        res = &mut connection => match res {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    cancel.cancel();
    let aborted = lanes.drain(config.shutdown_drain()).await;
    if !connection.is_finished() {
        let _ = connection.await;
    }
    let _ = subscription_task.await;
    if let Some(task) = grpc_task {
        let _ = task.await;
    }
    pool.close().await;
    history_pool.close().await;
    tracing::info!(aborted_lanes = aborted, "telemetry ingest stopped");

    outcome
}
