use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/farm-telemetry-ingest/config.json";

fn setup_config_path() -> PathBuf {
    for key in ["INGEST_SETUP_CONFIG_PATH", "FARM_SETUP_CONFIG_PATH"] {
        if let Some(path) = env_optional(key) {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    history_database_url: Option<String>,
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_overrides(contents.into_bytes())
        .map_err(|err| {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
        })
        .ok()
}

fn parse_setup_overrides(mut bytes: Vec<u8>) -> Result<SetupConfigOverrides, simd_json::Error> {
    simd_json::serde::from_slice(&mut bytes)
}

/// Setup-file values only fill settings the environment left unset.
fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if env_optional("INGEST_HISTORY_DATABASE_URL").is_none() {
        if let Some(url) = non_empty(&overrides.history_database_url) {
            config.history_database_url = normalize_database_url(url);
        }
    }
    if env_optional("INGEST_MQTT_HOST").is_none() {
        if let Some(host) = non_empty(&overrides.mqtt_host) {
            config.mqtt_host = host;
        }
    }
    if env_optional("INGEST_MQTT_PORT").is_none() {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_optional("INGEST_MQTT_USERNAME").is_none() && overrides.mqtt_username.is_some() {
        config.mqtt_username = non_empty(&overrides.mqtt_username);
    }
    if env_optional("INGEST_MQTT_PASSWORD").is_none() && overrides.mqtt_password.is_some() {
        config.mqtt_password = non_empty(&overrides.mqtt_password);
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub history_database_url: String,
    pub db_pool_size: u32,
    pub history_pool_size: u32,
    pub apply_schema: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_connect_timeout_secs: u64,
    pub mqtt_request_timeout_ms: u64,
    pub mqtt_startup_attempts: u32,
    pub mqtt_reconnect_max_secs: u64,
    pub device_topic_prefix: String,
    pub asset_topic_prefix: String,
    pub worker_lanes: usize,
    pub lane_capacity: usize,
    pub shutdown_drain_secs: u64,
    pub directory_poll_secs: u64,
    pub threshold_cache_ttl_secs: u64,
    pub publish_alarms: bool,
    pub enable_grpc: bool,
    pub grpc_socket_path: String,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env_optional("INGEST_DATABASE_URL")
            .or_else(|| env_optional("DATABASE_URL"))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
            })
            .context("INGEST_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);
        let history_database_url = env_optional("INGEST_HISTORY_DATABASE_URL")
            .map(normalize_database_url)
            .unwrap_or_else(|| database_url.clone());

        let mut config = Self {
            database_url,
            history_database_url,
            db_pool_size: env_parse("INGEST_DB_POOL_SIZE", 10)?,
            history_pool_size: env_parse("INGEST_HISTORY_POOL_SIZE", 10)?,
            apply_schema: env_flag("INGEST_APPLY_SCHEMA", false),
            mqtt_host: env_optional("INGEST_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: env_parse("INGEST_MQTT_PORT", 1883)?,
            mqtt_username: env_optional("INGEST_MQTT_USERNAME"),
            mqtt_password: env_optional("INGEST_MQTT_PASSWORD"),
            mqtt_client_id: env_optional("INGEST_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("farm-telemetry-ingest-{}", std::process::id())),
            mqtt_keepalive_secs: env_parse("INGEST_MQTT_KEEPALIVE_SECS", 60)?,
            mqtt_connect_timeout_secs: env_parse("INGEST_MQTT_CONNECT_TIMEOUT_SECS", 5)?,
            mqtt_request_timeout_ms: env_parse("INGEST_MQTT_REQUEST_TIMEOUT_MS", 2000)?,
            mqtt_startup_attempts: env_parse("INGEST_MQTT_STARTUP_ATTEMPTS", 10)?,
            mqtt_reconnect_max_secs: env_parse("INGEST_MQTT_RECONNECT_MAX_SECS", 30)?,
            device_topic_prefix: env_optional("INGEST_DEVICE_TOPIC_PREFIX")
                .unwrap_or_else(|| "devices".to_string()),
            asset_topic_prefix: env_optional("INGEST_ASSET_TOPIC_PREFIX")
                .unwrap_or_else(|| "assets".to_string()),
            worker_lanes: env_parse("INGEST_WORKER_LANES", 8)?,
            lane_capacity: env_parse("INGEST_LANE_CAPACITY", 256)?,
            shutdown_drain_secs: env_parse("INGEST_SHUTDOWN_DRAIN_SECS", 10)?,
            directory_poll_secs: env_parse("INGEST_DIRECTORY_POLL_SECS", 300)?,
            threshold_cache_ttl_secs: env_parse("INGEST_THRESHOLD_CACHE_TTL_SECS", 30)?,
            publish_alarms: env_flag("INGEST_PUBLISH_ALARMS", true),
            enable_grpc: env_flag("INGEST_ENABLE_GRPC", true),
            grpc_socket_path: env_optional("INGEST_GRPC_SOCKET")
                .unwrap_or_else(|| "/tmp/farm_telemetry_ingest.sock".to_string()),
            otlp_endpoint: env_optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides);
        }

        if config.worker_lanes == 0 {
            return Err(anyhow!("INGEST_WORKER_LANES must be at least 1"));
        }

        Ok(config)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn mqtt_request_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_request_timeout_ms)
    }

    pub fn mqtt_reconnect_max(&self) -> Duration {
        Duration::from_secs(self.mqtt_reconnect_max_secs.max(1))
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_secs)
    }

    pub fn directory_poll_interval(&self) -> Option<Duration> {
        (self.directory_poll_secs > 0).then(|| Duration::from_secs(self.directory_poll_secs))
    }

    pub fn threshold_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.threshold_cache_ttl_secs)
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_optional(key) {
        Some(raw) => raw.parse::<T>().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    env_optional(key)
        .map(|v| parse_flag(&v))
        .unwrap_or(default)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

pub(crate) fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg2://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
