mod history;
mod postgres;

pub use history::PgHistoryStore;
pub use postgres::{apply_schema, build_pool, PgDeviceDirectory, PgKeyRegistry, PgLatestStore, PgThresholds};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid id {0:?}")]
    InvalidId(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A write referenced a measurement key whose registry row is gone.
    #[error("measurement key {0:?} is not registered")]
    MissingKey(String),
}

impl StoreError {
    pub fn is_missing_key(&self) -> bool {
        matches!(self, StoreError::MissingKey(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: String,
    pub name: String,
    pub asset_id: String,
    pub is_gateway: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRef {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LatestReading {
    pub device_id: String,
    pub key: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalReading {
    pub device_id: String,
    pub key: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

/// Alarm policy for one (asset, key). A missing bound is open on that side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub device_id: String,
    pub key: Option<String>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub limit: i64,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn list_devices(&self) -> StoreResult<Vec<DeviceRecord>>;
    async fn lookup_device(&self, device_id: &str) -> StoreResult<Option<DeviceRecord>>;
}

#[async_trait]
pub trait KeyRegistry: Send + Sync {
    /// Insert-or-fetch; concurrent first sightings of a name resolve to one record.
    async fn ensure_key(&self, name: &str) -> StoreResult<KeyRef>;
    async fn ensure_asset_association(&self, asset_id: &str, key: &KeyRef) -> StoreResult<()>;
    /// Drops anything remembered about `name` so the next `ensure_key` goes
    /// back to the registry.
    async fn forget_key(&self, name: &str);
}

#[async_trait]
pub trait LatestValueStore: Send + Sync {
    async fn upsert(
        &self,
        device_id: &str,
        key: &KeyRef,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn latest_for_device(&self, device_id: &str) -> StoreResult<Vec<LatestReading>>;
    /// One row per key across every device of the asset, newest wins.
    async fn latest_for_asset(&self, asset_id: &str) -> StoreResult<Vec<LatestReading>>;
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(
        &self,
        device_id: &str,
        key: &str,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn range(&self, query: &HistoryQuery) -> StoreResult<Vec<HistoricalReading>>;
}

#[async_trait]
pub trait ThresholdSource: Send + Sync {
    async fn threshold(&self, asset_id: &str, key: &str) -> StoreResult<Option<Threshold>>;
}

/// Ids arrive as topic segments; anything that is not a UUID cannot name a row.
pub(crate) fn parse_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

pub(crate) fn require_id(raw: &str) -> StoreResult<Uuid> {
    parse_id(raw).ok_or_else(|| StoreError::InvalidId(raw.to_string()))
}
