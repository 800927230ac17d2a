use super::{
    parse_id, require_id, DeviceDirectory, DeviceRecord, KeyRef, KeyRegistry, LatestReading,
    LatestValueStore, StoreError, StoreResult, Threshold, ThresholdSource,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("../../migrations/001_telemetry_ingest.sql");

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await
        .context("failed to apply telemetry ingest schema")?;
    Ok(())
}

const LATEST_KEY_FKEY: &str = "ts_values_latest_key_fkey";
const ASSET_KEY_FKEY: &str = "asset_keys_ts_key_fkey";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn violates_foreign_key(err: &sqlx::Error, constraint: &str) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.code().as_deref() == Some("23503") && db_err.constraint() == Some(constraint)
    )
}

#[derive(Clone)]
pub struct PgDeviceDirectory {
    pool: PgPool,
}

impl PgDeviceDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn device_from_row(row: &PgRow) -> Result<DeviceRecord, sqlx::Error> {
    Ok(DeviceRecord {
        device_id: row.try_get::<String, _>("device_id")?,
        name: row.try_get::<String, _>("name")?,
        asset_id: row.try_get::<String, _>("asset_id")?,
        is_gateway: row.try_get::<bool, _>("is_gateway")?,
    })
}

#[async_trait]
impl DeviceDirectory for PgDeviceDirectory {
    async fn list_devices(&self) -> StoreResult<Vec<DeviceRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id::text AS device_id, name, asset_id::text AS asset_id, is_gateway
            FROM devices
            ORDER BY device_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(device_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn lookup_device(&self, device_id: &str) -> StoreResult<Option<DeviceRecord>> {
        let Some(id) = parse_id(device_id) else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"
            SELECT device_id::text AS device_id, name, asset_id::text AS asset_id, is_gateway
            FROM devices
            WHERE device_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(device_from_row).transpose()?)
    }
}

/// Key registry backed by `ts_keys` / `asset_keys` with an in-process
/// cache, so repeat keys never leave memory after their first sighting.
#[derive(Clone)]
pub struct PgKeyRegistry {
    pool: PgPool,
    keys: Arc<RwLock<HashMap<String, KeyRef>>>,
    associations: Arc<RwLock<HashSet<(Uuid, String)>>>,
}

impl PgKeyRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            keys: Arc::new(RwLock::new(HashMap::new())),
            associations: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    async fn fetch_key_id(&self, name: &str) -> StoreResult<i32> {
        let row = sqlx::query("SELECT ts_key_id FROM ts_keys WHERE ts_key = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::Unavailable(format!("key {name:?} missing after insert conflict")))?;
        Ok(row.try_get::<i32, _>("ts_key_id")?)
    }
}

#[async_trait]
impl KeyRegistry for PgKeyRegistry {
    async fn ensure_key(&self, name: &str) -> StoreResult<KeyRef> {
        if let Some(found) = self.keys.read().await.get(name) {
            return Ok(found.clone());
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO ts_keys (ts_key)
            VALUES ($1)
            ON CONFLICT (ts_key) DO NOTHING
            RETURNING ts_key_id
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await;

        let id = match inserted {
            Ok(Some(row)) => {
                tracing::info!(key = %name, "registered new measurement key");
                row.try_get::<i32, _>("ts_key_id")?
            }
            // Another writer got there first.
            Ok(None) => self.fetch_key_id(name).await?,
            Err(err) if is_unique_violation(&err) => self.fetch_key_id(name).await?,
            Err(err) => return Err(err.into()),
        };

        let key = KeyRef {
            id,
            name: name.to_string(),
        };
        self.keys
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| key.clone());
        Ok(key)
    }

    async fn ensure_asset_association(&self, asset_id: &str, key: &KeyRef) -> StoreResult<()> {
        let asset = require_id(asset_id)?;
        let marker = (asset, key.name.clone());
        if self.associations.read().await.contains(&marker) {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            INSERT INTO asset_keys (asset_id, ts_key)
            VALUES ($1, $2)
            ON CONFLICT (asset_id, ts_key) DO NOTHING
            "#,
        )
        .bind(asset)
        .bind(&key.name)
        .execute(&self.pool)
        .await;
        match result {
            Ok(done) => {
                if done.rows_affected() > 0 {
                    tracing::debug!(asset = %asset_id, key = %key.name, key_id = key.id, "associated key with asset");
                }
            }
            Err(err) if is_unique_violation(&err) => {}
            Err(err) if violates_foreign_key(&err, ASSET_KEY_FKEY) => {
                self.forget_key(&key.name).await;
                return Err(StoreError::MissingKey(key.name.clone()));
            }
            Err(err) => return Err(err.into()),
        }

        self.associations.write().await.insert(marker);
        Ok(())
    }

    async fn forget_key(&self, name: &str) {
        let dropped = self.keys.write().await.remove(name);
        self.associations
            .write()
            .await
            .retain(|(_, key)| key != name);
        tracing::debug!(key = %name, cached = dropped.is_some(), "forgot cached measurement key");
    }
}

#[derive(Clone)]
pub struct PgLatestStore {
    pool: PgPool,
}

impl PgLatestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn latest_from_row(row: &PgRow) -> Result<LatestReading, sqlx::Error> {
    Ok(LatestReading {
        device_id: row.try_get::<String, _>("device_id")?,
        key: row.try_get::<String, _>("key")?,
        value: row.try_get::<f64, _>("value")?,
        observed_at: row.try_get::<DateTime<Utc>, _>("observed_at")?,
    })
}

#[async_trait]
impl LatestValueStore for PgLatestStore {
    async fn upsert(
        &self,
        device_id: &str,
        key: &KeyRef,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let device = require_id(device_id)?;
        // Arrival order wins: a late message overwrites a newer cached value.
        let result = sqlx::query(
            r#"
            INSERT INTO ts_values_latest (device_id, key, value, observed_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (device_id, key)
            DO UPDATE SET value = EXCLUDED.value, observed_at = EXCLUDED.observed_at
            "#,
        )
        .bind(device)
        .bind(&key.name)
        .bind(value)
        .bind(observed_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) if violates_foreign_key(&err, LATEST_KEY_FKEY) => {
                Err(StoreError::MissingKey(key.name.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn latest_for_device(&self, device_id: &str) -> StoreResult<Vec<LatestReading>> {
        let Some(device) = parse_id(device_id) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT device_id::text AS device_id, key, value, observed_at
            FROM ts_values_latest
            WHERE device_id = $1
            ORDER BY key
            "#,
        )
        .bind(device)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(latest_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn latest_for_asset(&self, asset_id: &str) -> StoreResult<Vec<LatestReading>> {
        let Some(asset) = parse_id(asset_id) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (l.key)
                l.device_id::text AS device_id, l.key, l.value, l.observed_at
            FROM ts_values_latest l
            JOIN devices d ON d.device_id = l.device_id
            WHERE d.asset_id = $1
            ORDER BY l.key, l.observed_at DESC
            "#,
        )
        .bind(asset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(latest_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }
}

#[derive(Clone)]
pub struct PgThresholds {
    pool: PgPool,
}

impl PgThresholds {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ThresholdSource for PgThresholds {
    async fn threshold(&self, asset_id: &str, key: &str) -> StoreResult<Option<Threshold>> {
        let Some(asset) = parse_id(asset_id) else {
            return Ok(None);
        };
        let row = sqlx::query(
            r#"
            SELECT threshold_min, threshold_max, modified_at
            FROM thresholds
            WHERE asset_id = $1 AND key = $2
            "#,
        )
        .bind(asset)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Threshold {
            min: row.try_get::<Option<f64>, _>("threshold_min")?,
            max: row.try_get::<Option<f64>, _>("threshold_max")?,
            modified_at: row.try_get::<Option<DateTime<Utc>>, _>("modified_at")?,
        }))
    }
}
