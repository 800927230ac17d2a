use super::{
    parse_id, require_id, HistoricalReading, HistoryQuery, HistoryStore, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Append-only reading log. Lives on its own pool so it can point at a
/// separate Timescale database.
#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(
        &self,
        device_id: &str,
        key: &str,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let device = require_id(device_id)?;
        sqlx::query(
            r#"
            INSERT INTO telemetry_history (id, device_id, ts_key, value, observed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(device)
        .bind(key)
        .bind(value)
        .bind(observed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn range(&self, query: &HistoryQuery) -> StoreResult<Vec<HistoricalReading>> {
        let Some(device) = parse_id(&query.device_id) else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            r#"
            SELECT device_id::text AS device_id, ts_key, value, observed_at
            FROM telemetry_history
            WHERE device_id = $1
              AND ($2::text IS NULL OR ts_key = $2)
              AND observed_at >= $3
              AND observed_at <= $4
            ORDER BY observed_at DESC
            LIMIT $5
            "#,
        )
        .bind(device)
        .bind(query.key.as_deref())
        .bind(query.from)
        .bind(query.to)
        .bind(query.limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(HistoricalReading {
                    device_id: row.try_get::<String, _>("device_id")?,
                    key: row.try_get::<String, _>("ts_key")?,
                    value: row.try_get::<f64, _>("value")?,
                    observed_at: row.try_get::<DateTime<Utc>, _>("observed_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }
}
