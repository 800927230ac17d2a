use crate::store::{Threshold, ThresholdSource};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Breach {
    BelowMin,
    AboveMax,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    pub asset_id: String,
    pub key: String,
    pub value: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub breach: Breach,
}

/// Bounds are inclusive: a value equal to min or max is in range.
pub fn evaluate(threshold: &Threshold, value: f64) -> Option<Breach> {
    if threshold.min.is_some_and(|min| value < min) {
        return Some(Breach::BelowMin);
    }
    if threshold.max.is_some_and(|max| value > max) {
        return Some(Breach::AboveMax);
    }
    None
}

type CacheKey = (String, String);

/// Best-effort alarm checks. Lookup failures read as "no policy" so they
/// never hold up persistence.
#[derive(Clone)]
pub struct ThresholdEvaluator {
    source: Arc<dyn ThresholdSource>,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<CacheKey, (Instant, Option<Threshold>)>>>,
}

impl ThresholdEvaluator {
    pub fn new(source: Arc<dyn ThresholdSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn check(&self, asset_id: &str, key: &str, value: f64) -> Option<AlarmEvent> {
        let threshold = self.lookup(asset_id, key).await?;
        let breach = evaluate(&threshold, value)?;
        Some(AlarmEvent {
            asset_id: asset_id.to_string(),
            key: key.to_string(),
            value,
            min: threshold.min,
            max: threshold.max,
            breach,
        })
    }

    async fn lookup(&self, asset_id: &str, key: &str) -> Option<Threshold> {
        let cache_key = (asset_id.to_string(), key.to_string());
        if !self.ttl.is_zero() {
            if let Some((fetched_at, cached)) = self.cache.read().await.get(&cache_key) {
                if fetched_at.elapsed() < self.ttl {
                    return *cached;
                }
            }
        }

        match self.source.threshold(asset_id, key).await {
            Ok(found) => {
                tracing::trace!(
                    asset = %asset_id,
                    key = %key,
                    configured = found.is_some(),
                    modified_at = ?found.and_then(|t| t.modified_at),
                    "threshold policy loaded"
                );
                if !self.ttl.is_zero() {
                    self.cache
                        .write()
                        .await
                        .insert(cache_key, (Instant::now(), found));
                }
                found
            }
            Err(err) => {
                tracing::warn!(asset = %asset_id, key = %key, error = %err, "threshold lookup failed; skipping alarm check");
                None
            }
        }
    }
}
