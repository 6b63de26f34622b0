//! Read-through / write-through cache in front of the paid-traffic query.

use std::sync::Arc;

use paidops_adapters::{AnalyticsClient, AnalyticsError};
use paidops_core::RawPaidTrafficRow;
use paidops_storage::{gunzip_json, gzip_json, CacheError, CacheStore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::window::{QueryVariant, TimeWindow};

pub fn cache_key(site_id: Uuid, window: &TimeWindow, variant: QueryVariant) -> String {
    format!(
        "paid-traffic/{site_id}/{}/{}/{}.json.gz",
        window.year,
        window.period_label(),
        variant.as_str()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSource {
    Cache,
    Live,
}

#[derive(Debug, Clone)]
pub struct PaidTrafficRows {
    pub rows: Vec<RawPaidTrafficRow>,
    pub source: RowSource,
}

/// Analytics client with an optional object-store cache.
///
/// Cache failures are logged and never surface; only the live query can fail.
#[derive(Clone)]
pub struct CachedAnalytics {
    analytics: Arc<dyn AnalyticsClient>,
    cache: Option<Arc<dyn CacheStore>>,
}

impl CachedAnalytics {
    pub fn new(analytics: Arc<dyn AnalyticsClient>, cache: Option<Arc<dyn CacheStore>>) -> Self {
        Self { analytics, cache }
    }

    pub async fn rows(&self, key: &str, query: &str) -> Result<PaidTrafficRows, AnalyticsError> {
        if let Some(cache) = &self.cache {
            if let Some(rows) = read_cached(cache.as_ref(), key).await {
                debug!(key, rows = rows.len(), "paid traffic cache hit");
                return Ok(PaidTrafficRows {
                    rows,
                    source: RowSource::Cache,
                });
            }
        }

        let rows = self.analytics.query(query).await?;

        if let Some(cache) = &self.cache {
            if let Err(err) = write_cached(cache.as_ref(), key, &rows).await {
                warn!(key, error = %err, "failed to write paid traffic cache");
            }
        }

        Ok(PaidTrafficRows {
            rows,
            source: RowSource::Live,
        })
    }
}

async fn read_cached(cache: &dyn CacheStore, key: &str) -> Option<Vec<RawPaidTrafficRow>> {
    match cache.exists(key).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(key, "paid traffic cache miss");
            return None;
        }
        Err(err) => {
            warn!(key, error = %err, "paid traffic cache head check failed");
            return None;
        }
    }

    let decoded = match cache.get(key).await {
        Ok(bytes) => gunzip_json::<Vec<RawPaidTrafficRow>>(&bytes),
        Err(err) => Err(err),
    };
    match decoded {
        Ok(rows) => Some(rows),
        Err(err) => {
            warn!(key, error = %err, "failed to read paid traffic cache");
            None
        }
    }
}

async fn write_cached(
    cache: &dyn CacheStore,
    key: &str,
    rows: &[RawPaidTrafficRow],
) -> Result<(), CacheError> {
    let bytes = gzip_json(rows)?;
    cache.put(key, bytes).await
}
