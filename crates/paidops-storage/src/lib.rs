//! Object-store cache + retrying HTTP client utilities.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "paidops-storage";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache key {0:?} is not a valid object key")]
    InvalidKey(String),
    #[error("cache object {0:?} not found")]
    NotFound(String),
    #[error("cache io for {key:?}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cache codec: {0}")]
    Codec(String),
}

/// Minimal object-store surface the analytics cache needs.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError>;
}

/// Filesystem-backed object store: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    pub fn new(root: impl Into<PathBuf>, bucket: &str) -> Self {
        Self {
            root: root.into().join(bucket),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        let mut path = self.root.clone();
        let mut segments = 0usize;
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(CacheError::InvalidKey(key.to_string()));
            }
            path.push(segment);
            segments += 1;
        }
        if segments == 0 {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(path)
    }

    fn io_error(key: &str, source: std::io::Error) -> CacheError {
        CacheError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.object_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|err| Self::io_error(key, err))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::NotFound(key.to_string()))
            }
            Err(err) => Err(Self::io_error(key, err)),
        }
    }

    /// Write through a temp file in the same directory, then rename over the key.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), CacheError> {
        let path = self.object_path(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| CacheError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|err| Self::io_error(key, err))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_error(key, err));
        }
        Ok(())
    }
}

/// Serialize to JSON and gzip it.
pub fn gzip_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CacheError> {
    let json = serde_json::to_vec(value).map_err(|e| CacheError::Codec(e.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CacheError::Codec(e.to_string()))?;
    encoder.finish().map_err(|e| CacheError::Codec(e.to_string()))
}

pub fn gunzip_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CacheError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| CacheError::Codec(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| CacheError::Codec(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// JSON-over-HTTP client with bounded concurrency and exponential backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .expect("fetcher semaphore is never closed");

        let span = info_span!("http_post", url);
        self.post_with_retries(url, body).instrument(span).await
    }

    async fn post_with_retries(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.post(url).json(body).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::warn!(%status, attempt, "retrying analytics request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::warn!(error = %err, attempt, "retrying analytics request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fs_store_round_trips_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = FsCacheStore::new(dir.path(), "paid-cache");
        assert_eq!(store.root(), dir.path().join("paid-cache"));
        let key = "paid-traffic/site/2025/week-07/categorical.json.gz";

        assert!(!store.exists(key).await.expect("exists"));
        store.put(key, b"first".to_vec()).await.expect("put first");
        store.put(key, b"second".to_vec()).await.expect("put second");

        assert!(store.exists(key).await.expect("exists"));
        assert_eq!(store.get(key).await.expect("get"), b"second".to_vec());
        assert!(dir.path().join("paid-cache").join(key).exists());

        let leftovers = std::fs::read_dir(dir.path().join("paid-cache/paid-traffic/site/2025/week-07"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn fs_store_reports_missing_objects_and_bad_keys() {
        let dir = tempdir().expect("tempdir");
        let store = FsCacheStore::new(dir.path(), "bucket");
        assert!(matches!(store.get("nope.json.gz").await, Err(CacheError::NotFound(_))));
        assert!(matches!(store.object_path("../escape"), Err(CacheError::InvalidKey(_))));
        assert!(matches!(store.object_path("a//b"), Err(CacheError::InvalidKey(_))));
        assert!(matches!(store.object_path(""), Err(CacheError::InvalidKey(_))));
    }

    #[test]
    fn gzip_json_round_trip() {
        let rows = serde_json::json!([{ "url": "https://example.com/a", "pageviews": "3000" }]);
        let compressed = gzip_json(&rows).expect("gzip");
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
        let back: serde_json::Value = gunzip_json(&compressed).expect("gunzip");
        assert_eq!(back, rows);
        assert!(matches!(gunzip_json::<serde_json::Value>(b"not gzip"), Err(CacheError::Codec(_))));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retryable_statuses() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }
}
