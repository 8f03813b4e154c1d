//! Catalog persistence plus HTTP fetch utilities for the tracker.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use patrack_core::CatalogEntry;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

mod catalog;

pub use catalog::{
    canonical_date, quote_ident, CatalogStore, SearchField, SearchRequest, SearchTerm,
    StoreError, TableIdent, TABLE_PLACEHOLDER,
};

pub const CRATE_NAME: &str = "patrack-storage";

#[derive(Debug, Clone)]
pub struct ArchivedDownload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed copy of every catalog file downloaded during a sync.
#[derive(Debug, Clone)]
pub struct DownloadArchive {
    root: PathBuf,
}

impl DownloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(&self, entry: &CatalogEntry, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let version = if entry.version.trim().is_empty() {
            "unversioned"
        } else {
            entry.version.as_str()
        };
        PathBuf::from(sanitize_segment(&entry.name))
            .join(sanitize_segment(version))
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes the bytes once per content hash, via a temp file and rename.
    pub async fn store_bytes(
        &self,
        entry: &CatalogEntry,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedDownload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.relative_path(entry, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let archived = |deduplicated| ArchivedDownload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating download directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking download path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp download {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp download {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp download {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp download {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Timeout,
    ConnectionRefused,
    HttpStatus,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("could not connect to {url}: {message}")]
    ConnectionRefused { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected error fetching {url}: {message}")]
    Unexpected { url: String, message: String },
}

impl NetworkError {
    pub fn kind(&self) -> NetworkErrorKind {
        match self {
            NetworkError::Timeout { .. } => NetworkErrorKind::Timeout,
            NetworkError::ConnectionRefused { .. } => NetworkErrorKind::ConnectionRefused,
            NetworkError::HttpStatus { .. } => NetworkErrorKind::HttpStatus,
            NetworkError::Unexpected { .. } => NetworkErrorKind::Unexpected,
        }
    }
}

pub fn classify_status(url: &str, status: StatusCode) -> Option<NetworkError> {
    if status.is_success() {
        None
    } else {
        Some(NetworkError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

pub fn classify_reqwest_error(url: &str, err: &reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout {
            url: url.to_string(),
        }
    } else if err.is_connect() {
        NetworkError::ConnectionRefused {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else if let Some(status) = err.status() {
        NetworkError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }
    } else {
        NetworkError::Unexpected {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { base_ms, max_ms } => {
                let factor = 1u64.checked_shl(attempt_index as u32).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// Which failures are retried, how often, and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub backoff: Backoff,
    pub retryable: Vec<NetworkErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed { delay_ms: 1_000 },
            retryable: vec![
                NetworkErrorKind::ConnectionRefused,
                NetworkErrorKind::HttpStatus,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
            retryable: Vec::new(),
        }
    }

    /// `attempts_made` counts the attempt that just failed.
    pub fn should_retry(&self, err: &NetworkError, attempts_made: usize) -> bool {
        attempts_made < self.max_attempts.max(1) && self.retryable.contains(&err.kind())
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts. `op` receives the 1-based attempt number.
pub async fn retry_with_policy<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, NetworkError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, NetworkError>>,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(&err, attempt) => {
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "request failed, retrying"
                );
                tokio::time::sleep(policy.backoff.delay_for_attempt(attempt - 1)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Anything that can serve the catalog page and the files it links to.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn get_text(&self, url: &str) -> Result<String, NetworkError>;
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, NetworkError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
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
            retry: config.retry,
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(url, &err))?;
        if let Some(err) = classify_status(url, response.status()) {
            return Err(err);
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| classify_reqwest_error(url, &err))?;
        Ok(body.to_vec())
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        retry_with_policy(&self.retry, |_| self.fetch_once(url))
            .instrument(info_span!("http_fetch", url))
            .await
    }
}

#[async_trait]
impl CatalogSource for HttpFetcher {
    async fn get_text(&self, url: &str) -> Result<String, NetworkError> {
        let bytes = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        self.fetch_bytes(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use patrack_core::Origin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn quick_policy(retryable: Vec<NetworkErrorKind>) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed { delay_ms: 0 },
            retryable,
        }
    }

    fn refused() -> NetworkError {
        NetworkError::ConnectionRefused {
            url: "https://catalog.example".into(),
            message: "refused".into(),
        }
    }

    #[test]
    fn download_hashing_is_stable() {
        let hash = DownloadArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn archive_deduplicates_identical_downloads() {
        let dir = tempdir().expect("tempdir");
        let archive = DownloadArchive::new(dir.path());
        let entry = CatalogEntry::new("ACS", "2022_01_01", Origin::Remote);

        let first = archive
            .store_bytes(&entry, "csv", b"Title,Publisher")
            .await
            .expect("first store");
        let second = archive
            .store_bytes(&entry, "csv", b"Title,Publisher")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("ACS/2022_01_01"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn default_policy_retries_only_refused_and_status_errors() {
        let policy = RetryPolicy::default();
        let timeout = NetworkError::Timeout {
            url: "u".into(),
        };
        let status = NetworkError::HttpStatus {
            status: 503,
            url: "u".into(),
        };

        assert!(policy.should_retry(&refused(), 1));
        assert!(policy.should_retry(&status, 2));
        assert!(!policy.should_retry(&status, 3));
        assert!(!policy.should_retry(&timeout, 1));
        assert_eq!(policy.backoff.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.backoff.delay_for_attempt(4), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base_ms: 100,
            max_ms: 350,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retryable_errors_use_every_attempt() {
        let calls = AtomicUsize::new(0);
        let policy = quick_policy(vec![NetworkErrorKind::ConnectionRefused]);
        let result: Result<(), _> = retry_with_policy(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(refused()) }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), NetworkErrorKind::ConnectionRefused);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let calls = AtomicUsize::new(0);
        let policy = quick_policy(vec![NetworkErrorKind::ConnectionRefused]);
        let result: Result<(), _> = retry_with_policy(&policy, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(NetworkError::Timeout {
                    url: "u".into(),
                })
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), NetworkErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let policy = quick_policy(vec![NetworkErrorKind::HttpStatus]);
        let value = retry_with_policy(&policy, |attempt| async move {
            if attempt < 2 {
                Err(NetworkError::HttpStatus {
                    status: 502,
                    url: "u".into(),
                })
            } else {
                Ok(attempt)
            }
        })
        .await
        .expect("second attempt succeeds");
        assert_eq!(value, 2);
    }
}
