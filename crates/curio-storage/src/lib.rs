//! Payload storage, shard/ledger writers and rate-limited HTTP fetch utilities for curio.

pub mod archive;
pub mod ledger;
pub mod shard;
pub mod state;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use curio_core::{Bucket, CurioError, FileRecord, OutputPool};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use archive::{extract_archive, safe_entry_path, validate_archive, ArchiveKind};
pub use ledger::Ledger;
pub use shard::{read_shard, ClosedShard, ShardLimits, ShardWriter};
pub use state::{FsStageStore, MemoryStageStore, StageStore};

pub const CRATE_NAME: &str = "curio-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Map an arbitrary id onto a single safe path component.
pub fn safe_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Raw payload storage keyed by bucket/pool/target id.
#[derive(Debug, Clone)]
pub struct PayloadStore {
    root: PathBuf,
}

impl PayloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn target_dir(&self, bucket: Bucket, pool: OutputPool, target_id: &str) -> PathBuf {
        self.root
            .join(bucket.as_str())
            .join(pool.as_str())
            .join(safe_component(target_id))
    }

    /// Remove any partial payload left by an earlier attempt and recreate the directory.
    pub async fn reset_target_dir(&self, dir: &Path) -> anyhow::Result<()> {
        if fs::try_exists(dir)
            .await
            .with_context(|| format!("checking payload dir {}", dir.display()))?
        {
            fs::remove_dir_all(dir)
                .await
                .with_context(|| format!("clearing payload dir {}", dir.display()))?;
        }
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating payload dir {}", dir.display()))
    }

    /// Write bytes via a temp file and atomic rename so readers never see partial files.
    pub async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<FileRecord> {
        let parent = path
            .parent()
            .with_context(|| format!("payload path {} has no parent", path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating payload directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload file {}", temp_path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("syncing temp payload file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp payload {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(FileRecord {
            path: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            sha256: sha256_hex(bytes),
            bytes: bytes.len() as u64,
        })
    }

    /// Recursively list regular files under `dir` with checksums, sorted by relative path.
    pub fn list_files(dir: &Path) -> anyhow::Result<Vec<FileRecord>> {
        let mut out = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current)
                .with_context(|| format!("reading {}", current.display()))?;
            for entry in entries {
                let entry = entry.with_context(|| format!("reading {}", current.display()))?;
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .with_context(|| format!("stat {}", path.display()))?;
                if file_type.is_dir() {
                    if path.file_name().is_some_and(|n| n == ".git") {
                        continue;
                    }
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') && name.ends_with(".tmp") {
                    continue;
                }
                let bytes =
                    std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                let rel = path
                    .strip_prefix(dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                out.push(FileRecord {
                    path: rel,
                    sha256: sha256_hex(&bytes),
                    bytes: bytes.len() as u64,
                });
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

/// Compare a computed digest with a declared one (case-insensitive, optional `sha256:` prefix).
pub fn verify_checksum(name: &str, expected: Option<&str>, actual: &str) -> Result<(), CurioError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let expected = expected.trim();
    let expected = expected.strip_prefix("sha256:").unwrap_or(expected);
    if expected.eq_ignore_ascii_case(actual) {
        Ok(())
    } else {
        Err(CurioError::integrity(format!(
            "checksum mismatch for {name}: expected {expected}, got {actual}"
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
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

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive retryable failures that open the breaker for a host.
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub per_host_bucket: Option<TokenBucketConfig>,
    pub breaker: BreakerConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            per_host_bucket: None,
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct HostHealth {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Per-host limits shared by every worker in a run.
#[derive(Debug)]
struct HostSlot {
    concurrency: Arc<Semaphore>,
    bucket: Option<Arc<SimpleTokenBucket>>,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host_bucket: Option<TokenBucketConfig>,
    hosts: Mutex<HashMap<String, Arc<HostSlot>>>,
    health: Mutex<HashMap<String, HostHealth>>,
    breaker: BreakerConfig,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("host {host} cooling down for {remaining_ms}ms after repeated failures")]
    CoolingDown { host: String, remaining_ms: u64 },
    #[error("fetcher shut down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::CoolingDown { .. } => RetryDisposition::Retryable,
            FetchError::InvalidUrl(_) | FetchError::Closed => RetryDisposition::NonRetryable,
        }
    }

    pub fn into_curio(self, url: &str) -> CurioError {
        match self.disposition() {
            RetryDisposition::Retryable => CurioError::transient(url, self.to_string()),
            RetryDisposition::NonRetryable => CurioError::permanent(url, self.to_string()),
        }
    }
}

/// Host key used for rate limiting and breaker bookkeeping.
pub fn host_key(url: &str) -> Result<String, FetchError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?
        .to_ascii_lowercase();
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

const EVIDENCE_HEADERS: [&str; 4] = ["content-type", "etag", "last-modified", "content-length"];

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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host_bucket: config.per_host_bucket,
            hosts: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
            breaker: config.breaker,
        })
    }

    async fn host_slot(&self, host: &str) -> Arc<HostSlot> {
        let mut map = self.hosts.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostSlot {
                    concurrency: Arc::new(Semaphore::new(self.per_host_limit)),
                    bucket: self
                        .per_host_bucket
                        .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every))),
                })
            })
            .clone()
    }

    async fn check_breaker(&self, host: &str) -> Result<(), FetchError> {
        let mut health = self.health.lock().await;
        let Some(entry) = health.get_mut(host) else {
            return Ok(());
        };
        match entry.open_until {
            Some(until) if until > Instant::now() => Err(FetchError::CoolingDown {
                host: host.to_string(),
                remaining_ms: until.saturating_duration_since(Instant::now()).as_millis() as u64,
            }),
            Some(_) => {
                // Half-open: let one request try the host again.
                entry.open_until = None;
                entry.consecutive_failures = self.breaker.failure_threshold.saturating_sub(1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn record_outcome(&self, host: &str, failed: bool) {
        let mut health = self.health.lock().await;
        let entry = health.entry(host.to_string()).or_default();
        if !failed {
            *entry = HostHealth::default();
            return;
        }
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.breaker.failure_threshold.max(1) {
            warn!(
                host,
                failures = entry.consecutive_failures,
                cooldown_ms = self.breaker.cooldown.as_millis() as u64,
                "opening host breaker"
            );
            entry.open_until = Some(Instant::now() + self.breaker.cooldown);
        }
    }

    /// Single GET attempt under the global, per-host and token-bucket limits.
    ///
    /// Retries are the caller's concern; this only classifies the outcome and
    /// feeds the host breaker.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let host = host_key(url)?;
        self.check_breaker(&host).await?;

        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let slot = self.host_slot(&host).await;
        let _host_permit = slot
            .concurrency
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = &slot.bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", %run_id, host = %host, url);
        let result = async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let headers = EVIDENCE_HEADERS
                .iter()
                .filter_map(|name| {
                    resp.headers()
                        .get(*name)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| (name.to_string(), v.to_string()))
                })
                .collect();
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                headers,
                body,
            })
        }
        .instrument(span)
        .await;

        let failed = matches!(&result, Err(err) if err.disposition() == RetryDisposition::Retryable);
        self.record_outcome(&host, failed).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn payload_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn safe_component_strips_separators() {
        assert_eq!(safe_component("org/set:v1"), "org_set_v1");
        assert_eq!(safe_component(".."), "_");
        assert_eq!(safe_component("chem-pubchem"), "chem-pubchem");
    }

    #[tokio::test]
    async fn atomic_writes_leave_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = PayloadStore::new(dir.path());
        let target_dir = store.target_dir(Bucket::Green, OutputPool::Permissive, "t1");
        store.reset_target_dir(&target_dir).await.expect("reset");

        let record = store
            .write_atomic(&target_dir.join("data.jsonl"), b"{\"text\":\"a\"}\n")
            .await
            .expect("write");
        assert_eq!(record.bytes, 13);

        let listed = PayloadStore::list_files(&target_dir).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "data.jsonl");
        assert_eq!(listed[0].sha256, record.sha256);
    }

    #[test]
    fn checksum_verification_accepts_prefixed_digest() {
        let actual = sha256_hex(b"abc");
        assert!(verify_checksum("f", Some(&format!("sha256:{}", actual.to_uppercase())), &actual).is_ok());
        assert!(verify_checksum("f", None, &actual).is_ok());
        let err = verify_checksum("f", Some("deadbeef"), &actual).unwrap_err();
        assert!(matches!(err, CurioError::Integrity(_)));
    }

    #[test]
    fn retry_delays_double_until_the_cap() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u128> = (0..6)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000]);
        // Shift overflow saturates instead of wrapping.
        assert_eq!(policy.delay_for_attempt(64), policy.max_delay);
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            breaker: BreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(30),
            },
            ..Default::default()
        })
        .expect("fetcher");
        let url = format!("{}/flaky", server.uri());
        let run_id = Uuid::new_v4();

        for _ in 0..2 {
            let err = fetcher.fetch_bytes(run_id, &url).await.unwrap_err();
            assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        }
        let err = fetcher.fetch_bytes(run_id, &url).await.unwrap_err();
        assert!(matches!(err, FetchError::CoolingDown { .. }));
        assert!(err.into_curio(&url).is_retryable());
    }

    #[tokio::test]
    async fn not_found_is_permanent_and_does_not_trip_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            breaker: BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(30),
            },
            ..Default::default()
        })
        .expect("fetcher");
        let url = format!("{}/missing", server.uri());
        for _ in 0..3 {
            let err = fetcher.fetch_bytes(Uuid::new_v4(), &url).await.unwrap_err();
            assert!(!err.into_curio(&url).is_retryable());
        }
    }

    #[tokio::test]
    async fn successful_fetch_captures_evidence_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/LICENSE"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_string("MIT License"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let resp = fetcher
            .fetch_bytes(Uuid::new_v4(), &format!("{}/LICENSE", server.uri()))
            .await
            .expect("fetch");
        assert_eq!(resp.body, b"MIT License");
        assert_eq!(resp.headers.get("etag").map(String::as_str), Some("\"v1\""));
    }
}
