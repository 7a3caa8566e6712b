//! Report persistence + resilient API fetch for repwatch.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use repwatch_core::{Report, WireReport};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "repwatch-storage";

/// Header carrying the static API key on every report API request.
pub const API_KEY_HEADER: &str = "XF-Api-Key";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading report store {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing report store {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("encoding report store: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no stored report with id {0}")]
    MissingReport(u64),
}

/// Durable map of report id to report, backed by a single JSON document whose
/// top-level keys are stringified report ids.
///
/// Mutations act on the in-memory map and mark it dirty; nothing reaches disk
/// until [`ReportStore::flush`], which replaces the document atomically.
/// Reads observe writes immediately, durability starts at flush.
#[derive(Debug)]
pub struct ReportStore {
    path: PathBuf,
    reports: BTreeMap<u64, Report>,
    dirty: bool,
}

impl ReportStore {
    /// Load the store document, or start empty when the file does not exist.
    /// An unreadable document is logged and treated as empty; the next flush
    /// replaces it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let reports = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(reports) => reports,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "report store document unreadable, starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        Ok(Self {
            path,
            reports,
            dirty: false,
        })
    }

    pub fn get(&self, report_id: u64) -> Option<&Report> {
        self.reports.get(&report_id)
    }

    pub fn all(&self) -> &BTreeMap<u64, Report> {
        &self.reports
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Upsert the full record at its report id.
    pub fn save(&mut self, report: Report) {
        self.reports.insert(report.report_id, report);
        self.dirty = true;
    }

    /// Replace only the comment sequence and latest-comment pointer of an
    /// existing record. Never creates a record; the caller guarantees the
    /// report is already stored.
    pub fn update_comments(&mut self, report: &Report) -> Result<(), StoreError> {
        let existing = self
            .reports
            .get_mut(&report.report_id)
            .ok_or(StoreError::MissingReport(report.report_id))?;
        existing.report_comment = report.report_comment.clone();
        existing.latest_report_comment = report.latest_report_comment.clone();
        self.dirty = true;
        Ok(())
    }

    /// Delete a record if present.
    pub fn remove(&mut self, report_id: u64) {
        if self.reports.remove(&report_id).is_some() {
            self.dirty = true;
        }
    }

    /// Delete every record whose id is not in `active_ids` and return the
    /// count removed. Flushes when anything was deleted so garbage collection
    /// survives a restart on its own.
    pub async fn remove_stale(&mut self, active_ids: &HashSet<u64>) -> Result<usize, StoreError> {
        let stale: Vec<u64> = self
            .reports
            .keys()
            .filter(|id| !active_ids.contains(id))
            .copied()
            .collect();
        for id in &stale {
            self.reports.remove(id);
        }
        if !stale.is_empty() {
            self.dirty = true;
            self.flush().await?;
        }
        Ok(stale.len())
    }

    /// Commit pending mutations: serialize the map and atomically replace the
    /// document via a temp file + rename. No-op when nothing is dirty.
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(&self.reports)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Write {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let temp_path = self.path.with_file_name(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: temp_path.clone(),
                source,
            })?;
        if let Err(source) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Write {
                path: self.path.clone(),
                source,
            });
        }

        self.dirty = false;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Server errors are worth retrying; anything else in the 4xx range is a
/// request we will keep getting wrong.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &TransportError) -> RetryDisposition {
    match err {
        TransportError::Connection(_) => RetryDisposition::Retryable,
        TransportError::Http(err) if err.is_timeout() || err.is_connect() || err.is_request() => {
            RetryDisposition::Retryable
        }
        TransportError::Http(_) => RetryDisposition::NonRetryable,
    }
}

/// Linear retry schedule: the delay before attempt `n + 1` is
/// `base_delay * n`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, completed_attempts: u32) -> Duration {
        self.base_delay.saturating_mul(completed_attempts)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// No response was received at all.
    #[error("connection failed: {0}")]
    Connection(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// One authenticated GET against the report endpoint. Production goes through
/// reqwest; tests script responses.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn get(&self, url: &str, api_key: &str) -> Result<ApiResponse, TransportError>;
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn get(&self, url: &str, api_key: &str) -> Result<ApiResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse { status, body })
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub api_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Fetches the current report collection from the forum API.
///
/// Never fails to the caller: 404 is the defined "no reports" signal, a body
/// without a usable `reports` array degrades to empty, retryable failures are
/// retried with linear backoff, and everything else degrades to empty after
/// logging. The caller cannot distinguish "zero reports" from "unreachable";
/// each path is logged distinctly instead.
pub struct ReportFetcher {
    transport: Box<dyn ApiTransport>,
    config: FetchConfig,
}

impl ReportFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(config.timeout)?;
        Ok(Self::with_transport(Box::new(transport), config))
    }

    pub fn with_transport(transport: Box<dyn ApiTransport>, config: FetchConfig) -> Self {
        Self { transport, config }
    }

    pub async fn fetch(&self) -> Vec<WireReport> {
        let endpoint = self.config.api_url.as_str();
        let max_attempts = self.config.backoff.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.transport.get(endpoint, &self.config.api_key).await {
                Ok(response) => {
                    if response.status == StatusCode::NOT_FOUND {
                        debug!(endpoint, "report API returned 404, no open reports");
                        return Vec::new();
                    }
                    if response.status.is_success() {
                        return match parse_reports_body(&response.body) {
                            Some(reports) => reports,
                            None => {
                                warn!(endpoint, "report API response did not contain a reports array");
                                Vec::new()
                            }
                        };
                    }

                    let status = response.status;
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < max_attempts
                    {
                        warn!(
                            endpoint,
                            status = status.as_u16(),
                            attempt,
                            max_attempts,
                            "report API request failed, retrying"
                        );
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    error!(
                        endpoint,
                        status = status.as_u16(),
                        attempt,
                        max_attempts,
                        "report API request failed"
                    );
                    return Vec::new();
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::Retryable
                        && attempt < max_attempts
                    {
                        warn!(
                            endpoint,
                            error = %err,
                            attempt,
                            max_attempts,
                            "report API request failed, retrying"
                        );
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    error!(
                        endpoint,
                        error = %err,
                        attempt,
                        max_attempts,
                        "report API request failed, giving up"
                    );
                    return Vec::new();
                }
            }
        }

        error!(endpoint, "all report API retry attempts exhausted");
        Vec::new()
    }
}

/// Pull the `reports` array out of a response body. `None` covers every
/// malformed shape: not JSON, no `reports` field, not an array, or entries
/// that do not deserialize as reports.
fn parse_reports_body(body: &[u8]) -> Option<Vec<WireReport>> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let reports = value.get("reports")?;
    if !reports.is_array() {
        return None;
    }
    serde_json::from_value(reports.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tempfile::tempdir;

    fn wire_json(report_id: u64, comment_ids: &[u64]) -> serde_json::Value {
        json!({
            "report_id": report_id,
            "report_count": 1,
            "last_modified_date": 1_234_567_890,
            "first_report_date": 1_234_567_800,
            "content_info": {
                "message": "reported post",
                "node_id": 1,
                "node_name": "General",
                "post_id": 100,
                "thread_id": 50,
                "thread_title": "Test Thread",
                "user_id": 10,
                "username": "poster",
                "post_date": 1_234_567_800
            },
            "report_comment": comment_ids.iter().map(|&id| json!({
                "report_id": report_id,
                "report_comment_id": id,
                "comment_date": 1_234_567_890,
                "message": format!("comment {id}"),
                "username": "moderator",
                "state": "open"
            })).collect::<Vec<_>>()
        })
    }

    fn reports_body(report_ids: &[u64]) -> Vec<u8> {
        let reports: Vec<_> = report_ids.iter().map(|&id| wire_json(id, &[1])).collect();
        serde_json::to_vec(&json!({ "reports": reports })).unwrap()
    }

    fn stored_report(report_id: u64, comment_ids: &[u64]) -> Report {
        let wire: WireReport = serde_json::from_value(wire_json(report_id, comment_ids)).unwrap();
        Report::from_wire(wire, "https://example.com/forums/reports/")
    }

    struct StubTransport {
        responses: Mutex<VecDeque<Result<ApiResponse, TransportError>>>,
        calls: Arc<AtomicUsize>,
        seen_api_key: Arc<Mutex<Option<String>>>,
    }

    impl StubTransport {
        fn new(
            responses: Vec<Result<ApiResponse, TransportError>>,
        ) -> (Box<Self>, Arc<AtomicUsize>, Arc<Mutex<Option<String>>>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let seen_api_key = Arc::new(Mutex::new(None));
            let stub = Box::new(Self {
                responses: Mutex::new(responses.into()),
                calls: calls.clone(),
                seen_api_key: seen_api_key.clone(),
            });
            (stub, calls, seen_api_key)
        }
    }

    #[async_trait]
    impl ApiTransport for StubTransport {
        async fn get(&self, _url: &str, api_key: &str) -> Result<ApiResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen_api_key.lock().unwrap() = Some(api_key.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connection("stub exhausted".into())))
        }
    }

    fn ok(status: u16, body: Vec<u8>) -> Result<ApiResponse, TransportError> {
        Ok(ApiResponse {
            status: StatusCode::from_u16(status).unwrap(),
            body,
        })
    }

    fn network_error() -> Result<ApiResponse, TransportError> {
        Err(TransportError::Connection("connection refused".into()))
    }

    fn fetcher(responses: Vec<Result<ApiResponse, TransportError>>) -> (ReportFetcher, Arc<AtomicUsize>) {
        let (stub, calls, _seen) = StubTransport::new(responses);
        let config = FetchConfig {
            api_url: "https://example.com/api/reports/".to_string(),
            api_key: "test-api-key".to_string(),
            timeout: Duration::from_secs(1),
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
        };
        (ReportFetcher::with_transport(stub, config), calls)
    }

    #[tokio::test]
    async fn fetch_returns_reports_on_success() {
        let (fetcher, calls) = fetcher(vec![ok(200, reports_body(&[1, 2]))]);
        let reports = fetcher.fetch().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].report_id, 1);
        assert_eq!(reports[1].report_id, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_sends_the_configured_api_key() {
        let (stub, _calls, seen) = StubTransport::new(vec![ok(200, reports_body(&[]))]);
        let config = FetchConfig {
            api_url: "https://example.com/api/reports/".to_string(),
            api_key: "test-api-key".to_string(),
            timeout: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        };
        let fetcher = ReportFetcher::with_transport(stub, config);
        fetcher.fetch().await;
        assert_eq!(seen.lock().unwrap().as_deref(), Some("test-api-key"));
    }

    #[tokio::test]
    async fn not_found_yields_empty_without_retry() {
        let (fetcher, calls) = fetcher(vec![ok(404, Vec::new())]);
        assert!(fetcher.fetch().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_reports_field_yields_empty_without_retry() {
        let body = serde_json::to_vec(&json!({ "something": "else" })).unwrap();
        let (fetcher, calls) = fetcher(vec![ok(200, body)]);
        assert!(fetcher.fetch().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_array_reports_field_yields_empty() {
        let body = serde_json::to_vec(&json!({ "reports": "nope" })).unwrap();
        let (fetcher, _calls) = fetcher(vec![ok(200, body)]);
        assert!(fetcher.fetch().await.is_empty());
    }

    #[tokio::test]
    async fn unparseable_body_yields_empty() {
        let (fetcher, calls) = fetcher(vec![ok(200, b"<html>oops</html>".to_vec())]);
        assert!(fetcher.fetch().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_errors_are_retried_until_success() {
        let (fetcher, calls) = fetcher(vec![
            network_error(),
            network_error(),
            ok(200, reports_body(&[1])),
        ]);
        let reports = fetcher.fetch().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let (fetcher, calls) = fetcher(vec![ok(500, Vec::new()), ok(200, reports_body(&[1]))]);
        let reports = fetcher.fetch().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (fetcher, calls) = fetcher(vec![ok(400, Vec::new())]);
        assert!(fetcher.fetch().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_after_all_retries_exhausted() {
        let (fetcher, calls) = fetcher(vec![network_error(), network_error(), network_error()]);
        assert!(fetcher.fetch().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_delays_grow_linearly() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn status_classification_matches_retry_policy() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn connection_errors_are_retryable() {
        let err = TransportError::Connection("timed out".into());
        assert_eq!(classify_transport_error(&err), RetryDisposition::Retryable);
    }

    #[tokio::test]
    async fn open_missing_file_starts_empty() {
        let dir = tempdir().unwrap();
        let store = ReportStore::open(dir.path().join("reports.json"))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn reads_observe_writes_before_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports.json");
        let mut store = ReportStore::open(path.clone()).await.unwrap();

        store.save(stored_report(1, &[1]));
        assert!(store.get(1).is_some());

        // Nothing was flushed, so a reopen sees nothing.
        let reopened = ReportStore::open(path).await.unwrap();
        assert!(reopened.is_empty());
    }

    #[tokio::test]
    async fn flush_makes_reports_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports.json");
        let mut store = ReportStore::open(path.clone()).await.unwrap();
        store.save(stored_report(1, &[1]));
        store.save(stored_report(2, &[1]));
        store.flush().await.unwrap();

        let reopened = ReportStore::open(path).await.unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get(1).unwrap().report_id, 1);
        let ids: Vec<u64> = reopened.all().keys().copied().collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn document_is_keyed_by_stringified_report_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports.json");
        let mut store = ReportStore::open(path.clone()).await.unwrap();
        store.save(stored_report(42, &[1]));
        store.flush().await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("42").is_some());
    }

    #[tokio::test]
    async fn update_comments_replaces_only_comment_subtrees() {
        let dir = tempdir().unwrap();
        let mut store = ReportStore::open(dir.path().join("reports.json"))
            .await
            .unwrap();
        store.save(stored_report(1, &[1]));

        let mut updated = stored_report(1, &[1, 2]);
        updated.report_count = 99;
        store.update_comments(&updated).unwrap();

        let stored = store.get(1).unwrap();
        assert_eq!(stored.report_comment.len(), 2);
        assert_eq!(stored.latest_comment_id(), Some(2));
        // Other fields keep their stored values.
        assert_eq!(stored.report_count, 1);
    }

    #[tokio::test]
    async fn update_comments_never_creates_a_record() {
        let dir = tempdir().unwrap();
        let mut store = ReportStore::open(dir.path().join("reports.json"))
            .await
            .unwrap();
        let err = store.update_comments(&stored_report(7, &[1])).unwrap_err();
        assert!(matches!(err, StoreError::MissingReport(7)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn removing_an_absent_report_is_not_an_error() {
        let dir = tempdir().unwrap();
        let mut store = ReportStore::open(dir.path().join("reports.json"))
            .await
            .unwrap();
        store.remove(999);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn remove_stale_deletes_inactive_ids_and_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports.json");
        let mut store = ReportStore::open(path.clone()).await.unwrap();
        for id in [1, 2, 3] {
            store.save(stored_report(id, &[1]));
        }
        store.flush().await.unwrap();

        let active: HashSet<u64> = [1].into_iter().collect();
        let removed = store.remove_stale(&active).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);

        // remove_stale flushes on its own.
        let reopened = ReportStore::open(path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get(1).is_some());
    }

    #[tokio::test]
    async fn remove_stale_with_all_active_removes_nothing() {
        let dir = tempdir().unwrap();
        let mut store = ReportStore::open(dir.path().join("reports.json"))
            .await
            .unwrap();
        store.save(stored_report(1, &[1]));
        let active: HashSet<u64> = [1].into_iter().collect();
        assert_eq!(store.remove_stale(&active).await.unwrap(), 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_document_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = ReportStore::open(path).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn flush_without_mutations_is_a_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reports.json");
        let mut store = ReportStore::open(path.clone()).await.unwrap();
        store.flush().await.unwrap();
        // No document is created for an empty, untouched store.
        assert!(!path.exists());
    }
}
