//! Idempotency markers, rate limiting, HTTP plumbing and the document store for COVI.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use covi_core::{DocumentId, Record};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

/// Process-lifetime set of seen digests or source tokens. No eviction.
#[derive(Debug, Default)]
pub struct IdempotencyStore {
    seen: Mutex<HashSet<String>>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seen(&self, key: &str) -> bool {
        self.seen.lock().await.contains(key)
    }

    /// Returns `true` when the key was not seen before.
    pub async fn mark_seen(&self, key: impl Into<String>) -> bool {
        self.seen.lock().await.insert(key.into())
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.seen.lock().await.clear();
    }
}

/// Token bucket allowing `requests` calls per `period`. Callers over the rate wait.
#[derive(Debug)]
pub struct Throttle {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<ThrottleState>,
}

#[derive(Debug, Clone, Copy)]
struct ThrottleState {
    tokens: u32,
    last_refill: Instant,
}

impl Throttle {
    pub fn new(requests: u32, period: Duration) -> Self {
        let capacity = requests.max(1);
        Self {
            capacity,
            refill_every: period / capacity,
            state: Mutex::new(ThrottleState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub async fn acquire(&self) {
        if self.refill_every.is_zero() {
            return;
        }

        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(state.last_refill);
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()).min(u32::MAX as u128) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                if state.tokens == self.capacity {
                    state.last_refill = now;
                } else {
                    state.last_refill += self.refill_every * refills;
                }
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = self
                .refill_every
                .saturating_sub(now.saturating_duration_since(state.last_refill));
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Write `bytes` to `path` through a temp file in the same directory and a rename.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Statuses worth another attempt: the server is failing or asking us to slow down.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Bounded exponential backoff between attempts of one request.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based), or `None` once retries are spent.
    pub fn delay_before(&self, retry: u32) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let delay = self
            .initial_delay
            .checked_mul(2u32.saturating_pow(retry))
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: Vec<(String, String)>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(5),
            user_agent: Some("covi/0.1".to_string()),
            default_headers: Vec::new(),
            retry: RetryPolicy::default(),
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
    HttpStatus { status: u16, url: String, body: String },
}

/// JSON-over-HTTP client with timeouts and bounded retry.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            if value.is_empty() {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let mut value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_request", %method, url);
        self.send_with_retry(method, url, body).instrument(span).await
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }

            let delay = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    match self.retry.delay_before(retry).filter(|_| is_transient_status(status)) {
                        Some(delay) => {
                            debug!(%status, retry, "retrying http request");
                            delay
                        }
                        None => {
                            let url = resp.url().to_string();
                            let body = resp.text().await.unwrap_or_default();
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url,
                                body,
                            });
                        }
                    }
                }
                Err(err) => match self.retry.delay_before(retry).filter(|_| is_transient_error(&err)) {
                    Some(delay) => {
                        debug!(error = %err, retry, "retrying http request");
                        delay
                    }
                    None => return Err(FetchError::Request(err)),
                },
            };
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

/// A document as held by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: DocumentId,
    pub properties: Record,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store rejected {operation} for {id}: {message}")]
    Rejected {
        operation: &'static str,
        id: DocumentId,
        message: String,
    },
    #[error("document store {operation} request failed for {id}: {source}")]
    Request {
        operation: &'static str,
        id: DocumentId,
        #[source]
        source: FetchError,
    },
    #[error("unexpected document store payload for {id}: {source}")]
    Payload {
        id: DocumentId,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn from_fetch(operation: &'static str, id: DocumentId, err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, body, .. } => StoreError::Rejected {
                operation,
                id,
                message: weaviate_error_message(&body)
                    .unwrap_or_else(|| format!("http status {status}")),
            },
            source => StoreError::Request {
                operation,
                id,
                source,
            },
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All documents stored under `id`. More than one is an integrity violation.
    async fn query(&self, id: DocumentId) -> Result<Vec<StoredDocument>, StoreError>;

    async fn create(&self, id: DocumentId, properties: &Record) -> Result<(), StoreError>;

    async fn update(&self, id: DocumentId, properties: &Record) -> Result<(), StoreError>;
}

/// Document property names provisioned as text in the overview class.
pub const COMPANY_OVERVIEW_PROPERTIES: &[&str] = &[
    "address",
    "analystRatingBuy",
    "analystRatingHold",
    "analystRatingSell",
    "analystRatingStrongBuy",
    "analystRatingStrongSell",
    "analystTargetPrice",
    "assetType",
    "bookValue",
    "beta",
    "cIK",
    "country",
    "currency",
    "description",
    "dilutedEPSTTM",
    "dividendDate",
    "dividendPerShare",
    "dividendYield",
    "eBITDA",
    "ePS",
    "eVToEBITDA",
    "eVToRevenue",
    "exDividendDate",
    "exchange",
    "fiftyDayMovingAverage",
    "fiftytwoWeekHigh",
    "fiftytwoWeekLow",
    "fiscalYearEnd",
    "forwardPE",
    "grossProfitTTM",
    "industry",
    "latestQuarter",
    "marketCapitalization",
    "name",
    "operatingMarginTTM",
    "pEGRatio",
    "pERatio",
    "priceToBookRatio",
    "priceToSalesRatioTTM",
    "profitMargin",
    "quarterlyEarningsGrowthYOY",
    "quarterlyRevenueGrowthYOY",
    "returnOnAssetsTTM",
    "returnOnEquityTTM",
    "revenuePerShareTTM",
    "revenueTTM",
    "sector",
    "sharesOutstanding",
    "symbol",
    "trailingPE",
    "twohundredDayMovingAverage",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeaviateConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub openai_api_key: String,
    pub huggingface_api_key: String,
    pub class_name: String,
    pub initialize_schema: bool,
    pub drop_if_exists: bool,
    pub vectorizer: String,
    pub module_config: Option<Value>,
    pub throttle_requests: u32,
    pub throttle_period_ms: u64,
}

impl Default for WeaviateConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 8080,
            api_key: String::new(),
            openai_api_key: String::new(),
            huggingface_api_key: String::new(),
            class_name: "CompanyOverview".to_string(),
            initialize_schema: false,
            drop_if_exists: false,
            vectorizer: "none".to_string(),
            module_config: None,
            throttle_requests: 10,
            throttle_period_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaAction {
    Skipped,
    AlreadyPresent,
    Created,
    Recreated,
}

#[derive(Debug, Deserialize)]
struct WeaviateObject {
    #[serde(default)]
    properties: Record,
}

/// Pull the first `error[].message` out of a Weaviate error body.
pub fn weaviate_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .as_array()?
        .iter()
        .filter_map(|entry| entry.get("message").and_then(Value::as_str))
        .next()
        .map(str::to_string)
}

/// Weaviate REST client for one object class.
#[derive(Debug, Clone)]
pub struct WeaviateStore {
    http: HttpClient,
    base_url: String,
    config: WeaviateConfig,
}

impl WeaviateStore {
    pub fn new(config: WeaviateConfig, timeout: Duration) -> anyhow::Result<Self> {
        let mut default_headers = vec![
            ("X-OpenAI-Api-Key".to_string(), config.openai_api_key.clone()),
            ("X-HuggingFace-Api-Key".to_string(), config.huggingface_api_key.clone()),
        ];
        if !config.api_key.is_empty() {
            default_headers.push(("Authorization".to_string(), format!("Bearer {}", config.api_key)));
        }
        let http = HttpClient::new(HttpClientConfig {
            timeout,
            default_headers,
            ..Default::default()
        })
        .context("building weaviate http client")?;
        Ok(Self {
            http,
            base_url: format!("{}://{}:{}/v1", config.scheme, config.host, config.port),
            config,
        })
    }

    pub fn class_name(&self) -> &str {
        &self.config.class_name
    }

    fn object_url(&self, id: DocumentId) -> String {
        format!("{}/objects/{}/{}", self.base_url, self.config.class_name, id)
    }

    fn object_body(&self, id: DocumentId, properties: &Record) -> Value {
        json!({
            "class": self.config.class_name,
            "id": id,
            "properties": properties,
        })
    }

    pub fn schema_body(&self) -> Value {
        let properties: Vec<Value> = COMPANY_OVERVIEW_PROPERTIES
            .iter()
            .map(|name| json!({"name": name, "dataType": ["text"]}))
            .collect();
        let mut body = json!({
            "class": self.config.class_name,
            "vectorizer": self.config.vectorizer,
            "properties": properties,
        });
        if let Some(module_config) = &self.config.module_config {
            body["moduleConfig"] = module_config.clone();
        }
        body
    }

    async fn class_exists(&self) -> anyhow::Result<bool> {
        let url = format!("{}/schema/{}", self.base_url, self.config.class_name);
        match self.http.send(Method::GET, &url, None).await {
            Ok(_) => Ok(true),
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(false),
            Err(err) => Err(err).with_context(|| format!("checking schema {}", self.config.class_name)),
        }
    }

    /// Provision the overview class according to `initialize_schema` and `drop_if_exists`.
    pub async fn ensure_schema(&self) -> anyhow::Result<SchemaAction> {
        let name = &self.config.class_name;
        if !self.config.initialize_schema {
            debug!(name = %name, "skipping schema initialization");
            return Ok(SchemaAction::Skipped);
        }

        let exists = self.class_exists().await?;
        let dropped = exists && self.config.drop_if_exists;
        if dropped {
            debug!(name = %name, "dropping existing schema");
            let url = format!("{}/schema/{}", self.base_url, name);
            self.http
                .send(Method::DELETE, &url, None)
                .await
                .with_context(|| format!("dropping schema {name}"))?;
        }

        if exists && !dropped {
            return Ok(SchemaAction::AlreadyPresent);
        }

        info!(name = %name, "creating schema");
        let url = format!("{}/schema", self.base_url);
        self.http
            .send(Method::POST, &url, Some(&self.schema_body()))
            .await
            .with_context(|| format!("creating schema {name}"))?;
        Ok(if dropped {
            SchemaAction::Recreated
        } else {
            SchemaAction::Created
        })
    }
}

#[async_trait]
impl DocumentStore for WeaviateStore {
    async fn query(&self, id: DocumentId) -> Result<Vec<StoredDocument>, StoreError> {
        match self.http.send(Method::GET, &self.object_url(id), None).await {
            Ok(resp) => {
                let object: WeaviateObject = serde_json::from_slice(&resp.body)
                    .map_err(|source| StoreError::Payload { id, source })?;
                Ok(vec![StoredDocument {
                    id,
                    properties: object.properties,
                }])
            }
            Err(FetchError::HttpStatus { status: 404, .. }) => Ok(Vec::new()),
            Err(err) => Err(StoreError::from_fetch("query", id, err)),
        }
    }

    async fn create(&self, id: DocumentId, properties: &Record) -> Result<(), StoreError> {
        let url = format!("{}/objects", self.base_url);
        self.http
            .send(Method::POST, &url, Some(&self.object_body(id, properties)))
            .await
            .map(|_| ())
            .map_err(|err| StoreError::from_fetch("create", id, err))
    }

    async fn update(&self, id: DocumentId, properties: &Record) -> Result<(), StoreError> {
        self.http
            .send(Method::PUT, &self.object_url(id), Some(&self.object_body(id, properties)))
            .await
            .map(|_| ())
            .map_err(|err| StoreError::from_fetch("update", id, err))
    }
}

/// Document store held in process memory; counts every call it serves.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: Mutex<Vec<StoredDocument>>,
    queries: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert without any uniqueness check.
    pub async fn insert_raw(&self, document: StoredDocument) {
        self.documents.lock().await.push(document);
    }

    pub async fn documents(&self) -> Vec<StoredDocument> {
        self.documents.lock().await.clone()
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn query(&self, id: DocumentId) -> Result<Vec<StoredDocument>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .documents
            .lock()
            .await
            .iter()
            .filter(|doc| doc.id == id)
            .cloned()
            .collect())
    }

    async fn create(&self, id: DocumentId, properties: &Record) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut documents = self.documents.lock().await;
        if documents.iter().any(|doc| doc.id == id) {
            return Err(StoreError::Rejected {
                operation: "create",
                id,
                message: format!("id '{id}' already exists"),
            });
        }
        documents.push(StoredDocument {
            id,
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn update(&self, id: DocumentId, properties: &Record) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut documents = self.documents.lock().await;
        match documents.iter_mut().find(|doc| doc.id == id) {
            Some(doc) => {
                doc.properties = properties.clone();
                Ok(())
            }
            None => Err(StoreError::Rejected {
                operation: "update",
                id,
                message: "no object with this id".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn idempotency_store_marks_each_key_once() {
        let store = Arc::new(IdempotencyStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.mark_seen("digest-a").await }));
        }

        let mut newly_added = 0;
        for handle in handles {
            if handle.await.unwrap() {
                newly_added += 1;
            }
        }

        assert_eq!(newly_added, 1);
        assert!(store.seen("digest-a").await);
        assert!(!store.seen("digest-b").await);
        assert_eq!(store.len().await, 1);

        store.clear().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_blocks_until_capacity_returns() {
        let throttle = Throttle::new(2, Duration::from_secs(1));
        let start = Instant::now();

        throttle.acquire().await;
        throttle.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(1));

        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_refills_to_capacity_after_idle_period() {
        let throttle = Throttle::new(3, Duration::from_secs(3));
        for _ in 0..3 {
            throttle.acquire().await;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        let start = Instant::now();
        for _ in 0..3 {
            throttle.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test]
    async fn unlimited_throttle_never_waits() {
        let throttle = Throttle::unlimited();
        for _ in 0..100 {
            throttle.acquire().await;
        }
    }

    #[tokio::test]
    async fn atomic_write_replaces_content_without_leftovers() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("company-overview.json");

        write_atomically(&path, b"[1]").await.expect("first write");
        write_atomically(&path, b"[2]").await.expect("second write");

        assert_eq!(std::fs::read(&path).unwrap(), b"[2]");
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    /// Serves canned responses in order, one connection each, counting requests.
    async fn serve_responses(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                counter.fetch_add(1, Ordering::SeqCst);
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });
        (format!("http://{addr}/v1/objects"), served)
    }

    fn quick_client(retries: u32) -> HttpClient {
        HttpClient::new(HttpClientConfig {
            retry: RetryPolicy {
                retries,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap()
    }

    const UNAVAILABLE: &str =
        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    const OK: &str =
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}";
    const UNPROCESSABLE: &str = "HTTP/1.1 422 Unprocessable Entity\r\ncontent-type: application/json\r\ncontent-length: 30\r\nconnection: close\r\n\r\n{\"error\":[{\"message\":\"nope\"}]}";

    #[tokio::test]
    async fn transient_statuses_are_retried_until_success() {
        let (url, served) = serve_responses(vec![UNAVAILABLE, UNAVAILABLE, OK]).await;

        let resp = quick_client(3).send(Method::GET, &url, None).await.unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"{}");
        assert_eq!(served.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_the_configured_bound() {
        let (url, served) = serve_responses(vec![UNAVAILABLE, UNAVAILABLE, OK]).await;

        let err = quick_client(1).send(Method::GET, &url, None).await.unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(served.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_fail_at_once_and_keep_the_body() {
        let (url, served) = serve_responses(vec![UNPROCESSABLE, OK]).await;

        let err = quick_client(3)
            .send(Method::GET, &url, None)
            .await
            .unwrap_err();

        match err {
            FetchError::HttpStatus { status, body, .. } => {
                assert_eq!(status, 422);
                assert_eq!(weaviate_error_message(&body).as_deref(), Some("nope"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(served.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_delays_double_up_to_the_cap() {
        let policy = RetryPolicy {
            retries: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
        };
        let delays: Vec<_> = (0..5).map(|retry| policy.delay_before(retry)).collect();
        assert_eq!(
            delays,
            [
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(300)),
                Some(Duration::from_millis(300)),
                None,
            ]
        );
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn weaviate_error_body_is_summarized() {
        let body = r#"{"error":[{"message":"id '1' already exists"},{"message":"second"}]}"#;
        assert_eq!(weaviate_error_message(body).as_deref(), Some("id '1' already exists"));
        assert_eq!(weaviate_error_message("not json"), None);
        assert_eq!(weaviate_error_message(r#"{"error":[]}"#), None);
    }

    #[test]
    fn weaviate_urls_and_schema_follow_config() {
        let store = WeaviateStore::new(
            WeaviateConfig {
                host: "weaviate.local".to_string(),
                port: 9090,
                module_config: Some(json!({"text2vec-openai": {"model": "ada"}})),
                vectorizer: "text2vec-openai".to_string(),
                ..Default::default()
            },
            Duration::from_secs(5),
        )
        .expect("store");
        let id = DocumentId::for_natural_key("ABC");

        assert_eq!(
            store.object_url(id),
            format!("http://weaviate.local:9090/v1/objects/CompanyOverview/{id}")
        );
        let schema = store.schema_body();
        assert_eq!(schema["class"], "CompanyOverview");
        assert_eq!(schema["vectorizer"], "text2vec-openai");
        assert_eq!(schema["moduleConfig"]["text2vec-openai"]["model"], "ada");
        assert_eq!(
            schema["properties"].as_array().unwrap().len(),
            COMPANY_OVERVIEW_PROPERTIES.len()
        );
    }

    #[tokio::test]
    async fn in_memory_store_rejects_duplicate_creates_and_unknown_updates() {
        let store = InMemoryDocumentStore::new();
        let id = DocumentId::for_natural_key("ABC");
        let mut props = Record::new();
        props.insert("symbol".into(), json!("ABC"));

        store.create(id, &props).await.expect("create");
        assert!(matches!(
            store.create(id, &props).await,
            Err(StoreError::Rejected { operation: "create", .. })
        ));
        assert!(matches!(
            store.update(DocumentId::for_natural_key("XYZ"), &props).await,
            Err(StoreError::Rejected { operation: "update", .. })
        ));
        assert_eq!(store.query(id).await.unwrap().len(), 1);
        assert_eq!(store.write_count(), 3);
        assert_eq!(store.query_count(), 1);
    }
}
