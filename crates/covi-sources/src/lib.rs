//! Snapshot sources (embedded, local file, S3 object) and the company overview quote API.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use covi_core::{Batch, CompletedSnapshot, Record, RecordError};
use covi_storage::{write_atomically, FetchError, HttpClient, HttpClientConfig};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

/// Snapshot shipped with the binary.
pub const EMBEDDED_COMPANY_OVERVIEW: &str = include_str!("../data/company-overview.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Embedded,
    File,
    S3,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::Embedded => "embedded",
            SourceKind::File => "file",
            SourceKind::S3 => "s3",
        })
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    #[error("writing {location}: {message}")]
    Write { location: String, message: String },
    #[error("malformed snapshot at {location}: {source}")]
    Malformed {
        location: String,
        #[source]
        source: RecordError,
    },
    #[error("object store request for {location} failed: {message}")]
    ObjectStore { location: String, message: String },
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Records of one source fetch plus the source's own freshness signal.
#[derive(Debug, Clone)]
pub struct SourceRead {
    pub batch: Batch,
    pub freshness_token: Option<String>,
}

/// Authoritative location of the snapshot: read at the start of a run, written back at the end.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn location(&self) -> String;

    /// Freshness token available without downloading the content.
    async fn probe(&self) -> Result<Option<String>, SourceError>;

    async fn read(&self) -> Result<SourceRead, SourceError>;

    /// Replace the stored content; returns the freshness token of the new content.
    async fn write(&self, snapshot: &CompletedSnapshot) -> Result<Option<String>, SourceError>;
}

fn parse_batch(location: &str, bytes: &[u8]) -> Result<Batch, SourceError> {
    Batch::from_json_slice(bytes).map_err(|source| SourceError::Malformed {
        location: location.to_string(),
        source,
    })
}

/// Embedded snapshot. Write-back replaces the in-process copy only.
#[derive(Debug)]
pub struct EmbeddedSource {
    content: RwLock<Vec<u8>>,
}

impl EmbeddedSource {
    pub fn new() -> Self {
        Self::with_content(EMBEDDED_COMPANY_OVERVIEW.as_bytes())
    }

    pub fn with_content(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: RwLock::new(content.into()),
        }
    }

    pub async fn content(&self) -> Vec<u8> {
        self.content.read().await.clone()
    }
}

impl Default for EmbeddedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotSource for EmbeddedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Embedded
    }

    fn location(&self) -> String {
        "embedded:data/company-overview.json".to_string()
    }

    async fn probe(&self) -> Result<Option<String>, SourceError> {
        Ok(None)
    }

    async fn read(&self) -> Result<SourceRead, SourceError> {
        let content = self.content.read().await;
        Ok(SourceRead {
            batch: parse_batch(&self.location(), &content)?,
            freshness_token: None,
        })
    }

    async fn write(&self, snapshot: &CompletedSnapshot) -> Result<Option<String>, SourceError> {
        let bytes = snapshot.to_pretty_json()?;
        *self.content.write().await = bytes;
        Ok(None)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileSourceConfig {
    pub directory: PathBuf,
    pub file_name: String,
    pub watch: bool,
    pub watch_period_ms: u64,
    pub update: bool,
}

impl Default for FileSourceConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data"),
            file_name: "company-overview.json".to_string(),
            watch: false,
            watch_period_ms: 60_000,
            update: false,
        }
    }
}

impl FileSourceConfig {
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.file_name)
    }

    pub fn watch_period(&self) -> Duration {
        Duration::from_millis(self.watch_period_ms)
    }
}

/// Local JSON file. The freshness token is the modification time and length.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> SourceError {
        SourceError::Io {
            location: self.location(),
            source,
        }
    }

    async fn file_token(&self) -> Result<String, SourceError> {
        let metadata = fs::metadata(&self.path).await.map_err(|err| self.io_error(err))?;
        let modified = metadata.modified().map_err(|err| self.io_error(err))?;
        let nanos = modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Ok(format!("{nanos}:{}", metadata.len()))
    }
}

#[async_trait]
impl SnapshotSource for FileSource {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn probe(&self) -> Result<Option<String>, SourceError> {
        self.file_token().await.map(Some)
    }

    async fn read(&self) -> Result<SourceRead, SourceError> {
        let token = self.file_token().await?;
        let bytes = fs::read(&self.path).await.map_err(|err| self.io_error(err))?;
        debug!(name = %self.location(), bytes = bytes.len(), "picked up file");
        Ok(SourceRead {
            batch: parse_batch(&self.location(), &bytes)?,
            freshness_token: Some(token),
        })
    }

    async fn write(&self, snapshot: &CompletedSnapshot) -> Result<Option<String>, SourceError> {
        let bytes = snapshot.to_pretty_json()?;
        write_atomically(&self.path, &bytes)
            .await
            .map_err(|err| SourceError::Write {
                location: self.location(),
                message: format!("{err:#}"),
            })?;
        self.file_token().await.map(Some)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3SourceConfig {
    pub access_key: String,
    pub secret_key: String,
    pub bucket_name: String,
    pub region_name: String,
    pub file_name: String,
    pub endpoint: Option<String>,
    pub watch: bool,
    pub watch_period_ms: u64,
    pub update: bool,
}

impl Default for S3SourceConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            bucket_name: "company-overview".to_string(),
            region_name: "us-east-1".to_string(),
            file_name: "company-overview.json".to_string(),
            endpoint: None,
            watch: false,
            watch_period_ms: 60_000,
            update: false,
        }
    }
}

impl S3SourceConfig {
    pub fn watch_period(&self) -> Duration {
        Duration::from_millis(self.watch_period_ms)
    }
}

/// S3 object. The freshness token is the object's e-tag.
#[derive(Debug, Clone)]
pub struct S3Source {
    client: Client,
    bucket: String,
    key: String,
}

impl S3Source {
    pub fn new(config: &S3SourceConfig) -> Self {
        let credentials = Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "covi",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(config.region_name.clone()))
            .credentials_provider(credentials)
            .behavior_version(BehaviorVersion::latest());
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket_name.clone(),
            key: config.file_name.clone(),
        }
    }

    fn object_store_error(&self, err: impl std::error::Error) -> SourceError {
        SourceError::ObjectStore {
            location: self.location(),
            message: DisplayErrorContext(err).to_string(),
        }
    }
}

fn normalize_etag(etag: Option<&str>) -> Option<String> {
    etag.map(|tag| tag.trim_matches('"').to_string())
        .filter(|tag| !tag.is_empty())
}

#[async_trait]
impl SnapshotSource for S3Source {
    fn kind(&self) -> SourceKind {
        SourceKind::S3
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    async fn probe(&self) -> Result<Option<String>, SourceError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|err| self.object_store_error(err))?;
        Ok(normalize_etag(head.e_tag()))
    }

    async fn read(&self) -> Result<SourceRead, SourceError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|err| self.object_store_error(err))?;
        let freshness_token = normalize_etag(resp.e_tag());
        debug!(key = %self.key, s3hash = ?freshness_token, "downloading s3 object");
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|err| self.object_store_error(err))?
            .into_bytes();
        Ok(SourceRead {
            batch: parse_batch(&self.location(), &bytes)?,
            freshness_token,
        })
    }

    async fn write(&self, snapshot: &CompletedSnapshot) -> Result<Option<String>, SourceError> {
        let bytes = snapshot.to_pretty_json()?;
        let resp = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type("application/json")
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| self.object_store_error(err))?;
        Ok(normalize_etag(resp.e_tag()))
    }
}

pub fn source_for(
    kind: SourceKind,
    file: &FileSourceConfig,
    s3: &S3SourceConfig,
) -> Arc<dyn SnapshotSource> {
    match kind {
        SourceKind::Embedded => Arc::new(EmbeddedSource::new()),
        SourceKind::File => Arc::new(FileSource::new(file.path())),
        SourceKind::S3 => Arc::new(S3Source::new(s3)),
    }
}

/// Result of asking the quote API for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub enum QuoteOutcome {
    Record(Record),
    NoData,
    Error(String),
}

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid quote api url: {0}")]
    Url(String),
}

#[async_trait]
pub trait QuoteApi: Send + Sync {
    async fn fetch_overview(&self, symbol: &str) -> Result<QuoteOutcome, QuoteError>;
}

fn message_text(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Classify an Alpha Vantage response body.
pub fn classify_overview_body(body: &[u8]) -> QuoteOutcome {
    if body.iter().all(u8::is_ascii_whitespace) {
        return QuoteOutcome::NoData;
    }
    match serde_json::from_slice::<Value>(body) {
        Err(err) => QuoteOutcome::Error(format!("unparseable response: {err}")),
        Ok(Value::Null) => QuoteOutcome::NoData,
        Ok(Value::Object(map)) if map.is_empty() => QuoteOutcome::NoData,
        Ok(Value::Object(map)) => {
            if let Some(message) = map.get("Error Message") {
                return QuoteOutcome::Error(message_text(message));
            }
            if map.len() == 1 {
                if let Some(notice) = map.get("Information").or_else(|| map.get("Note")) {
                    return QuoteOutcome::Error(message_text(notice));
                }
            }
            QuoteOutcome::Record(map)
        }
        Ok(other) => QuoteOutcome::Error(format!("unexpected payload: {other}")),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlphaVantageConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub function: String,
    pub api_key: String,
    pub throttle_requests: u32,
    pub throttle_period_ms: u64,
}

impl Default for AlphaVantageConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            host: "www.alphavantage.co".to_string(),
            port: 443,
            path: "query".to_string(),
            function: "OVERVIEW".to_string(),
            api_key: "demo".to_string(),
            throttle_requests: 5,
            throttle_period_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlphaVantageClient {
    http: HttpClient,
    config: AlphaVantageConfig,
}

impl AlphaVantageClient {
    pub fn new(config: AlphaVantageConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout,
            ..Default::default()
        })?;
        Ok(Self { http, config })
    }

    pub fn overview_url(&self, symbol: &str) -> Result<Url, QuoteError> {
        let base = format!(
            "{}://{}:{}/{}",
            self.config.scheme,
            self.config.host,
            self.config.port,
            self.config.path.trim_start_matches('/')
        );
        let function = self.config.function.to_uppercase();
        Url::parse_with_params(
            &base,
            [
                ("function", function.as_str()),
                ("symbol", symbol),
                ("apikey", self.config.api_key.as_str()),
            ],
        )
        .map_err(|err| QuoteError::Url(err.to_string()))
    }
}

#[async_trait]
impl QuoteApi for AlphaVantageClient {
    async fn fetch_overview(&self, symbol: &str) -> Result<QuoteOutcome, QuoteError> {
        let url = self.overview_url(symbol)?;
        let resp = self.http.send(Method::GET, url.as_str(), None).await?;
        Ok(classify_overview_body(&resp.body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covi_core::{natural_key, Snapshot};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn embedded_snapshot_parses_and_is_key_sorted() {
        let batch = Batch::from_json_slice(EMBEDDED_COMPANY_OVERVIEW.as_bytes()).unwrap();
        let keys: Vec<_> = batch.records.iter().filter_map(natural_key).collect();
        assert_eq!(keys, vec!["AAPL", "IBM", "MSFT"]);
        assert_eq!(Snapshot::seeded(&batch.records).complete().digest, batch.digest);
    }

    #[tokio::test]
    async fn embedded_write_back_replaces_in_process_copy() {
        let source = EmbeddedSource::with_content(br#"[{"Symbol":"B"},{"Symbol":"A"}]"#.to_vec());
        let first = source.read().await.unwrap();
        assert!(first.freshness_token.is_none());

        let completed = Snapshot::seeded(&first.batch.records).complete();
        source.write(&completed).await.unwrap();

        let second = source.read().await.unwrap();
        assert_eq!(second.batch.digest, completed.digest);
        let keys: Vec<_> = second.batch.records.iter().filter_map(natural_key).collect();
        assert_eq!(keys, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn file_source_round_trips_and_reports_new_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("company-overview.json");
        std::fs::write(&path, br#"[{"Symbol":"IBM","Name":"IBM"}]"#).unwrap();
        let source = FileSource::new(&path);

        let read = source.read().await.unwrap();
        assert_eq!(read.freshness_token, source.probe().await.unwrap());

        let completed = Snapshot::seeded(&read.batch.records)
            .fold("AAPL", json!({"Symbol": "AAPL", "Name": "Apple"}).as_object().unwrap().clone())
            .complete();
        let token = source.write(&completed).await.unwrap();

        assert!(token.is_some());
        assert_eq!(token, source.probe().await.unwrap());
        let reread = source.read().await.unwrap();
        assert_eq!(reread.batch.digest, completed.digest);
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let source = FileSource::new(dir.path().join("absent.json"));
        assert!(matches!(source.read().await, Err(SourceError::Io { .. })));
        assert!(matches!(source.probe().await, Err(SourceError::Io { .. })));
    }

    #[tokio::test]
    async fn malformed_file_is_reported_with_location() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{\"Symbol\": \"IBM\"}").unwrap();
        let err = FileSource::new(&path).read().await.unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn etags_lose_their_quotes() {
        assert_eq!(normalize_etag(Some("\"abc123\"")).as_deref(), Some("abc123"));
        assert_eq!(normalize_etag(Some("\"\"")), None);
        assert_eq!(normalize_etag(None), None);
    }

    #[test]
    fn source_factory_matches_kind() {
        let file = FileSourceConfig::default();
        let s3 = S3SourceConfig {
            bucket_name: "overviews".to_string(),
            ..Default::default()
        };
        assert_eq!(source_for(SourceKind::Embedded, &file, &s3).kind(), SourceKind::Embedded);
        let file_source = source_for(SourceKind::File, &file, &s3);
        assert!(file_source.location().ends_with("company-overview.json"));
        assert_eq!(
            source_for(SourceKind::S3, &file, &s3).location(),
            "s3://overviews/company-overview.json"
        );
    }

    #[test]
    fn quote_bodies_are_classified() {
        assert_eq!(classify_overview_body(b""), QuoteOutcome::NoData);
        assert_eq!(classify_overview_body(b"null"), QuoteOutcome::NoData);
        assert_eq!(classify_overview_body(b" {} "), QuoteOutcome::NoData);
        assert_eq!(
            classify_overview_body(br#"{"Error Message": "Invalid API call."}"#),
            QuoteOutcome::Error("Invalid API call.".to_string())
        );
        assert_eq!(
            classify_overview_body(br#"{"Information": "rate limit reached"}"#),
            QuoteOutcome::Error("rate limit reached".to_string())
        );
        assert!(matches!(classify_overview_body(b"[1,2]"), QuoteOutcome::Error(_)));
        assert!(matches!(classify_overview_body(b"<html>"), QuoteOutcome::Error(_)));

        match classify_overview_body(br#"{"Symbol": "IBM", "Name": "IBM"}"#) {
            QuoteOutcome::Record(record) => assert_eq!(natural_key(&record), Some("IBM")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn overview_url_carries_function_symbol_and_key() {
        let client = AlphaVantageClient::new(
            AlphaVantageConfig {
                function: "overview".to_string(),
                api_key: "secret".to_string(),
                ..Default::default()
            },
            Duration::from_secs(5),
        )
        .unwrap();
        let url = client.overview_url("BRK.B").unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.alphavantage.co/query?function=OVERVIEW&symbol=BRK.B&apikey=secret"
        );
    }
}
