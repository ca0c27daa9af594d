//! Ingestion runs: reconciliation, upsert and write-back behind a single worker.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covi_core::{
    digest_record, natural_key, normalize_record, ChangeDigest, CompletedSnapshot, DocumentId,
    Record, Snapshot,
};
use covi_sources::{
    source_for, AlphaVantageClient, AlphaVantageConfig, FileSourceConfig, QuoteApi, QuoteOutcome,
    S3SourceConfig, SnapshotSource, SourceKind,
};
use covi_storage::{
    DocumentStore, IdempotencyStore, InMemoryDocumentStore, StoreError, Throttle, WeaviateConfig,
    WeaviateStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchIngestConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: SourceKind,
}

impl Default for BatchIngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: SourceKind::Embedded,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub enabled: bool,
    pub symbols: Vec<String>,
    pub period_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            symbols: Vec::new(),
            period_ms: 86_400_000,
        }
    }
}

impl PollerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStoreKind {
    Weaviate,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub batch_ingest: BatchIngestConfig,
    pub poller: PollerConfig,
    pub file: FileSourceConfig,
    pub s3: S3SourceConfig,
    pub alpha_vantage: AlphaVantageConfig,
    pub weaviate: WeaviateConfig,
    pub document_store: DocumentStoreKind,
    pub http_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            batch_ingest: BatchIngestConfig::default(),
            poller: PollerConfig::default(),
            file: FileSourceConfig::default(),
            s3: S3SourceConfig::default(),
            alpha_vantage: AlphaVantageConfig::default(),
            weaviate: WeaviateConfig::default(),
            document_store: DocumentStoreKind::Weaviate,
            http_timeout_secs: 20,
        }
    }
}

struct EnvLookup<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvLookup<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: String) -> String {
        self.optional(key).unwrap_or(default)
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.optional(key)
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(default)
    }

    fn number<T: FromStr>(&self, key: &str, default: T) -> T {
        self.optional(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

fn parse_source_kind(value: &str) -> Result<SourceKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "embedded" => Ok(SourceKind::Embedded),
        "file" => Ok(SourceKind::File),
        "s3" => Ok(SourceKind::S3),
        other => bail!("unknown batch ingest type '{other}' (expected embedded, file or s3)"),
    }
}

fn parse_document_store(value: &str) -> Result<DocumentStoreKind> {
    match value.trim().to_ascii_lowercase().as_str() {
        "weaviate" => Ok(DocumentStoreKind::Weaviate),
        "memory" => Ok(DocumentStoreKind::Memory),
        other => bail!("unknown document store '{other}' (expected weaviate or memory)"),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = EnvLookup { lookup };
        let d = AppConfig::default();

        let batch_kind = match env.optional("COVI_BATCH_INGEST_TYPE") {
            Some(value) => parse_source_kind(&value)?,
            None => d.batch_ingest.kind,
        };
        let document_store = match env.optional("COVI_DOCUMENT_STORE") {
            Some(value) => parse_document_store(&value)?,
            None => d.document_store,
        };
        let symbols = env
            .optional("COVI_POLLER_SYMBOLS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(d.poller.symbols);

        Ok(Self {
            batch_ingest: BatchIngestConfig {
                enabled: env.bool("COVI_BATCH_INGEST_ENABLED", d.batch_ingest.enabled),
                kind: batch_kind,
            },
            poller: PollerConfig {
                enabled: env.bool("COVI_POLLER_ENABLED", d.poller.enabled),
                symbols,
                period_ms: env.number("COVI_POLLER_PERIOD_MS", d.poller.period_ms),
            },
            file: FileSourceConfig {
                directory: env
                    .optional("COVI_FILE_DIRECTORY")
                    .map(Into::into)
                    .unwrap_or(d.file.directory),
                file_name: env.string("COVI_FILE_NAME", d.file.file_name),
                watch: env.bool("COVI_FILE_WATCH", d.file.watch),
                watch_period_ms: env.number("COVI_FILE_WATCH_PERIOD_MS", d.file.watch_period_ms),
                update: env.bool("COVI_FILE_UPDATE", d.file.update),
            },
            s3: S3SourceConfig {
                access_key: env.string("COVI_S3_ACCESS_KEY", d.s3.access_key),
                secret_key: env.string("COVI_S3_SECRET_KEY", d.s3.secret_key),
                bucket_name: env.string("COVI_S3_BUCKET", d.s3.bucket_name),
                region_name: env.string("COVI_S3_REGION", d.s3.region_name),
                file_name: env.string("COVI_S3_FILE_NAME", d.s3.file_name),
                endpoint: env.optional("COVI_S3_ENDPOINT").or(d.s3.endpoint),
                watch: env.bool("COVI_S3_WATCH", d.s3.watch),
                watch_period_ms: env.number("COVI_S3_WATCH_PERIOD_MS", d.s3.watch_period_ms),
                update: env.bool("COVI_S3_UPDATE", d.s3.update),
            },
            alpha_vantage: AlphaVantageConfig {
                scheme: env.string("COVI_ALPHA_VANTAGE_SCHEME", d.alpha_vantage.scheme),
                host: env.string("COVI_ALPHA_VANTAGE_HOST", d.alpha_vantage.host),
                port: env.number("COVI_ALPHA_VANTAGE_PORT", d.alpha_vantage.port),
                path: env.string("COVI_ALPHA_VANTAGE_PATH", d.alpha_vantage.path),
                function: env.string("COVI_ALPHA_VANTAGE_FUNCTION", d.alpha_vantage.function),
                api_key: env.string("COVI_ALPHA_VANTAGE_API_KEY", d.alpha_vantage.api_key),
                throttle_requests: env.number(
                    "COVI_ALPHA_VANTAGE_THROTTLE_REQUESTS",
                    d.alpha_vantage.throttle_requests,
                ),
                throttle_period_ms: env.number(
                    "COVI_ALPHA_VANTAGE_THROTTLE_PERIOD_MS",
                    d.alpha_vantage.throttle_period_ms,
                ),
            },
            weaviate: WeaviateConfig {
                scheme: env.string("COVI_WEAVIATE_SCHEME", d.weaviate.scheme),
                host: env.string("COVI_WEAVIATE_HOST", d.weaviate.host),
                port: env.number("COVI_WEAVIATE_PORT", d.weaviate.port),
                api_key: env.string("COVI_WEAVIATE_API_KEY", d.weaviate.api_key),
                openai_api_key: env.string("COVI_OPENAI_API_KEY", d.weaviate.openai_api_key),
                huggingface_api_key: env
                    .string("COVI_HUGGINGFACE_API_KEY", d.weaviate.huggingface_api_key),
                class_name: env.string("COVI_WEAVIATE_CLASS", d.weaviate.class_name),
                initialize_schema: env
                    .bool("COVI_WEAVIATE_INITIALIZE_SCHEMA", d.weaviate.initialize_schema),
                drop_if_exists: env.bool("COVI_WEAVIATE_DROP_IF_EXISTS", d.weaviate.drop_if_exists),
                vectorizer: env.string("COVI_WEAVIATE_VECTORIZER", d.weaviate.vectorizer),
                module_config: d.weaviate.module_config,
                throttle_requests: env
                    .number("COVI_WEAVIATE_THROTTLE_REQUESTS", d.weaviate.throttle_requests),
                throttle_period_ms: env
                    .number("COVI_WEAVIATE_THROTTLE_PERIOD_MS", d.weaviate.throttle_period_ms),
            },
            document_store,
            http_timeout_secs: env.number("COVI_HTTP_TIMEOUT_SECS", d.http_timeout_secs),
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing configuration yaml")
    }

    pub async fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Whether completed snapshots are persisted back to the configured source.
    pub fn write_back_enabled(&self) -> bool {
        match self.batch_ingest.kind {
            SourceKind::Embedded => true,
            SourceKind::File => self.file.update,
            SourceKind::S3 => self.s3.update,
        }
    }

    /// Re-ingest interval of the configured source, if it is watched.
    pub fn watch_period(&self) -> Option<Duration> {
        match self.batch_ingest.kind {
            SourceKind::Embedded => None,
            SourceKind::File => self.file.watch.then(|| self.file.watch_period()),
            SourceKind::S3 => self.s3.watch.then(|| self.s3.watch_period()),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("multiple documents found: id='{id}', objectCount='{count}'")]
    DuplicateDocuments { id: DocumentId, count: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl UpsertError {
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, UpsertError::DuplicateDocuments { .. })
    }
}

/// Create, update or leave alone one document, issuing at most one write.
pub struct UpsertEngine {
    store: Arc<dyn DocumentStore>,
    throttle: Arc<Throttle>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn DocumentStore>, throttle: Arc<Throttle>) -> Self {
        Self { store, throttle }
    }

    pub async fn upsert(
        &self,
        id: DocumentId,
        properties: &Record,
    ) -> Result<UpsertOutcome, UpsertError> {
        self.throttle.acquire().await;

        debug!(%id, "querying objects");
        let existing = self.store.query(id).await?;
        debug!(%id, object_count = existing.len(), "finished querying objects");

        match existing.as_slice() {
            [] => {
                debug!(%id, "creating object");
                self.store.create(id, properties).await?;
                Ok(UpsertOutcome::Created)
            }
            [current] if current.properties == *properties => {
                debug!(%id, "skipping update object");
                Ok(UpsertOutcome::Unchanged)
            }
            [_] => {
                debug!(%id, "updating object");
                self.store.update(id, properties).await?;
                Ok(UpsertOutcome::Updated)
            }
            many => Err(UpsertError::DuplicateDocuments {
                id,
                count: many.len(),
            }),
        }
    }
}

/// One unit of work admitted through the single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "source", rename_all = "snake_case")]
pub enum RunKind {
    Ingest(SourceKind),
    Poll,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Ingest(source) => write!(f, "ingest:{source}"),
            RunKind::Poll => f.write_str("poll"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    FreshnessTokenSeen,
    BatchDigestSeen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub natural_key: Option<String>,
    pub digest: ChangeDigest,
    pub error: String,
    pub integrity_violation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub batch_digest: Option<ChangeDigest>,
    pub snapshot_digest: Option<ChangeDigest>,
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped_symbols: usize,
    pub failures: Vec<RecordFailure>,
    pub snapshot_written: bool,
    pub write_error: Option<String>,
}

impl RunReport {
    fn start(kind: RunKind) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            kind,
            started_at: now,
            finished_at: now,
            outcome: RunOutcome::Completed,
            batch_digest: None,
            snapshot_digest: None,
            records: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            skipped_symbols: 0,
            failures: Vec::new(),
            snapshot_written: false,
            write_error: None,
        }
    }

    fn finish(mut self, outcome: RunOutcome) -> Self {
        self.outcome = outcome;
        self.finished_at = Utc::now();
        self
    }

    fn tally(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn fail(
        &mut self,
        key: Option<&str>,
        record: &Record,
        error: &dyn fmt::Display,
        integrity_violation: bool,
    ) {
        let digest = digest_record(record);
        let symbol = key.unwrap_or("<missing>");
        if integrity_violation {
            error!(run_id = %self.run_id, symbol, digest = %digest, error = %error, "document store integrity violation");
        } else {
            warn!(run_id = %self.run_id, symbol, digest = %digest, error = %error, "record processing failed");
        }
        self.failures.push(RecordFailure {
            natural_key: key.map(str::to_string),
            digest,
            error: error.to_string(),
            integrity_violation,
        });
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.outcome, RunOutcome::Skipped(_))
    }
}

/// Collaborators of a run, passed explicitly to the pipeline.
pub struct RunContext {
    pub source: Arc<dyn SnapshotSource>,
    pub quotes: Option<Arc<dyn QuoteApi>>,
    pub documents: Arc<dyn DocumentStore>,
    pub fetch_throttle: Arc<Throttle>,
    pub write_throttle: Arc<Throttle>,
    /// Batch digests and written snapshot digests.
    pub content_digests: Arc<IdempotencyStore>,
    /// File modification signals and object e-tags.
    pub source_tokens: Arc<IdempotencyStore>,
    pub write_back: bool,
    pub poll_symbols: Vec<String>,
}

pub struct IngestPipeline {
    ctx: RunContext,
    upsert: UpsertEngine,
}

impl IngestPipeline {
    pub fn new(ctx: RunContext) -> Self {
        let upsert = UpsertEngine::new(ctx.documents.clone(), ctx.write_throttle.clone());
        Self { ctx, upsert }
    }

    /// Wire the pipeline from configuration, provisioning the document store schema if asked to.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let timeout = config.http_timeout();
        let documents: Arc<dyn DocumentStore> = match config.document_store {
            DocumentStoreKind::Weaviate => {
                let store = WeaviateStore::new(config.weaviate.clone(), timeout)?;
                let action = store.ensure_schema().await?;
                info!(name = store.class_name(), ?action, "document store schema ready");
                Arc::new(store)
            }
            DocumentStoreKind::Memory => Arc::new(InMemoryDocumentStore::new()),
        };
        let quotes: Arc<dyn QuoteApi> =
            Arc::new(AlphaVantageClient::new(config.alpha_vantage.clone(), timeout)?);

        Ok(Self::new(RunContext {
            source: source_for(config.batch_ingest.kind, &config.file, &config.s3),
            quotes: Some(quotes),
            documents,
            fetch_throttle: Arc::new(Throttle::new(
                config.alpha_vantage.throttle_requests,
                Duration::from_millis(config.alpha_vantage.throttle_period_ms),
            )),
            write_throttle: Arc::new(Throttle::new(
                config.weaviate.throttle_requests,
                Duration::from_millis(config.weaviate.throttle_period_ms),
            )),
            content_digests: Arc::new(IdempotencyStore::new()),
            source_tokens: Arc::new(IdempotencyStore::new()),
            write_back: config.write_back_enabled(),
            poll_symbols: config.poller.symbols.clone(),
        }))
    }

    pub async fn run(&self, kind: RunKind) -> Result<RunReport> {
        if let RunKind::Ingest(source) = kind {
            if source != self.ctx.source.kind() {
                bail!(
                    "{kind} requested but the configured source is {}",
                    self.ctx.source.kind()
                );
            }
        }

        let report = RunReport::start(kind);
        let span = info_span!("run", run_id = %report.run_id, %kind);
        async move {
            info!("run started");
            let report = match kind {
                RunKind::Ingest(_) => self.run_ingest(report).await?,
                RunKind::Poll => self.run_poll(report).await?,
            };

            if !report.failures.is_empty() {
                warn!(
                    failures = report.failures.len(),
                    symbols = ?report
                        .failures
                        .iter()
                        .map(|f| f.natural_key.as_deref().unwrap_or("<missing>"))
                        .collect::<Vec<_>>(),
                    "run finished with record failures"
                );
            }
            info!(
                outcome = ?report.outcome,
                created = report.created,
                updated = report.updated,
                unchanged = report.unchanged,
                snapshot_written = report.snapshot_written,
                "run finished"
            );
            Ok::<_, anyhow::Error>(report)
        }
        .instrument(span)
        .await
    }

    async fn run_ingest(&self, mut report: RunReport) -> Result<RunReport> {
        let source = &self.ctx.source;
        let location = source.location();

        let probe = source
            .probe()
            .await
            .with_context(|| format!("checking freshness of {location}"))?;
        if let Some(token) = &probe {
            debug!(name = %location, token = %token, "checking source should download");
            if self.ctx.source_tokens.seen(token).await {
                debug!(name = %location, token = %token, "source unchanged since last run");
                return Ok(report.finish(RunOutcome::Skipped(SkipReason::FreshnessTokenSeen)));
            }
        }

        let read = source
            .read()
            .await
            .with_context(|| format!("reading {location}"))?;
        let batch = read.batch;
        report.batch_digest = Some(batch.digest.clone());

        debug!(name = %location, deterministic_hash = %batch.digest, "checking batch should process");
        if self.ctx.content_digests.seen(batch.digest.as_str()).await {
            if let Some(token) = read.freshness_token {
                self.ctx.source_tokens.mark_seen(token).await;
            }
            debug!(name = %location, deterministic_hash = %batch.digest, "batch already processed");
            return Ok(report.finish(RunOutcome::Skipped(SkipReason::BatchDigestSeen)));
        }
        info!(
            name = %location,
            deterministic_hash = %batch.digest,
            records = batch.records.len(),
            "processing batch"
        );

        let mut snapshot = Snapshot::seeded(&batch.records);
        for record in &batch.records {
            report.records += 1;
            let Some(key) = natural_key(record) else {
                report.fail(None, record, &"record has no Symbol", false);
                continue;
            };
            match self.process_record(key, record).await {
                Ok(outcome) => {
                    report.tally(outcome);
                    snapshot = snapshot.fold(key, record.clone());
                }
                Err(err) => {
                    let integrity = err.is_integrity_violation();
                    report.fail(Some(key), record, &err, integrity);
                }
            }
        }

        // Failed records stay eligible for the next trigger.
        let remember = report.failures.is_empty();
        if remember {
            self.ctx.content_digests.mark_seen(batch.digest.as_str()).await;
            if let Some(token) = read.freshness_token {
                self.ctx.source_tokens.mark_seen(token).await;
            }
        }

        self.write_back(snapshot.complete(), Some(&batch.digest), remember, &mut report)
            .await;
        Ok(report.finish(RunOutcome::Completed))
    }

    async fn run_poll(&self, mut report: RunReport) -> Result<RunReport> {
        let Some(quotes) = &self.ctx.quotes else {
            bail!("poll requested but no quote api client is configured");
        };

        let seed = if self.ctx.write_back {
            match self.ctx.source.read().await {
                Ok(read) => Some(read.batch),
                Err(err) => {
                    warn!(name = %self.ctx.source.location(), error = %err, "snapshot source unreadable; skipping write-back for this poll");
                    None
                }
            }
        } else {
            None
        };
        let mut snapshot = seed.as_ref().map(|batch| Snapshot::seeded(&batch.records));

        let symbols = self
            .ctx
            .poll_symbols
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty());
        for symbol in symbols {
            info!(symbol, "fetching company overview");
            self.ctx.fetch_throttle.acquire().await;
            let record = match quotes.fetch_overview(symbol).await {
                Ok(QuoteOutcome::Record(record)) => record,
                Ok(QuoteOutcome::NoData) => {
                    info!(symbol, message = "empty/null response returned from quote api", "unable to fetch company overview");
                    report.skipped_symbols += 1;
                    continue;
                }
                Ok(QuoteOutcome::Error(message)) => {
                    info!(symbol, message = %message, "unable to fetch company overview");
                    report.skipped_symbols += 1;
                    continue;
                }
                Err(err) => {
                    report.fail(Some(symbol), &Record::new(), &err, false);
                    continue;
                }
            };

            // The quote's own Symbol names the entity; the configured spelling may differ.
            let key = natural_key(&record).unwrap_or(symbol).to_string();
            report.records += 1;
            match self.process_record(&key, &record).await {
                Ok(outcome) => {
                    report.tally(outcome);
                    snapshot = snapshot.map(|s| s.fold(key, record));
                }
                Err(err) => {
                    let integrity = err.is_integrity_violation();
                    report.fail(Some(&key), &record, &err, integrity);
                }
            }
        }

        if let (Some(snapshot), Some(seed)) = (snapshot, seed) {
            self.write_back(snapshot.complete(), Some(&seed.digest), true, &mut report)
                .await;
        }
        Ok(report.finish(RunOutcome::Completed))
    }

    async fn process_record(
        &self,
        key: &str,
        record: &Record,
    ) -> Result<UpsertOutcome, UpsertError> {
        let id = DocumentId::for_natural_key(key);
        let properties = normalize_record(record);
        info!(symbol = %key, %id, "upserting object to document store");
        self.upsert.upsert(id, &properties).await
    }

    async fn write_back(
        &self,
        completed: CompletedSnapshot,
        source_digest: Option<&ChangeDigest>,
        remember: bool,
        report: &mut RunReport,
    ) {
        report.snapshot_digest = Some(completed.digest.clone());
        if !self.ctx.write_back {
            return;
        }

        let location = self.ctx.source.location();
        debug!(name = %location, deterministic_hash = %completed.digest, "checking snapshot should update");
        if source_digest == Some(&completed.digest) {
            debug!(name = %location, "snapshot matches source content");
            return;
        }
        if self.ctx.content_digests.seen(completed.digest.as_str()).await {
            debug!(name = %location, deterministic_hash = %completed.digest, "snapshot already written");
            return;
        }

        info!(name = %location, deterministic_hash = %completed.digest, records = completed.records.len(), "updating snapshot");
        match self.ctx.source.write(&completed).await {
            Ok(token) => {
                report.snapshot_written = true;
                if remember {
                    self.ctx.content_digests.mark_seen(completed.digest.as_str()).await;
                    if let Some(token) = token {
                        info!(name = %location, token = %token, "adding updated source token");
                        self.ctx.source_tokens.mark_seen(token).await;
                    }
                }
            }
            Err(err) => {
                error!(name = %location, deterministic_hash = %completed.digest, error = %err, "snapshot write-back failed");
                report.write_error = Some(err.to_string());
            }
        }
    }
}

/// Executes one unit of work at a time.
#[async_trait]
pub trait RunHandler: Send + Sync + 'static {
    async fn handle(&self, kind: RunKind) -> Result<RunReport>;
}

#[async_trait]
impl RunHandler for IngestPipeline {
    async fn handle(&self, kind: RunKind) -> Result<RunReport> {
        self.run(kind).await
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("single worker is shut down")]
    Closed,
    #[error("{0} was purged before it ran")]
    Purged(RunKind),
}

struct WorkItem {
    kind: RunKind,
    reply: Option<oneshot::Sender<Result<RunReport>>>,
}

/// Hand-off queue of capacity one in front of a single executing task.
#[derive(Clone)]
pub struct SingleWorker {
    tx: mpsc::Sender<WorkItem>,
}

/// Owner side of a [`SingleWorker`]. Dropping it stops the worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SingleWorker {
    pub fn spawn(handler: Arc<dyn RunHandler>) -> (Self, WorkerHandle) {
        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker_loop(handler, rx, shutdown_rx));
        (
            Self { tx },
            WorkerHandle {
                shutdown: shutdown_tx,
                join,
            },
        )
    }

    /// Queue a unit of work, waiting while the slot is occupied.
    pub async fn submit(&self, kind: RunKind) -> Result<(), SubmitError> {
        self.tx
            .send(WorkItem { kind, reply: None })
            .await
            .map_err(|_| SubmitError::Closed)
    }

    /// Queue a unit of work and wait for its report.
    pub async fn run(&self, kind: RunKind) -> Result<RunReport> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(WorkItem {
                kind,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SubmitError::Closed)?;
        done.await.map_err(|_| SubmitError::Purged(kind))?
    }
}

impl WorkerHandle {
    /// Let the in-flight run finish, then drop whatever is still queued.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.join.await.context("joining single worker")
    }
}

async fn worker_loop(
    handler: Arc<dyn RunHandler>,
    mut rx: mpsc::Receiver<WorkItem>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let WorkItem { kind, reply } = item;
        let result = handler.handle(kind).await;
        if let Err(err) = &result {
            error!(%kind, error = %format!("{err:#}"), "run failed");
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        if *shutdown.borrow() {
            break;
        }
    }

    rx.close();
    let mut purged = 0usize;
    while let Ok(item) = rx.try_recv() {
        debug!(kind = %item.kind, "purging queued run");
        purged += 1;
    }
    info!(purged, "single worker stopped");
}

async fn ingest_trigger(
    worker: SingleWorker,
    source: SourceKind,
    watch_period: Option<Duration>,
    poller_kick: oneshot::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(err) = worker.run(RunKind::Ingest(source)).await {
        warn!(%source, error = %format!("{err:#}"), "initial batch ingest did not complete");
    }
    let _ = poller_kick.send(());

    let Some(period) = watch_period else {
        return;
    };
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(period) => {}
        }
        if worker.submit(RunKind::Ingest(source)).await.is_err() {
            break;
        }
    }
}

/// Resolves once the first batch ingest has finished. False means shutdown came first.
async fn wait_for_kick(
    kick: oneshot::Receiver<()>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = kick => true,
        _ = shutdown.changed() => false,
    }
}

/// Ticks share a one-slot buffer; a tick arriving while one is pending is dropped.
fn offer_tick(ticks: &mpsc::Sender<()>) {
    if ticks.try_send(()).is_err() {
        debug!("poll tick discarded; previous tick still pending");
    }
}

async fn forward_poll_ticks(
    worker: SingleWorker,
    mut ticks: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            tick = ticks.recv() => {
                if tick.is_none() || worker.submit(RunKind::Poll).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn poll_trigger(
    worker: SingleWorker,
    period: Duration,
    poller_kick: oneshot::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if !wait_for_kick(poller_kick, &mut shutdown).await {
        return Ok(());
    }

    let (tick_tx, tick_rx) = mpsc::channel::<()>(1);
    offer_tick(&tick_tx);

    let mut sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(period, move |_uuid, _l| {
        let ticks = tick_tx.clone();
        Box::pin(async move { offer_tick(&ticks) })
    })
    .context("creating poller job")?;
    sched.add(job).await.context("adding poller job")?;
    sched.start().await.context("starting scheduler")?;
    info!(period_ms = period.as_millis() as u64, "poller started");

    forward_poll_ticks(worker, tick_rx, shutdown).await;

    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

/// Long-running service: triggers feed the single worker until ctrl-c.
pub async fn run_service(config: AppConfig) -> Result<()> {
    let pipeline = Arc::new(IngestPipeline::from_config(&config).await?);
    let (worker, worker_handle) = SingleWorker::spawn(pipeline);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (kick_tx, kick_rx) = oneshot::channel();

    let mut triggers = Vec::new();
    if config.batch_ingest.enabled {
        triggers.push(tokio::spawn(ingest_trigger(
            worker.clone(),
            config.batch_ingest.kind,
            config.watch_period(),
            kick_tx,
            shutdown_rx.clone(),
        )));
    } else {
        let _ = kick_tx.send(());
    }

    if config.poller.enabled {
        let poll_worker = worker.clone();
        let period = config.poller.period();
        let shutdown = shutdown_rx.clone();
        triggers.push(tokio::spawn(async move {
            if let Err(err) = poll_trigger(poll_worker, period, kick_rx, shutdown).await {
                error!(error = %format!("{err:#}"), "poller stopped");
            }
        }));
    } else if !config.batch_ingest.enabled {
        warn!("batch ingest and poller are both disabled; waiting for shutdown");
    }
    drop(worker);

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    worker_handle.shutdown().await?;

    for trigger in triggers {
        if tokio::time::timeout(Duration::from_secs(5), trigger).await.is_err() {
            warn!("trigger did not stop in time");
        }
    }
    Ok(())
}

/// Build the pipeline and push a single unit of work through the worker.
pub async fn run_once(config: &AppConfig, kind: RunKind) -> Result<RunReport> {
    let pipeline = Arc::new(IngestPipeline::from_config(config).await?);
    let (worker, worker_handle) = SingleWorker::spawn(pipeline);
    let report = worker.run(kind).await;
    worker_handle.shutdown().await?;
    report
}
