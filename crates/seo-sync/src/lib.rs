use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use seo_adapters::{
    open_csv, Dialect, MalformedRowError, MatchMode, NormalizeContext, NormalizedRow, ReadError, RowShape,
    TOXIC_BACKLINKS_ISSUE_TYPE, TRAFFIC_SHARE_ISSUE_TYPE,
};
use seo_core::AUDIT_RECORDS_TABLE;
use seo_storage::{BackoffPolicy, DataStore, RestStore, RestStoreConfig};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod reconcile;
pub mod report;
pub mod resolver;
pub mod stats;
pub mod writer;

pub use config::{ConfigError, ImportConfig, StoreCredentials};
pub use reconcile::{Instruction, Plan, Reconciler, SkipReason, SkippedRow, UnmatchedKeyError};
pub use report::{write_report, ImportReport, MalformedRow, RunStatus};
pub use resolver::{DuplicateKey, KeyIndex, KeyResolver, Partition, ResolveError};
pub use stats::{audit_progress, AuditProgress};
pub use writer::{BatchWriter, ChunkFailure, ChunkKind, StoreWriteError, WriteOutcome, WriterSettings};

pub const CRATE_NAME: &str = "seo-sync";

/// Issue type page-metadata loads use when `ISSUE_TYPE_ID` is unset.
pub const DEFAULT_LOAD_ISSUE_TYPE: i64 = 1;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("loading existing records: {0}")]
    Index(#[from] ResolveError),
}

pub trait ProgressHook: Send + Sync {
    fn on_progress(&self, processed: usize, total: usize);
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressHook for NoopProgress {
    fn on_progress(&self, _processed: usize, _total: usize) {}
}

/// Prints `processed/total` to stdout.
#[derive(Default)]
pub struct StdoutProgress;

impl ProgressHook for StdoutProgress {
    fn on_progress(&self, processed: usize, total: usize) {
        println!("{processed}/{total}");
    }
}

/// One import: which shape, which file, and how it is scoped.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportJob {
    pub shape: RowShape,
    pub input: PathBuf,
    pub dialect: Dialect,
    pub issue_type_id: Option<i64>,
    /// Record an activity entry for every applied update.
    pub operator_mode: bool,
}

impl ImportJob {
    pub fn new(shape: RowShape, input: impl Into<PathBuf>, config: &ImportConfig) -> Self {
        let issue_type_id = match shape {
            RowShape::ToxicBacklinks => Some(TOXIC_BACKLINKS_ISSUE_TYPE),
            RowShape::TrafficShare => Some(TRAFFIC_SHARE_ISSUE_TYPE),
            RowShape::PageMetadata => Some(config.issue_type_id.unwrap_or(DEFAULT_LOAD_ISSUE_TYPE)),
            RowShape::StatusUpdates => config.issue_type_id,
            RowShape::RedirectMap | RowShape::ReferringDomains | RowShape::RankingKeywords => None,
        };
        Self {
            shape,
            input: input.into(),
            dialect: shape.default_dialect(),
            issue_type_id,
            operator_mode: shape == RowShape::StatusUpdates,
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn partition(&self) -> Partition {
        let table = self.shape.table();
        match self.issue_type_id {
            Some(id) if table == AUDIT_RECORDS_TABLE => Partition::issue_type(table, id),
            _ => Partition::whole(table),
        }
    }
}

pub struct ImportPipeline {
    config: ImportConfig,
    store: Arc<dyn DataStore>,
    progress: Box<dyn ProgressHook>,
    cancel: CancellationToken,
}

impl ImportPipeline {
    pub fn new(config: ImportConfig, store: Arc<dyn DataStore>) -> Self {
        Self {
            config,
            store,
            progress: Box::<NoopProgress>::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressHook>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Read, reconcile and write one file.
    ///
    /// Only a missing input or an unreadable existing-record index is an
    /// error; row and chunk failures end up in the report.
    pub async fn run(&self, job: &ImportJob) -> Result<ImportReport, ImportError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("import", %run_id, job = job.shape.name(), table = job.shape.table());
        self.run_inner(run_id, job).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, job: &ImportJob) -> Result<ImportReport, ImportError> {
        let started_at = Utc::now();
        let input_sha256 = tokio::fs::read(&job.input)
            .await
            .map(|bytes| report::sha256_hex(&bytes))
            .map_err(|source| ReadError::Open {
                path: job.input.clone(),
                source,
            })?;
        let rows = open_csv(&job.input, &job.dialect)?;

        for (field, header) in job.shape.resolve_headers(rows.headers()) {
            let required = job
                .shape
                .columns()
                .iter()
                .any(|column| column.field == field && column.required);
            if header.is_none() && required {
                warn!(field, "no header maps to a required column; every row will be rejected");
            }
        }

        let ctx = NormalizeContext {
            locale: self.config.locale,
            issue_type_id: job.issue_type_id,
            snapshot_date: self.config.snapshot_date,
        };
        let (normalized, malformed) = normalize_all(rows, job.shape, &ctx);
        let total_rows = normalized.len() + malformed.len();
        info!(total_rows, malformed = malformed.len(), "input read");

        let index = match job.shape.mode() {
            MatchMode::Upsert { .. } => None,
            MatchMode::Enrich | MatchMode::Load => {
                let resolver = KeyResolver::new(self.store.as_ref(), self.config.page_size, self.config.call_timeout);
                let strategy = job.shape.key_strategy(job.issue_type_id);
                Some(resolver.build_index(&job.partition(), strategy).await?)
            }
        };

        let plan = Reconciler::new(job.shape, ctx, index.as_ref()).plan(normalized);
        let accounted = malformed.len() + plan.skipped.len();
        self.progress.on_progress(accounted, total_rows);

        let settings = WriterSettings {
            chunk_size: config::clamp_chunk_size(self.config.chunk_size),
            call_timeout: self.config.call_timeout,
            max_in_flight: self.config.max_in_flight.max(1),
            activity_actor: job.operator_mode.then(|| self.config.actor.clone()),
        };
        let conflict_key: &[&str] = match job.shape.mode() {
            MatchMode::Upsert { conflict_key } => conflict_key,
            _ => &[],
        };
        let writer = BatchWriter::new(
            self.store.as_ref(),
            job.shape.table(),
            conflict_key,
            &settings,
            self.cancel.clone(),
        );
        let matched = plan.matched;
        let outcome = writer
            .write(plan.instructions, self.progress.as_ref(), accounted, total_rows)
            .await;

        let rejected = malformed.len() + outcome.rejected;
        let status = if outcome.not_attempted > 0 {
            RunStatus::Cancelled
        } else if rejected > 0 || outcome.activity_failed > 0 {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        let report = ImportReport {
            run_id,
            job: job.shape.name().to_string(),
            table: job.shape.table().to_string(),
            input: job.input.display().to_string(),
            input_sha256,
            started_at,
            finished_at: Utc::now(),
            status,
            total_rows,
            processed: total_rows - outcome.not_attempted,
            matched,
            updated: outcome.updated,
            inserted: outcome.inserted,
            upserted: outcome.upserted,
            skipped: plan.skipped.len(),
            rejected,
            not_attempted: outcome.not_attempted,
            existing_records: index.as_ref().map_or(0, KeyIndex::len),
            activity_logged: outcome.activity_logged,
            activity_failed: outcome.activity_failed,
            malformed_rows: malformed.into_iter().map(MalformedRow::from).collect(),
            skipped_rows: plan.skipped,
            failed_chunks: outcome.failed_chunks,
            duplicate_keys: index.map(|i| i.duplicates().to_vec()).unwrap_or_default(),
        };
        info!(
            processed = report.processed,
            updated = report.updated,
            inserted = report.inserted,
            upserted = report.upserted,
            skipped = report.skipped,
            rejected = report.rejected,
            status = ?report.status,
            "import finished"
        );
        Ok(report)
    }

    /// Run and, when a reports directory is configured, persist the report.
    pub async fn run_and_record(&self, job: &ImportJob) -> Result<ImportReport> {
        let report = self
            .run(job)
            .await
            .with_context(|| format!("{} import of {}", job.shape.name(), job.input.display()))?;
        if let Some(dir) = &self.config.reports_dir {
            match write_report(&report, dir).await {
                Ok(path) => info!(path = %path.display(), "report written"),
                Err(err) => warn!(error = %format!("{err:#}"), "could not write report"),
            }
        }
        Ok(report)
    }
}

fn normalize_all<I>(rows: I, shape: RowShape, ctx: &NormalizeContext) -> (Vec<NormalizedRow>, Vec<MalformedRowError>)
where
    I: IntoIterator<Item = Result<seo_adapters::RawRow, MalformedRowError>>,
{
    let mut normalized = Vec::new();
    let mut malformed = Vec::new();
    for row in rows {
        match row.and_then(|raw| shape.normalize(&raw, ctx)) {
            Ok(row) => normalized.push(row),
            Err(err) => {
                warn!(line = err.line, reason = %err.reason, "rejecting malformed row");
                malformed.push(err);
            }
        }
    }
    (normalized, malformed)
}

/// PostgREST-backed store from credentials and run tunables.
pub fn connect_rest_store(credentials: &StoreCredentials, config: &ImportConfig) -> Result<RestStore> {
    RestStore::new(RestStoreConfig {
        base_url: credentials.url.clone(),
        service_key: credentials.service_key.clone(),
        timeout: config.call_timeout,
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy::default(),
    })
    .context("building store client")
}

/// Everything a job binary needs: env config, credentials, store, Ctrl-C.
pub async fn run_import_from_env(shape: RowShape, input: &Path) -> Result<ImportReport> {
    let config = ImportConfig::from_env().context("reading import configuration")?;
    let credentials = StoreCredentials::from_env().context("reading store credentials")?;
    let store = connect_rest_store(&credentials, &config)?;

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after in-flight chunks");
            on_ctrl_c.cancel();
        }
    });

    let job = ImportJob::new(shape, input, &config);
    let pipeline = ImportPipeline::new(config, Arc::new(store))
        .with_progress(Box::<StdoutProgress>::default())
        .with_cancellation(cancel);
    pipeline.run_and_record(&job).await
}
