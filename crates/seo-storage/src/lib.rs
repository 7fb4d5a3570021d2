//! Data-access abstraction over the hosted Postgres backend.
//!
//! Import jobs only ever talk to the store through [`DataStore`]: paged
//! reads, update-by-id, batch insert/upsert and counts. [`RestStore`] speaks
//! the PostgREST dialect of the hosted backend; [`MemoryStore`] is the
//! in-process double used by tests.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{RequestBuilder, Response, StatusCode};
use seo_core::{RecordId, Row};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn, Instrument};

mod memory;

pub use memory::MemoryStore;

pub const CRATE_NAME: &str = "seo-storage";

/// Equality-only row filter, the only kind the importers need.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub value: JsonValue,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.conditions.push(Condition {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Client-side evaluation; numbers compare by value so `15` matches `15.0`.
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| {
            let actual = row.get(&c.column).unwrap_or(&JsonValue::Null);
            json_eq(actual, &c.value)
        })
    }
}

pub(crate) fn json_eq(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64() == y.as_f64(),
        (JsonValue::Number(x), JsonValue::String(y)) | (JsonValue::String(y), JsonValue::Number(x)) => {
            x.to_string() == *y
        }
        _ => a == b,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub column: String,
    pub ascending: bool,
}

impl Sort {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            ascending: true,
        }
    }

    fn to_postgrest(&self) -> String {
        let dir = if self.ascending { "asc" } else { "desc" };
        format!("{}.{}", self.column, dir)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<Row>,
    /// Total matching rows when the backend reports it.
    pub total: Option<u64>,
}

/// Partial field set to apply to one existing record.
#[derive(Debug, Clone, PartialEq)]
pub struct RowUpdate {
    pub id: RecordId,
    pub fields: Row,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("store rejected write on {table}: {reason}")]
    Rejected { table: String, reason: String },
    #[error("record {id} not found in {table}")]
    NotFound { table: String, id: RecordId },
    #[error("retries exhausted for {op} on {table}")]
    RetriesExhausted { op: String, table: String },
    #[error("{op} on {table} timed out after {after:?}")]
    Timeout {
        op: &'static str,
        table: String,
        after: Duration,
    },
}

/// How far a chunk of updates got: the first `applied` updates landed, and
/// `error` is what stopped the rest.
#[derive(Debug)]
pub struct AppliedUpdates {
    pub applied: usize,
    pub error: Option<StoreError>,
}

impl AppliedUpdates {
    pub fn all(count: usize) -> Self {
        Self {
            applied: count,
            error: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Fetch rows `range_start..=range_end` (inclusive, zero-based).
    async fn query_page(
        &self,
        table: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        range_start: usize,
        range_end: usize,
    ) -> Result<Page, StoreError>;

    async fn update_by_id(&self, table: &str, id: &RecordId, fields: &Row) -> Result<(), StoreError>;

    async fn insert_batch(&self, table: &str, rows: &[Row]) -> Result<(), StoreError>;

    async fn upsert_batch(&self, table: &str, rows: &[Row], conflict_key: &[&str]) -> Result<(), StoreError>;

    async fn count_where(&self, table: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Apply a chunk of partial updates, each store call bounded by
    /// `call_timeout`. Backends without a multi-row PATCH fall back to one
    /// call per record and stop at the first failure.
    async fn apply_updates(&self, table: &str, updates: &[RowUpdate], call_timeout: Duration) -> AppliedUpdates {
        for (applied, update) in updates.iter().enumerate() {
            let call = self.update_by_id(table, &update.id, &update.fields);
            let result = match tokio::time::timeout(call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    op: "update_by_id",
                    table: table.to_string(),
                    after: call_timeout,
                }),
            };
            if let Err(error) = result {
                return AppliedUpdates {
                    applied,
                    error: Some(error),
                };
            }
        }
        AppliedUpdates::all(updates.len())
    }
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
pub struct RestStoreConfig {
    pub base_url: String,
    pub service_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

/// PostgREST client for the hosted backend (`<base_url>/rest/v1/<table>`).
#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    rest_root: String,
    backoff: BackoffPolicy,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(&config.service_key).context("service key is not a valid header value")?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.service_key))
                .context("service key is not a valid header value")?,
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            rest_root: format!("{}/rest/v1", config.base_url.trim_end_matches('/')),
            backoff: config.backoff,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_root, table)
    }

    /// Send with capped exponential backoff. Non-idempotent calls (plain
    /// inserts) are only retried when the connection was never established.
    async fn send_with_retry<F>(
        &self,
        op: &'static str,
        table: &str,
        idempotent: bool,
        build: F,
    ) -> Result<Response, StoreError>
    where
        F: Fn() -> RequestBuilder,
    {
        let span = tracing::info_span!("store_call", op, table);
        async {
            let mut last_request_error: Option<reqwest::Error> = None;

            for attempt in 0..=self.backoff.max_retries {
                match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(resp);
                        }
                        let url = resp.url().to_string();
                        if idempotent
                            && classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            warn!(status = status.as_u16(), attempt, "retryable status from store");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        let mut body = resp.text().await.unwrap_or_default();
                        body.truncate(512);
                        return Err(StoreError::HttpStatus {
                            status: status.as_u16(),
                            url,
                            body,
                        });
                    }
                    Err(err) => {
                        let retry = classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && (idempotent || err.is_connect());
                        if retry && attempt < self.backoff.max_retries {
                            warn!(error = %err, attempt, "retryable request error from store");
                            last_request_error = Some(err);
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(StoreError::Request(err));
                    }
                }
            }

            Err(match last_request_error {
                Some(err) => StoreError::Request(err),
                None => StoreError::RetriesExhausted {
                    op: op.to_string(),
                    table: table.to_string(),
                },
            })
        }
        .instrument(span)
        .await
    }
}

fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    filter
        .conditions()
        .iter()
        .map(|c| {
            let expr = match &c.value {
                JsonValue::Null => "is.null".to_string(),
                JsonValue::String(s) => format!("eq.{s}"),
                other => format!("eq.{other}"),
            };
            (c.column.clone(), expr)
        })
        .collect()
}

/// Parse the total from a `Content-Range` header such as `0-999/4210` or `*/0`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

fn content_range_total(resp: &Response) -> Option<u64> {
    resp.headers()
        .get(CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range_total)
}

#[async_trait]
impl DataStore for RestStore {
    async fn query_page(
        &self,
        table: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        range_start: usize,
        range_end: usize,
    ) -> Result<Page, StoreError> {
        let url = self.table_url(table);
        let mut params = filter_params(filter);
        params.push(("select".to_string(), "*".to_string()));
        if let Some(sort) = sort {
            params.push(("order".to_string(), sort.to_postgrest()));
        }
        let range = format!("{range_start}-{range_end}");

        let result = self
            .send_with_retry("query_page", table, true, || {
                self.client
                    .get(&url)
                    .query(&params)
                    .header("Range-Unit", "items")
                    .header("Range", &range)
                    .header("Prefer", "count=exact")
            })
            .await;

        let resp = match result {
            Ok(resp) => resp,
            // PostgREST answers 416 when the window starts past the last row.
            Err(StoreError::HttpStatus { status: 416, .. }) => return Ok(Page::default()),
            Err(err) => return Err(err),
        };
        let total = content_range_total(&resp);
        let rows: Vec<Row> = resp.json().await?;
        debug!(table, range_start, rows = rows.len(), ?total, "fetched page");
        Ok(Page { rows, total })
    }

    async fn update_by_id(&self, table: &str, id: &RecordId, fields: &Row) -> Result<(), StoreError> {
        let url = self.table_url(table);
        let params = [("id".to_string(), format!("eq.{id}"))];
        self.send_with_retry("update_by_id", table, true, || {
            self.client
                .patch(&url)
                .query(&params)
                .header("Prefer", "return=minimal")
                .json(fields)
        })
        .await?;
        Ok(())
    }

    async fn insert_batch(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.table_url(table);
        self.send_with_retry("insert_batch", table, false, || {
            self.client
                .post(&url)
                .header("Prefer", "return=minimal")
                .json(rows)
        })
        .await?;
        Ok(())
    }

    async fn upsert_batch(&self, table: &str, rows: &[Row], conflict_key: &[&str]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.table_url(table);
        let params = [("on_conflict".to_string(), conflict_key.join(","))];
        self.send_with_retry("upsert_batch", table, true, || {
            self.client
                .post(&url)
                .query(&params)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(rows)
        })
        .await?;
        Ok(())
    }

    async fn count_where(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        let url = self.table_url(table);
        let mut params = filter_params(filter);
        params.push(("select".to_string(), "id".to_string()));
        let resp = self
            .send_with_retry("count_where", table, true, || {
                self.client
                    .head(&url)
                    .query(&params)
                    .header("Prefer", "count=exact")
            })
            .await?;
        Ok(content_range_total(&resp).unwrap_or(0))
    }
}
