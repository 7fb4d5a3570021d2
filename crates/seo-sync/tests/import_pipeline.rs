use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use seo_adapters::{Dialect, ReadError, RowShape};
use seo_core::{RecordId, Row, ACTIVITY_LOG_TABLE, AUDIT_RECORDS_TABLE, RANKING_KEYWORDS_TABLE};
use seo_storage::{DataStore, Filter, MemoryStore, Page, Sort, StoreError};
use seo_sync::{ImportConfig, ImportError, ImportJob, ImportPipeline, RunStatus, SkipReason};
use serde_json::{json, Value as JsonValue};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn row(value: JsonValue) -> Row {
    match value {
        JsonValue::Object(map) => map,
        _ => panic!("row fixtures must be objects"),
    }
}

fn write_csv(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn config() -> ImportConfig {
    ImportConfig {
        snapshot_date: NaiveDate::from_ymd_opt(2026, 2, 24).unwrap(),
        ..ImportConfig::default()
    }
}

fn comma_job(shape: RowShape, path: PathBuf, config: &ImportConfig) -> ImportJob {
    ImportJob::new(shape, path, config).with_dialect(Dialect::comma())
}

fn find<'a>(rows: &'a [Row], url: &str) -> &'a Row {
    rows.iter()
        .find(|r| r.get("url") == Some(&json!(url)))
        .unwrap_or_else(|| panic!("no row for {url}"))
}

#[tokio::test]
async fn one_update_one_skip_one_reject() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            vec![row(json!({"url": "https://example.com/a", "issue_type_id": 16, "traffic_percentage": 1.0}))],
        )
        .await;
    let dir = TempDir::new().unwrap();
    let path = write_csv(
        &dir,
        "traffic.csv",
        "URL,Traffic %\nhttps://www.example.com/a/,12.5\nhttps://example.com/missing,3\n,7\n",
    );

    let config = config();
    let job = comma_job(RowShape::TrafficShare, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert_eq!(report.malformed_rows[0].line, 4);
    assert_eq!(report.skipped_rows[0].reason, SkipReason::Unmatched);

    let rows = store.rows(AUDIT_RECORDS_TABLE).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["traffic_percentage"], json!(12.5));
    assert_eq!(rows[0]["url"], json!("https://example.com/a"));
}

#[tokio::test]
async fn second_chunk_failure_leaves_first_and_third_applied() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            (0..150)
                .map(|i| row(json!({"url": format!("https://example.com/p{i}"), "issue_type_id": 16})))
                .collect(),
        )
        .await;
    store
        .fail_writes_matching(AUDIT_RECORDS_TABLE, "url", "https://example.com/p75")
        .await;

    let mut csv = String::from("URL,Traffic %\n");
    for i in 0..150 {
        csv.push_str(&format!("https://example.com/p{i},{i}.5\n"));
    }
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "traffic.csv", &csv);

    let config = ImportConfig {
        chunk_size: 50,
        ..config()
    };
    let job = comma_job(RowShape::TrafficShare, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert_eq!(report.processed, 150);
    assert_eq!(report.updated, 100);
    assert_eq!(report.rejected, 50);
    assert_eq!(report.failed_chunks.len(), 1);
    let failure = &report.failed_chunks[0];
    assert_eq!(failure.chunk, 2);
    assert_eq!((failure.first_line, failure.last_line), (52, 101));
    assert_eq!(failure.sample_key, "example.com/p50");
    assert_eq!(failure.applied, 0);

    let rows = store.rows(AUDIT_RECORDS_TABLE).await;
    for i in 0..150 {
        let stored = find(&rows, &format!("https://example.com/p{i}"));
        let applied = stored.get("traffic_percentage").is_some();
        assert_eq!(applied, !(50..100).contains(&i), "row p{i}");
    }
    assert_eq!(store.write_calls().await, 3);
}

#[tokio::test]
async fn partial_rows_never_null_existing_scores() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            vec![row(json!({
                "url": "https://example.com/a",
                "issue_type_id": 15,
                "authority_score": 40.0,
                "toxicity_score": 10.0
            }))],
        )
        .await;
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "toxic.csv", "Source URL,Toxicity Score,Page ascore\nhttps://example.com/a,55,\n");

    let config = config();
    let job = comma_job(RowShape::ToxicBacklinks, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.status, RunStatus::Completed);

    let rows = store.rows(AUDIT_RECORDS_TABLE).await;
    assert_eq!(rows[0]["authority_score"], json!(40.0));
    assert_eq!(rows[0]["toxicity_score"], json!(55.0));
}

#[tokio::test]
async fn rerunning_the_same_file_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            vec![
                row(json!({"url": "https://example.com/a", "issue_type_id": 15})),
                row(json!({"url": "https://example.com/b", "issue_type_id": 15})),
            ],
        )
        .await;
    let dir = TempDir::new().unwrap();
    let path = write_csv(
        &dir,
        "toxic.csv",
        "Source URL,Toxicity Score,Page ascore\nhttps://example.com/a,55,3\nhttps://example.com/b/,\"1,5\",\n",
    );

    let config = config();
    let job = comma_job(RowShape::ToxicBacklinks, path, &config);
    let pipeline = ImportPipeline::new(config, store.clone());

    let first = pipeline.run(&job).await.unwrap();
    let after_first = store.rows(AUDIT_RECORDS_TABLE).await;
    let second = pipeline.run(&job).await.unwrap();
    let after_second = store.rows(AUDIT_RECORDS_TABLE).await;

    assert_eq!(after_first, after_second);
    assert_eq!(first.updated, second.updated);
    assert_eq!(first.input_sha256, second.input_sha256);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(after_second.len(), 2);
}

#[tokio::test]
async fn unmatched_rows_cause_no_writes() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            vec![row(json!({"url": "https://example.com/a", "issue_type_id": 15}))],
        )
        .await;
    let before = store.rows(AUDIT_RECORDS_TABLE).await;
    let dir = TempDir::new().unwrap();
    let path = write_csv(
        &dir,
        "redirects.csv",
        "Old URL,New URL\nhttps://elsewhere.example/a,https://example.com/\nhttps://example.com/zzz,https://example.com/\n",
    );

    let config = config();
    let job = comma_job(RowShape::RedirectMap, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!(report.skipped, 2);
    assert_eq!(report.updated, 0);
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(store.write_calls().await, 0);
    assert_eq!(store.rows(AUDIT_RECORDS_TABLE).await, before);
}

#[tokio::test]
async fn timed_out_writes_count_as_rejected() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            vec![row(json!({"url": "https://example.com/a", "issue_type_id": 16}))],
        )
        .await;
    store.set_write_delay(Duration::from_secs(5)).await;
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "traffic.csv", "URL,Traffic %\nhttps://example.com/a,9\n");

    let config = ImportConfig {
        call_timeout: Duration::from_millis(100),
        ..config()
    };
    let job = comma_job(RowShape::TrafficShare, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!(report.rejected, 1);
    assert_eq!(report.updated, 0);
    assert!(report.failed_chunks[0].error.contains("timed out"));
    assert!(store.rows(AUDIT_RECORDS_TABLE).await[0].get("traffic_percentage").is_none());
}

#[tokio::test]
async fn duplicate_existing_keys_resolve_to_the_lowest_id() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            vec![
                row(json!({"url": "https://example.com/a", "issue_type_id": 16})),
                row(json!({"url": "http://www.example.com/a/", "issue_type_id": 16})),
            ],
        )
        .await;
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "traffic.csv", "URL,Traffic %\nhttps://example.com/a,9\n");

    let config = config();
    let job = comma_job(RowShape::TrafficShare, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!(report.duplicate_keys.len(), 1);
    assert_eq!(report.duplicate_keys[0].kept, RecordId::new("1"));
    let rows = store.rows(AUDIT_RECORDS_TABLE).await;
    assert_eq!(rows[0]["traffic_percentage"], json!(9.0));
    assert!(rows[1].get("traffic_percentage").is_none());
}

#[tokio::test]
async fn page_metadata_updates_known_pages_and_inserts_new_ones() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            vec![row(json!({"url": "https://example.com/", "issue_type_id": 1, "status": "fixed"}))],
        )
        .await;
    let dir = TempDir::new().unwrap();
    let path = write_csv(
        &dir,
        "crawl.csv",
        "Address,Title 1,H1-1\nhttps://example.com,Home,Welcome\nhttps://example.com/new,New page,\n",
    );

    let config = config();
    let job = ImportJob::new(RowShape::PageMetadata, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!((report.updated, report.inserted), (1, 1));
    let rows = store.rows(AUDIT_RECORDS_TABLE).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["title"], json!("Home"));
    assert_eq!(rows[0]["status"], json!("fixed"));
    let inserted = find(&rows, "https://example.com/new");
    assert_eq!(inserted["status"], json!("pending"));
    assert_eq!(inserted["issue_type_id"], json!(1));
    assert!(inserted.get("h1").is_none());
}

#[tokio::test]
async fn status_updates_record_activity() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            vec![
                row(json!({"url": "https://example.com/a", "issue_type_id": 16, "status": "pending"})),
                row(json!({"url": "https://example.com/a", "issue_type_id": 15, "status": "pending"})),
            ],
        )
        .await;
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "status.csv", "URL,Issue Type ID,Status\nhttps://example.com/a/,16,Fixed\n");

    let config = ImportConfig {
        actor: "qa@example.com".to_string(),
        ..config()
    };
    let job = ImportJob::new(RowShape::StatusUpdates, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.activity_logged, 1);
    let rows = store.rows(AUDIT_RECORDS_TABLE).await;
    assert_eq!(rows[0]["status"], json!("fixed"));
    assert_eq!(rows[1]["status"], json!("pending"));

    let activity = store.rows(ACTIVITY_LOG_TABLE).await;
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0]["actor"], json!("qa@example.com"));
    assert_eq!(activity[0]["record_id"], json!("1"));
    assert_eq!(activity[0]["before"], json!({"status": "pending"}));
    assert_eq!(activity[0]["after"], json!({"status": "fixed"}));
}

#[tokio::test]
async fn ranking_snapshots_upsert_on_their_natural_key() {
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().unwrap();
    let path = write_csv(
        &dir,
        "rankings.csv",
        "Keyword,URL,Database,Position,Search Volume\n\
         running shoes,https://example.com/shoes,de,4,\"12,100\"\n\
         trail runner,https://example.com/shoes,de,11,2400\n",
    );

    let config = config();
    let job = ImportJob::new(RowShape::RankingKeywords, path, &config);
    let pipeline = ImportPipeline::new(config, store.clone());
    let first = pipeline.run(&job).await.unwrap();
    let second = pipeline.run(&job).await.unwrap();

    assert_eq!(first.upserted, 2);
    assert_eq!(second.upserted, 2);
    let rows = store.rows(RANKING_KEYWORDS_TABLE).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["snapshot_date"], json!("2026-02-24"));
    assert_eq!(rows[0]["search_volume"], json!(12100));
}

#[tokio::test]
async fn ranking_rows_differing_only_in_case_or_slash_are_all_kept() {
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().unwrap();
    let path = write_csv(
        &dir,
        "rankings.csv",
        "Keyword,URL,Database,Position
         Running Shoes,https://example.com/shoes,de,4
         running shoes,https://example.com/shoes,de,6
         running shoes,https://example.com/shoes/,de,9
",
    );

    let config = config();
    let job = ImportJob::new(RowShape::RankingKeywords, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!(report.upserted, 3);
    assert!(report.skipped_rows.is_empty());
    assert_eq!(store.rows(RANKING_KEYWORDS_TABLE).await.len(), 3);
}

#[tokio::test]
async fn cancelled_runs_stop_before_writing() {
    let store = Arc::new(MemoryStore::new());
    store
        .seed(
            AUDIT_RECORDS_TABLE,
            vec![row(json!({"url": "https://example.com/a", "issue_type_id": 16}))],
        )
        .await;
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "traffic.csv", "URL,Traffic %\nhttps://example.com/a,9\n");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let config = config();
    let job = comma_job(RowShape::TrafficShare, path, &config);
    let report = ImportPipeline::new(config, store.clone())
        .with_cancellation(cancel)
        .run(&job)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.not_attempted, 1);
    assert_eq!(report.processed, 0);
    assert_eq!(store.write_calls().await, 0);
}

#[tokio::test]
async fn reports_are_written_when_a_directory_is_configured() {
    let store = Arc::new(MemoryStore::new());
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "domains.csv", "Domain,Backlinks\nexample.org,3\n");
    let reports = TempDir::new().unwrap();

    let config = ImportConfig {
        reports_dir: Some(reports.path().to_path_buf()),
        ..config()
    };
    let job = comma_job(RowShape::ReferringDomains, path, &config);
    let report = ImportPipeline::new(config, store).run_and_record(&job).await.unwrap();

    let run_dir = reports.path().join(report.run_id.to_string());
    let json: JsonValue =
        serde_json::from_str(&std::fs::read_to_string(run_dir.join("import_report.json")).unwrap()).unwrap();
    assert_eq!(json["upserted"], json!(1));
    assert_eq!(json["status"], json!("completed"));
    let summary = std::fs::read_to_string(run_dir.join("summary.md")).unwrap();
    assert!(summary.contains("- upserted: 1"));
}

#[tokio::test]
async fn missing_input_is_fatal() {
    let store = Arc::new(MemoryStore::new());
    let config = config();
    let job = ImportJob::new(RowShape::TrafficShare, "/definitely/not/here.csv", &config);
    let err = ImportPipeline::new(config, store).run(&job).await.unwrap_err();
    assert!(matches!(err, ImportError::Read(ReadError::Open { .. })));
}

struct UnreadableStore;

#[async_trait]
impl DataStore for UnreadableStore {
    async fn query_page(&self, table: &str, _: &Filter, _: Option<&Sort>, _: usize, _: usize) -> Result<Page, StoreError> {
        Err(StoreError::HttpStatus {
            status: 503,
            url: format!("memory://{table}"),
            body: "unavailable".to_string(),
        })
    }
    async fn update_by_id(&self, _: &str, _: &RecordId, _: &Row) -> Result<(), StoreError> {
        panic!("no writes expected")
    }
    async fn insert_batch(&self, _: &str, _: &[Row]) -> Result<(), StoreError> {
        panic!("no writes expected")
    }
    async fn upsert_batch(&self, _: &str, _: &[Row], _: &[&str]) -> Result<(), StoreError> {
        panic!("no writes expected")
    }
    async fn count_where(&self, _: &str, _: &Filter) -> Result<u64, StoreError> {
        Ok(0)
    }
}

#[tokio::test]
async fn unreadable_index_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "traffic.csv", "URL,Traffic %\nhttps://example.com/a,9\n");
    let config = config();
    let job = comma_job(RowShape::TrafficShare, path, &config);
    let err = ImportPipeline::new(config, Arc::new(UnreadableStore))
        .run(&job)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::Index(_)));
}

fn fixture(rel: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures").join(rel)
}

/// Sends updates one record at a time through the trait's default
/// `apply_updates`, with a fixed latency per call.
struct RowByRowStore {
    inner: MemoryStore,
    latency: Duration,
}

#[async_trait]
impl DataStore for RowByRowStore {
    async fn query_page(
        &self,
        table: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        range_start: usize,
        range_end: usize,
    ) -> Result<Page, StoreError> {
        self.inner.query_page(table, filter, sort, range_start, range_end).await
    }
    async fn update_by_id(&self, table: &str, id: &RecordId, fields: &Row) -> Result<(), StoreError> {
        tokio::time::sleep(self.latency).await;
        self.inner.update_by_id(table, id, fields).await
    }
    async fn insert_batch(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        self.inner.insert_batch(table, rows).await
    }
    async fn upsert_batch(&self, table: &str, rows: &[Row], conflict_key: &[&str]) -> Result<(), StoreError> {
        self.inner.upsert_batch(table, rows, conflict_key).await
    }
    async fn count_where(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        self.inner.count_where(table, filter).await
    }
}

#[tokio::test]
async fn per_record_latency_does_not_time_out_a_whole_update_chunk() {
    let inner = MemoryStore::new();
    inner
        .seed(
            AUDIT_RECORDS_TABLE,
            (0..10)
                .map(|i| row(json!({"url": format!("https://example.com/p{i}"), "issue_type_id": 16})))
                .collect(),
        )
        .await;
    let store = Arc::new(RowByRowStore {
        inner,
        latency: Duration::from_millis(50),
    });
    let mut csv = String::from("URL,Traffic %\n");
    for i in 0..10 {
        csv.push_str(&format!("https://example.com/p{i},{i}\n"));
    }
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "traffic.csv", &csv);

    let config = ImportConfig {
        chunk_size: 10,
        call_timeout: Duration::from_millis(275),
        ..config()
    };
    let job = comma_job(RowShape::TrafficShare, path, &config);
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!((report.updated, report.rejected), (10, 0));
    let rows = store.inner.rows(AUDIT_RECORDS_TABLE).await;
    assert!(rows.iter().all(|r| r.get("traffic_percentage").is_some()));
}

#[tokio::test]
async fn a_row_failing_mid_chunk_keeps_counts_and_activity_true_to_the_store() {
    let inner = MemoryStore::new();
    inner
        .seed(
            AUDIT_RECORDS_TABLE,
            (0..6)
                .map(|i| {
                    row(json!({
                        "url": format!("https://example.com/p{i}"),
                        "issue_type_id": 16,
                        "status": "pending",
                    }))
                })
                .collect(),
        )
        .await;
    inner
        .fail_writes_matching(AUDIT_RECORDS_TABLE, "url", "https://example.com/p3")
        .await;
    let store = Arc::new(RowByRowStore {
        inner,
        latency: Duration::from_millis(1),
    });
    let mut csv = String::from("URL,Issue Type ID,Status\n");
    for i in 0..6 {
        csv.push_str(&format!("https://example.com/p{i},16,Fixed\n"));
    }
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "status.csv", &csv);

    let config = ImportConfig {
        actor: "qa@example.com".to_string(),
        ..config()
    };
    let job = ImportJob::new(RowShape::StatusUpdates, path, &config).with_dialect(Dialect::comma());
    let report = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();

    assert_eq!(report.status, RunStatus::CompletedWithErrors);
    assert_eq!((report.updated, report.rejected), (3, 3));
    let failure = &report.failed_chunks[0];
    assert_eq!((failure.applied, failure.rows), (3, 3));
    assert_eq!((failure.first_line, failure.last_line), (2, 7));
    assert_eq!(failure.sample_key, "16|example.com/p3");
    assert_eq!(report.activity_logged, 3);

    let rows = store.inner.rows(AUDIT_RECORDS_TABLE).await;
    let fixed = rows.iter().filter(|r| r["status"] == json!("fixed")).count();
    assert_eq!(fixed, 3);
    assert_eq!(store.inner.rows(ACTIVITY_LOG_TABLE).await.len(), 3);
}

/// Answers at most `cap` rows per read, like a PostgREST `max-rows` limit.
struct CappedReadStore {
    inner: MemoryStore,
    cap: usize,
}

#[async_trait]
impl DataStore for CappedReadStore {
    async fn query_page(
        &self,
        table: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        range_start: usize,
        range_end: usize,
    ) -> Result<Page, StoreError> {
        let end = range_end.min(range_start + self.cap - 1);
        self.inner.query_page(table, filter, sort, range_start, end).await
    }
    async fn update_by_id(&self, table: &str, id: &RecordId, fields: &Row) -> Result<(), StoreError> {
        self.inner.update_by_id(table, id, fields).await
    }
    async fn insert_batch(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        self.inner.insert_batch(table, rows).await
    }
    async fn upsert_batch(&self, table: &str, rows: &[Row], conflict_key: &[&str]) -> Result<(), StoreError> {
        self.inner.upsert_batch(table, rows, conflict_key).await
    }
    async fn count_where(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        self.inner.count_where(table, filter).await
    }
}

#[tokio::test]
async fn load_jobs_stay_idempotent_behind_a_server_row_cap() {
    let inner = MemoryStore::new();
    inner
        .seed(
            AUDIT_RECORDS_TABLE,
            (0..5)
                .map(|i| row(json!({"url": format!("https://example.com/p{i}"), "issue_type_id": 1})))
                .collect(),
        )
        .await;
    let store = Arc::new(CappedReadStore { inner, cap: 2 });
    let mut csv = String::from("Address,Title 1\n");
    for i in 0..8 {
        csv.push_str(&format!("https://example.com/p{i},Page {i}\n"));
    }
    let dir = TempDir::new().unwrap();
    let path = write_csv(&dir, "crawl.csv", &csv);

    let config = ImportConfig {
        page_size: 3,
        ..config()
    };
    let job = comma_job(RowShape::PageMetadata, path, &config);
    let first = ImportPipeline::new(config.clone(), store.clone()).run(&job).await.unwrap();
    assert_eq!(first.existing_records, 5);
    assert_eq!((first.updated, first.inserted), (5, 3));

    let second = ImportPipeline::new(config, store.clone()).run(&job).await.unwrap();
    assert_eq!(second.existing_records, 8);
    assert_eq!(second.inserted, 0);
    assert_eq!(store.inner.rows(AUDIT_RECORDS_TABLE).await.len(), 8);
}

#[tokio::test]
async fn demo_exports_with_sparse_rows_load_without_rejected_chunks() {
    let store = Arc::new(MemoryStore::new());
    let config = config();

    let domains = ImportJob::new(
        RowShape::ReferringDomains,
        fixture("referring-domains/referring_domains.tsv"),
        &config,
    );
    let report = ImportPipeline::new(config.clone(), store.clone())
        .run(&domains)
        .await
        .unwrap();
    assert!(report.failed_chunks.is_empty(), "{:?}", report.failed_chunks);
    assert_eq!(report.upserted, 3);

    let pages = ImportJob::new(RowShape::PageMetadata, fixture("page-metadata/crawl_export.csv"), &config);
    let report = ImportPipeline::new(config, store.clone()).run(&pages).await.unwrap();
    assert!(report.failed_chunks.is_empty(), "{:?}", report.failed_chunks);
    assert_eq!(report.inserted, 3);
    assert_eq!(store.rows(AUDIT_RECORDS_TABLE).await.len(), 3);
}
