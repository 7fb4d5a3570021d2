use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use seo_adapters::MalformedRowError;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

use crate::reconcile::SkippedRow;
use crate::resolver::DuplicateKey;
use crate::writer::ChunkFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Finished, but some rows were rejected or some chunks failed.
    CompletedWithErrors,
    /// Stopped at a chunk boundary before every chunk was attempted.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedRow {
    pub line: u64,
    pub reason: String,
}

impl From<MalformedRowError> for MalformedRow {
    fn from(err: MalformedRowError) -> Self {
        Self {
            line: err.line,
            reason: err.reason,
        }
    }
}

/// End-of-run summary of one import job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub job: String,
    pub table: String,
    pub input: String,
    pub input_sha256: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub total_rows: usize,
    pub processed: usize,
    pub matched: usize,
    pub updated: usize,
    pub inserted: usize,
    pub upserted: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub not_attempted: usize,
    pub existing_records: usize,
    pub activity_logged: usize,
    pub activity_failed: usize,
    pub malformed_rows: Vec<MalformedRow>,
    pub skipped_rows: Vec<SkippedRow>,
    pub failed_chunks: Vec<ChunkFailure>,
    pub duplicate_keys: Vec<DuplicateKey>,
}

impl ImportReport {
    pub fn summary_line(&self) -> String {
        format!(
            "{}: processed={} updated={} inserted={} upserted={} skipped={} rejected={} status={:?}",
            self.job,
            self.processed,
            self.updated,
            self.inserted,
            self.upserted,
            self.skipped,
            self.rejected,
            self.status
        )
    }

    pub fn render_markdown(&self) -> String {
        let mut out = format!(
            "# Import `{}`\n\n- Run ID: `{}`\n- Table: `{}`\n- Input: `{}` (sha256 `{}`)\n- Started: {}\n- Finished: {}\n- Status: {:?}\n\n",
            self.job,
            self.run_id,
            self.table,
            self.input,
            self.input_sha256,
            self.started_at,
            self.finished_at,
            self.status
        );
        out.push_str("## Counts\n");
        for (label, value) in [
            ("rows in file", self.total_rows),
            ("processed", self.processed),
            ("matched", self.matched),
            ("updated", self.updated),
            ("inserted", self.inserted),
            ("upserted", self.upserted),
            ("skipped", self.skipped),
            ("rejected", self.rejected),
            ("not attempted", self.not_attempted),
        ] {
            out.push_str(&format!("- {label}: {value}\n"));
        }

        if !self.failed_chunks.is_empty() {
            out.push_str("\n## Failed chunks\n");
            for f in &self.failed_chunks {
                out.push_str(&format!(
                    "- chunk {} ({:?}, lines {}-{}, {} rejected, {} applied, e.g. `{}`): {}\n",
                    f.chunk, f.kind, f.first_line, f.last_line, f.rows, f.applied, f.sample_key, f.error
                ));
            }
        }
        if !self.malformed_rows.is_empty() {
            out.push_str("\n## Malformed rows\n");
            for m in &self.malformed_rows {
                out.push_str(&format!("- line {}: {}\n", m.line, m.reason));
            }
        }
        if !self.duplicate_keys.is_empty() {
            out.push_str("\n## Existing records sharing a key\n");
            for d in &self.duplicate_keys {
                out.push_str(&format!("- `{}`: kept {}, ignored {}\n", d.key, d.kept, d.ignored));
            }
        }
        out
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write `import_report.json` and `summary.md` under `<reports_dir>/<run_id>/`.
pub async fn write_report(report: &ImportReport, reports_dir: &Path) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing import report")?;
    fs::write(run_dir.join("import_report.json"), json)
        .await
        .context("writing import_report.json")?;
    fs::write(run_dir.join("summary.md"), report.render_markdown())
        .await
        .context("writing summary.md")?;
    Ok(run_dir)
}
