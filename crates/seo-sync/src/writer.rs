//! Chunked writes with per-chunk failure isolation.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use seo_core::{ActivityEntry, Row, ACTIVITY_LOG_TABLE};
use seo_storage::{DataStore, RowUpdate, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconcile::Instruction;
use crate::ProgressHook;

#[derive(Debug, Error)]
pub enum StoreWriteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("write call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSettings {
    pub chunk_size: usize,
    pub call_timeout: Duration,
    pub max_in_flight: usize,
    /// Set in operator mode: every applied update gets an activity entry.
    pub activity_actor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Update,
    Insert,
    Upsert,
}

impl ChunkKind {
    fn of(instruction: &Instruction) -> Self {
        match instruction {
            Instruction::Update { .. } => ChunkKind::Update,
            Instruction::Insert { .. } => ChunkKind::Insert,
            Instruction::Upsert { .. } => ChunkKind::Upsert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    /// 1-based position in write order.
    pub chunk: usize,
    pub kind: ChunkKind,
    /// Rows of the chunk that did not land.
    pub rows: usize,
    /// Rows of the chunk the store applied before the failure.
    pub applied: usize,
    pub first_line: u64,
    pub last_line: u64,
    pub sample_key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub chunks: usize,
    pub updated: usize,
    pub inserted: usize,
    pub upserted: usize,
    pub rejected: usize,
    /// Rows in chunks never started because the run was cancelled.
    pub not_attempted: usize,
    pub failed_chunks: Vec<ChunkFailure>,
    pub activity_logged: usize,
    pub activity_failed: usize,
}

#[derive(Debug)]
struct Chunk {
    index: usize,
    kind: ChunkKind,
    instructions: Vec<Instruction>,
}

enum ChunkResult {
    Attempted {
        kind: ChunkKind,
        written: usize,
        failure: Option<ChunkFailure>,
        activity: Option<Result<usize, StoreWriteError>>,
    },
    Cancelled(usize),
}

/// Column set of a bulk-written row; updates are sent one record at a time
/// and all share the empty set.
fn column_set(instruction: &Instruction) -> BTreeSet<String> {
    match instruction {
        Instruction::Insert { row, .. } | Instruction::Upsert { row, .. } => row.keys().cloned().collect(),
        Instruction::Update { .. } => BTreeSet::new(),
    }
}

/// Group instructions by kind, then by column set (bulk writes need every
/// row of a call to carry the same columns), keeping file order within a
/// group. Each group is cut into chunks of at most `chunk_size`.
fn into_chunks(instructions: Vec<Instruction>, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut groups: Vec<(ChunkKind, BTreeSet<String>, Vec<Instruction>)> = Vec::new();
    for instruction in instructions {
        let kind = ChunkKind::of(&instruction);
        let columns = column_set(&instruction);
        match groups.iter().position(|(k, c, _)| *k == kind && *c == columns) {
            Some(slot) => groups[slot].2.push(instruction),
            None => groups.push((kind, columns, vec![instruction])),
        }
    }
    groups.sort_by_key(|(kind, _, _)| match kind {
        ChunkKind::Update => 0,
        ChunkKind::Insert => 1,
        ChunkKind::Upsert => 2,
    });

    let mut chunks = Vec::new();
    for (kind, _, group) in groups {
        let mut rest = group.into_iter().peekable();
        while rest.peek().is_some() {
            let instructions: Vec<Instruction> = rest.by_ref().take(chunk_size).collect();
            chunks.push(Chunk {
                index: chunks.len() + 1,
                kind,
                instructions,
            });
        }
    }
    chunks
}

pub struct BatchWriter<'a> {
    store: &'a dyn DataStore,
    table: &'a str,
    conflict_key: &'a [&'a str],
    settings: &'a WriterSettings,
    cancel: CancellationToken,
}

impl<'a> BatchWriter<'a> {
    pub fn new(
        store: &'a dyn DataStore,
        table: &'a str,
        conflict_key: &'a [&'a str],
        settings: &'a WriterSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            table,
            conflict_key,
            settings,
            cancel,
        }
    }

    /// Write every instruction; `processed` is how many rows the caller had
    /// already accounted for before writing began.
    pub async fn write(
        &self,
        instructions: Vec<Instruction>,
        progress: &dyn ProgressHook,
        mut processed: usize,
        total: usize,
    ) -> WriteOutcome {
        let chunks = into_chunks(instructions, self.settings.chunk_size);
        let mut outcome = WriteOutcome {
            chunks: chunks.len(),
            ..WriteOutcome::default()
        };
        info!(
            table = self.table,
            chunks = chunks.len(),
            chunk_size = self.settings.chunk_size,
            max_in_flight = self.settings.max_in_flight,
            "writing chunks"
        );

        let mut results = stream::iter(chunks.into_iter().map(|chunk| self.write_chunk(chunk)))
            .buffer_unordered(self.settings.max_in_flight.max(1));

        while let Some(result) = results.next().await {
            match result {
                ChunkResult::Attempted {
                    kind,
                    written,
                    failure,
                    activity,
                } => {
                    match kind {
                        ChunkKind::Update => outcome.updated += written,
                        ChunkKind::Insert => outcome.inserted += written,
                        ChunkKind::Upsert => outcome.upserted += written,
                    }
                    match activity {
                        Some(Ok(logged)) => outcome.activity_logged += logged,
                        Some(Err(err)) => {
                            warn!(table = ACTIVITY_LOG_TABLE, error = %err, rows = written, "activity log write failed");
                            outcome.activity_failed += written;
                        }
                        None => {}
                    }
                    processed += written;
                    if let Some(failure) = failure {
                        outcome.rejected += failure.rows;
                        processed += failure.rows;
                        outcome.failed_chunks.push(failure);
                    }
                }
                ChunkResult::Cancelled(rows) => {
                    outcome.not_attempted += rows;
                    continue;
                }
            }
            progress.on_progress(processed, total);
        }

        outcome.failed_chunks.sort_by_key(|f| f.chunk);
        outcome
    }

    async fn write_chunk(&self, chunk: Chunk) -> ChunkResult {
        let rows = chunk.instructions.len();
        if self.cancel.is_cancelled() {
            debug!(chunk = chunk.index, rows, "cancelled before write");
            return ChunkResult::Cancelled(rows);
        }

        let (written, error) = self.send_chunk(&chunk).await;
        let written = written.min(rows);
        let activity = match (&self.settings.activity_actor, chunk.kind) {
            (Some(actor), ChunkKind::Update) if written > 0 => {
                Some(self.log_activity(actor, &chunk.instructions[..written]).await)
            }
            _ => None,
        };
        let failure = error.map(|err| {
            let failed = &chunk.instructions[written..];
            let failure = ChunkFailure {
                chunk: chunk.index,
                kind: chunk.kind,
                rows: failed.len(),
                applied: written,
                first_line: chunk.instructions.first().map(Instruction::line).unwrap_or_default(),
                last_line: chunk.instructions.last().map(Instruction::line).unwrap_or_default(),
                sample_key: failed.first().map(|i| i.key().to_string()).unwrap_or_default(),
                error: err.to_string(),
            };
            warn!(
                chunk = failure.chunk,
                kind = ?failure.kind,
                rejected = failure.rows,
                applied = failure.applied,
                first_line = failure.first_line,
                last_line = failure.last_line,
                sample_key = %failure.sample_key,
                error = %failure.error,
                "chunk write failed; continuing with later chunks"
            );
            failure
        });
        if failure.is_none() {
            debug!(chunk = chunk.index, kind = ?chunk.kind, rows, "chunk written");
        }
        ChunkResult::Attempted {
            kind: chunk.kind,
            written,
            failure,
            activity,
        }
    }

    async fn timed<F>(&self, call: F) -> Result<(), StoreWriteError>
    where
        F: std::future::Future<Output = Result<(), StoreError>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(StoreWriteError::from),
            Err(_) => Err(StoreWriteError::Timeout(self.settings.call_timeout)),
        }
    }

    /// Returns how many leading rows of the chunk landed, and the error that
    /// stopped the rest. Bulk calls land all rows or none.
    async fn send_chunk(&self, chunk: &Chunk) -> (usize, Option<StoreWriteError>) {
        let rows = chunk.instructions.len();
        let bulk = match chunk.kind {
            ChunkKind::Update => {
                let updates: Vec<RowUpdate> = chunk
                    .instructions
                    .iter()
                    .filter_map(|i| match i {
                        Instruction::Update { id, fields, .. } => Some(RowUpdate {
                            id: id.clone(),
                            fields: fields.clone(),
                        }),
                        _ => None,
                    })
                    .collect();
                let outcome = self
                    .store
                    .apply_updates(self.table, &updates, self.settings.call_timeout)
                    .await;
                return (outcome.applied, outcome.error.map(StoreWriteError::from));
            }
            ChunkKind::Insert => {
                let batch = owned_rows(&chunk.instructions);
                self.timed(self.store.insert_batch(self.table, &batch)).await
            }
            ChunkKind::Upsert => {
                let batch = owned_rows(&chunk.instructions);
                self.timed(self.store.upsert_batch(self.table, &batch, self.conflict_key))
                    .await
            }
        };
        match bulk {
            Ok(()) => (rows, None),
            Err(err) => (0, Some(err)),
        }
    }

    async fn log_activity(&self, actor: &str, instructions: &[Instruction]) -> Result<usize, StoreWriteError> {
        let now = Utc::now();
        let entries: Vec<Row> = instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Update { id, fields, before, .. } => Some(
                    ActivityEntry {
                        actor: actor.to_string(),
                        table_name: self.table.to_string(),
                        record_id: id.clone(),
                        action: "update".to_string(),
                        before: JsonValue::Object(before.clone()),
                        after: JsonValue::Object(fields.clone()),
                        created_at: now,
                    }
                    .to_row(),
                ),
                _ => None,
            })
            .collect();
        if entries.is_empty() {
            return Ok(0);
        }
        self.timed(self.store.insert_batch(ACTIVITY_LOG_TABLE, &entries)).await?;
        Ok(entries.len())
    }
}

fn owned_rows(instructions: &[Instruction]) -> Vec<Row> {
    instructions
        .iter()
        .filter_map(|i| match i {
            Instruction::Insert { row, .. } | Instruction::Upsert { row, .. } => Some(row.clone()),
            Instruction::Update { .. } => None,
        })
        .collect()
}
