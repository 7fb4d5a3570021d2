//! Turns normalized rows into write instructions against the existing index.

use std::collections::HashMap;

use seo_adapters::{MatchMode, NormalizeContext, NormalizedRow, RowShape};
use seo_core::{RecordId, Row};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::resolver::KeyIndex;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("line {line}: no existing record for key `{key}`")]
pub struct UnmatchedKeyError {
    pub line: u64,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Partial update of one matched record; `before` holds the stored values
    /// of the columns being set.
    Update {
        line: u64,
        key: String,
        id: RecordId,
        fields: Row,
        before: Row,
    },
    Insert { line: u64, key: String, row: Row },
    Upsert { line: u64, key: String, row: Row },
}

impl Instruction {
    pub fn line(&self) -> u64 {
        match self {
            Instruction::Update { line, .. } | Instruction::Insert { line, .. } | Instruction::Upsert { line, .. } => *line,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Instruction::Update { key, .. } | Instruction::Insert { key, .. } | Instruction::Upsert { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Unmatched,
    /// An earlier row in the same file already claimed this key.
    DuplicateInFile { first_line: u64 },
    /// Matched, but the row carried nothing besides its key.
    NoChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    pub line: u64,
    pub key: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub instructions: Vec<Instruction>,
    pub skipped: Vec<SkippedRow>,
    pub matched: usize,
}

impl Plan {
    pub fn count_unmatched(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| s.reason == SkipReason::Unmatched)
            .count()
    }
}

pub struct Reconciler<'a> {
    shape: RowShape,
    ctx: NormalizeContext,
    index: Option<&'a KeyIndex>,
}

impl<'a> Reconciler<'a> {
    /// `index` is required for enrich and load shapes; upsert shapes ignore it.
    pub fn new(shape: RowShape, ctx: NormalizeContext, index: Option<&'a KeyIndex>) -> Self {
        Self { shape, ctx, index }
    }

    pub fn plan<I>(&self, rows: I) -> Plan
    where
        I: IntoIterator<Item = NormalizedRow>,
    {
        let mut plan = Plan::default();
        let mut first_lines: HashMap<String, u64> = HashMap::new();
        let identity = self.shape.identity_columns();

        for row in rows {
            if let Some(&first_line) = first_lines.get(&row.key) {
                debug!(line = row.line, key = %row.key, first_line, "duplicate key in file");
                plan.skipped.push(SkippedRow {
                    line: row.line,
                    key: row.key,
                    reason: SkipReason::DuplicateInFile { first_line },
                });
                continue;
            }
            first_lines.insert(row.key.clone(), row.line);

            if let MatchMode::Upsert { .. } = self.shape.mode() {
                plan.instructions.push(Instruction::Upsert {
                    line: row.line,
                    key: row.key.clone(),
                    row: row.to_row(),
                });
                continue;
            }

            match self.index.and_then(|index| index.get(&row.key)) {
                Some(entry) => {
                    plan.matched += 1;
                    let mut fields = row.to_row();
                    fields.retain(|column, _| !identity.contains(&column.as_str()));
                    if fields.is_empty() {
                        plan.skipped.push(SkippedRow {
                            line: row.line,
                            key: row.key,
                            reason: SkipReason::NoChanges,
                        });
                        continue;
                    }
                    let before = fields
                        .keys()
                        .map(|column| {
                            let stored = entry.row.get(column).cloned().unwrap_or_default();
                            (column.clone(), stored)
                        })
                        .collect();
                    plan.instructions.push(Instruction::Update {
                        line: row.line,
                        key: row.key,
                        id: entry.id.clone(),
                        fields,
                        before,
                    });
                }
                None if self.shape.mode() == MatchMode::Load => {
                    let mut insert = self.shape.insert_defaults(&self.ctx);
                    insert.extend(row.to_row());
                    plan.instructions.push(Instruction::Insert {
                        line: row.line,
                        key: row.key,
                        row: insert,
                    });
                }
                None => {
                    let unmatched = UnmatchedKeyError {
                        line: row.line,
                        key: row.key,
                    };
                    debug!(%unmatched, "skipping row");
                    plan.skipped.push(SkippedRow {
                        line: unmatched.line,
                        key: unmatched.key,
                        reason: SkipReason::Unmatched,
                    });
                }
            }
        }
        plan
    }
}
