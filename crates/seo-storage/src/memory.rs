use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use seo_core::{RecordId, Row};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{json_eq, AppliedUpdates, DataStore, Filter, Page, RowUpdate, Sort, StoreError};

/// In-process [`DataStore`] with whole-call atomic writes.
///
/// Rows get sequential integer ids on insert. Writes touching a row that
/// matches a registered failure rule are rejected as a whole, which is how
/// tests simulate a backend refusing one chunk. Like PostgREST, a bulk insert
/// or upsert whose rows do not all carry the same columns is rejected.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    next_id: i64,
    failure_rules: Vec<FailureRule>,
    write_delay: Option<Duration>,
    write_calls: usize,
}

#[derive(Debug, Clone)]
struct FailureRule {
    table: String,
    column: String,
    value: JsonValue,
}

impl MemoryState {
    fn assign_id(&mut self, row: &mut Row) {
        if row.get("id").map_or(true, JsonValue::is_null) {
            self.next_id += 1;
            row.insert("id".to_string(), JsonValue::from(self.next_id));
        } else if let Some(n) = row.get("id").and_then(JsonValue::as_i64) {
            self.next_id = self.next_id.max(n);
        }
    }

    fn check_failure(&self, table: &str, rows: &[&Row]) -> Result<(), StoreError> {
        for rule in self.failure_rules.iter().filter(|r| r.table == table) {
            let hit = rows
                .iter()
                .any(|row| row.get(&rule.column).is_some_and(|v| json_eq(v, &rule.value)));
            if hit {
                return Err(StoreError::Rejected {
                    table: table.to_string(),
                    reason: format!("injected failure on {}={}", rule.column, rule.value),
                });
            }
        }
        Ok(())
    }

    fn check_uniform_columns(table: &str, rows: &[Row]) -> Result<(), StoreError> {
        let Some((first, rest)) = rows.split_first() else {
            return Ok(());
        };
        let same_keys = |row: &Row| row.len() == first.len() && row.keys().all(|k| first.contains_key(k));
        if rest.iter().all(same_keys) {
            Ok(())
        } else {
            Err(StoreError::Rejected {
                table: table.to_string(),
                reason: "all object keys must match".to_string(),
            })
        }
    }

    fn position_of(&self, table: &str, id: &RecordId) -> Option<usize> {
        self.tables.get(table)?.iter().position(|row| {
            row.get("id")
                .and_then(RecordId::from_json)
                .is_some_and(|existing| &existing == id)
        })
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows directly, bypassing failure rules and write accounting.
    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        let mut state = self.state.lock().await;
        for mut row in rows {
            state.assign_id(&mut row);
            state.tables.entry(table.to_string()).or_default().push(row);
        }
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.state.lock().await;
        state.tables.get(table).cloned().unwrap_or_default()
    }

    /// Reject every write on `table` that touches a row with `column == value`.
    pub async fn fail_writes_matching(&self, table: &str, column: &str, value: impl Into<JsonValue>) {
        let mut state = self.state.lock().await;
        state.failure_rules.push(FailureRule {
            table: table.to_string(),
            column: column.to_string(),
            value: value.into(),
        });
    }

    /// Delay every write call, for exercising caller-side timeouts.
    pub async fn set_write_delay(&self, delay: Duration) {
        self.state.lock().await.write_delay = Some(delay);
    }

    /// Number of write calls received, failed ones included.
    pub async fn write_calls(&self) -> usize {
        self.state.lock().await.write_calls
    }

    async fn apply_atomically(&self, table: &str, updates: &[RowUpdate]) -> Result<(), StoreError> {
        self.begin_write().await;
        let mut state = self.state.lock().await;

        let mut positions = Vec::with_capacity(updates.len());
        let mut touched = Vec::with_capacity(updates.len());
        for update in updates {
            let pos = state.position_of(table, &update.id).ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: update.id.clone(),
            })?;
            let mut merged = state.tables[table][pos].clone();
            merge_into(&mut merged, &update.fields);
            positions.push(pos);
            touched.push(merged);
        }
        state.check_failure(table, &touched.iter().collect::<Vec<_>>())?;

        if let Some(rows) = state.tables.get_mut(table) {
            for (pos, merged) in positions.into_iter().zip(touched) {
                rows[pos] = merged;
            }
        }
        Ok(())
    }

    async fn begin_write(&self) {
        let delay = {
            let mut state = self.state.lock().await;
            state.write_calls += 1;
            state.write_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

fn compare_json(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    match (a, b) {
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => x.cmp(y),
        (None, Some(_)) | (Some(JsonValue::Null), Some(_)) => Ordering::Greater,
        (Some(_), None) | (Some(_), Some(JsonValue::Null)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

fn merge_into(target: &mut Row, fields: &Row) {
    for (column, value) in fields {
        if column != "id" {
            target.insert(column.clone(), value.clone());
        }
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn query_page(
        &self,
        table: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        range_start: usize,
        range_end: usize,
    ) -> Result<Page, StoreError> {
        let state = self.state.lock().await;
        let mut matching: Vec<Row> = state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        if let Some(sort) = sort {
            matching.sort_by(|a, b| {
                let ord = compare_json(a.get(&sort.column), b.get(&sort.column));
                if sort.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        let total = matching.len() as u64;
        let rows = matching
            .into_iter()
            .skip(range_start)
            .take((range_end + 1).saturating_sub(range_start))
            .collect();
        Ok(Page {
            rows,
            total: Some(total),
        })
    }

    async fn update_by_id(&self, table: &str, id: &RecordId, fields: &Row) -> Result<(), StoreError> {
        self.apply_atomically(
            table,
            &[RowUpdate {
                id: id.clone(),
                fields: fields.clone(),
            }],
        )
        .await
    }

    async fn insert_batch(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        self.begin_write().await;
        MemoryState::check_uniform_columns(table, rows)?;
        let mut state = self.state.lock().await;
        state.check_failure(table, &rows.iter().collect::<Vec<_>>())?;
        for row in rows {
            let mut row = row.clone();
            state.assign_id(&mut row);
            state.tables.entry(table.to_string()).or_default().push(row);
        }
        Ok(())
    }

    async fn upsert_batch(&self, table: &str, rows: &[Row], conflict_key: &[&str]) -> Result<(), StoreError> {
        self.begin_write().await;
        MemoryState::check_uniform_columns(table, rows)?;
        let mut state = self.state.lock().await;
        state.check_failure(table, &rows.iter().collect::<Vec<_>>())?;
        for row in rows {
            let existing = state.tables.get(table).and_then(|existing| {
                existing.iter().position(|candidate| {
                    conflict_key.iter().all(|column| {
                        match (candidate.get(*column), row.get(*column)) {
                            (Some(a), Some(b)) => json_eq(a, b),
                            _ => false,
                        }
                    })
                })
            });
            match existing {
                Some(pos) => {
                    if let Some(target) = state.tables.get_mut(table).and_then(|t| t.get_mut(pos)) {
                        merge_into(target, row);
                    }
                }
                None => {
                    let mut row = row.clone();
                    state.assign_id(&mut row);
                    state.tables.entry(table.to_string()).or_default().push(row);
                }
            }
        }
        Ok(())
    }

    async fn count_where(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).count() as u64)
            .unwrap_or(0))
    }

    /// One call for the whole chunk: either every update lands or none does.
    async fn apply_updates(&self, table: &str, updates: &[RowUpdate], call_timeout: Duration) -> AppliedUpdates {
        match tokio::time::timeout(call_timeout, self.apply_atomically(table, updates)).await {
            Ok(Ok(())) => AppliedUpdates::all(updates.len()),
            Ok(Err(error)) => AppliedUpdates {
                applied: 0,
                error: Some(error),
            },
            Err(_) => AppliedUpdates {
                applied: 0,
                error: Some(StoreError::Timeout {
                    op: "apply_updates",
                    table: table.to_string(),
                    after: call_timeout,
                }),
            },
        }
    }
}
