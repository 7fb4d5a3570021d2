//! Existing-record index: normalized key to record id, built once per run.

use std::collections::HashMap;
use std::time::Duration;

use seo_adapters::KeyStrategy;
use seo_core::{RecordId, Row};
use seo_storage::{DataStore, Filter, Sort, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("reading {table} page at offset {offset}: {source}")]
    Store {
        table: String,
        offset: usize,
        #[source]
        source: StoreError,
    },
    #[error("reading {table} page at offset {offset} timed out after {after:?}")]
    Timeout {
        table: String,
        offset: usize,
        after: Duration,
    },
}

/// The slice of a table one job reconciles against.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub table: &'static str,
    pub filter: Filter,
}

impl Partition {
    pub fn whole(table: &'static str) -> Self {
        Self {
            table,
            filter: Filter::new(),
        }
    }

    pub fn issue_type(table: &'static str, issue_type_id: i64) -> Self {
        Self {
            table,
            filter: Filter::new().eq("issue_type_id", issue_type_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: RecordId,
    pub row: Row,
}

/// Two stored records normalizing to the same key; the lower id is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateKey {
    pub key: String,
    pub kept: RecordId,
    pub ignored: RecordId,
}

#[derive(Debug, Clone, Default)]
pub struct KeyIndex {
    entries: HashMap<String, IndexEntry>,
    duplicates: Vec<DuplicateKey>,
    scanned: usize,
    unkeyed: usize,
}

impl KeyIndex {
    pub fn from_rows<I>(rows: I, strategy: KeyStrategy) -> Self
    where
        I: IntoIterator<Item = Row>,
    {
        let mut index = Self::default();
        for row in rows {
            index.push(row, strategy);
        }
        index
    }

    fn push(&mut self, row: Row, strategy: KeyStrategy) {
        self.scanned += 1;
        let id = row.get("id").and_then(RecordId::from_json);
        let key = strategy.key_for_store_row(&row);
        let (Some(id), Some(key)) = (id, key) else {
            self.unkeyed += 1;
            return;
        };
        match self.entries.get(&key) {
            Some(existing) => {
                debug!(%key, kept = %existing.id, ignored = %id, "duplicate key in existing records");
                self.duplicates.push(DuplicateKey {
                    key,
                    kept: existing.id.clone(),
                    ignored: id,
                });
            }
            None => {
                self.entries.insert(key, IndexEntry { id, row });
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn duplicates(&self) -> &[DuplicateKey] {
        &self.duplicates
    }

    /// Rows read from the store, including ones without a usable key.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    pub fn unkeyed(&self) -> usize {
        self.unkeyed
    }
}

pub struct KeyResolver<'a> {
    store: &'a dyn DataStore,
    page_size: usize,
    call_timeout: Duration,
}

impl<'a> KeyResolver<'a> {
    pub fn new(store: &'a dyn DataStore, page_size: usize, call_timeout: Duration) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            call_timeout,
        }
    }

    /// Page through the partition ordered by id until an empty page or the
    /// reported total. A page shorter than requested is not the end: the
    /// backend may cap rows per response below `page_size`.
    ///
    /// Any read failure aborts: a partial index would turn real matches into
    /// inserts or skips.
    pub async fn build_index(&self, partition: &Partition, strategy: KeyStrategy) -> Result<KeyIndex, ResolveError> {
        let sort = Sort::asc("id");
        let mut index = KeyIndex::default();
        let mut offset = 0usize;
        loop {
            let read = self.store.query_page(
                partition.table,
                &partition.filter,
                Some(&sort),
                offset,
                offset + self.page_size - 1,
            );
            let page = match tokio::time::timeout(self.call_timeout, read).await {
                Ok(Ok(page)) => page,
                Ok(Err(source)) => {
                    return Err(ResolveError::Store {
                        table: partition.table.to_string(),
                        offset,
                        source,
                    })
                }
                Err(_) => {
                    return Err(ResolveError::Timeout {
                        table: partition.table.to_string(),
                        offset,
                        after: self.call_timeout,
                    })
                }
            };

            let fetched = page.rows.len();
            debug!(table = partition.table, offset, fetched, total = ?page.total, "index page");
            for row in page.rows {
                index.push(row, strategy);
            }
            offset += fetched;
            if fetched == 0 || page.total.is_some_and(|total| offset as u64 >= total) {
                break;
            }
        }

        if !index.duplicates.is_empty() {
            warn!(
                table = partition.table,
                duplicates = index.duplicates.len(),
                "existing records share lookup keys; lowest id wins"
            );
        }
        info!(
            table = partition.table,
            keys = index.len(),
            scanned = index.scanned,
            unkeyed = index.unkeyed,
            "existing-record index built"
        );
        Ok(index)
    }
}
