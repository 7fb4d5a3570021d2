use std::collections::BTreeMap;

use seo_core::{AuditStatus, AUDIT_RECORDS_TABLE};
use seo_storage::{DataStore, Filter, StoreError};
use serde::Serialize;

/// Per-status record counts, optionally scoped to one issue type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditProgress {
    pub issue_type_id: Option<i64>,
    pub total: u64,
    pub by_status: BTreeMap<&'static str, u64>,
}

impl AuditProgress {
    /// Share of records no longer pending, in percent.
    pub fn resolved_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let pending = self.by_status.get(AuditStatus::Pending.as_str()).copied().unwrap_or(0);
        (self.total.saturating_sub(pending)) as f64 * 100.0 / self.total as f64
    }
}

pub async fn audit_progress(store: &dyn DataStore, issue_type_id: Option<i64>) -> Result<AuditProgress, StoreError> {
    let base = match issue_type_id {
        Some(id) => Filter::new().eq("issue_type_id", id),
        None => Filter::new(),
    };
    let total = store.count_where(AUDIT_RECORDS_TABLE, &base).await?;
    let mut by_status = BTreeMap::new();
    for status in AuditStatus::ALL {
        let count = store
            .count_where(AUDIT_RECORDS_TABLE, &base.clone().eq("status", status.as_str()))
            .await?;
        by_status.insert(status.as_str(), count);
    }
    Ok(AuditProgress {
        issue_type_id,
        total,
        by_status,
    })
}
