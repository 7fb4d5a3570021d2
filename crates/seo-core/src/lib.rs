//! Core domain model for the migration audit importer.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "seo-core";

/// One store row as exchanged with the backend: column name -> JSON value.
pub type Row = Map<String, JsonValue>;

pub const AUDIT_RECORDS_TABLE: &str = "audit_records";
pub const REFERRING_DOMAINS_TABLE: &str = "referring_domains";
pub const RANKING_KEYWORDS_TABLE: &str = "ranking_keywords";
pub const ACTIVITY_LOG_TABLE: &str = "activity_log";

/// Opaque, store-assigned record identifier.
///
/// Backends hand out integers or UUID strings; both are kept in their textual
/// form so lookups and filters never depend on the concrete id type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) if !s.is_empty() => Some(Self(s.clone())),
            JsonValue::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// JSON form used when the id has to be written back into a row.
    pub fn to_json(&self) -> JsonValue {
        match self.0.parse::<i64>() {
            Ok(n) => JsonValue::from(n),
            Err(_) => JsonValue::String(self.0.clone()),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Fixed,
    Ignored,
}

impl AuditStatus {
    pub const ALL: [AuditStatus; 3] = [AuditStatus::Pending, AuditStatus::Fixed, AuditStatus::Ignored];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Pending => "pending",
            AuditStatus::Fixed => "fixed",
            AuditStatus::Ignored => "ignored",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "open" | "todo" => Some(AuditStatus::Pending),
            "fixed" | "done" | "resolved" => Some(AuditStatus::Fixed),
            "ignored" | "ignore" | "wontfix" => Some(AuditStatus::Ignored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "p0" => Some(Priority::Critical),
            "high" | "p1" => Some(Priority::High),
            "medium" | "med" | "p2" => Some(Priority::Medium),
            "low" | "p3" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// A typed, already-normalized cell value.
///
/// Absent cells are never represented here: the normalizer leaves them out of
/// the row entirely so partial updates cannot overwrite stored data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Status(AuditStatus),
    Priority(Priority),
    /// Explicit request to null a nullable-by-design column.
    Clear,
}

impl FieldValue {
    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Text(s) => JsonValue::String(s.clone()),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Integer(n) => JsonValue::from(*n),
            FieldValue::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            FieldValue::Timestamp(ts) => JsonValue::String(ts.to_rfc3339()),
            FieldValue::Status(s) => JsonValue::String(s.as_str().to_string()),
            FieldValue::Priority(p) => JsonValue::String(p.as_str().to_string()),
            FieldValue::Clear => JsonValue::Null,
        }
    }
}

/// Audit trail entry appended for operator-driven mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub actor: String,
    pub table_name: String,
    pub record_id: RecordId,
    pub action: String,
    pub before: JsonValue,
    pub after: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(JsonValue::Object(map)) => map,
            _ => Row::new(),
        }
    }
}
