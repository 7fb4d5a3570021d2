//! Import row shapes: per-job column mappings from export files to store rows.
//!
//! Every job reads a delimited export, maps its headers onto canonical
//! columns and converts each cell into a typed [`FieldValue`]. The mapping is
//! a closed set of [`RowShape`]s instead of branching on issue-type ids.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use seo_core::{
    AuditStatus, FieldValue, Priority, Row, AUDIT_RECORDS_TABLE, RANKING_KEYWORDS_TABLE,
    REFERRING_DOMAINS_TABLE,
};
use serde::Serialize;
use serde_json::Value as JsonValue;

mod csv_reader;
pub mod normalize;

pub use csv_reader::{open_csv, CsvRows, Dialect, EscapeRule, MalformedRowError, RawRow, ReadError, TextEncoding};
pub use normalize::NumberLocale;

use normalize::{domain_key, non_empty, parse_integer, parse_number, parse_timestamp, url_lookup_key};

pub const CRATE_NAME: &str = "seo-adapters";

/// Issue type whose records carry backlink toxicity data.
pub const TOXIC_BACKLINKS_ISSUE_TYPE: i64 = 15;
/// Issue type whose records carry organic traffic share.
pub const TRAFFIC_SHARE_ISSUE_TYPE: i64 = 16;

pub const DEFAULT_MARKET: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// Page URL, stored as written in the source file.
    Url,
    /// Text column that accepts a literal `NULL` as an explicit clear.
    NullableText,
    Number,
    Integer,
    Date,
    Timestamp,
    Domain,
    Status,
    Priority,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub field: &'static str,
    pub aliases: &'static [&'static str],
    pub kind: FieldKind,
    pub required: bool,
}

const fn col(field: &'static str, aliases: &'static [&'static str], kind: FieldKind) -> ColumnSpec {
    ColumnSpec {
        field,
        aliases,
        kind,
        required: false,
    }
}

const fn req(field: &'static str, aliases: &'static [&'static str], kind: FieldKind) -> ColumnSpec {
    ColumnSpec {
        field,
        aliases,
        kind,
        required: true,
    }
}

const TOXIC_BACKLINK_COLUMNS: &[ColumnSpec] = &[
    req("url", &["url", "source url", "referring page url", "source_url"], FieldKind::Url),
    col("toxicity_score", &["toxicity score", "toxic score", "toxicity", "toxicity_score"], FieldKind::Number),
    col(
        "authority_score",
        &["authority score", "page ascore", "page authority", "authority_score", "as"],
        FieldKind::Number,
    ),
];

const TRAFFIC_SHARE_COLUMNS: &[ColumnSpec] = &[
    req("url", &["url", "page", "landing page", "address"], FieldKind::Url),
    col(
        "traffic_percentage",
        &["traffic %", "traffic (%)", "traffic percentage", "traffic share", "traffic_percentage"],
        FieldKind::Number,
    ),
    col("priority", &["priority"], FieldKind::Priority),
];

const REDIRECT_MAP_COLUMNS: &[ColumnSpec] = &[
    req("url", &["url", "source", "old url", "from", "source url"], FieldKind::Url),
    col(
        "redirect_destination",
        &["redirect destination", "redirect_destination", "destination", "new url", "target", "to"],
        FieldKind::NullableText,
    ),
];

const PAGE_METADATA_COLUMNS: &[ColumnSpec] = &[
    req("url", &["url", "address", "page"], FieldKind::Url),
    col("title", &["title", "title 1", "page title"], FieldKind::Text),
    col(
        "meta_description",
        &["meta description", "meta description 1", "meta_description", "description"],
        FieldKind::Text,
    ),
    col("h1", &["h1", "h1-1", "h1 1"], FieldKind::Text),
    col("priority", &["priority"], FieldKind::Priority),
    col("notes", &["notes", "comment"], FieldKind::Text),
];

const STATUS_UPDATE_COLUMNS: &[ColumnSpec] = &[
    req("url", &["url", "page"], FieldKind::Url),
    col("issue_type_id", &["issue type id", "issue_type_id", "issue type"], FieldKind::Integer),
    req("status", &["status"], FieldKind::Status),
    col("notes", &["notes", "comment"], FieldKind::Text),
];

const REFERRING_DOMAIN_COLUMNS: &[ColumnSpec] = &[
    req("domain", &["domain", "referring domain", "root domain", "source domain"], FieldKind::Domain),
    col(
        "authority_score",
        &["domain ascore", "authority score", "domain rating", "dr", "as", "authority_score"],
        FieldKind::Number,
    ),
    col("backlinks", &["backlinks", "links", "backlinks count"], FieldKind::Integer),
    col("country", &["country"], FieldKind::Text),
    col("ip", &["ip", "ip address"], FieldKind::Text),
    col("first_seen", &["first seen", "first_seen"], FieldKind::Timestamp),
    col("last_seen", &["last seen", "last_seen"], FieldKind::Timestamp),
];

const RANKING_KEYWORD_COLUMNS: &[ColumnSpec] = &[
    req("keyword", &["keyword", "query"], FieldKind::Text),
    req("url", &["url", "current url", "ranking url"], FieldKind::Url),
    col("market", &["market", "database", "country", "location"], FieldKind::Text),
    col("position", &["position", "current position"], FieldKind::Integer),
    col("previous_position", &["previous position", "previous_position"], FieldKind::Integer),
    col("search_volume", &["search volume", "volume", "search_volume"], FieldKind::Integer),
    col("traffic_cost", &["traffic cost", "traffic_cost"], FieldKind::Number),
    col("snapshot_date", &["date", "snapshot date", "snapshot_date"], FieldKind::Date),
];

const RANKING_CONFLICT_KEY: &[&str] = &["keyword", "url", "market", "snapshot_date"];
const DOMAIN_CONFLICT_KEY: &[&str] = &["domain"];

/// What happens to a row whose key has no existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchMode {
    /// Closed set of pre-seeded records: unmatched rows are skipped.
    Enrich,
    /// Unmatched rows become inserts.
    Load,
    /// The store resolves conflicts on a natural key; no index is built.
    Upsert { conflict_key: &'static [&'static str] },
}

/// How a lookup key is derived from a row, on either side of the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KeyStrategy {
    Url,
    UrlAndIssueType,
    Domain,
    Natural(&'static [&'static str]),
}

impl KeyStrategy {
    /// Columns that identify a record and must never be rewritten by updates.
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            KeyStrategy::Url => &["url"],
            KeyStrategy::UrlAndIssueType => &["url", "issue_type_id"],
            KeyStrategy::Domain => &["domain"],
            KeyStrategy::Natural(columns) => columns,
        }
    }

    /// Key of an existing store row.
    pub fn key_for_store_row(self, row: &Row) -> Option<String> {
        self.compose(|column| row.get(column).and_then(json_text))
    }

    fn compose<F>(self, get: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        match self {
            KeyStrategy::Url => url_lookup_key(&get("url")?),
            KeyStrategy::UrlAndIssueType => {
                let issue = get("issue_type_id")?;
                let issue = parse_integer(&issue, NumberLocale::Us)?;
                Some(format!("{issue}|{}", url_lookup_key(&get("url")?)?))
            }
            KeyStrategy::Domain => domain_key(&get("domain")?),
            // The store compares conflict columns verbatim, so no folding here.
            KeyStrategy::Natural(columns) => {
                let mut parts = Vec::with_capacity(columns.len());
                for column in columns {
                    parts.push(get(column)?.trim().to_string());
                }
                Some(parts.join("|"))
            }
        }
    }
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Per-run inputs the shapes need besides the row itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeContext {
    pub locale: NumberLocale,
    /// Issue type the run is scoped to, when the job is scoped to one.
    pub issue_type_id: Option<i64>,
    /// Fallback snapshot date for ranking rows without a date column.
    pub snapshot_date: NaiveDate,
}

/// A typed row ready for reconciliation. Absent cells are simply missing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRow {
    pub line: u64,
    pub key: String,
    pub fields: BTreeMap<&'static str, FieldValue>,
}

impl NormalizedRow {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn to_row(&self) -> Row {
        self.fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_json()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RowShape {
    ToxicBacklinks,
    TrafficShare,
    RedirectMap,
    PageMetadata,
    StatusUpdates,
    ReferringDomains,
    RankingKeywords,
}

impl RowShape {
    pub const ALL: [RowShape; 7] = [
        RowShape::ToxicBacklinks,
        RowShape::TrafficShare,
        RowShape::RedirectMap,
        RowShape::PageMetadata,
        RowShape::StatusUpdates,
        RowShape::ReferringDomains,
        RowShape::RankingKeywords,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RowShape::ToxicBacklinks => "toxic-backlinks",
            RowShape::TrafficShare => "traffic-share",
            RowShape::RedirectMap => "redirect-map",
            RowShape::PageMetadata => "page-metadata",
            RowShape::StatusUpdates => "status-updates",
            RowShape::ReferringDomains => "referring-domains",
            RowShape::RankingKeywords => "ranking-keywords",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            RowShape::ReferringDomains => REFERRING_DOMAINS_TABLE,
            RowShape::RankingKeywords => RANKING_KEYWORDS_TABLE,
            _ => AUDIT_RECORDS_TABLE,
        }
    }

    pub fn mode(self) -> MatchMode {
        match self {
            RowShape::ToxicBacklinks
            | RowShape::TrafficShare
            | RowShape::RedirectMap
            | RowShape::StatusUpdates => MatchMode::Enrich,
            RowShape::PageMetadata => MatchMode::Load,
            RowShape::ReferringDomains => MatchMode::Upsert {
                conflict_key: DOMAIN_CONFLICT_KEY,
            },
            RowShape::RankingKeywords => MatchMode::Upsert {
                conflict_key: RANKING_CONFLICT_KEY,
            },
        }
    }

    /// Key strategy for a run; scoping to one issue type makes the URL alone unique.
    pub fn key_strategy(self, issue_type_id: Option<i64>) -> KeyStrategy {
        match self {
            RowShape::ReferringDomains => KeyStrategy::Domain,
            RowShape::RankingKeywords => KeyStrategy::Natural(RANKING_CONFLICT_KEY),
            _ if issue_type_id.is_some() => KeyStrategy::Url,
            RowShape::StatusUpdates | RowShape::PageMetadata => KeyStrategy::UrlAndIssueType,
            _ => KeyStrategy::Url,
        }
    }

    pub fn columns(self) -> &'static [ColumnSpec] {
        match self {
            RowShape::ToxicBacklinks => TOXIC_BACKLINK_COLUMNS,
            RowShape::TrafficShare => TRAFFIC_SHARE_COLUMNS,
            RowShape::RedirectMap => REDIRECT_MAP_COLUMNS,
            RowShape::PageMetadata => PAGE_METADATA_COLUMNS,
            RowShape::StatusUpdates => STATUS_UPDATE_COLUMNS,
            RowShape::ReferringDomains => REFERRING_DOMAIN_COLUMNS,
            RowShape::RankingKeywords => RANKING_KEYWORD_COLUMNS,
        }
    }

    /// Dialect the usual export tool writes for this job.
    pub fn default_dialect(self) -> Dialect {
        match self {
            RowShape::ToxicBacklinks | RowShape::ReferringDomains => Dialect::tab_utf16(),
            _ => Dialect::comma(),
        }
    }

    /// Columns that identify a record; updates never rewrite them.
    pub fn identity_columns(self) -> &'static [&'static str] {
        match self {
            RowShape::ReferringDomains => DOMAIN_CONFLICT_KEY,
            RowShape::RankingKeywords => RANKING_CONFLICT_KEY,
            _ => &["url", "issue_type_id"],
        }
    }

    /// Columns a brand-new record needs that the file does not carry.
    pub fn insert_defaults(self, ctx: &NormalizeContext) -> Row {
        let mut row = Row::new();
        if self.table() == AUDIT_RECORDS_TABLE {
            row.insert(
                "status".to_string(),
                FieldValue::Status(AuditStatus::Pending).to_json(),
            );
            if let Some(issue) = ctx.issue_type_id {
                row.insert("issue_type_id".to_string(), JsonValue::from(issue));
            }
        }
        row
    }

    /// Which of the shape's canonical fields the given header row provides.
    pub fn resolve_headers(self, headers: &[String]) -> Vec<(&'static str, Option<String>)> {
        self.columns()
            .iter()
            .map(|column| {
                let found = headers
                    .iter()
                    .find(|h| column.aliases.iter().any(|a| csv_reader::header_eq(h, a)))
                    .cloned();
                (column.field, found)
            })
            .collect()
    }

    pub fn normalize(self, raw: &RawRow, ctx: &NormalizeContext) -> Result<NormalizedRow, MalformedRowError> {
        let malformed = |reason: String| MalformedRowError {
            line: raw.line,
            reason,
        };

        let mut fields = BTreeMap::new();
        for column in self.columns() {
            let cell = column.aliases.iter().find_map(|alias| raw.get(alias));
            let value = match cell.and_then(non_empty) {
                Some(text) => convert(column.kind, text, ctx.locale),
                None => None,
            };
            match value {
                Some(value) => {
                    fields.insert(column.field, value);
                }
                None if column.required => {
                    return Err(match cell.and_then(non_empty) {
                        Some(text) => malformed(format!("unparsable {} `{text}`", column.field)),
                        None => malformed(format!("missing required field {}", column.field)),
                    });
                }
                None => {}
            }
        }

        if self == RowShape::RankingKeywords {
            fields
                .entry("market")
                .or_insert_with(|| FieldValue::Text(DEFAULT_MARKET.to_string()));
            fields
                .entry("snapshot_date")
                .or_insert(FieldValue::Date(ctx.snapshot_date));
        }

        let strategy = self.key_strategy(ctx.issue_type_id);
        let key = strategy
            .compose(|column| fields.get(column).and_then(field_text))
            .ok_or_else(|| {
                malformed(format!(
                    "cannot build lookup key from {}",
                    strategy.key_columns().join("+")
                ))
            })?;

        Ok(NormalizedRow {
            line: raw.line,
            key,
            fields,
        })
    }
}

fn field_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Clear => None,
        other => json_text(&other.to_json()),
    }
}

fn convert(kind: FieldKind, text: &str, locale: NumberLocale) -> Option<FieldValue> {
    match kind {
        FieldKind::Text => Some(FieldValue::Text(text.to_string())),
        FieldKind::Url => url_lookup_key(text).map(|_| FieldValue::Text(text.to_string())),
        FieldKind::NullableText if text.eq_ignore_ascii_case("null") => Some(FieldValue::Clear),
        FieldKind::NullableText => Some(FieldValue::Text(text.to_string())),
        FieldKind::Number => parse_number(text, locale).map(FieldValue::Number),
        FieldKind::Integer => parse_integer(text, locale).map(FieldValue::Integer),
        FieldKind::Date => normalize::parse_date(text, locale).map(FieldValue::Date),
        FieldKind::Timestamp => parse_timestamp(text, locale).map(FieldValue::Timestamp),
        FieldKind::Domain => domain_key(text).map(FieldValue::Text),
        FieldKind::Status => AuditStatus::parse(text).map(FieldValue::Status),
        FieldKind::Priority => Priority::parse(text).map(FieldValue::Priority),
    }
}
