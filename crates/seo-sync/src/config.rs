use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use seo_adapters::NumberLocale;
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const MAX_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ACTOR: &str = "seo-import";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value `{value}` for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Backend endpoint and service key, read separately so tests never need them.
#[derive(Clone)]
pub struct StoreCredentials {
    pub url: String,
    pub service_key: String,
}

impl std::fmt::Debug for StoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCredentials")
            .field("url", &self.url)
            .field("service_key", &"<redacted>")
            .finish()
    }
}

impl StoreCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        Ok(Self {
            url: required("SUPABASE_URL")?,
            service_key: required("SUPABASE_SERVICE_KEY")?,
        })
    }
}

/// Tunables for one import run. Built once and handed to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportConfig {
    pub chunk_size: usize,
    pub page_size: usize,
    pub call_timeout: Duration,
    pub max_in_flight: usize,
    pub locale: NumberLocale,
    pub reports_dir: Option<PathBuf>,
    pub actor: String,
    pub snapshot_date: NaiveDate,
    /// Overrides the job's default issue type when set.
    pub issue_type_id: Option<i64>,
    pub user_agent: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            max_in_flight: 1,
            locale: NumberLocale::default(),
            reports_dir: None,
            actor: DEFAULT_ACTOR.to_string(),
            snapshot_date: Utc::now().date_naive(),
            issue_type_id: None,
            user_agent: format!("seo-import/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let chunk_size = match get("SEO_CHUNK_SIZE") {
            Some(raw) => parse_var("SEO_CHUNK_SIZE", &raw)?,
            None => defaults.chunk_size,
        };
        let page_size: usize = match get("SEO_PAGE_SIZE") {
            Some(raw) => parse_var("SEO_PAGE_SIZE", &raw)?,
            None => defaults.page_size,
        };
        let call_timeout = match get("SEO_CALL_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_var("SEO_CALL_TIMEOUT_SECS", &raw)?),
            None => defaults.call_timeout,
        };
        let max_in_flight: usize = match get("SEO_MAX_IN_FLIGHT") {
            Some(raw) => parse_var("SEO_MAX_IN_FLIGHT", &raw)?,
            None => defaults.max_in_flight,
        };
        let locale = match get("SEO_NUMBER_LOCALE") {
            Some(raw) => raw.parse().map_err(|reason| ConfigError::Invalid {
                var: "SEO_NUMBER_LOCALE",
                value: raw.clone(),
                reason,
            })?,
            None => defaults.locale,
        };
        let snapshot_date = match get("SEO_SNAPSHOT_DATE") {
            Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|e| ConfigError::Invalid {
                var: "SEO_SNAPSHOT_DATE",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => defaults.snapshot_date,
        };
        let issue_type_id = match get("ISSUE_TYPE_ID") {
            Some(raw) => Some(parse_var("ISSUE_TYPE_ID", &raw)?),
            None => None,
        };

        Ok(Self {
            chunk_size: clamp_chunk_size(chunk_size),
            page_size: page_size.max(1),
            call_timeout,
            max_in_flight: max_in_flight.max(1),
            locale,
            reports_dir: get("SEO_REPORTS_DIR").map(PathBuf::from),
            actor: get("SEO_ACTOR").unwrap_or(defaults.actor),
            snapshot_date,
            issue_type_id,
            user_agent: defaults.user_agent,
        })
    }
}

pub fn clamp_chunk_size(requested: usize) -> usize {
    requested.clamp(1, MAX_CHUNK_SIZE)
}

fn parse_var<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = ImportConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.max_in_flight, 1);
        assert_eq!(config.locale, NumberLocale::Us);
        assert_eq!(config.issue_type_id, None);
        assert!(config.reports_dir.is_none());
    }

    #[test]
    fn chunk_size_is_clamped_and_tunables_parse() {
        let config = ImportConfig::from_lookup(lookup(&[
            ("SEO_CHUNK_SIZE", "5000"),
            ("SEO_NUMBER_LOCALE", "eu"),
            ("SEO_SNAPSHOT_DATE", "2026-02-24"),
            ("ISSUE_TYPE_ID", "4"),
            ("SEO_MAX_IN_FLIGHT", "0"),
        ]))
        .unwrap();
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(config.locale, NumberLocale::Eu);
        assert_eq!(config.snapshot_date, NaiveDate::from_ymd_opt(2026, 2, 24).unwrap());
        assert_eq!(config.issue_type_id, Some(4));
        assert_eq!(config.max_in_flight, 1);

        assert_eq!(clamp_chunk_size(0), 1);
    }

    #[test]
    fn bad_values_are_config_errors() {
        let err = ImportConfig::from_lookup(lookup(&[("SEO_CHUNK_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SEO_CHUNK_SIZE", .. }));
        let err = ImportConfig::from_lookup(lookup(&[("SEO_NUMBER_LOCALE", "martian")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SEO_NUMBER_LOCALE", .. }));
    }

    #[test]
    fn credentials_are_required() {
        let err = StoreCredentials::from_lookup(lookup(&[("SUPABASE_URL", "https://x.supabase.co")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SUPABASE_SERVICE_KEY"));

        let creds = StoreCredentials::from_lookup(lookup(&[
            ("SUPABASE_URL", "https://x.supabase.co"),
            ("SUPABASE_SERVICE_KEY", "secret"),
        ]))
        .unwrap();
        assert!(!format!("{creds:?}").contains("secret"));
    }
}
