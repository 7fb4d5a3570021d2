//! Text-to-value conversions applied to every imported cell.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use url::Url;

/// Which separator convention wins when a number is ambiguous on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumberLocale {
    /// `1,234.56`
    #[default]
    Us,
    /// `1.234,56`
    Eu,
}

impl FromStr for NumberLocale {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "us" | "en" | "en-us" | "en_us" => Ok(NumberLocale::Us),
            "eu" | "de" | "fr" | "es" | "it" | "nl" | "de-de" | "de_de" => Ok(NumberLocale::Eu),
            other => Err(format!("unknown number locale `{other}` (expected `us` or `eu`)")),
        }
    }
}

impl NumberLocale {
    fn decimal_separator(self) -> char {
        match self {
            NumberLocale::Us => '.',
            NumberLocale::Eu => ',',
        }
    }
}

/// Blank cells are absent, never zero.
pub fn non_empty(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn strip_number_noise(raw: &str) -> String {
    raw.trim()
        .trim_end_matches('%')
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\'')
        .collect()
}

/// Parse a US- or EU-formatted number.
///
/// With both separators present the later one is the decimal point. A lone
/// separator followed by exactly three digits (`1.234`, `1,234`) could be
/// either, so the configured locale decides.
pub fn parse_number(raw: &str, locale: NumberLocale) -> Option<f64> {
    let cleaned = strip_number_noise(raw);
    if cleaned.is_empty() {
        return None;
    }
    let (sign, body) = match cleaned.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", cleaned.strip_prefix('+').unwrap_or(&cleaned)),
    };
    if body.is_empty() {
        return None;
    }
    if !body.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return cleaned.parse::<f64>().ok().filter(|v| v.is_finite());
    }

    let dots = body.matches('.').count();
    let commas = body.matches(',').count();
    let decimal = match (dots, commas) {
        (0, 0) => None,
        (d, c) if d > 0 && c > 0 => body.rfind(['.', ',']).and_then(|i| body[i..].chars().next()),
        (1, 0) => lone_separator_role(body, '.', locale),
        (0, 1) => lone_separator_role(body, ',', locale),
        _ => None,
    };

    if let Some(sep) = decimal {
        if body.matches(sep).count() > 1 {
            return None;
        }
    }

    let mut normalized = String::with_capacity(body.len() + 1);
    normalized.push_str(sign);
    for c in body.chars() {
        match c {
            '.' | ',' if Some(c) == decimal => normalized.push('.'),
            '.' | ',' => {}
            digit => normalized.push(digit),
        }
    }
    normalized.parse::<f64>().ok()
}

fn lone_separator_role(body: &str, sep: char, locale: NumberLocale) -> Option<char> {
    let (before, after) = body.split_once(sep)?;
    let ambiguous = after.len() == 3 && !before.is_empty() && before != "0";
    if !ambiguous || locale.decimal_separator() == sep {
        Some(sep)
    } else {
        None
    }
}

/// Whole numbers; grouping separators are accepted in either convention.
pub fn parse_integer(raw: &str, locale: NumberLocale) -> Option<i64> {
    let cleaned = strip_number_noise(raw);
    let body = cleaned.trim_start_matches(['-', '+']);
    if is_digit_grouped(body) {
        let digits: String = cleaned.chars().filter(|c| *c != '.' && *c != ',').collect();
        return digits.parse().ok();
    }
    let value = parse_number(raw, locale)?;
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

fn is_digit_grouped(body: &str) -> bool {
    let mut groups = body.split(['.', ',']);
    let Some(first) = groups.next() else {
        return false;
    };
    let rest: Vec<&str> = groups.collect();
    !rest.is_empty()
        && (1..=3).contains(&first.len())
        && first.chars().all(|c| c.is_ascii_digit())
        && rest.iter().all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
        && {
            let seps: Vec<char> = body.chars().filter(|c| *c == '.' || *c == ',').collect();
            seps.windows(2).all(|w| w[0] == w[1])
        }
}

/// Matching key for a page URL.
///
/// Scheme is ignored, the host is lower-cased with one leading `www.` label
/// removed, the fragment is dropped, and `/a/` and `/a` collapse to `/a`.
/// Relative paths have no host and yield `None`.
pub fn url_lookup_key(raw: &str) -> Option<String> {
    let trimmed = non_empty(raw)?;
    if trimmed.starts_with('/') && !trimmed.starts_with("//") {
        return None;
    }
    let absolute = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed.trim_start_matches('/'))
    };
    let parsed = Url::parse(&absolute).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut key = String::with_capacity(absolute.len());
    key.push_str(host);
    if let Some(port) = parsed.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }
    key.push_str(parsed.path().trim_end_matches('/'));
    if let Some(query) = parsed.query().filter(|q| !q.is_empty()) {
        key.push('?');
        key.push_str(query);
    }
    Some(key)
}

/// Canonical form of a referring domain: bare host, lower-case, no `www.`.
pub fn domain_key(raw: &str) -> Option<String> {
    let trimmed = non_empty(raw)?;
    let host = if trimmed.contains("://") {
        Url::parse(trimmed).ok()?.host_str()?.to_string()
    } else {
        trimmed
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default()
            .to_string()
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if host.is_empty() || host.contains(char::is_whitespace) {
        None
    } else {
        Some(host.to_string())
    }
}

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];
const ISO_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"];
const EU_DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y"];
const US_DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%m-%d-%Y"];
const NAMED_MONTH_FORMATS: &[&str] = &["%b %d, %Y", "%B %d, %Y", "%d %b %Y", "%d %B %Y"];

/// Parse a calendar date; anything unparseable is absent, never "today".
pub fn parse_date(raw: &str, locale: NumberLocale) -> Option<NaiveDate> {
    parse_timestamp(raw, locale).map(|ts| ts.date_naive())
}

pub fn parse_timestamp(raw: &str, locale: NumberLocale) -> Option<DateTime<Utc>> {
    let s = non_empty(raw)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    let locale_formats = match locale {
        NumberLocale::Eu => EU_DATE_FORMATS,
        NumberLocale::Us => US_DATE_FORMATS,
    };
    ISO_DATE_FORMATS
        .iter()
        .chain(locale_formats)
        .chain(NAMED_MONTH_FORMATS)
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
