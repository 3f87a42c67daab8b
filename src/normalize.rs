//! Normalization: parser output → [`NormalizedEvent`].
//!
//! Everything here is pure. Parsers fill an [`EventDraft`] and call
//! [`normalize`], which cleans up the level, caps the message length, and
//! stamps the content hash.
//!
//! # Content hash
//!
//! [`content_hash`] is SHA-256 over a canonical JSON rendering of
//! `{attrs, event_time, level, message, source_path}` with object keys
//! sorted at every depth, so attribute insertion order never changes the
//! digest. `source_type`, `line_number`, and `raw_excerpt` are not part of
//! the digest, so the same event seen through another parser or at another
//! offset deduplicates at the sink.
//!
//! # Timestamps
//!
//! [`parse_timestamp`] is permissive: RFC 3339, ISO-ish date-times with
//! `.` or `,` fractions and optional zones, RFC 2822, syslog
//! `Mon DD HH:MM:SS` (current year), bare dates, and epoch seconds or
//! milliseconds. Anything else yields `None` rather than an error.

use chrono::{
    DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc,
};
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::models::NormalizedEvent;

/// Messages and excerpts derived from free text are capped at this many chars.
pub const MAX_MESSAGE_CHARS: usize = 500;

const TIMESTAMP_KEYS: &[&str] = &["ts", "time", "timestamp", "@timestamp", "datetime"];
const LEVEL_KEYS: &[&str] = &["level", "lvl", "severity", "loglevel"];
const MESSAGE_KEYS: &[&str] = &["msg", "message", "event"];

static TIMESTAMP_CANDIDATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?)|([A-Z][a-z]{2}\s+\d{1,2}\s\d{2}:\d{2}:\d{2})",
    )
    .expect("timestamp pattern")
});

static LEVEL_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(TRACE|DEBUG|INFO|NOTICE|WARN|WARNING|ERROR|CRITICAL|FATAL)\b")
        .expect("level pattern")
});

/// Parser output before hashing.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub source_path: String,
    pub source_type: String,
    pub line_number: u64,
    pub event_time: Option<DateTime<Utc>>,
    pub level: Option<String>,
    pub message: String,
    pub attrs: BTreeMap<String, Value>,
    pub raw_excerpt: String,
}

/// Finish a draft: trim and upper-case the level (empty → `None`) and
/// compute the content hash.
pub fn normalize(draft: EventDraft) -> NormalizedEvent {
    let level = draft
        .level
        .map(|l| l.trim().to_uppercase())
        .filter(|l| !l.is_empty());

    let content_hash = content_hash(
        &draft.source_path,
        draft.event_time.as_ref(),
        level.as_deref(),
        &draft.message,
        &draft.attrs,
    );

    NormalizedEvent {
        source_path: draft.source_path,
        source_type: draft.source_type,
        line_number: draft.line_number,
        event_time: draft.event_time,
        level,
        message: draft.message,
        attrs: draft.attrs,
        raw_excerpt: draft.raw_excerpt,
        content_hash,
    }
}

/// Stable digest over the semantic fields of an event.
pub fn content_hash(
    source_path: &str,
    event_time: Option<&DateTime<Utc>>,
    level: Option<&str>,
    message: &str,
    attrs: &BTreeMap<String, Value>,
) -> String {
    let mut key = Map::new();
    key.insert(
        "attrs".to_string(),
        Value::Object(attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    );
    key.insert(
        "event_time".to_string(),
        event_time
            .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            .unwrap_or(Value::Null),
    );
    key.insert(
        "level".to_string(),
        level.map(|l| Value::String(l.to_string())).unwrap_or(Value::Null),
    );
    key.insert("message".to_string(), Value::String(message.to_string()));
    key.insert(
        "source_path".to_string(),
        Value::String(source_path.to_string()),
    );

    let mut canonical = String::new();
    write_canonical(&Value::Object(key), &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// JSON with object keys sorted at every level, independent of whether
/// `serde_json` was built with `preserve_order`.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Recognized fields pulled out of a structured record.
#[derive(Debug, Default)]
pub struct ExtractedFields {
    pub event_time: Option<DateTime<Utc>>,
    pub level: Option<String>,
    pub message: Option<String>,
    pub attrs: BTreeMap<String, Value>,
}

/// Split a JSON object into timestamp/level/message and the remaining
/// attributes. Alias keys are consumed even when their values fail to
/// parse.
pub fn extract_fields(object: Map<String, Value>) -> ExtractedFields {
    let mut fields = ExtractedFields::default();

    for (key, value) in object {
        let lower = key.to_ascii_lowercase();
        if TIMESTAMP_KEYS.contains(&lower.as_str()) {
            if fields.event_time.is_none() {
                fields.event_time = timestamp_from_json(&value);
            }
        } else if LEVEL_KEYS.contains(&lower.as_str()) {
            if fields.level.is_none() {
                fields.level = scalar_to_string(&value);
            }
        } else if MESSAGE_KEYS.contains(&lower.as_str()) {
            if fields.message.is_none() {
                fields.message = scalar_to_string(&value);
            }
        } else {
            fields.attrs.insert(key, value);
        }
    }

    fields
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Timestamp from a JSON value: strings go through [`parse_timestamp`],
/// numbers are epoch seconds (or milliseconds when implausibly large).
pub fn timestamp_from_json(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n.as_f64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    // Anything past year 5138 in seconds is read as milliseconds.
    let millis = if value > 1e11 { value } else { value * 1000.0 };
    Utc.timestamp_millis_opt(millis as i64).single()
}

/// Best-effort timestamp parsing; see the module docs for accepted shapes.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if s.chars().all(|c| c.is_ascii_digit() || c == '.') && (s.len() == 10 || s.len() >= 13) {
        return s.parse::<f64>().ok().and_then(from_epoch);
    }

    let iso = s.replacen(',', ".", 1);
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f%:z",
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%d %H:%M:%S%.f%z",
        "%Y-%m-%d %H:%M:%S%.f %z",
        "%d/%b/%Y:%H:%M:%S %z",
    ] {
        if let Ok(dt) = DateTime::parse_from_str(&iso, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let naive_input = iso.strip_suffix('Z').unwrap_or(&iso);
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(naive_input, fmt) {
            return Some(naive.and_utc());
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Some(dt) = parse_syslog_timestamp(s) {
        return Some(dt);
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// `Oct 11 22:14:15` has no year: assume the current one, or the previous
/// one if that would put the event more than a day in the future.
fn parse_syslog_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let now = Utc::now();
    let parsed = NaiveDateTime::parse_from_str(
        &format!("{} {}", now.year(), collapsed),
        "%Y %b %d %H:%M:%S",
    )
    .ok()?
    .and_utc();

    if parsed > now + chrono::Duration::days(1) {
        parsed.with_year(now.year() - 1)
    } else {
        Some(parsed)
    }
}

/// Locate and parse the first timestamp-looking substring of free text.
pub fn find_timestamp(text: &str) -> Option<DateTime<Utc>> {
    TIMESTAMP_CANDIDATE
        .find(text)
        .and_then(|m| parse_timestamp(m.as_str()))
}

/// Whether free text contains something that looks like a timestamp.
pub fn has_timestamp(text: &str) -> bool {
    TIMESTAMP_CANDIDATE.is_match(text)
}

/// First level keyword in free text, upper-cased.
pub fn find_level(text: &str) -> Option<String> {
    LEVEL_KEYWORD
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_uppercase())
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
