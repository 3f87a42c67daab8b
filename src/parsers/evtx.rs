//! Windows event log (`.evtx`) files.
//!
//! Records are rendered to XML by the `evtx` crate one chunk at a time and
//! handed out in batches, so memory stays bounded by the batch size rather
//! than the file size. From each record's `<System>` block:
//!
//! | XML                          | event field         |
//! |------------------------------|---------------------|
//! | `TimeCreated/@SystemTime`    | `event_time`        |
//! | `Level`                      | `level`             |
//! | `Provider/@Name`, `EventID`  | message prefix, attrs |
//! | `Channel`, `Computer`        | attrs               |
//!
//! `<Data>` values follow the prefix in the message. The rendered XML is
//! kept as the raw excerpt.

use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

use super::BinaryParser;
use crate::models::NormalizedEvent;
use crate::normalize::{normalize, parse_timestamp, truncate_chars, EventDraft, MAX_MESSAGE_CHARS};

pub const FILE_MAGIC: &[u8] = b"ElfFile\0";

const RAW_EXCERPT_CHARS: usize = 4096;

static PROVIDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<Provider\s[^>]*?Name="([^"]*)""#).expect("provider pattern"));
static TIME_CREATED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<TimeCreated\s[^>]*?SystemTime="([^"]*)""#).expect("time pattern")
});
static DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<Data(?:\s[^>]*)?>([^<]*)</Data>").expect("data pattern"));

fn element(name: &str) -> Regex {
    Regex::new(&format!(r"<{0}(?:\s[^>]*)?>([^<]*)</{0}>", name)).expect("element pattern")
}

static EVENT_ID: LazyLock<Regex> = LazyLock::new(|| element("EventID"));
static LEVEL: LazyLock<Regex> = LazyLock::new(|| element("Level"));
static CHANNEL: LazyLock<Regex> = LazyLock::new(|| element("Channel"));
static COMPUTER: LazyLock<Regex> = LazyLock::new(|| element("Computer"));

#[derive(Debug, Default, Clone, Copy)]
pub struct EvtxParser;

impl BinaryParser for EvtxParser {
    fn source_type(&self) -> &'static str {
        "evtx"
    }

    fn magic(&self) -> &'static [u8] {
        FILE_MAGIC
    }

    fn parse_file(
        &self,
        path: &Path,
        source_path: &str,
        batch_size: usize,
        emit: &mut dyn FnMut(Vec<NormalizedEvent>) -> Result<()>,
    ) -> Result<u64> {
        let mut parser = ::evtx::EvtxParser::from_path(path)
            .map_err(|e| anyhow!("Failed to open event log {}: {}", path.display(), e))?;

        let mut batch = Vec::with_capacity(batch_size);
        let mut produced = 0u64;
        for (index, record) in parser.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), record = index + 1, error = %e, "skipping unreadable record");
                    continue;
                }
            };
            batch.push(event_from_xml(
                &record.data,
                record.event_record_id,
                index as u64 + 1,
                source_path,
            ));
            produced += 1;
            if batch.len() >= batch_size {
                emit(std::mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            emit(batch)?;
        }
        Ok(produced)
    }
}

/// Build an event from one rendered record.
pub fn event_from_xml(xml: &str, record_id: u64, sequence: u64, source_path: &str) -> NormalizedEvent {
    let capture = |re: &Regex| {
        re.captures(xml)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let provider = capture(&PROVIDER);
    let event_id = capture(&EVENT_ID);
    let level = capture(&LEVEL).and_then(|l| level_name(&l));
    let event_time = capture(&TIME_CREATED).and_then(|t| {
        let t = t.strip_suffix(" UTC").unwrap_or(&t).to_string();
        parse_timestamp(&t)
    });

    let mut attrs = BTreeMap::new();
    attrs.insert("record_id".to_string(), Value::from(record_id));
    if let Some(id) = &event_id {
        let value = id.parse::<u64>().map(Value::from).unwrap_or_else(|_| Value::from(id.as_str()));
        attrs.insert("event_id".to_string(), value);
    }
    for (key, value) in [
        ("provider", provider.clone()),
        ("channel", capture(&CHANNEL)),
        ("computer", capture(&COMPUTER)),
    ] {
        if let Some(v) = value {
            attrs.insert(key.to_string(), Value::from(v));
        }
    }

    let data: Vec<&str> = DATA
        .captures_iter(xml)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect();
    let prefix = match (&provider, &event_id) {
        (Some(p), Some(id)) => format!("{} {}", p, id),
        (Some(p), None) => p.clone(),
        (None, Some(id)) => format!("event {}", id),
        (None, None) => format!("record {}", record_id),
    };
    let message = if data.is_empty() {
        prefix
    } else {
        format!("{}: {}", prefix, data.join(" "))
    };

    normalize(EventDraft {
        source_path: source_path.to_string(),
        source_type: "evtx".to_string(),
        line_number: sequence,
        event_time,
        level,
        message: truncate_chars(&message, MAX_MESSAGE_CHARS),
        attrs,
        raw_excerpt: truncate_chars(xml, RAW_EXCERPT_CHARS),
    })
}

/// Windows `<Level>` values. 0 is "LogAlways", which providers use for
/// informational records.
fn level_name(level: &str) -> Option<String> {
    let name = match level.parse::<u8>().ok()? {
        0 | 4 => "INFO",
        1 => "CRITICAL",
        2 => "ERROR",
        3 => "WARNING",
        5 => "DEBUG",
        _ => return None,
    };
    Some(name.to_string())
}
