//! Syslog lines, with or without a `<PRI>` prefix.
//!
//! Accepts RFC 3164 (`Oct 11 22:14:15 host tag: msg`) and ISO-timestamped
//! variants. When a priority is present, facility and severity come from
//! it; otherwise the level is guessed from the message text.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::{LogParser, Sample};
use crate::models::NormalizedEvent;
use crate::normalize::{normalize, parse_timestamp, EventDraft};

const CONFIDENCE: f64 = 0.7;

static SYSLOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:<(?P<pri>\d{1,3})>(?:1 )?)?(?P<ts>[A-Z][a-z]{2}\s+\d{1,2}\s\d{2}:\d{2}:\d{2}|\d{4}-\d{2}-\d{2}T[\d:+\-.Z]+)\s+(?P<host>\S+)\s+(?P<tag>[\w\-/\[\].]+):\s*(?P<msg>.*)$",
    )
    .expect("syslog pattern")
});

static FAILURE_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(fail\w*|error|critical|denied)\b").expect("failure pattern")
});

/// RFC 5424 §6.2.1
const SEVERITIES: [&str; 8] = [
    "EMERGENCY", "ALERT", "CRITICAL", "ERROR", "WARNING", "NOTICE", "INFO", "DEBUG",
];

const FACILITIES: [&str; 24] = [
    "kern", "user", "mail", "daemon", "auth", "syslog", "lpr", "news", "uucp", "cron",
    "authpriv", "ftp", "ntp", "audit", "alert", "clock", "local0", "local1", "local2",
    "local3", "local4", "local5", "local6", "local7",
];

#[derive(Debug, Default)]
pub struct SyslogParser;

impl LogParser for SyslogParser {
    fn source_type(&self) -> &'static str {
        "syslog"
    }

    fn sniff(&mut self, sample: &Sample) -> f64 {
        if sample.lines.is_empty() {
            return 0.0;
        }
        let matching = sample
            .lines
            .iter()
            .filter(|line| SYSLOG_LINE.is_match(line))
            .count();
        CONFIDENCE * matching as f64 / sample.lines.len() as f64
    }

    fn parse_line(
        &mut self,
        line: &str,
        line_number: u64,
        source_path: &str,
    ) -> Option<NormalizedEvent> {
        let line = line.trim();
        let caps = SYSLOG_LINE.captures(line)?;
        let message = caps["msg"].to_string();

        let mut attrs = BTreeMap::new();
        attrs.insert("host".to_string(), Value::from(&caps["host"]));
        attrs.insert("tag".to_string(), Value::from(&caps["tag"]));

        let priority = caps.name("pri").and_then(|m| m.as_str().parse::<usize>().ok());
        let level = match priority {
            Some(pri) => {
                if let Some(facility) = FACILITIES.get(pri >> 3) {
                    attrs.insert("facility".to_string(), Value::from(*facility));
                }
                attrs.insert("priority".to_string(), Value::from(pri as u64));
                SEVERITIES[pri & 0x07].to_string()
            }
            None if FAILURE_WORDS.is_match(&message) => "ERROR".to_string(),
            None => "INFO".to_string(),
        };

        Some(normalize(EventDraft {
            source_path: source_path.to_string(),
            source_type: self.source_type().to_string(),
            line_number,
            event_time: parse_timestamp(&caps["ts"]),
            level: Some(level),
            message,
            attrs,
            raw_excerpt: line.to_string(),
        }))
    }
}
