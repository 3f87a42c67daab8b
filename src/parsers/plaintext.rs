//! Generic timestamped text lines.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use super::{LogParser, Sample};
use crate::models::NormalizedEvent;
use crate::normalize::{
    find_level, find_timestamp, has_timestamp, normalize, truncate_chars, EventDraft,
    MAX_MESSAGE_CHARS,
};

const CONFIDENCE: f64 = 0.5;

static IPV4: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ip pattern"));

static USER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\buser(?:name)?=([^\s\]]+)").expect("user pattern"));

#[derive(Debug, Default)]
pub struct PlainTextParser;

impl LogParser for PlainTextParser {
    fn source_type(&self) -> &'static str {
        "txt"
    }

    fn sniff(&mut self, sample: &Sample) -> f64 {
        if sample.lines.is_empty() {
            return 0.0;
        }
        let stamped = sample.lines.iter().filter(|l| has_timestamp(l)).count();
        CONFIDENCE * stamped as f64 / sample.lines.len() as f64
    }

    fn parse_line(
        &mut self,
        line: &str,
        line_number: u64,
        source_path: &str,
    ) -> Option<NormalizedEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let mut attrs = BTreeMap::new();
        if let Some(ip) = IPV4.find(line) {
            attrs.insert("ip".to_string(), Value::from(ip.as_str()));
        }
        if let Some(user) = USER.captures(line).and_then(|c| c.get(1)) {
            attrs.insert("user".to_string(), Value::from(user.as_str()));
        }

        Some(normalize(EventDraft {
            source_path: source_path.to_string(),
            source_type: self.source_type().to_string(),
            line_number,
            event_time: find_timestamp(line),
            level: find_level(line),
            message: truncate_chars(line, MAX_MESSAGE_CHARS),
            attrs,
            raw_excerpt: line.to_string(),
        }))
    }
}
