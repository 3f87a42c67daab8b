//! JSON-lines: one object per line.

use serde_json::Value;

use super::{LogParser, Sample};
use crate::models::NormalizedEvent;
use crate::normalize::{extract_fields, normalize, truncate_chars, EventDraft, MAX_MESSAGE_CHARS};

const CONFIDENCE: f64 = 0.9;

#[derive(Debug, Default)]
pub struct JsonLinesParser;

impl LogParser for JsonLinesParser {
    fn source_type(&self) -> &'static str {
        "jsonl"
    }

    /// 0.9 scaled by the share of sample lines that are JSON objects; zero
    /// unless the sample opens like JSON.
    fn sniff(&mut self, sample: &Sample) -> f64 {
        let Some(first) = sample.lines.first() else {
            return 0.0;
        };
        if !first.starts_with('{') && !first.starts_with('[') {
            return 0.0;
        }
        let objects = sample
            .lines
            .iter()
            .filter(|line| matches!(serde_json::from_str::<Value>(line), Ok(Value::Object(_))))
            .count();
        CONFIDENCE * objects as f64 / sample.lines.len() as f64
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
        let Ok(Value::Object(object)) = serde_json::from_str::<Value>(line) else {
            return None;
        };

        let fields = extract_fields(object);
        Some(normalize(EventDraft {
            source_path: source_path.to_string(),
            source_type: self.source_type().to_string(),
            line_number,
            event_time: fields.event_time,
            level: fields.level,
            message: fields
                .message
                .unwrap_or_else(|| truncate_chars(line, MAX_MESSAGE_CHARS)),
            attrs: fields.attrs,
            raw_excerpt: line.to_string(),
        }))
    }
}
