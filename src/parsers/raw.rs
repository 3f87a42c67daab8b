//! Last-resort parser: every non-blank line becomes an event verbatim.

use super::{LogParser, Sample};
use crate::models::NormalizedEvent;
use crate::normalize::{normalize, truncate_chars, EventDraft, MAX_MESSAGE_CHARS};

/// Low enough that any parser with a real opinion beats it.
pub const FALLBACK_CONFIDENCE: f64 = 0.01;

#[derive(Debug, Default)]
pub struct RawParser;

impl LogParser for RawParser {
    fn source_type(&self) -> &'static str {
        "raw"
    }

    fn sniff(&mut self, sample: &Sample) -> f64 {
        if sample.is_empty() {
            0.0
        } else {
            FALLBACK_CONFIDENCE
        }
    }

    fn parse_line(
        &mut self,
        line: &str,
        line_number: u64,
        source_path: &str,
    ) -> Option<NormalizedEvent> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }
        Some(normalize(EventDraft {
            source_path: source_path.to_string(),
            source_type: self.source_type().to_string(),
            line_number,
            message: truncate_chars(line, MAX_MESSAGE_CHARS),
            raw_excerpt: line.to_string(),
            ..Default::default()
        }))
    }
}
