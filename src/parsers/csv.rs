//! Delimited text with a header row.
//!
//! The delimiter is detected during sniffing and kept for the rest of the
//! file; the first non-blank line after a successful sniff is the header.
//! A header never carries a timestamp, which keeps `date time,ms LEVEL`
//! text logs away from this parser. Fields follow RFC 4180 quoting.

use serde_json::Value;
use std::collections::BTreeMap;

use super::{LogParser, Sample};
use crate::models::NormalizedEvent;
use crate::normalize::{
    has_timestamp, normalize, parse_timestamp, truncate_chars, EventDraft, MAX_MESSAGE_CHARS,
};

const CONFIDENCE: f64 = 0.6;
const CANDIDATE_DELIMITERS: [char; 4] = [',', ';', '\t', '|'];
const MESSAGE_FIELDS: usize = 6;
const LEVEL_COLUMNS: &[&str] = &["level", "lvl", "severity", "loglevel"];

#[derive(Debug)]
pub struct CsvParser {
    delimiter: char,
    header: Option<Vec<String>>,
    expect_header: bool,
}

impl Default for CsvParser {
    fn default() -> Self {
        Self {
            delimiter: ',',
            header: None,
            expect_header: false,
        }
    }
}

impl CsvParser {
    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    fn column_name(&self, index: usize) -> String {
        self.header
            .as_ref()
            .and_then(|h| h.get(index))
            .filter(|name| !name.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("col{}", index))
    }
}

impl LogParser for CsvParser {
    fn source_type(&self) -> &'static str {
        "csv"
    }

    fn sniff(&mut self, sample: &Sample) -> f64 {
        if sample.lines.len() < 2 {
            return 0.0;
        }
        let first = &sample.lines[0];
        if first.starts_with('{') || first.starts_with('[') || has_timestamp(first) {
            return 0.0;
        }

        for delimiter in CANDIDATE_DELIMITERS {
            let counts: Vec<usize> = sample
                .lines
                .iter()
                .map(|line| parse_fields(line, delimiter).len())
                .collect();
            if counts[0] > 1 && counts.iter().all(|&c| c == counts[0]) {
                self.delimiter = delimiter;
                self.expect_header = true;
                return CONFIDENCE;
            }
        }
        0.0
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
        let row = parse_fields(line, self.delimiter);

        if self.expect_header {
            self.expect_header = false;
            self.header = Some(row.iter().map(|f| f.trim().to_string()).collect());
            return None;
        }

        let mut attrs = BTreeMap::new();
        let mut level = None;
        for (i, value) in row.iter().enumerate() {
            let name = self.column_name(i);
            if level.is_none() && LEVEL_COLUMNS.contains(&name.to_ascii_lowercase().as_str()) {
                level = Some(value.clone()).filter(|v| !v.trim().is_empty());
            }
            attrs.insert(name, Value::String(value.clone()));
        }
        attrs.insert(
            "columns".to_string(),
            Value::Array(row.iter().cloned().map(Value::String).collect()),
        );

        let head: Vec<&str> = row.iter().take(MESSAGE_FIELDS).map(String::as_str).collect();
        let message = truncate_chars(&head.join(&self.delimiter.to_string()), MAX_MESSAGE_CHARS);

        Some(normalize(EventDraft {
            source_path: source_path.to_string(),
            source_type: self.source_type().to_string(),
            line_number,
            event_time: row.first().and_then(|f| parse_timestamp(f)),
            level,
            message,
            attrs,
            raw_excerpt: line.to_string(),
        }))
    }
}

/// Split one RFC 4180 record. `""` inside quotes is an escaped quote;
/// characters after a closing quote up to the delimiter are dropped.
pub(crate) fn parse_fields(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    let mut field = String::new();

    loop {
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => {
                        if chars.peek() == Some(&'"') {
                            chars.next();
                            field.push('"');
                        } else {
                            break;
                        }
                    }
                    Some(c) => field.push(c),
                    None => break,
                }
            }
            while let Some(c) = chars.next() {
                if c == delimiter {
                    break;
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                chars.next();
                if c == delimiter {
                    break;
                }
                field.push(c);
            }
        }

        fields.push(std::mem::take(&mut field));

        if chars.peek().is_none() {
            if line.ends_with(delimiter) {
                fields.push(String::new());
            }
            break;
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_fields() {
        assert_eq!(parse_fields("a,b,c", ','), vec!["a", "b", "c"]);
        assert_eq!(
            parse_fields(r#""x, y","say ""hi""",z"#, ','),
            vec!["x, y", r#"say "hi""#, "z"]
        );
        assert_eq!(parse_fields("a;b;", ';'), vec!["a", "b", ""]);
        assert_eq!(parse_fields("solo", ','), vec!["solo"]);
    }

    #[test]
    fn sniff_detects_consistent_delimiter() {
        let mut p = CsvParser::default();
        let sample = Sample::from_text("time;level;msg\n2024-01-01 00:00:00;INFO;boot\n", "a");
        assert_eq!(p.sniff(&sample), 0.6);
        assert_eq!(p.delimiter(), ';');

        let mut p = CsvParser::default();
        let ragged = Sample::from_text("a,b,c\n1,2\n", "a");
        assert_eq!(p.sniff(&ragged), 0.0);

        let single = Sample::from_text("a,b,c\n", "a");
        assert_eq!(p.sniff(&single), 0.0);

        let json = Sample::from_text("{\"a\":1,\"b\":2}\n{\"a\":3,\"b\":4}\n", "a");
        assert_eq!(p.sniff(&json), 0.0);
    }

    #[test]
    fn header_maps_columns_into_attrs() {
        let mut p = CsvParser::default();
        p.sniff(&Sample::from_text(
            "timestamp,level,user,action\n2024-03-01T10:00:00Z,warn,ana,login\n",
            "audit.csv",
        ));
        assert!(p.parse_line("timestamp,level,user,action", 1, "audit.csv").is_none());

        let ev = p
            .parse_line("2024-03-01T10:00:00Z,warn,ana,login", 2, "audit.csv")
            .unwrap();
        assert_eq!(ev.source_type, "csv");
        assert_eq!(ev.level.as_deref(), Some("WARN"));
        assert_eq!(ev.attrs["user"], "ana");
        assert_eq!(ev.attrs["columns"].as_array().unwrap().len(), 4);
        assert_eq!(ev.message, "2024-03-01T10:00:00Z,warn,ana,login");
        assert!(ev.event_time.is_some());
    }

    #[test]
    fn python_logging_lines_are_not_csv() {
        let mut p = CsvParser::default();
        let sample = Sample::from_text(
            "2024-01-01 10:00:00,123 INFO worker started\n2024-01-01 10:00:01,456 ERROR db down\n",
            "app.log",
        );
        assert_eq!(p.sniff(&sample), 0.0);
    }

    #[test]
    fn header_is_first_non_blank_line() {
        let text = "\ntime,level,msg\n2024-01-01T00:00:00Z,error,disk full\n";
        let mut p = CsvParser::default();
        assert_eq!(p.sniff(&Sample::from_text(text, "a.csv")), 0.6);

        assert!(p.parse_line("", 1, "a.csv").is_none());
        assert!(p.parse_line("time,level,msg", 2, "a.csv").is_none());
        let ev = p
            .parse_line("2024-01-01T00:00:00Z,error,disk full", 3, "a.csv")
            .unwrap();
        assert_eq!(ev.level.as_deref(), Some("ERROR"));
        assert_eq!(ev.attrs["msg"], "disk full");
        assert!(!ev.attrs.contains_key("col0"));
    }

    #[test]
    fn without_header_columns_are_numbered() {
        let mut p = CsvParser::default();
        let ev = p.parse_line("x,y", 5, "f.csv").unwrap();
        assert_eq!(ev.attrs["col0"], "x");
        assert_eq!(ev.attrs["col1"], "y");
        assert_eq!(ev.event_time, None);
    }
}
