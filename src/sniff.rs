//! Parser selection.
//!
//! 1. Magic-byte short-circuit: a binary parser whose signature prefixes
//!    the file wins outright, no scoring.
//! 2. Every registered text parser scores the sample; the strictly highest
//!    score wins, so ties go to the earlier registration.
//! 3. If nothing scores above zero and the file is not empty, the raw
//!    fallback is used.
//! 4. An empty file selects nothing.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::parsers::{BinaryParser, LogParser, ParserRegistry, Sample};

/// Bytes read from the head of a file for sniffing.
pub const SAMPLE_BYTES: u64 = 64 * 1024;

pub enum Selection {
    Binary(Arc<dyn BinaryParser>),
    Text {
        parser: Box<dyn LogParser>,
        confidence: f64,
        fallback: bool,
    },
}

impl Selection {
    pub fn source_type(&self) -> &'static str {
        match self {
            Selection::Binary(p) => p.source_type(),
            Selection::Text { parser, .. } => parser.source_type(),
        }
    }
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selection::Binary(p) => f.debug_tuple("Binary").field(&p.source_type()).finish(),
            Selection::Text {
                parser,
                confidence,
                fallback,
            } => f
                .debug_struct("Text")
                .field("parser", &parser.source_type())
                .field("confidence", confidence)
                .field("fallback", fallback)
                .finish(),
        }
    }
}

/// Choose a parser for `sample`. Pure over the registry and the sample.
pub fn select(registry: &ParserRegistry, sample: &Sample) -> Option<Selection> {
    if let Some(binary) = registry
        .binary_parsers()
        .iter()
        .find(|p| sample.head.starts_with(p.magic()))
    {
        return Some(Selection::Binary(Arc::clone(binary)));
    }

    if sample.is_empty() {
        return None;
    }

    let mut best: Option<(Box<dyn LogParser>, f64)> = None;
    for entry in registry.text_parsers() {
        let mut parser = entry.build();
        let score = parser.sniff(sample);
        debug!(parser = entry.id, score, file = %sample.filename, "sniff");
        let best_score = best.as_ref().map(|(_, s)| *s).unwrap_or(0.0);
        if score > best_score {
            best = Some((parser, score));
        }
    }

    match best {
        Some((parser, confidence)) => Some(Selection::Text {
            parser,
            confidence,
            fallback: false,
        }),
        None => {
            let mut parser = registry.fallback();
            let confidence = parser.sniff(sample);
            Some(Selection::Text {
                parser,
                confidence,
                fallback: true,
            })
        }
    }
}

/// Read the head of `path` into a [`Sample`] of up to `max_lines` lines.
pub async fn read_sample(path: &Path, max_lines: usize) -> Result<Sample> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open for sniffing: {}", path.display()))?;
    let mut head = Vec::new();
    file.take(SAMPLE_BYTES)
        .read_to_end(&mut head)
        .await
        .with_context(|| format!("Failed to read sample: {}", path.display()))?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Sample::from_bytes(&head, &filename, max_lines))
}
