//! Log parsers and the registry the sniffer chooses from.
//!
//! Two capability sets:
//!
//! - [`LogParser`]: line-oriented text formats. Each parser scores a
//!   [`Sample`] of the file and then turns lines into events one at a time.
//!   Parsers may carry per-file state (the CSV parser remembers its
//!   delimiter and header), so the registry stores *constructors* and every
//!   file gets fresh instances.
//! - [`BinaryParser`]: formats with an unambiguous magic signature. These
//!   are matched on the first bytes before any scoring and read the file
//!   themselves, handing events back in batches.
//!
//! # Registration
//!
//! [`ParserRegistry::builtin`] is the explicit start-up table:
//!
//! ```text
//!  text (scored, in order)     binary (magic)     fallback
//!  ┌──────┬────────┬─────┬─────┐  ┌──────┐          ┌─────┐
//!  │jsonl │ syslog │ csv │ txt │  │ evtx │          │ raw │
//!  └──────┴────────┴─────┴─────┘  └──────┘          └─────┘
//! ```
//!
//! Registration order is the sniffing tie-break: on equal scores the
//! earlier parser wins.

pub mod csv;
pub mod evtx;
pub mod jsonl;
pub mod plaintext;
pub mod raw;
pub mod syslog;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::models::NormalizedEvent;

pub use self::csv::CsvParser;
pub use self::evtx::EvtxParser;
pub use self::jsonl::JsonLinesParser;
pub use self::plaintext::PlainTextParser;
pub use self::raw::RawParser;
pub use self::syslog::SyslogParser;

/// The slice of a file the sniffer shows to each parser.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    /// First non-blank lines, lossily decoded and trimmed.
    pub lines: Vec<String>,
    /// Leading bytes of the file, for magic checks.
    pub head: Vec<u8>,
    /// File name (no directory), for parsers that care about extensions.
    pub filename: String,
}

impl Sample {
    pub fn from_text(text: &str, filename: &str) -> Self {
        Self::from_bytes(text.as_bytes(), filename, usize::MAX)
    }

    pub fn from_bytes(head: &[u8], filename: &str, max_lines: usize) -> Self {
        let lines = String::from_utf8_lossy(head)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(max_lines)
            .map(str::to_string)
            .collect();
        Self {
            lines,
            head: head.to_vec(),
            filename: filename.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }
}

/// A line-oriented text parser.
pub trait LogParser: Send {
    /// Identifier written to `NormalizedEvent::source_type`.
    fn source_type(&self) -> &'static str;

    /// Confidence in `[0, 1]` that this parser handles the sampled file.
    fn sniff(&mut self, sample: &Sample) -> f64;

    /// Parse one line. `None` skips the line (blank, header, malformed)
    /// without failing the file.
    fn parse_line(
        &mut self,
        line: &str,
        line_number: u64,
        source_path: &str,
    ) -> Option<NormalizedEvent>;
}

/// A file-level parser gated on a magic signature.
///
/// `parse_file` does blocking I/O and is run off the async runtime.
pub trait BinaryParser: Send + Sync {
    fn source_type(&self) -> &'static str;

    /// Leading bytes that identify the format.
    fn magic(&self) -> &'static [u8];

    /// Read `path`, passing events to `emit` in batches of at most
    /// `batch_size`. Returns the number of events produced. An error from
    /// `emit` stops the read and is returned as is.
    fn parse_file(
        &self,
        path: &Path,
        source_path: &str,
        batch_size: usize,
        emit: &mut dyn FnMut(Vec<NormalizedEvent>) -> Result<()>,
    ) -> Result<u64>;
}

type Constructor = fn() -> Box<dyn LogParser>;

fn construct<P: LogParser + Default + 'static>() -> Box<dyn LogParser> {
    Box::new(P::default())
}

/// One row of the registration table.
#[derive(Clone, Copy)]
pub struct ParserEntry {
    pub id: &'static str,
    build: Constructor,
}

impl ParserEntry {
    pub fn build(&self) -> Box<dyn LogParser> {
        (self.build)()
    }
}

/// Registration table of text parsers (scored), binary parsers (magic),
/// and the raw fallback. Built once at start-up and shared read-only.
#[derive(Clone)]
pub struct ParserRegistry {
    text: Vec<ParserEntry>,
    binary: Vec<Arc<dyn BinaryParser>>,
    fallback: ParserEntry,
}

impl ParserRegistry {
    /// A registry with no scored parsers; everything non-empty falls back
    /// to raw.
    pub fn empty() -> Self {
        Self {
            text: Vec::new(),
            binary: Vec::new(),
            fallback: ParserEntry {
                id: "raw",
                build: construct::<RawParser>,
            },
        }
    }

    /// The built-in table.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register::<JsonLinesParser>();
        registry.register::<SyslogParser>();
        registry.register::<CsvParser>();
        registry.register::<PlainTextParser>();
        registry.register_binary(Arc::new(EvtxParser));
        registry
    }

    /// Append a text parser. Later registrations lose ties.
    pub fn register<P: LogParser + Default + 'static>(&mut self) {
        let id = P::default().source_type();
        self.text.push(ParserEntry {
            id,
            build: construct::<P>,
        });
    }

    pub fn register_binary(&mut self, parser: Arc<dyn BinaryParser>) {
        self.binary.push(parser);
    }

    pub fn text_parsers(&self) -> &[ParserEntry] {
        &self.text
    }

    pub fn binary_parsers(&self) -> &[Arc<dyn BinaryParser>] {
        &self.binary
    }

    pub fn fallback(&self) -> Box<dyn LogParser> {
        self.fallback.build()
    }

    /// Identifiers in registration order, binary parsers last.
    pub fn ids(&self) -> Vec<&'static str> {
        self.text
            .iter()
            .map(|e| e.id)
            .chain(self.binary.iter().map(|p| p.source_type()))
            .collect()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
