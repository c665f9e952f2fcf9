//! Output encodings and per-destination framing
//!
//! Line-encoded output is one compact JSON record per line, the format
//! arangoimp consumes for bulk import. Document-array output is a single
//! valid JSON array. Every destination owns its own [`Framer`] because each
//! receives a different subset of records and must open and close its array
//! on its own.

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::core::error::Error;

const EOL: &[u8] = b"\n";
const ARRAY_OPEN: &[u8] = b"[\n  ";
const ARRAY_SEPARATOR: &[u8] = b",\n  ";
const ARRAY_CLOSE: &[u8] = b"\n]\n";
const ARRAY_EMPTY: &[u8] = b"[\n]\n";

/// Output encoding, chosen once per export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Encoding {
    /// One JSON record per line
    #[default]
    #[value(alias = "arangoimp")]
    LineEncoded,
    /// A single JSON array of records
    #[value(alias = "json")]
    DocumentArray,
}

impl Encoding {
    /// File extension for collection files written in this encoding
    pub fn extension(&self) -> &'static str {
        match self {
            Encoding::LineEncoded => "jsonl",
            Encoding::DocumentArray => "json",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::LineEncoded => f.write_str("line-encoded"),
            Encoding::DocumentArray => f.write_str("document-array"),
        }
    }
}

impl FromStr for Encoding {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "line-encoded" | "arangoimp" => Ok(Encoding::LineEncoded),
            "document-array" | "json" => Ok(Encoding::DocumentArray),
            other => Err(Error::InvalidInput(format!("unknown export mode '{other}'"))),
        }
    }
}

/// Stateful encoder for one destination
#[derive(Debug, Clone)]
pub struct Framer {
    encoding: Encoding,
    wrote_first: bool,
    closed: bool,
}

impl Framer {
    pub fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            wrote_first: false,
            closed: false,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Frame one already-serialized record
    pub fn frame(&mut self, record: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(record.len() + ARRAY_OPEN.len());
        match self.encoding {
            Encoding::LineEncoded => {
                out.extend_from_slice(record);
                out.extend_from_slice(EOL);
            }
            Encoding::DocumentArray => {
                let prefix = if self.wrote_first { ARRAY_SEPARATOR } else { ARRAY_OPEN };
                out.extend_from_slice(prefix);
                out.extend_from_slice(record);
            }
        }
        self.wrote_first = true;
        out
    }

    /// Closing frame; empty on every call after the first
    pub fn close(&mut self) -> &'static [u8] {
        if std::mem::replace(&mut self.closed, true) {
            return b"";
        }
        match self.encoding {
            Encoding::LineEncoded => b"",
            Encoding::DocumentArray if self.wrote_first => ARRAY_CLOSE,
            Encoding::DocumentArray => ARRAY_EMPTY,
        }
    }
}
