//! Error types for butterfly-export
//!
//! Provides error handling for the export pipeline and fuzzy matching for
//! collection names that a hook targets but nobody registered.

use std::fmt;
use strsim::{jaro_winkler, normalized_levenshtein};

/// Minimum combined similarity for a collection suggestion
const SUGGESTION_THRESHOLD: f64 = 0.75;

/// Suggest a registered collection for a misspelled name
///
/// Scores candidates with 70% Jaro-Winkler and 30% normalized Levenshtein,
/// the same blend butterfly-common uses for source names. Exact matches
/// return `None` since there is nothing to correct.
pub fn suggest_collection<'a, I>(name: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let name_lower = name.to_lowercase();
    let mut best_match = None;
    let mut best_score = 0.0f64;

    for candidate in candidates {
        let candidate_lower = candidate.to_lowercase();
        if candidate_lower == name_lower {
            return None;
        }

        let score = jaro_winkler(&name_lower, &candidate_lower) * 0.7
            + normalized_levenshtein(&name_lower, &candidate_lower) * 0.3;

        if score >= SUGGESTION_THRESHOLD && score > best_score {
            best_score = score;
            best_match = Some(candidate.to_string());
        }
    }

    best_match
}

/// Main error type for butterfly-export operations
#[derive(Debug)]
pub enum Error {
    /// Malformed element record coming from the tokenizer
    Decode(String),

    /// Reference cache store unavailable or corrupt
    Cache(String),

    /// Destination sink failed while writing or closing
    Sink {
        collection: String,
        source: std::io::Error,
    },

    /// Record could not be serialized
    Serialization(serde_json::Error),

    /// A transform hook reported a failure
    Hook(String),

    /// Invalid configuration or parameters
    InvalidInput(String),

    /// File I/O error
    IoError(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Decode(msg) => {
                write!(f, "Failed to decode element: {}", msg)
            }
            Error::Cache(msg) => {
                write!(f, "Reference cache error: {}", msg)
            }
            Error::Sink { collection, source } => {
                write!(f, "Failed to write collection '{}': {}", collection, source)
            }
            Error::Serialization(err) => {
                write!(f, "Serialization error: {}", err)
            }
            Error::Hook(msg) => {
                write!(f, "Transform hook failed: {}", msg)
            }
            Error::InvalidInput(msg) => {
                write!(f, "Invalid input: {}", msg)
            }
            Error::IoError(err) => {
                write!(f, "I/O error: {}", err)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Sink { source, .. } => Some(source),
            Error::Serialization(err) => Some(err),
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err)
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Cache(err.to_string())
    }
}

/// Convenience result type for butterfly-export operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggest_collection_typos() {
        let registered = ["points", "ways", "relations", "stops", "services"];
        assert_eq!(
            suggest_collection("stpos", registered),
            Some("stops".to_string())
        );
        assert_eq!(
            suggest_collection("relaitons", registered),
            Some("relations".to_string())
        );
        assert_eq!(
            suggest_collection("service", registered),
            Some("services".to_string())
        );
    }

    #[test]
    fn test_suggest_collection_no_match() {
        let registered = ["points", "ways", "relations"];
        assert_eq!(suggest_collection("totally-unrelated", registered), None);
        assert_eq!(suggest_collection("ways", registered), None);
        assert_eq!(suggest_collection("WAYS", registered), None);
    }

    #[test]
    fn test_error_display() {
        let err = Error::Sink {
            collection: "stops".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"),
        };
        assert_eq!(
            err.to_string(),
            "Failed to write collection 'stops': pipe closed"
        );
        assert!(std::error::Error::source(&err).is_some());

        let err = Error::Decode("missing id".to_string());
        assert_eq!(err.to_string(), "Failed to decode element: missing id");
    }
}
