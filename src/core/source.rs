//! Source naming for butterfly-export
//!
//! Derives default output locations from the input extract's file name.

use std::path::{Path, PathBuf};

use crate::core::framer::Encoding;
use crate::core::router::Destination;

/// Base name of an extract with every extension stripped
///
/// `maps/belgium.osm` and `belgium.osm.xml` both become `belgium`.
pub fn source_stem(source: &Path) -> String {
    source
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.split('.').next())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("export")
        .to_string()
}

/// Generates the default output path for a source
///
/// Single-file exports land next to the working directory as
/// `<stem>.jsonl` or `<stem>.json`; directory exports as `<stem>-export/`.
pub fn resolve_output_path(source: &Path, encoding: Encoding, directory: bool) -> PathBuf {
    let stem = source_stem(source);
    if directory {
        PathBuf::from(format!("{stem}-export"))
    } else {
        PathBuf::from(format!("{stem}.{}", encoding.extension()))
    }
}

/// Default destination for a source
pub fn resolve_destination(source: &Path, encoding: Encoding, directory: bool) -> Destination {
    let path = resolve_output_path(source, encoding, directory);
    if directory {
        Destination::Directory(path)
    } else {
        Destination::File(path)
    }
}
