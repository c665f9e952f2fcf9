//! Export configuration and progress events

use std::path::PathBuf;
use std::sync::Arc;

use crate::core::cache::MemoryStore;
use crate::core::element::ElementType;
use crate::core::framer::Encoding;
use crate::core::router::Destination;

/// Signals the exporter reports to CLI and progress wrappers
#[derive(Debug, Clone, PartialEq)]
pub enum ExportEvent {
    /// Export started; total input size when known
    Start { total_bytes: Option<u64> },
    /// Input consumed so far; `total` is 0 when the size is unknown
    BytesRead { bytes: u64, total: u64 },
    /// A registered hook is about to run for an element
    HookInvoked { kind: ElementType, id: i64 },
    /// Every sink is closed and the cache torn down
    End { bytes_read: u64, bytes_written: u64 },
    /// The export aborted
    Error { message: String },
}

/// Event callback function type
pub type EventCallback = Arc<dyn Fn(&ExportEvent) + Send + Sync>;

/// Optional callback wrapper so call sites need not check for a listener
#[derive(Clone, Default)]
pub struct Events(Option<EventCallback>);

impl Events {
    pub fn new(callback: Option<EventCallback>) -> Self {
        Self(callback)
    }

    pub fn emit(&self, event: ExportEvent) {
        if let Some(callback) = &self.0 {
            callback(&event);
        }
    }
}

/// Overwrite behavior for existing output files
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OverwriteBehavior {
    /// Prompt user for confirmation (default)
    #[default]
    Prompt,
    /// Force overwrite without prompting
    Force,
    /// Never overwrite, fail if file exists
    NeverOverwrite,
}

/// Backing store for the reference cache
#[derive(Debug, Clone)]
pub enum CacheBackend {
    /// In-process map; pass a handle you keep a clone of to inspect it afterwards
    Memory(MemoryStore),
    /// On-disk RocksDB store at the given directory
    #[cfg(feature = "rocksdb")]
    RocksDb(PathBuf),
}

impl Default for CacheBackend {
    fn default() -> Self {
        CacheBackend::Memory(MemoryStore::new())
    }
}

/// Options for export operations
#[derive(Clone)]
pub struct ExportOptions {
    /// Output encoding for every sink
    pub encoding: Encoding,

    /// Where collections are written
    pub destination: Destination,

    /// Custom collections in addition to points, ways and relations
    pub collections: Vec<String>,

    /// Keep the reference cache after the export instead of destroying it
    pub retain_cache: bool,

    /// Reference cache backend
    pub cache: CacheBackend,

    /// Behavior when an output file already exists
    pub overwrite: OverwriteBehavior,

    /// Optional event callback
    pub events: Option<EventCallback>,

    /// Write buffer size per sink
    pub buffer_size: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            destination: Destination::File(PathBuf::from("export.jsonl")),
            collections: Vec::new(),
            retain_cache: false,
            cache: CacheBackend::default(),
            overwrite: OverwriteBehavior::default(),
            events: None,
            buffer_size: 64 * 1024, // 64KB
        }
    }
}
