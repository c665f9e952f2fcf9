//! # Butterfly-export Library
//!
//! Converts OpenStreetMap extracts into documents ready for bulk import,
//! either as newline-delimited records (the `arangoimp` format) or as a
//! single JSON array.
//!
//! ## Features
//!
//! - **Reference resolution**: ways see the points they reference, relations
//!   see their members, as rewritten by earlier hooks
//! - **Transform hooks**: per element type, sync or async, able to drop,
//!   replace or fan an element out to any number of collections
//! - **Collection routing**: one merged output plus one file per collection
//! - **Bounded memory**: elements are processed one at a time in document order
//! - **Feature flags**: optional on-disk RocksDB reference cache
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Export to belgium.jsonl in the working directory
//!     butterfly_export::export("belgium.osm", None).await?;
//!
//!     // Export to a specific file
//!     butterfly_export::export("belgium.osm", Some("./import/belgium.jsonl")).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Hooks
//!
//! ```rust,no_run
//! use butterfly_export::{Destination, ElementType, ExportOptions, Exporter, HookOutcome, Routes};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ExportOptions {
//!         destination: Destination::Directory("subway".into()),
//!         collections: vec!["stops".to_string()],
//!         ..Default::default()
//!     };
//!
//!     Exporter::new(options)
//!         .on(ElementType::Point, |point, _| {
//!             if point.tags().get("railway").map(String::as_str) != Some("stop") {
//!                 return Ok(HookOutcome::Drop);
//!             }
//!             let stop = json!({"_key": point.id().to_string(), "name": point.tags().get("name")});
//!             Ok(Routes::new().to("stops", stop).to("points", point.to_record()?).into())
//!         })
//!         .export_file("berlin.osm")
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use futures::Stream;
use log::info;

// Re-export core types that users might need
pub use crate::core::cache::{cache_key, CacheStore, MemoryStore, ReferenceCache};
#[cfg(feature = "rocksdb")]
pub use crate::core::cache::RocksStore;
pub use crate::core::element::{Common, Element, ElementType, Member, Point, Record, Relation, Way};
pub use crate::core::error::{Error, Result};
pub use crate::core::framer::{Encoding, Framer};
pub use crate::core::hooks::{ElementHook, HookOutcome, HookTable, Route, Routes};
pub use crate::core::options::{
    CacheBackend, EventCallback, Events, ExportEvent, ExportOptions, OverwriteBehavior,
};
pub use crate::core::resolver::{Related, RelationRelated, WayRelated};
pub use crate::core::router::{
    CollectionRouter, CollectionSet, Destination, FramedSink, RouterSummary, SinkSummary,
    MERGED_COLLECTION,
};
pub use crate::core::tokenizer::{OsmXmlReader, XmlInput};
pub use crate::core::{resolve_destination, resolve_output_path, ExportPipeline, ExportSummary};
pub use tokio_util::sync::CancellationToken;

// Internal modules
mod core;

use crate::core::pipeline::{log_teardown_failure, report, teardown};

/// Configured export with its hook table
///
/// Hooks are registered per element type; element types without a hook are
/// passed through unchanged to their default collection.
pub struct Exporter {
    options: ExportOptions,
    hooks: HookTable,
    cancel: CancellationToken,
}

impl Exporter {
    pub fn new(options: ExportOptions) -> Self {
        Self {
            options,
            hooks: HookTable::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register a synchronous hook for `kind`
    pub fn on<F>(mut self, kind: ElementType, hook: F) -> Self
    where
        F: FnMut(Element, Related) -> Result<HookOutcome> + Send + 'static,
    {
        self.hooks.on(kind, hook);
        self
    }

    /// Register an asynchronous hook for `kind`
    pub fn on_async<F, Fut>(mut self, kind: ElementType, hook: F) -> Self
    where
        F: FnMut(Element, Related) -> Fut + Send + 'static,
        Fut: Future<Output = Result<HookOutcome>> + Send + 'static,
    {
        self.hooks.on_async(kind, hook);
        self
    }

    pub fn hooks_mut(&mut self) -> &mut HookTable {
        &mut self.hooks
    }

    /// Token that stops the export between elements when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Export an `.osm` XML file
    pub async fn export_file<P: AsRef<Path>>(self, source: P) -> Result<ExportSummary> {
        let source = source.as_ref();
        info!("Exporting {}", source.display());
        let events = Events::new(self.options.events.clone());
        let input = match core::spawn_tokenizer(source, events.clone()).await {
            Ok(input) => input,
            Err(e) => return Err(report(&events, e)),
        };
        self.export_input(input).await
    }

    /// Export OSM XML from any reader, e.g. stdin
    pub async fn export_reader<R>(self, source: R, total_bytes: Option<u64>) -> Result<ExportSummary>
    where
        R: Read + Send + 'static,
    {
        let events = Events::new(self.options.events.clone());
        let input = core::spawn_reader_tokenizer(source, total_bytes, events);
        self.export_input(input).await
    }

    /// Export an already-decoded element stream in its order
    pub async fn export_stream<St>(self, elements: St) -> Result<ExportSummary>
    where
        St: Stream<Item = Result<Element>>,
    {
        self.run(Input {
            elements,
            total_bytes: None,
            bytes_read: None,
        })
        .await
    }

    async fn export_input(self, input: XmlInput) -> Result<ExportSummary> {
        let XmlInput {
            elements,
            total_bytes,
            bytes_read,
        } = input;
        self.run(Input {
            elements,
            total_bytes,
            bytes_read: Some(bytes_read),
        })
        .await
    }

    async fn run<St>(self, input: Input<St>) -> Result<ExportSummary>
    where
        St: Stream<Item = Result<Element>>,
    {
        let Self {
            options,
            hooks,
            cancel,
        } = self;

        let events = Events::new(options.events.clone());

        match &options.cache {
            CacheBackend::Memory(store) => {
                run_pipeline(store.clone(), hooks, &options, events, input, cancel).await
            }
            #[cfg(feature = "rocksdb")]
            CacheBackend::RocksDb(path) => {
                let store = RocksStore::open(path).map_err(|e| report(&events, e))?;
                run_pipeline(store, hooks, &options, events, input, cancel).await
            }
        }
    }
}

struct Input<St> {
    elements: St,
    total_bytes: Option<u64>,
    bytes_read: Option<Arc<AtomicU64>>,
}

/// Open every sink the options call for
async fn open_router(options: &ExportOptions) -> Result<CollectionRouter> {
    let collections = CollectionSet::with_custom(&options.collections)?;
    CollectionRouter::open(
        &options.destination,
        options.encoding,
        collections,
        &options.overwrite,
        options.buffer_size,
    )
    .await
}

async fn run_pipeline<S, St>(
    store: S,
    hooks: HookTable,
    options: &ExportOptions,
    events: Events,
    input: Input<St>,
    cancel: CancellationToken,
) -> Result<ExportSummary>
where
    S: CacheStore,
    St: Stream<Item = Result<Element>>,
{
    let cache = ReferenceCache::new(store);
    let router = match open_router(options).await {
        Ok(router) => router,
        Err(e) => {
            teardown(cache, options.retain_cache)
                .await
                .unwrap_or_else(log_teardown_failure);
            return Err(report(&events, e));
        }
    };

    let mut pipeline =
        ExportPipeline::new(cache, hooks, router, events).retain_cache(options.retain_cache);
    if let Some(bytes_read) = input.bytes_read {
        pipeline = pipeline.with_input(input.total_bytes, bytes_read);
    }
    pipeline.run(input.elements, cancel).await
}

/// Export an `.osm` file with default options
///
/// # Arguments
/// * `source` - Path to the `.osm` XML extract
/// * `dest` - Optional output file. If None, derives `<stem>.jsonl` from the source
pub async fn export(source: &str, dest: Option<&str>) -> Result<ExportSummary> {
    export_with_options(source, dest, ExportOptions::default()).await
}

/// Export with custom options
///
/// `dest`, when given, replaces a file destination's path (or a directory
/// destination's directory). When `None`, a file destination keeps
/// its path unless it is the default one, which is then derived from the source.
///
/// # Examples
/// ```rust,no_run
/// use butterfly_export::{Encoding, ExportOptions, OverwriteBehavior};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let options = ExportOptions {
///     encoding: Encoding::DocumentArray,
///     overwrite: OverwriteBehavior::Force,
///     ..Default::default()
/// };
///
/// butterfly_export::export_with_options("monaco.osm", None, options).await?;
/// # Ok(())
/// # }
/// ```
pub async fn export_with_options(
    source: &str,
    dest: Option<&str>,
    mut options: ExportOptions,
) -> Result<ExportSummary> {
    let source_path = Path::new(source);
    options.destination = match (dest, options.destination) {
        (Some(path), Destination::Directory(_)) => Destination::Directory(path.into()),
        (Some("-"), _) => Destination::Stdout,
        (Some(path), _) => Destination::File(path.into()),
        (None, destination) if destination == ExportOptions::default().destination => {
            resolve_destination(source_path, options.encoding, false)
        }
        (None, destination) => destination,
    };

    Exporter::new(options).export_file(source_path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MONACO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6">
  <node id="1" lat="43.73" lon="7.42"/>
  <node id="2" lat="43.74" lon="7.43"/>
  <way id="3"><nd ref="1"/><nd ref="2"/></way>
</osm>
"#;

    #[tokio::test]
    async fn test_export_with_options_to_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("monaco.osm");
        std::fs::File::create(&source)
            .unwrap()
            .write_all(MONACO.as_bytes())
            .unwrap();
        let dest = dir.path().join("monaco.json");

        let options = ExportOptions {
            encoding: Encoding::DocumentArray,
            overwrite: OverwriteBehavior::Force,
            ..Default::default()
        };
        let summary = export_with_options(
            source.to_str().unwrap(),
            Some(dest.to_str().unwrap()),
            options,
        )
        .await
        .unwrap();

        assert_eq!((summary.points, summary.ways), (2, 1));
        assert_eq!(summary.bytes_read, MONACO.len() as u64);

        let records: Vec<Record> = serde_json::from_slice(&std::fs::read(&dest).unwrap()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2]["nodes"], serde_json::json!([1, 2]));
    }

    #[tokio::test]
    async fn test_export_stream_rejects_reserved_collection() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExportOptions {
            destination: Destination::Directory(dir.path().join("out")),
            collections: vec!["all".to_string()],
            ..Default::default()
        };

        let result = Exporter::new(options)
            .export_stream(futures::stream::empty::<Result<Element>>())
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    fn recorder() -> (Arc<parking_lot::Mutex<Vec<ExportEvent>>>, EventCallback) {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let callback: EventCallback = Arc::new({
            let seen = seen.clone();
            move |event: &ExportEvent| seen.lock().push(event.clone())
        });
        (seen, callback)
    }

    #[tokio::test]
    async fn test_unopenable_destination_emits_error_event() {
        let dir = tempfile::tempdir().unwrap();
        let (seen, callback) = recorder();
        let store = MemoryStore::new();
        let options = ExportOptions {
            destination: Destination::File(dir.path().join("missing").join("out.jsonl")),
            cache: CacheBackend::Memory(store.clone()),
            events: Some(callback),
            ..Default::default()
        };

        let result = Exporter::new(options)
            .export_stream(futures::stream::empty::<Result<Element>>())
            .await;

        assert!(matches!(result, Err(Error::Sink { .. })));
        assert!(matches!(
            seen.lock().as_slice(),
            [ExportEvent::Error { message }] if message.contains("all")
        ));
    }

    #[tokio::test]
    async fn test_missing_source_emits_error_event() {
        let (seen, callback) = recorder();
        let options = ExportOptions {
            destination: Destination::Stdout,
            events: Some(callback),
            ..Default::default()
        };

        let result = Exporter::new(options)
            .export_file("/nonexistent/extract.osm")
            .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(matches!(seen.lock().as_slice(), [ExportEvent::Error { .. }]));
    }
}
