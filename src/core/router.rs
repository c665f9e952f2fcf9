//! Collection routing and destination sinks
//!
//! Every routed record reaches the merged sink. Records whose collection has
//! an open sink reach that sink as well. Sinks are owned here exclusively and
//! each is closed exactly once, with its own closing frame.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use log::{debug, info, trace, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::core::element::{ElementType, Record};
use crate::core::error::{suggest_collection, Error, Result};
use crate::core::framer::{Encoding, Framer};
use crate::core::options::OverwriteBehavior;

/// Name of the merged collection file in directory layouts
pub const MERGED_COLLECTION: &str = "all";

/// Any byte sink a collection can be written to
pub type SinkWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Map element-type names onto their default collection
///
/// `point`, `node` and `nodes` all become `points`, `way` becomes `ways` and
/// `relation` becomes `relations`. Anything else is returned trimmed.
pub fn normalize_collection(name: &str) -> String {
    let name = name.trim();
    match name {
        "nodes" => ElementType::Point.default_collection().to_string(),
        other => match other.parse::<ElementType>() {
            Ok(kind) => kind.default_collection().to_string(),
            Err(_) => other.to_string(),
        },
    }
}

/// The registered collections: the three defaults plus custom names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSet {
    names: BTreeSet<String>,
}

impl Default for CollectionSet {
    fn default() -> Self {
        Self {
            names: ElementType::ALL
                .iter()
                .map(|kind| kind.default_collection().to_string())
                .collect(),
        }
    }
}

impl CollectionSet {
    /// Build the set from custom collection names
    pub fn with_custom<I, S>(custom: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for name in custom {
            set.insert(name.as_ref())?;
        }
        Ok(set)
    }

    /// Register one more collection; names end up as file names, so they are checked
    pub fn insert(&mut self, name: &str) -> Result<()> {
        let name = normalize_collection(name);
        if name.is_empty() {
            return Err(Error::InvalidInput("collection name cannot be empty".to_string()));
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::InvalidInput(format!(
                "collection name '{name}' cannot contain path separators"
            )));
        }
        if name == MERGED_COLLECTION {
            return Err(Error::InvalidInput(format!(
                "collection name '{MERGED_COLLECTION}' is reserved for the merged output"
            )));
        }
        self.names.insert(name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Where exported collections are written
#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    /// Merged stream only, to a single file
    File(PathBuf),
    /// `all.<ext>` plus one file per registered collection
    Directory(PathBuf),
    /// Merged stream only, to stdout
    Stdout,
}

impl Destination {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Destination::File(path) | Destination::Directory(path) => Some(path),
            Destination::Stdout => None,
        }
    }
}

/// Check if destination file exists and handle overwrite behavior
async fn check_overwrite_permission(path: &Path, behavior: &OverwriteBehavior) -> Result<()> {
    if !tokio::fs::try_exists(path).await? {
        return Ok(());
    }

    match behavior {
        OverwriteBehavior::Force => {
            warn!("Overwriting existing file: {}", path.display());
            Ok(())
        }
        OverwriteBehavior::NeverOverwrite => Err(Error::IoError(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!(
                "File already exists: {} (use --force to overwrite)",
                path.display()
            ),
        ))),
        OverwriteBehavior::Prompt => {
            eprintln!("⚠️  File already exists: {}", path.display());
            eprint!("Overwrite? [y/N]: ");

            use std::io::Write;
            std::io::stderr().flush()?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            match input.trim().to_lowercase().as_str() {
                "y" | "yes" => Ok(()),
                _ => Err(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "Export cancelled by user",
                ))),
            }
        }
    }
}

/// Refuse targets that are directories, then apply the overwrite policy
async fn check_target(collection: &str, path: &Path, behavior: &OverwriteBehavior) -> Result<()> {
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        if metadata.is_dir() {
            return Err(Error::Sink {
                collection: collection.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("{} is a directory", path.display()),
                ),
            });
        }
    }
    check_overwrite_permission(path, behavior).await
}

/// Final state of one sink
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSummary {
    pub collection: String,
    pub path: Option<PathBuf>,
    pub records: u64,
    pub bytes_written: u64,
}

/// One destination with its own framing state
pub struct FramedSink {
    collection: String,
    path: Option<PathBuf>,
    writer: BufWriter<SinkWriter>,
    framer: Framer,
    records: u64,
    bytes_written: u64,
}

impl FramedSink {
    pub fn new(collection: impl Into<String>, writer: SinkWriter, encoding: Encoding, buffer_size: usize) -> Self {
        Self {
            collection: collection.into(),
            path: None,
            writer: BufWriter::with_capacity(buffer_size, writer),
            framer: Framer::new(encoding),
            records: 0,
            bytes_written: 0,
        }
    }

    /// Create (or truncate) a file sink at `path`
    pub async fn create(
        collection: impl Into<String>,
        path: &Path,
        encoding: Encoding,
        buffer_size: usize,
        overwrite: &OverwriteBehavior,
    ) -> Result<Self> {
        let collection = collection.into();
        check_target(&collection, path, overwrite).await?;
        Self::open_file(collection, path, encoding, buffer_size).await
    }

    /// Create (or truncate) `path` without any overwrite check
    async fn open_file(collection: impl Into<String>, path: &Path, encoding: Encoding, buffer_size: usize) -> Result<Self> {
        let collection = collection.into();
        let file = tokio::fs::File::create(path).await.map_err(|source| Error::Sink {
            collection: collection.clone(),
            source,
        })?;
        info!("Writing collection '{}' to {}", collection, path.display());

        let mut sink = Self::new(collection, Box::new(file), encoding, buffer_size);
        sink.path = Some(path.to_path_buf());
        Ok(sink)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn sink_error(&self, source: std::io::Error) -> Error {
        Error::Sink {
            collection: self.collection.clone(),
            source,
        }
    }

    /// Push buffered frames to the writer without closing the document
    pub async fn flush(&mut self) -> Result<()> {
        if let Err(e) = self.writer.flush().await {
            return Err(self.sink_error(e));
        }
        Ok(())
    }

    /// Frame and write one serialized record
    pub async fn write(&mut self, record: &[u8]) -> Result<()> {
        let frame = self.framer.frame(record);
        if let Err(e) = self.writer.write_all(&frame).await {
            return Err(self.sink_error(e));
        }
        self.records += 1;
        self.bytes_written += frame.len() as u64;
        Ok(())
    }

    /// Write the closing frame, flush and close the underlying writer
    pub async fn finish(mut self) -> Result<SinkSummary> {
        let closing = self.framer.close();
        let result = async {
            self.writer.write_all(closing).await?;
            self.writer.flush().await?;
            self.writer.shutdown().await
        }
        .await;
        if let Err(e) = result {
            return Err(self.sink_error(e));
        }
        self.bytes_written += closing.len() as u64;
        debug!(
            "Closed collection '{}' ({} records, {} bytes)",
            self.collection, self.records, self.bytes_written
        );

        Ok(SinkSummary {
            collection: self.collection,
            path: self.path,
            records: self.records,
            bytes_written: self.bytes_written,
        })
    }
}

/// Final state of every sink, merged first
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterSummary {
    pub merged: Option<SinkSummary>,
    pub collections: Vec<SinkSummary>,
    /// Records whose collection has no open sink (merged output only)
    pub unrouted: u64,
}

impl RouterSummary {
    pub fn bytes_written(&self) -> u64 {
        self.merged.iter().chain(&self.collections).map(|s| s.bytes_written).sum()
    }
}

/// Maps collection names to sinks
pub struct CollectionRouter {
    collections: CollectionSet,
    merged: FramedSink,
    named: BTreeMap<String, FramedSink>,
    warned: HashSet<String>,
    unrouted: u64,
}

impl CollectionRouter {
    /// Assemble a router from already-open sinks
    pub fn new(collections: CollectionSet, merged: FramedSink, named: Vec<FramedSink>) -> Self {
        let named = named
            .into_iter()
            .map(|sink| (normalize_collection(sink.collection()), sink))
            .collect();
        Self {
            collections,
            merged,
            named,
            warned: HashSet::new(),
            unrouted: 0,
        }
    }

    /// Open the sinks a destination calls for
    pub async fn open(
        destination: &Destination,
        encoding: Encoding,
        collections: CollectionSet,
        overwrite: &OverwriteBehavior,
        buffer_size: usize,
    ) -> Result<Self> {
        match destination {
            Destination::File(path) => {
                let merged =
                    FramedSink::create(MERGED_COLLECTION, path, encoding, buffer_size, overwrite).await?;
                Ok(Self::new(collections, merged, Vec::new()))
            }
            Destination::Stdout => {
                let merged = FramedSink::new(
                    MERGED_COLLECTION,
                    Box::new(tokio::io::stdout()),
                    encoding,
                    buffer_size,
                );
                Ok(Self::new(collections, merged, Vec::new()))
            }
            Destination::Directory(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                let ext = encoding.extension();
                let targets: Vec<(String, PathBuf)> = std::iter::once(MERGED_COLLECTION)
                    .chain(collections.iter())
                    .map(|name| (name.to_string(), dir.join(format!("{name}.{ext}"))))
                    .collect();

                // Nothing is truncated until every target is cleared
                for (name, path) in &targets {
                    check_target(name, path, overwrite).await?;
                }

                let mut sinks = Vec::with_capacity(targets.len());
                for (name, path) in &targets {
                    match FramedSink::open_file(name.as_str(), path, encoding, buffer_size).await {
                        Ok(sink) => sinks.push(sink),
                        Err(e) => {
                            discard(sinks).await;
                            return Err(e);
                        }
                    }
                }
                let merged = sinks.remove(0);
                Ok(Self::new(collections, merged, sinks))
            }
        }
    }

    pub fn collections(&self) -> &CollectionSet {
        &self.collections
    }

    pub fn bytes_written(&self) -> u64 {
        self.merged.bytes_written() + self.named.values().map(FramedSink::bytes_written).sum::<u64>()
    }

    /// Write a record to the merged sink and to its collection's sink, if any
    pub async fn route(&mut self, collection: &str, record: &Record) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.merged.write(&bytes).await?;

        let name = normalize_collection(collection);
        if let Some(sink) = self.named.get_mut(&name) {
            trace!("routed record to '{name}'");
            return sink.write(&bytes).await;
        }

        self.unrouted += 1;
        if self.collections.contains(&name) {
            trace!("no sink open for '{name}', merged output only");
        } else if self.warned.insert(name.clone()) {
            match suggest_collection(&name, self.collections.iter()) {
                Some(suggestion) => warn!(
                    "Collection '{name}' is not registered (did you mean '{suggestion}'?), records go to merged output only"
                ),
                None => warn!("Collection '{name}' is not registered, records go to merged output only"),
            }
        }
        Ok(())
    }

    /// Flush every sink as it stands, without closing frames
    ///
    /// Used when an export fails: records already routed reach their
    /// destinations, but no document is completed.
    pub async fn flush(&mut self) -> Result<()> {
        let mut first_error = None;
        for sink in self.named.values_mut().chain(std::iter::once(&mut self.merged)) {
            if let Err(e) = sink.flush().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close every sink exactly once
    ///
    /// All sinks get their closing frame even if one of them fails; the first
    /// failure is returned.
    pub async fn finish(self) -> Result<RouterSummary> {
        let mut summary = RouterSummary {
            unrouted: self.unrouted,
            ..Default::default()
        };
        let mut first_error = None;

        for (_, sink) in self.named {
            match sink.finish().await {
                Ok(s) => summary.collections.push(s),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match self.merged.finish().await {
            Ok(s) => summary.merged = Some(s),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

/// Remove files created for a directory layout that could not be opened in full
async fn discard(sinks: Vec<FramedSink>) {
    for sink in sinks {
        let (collection, path) = (sink.collection.clone(), sink.path.clone());
        drop(sink);
        let Some(path) = path else { continue };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed partial output for '{collection}': {}", path.display()),
            Err(e) => warn!("Failed to remove partial output {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_normalize_collection() {
        assert_eq!(normalize_collection("point"), "points");
        assert_eq!(normalize_collection("node"), "points");
        assert_eq!(normalize_collection("nodes"), "points");
        assert_eq!(normalize_collection(" way "), "ways");
        assert_eq!(normalize_collection("relation"), "relations");
        assert_eq!(normalize_collection("relations"), "relations");
        assert_eq!(normalize_collection("stops"), "stops");
    }

    #[test]
    fn test_collection_set_validation() {
        let set = CollectionSet::with_custom(["stops", "services", "node"]).unwrap();
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec!["points", "relations", "services", "stops", "ways"]
        );

        assert!(CollectionSet::with_custom([""]).is_err());
        assert!(CollectionSet::with_custom(["../escape"]).is_err());
        assert!(CollectionSet::with_custom(["all"]).is_err());
    }

    fn read_array(path: &Path) -> Vec<Value> {
        let bytes = std::fs::read(path).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_directory_routing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("export");
        let collections = CollectionSet::with_custom(["stops"]).unwrap();

        let mut router = CollectionRouter::open(
            &Destination::Directory(out.clone()),
            Encoding::DocumentArray,
            collections,
            &OverwriteBehavior::Force,
            1024,
        )
        .await
        .unwrap();

        router.route("point", &json!({"id": 1})).await.unwrap();
        router.route("stops", &json!({"stop": 1})).await.unwrap();
        router.route("stpos", &json!({"typo": true})).await.unwrap();
        let written = router.bytes_written();
        let summary = router.finish().await.unwrap();

        assert_eq!(summary.unrouted, 1);
        // Closing frames: points, stops and merged wrote records, ways and relations did not
        assert_eq!(summary.bytes_written(), written + 3 * 3 + 2 * 4);

        assert_eq!(
            read_array(&out.join("all.json")),
            vec![json!({"id": 1}), json!({"stop": 1}), json!({"typo": true})]
        );
        assert_eq!(read_array(&out.join("points.json")), vec![json!({"id": 1})]);
        assert_eq!(read_array(&out.join("stops.json")), vec![json!({"stop": 1})]);

        // Collections that received nothing are still valid documents
        assert!(read_array(&out.join("ways.json")).is_empty());
        assert_eq!(std::fs::read(out.join("relations.json")).unwrap(), b"[\n]\n");
    }

    #[tokio::test]
    async fn test_file_destination_merged_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        let mut router = CollectionRouter::open(
            &Destination::File(path.clone()),
            Encoding::LineEncoded,
            CollectionSet::default(),
            &OverwriteBehavior::Force,
            1024,
        )
        .await
        .unwrap();
        router.route("ways", &json!({"id": 2})).await.unwrap();
        let summary = router.finish().await.unwrap();

        assert!(summary.collections.is_empty());
        assert_eq!(summary.unrouted, 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"id\":2}\n");
    }

    #[tokio::test]
    async fn test_sink_write_failure_names_collection() {
        let mock = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
            .build();
        let mut sink = FramedSink::new("stops", Box::new(mock), Encoding::LineEncoded, 1);

        let err = sink.write(b"{\"id\":1}").await.unwrap_err();
        assert!(matches!(err, Error::Sink { ref collection, .. } if collection == "stops"));
        assert!(err.to_string().contains("disk full"));
    }

    #[tokio::test]
    async fn test_never_overwrite_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        std::fs::write(&path, "keep me").unwrap();

        let result = CollectionRouter::open(
            &Destination::File(path.clone()),
            Encoding::DocumentArray,
            CollectionSet::default(),
            &OverwriteBehavior::NeverOverwrite,
            1024,
        )
        .await;

        assert!(matches!(result, Err(Error::IoError(_))));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }

    #[tokio::test]
    async fn test_directory_open_failure_keeps_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("export");
        std::fs::create_dir_all(out.join("points.json")).unwrap();
        std::fs::write(out.join("all.json"), "[{\"old\":1}]").unwrap();

        let result = CollectionRouter::open(
            &Destination::Directory(out.clone()),
            Encoding::DocumentArray,
            CollectionSet::default(),
            &OverwriteBehavior::Force,
            1024,
        )
        .await;

        assert!(matches!(result, Err(Error::Sink { ref collection, .. }) if collection == "points"));
        assert_eq!(read_array(&out.join("all.json")), vec![json!({"old": 1})]);
        assert!(!out.join("ways.json").exists());
    }

    #[tokio::test]
    async fn test_directory_no_clobber_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("export");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("relations.jsonl"), "{\"id\":1}\n").unwrap();

        let result = CollectionRouter::open(
            &Destination::Directory(out.clone()),
            Encoding::LineEncoded,
            CollectionSet::default(),
            &OverwriteBehavior::NeverOverwrite,
            1024,
        )
        .await;

        assert!(matches!(result, Err(Error::IoError(_))));
        assert!(!out.join("all.jsonl").exists());
        assert!(!out.join("points.jsonl").exists());
        assert_eq!(
            std::fs::read_to_string(out.join("relations.jsonl")).unwrap(),
            "{\"id\":1}\n"
        );
    }

    #[tokio::test]
    async fn test_flush_writes_records_without_closing_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");

        let mut router = CollectionRouter::open(
            &Destination::File(path.clone()),
            Encoding::DocumentArray,
            CollectionSet::default(),
            &OverwriteBehavior::Force,
            1 << 16,
        )
        .await
        .unwrap();
        router.route("points", &json!({"id": 1})).await.unwrap();
        assert!(std::fs::read(&path).unwrap().is_empty(), "still buffered");

        router.flush().await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[\n  {\"id\":1}");
    }
}
