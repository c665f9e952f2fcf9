//! # Butterfly-export CLI
//!
//! Command-line interface for the butterfly-export library.
//! Converts OpenStreetMap XML extracts into bulk-import documents.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use butterfly_export::{
    resolve_destination, CacheBackend, Destination, Encoding, ExportOptions, ExportSummary, Exporter,
    OverwriteBehavior,
};
use clap::Parser;
use log::{error, LevelFilter};

mod cli;

/// Command-line interface for butterfly-export
#[derive(Parser, Debug)]
#[command(name = "butterfly-export")]
#[command(about = "Export OpenStreetMap XML extracts for bulk import")]
#[command(long_about = "Converts .osm files into documents for bulk import into a document store:
  butterfly-export berlin.osm                   # Write berlin.jsonl (one record per line)
  butterfly-export berlin.osm -m json          # Write berlin.json (a single JSON array)
  butterfly-export berlin.osm --split          # Write berlin-export/{all,points,ways,relations}.jsonl
  butterfly-export berlin.osm -c stops out/    # Also register a 'stops' collection
  butterfly-export - - < berlin.osm            # Stream stdin to stdout

File Overwrite Behavior:
  By default, you'll be prompted if a destination file exists
  --force                          # Overwrite without asking
  --no-clobber                     # Never overwrite, fail if file exists")]
#[command(version = env!("BUTTERFLY_VERSION"))]
struct Cli {
    /// Source .osm XML file, or "-" for stdin
    source: String,

    /// Output file (or directory with --split/--collection), or "-" for stdout
    #[arg(default_value = "")]
    output: String,

    /// Export mode
    #[arg(short, long, value_enum, default_value_t = Encoding::LineEncoded)]
    mode: Encoding,

    /// Register a custom collection; implies directory output
    #[arg(short = 'c', long = "collection", value_name = "NAME")]
    collections: Vec<String>,

    /// Write one file per collection next to the merged output
    #[arg(long)]
    split: bool,

    /// Keep the reference cache after the export
    #[arg(long)]
    keep_cache: bool,

    /// Keep the reference cache on disk in this directory (requires the rocksdb feature)
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,

    /// Enable dry-run mode (show what would be exported without exporting)
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Force overwrite existing files without prompting
    #[arg(short, long)]
    force: bool,

    /// Never overwrite existing files (fail if destination exists)
    #[arg(long)]
    no_clobber: bool,
}

impl Cli {
    fn directory_output(&self) -> bool {
        self.split || !self.collections.is_empty()
    }

    fn overwrite(&self) -> OverwriteBehavior {
        if self.force {
            OverwriteBehavior::Force
        } else if self.no_clobber {
            OverwriteBehavior::NeverOverwrite
        } else {
            OverwriteBehavior::Prompt
        }
    }
}

/// Resolve output destination from CLI arguments
fn resolve_output(source: &str, output: &str, encoding: Encoding, directory: bool) -> Destination {
    match output {
        "-" => Destination::Stdout,
        "" => {
            let source = if source == "-" { Path::new("stdin") } else { Path::new(source) };
            resolve_destination(source, encoding, directory)
        }
        path if directory => Destination::Directory(PathBuf::from(path)),
        path => Destination::File(PathBuf::from(path)),
    }
}

fn describe(destination: &Destination) -> String {
    match destination {
        Destination::File(path) => path.display().to_string(),
        Destination::Directory(path) => format!("{}/", path.display()),
        Destination::Stdout => "stdout".to_string(),
    }
}

fn cache_backend(cli: &Cli) -> anyhow::Result<CacheBackend> {
    match &cli.cache_dir {
        None => Ok(CacheBackend::default()),
        #[cfg(feature = "rocksdb")]
        Some(dir) => Ok(CacheBackend::RocksDb(dir.clone())),
        #[cfg(not(feature = "rocksdb"))]
        Some(_) => bail!("--cache-dir requires butterfly-export to be built with the 'rocksdb' feature"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging to stderr
    let mut logger = env_logger::Builder::from_default_env();
    logger.target(env_logger::Target::Stderr);
    if cli.verbose {
        logger.filter_module("butterfly_export", LevelFilter::Info);
    }
    logger.init();

    if let Err(e) = run(cli).await {
        error!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.verbose {
        eprintln!("🦋 Butterfly-export v{} starting...", env!("BUTTERFLY_VERSION"));
    }

    // Validate conflicting flags
    if cli.force && cli.no_clobber {
        bail!("--force and --no-clobber cannot be used together");
    }

    let destination = resolve_output(&cli.source, &cli.output, cli.mode, cli.directory_output());
    if destination == Destination::Stdout && cli.directory_output() {
        eprintln!("⚠️  Writing to stdout: only the merged stream is exported");
    }

    if cli.dry_run {
        eprintln!(
            "🔍 [DRY RUN] Would export: {} as {} to {}",
            cli.source,
            cli.mode,
            describe(&destination)
        );
        if !cli.collections.is_empty() {
            eprintln!("🔍 [DRY RUN] Custom collections: {}", cli.collections.join(", "));
        }
        return Ok(());
    }

    let show_progress = !cli.no_progress && destination != Destination::Stdout;
    if show_progress || cli.verbose {
        eprintln!("📁 Saving to: {}", describe(&destination));
    }

    let progress = show_progress
        .then(|| cli::ProgressManager::new(0, &format!("🗺️  Exporting {} ({})", cli.source, cli.mode)));

    let options = ExportOptions {
        encoding: cli.mode,
        destination,
        collections: cli.collections.clone(),
        retain_cache: cli.keep_cache,
        cache: cache_backend(&cli)?,
        overwrite: cli.overwrite(),
        events: progress.as_ref().map(|p| p.callback()),
        ..Default::default()
    };

    let exporter = Exporter::new(options);
    let cancel = exporter.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⏹️  Interrupted, closing outputs...");
            cancel.cancel();
        }
    });

    let result = if cli.source == "-" {
        exporter.export_reader(std::io::stdin(), None).await
    } else {
        exporter.export_file(&cli.source).await
    };
    let summary = result.with_context(|| format!("exporting {}", cli.source))?;

    report(&summary);
    Ok(())
}

/// Print the run summary to stderr
fn report(summary: &ExportSummary) {
    if summary.cancelled {
        eprintln!("⏹️  Export stopped early, outputs contain everything routed so far");
    }
    eprintln!(
        "📦 Exported {} points, {} ways, {} relations as {} records ({} bytes)",
        summary.points,
        summary.ways,
        summary.relations,
        summary.total_records(),
        summary.bytes_written
    );
    for sink in &summary.sinks.collections {
        if let Some(path) = &sink.path {
            eprintln!("   {}: {} records → {}", sink.collection, sink.records, path.display());
        }
    }
    if summary.sinks.unrouted > 0 && !summary.sinks.collections.is_empty() {
        eprintln!(
            "⚠️  {} records went to the merged output only",
            summary.sinks.unrouted
        );
    }
}
