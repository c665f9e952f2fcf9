//! Core library modules for butterfly-export
//!
//! Element model, reference cache and resolution, hooks, framing, routing
//! and the pipeline tying them together.

pub mod cache;
pub mod element;
pub mod error;
pub mod framer;
pub mod hooks;
pub mod options;
pub mod pipeline;
pub mod resolver;
pub mod router;
pub mod source;
pub mod tokenizer;

// Re-export main types for internal use
pub use pipeline::{ExportPipeline, ExportSummary};
pub use source::{resolve_destination, resolve_output_path};
pub use tokenizer::{spawn_reader_tokenizer, spawn_tokenizer};
