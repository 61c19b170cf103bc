//! mindtouch-zim: turn a MindTouch-hosted library (e.g. LibreTexts) into an offline ZIM archive.
//!
//! Stages: [mindtouch] discovers and fetches pages, [rewrite] normalizes their markup,
//! [assets] fetches and deduplicates referenced files, [archive] writes the container,
//! and [pipeline] runs them in order.

pub mod archive;
pub mod assets;
pub mod cli;
pub mod config;
pub mod mindtouch;
pub mod model;
pub mod pipeline;
pub mod rewrite;

// Re-exports for CLI and consumers.
pub use archive::{assemble, ArchiveError, ArchiveSink, MemorySink, ZipContainer};
pub use assets::{AssetPipeline, DedupStore, HashAlgorithm};
pub use config::{Config, ConfigError, RunConfig};
pub use mindtouch::{discover, Library, PoliteClient, PoliteClientBuilder};
pub use model::{LibraryManifest, Page, PageContent, PageTree};
pub use pipeline::{Pipeline, PipelineError, RunReport, RunState};
pub use rewrite::Rewriter;
