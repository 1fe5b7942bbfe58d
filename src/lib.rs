// ABOUTME: Library root for incremental-extractor
// ABOUTME: Exports the extraction pipeline modules used by the CLI and tests

pub mod artifact;
pub mod config;
pub mod detect;
pub mod dialect;
pub mod error;
pub mod exporter;
pub mod ledger;
pub mod pipeline;
pub mod postprocess;
pub mod retry_queue;
pub mod serializer;
pub mod source;
pub mod tracking;
pub mod upload;
pub mod utils;

pub use config::{AgentConfig, TableExportSpec};
pub use dialect::{Dialect, TableRef};
pub use error::ExportError;
pub use exporter::{ExportKind, ExportResult, TableExporter};
pub use pipeline::{Pipeline, RunSummary};
pub use retry_queue::{RetryQueue, RetryQueueItem};
