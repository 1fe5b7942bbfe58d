// ABOUTME: Failure taxonomy for a single table's export step
// ABOUTME: Lets the pipeline decide whether a failure is isolated or queued for replay

use thiserror::Error;

/// Why a table's export did not produce a usable, handed-off artifact.
///
/// Messages carry the full `anyhow` chain rendered with `{:#}` so nothing is
/// lost when the error is stored in the retry queue or the ledger.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Connection, catalog, or query execution failed before any row was read.
    #[error("source unavailable for {table}: {message}")]
    SourceUnavailable { table: String, message: String },

    /// The row stream was interrupted; the partial artifact was discarded.
    #[error("partial write for {table}: {message}")]
    PartialWrite { table: String, message: String },

    /// Compression or partitioning failed and left no usable artifact.
    #[error("post-processing failed for {table}: {message}")]
    PostProcess { table: String, message: String },

    /// A valid artifact existed but handing it off failed.
    #[error("downstream failure for {table}: {message}")]
    Downstream { table: String, message: String },
}

impl ExportError {
    pub fn source_unavailable(table: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::SourceUnavailable {
            table: table.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn partial_write(table: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::PartialWrite {
            table: table.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn post_process(table: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::PostProcess {
            table: table.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn downstream(table: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Downstream {
            table: table.into(),
            message: format!("{:#}", err),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::SourceUnavailable { table, .. }
            | Self::PartialWrite { table, .. }
            | Self::PostProcess { table, .. }
            | Self::Downstream { table, .. } => table,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::SourceUnavailable { message, .. }
            | Self::PartialWrite { message, .. }
            | Self::PostProcess { message, .. }
            | Self::Downstream { message, .. } => message,
        }
    }

    /// Only failures after a valid artifact existed go to the retry queue.
    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Downstream { .. })
    }
}
