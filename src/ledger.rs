// ABOUTME: Export ledger - per-table last successful export and the last run's outcome
// ABOUTME: Persisted as pretty JSON so an operator can inspect it directly

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use crate::exporter::ExportKind;

/// Export progress for a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableExportState {
    pub table: String,
    /// Instant captured just before the table's query ran on the last
    /// fully handed-off export. Rows changed after it are read next time.
    pub last_export_at: DateTime<Utc>,
    pub last_row_count: u64,
    pub last_kind: ExportKind,
}

/// Summary of the most recent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub tables_processed: usize,
    pub tables_failed: Vec<String>,
    pub rows_exported: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportLedger {
    /// Keyed by lower-cased table identifier.
    pub tables: HashMap<String, TableExportState>,
    pub last_run: Option<RunRecord>,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for ExportLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn key(table: &str) -> String {
    table.trim().to_lowercase()
}

impl ExportLedger {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            last_run: None,
            version: 1,
            updated_at: Utc::now(),
        }
    }

    pub fn get_table(&self, table: &str) -> Option<&TableExportState> {
        self.tables.get(&key(table))
    }

    pub fn last_export_at(&self, table: &str) -> Option<DateTime<Utc>> {
        self.get_table(table).map(|t| t.last_export_at)
    }

    /// Advance a table after all its artifacts were handed off.
    ///
    /// Never moves `last_export_at` backwards; a replayed older window only
    /// refreshes the row count and kind.
    pub fn record_export(&mut self, table: &str, started_at: DateTime<Utc>, rows: u64, kind: ExportKind) {
        let entry = self
            .tables
            .entry(key(table))
            .or_insert_with(|| TableExportState {
                table: table.to_string(),
                last_export_at: started_at,
                last_row_count: rows,
                last_kind: kind,
            });
        if started_at > entry.last_export_at {
            entry.last_export_at = started_at;
        }
        entry.last_row_count = rows;
        entry.last_kind = kind;
        self.updated_at = Utc::now();
    }

    pub fn record_run(&mut self, run: RunRecord) {
        self.last_run = Some(run);
        self.updated_at = Utc::now();
    }

    /// Load state from a JSON file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read export ledger from {:?}", path))?;
        let ledger: ExportLedger = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse export ledger from {:?}", path))?;
        Ok(ledger)
    }

    /// Load the ledger, starting fresh when it is missing or unreadable.
    pub async fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::new();
        }
        match Self::load(path).await {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::warn!("Starting with an empty export ledger: {:#}", e);
                Self::new()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }

        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize export ledger")?;
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write export ledger to {:?}", path))?;
        Ok(())
    }
}
