// ABOUTME: Per-table export: strategy selection, streaming read, watermark advance, post-processing
// ABOUTME: Produces one ExportResult per finished artifact, or a typed ExportError

use crate::artifact::{self, Artifact};
use crate::config::{AgentConfig, PostProcessLimits, SourceClock, TableExportSpec};
use crate::detect;
use crate::dialect::{BoundQuery, TableRef};
use crate::error::ExportError;
use crate::postprocess;
use crate::serializer;
use crate::source::SourceConnection;
use crate::tracking::{self, ChangeRead, ChangeTracker, WatermarkStore};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Whether the extraction query carried a row filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Full,
    Incremental,
}

/// How the rows of a table were selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Native change tracking, reading changes after `since_position`.
    ChangeTracking { since_position: u64 },
    /// Native change tracking whose retained window no longer covers the watermark.
    ChangeTrackingResync,
    /// Configured or detected timestamp column.
    TimestampColumn { column: String, detected: bool },
    FullScan,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::ChangeTracking { since_position } => {
                write!(f, "change tracking since {}", since_position)
            }
            Strategy::ChangeTrackingResync => write!(f, "change tracking resync (full scan)"),
            Strategy::TimestampColumn { column, detected } => write!(
                f,
                "{} column {}",
                if *detected { "detected" } else { "configured" },
                column
            ),
            Strategy::FullScan => write!(f, "full scan"),
        }
    }
}

/// Outcome of one table's extraction, one per finished artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportResult {
    pub table: String,
    pub success: bool,
    /// Rows in this artifact (all rows for a zero-row or aggregate result).
    pub rows: u64,
    /// `None` when the table produced no rows.
    pub artifact: Option<Artifact>,
    pub duration: Duration,
    pub kind: ExportKind,
    pub strategy: Strategy,
    /// Captured just before the query ran.
    pub started_at: DateTime<Utc>,
    /// Timestamp basis the export read from.
    pub since: Option<DateTime<Utc>>,
    /// Only set on aggregate results.
    pub failed_tables: Vec<String>,
    pub message: String,
}

impl ExportResult {
    /// Fold many tables' results into one run-level result.
    pub fn aggregate(results: &[ExportResult], failed_tables: Vec<String>, duration: Duration) -> Self {
        let rows = results.iter().map(|r| r.rows).sum();
        let tables: std::collections::HashSet<&str> =
            results.iter().map(|r| r.table.as_str()).collect();
        let started_at = results
            .iter()
            .map(|r| r.started_at)
            .min()
            .unwrap_or_else(Utc::now);
        let kind = if results.iter().any(|r| r.kind == ExportKind::Incremental) {
            ExportKind::Incremental
        } else {
            ExportKind::Full
        };
        Self {
            table: "*".to_string(),
            success: failed_tables.is_empty(),
            rows,
            artifact: None,
            duration,
            kind,
            strategy: Strategy::FullScan,
            started_at,
            since: None,
            message: format!(
                "Exported {} table(s), {} failed",
                tables.len(),
                failed_tables.len()
            ),
            failed_tables,
        }
    }
}

/// Settings the exporter needs from the agent configuration.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub tenant_id: String,
    pub output_dir: PathBuf,
    pub command_timeout: Duration,
    pub source_clock: SourceClock,
    pub limits: PostProcessLimits,
}

impl ExportSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            tenant_id: config.tenant_id.clone(),
            output_dir: config.output_dir.clone(),
            command_timeout: config.command_timeout(),
            source_clock: config.source_clock,
            limits: config.post_process,
        }
    }
}

struct ReadPlan {
    query: BoundQuery,
    strategy: Strategy,
    /// Position to persist once the read succeeds.
    captured_position: Option<u64>,
}

/// Exports tables over one source connection, strictly one at a time.
pub struct TableExporter<'c> {
    conn: &'c mut dyn SourceConnection,
    tracker: Box<dyn ChangeTracker>,
    watermarks: WatermarkStore,
    settings: ExportSettings,
    /// File names handed out by this exporter; delivered files leave the
    /// output directory, so the directory alone cannot prove a name is free.
    issued: HashSet<String>,
}

impl<'c> TableExporter<'c> {
    pub fn new(
        conn: &'c mut dyn SourceConnection,
        watermarks: WatermarkStore,
        settings: ExportSettings,
    ) -> Self {
        let tracker = tracking::for_dialect(conn.dialect());
        Self {
            conn,
            tracker,
            watermarks,
            settings,
            issued: HashSet::new(),
        }
    }

    /// Mark `file_name` as taken, e.g. an artifact replayed from disk this run.
    pub fn reserve_file_name(&mut self, file_name: impl Into<String>) {
        self.issued.insert(file_name.into());
    }

    /// First free variant of `base`: `x.csv`, then `x_2.csv`, `x_3.csv`, ...
    fn claim_file_name(&mut self, base: String) -> String {
        let mut candidate = base.clone();
        let mut sequence = 1;
        while self.issued.iter().any(|name| artifact::derives_from(name, &candidate))
            || artifact::name_in_use(&self.settings.output_dir, &candidate)
        {
            sequence += 1;
            candidate = artifact::sequenced_name(&base, sequence);
        }
        self.issued.insert(candidate.clone());
        candidate
    }

    /// Try native change tracking. `None` means fall back to column filtering.
    async fn plan_change_tracking(&mut self, table: &TableRef) -> Option<ReadPlan> {
        match self.tracker.is_enabled(&mut *self.conn, table).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!("Change-tracking check failed for {}: {:#}", table, e);
                return None;
            }
        }

        let current = match self.tracker.current_position(&mut *self.conn, table).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                tracing::warn!("Change tracking reports no current position for {}", table);
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to read change-tracking position for {}: {:#}", table, e);
                return None;
            }
        };

        let dialect = self.conn.dialect();
        let stored = self.watermarks.load_or_zero(dialect, table).await;
        match self
            .tracker
            .build_incremental_query(&mut *self.conn, table, stored)
            .await
        {
            Ok(ChangeRead::Since(query)) => Some(ReadPlan {
                query,
                strategy: Strategy::ChangeTracking {
                    since_position: stored,
                },
                captured_position: Some(current),
            }),
            Ok(ChangeRead::WindowPurged) => Some(ReadPlan {
                query: dialect.build_full_scan_query(table),
                strategy: Strategy::ChangeTrackingResync,
                captured_position: Some(current),
            }),
            Err(e) => {
                tracing::warn!("Failed to build change query for {}: {:#}", table, e);
                None
            }
        }
    }

    async fn plan(
        &mut self,
        spec: &TableExportSpec,
        table: &TableRef,
        since: Option<DateTime<Utc>>,
    ) -> ReadPlan {
        if let Some(plan) = self.plan_change_tracking(table).await {
            return plan;
        }

        let dialect = self.conn.dialect();
        if since.is_none() {
            tracing::info!("No previous export of {}, reading the whole table", table);
            return ReadPlan {
                query: dialect.build_full_scan_query(table),
                strategy: Strategy::FullScan,
                captured_position: None,
            };
        }

        let (column, detected) = match spec
            .incremental_column
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            Some(column) => (Some(column.to_string()), false),
            None => (detect::detect_timestamp_column(&mut *self.conn, table).await, true),
        };

        let source_since = since.map(|s| self.settings.source_clock.to_source(s));
        let query = dialect.build_timestamp_query(table, column.as_deref(), source_since);
        let strategy = match column {
            Some(column) if query.is_filtered() => Strategy::TimestampColumn { column, detected },
            _ => Strategy::FullScan,
        };
        ReadPlan {
            query,
            strategy,
            captured_position: None,
        }
    }

    /// Export one table.
    ///
    /// `fallback_since` is used when the table carries no last-export
    /// timestamp. A tracked table's watermark is persisted as soon as the
    /// read succeeds, before post-processing or hand-off.
    pub async fn export_table(
        &mut self,
        spec: &TableExportSpec,
        fallback_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExportResult>, ExportError> {
        let timer = Instant::now();
        let table = spec.table_ref();
        let since = spec
            .last_export
            .map(|naive| self.settings.source_clock.from_source(naive))
            .or(fallback_since);

        let plan = self.plan(spec, &table, since).await;
        tracing::info!("Exporting {} using {}", table, plan.strategy);

        tokio::fs::create_dir_all(&self.settings.output_dir)
            .await
            .map_err(|e| {
                ExportError::partial_write(spec.name.clone(), &anyhow::Error::from(e))
            })?;
        let file_name = self.claim_file_name(artifact::artifact_file_name(
            &table.file_stem(),
            &self.settings.tenant_id,
            Local::now(),
        ));
        let path = self.settings.output_dir.join(file_name);

        let started_at = Utc::now();
        let outcome = {
            let mut cursor = match tokio::time::timeout(
                self.settings.command_timeout,
                self.conn.open_cursor(&plan.query),
            )
            .await
            {
                Ok(Ok(cursor)) => cursor,
                Ok(Err(e)) => return Err(ExportError::source_unavailable(spec.name.clone(), &e)),
                Err(_) => {
                    let e = anyhow::anyhow!(
                        "query did not start within {:?}",
                        self.settings.command_timeout
                    );
                    return Err(ExportError::source_unavailable(spec.name.clone(), &e));
                }
            };
            serializer::serialize_to_file(&mut *cursor, &path)
                .await
                .map_err(|e| ExportError::partial_write(spec.name.clone(), &e))?
        };

        if let Some(position) = plan.captured_position {
            if let Err(e) = self
                .watermarks
                .save(self.conn.dialect(), &table, position)
                .await
            {
                tracing::error!("Failed to persist watermark for {}: {:#}", table, e);
            }
        }

        let kind = if plan.query.is_filtered() {
            ExportKind::Incremental
        } else {
            ExportKind::Full
        };
        let result = |rows: u64, artifact: Option<Artifact>, message: String| ExportResult {
            table: spec.name.clone(),
            success: true,
            rows,
            artifact,
            duration: timer.elapsed(),
            kind,
            strategy: plan.strategy.clone(),
            started_at,
            since,
            failed_tables: Vec::new(),
            message,
        };

        let Some(written) = outcome.artifact else {
            tracing::info!("{}: no new rows", table);
            return Ok(vec![result(0, None, "No new rows".to_string())]);
        };

        let sealed = written.clone();
        let artifacts = match postprocess::post_process_async(written, self.settings.limits).await {
            Ok(artifacts) => artifacts,
            // The sealed file is still a valid artifact unless the transform consumed it
            Err(e) if sealed.path.exists() => {
                tracing::warn!(
                    "Post-processing {} failed, delivering it unchanged: {:#}",
                    sealed.file_name(),
                    e
                );
                vec![sealed]
            }
            Err(e) => return Err(ExportError::post_process(spec.name.clone(), &e)),
        };

        let total_bytes: u64 = artifacts.iter().map(|a| a.bytes).sum();
        tracing::info!(
            "Exported {}: {} rows, {} artifact(s), {} bytes, {:.1}s",
            table,
            outcome.rows,
            artifacts.len(),
            total_bytes,
            timer.elapsed().as_secs_f64()
        );

        Ok(artifacts
            .into_iter()
            .map(|a| {
                let message = format!("Exported {} rows to {}", a.rows, a.file_name());
                result(a.rows, Some(a), message)
            })
            .collect())
    }
}
