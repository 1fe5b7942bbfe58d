// ABOUTME: One scheduled extraction run - retry replay, per-table export, hand-off, ledger
// ABOUTME: Isolates table failures and queues downstream failures for later replay

use crate::artifact::{self, Artifact};
use crate::config::{AgentConfig, TableExportSpec};
use crate::error::ExportError;
use crate::exporter::{ExportResult, ExportSettings, TableExporter};
use crate::ledger::{ExportLedger, RunRecord};
use crate::retry_queue::{Requeue, RetryQueue, RetryQueueItem};
use crate::source::SourceConnection;
use crate::tracking::WatermarkStore;
use crate::upload::{self, Uploader};
use crate::utils::retry_with_backoff;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Statistics from one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub tables_processed: usize,
    pub tables_failed: Vec<String>,
    pub rows_exported: u64,
    pub artifacts_delivered: usize,
    pub replays_succeeded: usize,
    pub replays_failed: usize,
    pub queued_for_retry: usize,
    pub errors: Vec<String>,
    pub results: Vec<ExportResult>,
    pub duration_ms: u64,
}

impl RunSummary {
    /// Check if the run completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Run-level result carrying the failed-table list.
    pub fn aggregate(&self) -> ExportResult {
        ExportResult::aggregate(
            &self.results,
            self.tables_failed.clone(),
            Duration::from_millis(self.duration_ms),
        )
    }

    fn record_failure(&mut self, err: &ExportError) {
        if !self.tables_failed.iter().any(|t| t == err.table()) {
            self.tables_failed.push(err.table().to_string());
        }
        self.errors.push(err.to_string());
    }

    fn record_error(&mut self, message: String) {
        tracing::error!("{}", message);
        self.errors.push(message);
    }
}

/// Runs the configured tables against one source connection.
pub struct Pipeline {
    config: AgentConfig,
    uploader: Box<dyn Uploader>,
    queue: RetryQueue,
}

impl Pipeline {
    pub fn new(config: AgentConfig, uploader: Box<dyn Uploader>, queue: RetryQueue) -> Self {
        Self {
            config,
            uploader,
            queue,
        }
    }

    /// Pipeline with the queue at its configured path and the configured hand-off.
    pub fn open(config: AgentConfig) -> Result<Self> {
        let queue = RetryQueue::open(&config.retry_queue_path())?;
        let uploader: Box<dyn Uploader> = match &config.upload.outbox_dir {
            Some(dir) => Box::new(upload::OutboxUploader::new(dir.clone())),
            None => Box::new(upload::RetainLocal),
        };
        Ok(Self::new(config, uploader, queue))
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    /// Deliver every artifact of one table, then drop local copies.
    async fn hand_off(&self, table: &str, artifacts: &[Artifact]) -> Result<usize, ExportError> {
        let settings = &self.config.upload;
        let mut delivered = 0;
        for artifact in artifacts {
            let destination = upload::destination_for(&settings.destination_prefix, &artifact.path);
            retry_with_backoff(
                "Artifact hand-off",
                || self.uploader.upload(&artifact.path, &destination, &artifact.sha256),
                settings.retries,
                Duration::from_secs(settings.initial_backoff_secs),
            )
            .await
            .map_err(|e| ExportError::downstream(table.to_string(), &e))?;
            delivered += 1;
        }

        if self.uploader.moves_artifacts() && !settings.keep_local_artifacts {
            discard(artifacts);
        }
        Ok(delivered)
    }

    /// Export and hand off one table. Returns the results when every artifact was delivered.
    async fn export_and_deliver(
        &self,
        exporter: &mut TableExporter<'_>,
        spec: &TableExportSpec,
        fallback_since: Option<DateTime<Utc>>,
    ) -> Result<(Vec<ExportResult>, usize), TableFailure> {
        let results = exporter
            .export_table(spec, fallback_since)
            .await
            .map_err(|error| TableFailure {
                error,
                since: fallback_since,
                artifacts: Vec::new(),
            })?;
        let artifacts: Vec<Artifact> = results.iter().filter_map(|r| r.artifact.clone()).collect();
        match self.hand_off(&spec.name, &artifacts).await {
            Ok(delivered) => Ok((results, delivered)),
            Err(error) => Err(TableFailure {
                error,
                since: results.first().and_then(|r| r.since),
                artifacts,
            }),
        }
    }

    fn advance_ledger(ledger: &mut ExportLedger, results: &[ExportResult]) {
        if let Some(first) = results.first() {
            let rows = results.iter().map(|r| r.rows).sum();
            ledger.record_export(&first.table, first.started_at, rows, first.kind);
        }
    }

    /// Replay one due item: deliver its files if they are still intact,
    /// otherwise export the table again from the item's timestamp basis.
    async fn replay_item(
        &self,
        exporter: &mut TableExporter<'_>,
        ledger: &mut ExportLedger,
        spec: &TableExportSpec,
        item: &RetryQueueItem,
        summary: &mut RunSummary,
    ) -> Result<(), TableFailure> {
        if !item.artifacts.is_empty() {
            if all_intact(&item.artifacts).await {
                for artifact in &item.artifacts {
                    exporter.reserve_file_name(artifact.file_name());
                }
                let delivered = self
                    .hand_off(&spec.name, &item.artifacts)
                    .await
                    .map_err(|error| TableFailure {
                        error,
                        since: item.since,
                        artifacts: item.artifacts.clone(),
                    })?;
                summary.artifacts_delivered += delivered;
                return Ok(());
            }
            tracing::warn!(
                "Queued files for {} are missing or changed, exporting again",
                item.table
            );
            discard(&item.artifacts);
        }

        let (results, delivered) = self.export_and_deliver(exporter, spec, item.since).await?;
        Self::advance_ledger(ledger, &results);
        summary.artifacts_delivered += delivered;
        Ok(())
    }

    /// Replay due queue items. Queue errors are recorded in `summary` and end
    /// the replay phase without stopping the run.
    async fn replay_queue(
        &self,
        exporter: &mut TableExporter<'_>,
        ledger: &mut ExportLedger,
        summary: &mut RunSummary,
    ) {
        let now = Utc::now();
        let mut deferred = Vec::new();

        for _ in 0..self.config.upload.max_replays_per_run {
            let mut item = match self.queue.dequeue() {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    summary.record_error(format!("Retry queue unavailable: {:#}", e));
                    break;
                }
            };
            if !item.is_eligible(now) {
                deferred.push(item);
                continue;
            }

            let spec = match self.config.find_table(&item.table) {
                Some(spec) if spec.enabled => TableExportSpec {
                    last_export: None,
                    ..spec.clone()
                },
                _ => {
                    tracing::warn!(
                        "Dropping retry for {}: table is no longer configured or enabled",
                        item.table
                    );
                    discard(&item.artifacts);
                    continue;
                }
            };

            tracing::info!(
                "Replaying {} (attempt {}, failed at {})",
                item.table,
                item.retry_count + 1,
                item.failed_at
            );
            let failure = match self.replay_item(exporter, ledger, &spec, &item, summary).await {
                Ok(()) => {
                    summary.replays_succeeded += 1;
                    continue;
                }
                Err(failure) => failure,
            };

            summary.replays_failed += 1;
            item.artifacts = failure.artifacts;
            let leftovers = item.artifacts.clone();
            match self.queue.requeue(item, failure.error.message()) {
                Ok(Requeue::Requeued { next_retry_at, .. }) => tracing::warn!(
                    "Replay of {} failed, next attempt after {}: {}",
                    spec.name,
                    next_retry_at,
                    failure.error
                ),
                Ok(Requeue::Dropped { retry_count }) => {
                    tracing::error!(
                        "Replay of {} failed {} times, dropped: {}",
                        spec.name,
                        retry_count,
                        failure.error
                    );
                    discard(&leftovers);
                }
                Err(e) => summary.record_error(format!(
                    "Failed to requeue {} for retry: {:#}",
                    spec.name, e
                )),
            }
        }

        for item in deferred {
            let table = item.table.clone();
            if let Err(e) = self.queue.restore(item) {
                summary.record_error(format!("Failed to keep {} in the retry queue: {:#}", table, e));
            }
        }
    }

    /// Run one full cycle over `conn`.
    pub async fn run(&self, conn: &mut dyn SourceConnection) -> Result<RunSummary> {
        let timer = Instant::now();
        let mut summary = RunSummary::default();

        let output_dir = self.config.output_dir.clone();
        match tokio::task::spawn_blocking(move || artifact::sweep_stale(&output_dir)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(swept)) => {
                tracing::info!("Removed {} stale artifact(s) from an interrupted run", swept)
            }
            Ok(Err(e)) => summary.record_error(format!("Stale artifact sweep failed: {:#}", e)),
            Err(e) => summary.record_error(format!("Stale artifact sweep panicked: {}", e)),
        }

        let ledger_path = self.config.ledger_path();
        let mut ledger = ExportLedger::load_or_default(&ledger_path).await;
        let mut exporter = TableExporter::new(
            conn,
            WatermarkStore::new(self.config.watermark_dir()),
            ExportSettings::from_config(&self.config),
        );

        self.replay_queue(&mut exporter, &mut ledger, &mut summary).await;

        let tables = self.config.ordered_tables();
        tracing::info!("Starting run over {} table(s)", tables.len());
        for configured in &tables {
            let mut spec = configured.clone();
            if let Some(at) = ledger.last_export_at(&spec.name) {
                spec.last_export = Some(self.config.source_clock.to_source(at));
            }

            summary.tables_processed += 1;
            match self.export_and_deliver(&mut exporter, &spec, None).await {
                Ok((results, delivered)) => {
                    Self::advance_ledger(&mut ledger, &results);
                    summary.rows_exported += results.iter().map(|r| r.rows).sum::<u64>();
                    summary.artifacts_delivered += delivered;
                    summary.results.extend(results);
                }
                Err(failure) => {
                    tracing::error!("Failed to export {}: {}", spec.name, failure.error);
                    summary.record_failure(&failure.error);
                    if failure.error.is_replayable() {
                        match self.queue.enqueue_with_artifacts(
                            &spec.name,
                            failure.since,
                            failure.error.message(),
                            failure.artifacts,
                        ) {
                            Ok(()) => summary.queued_for_retry += 1,
                            Err(e) => summary.record_error(format!(
                                "Failed to queue {} for retry: {:#}",
                                spec.name, e
                            )),
                        }
                    }
                }
            }
        }

        summary.duration_ms = timer.elapsed().as_millis() as u64;
        ledger.record_run(RunRecord {
            finished_at: Utc::now(),
            success: summary.is_success(),
            error: (!summary.is_success()).then(|| summary.errors.join("; ")),
            tables_processed: summary.tables_processed,
            tables_failed: summary.tables_failed.clone(),
            rows_exported: summary.rows_exported,
            duration_ms: summary.duration_ms,
        });
        if let Err(e) = ledger.save(&ledger_path).await {
            tracing::error!("Failed to save export ledger: {:#}", e);
        }

        tracing::info!(
            "Run finished: {} table(s), {} failed, {} rows, {} artifact(s) delivered in {}ms",
            summary.tables_processed,
            summary.tables_failed.len(),
            summary.rows_exported,
            summary.artifacts_delivered,
            summary.duration_ms
        );
        Ok(summary)
    }
}

/// Why a table did not reach the downstream, with whatever it left on disk.
struct TableFailure {
    error: ExportError,
    since: Option<DateTime<Utc>>,
    artifacts: Vec<Artifact>,
}

/// Whether every file still hashes to its recorded digest.
async fn all_intact(artifacts: &[Artifact]) -> bool {
    let artifacts = artifacts.to_vec();
    tokio::task::spawn_blocking(move || {
        artifacts.iter().all(|a| {
            artifact::hash_file(&a.path)
                .map(|digest| digest == a.sha256)
                .unwrap_or(false)
        })
    })
    .await
    .unwrap_or(false)
}

fn discard(artifacts: &[Artifact]) {
    for artifact in artifacts {
        if let Err(e) = artifact::remove_with_sidecar(&artifact.path) {
            tracing::warn!("Failed to remove {}: {:#}", artifact.file_name(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Dialect, TableRef};
    use crate::source::fake::{row, text_columns, Reply, ScriptedSource};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingUploader {
        fail: bool,
        delivered: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Uploader for RecordingUploader {
        async fn upload(&self, _local: &Path, destination: &str, _sha256: &str) -> Result<()> {
            if self.fail {
                anyhow::bail!("503 Service Unavailable");
            }
            self.delivered.lock().unwrap().push(destination.to_string());
            Ok(())
        }
    }

    fn config(dir: &Path, dialect: &str, tables: &str) -> AgentConfig {
        let toml = format!(
            r#"
tenant_id = "farmacia-042"
dialect = "{dialect}"
output_dir = "{out}"
state_dir = "{state}"
source_clock = "utc"

[upload]
destination_prefix = "farmacia-042/raw"
retries = 0
initial_backoff_secs = 0

{tables}
"#,
            dialect = dialect,
            out = dir.join("out").display(),
            state = dir.join("state").display(),
            tables = tables
        );
        AgentConfig::from_toml(&toml).unwrap()
    }

    fn rows(columns: &[&str], values: &[&[Option<&str>]]) -> Reply {
        Reply::Rows {
            columns: text_columns(columns),
            rows: values.iter().map(|v| row(v)).collect(),
        }
    }

    #[tokio::test]
    async fn test_tables_run_in_priority_order_and_failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            "sqlserver",
            r#"
[[tables]]
name = "stock"
priority = 20
[[tables]]
name = "articu"
priority = 10
[[tables]]
name = "clientes"
priority = 30
"#,
        );
        let queue = RetryQueue::open(&config.retry_queue_path()).unwrap();
        let uploader = RecordingUploader::default();
        let pipeline = Pipeline::new(config.clone(), Box::new(uploader.clone()), queue);

        let mut source = ScriptedSource::new(Dialect::SqlServer)
            .on("sys.change_tracking_tables", Reply::Scalar(Some(0)))
            .on("SELECT * FROM [articu]", rows(&["id"], &[&[Some("1")]]))
            .on("SELECT * FROM [stock]", Reply::Error("deadlock victim".into()))
            .on("SELECT * FROM [clientes]", rows(&["id"], &[&[Some("9")], &[Some("10")]]));

        let summary = pipeline.run(&mut source).await.unwrap();

        let reads: Vec<&str> = source
            .executed_sql()
            .into_iter()
            .filter(|sql| sql.starts_with("SELECT * FROM"))
            .collect();
        assert_eq!(
            reads,
            vec!["SELECT * FROM [articu]", "SELECT * FROM [stock]", "SELECT * FROM [clientes]"]
        );

        assert!(!summary.is_success());
        assert_eq!(summary.tables_processed, 3);
        assert_eq!(summary.tables_failed, vec!["stock".to_string()]);
        assert_eq!(summary.rows_exported, 3);
        assert_eq!(summary.artifacts_delivered, 2);
        // Source failures are not replayable
        assert_eq!(pipeline.queue().count().unwrap(), 0);

        let delivered = uploader.delivered.lock().unwrap().clone();
        assert!(delivered.iter().all(|d| d.starts_with("farmacia-042/raw/")));

        let ledger = ExportLedger::load(&config.ledger_path()).await.unwrap();
        assert!(ledger.get_table("articu").is_some());
        assert!(ledger.get_table("clientes").is_some());
        assert!(ledger.get_table("stock").is_none());
        let run = ledger.last_run.unwrap();
        assert!(!run.success);
        assert_eq!(run.tables_failed, vec!["stock".to_string()]);

        let aggregate = summary.aggregate();
        assert_eq!(aggregate.failed_tables, vec!["stock".to_string()]);
        assert_eq!(aggregate.rows, 3);
    }

    #[tokio::test]
    async fn test_watermark_advances_even_when_upload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            "oracle",
            r#"
[[tables]]
name = "AH_VENTAS"
"#,
        );
        let table = TableRef::parse("AH_VENTAS");
        let watermarks = WatermarkStore::new(config.watermark_dir());
        watermarks.save(Dialect::Oracle, &table, 1000).await.unwrap();

        let queue = RetryQueue::open(&config.retry_queue_path()).unwrap();
        let uploader = RecordingUploader {
            fail: true,
            ..Default::default()
        };
        let pipeline = Pipeline::new(config.clone(), Box::new(uploader), queue);

        let mut source = ScriptedSource::new(Dialect::Oracle)
            .on("DBA_CAPTURE", Reply::Scalar(Some(1)))
            .on("V$DATABASE", Reply::Scalar(Some(1050)))
            .on(
                "ORA_ROWSCN >",
                rows(&["ORA_ROWSCN", "ID"], &[&[Some("1020"), Some("1")]]),
            );

        let summary = pipeline.run(&mut source).await.unwrap();

        assert_eq!(summary.tables_failed, vec!["AH_VENTAS".to_string()]);
        assert_eq!(summary.queued_for_retry, 1);
        // The captured position is kept although the hand-off failed
        assert_eq!(watermarks.load(Dialect::Oracle, &table).await, Some(1050));

        let items = pipeline.queue().items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].table, "AH_VENTAS");
        assert_eq!(items[0].retry_count, 0);
        assert!(items[0].error.contains("503"));

        let ledger = ExportLedger::load(&config.ledger_path()).await.unwrap();
        assert!(ledger.get_table("AH_VENTAS").is_none());
    }

    #[tokio::test]
    async fn test_replay_delivers_queued_export_and_drops_unknown_tables() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            "sqlserver",
            r#"
[[tables]]
name = "articu"
enabled = false
[[tables]]
name = "ventas"
"#,
        );
        let queue = RetryQueue::open(&config.retry_queue_path()).unwrap();
        queue.enqueue("ventas", None, "later").unwrap();
        let waiting = queue.dequeue().unwrap().unwrap();
        queue.enqueue("ventas", None, "timeout").unwrap();
        queue.enqueue("articu", None, "timeout").unwrap();
        queue.enqueue("borrada", None, "timeout").unwrap();
        queue.requeue(waiting, "later").unwrap();

        let uploader = RecordingUploader::default();
        let pipeline = Pipeline::new(config.clone(), Box::new(uploader.clone()), queue);

        let mut source = ScriptedSource::new(Dialect::SqlServer)
            .on("sys.change_tracking_tables", Reply::Scalar(Some(0)))
            .on("SELECT * FROM [ventas]", rows(&["id"], &[&[Some("1")]]));

        let summary = pipeline.run(&mut source).await.unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.replays_succeeded, 1);
        // One replayed delivery plus the regular run
        assert_eq!(uploader.delivered.lock().unwrap().len(), 2);

        let remaining = pipeline.queue().items().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].table, "ventas");
        assert_eq!(remaining[0].retry_count, 1);
        assert!(remaining[0].next_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_replay_is_requeued_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            "sqlserver",
            r#"
[[tables]]
name = "ventas"
enabled = true
"#,
        );
        let queue = RetryQueue::open(&config.retry_queue_path()).unwrap();
        queue.enqueue("ventas", None, "503").unwrap();

        let uploader = RecordingUploader {
            fail: true,
            ..Default::default()
        };
        let pipeline = Pipeline::new(config, Box::new(uploader), queue);
        let mut source = ScriptedSource::new(Dialect::SqlServer)
            .on("sys.change_tracking_tables", Reply::Scalar(Some(0)))
            .on("SELECT * FROM [ventas]", rows(&["id"], &[&[Some("1")]]));

        let summary = pipeline.run(&mut source).await.unwrap();
        assert_eq!(summary.replays_failed, 1);

        let items = pipeline.queue().items().unwrap();
        // The requeued replay plus the failed regular export
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].retry_count, 1);
        assert_eq!(items[1].retry_count, 0);
    }

    fn csv_files(dir: &Path) -> Vec<std::path::PathBuf> {
        let mut files: Vec<_> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().path())
                .filter(|p| p.extension().map_or(false, |e| e == "csv"))
                .collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }

    fn ventas_config(dir: &Path) -> AgentConfig {
        config(
            dir,
            "sqlserver",
            r#"
[[tables]]
name = "ventas"
"#,
        )
    }

    fn ventas_source(id: &str) -> ScriptedSource {
        ScriptedSource::new(Dialect::SqlServer)
            .on("sys.change_tracking_tables", Reply::Scalar(Some(0)))
            .on("SELECT * FROM [ventas]", rows(&["id"], &[&[Some(id)]]))
    }

    fn ventas_reads(source: &ScriptedSource) -> usize {
        source
            .executed_sql()
            .into_iter()
            .filter(|sql| *sql == "SELECT * FROM [ventas]")
            .count()
    }

    #[tokio::test]
    async fn test_replayed_and_regular_exports_of_one_table_both_reach_the_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let config = ventas_config(dir.path());
        let queue = RetryQueue::open(&config.retry_queue_path()).unwrap();
        queue.enqueue("ventas", None, "timeout").unwrap();

        let outbox = dir.path().join("outbox");
        let pipeline = Pipeline::new(
            config,
            Box::new(upload::OutboxUploader::new(outbox.clone())),
            queue,
        );
        let mut source = ventas_source("1");

        let summary = pipeline.run(&mut source).await.unwrap();

        assert!(summary.is_success(), "{:?}", summary.errors);
        assert_eq!(summary.replays_succeeded, 1);
        assert_eq!(summary.artifacts_delivered, 2);
        assert_eq!(ventas_reads(&source), 2);
        let delivered = csv_files(&outbox.join("farmacia-042").join("raw"));
        assert_eq!(delivered.len(), 2);
        for file in &delivered {
            assert!(artifact::sidecar_path(file).exists());
        }
    }

    #[tokio::test]
    async fn test_queued_files_are_delivered_on_replay_without_reading_again() {
        let dir = tempfile::tempdir().unwrap();
        let config = ventas_config(dir.path());
        let out = config.output_dir.clone();

        let failing = Pipeline::new(
            config.clone(),
            Box::new(RecordingUploader {
                fail: true,
                ..Default::default()
            }),
            RetryQueue::open(&config.retry_queue_path()).unwrap(),
        );
        let summary = failing.run(&mut ventas_source("1")).await.unwrap();
        assert_eq!(summary.queued_for_retry, 1);
        let queued = failing.queue().items().unwrap();
        assert_eq!(queued[0].artifacts.len(), 1);
        assert!(queued[0].artifacts[0].path.exists());

        let outbox = dir.path().join("outbox");
        let pipeline = Pipeline::new(
            config.clone(),
            Box::new(upload::OutboxUploader::new(outbox.clone())),
            RetryQueue::open(&config.retry_queue_path()).unwrap(),
        );
        let mut source = ventas_source("2");
        let summary = pipeline.run(&mut source).await.unwrap();

        assert!(summary.is_success(), "{:?}", summary.errors);
        assert_eq!(summary.replays_succeeded, 1);
        // Only the regular export reads the source
        assert_eq!(ventas_reads(&source), 1);
        assert_eq!(pipeline.queue().count().unwrap(), 0);
        assert!(csv_files(&out).is_empty());

        let mut contents: Vec<String> = csv_files(&outbox.join("farmacia-042").join("raw"))
            .iter()
            .map(|f| std::fs::read_to_string(f).unwrap())
            .collect();
        contents.sort();
        assert_eq!(contents, vec!["id\n1\n".to_string(), "id\n2\n".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_queued_files_are_exported_again() {
        let dir = tempfile::tempdir().unwrap();
        let config = ventas_config(dir.path());

        let failing = Pipeline::new(
            config.clone(),
            Box::new(RecordingUploader {
                fail: true,
                ..Default::default()
            }),
            RetryQueue::open(&config.retry_queue_path()).unwrap(),
        );
        failing.run(&mut ventas_source("1")).await.unwrap();
        let queued = failing.queue().items().unwrap();
        std::fs::remove_file(&queued[0].artifacts[0].path).unwrap();

        let uploader = RecordingUploader::default();
        let pipeline = Pipeline::new(
            config.clone(),
            Box::new(uploader.clone()),
            RetryQueue::open(&config.retry_queue_path()).unwrap(),
        );
        let mut source = ventas_source("1");
        let summary = pipeline.run(&mut source).await.unwrap();

        assert_eq!(summary.replays_succeeded, 1);
        assert_eq!(ventas_reads(&source), 2);
        assert_eq!(uploader.delivered.lock().unwrap().len(), 2);
        assert!(!artifact::sidecar_path(&queued[0].artifacts[0].path).exists());
    }

    #[tokio::test]
    async fn test_queue_write_failures_do_not_stop_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(
            dir.path(),
            "sqlserver",
            r#"
[[tables]]
name = "a"
priority = 1
[[tables]]
name = "b"
priority = 2
"#,
        );
        let queue = RetryQueue::open(&config.retry_queue_path()).unwrap();
        queue.enqueue("a", None, "timeout").unwrap();
        // Every later queue write fails
        std::fs::create_dir_all(config.retry_queue_path().with_extension("json.tmp")).unwrap();

        let pipeline = Pipeline::new(
            config.clone(),
            Box::new(RecordingUploader {
                fail: true,
                ..Default::default()
            }),
            queue,
        );
        let mut source = ScriptedSource::new(Dialect::SqlServer)
            .on("sys.change_tracking_tables", Reply::Scalar(Some(0)))
            .on("SELECT * FROM [a]", rows(&["id"], &[&[Some("1")]]))
            .on("SELECT * FROM [b]", rows(&["id"], &[&[Some("2")]]));

        let summary = pipeline.run(&mut source).await.unwrap();

        let reads: Vec<&str> = source
            .executed_sql()
            .into_iter()
            .filter(|sql| sql.starts_with("SELECT * FROM"))
            .collect();
        assert_eq!(reads, vec!["SELECT * FROM [a]", "SELECT * FROM [b]"]);
        assert_eq!(summary.queued_for_retry, 0);
        assert!(summary.errors.iter().any(|e| e.contains("Retry queue unavailable")));
        assert!(summary.errors.iter().any(|e| e.contains("Failed to queue b for retry")));
        // The unpersisted dequeue is undone
        assert_eq!(pipeline.queue().count().unwrap(), 1);

        let ledger = ExportLedger::load(&config.ledger_path()).await.unwrap();
        let run = ledger.last_run.unwrap();
        assert!(!run.success);
        assert_eq!(run.tables_processed, 2);
    }

    #[tokio::test]
    async fn test_failed_sweep_is_reported_and_the_run_continues() {
        let dir = tempfile::tempdir().unwrap();
        let config = ventas_config(dir.path());
        std::fs::write(&config.output_dir, b"not a directory").unwrap();

        let pipeline = Pipeline::new(
            config.clone(),
            Box::new(RecordingUploader::default()),
            RetryQueue::open(&config.retry_queue_path()).unwrap(),
        );
        let mut source = ventas_source("1");
        let summary = pipeline.run(&mut source).await.unwrap();

        assert!(summary.errors.iter().any(|e| e.contains("Stale artifact sweep failed")));
        assert_eq!(summary.tables_processed, 1);
        let ledger = ExportLedger::load(&config.ledger_path()).await.unwrap();
        assert!(!ledger.last_run.unwrap().success);
    }
}
