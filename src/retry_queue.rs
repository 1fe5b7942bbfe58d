// ABOUTME: Durable FIFO of exports whose hand-off failed after a valid artifact existed
// ABOUTME: Capped retries with 2^n-minute backoff, persisted as a JSON list on every mutation

use crate::artifact::Artifact;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Attempts after which an item is dropped for good.
pub const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryQueueItem {
    pub table: String,
    /// Timestamp basis the failed export was reading from.
    pub since: Option<DateTime<Utc>>,
    pub failed_at: DateTime<Utc>,
    pub error: String,
    pub retry_count: u32,
    /// Earliest time the item may be replayed. `None` means immediately.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Sealed files left on disk by the failed hand-off, delivered as-is on replay.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl RetryQueueItem {
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// What `requeue` did with an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requeue {
    Requeued { retry_count: u32, next_retry_at: DateTime<Utc> },
    Dropped { retry_count: u32 },
}

/// Backoff after the `retry_count`-th failure.
pub fn backoff_for(retry_count: u32) -> Duration {
    Duration::minutes(1i64 << retry_count.min(20))
}

pub struct RetryQueue {
    path: PathBuf,
    items: Mutex<VecDeque<RetryQueueItem>>,
}

impl RetryQueue {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_at(path, Utc::now())
    }

    /// Every persisted item, including those still inside their backoff window.
    pub fn read_all(path: &Path) -> Result<Vec<RetryQueueItem>> {
        match std::fs::read_to_string(path) {
            Ok(content) if content.trim().is_empty() => Ok(Vec::new()),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(items) => Ok(items),
                Err(e) => {
                    tracing::warn!(
                        "Retry queue {} is unreadable, starting empty: {}",
                        path.display(),
                        e
                    );
                    Ok(Vec::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read retry queue: {}", path.display())),
        }
    }

    /// Load the queue as of `now`.
    ///
    /// Only items that are already eligible survive the reload; items still
    /// inside their backoff window are discarded and the loss is logged.
    pub fn open_at(path: &Path, now: DateTime<Utc>) -> Result<Self> {
        let loaded = Self::read_all(path)?;

        let total = loaded.len();
        let items: VecDeque<RetryQueueItem> =
            loaded.into_iter().filter(|item| item.is_eligible(now)).collect();
        if items.len() < total {
            // TODO: keep not-yet-eligible items once product owners confirm replay semantics
            tracing::warn!(
                "Discarded {} retry item(s) still inside their backoff window while reloading {}",
                total - items.len(),
                path.display()
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            items: Mutex::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, VecDeque<RetryQueueItem>>> {
        self.items
            .lock()
            .map_err(|_| anyhow!("retry queue lock poisoned"))
    }

    fn persist(&self, items: &VecDeque<RetryQueueItem>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let list: Vec<&RetryQueueItem> = items.iter().collect();
        let contents = serde_json::to_string_pretty(&list).context("Failed to serialize retry queue")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)
            .with_context(|| format!("Failed to write retry queue: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace retry queue: {}", self.path.display()))?;
        Ok(())
    }

    pub fn enqueue(&self, table: &str, since: Option<DateTime<Utc>>, error: &str) -> Result<()> {
        self.enqueue_with_artifacts(table, since, error, Vec::new())
    }

    /// Queue a failed hand-off together with the sealed files it left behind.
    pub fn enqueue_with_artifacts(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
        error: &str,
        artifacts: Vec<Artifact>,
    ) -> Result<()> {
        let mut items = self.lock()?;
        items.push_back(RetryQueueItem {
            table: table.to_string(),
            since,
            failed_at: Utc::now(),
            error: error.to_string(),
            retry_count: 0,
            next_retry_at: None,
            artifacts,
        });
        if let Err(e) = self.persist(&items) {
            items.pop_back();
            return Err(e);
        }
        tracing::info!("Queued {} for retry ({} pending)", table, items.len());
        Ok(())
    }

    pub fn dequeue(&self) -> Result<Option<RetryQueueItem>> {
        let mut items = self.lock()?;
        let Some(item) = items.pop_front() else {
            return Ok(None);
        };
        if let Err(e) = self.persist(&items) {
            items.push_front(item);
            return Err(e);
        }
        Ok(Some(item))
    }

    pub fn requeue(&self, item: RetryQueueItem, error: &str) -> Result<Requeue> {
        self.requeue_at(item, error, Utc::now())
    }

    /// Record another failed attempt for `item` at `now`.
    pub fn requeue_at(&self, mut item: RetryQueueItem, error: &str, now: DateTime<Utc>) -> Result<Requeue> {
        item.retry_count += 1;
        item.failed_at = now;
        item.error = error.to_string();

        if item.retry_count >= MAX_RETRIES {
            tracing::error!(
                "Giving up on {} after {} retries: {}",
                item.table,
                item.retry_count,
                error
            );
            return Ok(Requeue::Dropped {
                retry_count: item.retry_count,
            });
        }

        let next_retry_at = now + backoff_for(item.retry_count);
        item.next_retry_at = Some(next_retry_at);
        let retry_count = item.retry_count;

        let mut items = self.lock()?;
        items.push_back(item);
        self.persist(&items)?;
        Ok(Requeue::Requeued {
            retry_count,
            next_retry_at,
        })
    }

    /// Put an item back unchanged, e.g. one that was not yet eligible.
    pub fn restore(&self, item: RetryQueueItem) -> Result<()> {
        let mut items = self.lock()?;
        items.push_back(item);
        self.persist(&items)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Snapshot of pending items, head first.
    pub fn items(&self) -> Result<Vec<RetryQueueItem>> {
        Ok(self.lock()?.iter().cloned().collect())
    }
}
