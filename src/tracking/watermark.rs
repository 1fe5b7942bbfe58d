// ABOUTME: Per-table change-tracking positions persisted as small decimal text files
// ABOUTME: Writes go through a temp file and rename so a crash never leaves a torn value

use crate::dialect::{Dialect, TableRef};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Directory of `scn_{table}.txt` / `ctversion_{table}.txt` files.
#[derive(Debug, Clone)]
pub struct WatermarkStore {
    dir: PathBuf,
}

impl WatermarkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, dialect: Dialect, table: &TableRef) -> PathBuf {
        let prefix = match dialect {
            Dialect::Oracle => "scn",
            Dialect::SqlServer => "ctversion",
        };
        self.dir.join(format!("{}_{}.txt", prefix, table.file_stem()))
    }

    /// Stored position, or `None` when the file is missing or unreadable.
    pub async fn load(&self, dialect: Dialect, table: &TableRef) -> Option<u64> {
        let path = self.path_for(dialect, table);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("Failed to read watermark {}: {}", path.display(), e);
                return None;
            }
        };
        match content.trim().parse::<u64>() {
            Ok(position) => Some(position),
            Err(_) => {
                tracing::warn!(
                    "Ignoring unparsable watermark {}: {:?}",
                    path.display(),
                    content.trim()
                );
                None
            }
        }
    }

    /// Stored position, treating "no watermark" as 0.
    pub async fn load_or_zero(&self, dialect: Dialect, table: &TableRef) -> u64 {
        self.load(dialect, table).await.unwrap_or(0)
    }

    pub async fn save(&self, dialect: Dialect, table: &TableRef, position: u64) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create watermark directory: {}", self.dir.display()))?;

        let path = self.path_for(dialect, table);
        let tmp = path.with_extension("txt.tmp");
        tokio::fs::write(&tmp, position.to_string())
            .await
            .with_context(|| format!("Failed to write watermark: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace watermark: {}", path.display()))?;

        tracing::debug!("Watermark for {} set to {}", table, position);
        Ok(())
    }
}
