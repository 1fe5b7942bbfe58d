// ABOUTME: Hand-off of finished artifacts to the downstream transport
// ABOUTME: Outbox implementation copies files and sidecars into a delivery directory

use crate::artifact;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Delivers one artifact. Implementations must be safe to retry.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, local_path: &Path, destination: &str, sha256: &str) -> Result<()>;

    /// Whether a successful upload lets the local copy be deleted.
    fn moves_artifacts(&self) -> bool {
        true
    }
}

/// `prefix/file_name`, without a leading or doubled slash.
pub fn destination_for(prefix: &str, local_path: &Path) -> String {
    let name = local_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Artifacts stay in the output directory; hand-off always succeeds.
pub struct RetainLocal;

#[async_trait]
impl Uploader for RetainLocal {
    async fn upload(&self, local_path: &Path, _destination: &str, _sha256: &str) -> Result<()> {
        tracing::debug!("No outbox configured, keeping {}", local_path.display());
        Ok(())
    }

    fn moves_artifacts(&self) -> bool {
        false
    }
}

/// Copies artifacts (and their sidecars) under a delivery directory that a
/// separate transport drains.
pub struct OutboxUploader {
    root: PathBuf,
}

impl OutboxUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target(&self, destination: &str) -> Result<PathBuf> {
        let relative = Path::new(destination);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            bail!("Destination must be a relative path inside the outbox: {}", destination);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Uploader for OutboxUploader {
    async fn upload(&self, local_path: &Path, destination: &str, sha256: &str) -> Result<()> {
        let target = self.target(destination)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create outbox directory {:?}", parent))?;
        }

        // The sidecar is written last, so its presence marks a finished delivery
        if let Ok(recorded) = tokio::fs::read_to_string(artifact::sidecar_path(&target)).await {
            if recorded.trim() == sha256 {
                tracing::info!("{} already delivered to {}", local_path.display(), target.display());
                return Ok(());
            }
            bail!(
                "Refusing to overwrite {} with different content from {}",
                target.display(),
                local_path.display()
            );
        }

        tokio::fs::copy(local_path, &target).await.with_context(|| {
            format!("Failed to copy {} to {}", local_path.display(), target.display())
        })?;

        let copied = target.clone();
        let actual = tokio::task::spawn_blocking(move || artifact::hash_file(&copied))
            .await
            .context("Hashing task panicked")??;
        if actual != sha256 {
            let _ = tokio::fs::remove_file(&target).await;
            bail!(
                "Hash mismatch after copying {}: expected {}, got {}",
                local_path.display(),
                sha256,
                actual
            );
        }

        tokio::fs::write(artifact::sidecar_path(&target), sha256)
            .await
            .with_context(|| format!("Failed to write sidecar for {}", target.display()))?;

        tracing::info!("Delivered {} to {}", local_path.display(), target.display());
        Ok(())
    }
}
