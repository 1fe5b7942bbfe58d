// ABOUTME: Artifact naming, SHA-256 content hashes, and `.sha256` sidecar files
// ABOUTME: Also sweeps partial writes left behind by interrupted runs

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const SIDECAR_EXTENSION: &str = "sha256";
const HASH_BUFFER: usize = 64 * 1024;

/// A finished file ready for hand-off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    /// Lowercase hex SHA-256 of the file's bytes.
    pub sha256: String,
    pub bytes: u64,
    /// Data rows in the file (header excluded).
    pub rows: u64,
}

impl Artifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// `{stem}_{tenant}_{YYYYMMDD_HHMMSS_mmm}.csv`
pub fn artifact_file_name(table_stem: &str, tenant_id: &str, at: DateTime<Local>) -> String {
    format!("{}_{}_{}.csv", table_stem, tenant_id, at.format("%Y%m%d_%H%M%S_%3f"))
}

/// `x.csv` -> `x_2.csv`
pub fn sequenced_name(file_name: &str, sequence: u32) -> String {
    match file_name.strip_suffix(".csv") {
        Some(stem) => format!("{}_{}.csv", stem, sequence),
        None => format!("{}_{}", file_name, sequence),
    }
}

/// Whether `name` is `file_name` or a file derived from it (sidecar, gzip,
/// or partition).
pub fn derives_from(name: &str, file_name: &str) -> bool {
    let stem = file_name.strip_suffix(".csv").unwrap_or(file_name);
    name == file_name
        || name.starts_with(&format!("{}.", file_name))
        || name.starts_with(&format!("{}_part", stem))
}

/// Whether `dir` already holds `file_name` or a file derived from it.
pub fn name_in_use(dir: &Path, file_name: &str) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    entries
        .filter_map(|entry| entry.ok())
        .any(|entry| derives_from(&entry.file_name().to_string_lossy(), file_name))
}

/// `x.csv` -> `x.csv.sha256`
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// Streaming SHA-256 of a file. Blocking; call from a blocking context.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    loop {
        let read = file
            .read(&mut buffer)
            .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash `path` and write the digest to its sidecar. Returns the digest.
pub fn write_sidecar(path: &Path) -> Result<String> {
    let digest = hash_file(path)?;
    let sidecar = sidecar_path(path);
    std::fs::write(&sidecar, &digest)
        .with_context(|| format!("Failed to write hash sidecar: {}", sidecar.display()))?;
    Ok(digest)
}

/// Digest recorded in a sidecar, trimmed.
pub fn read_sidecar(path: &Path) -> Result<String> {
    let sidecar = sidecar_path(path);
    let content = std::fs::read_to_string(&sidecar)
        .with_context(|| format!("Failed to read hash sidecar: {}", sidecar.display()))?;
    Ok(content.trim().to_string())
}

/// Build an [`Artifact`] for an existing file and write its sidecar.
pub fn seal(path: &Path, rows: u64) -> Result<Artifact> {
    let sha256 = write_sidecar(path)?;
    let bytes = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    Ok(Artifact {
        path: path.to_path_buf(),
        sha256,
        bytes,
        rows,
    })
}

/// Remove a data file and its sidecar, ignoring files that are already gone.
pub fn remove_with_sidecar(path: &Path) -> Result<()> {
    for target in [path.to_path_buf(), sidecar_path(path)] {
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", target.display()))
            }
        }
    }
    Ok(())
}

fn is_data_file(name: &str) -> bool {
    name.ends_with(".csv") || name.ends_with(".csv.gz")
}

/// Delete data files without a sidecar (interrupted writes) and sidecars
/// without a data file. Returns the number of files removed.
pub fn sweep_stale(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list output directory: {}", dir.display()))
        }
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let stale = if is_data_file(&name) {
            !sidecar_path(&path).exists()
        } else if let Some(data_name) = name.strip_suffix(".sha256") {
            is_data_file(data_name) && !path.with_file_name(data_name).exists()
        } else {
            false
        };

        if stale {
            tracing::warn!("Removing stale artifact from an interrupted run: {}", path.display());
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale artifact: {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
