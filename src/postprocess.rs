// ABOUTME: Size-driven partitioning and gzip compression of finished artifacts
// ABOUTME: Never drops data: any failed transform falls back to its input file

use crate::artifact::{self, Artifact};
use crate::config::PostProcessLimits;
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const IO_BUFFER: usize = 256 * 1024;

/// Reads whole records from delimited text: a quoted value may contain
/// line breaks, so a record can span several physical lines.
struct RecordReader<R> {
    inner: R,
}

impl<R: BufRead> RecordReader<R> {
    fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next record including its trailing newline, or `None` at EOF.
    fn next_record(&mut self) -> std::io::Result<Option<String>> {
        let mut record = String::new();
        let mut in_quotes = false;
        loop {
            let start = record.len();
            let read = self.inner.read_line(&mut record)?;
            if read == 0 {
                return Ok(if record.is_empty() { None } else { Some(record) });
            }
            let quotes = record[start..].bytes().filter(|b| *b == b'"').count();
            if quotes % 2 == 1 {
                in_quotes = !in_quotes;
            }
            if !in_quotes {
                return Ok(Some(record));
            }
        }
    }
}

/// `x.csv` -> `x_part001.csv`
pub fn partition_path(path: &Path, index: usize) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = match name.strip_suffix(".csv") {
        Some(stem) => (stem.to_string(), ".csv"),
        None => (name.clone(), ""),
    };
    path.with_file_name(format!("{}_part{:03}{}", stem, index, ext))
}

/// Data lines per part: `rows × cap / bytes`, never below the configured floor.
pub fn lines_per_partition(rows: u64, bytes: u64, limits: &PostProcessLimits) -> u64 {
    if bytes == 0 {
        return limits.min_rows_per_partition.max(1);
    }
    let estimate = (rows as u128 * limits.partition_bytes as u128 / bytes as u128) as u64;
    estimate.max(limits.min_rows_per_partition).max(1)
}

fn write_partitions(source: &Artifact, lines_per: u64, parts: &mut Vec<(PathBuf, u64)>) -> Result<()> {
    let file = File::open(&source.path)
        .with_context(|| format!("Failed to open {} for partitioning", source.path.display()))?;
    let mut reader = RecordReader::new(BufReader::with_capacity(IO_BUFFER, file));
    let header = match reader.next_record()? {
        Some(header) => header,
        None => return Ok(()),
    };

    let mut current: Option<BufWriter<File>> = None;
    while let Some(record) = reader.next_record()? {
        let needs_new = match parts.last() {
            Some((_, rows)) => current.is_none() || *rows >= lines_per,
            None => true,
        };
        if needs_new {
            if let Some(mut writer) = current.take() {
                writer.flush()?;
            }
            let path = partition_path(&source.path, parts.len() + 1);
            let mut writer = BufWriter::with_capacity(
                IO_BUFFER,
                File::create(&path)
                    .with_context(|| format!("Failed to create partition {}", path.display()))?,
            );
            parts.push((path, 0));
            writer.write_all(header.as_bytes())?;
            current = Some(writer);
        }

        if let (Some(writer), Some((_, rows))) = (current.as_mut(), parts.last_mut()) {
            writer.write_all(record.as_bytes())?;
            *rows += 1;
        }
    }

    if let Some(mut writer) = current.take() {
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;
    }
    Ok(())
}

/// Split `source` into parts when it exceeds the partition cap.
///
/// The original and its sidecar are removed only after every part is
/// written and sealed. On failure partial parts are removed and the original
/// is returned untouched.
pub fn partition(source: Artifact, limits: &PostProcessLimits) -> Result<Vec<Artifact>> {
    if source.bytes <= limits.partition_bytes {
        return Ok(vec![source]);
    }

    let lines_per = lines_per_partition(source.rows, source.bytes, limits);
    if lines_per >= source.rows {
        tracing::debug!(
            "{} exceeds the partition cap but fits in one part of {} rows",
            source.path.display(),
            lines_per
        );
        return Ok(vec![source]);
    }

    let mut parts = Vec::new();
    let sealed = write_partitions(&source, lines_per, &mut parts).and_then(|()| {
        parts
            .iter()
            .map(|(path, rows)| artifact::seal(path, *rows))
            .collect::<Result<Vec<_>>>()
    });

    match sealed {
        Ok(artifacts) => {
            discard_source(&source);
            tracing::info!(
                "Partitioned {} ({} bytes, {} rows) into {} parts of up to {} rows",
                source.file_name(),
                source.bytes,
                source.rows,
                artifacts.len(),
                lines_per
            );
            Ok(artifacts)
        }
        Err(e) => {
            tracing::warn!(
                "Partitioning {} failed, keeping the unpartitioned file: {:#}",
                source.path.display(),
                e
            );
            for (path, _) in &parts {
                let _ = artifact::remove_with_sidecar(path);
            }
            Ok(vec![source])
        }
    }
}

fn gzip_file(source: &Path, target: &Path) -> Result<()> {
    let mut input = BufReader::with_capacity(
        IO_BUFFER,
        File::open(source).with_context(|| format!("Failed to open {}", source.display()))?,
    );
    let output = File::create(target)
        .with_context(|| format!("Failed to create {}", target.display()))?;
    let mut encoder = GzEncoder::new(BufWriter::with_capacity(IO_BUFFER, output), Compression::best());
    std::io::copy(&mut input, &mut encoder)?;
    let writer = encoder.finish()?;
    writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;

    let written = std::fs::metadata(target)?.len();
    if written == 0 {
        anyhow::bail!("compressed file {} is empty", target.display());
    }
    Ok(())
}

/// `x.csv` -> `x.csv.gz`
pub fn gzip_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

/// Drop a transformed file. A leftover is only logged; the next run's sweep
/// clears orphaned files.
fn discard_source(source: &Artifact) {
    if let Err(e) = artifact::remove_with_sidecar(&source.path) {
        tracing::warn!(
            "Could not remove {} after sealing its replacement: {:#}",
            source.file_name(),
            e
        );
    }
}

/// Gzip `source` when it is at or above the compression threshold.
///
/// Falls back to the uncompressed artifact on any error.
pub fn compress(source: Artifact, limits: &PostProcessLimits) -> Result<Artifact> {
    if source.bytes < limits.compress_bytes {
        return Ok(source);
    }

    let target = gzip_path(&source.path);
    let sealed = gzip_file(&source.path, &target).and_then(|()| artifact::seal(&target, source.rows));
    match sealed {
        Ok(compressed) => {
            discard_source(&source);
            tracing::info!(
                "Compressed {} from {} to {} bytes",
                source.file_name(),
                source.bytes,
                compressed.bytes
            );
            Ok(compressed)
        }
        Err(e) => {
            tracing::warn!(
                "Compressing {} failed, keeping the uncompressed file: {:#}",
                source.path.display(),
                e
            );
            let _ = artifact::remove_with_sidecar(&target);
            Ok(source)
        }
    }
}

/// Partition, then compress each resulting file. Blocking.
pub fn post_process(source: Artifact, limits: &PostProcessLimits) -> Result<Vec<Artifact>> {
    partition(source, limits)?
        .into_iter()
        .map(|part| compress(part, limits))
        .collect()
}

/// [`post_process`] on the blocking pool.
pub async fn post_process_async(source: Artifact, limits: PostProcessLimits) -> Result<Vec<Artifact>> {
    tokio::task::spawn_blocking(move || post_process(source, &limits))
        .await
        .context("Post-processing task panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_record_reader_keeps_quoted_newlines_together() {
        let data = "id;note\n1;\"two\nlines\"\n2;\"a \"\"quoted\"\"\nvalue\"\n3;plain\n";
        let mut reader = RecordReader::new(Cursor::new(data));
        let mut records = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            records.push(record);
        }
        assert_eq!(
            records,
            vec![
                "id;note\n",
                "1;\"two\nlines\"\n",
                "2;\"a \"\"quoted\"\"\nvalue\"\n",
                "3;plain\n"
            ]
        );
    }

    #[test]
    fn test_lines_per_partition() {
        let limits = PostProcessLimits {
            partition_bytes: 100,
            compress_bytes: 10,
            min_rows_per_partition: 1000,
        };
        // 1.2M rows at 1.5x the cap: two parts of 800k
        assert_eq!(lines_per_partition(1_200_000, 150, &limits), 800_000);
        assert_eq!(lines_per_partition(1500, 150, &limits), 1000);
    }

    #[test]
    fn test_partition_names() {
        let path = Path::new("/out/ventas_t_20240301_080000.csv");
        assert_eq!(
            partition_path(path, 2),
            PathBuf::from("/out/ventas_t_20240301_080000_part002.csv")
        );
        assert_eq!(gzip_path(path), PathBuf::from("/out/ventas_t_20240301_080000.csv.gz"));
    }

    #[test]
    fn test_small_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "a\n1\n").unwrap();
        let source = artifact::seal(&path, 1).unwrap();
        let out = post_process(source.clone(), &PostProcessLimits::default()).unwrap();
        assert_eq!(out, vec![source]);
    }
}
