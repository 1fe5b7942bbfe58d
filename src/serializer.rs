// ABOUTME: Streams a query cursor into a `;`-delimited text file and seals it with a hash
// ABOUTME: Applies the binary exclusion, truncation, and quoting rules per value

use crate::artifact::{self, Artifact};
use crate::source::RowCursor;
use anyhow::{Context, Result};
use std::borrow::Cow;
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufWriter};

pub const DELIMITER: char = ';';
pub const MAX_VALUE_CHARS: usize = 5000;
pub const TRUNCATION_SUFFIX: &str = "...[TRUNCATED]";
pub const BINARY_PLACEHOLDER: &str = "[BINARY_EXCLUDED]";

const WRITE_BUFFER: usize = 256 * 1024;

/// Result of serializing one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializeOutcome {
    pub rows: u64,
    /// `None` when the query returned no rows and the file was removed.
    pub artifact: Option<Artifact>,
}

/// Quote `value` when it contains the delimiter, a quote, or a line break.
pub fn escape_field(value: &str) -> Cow<'_, str> {
    if value.contains(|c: char| c == DELIMITER || c == '"' || c == '\n' || c == '\r') {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// Render one cell.
pub fn format_value(value: Option<&str>, is_binary: bool) -> Cow<'_, str> {
    let value = match value {
        None => return Cow::Borrowed(""),
        Some(_) if is_binary => return Cow::Borrowed(BINARY_PLACEHOLDER),
        Some(value) => value,
    };

    match value.char_indices().nth(MAX_VALUE_CHARS) {
        Some((cut, _)) => {
            let truncated = format!("{}{}", &value[..cut], TRUNCATION_SUFFIX);
            Cow::Owned(escape_field(&truncated).into_owned())
        }
        None => escape_field(value),
    }
}

fn encode_line<'a, I>(fields: I) -> String
where
    I: Iterator<Item = Cow<'a, str>>,
{
    let mut line = String::new();
    for (idx, field) in fields.enumerate() {
        if idx > 0 {
            line.push(DELIMITER);
        }
        line.push_str(&field);
    }
    line.push('\n');
    line
}

async fn write_rows(cursor: &mut dyn RowCursor, path: &Path) -> Result<u64> {
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create artifact: {}", path.display()))?;
    let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);

    let columns = cursor.columns().to_vec();
    let binary: Vec<bool> = columns.iter().map(|c| c.is_binary()).collect();

    let header = encode_line(columns.iter().map(|c| escape_field(&c.name)));
    writer.write_all(header.as_bytes()).await?;

    let mut rows = 0u64;
    while let Some(row) = cursor.next_row().await? {
        let line = encode_line(
            row.iter()
                .enumerate()
                .map(|(idx, cell)| format_value(cell.as_deref(), binary.get(idx).copied().unwrap_or(false))),
        );
        writer.write_all(line.as_bytes()).await?;
        rows += 1;
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(rows)
}

/// Stream every row of `cursor` into `path`, then hash the closed file.
///
/// On error the partial file is removed. With zero rows the file is removed
/// and no artifact is returned.
pub async fn serialize_to_file(cursor: &mut dyn RowCursor, path: &Path) -> Result<SerializeOutcome> {
    let rows = match write_rows(cursor, path).await {
        Ok(rows) => rows,
        Err(e) => {
            let _ = tokio::fs::remove_file(path).await;
            return Err(e.context(format!("Failed writing {}", path.display())));
        }
    };

    if rows == 0 {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("Failed to remove empty artifact: {}", path.display()))?;
        return Ok(SerializeOutcome {
            rows,
            artifact: None,
        });
    }

    let sealed_path = path.to_path_buf();
    let artifact = tokio::task::spawn_blocking(move || artifact::seal(&sealed_path, rows))
        .await
        .context("Hashing task panicked")??;

    tracing::debug!(
        "Wrote {} rows ({} bytes) to {}",
        rows,
        artifact.bytes,
        path.display()
    );
    Ok(SerializeOutcome {
        rows,
        artifact: Some(artifact),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_value_rules() {
        assert_eq!(format_value(None, false), "");
        assert_eq!(format_value(None, true), "");
        assert_eq!(format_value(Some("\u{1}\u{2}"), true), BINARY_PLACEHOLDER);
        assert_eq!(format_value(Some("plain"), false), "plain");
        assert_eq!(format_value(Some("a;b"), false), "\"a;b\"");
        assert_eq!(format_value(Some("say \"hi\""), false), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_truncation_counts_characters() {
        let long = "ñ".repeat(MAX_VALUE_CHARS + 10);
        let formatted = format_value(Some(long.as_str()), false);
        assert!(formatted.ends_with(TRUNCATION_SUFFIX));
        assert_eq!(
            formatted.chars().count(),
            MAX_VALUE_CHARS + TRUNCATION_SUFFIX.chars().count()
        );

        let exact = "x".repeat(MAX_VALUE_CHARS);
        assert_eq!(format_value(Some(exact.as_str()), false), exact.as_str());
    }

    #[test]
    fn test_encode_line() {
        let line = encode_line(["a", "", "b;c"].iter().map(|s| escape_field(s)));
        assert_eq!(line, "a;;\"b;c\"\n");
    }
}
