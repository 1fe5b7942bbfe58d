// ABOUTME: Utility functions shared across the extractor
// ABOUTME: Provides retry with backoff and connection-string parsing/redaction

use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;

/// Keys whose values are secrets in ADO.NET-style connection strings.
const SECRET_KEYS: &[&str] = &["password", "pwd"];

/// Run `operation` up to `max_retries + 1` times, doubling the pause after
/// each failure. `what` names the operation in the retry log.
///
/// ```no_run
/// # use std::time::Duration;
/// # use incremental_extractor::utils::retry_with_backoff;
/// # async fn example() -> anyhow::Result<()> {
/// let rows = retry_with_backoff("count rows", || async { Ok(42u64) }, 3, Duration::from_secs(1)).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    what: &str,
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {:#}",
                    what,
                    attempt,
                    max_retries + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Split an ADO.NET-style `Key=Value;Key=Value` string into a map.
///
/// Keys are lower-cased and trimmed; values are trimmed. Segments without
/// `=` are ignored.
pub fn parse_connection_pairs(connection_string: &str) -> HashMap<String, String> {
    connection_string
        .split(';')
        .filter_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return None;
            }
            Some((key, value.trim().to_string()))
        })
        .collect()
}

/// Replace secret values in a connection string with `***`.
///
/// Safe to pass to logs. Segment order and non-secret values are preserved.
pub fn redact_connection_string(connection_string: &str) -> String {
    connection_string
        .split(';')
        .map(|segment| match segment.split_once('=') {
            Some((key, _)) if SECRET_KEYS.contains(&key.trim().to_lowercase().as_str()) => {
                format!("{}=***", key)
            }
            _ => segment.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}
