// ABOUTME: Source database abstraction consumed by detection, tracking, and export
// ABOUTME: Defines the connection/cursor traits and the driver-backed connect entry point

#[cfg(feature = "oracle")]
pub mod oracle_client;
#[cfg(feature = "mssql")]
pub mod sqlserver;

#[cfg(test)]
pub(crate) mod fake;

use crate::dialect::{BoundQuery, Dialect};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Declared-type fragments marking columns whose payload is never written as text.
const BINARY_TYPE_MARKERS: &[&str] = &["BINARY", "BLOB", "IMAGE", "RAW"];

/// Name and declared type of a result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }

    /// True for binary/blob/image-family declared types.
    pub fn is_binary(&self) -> bool {
        let upper = self.type_name.to_uppercase();
        BINARY_TYPE_MARKERS.iter().any(|marker| upper.contains(marker))
    }
}

/// One result row, as text. `None` is SQL NULL.
pub type TextRow = Vec<Option<String>>;

/// Forward-only cursor over a query result.
#[async_trait]
pub trait RowCursor: Send {
    /// Result columns, in select-list order.
    fn columns(&self) -> &[ColumnMeta];

    /// Next row, or `None` once the result is exhausted.
    async fn next_row(&mut self) -> Result<Option<TextRow>>;
}

/// A live connection to the source database.
///
/// One connection serves catalog lookups, change-tracking probes, and the
/// extraction query of a run; calls are strictly sequential.
#[async_trait]
pub trait SourceConnection: Send {
    fn dialect(&self) -> Dialect;

    /// Execute `query` and return a cursor over its rows.
    async fn open_cursor<'a>(&'a mut self, query: &BoundQuery) -> Result<Box<dyn RowCursor + 'a>>;

    /// First column of the first row as an integer. `Ok(None)` for no row or NULL.
    async fn query_scalar(&mut self, query: &BoundQuery) -> Result<Option<i64>>;

    /// Fully materialise a (small) result, e.g. a catalog lookup.
    async fn query_rows(&mut self, query: &BoundQuery) -> Result<Vec<TextRow>> {
        let mut cursor = self.open_cursor(query).await?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Open a connection for `dialect`, retrying with exponential backoff.
pub async fn connect(
    dialect: Dialect,
    connection_string: &str,
    max_retries: u32,
) -> Result<Box<dyn SourceConnection>> {
    tracing::info!(
        "Connecting to {} source: {}",
        dialect,
        crate::utils::redact_connection_string(connection_string)
    );

    crate::utils::retry_with_backoff(
        "Source connection",
        || open(dialect, connection_string),
        max_retries,
        Duration::from_secs(2),
    )
    .await
    .with_context(|| format!("Failed to connect to {} source", dialect))
}

async fn open(dialect: Dialect, connection_string: &str) -> Result<Box<dyn SourceConnection>> {
    match dialect {
        Dialect::SqlServer => open_sqlserver(connection_string).await,
        Dialect::Oracle => open_oracle(connection_string).await,
    }
}

#[cfg(feature = "mssql")]
async fn open_sqlserver(connection_string: &str) -> Result<Box<dyn SourceConnection>> {
    let conn = sqlserver::SqlServerConnection::connect(connection_string).await?;
    Ok(Box::new(conn))
}

#[cfg(not(feature = "mssql"))]
async fn open_sqlserver(_connection_string: &str) -> Result<Box<dyn SourceConnection>> {
    anyhow::bail!(
        "SQL Server support was not compiled in. Rebuild with `--features mssql`."
    )
}

#[cfg(feature = "oracle")]
async fn open_oracle(connection_string: &str) -> Result<Box<dyn SourceConnection>> {
    let conn = oracle_client::OracleConnection::connect(connection_string).await?;
    Ok(Box::new(conn))
}

#[cfg(not(feature = "oracle"))]
async fn open_oracle(_connection_string: &str) -> Result<Box<dyn SourceConnection>> {
    anyhow::bail!("Oracle support was not compiled in. Rebuild with `--features oracle`.")
}
