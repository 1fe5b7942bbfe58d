// ABOUTME: Oracle SourceConnection backed by the blocking `oracle` (ODPI-C) driver
// ABOUTME: Streams rows from a blocking thread to the async side through a bounded channel

use super::{ColumnMeta, RowCursor, SourceConnection, TextRow};
use crate::dialect::{BoundQuery, Dialect, QueryParam};
use crate::utils::parse_connection_pairs;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Rows buffered between the fetch thread and the writer.
const ROW_BUFFER: usize = 1024;

pub struct OracleConnection {
    conn: Arc<::oracle::Connection>,
}

impl OracleConnection {
    /// Connect using `User Id=..;Password=..;Data Source=host:port/service`.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let pairs = parse_connection_pairs(connection_string);
        let user = pairs
            .get("user id")
            .or_else(|| pairs.get("user"))
            .or_else(|| pairs.get("uid"))
            .cloned()
            .ok_or_else(|| anyhow!("Oracle connection string has no `User Id`"))?;
        let password = pairs
            .get("password")
            .or_else(|| pairs.get("pwd"))
            .cloned()
            .unwrap_or_default();
        let data_source = pairs
            .get("data source")
            .cloned()
            .ok_or_else(|| anyhow!("Oracle connection string has no `Data Source`"))?;

        let conn = tokio::task::spawn_blocking(move || {
            ::oracle::Connection::connect(&user, &password, &data_source)
        })
        .await
        .context("Oracle connect task panicked")?
        .context("Oracle login failed")?;

        Ok(Self {
            conn: Arc::new(conn),
        })
    }
}

enum Fetch {
    Row(TextRow),
    Done,
}

fn named_params(query: &BoundQuery) -> Vec<(&str, &dyn ::oracle::sql_type::ToSql)> {
    query
        .params
        .iter()
        .map(|p| {
            let value: &dyn ::oracle::sql_type::ToSql = match &p.value {
                QueryParam::Timestamp(ts) => ts,
                QueryParam::Integer(v) => v,
                QueryParam::Text(s) => s,
            };
            (p.name, value)
        })
        .collect()
}

fn row_to_text(row: &::oracle::Row, binary: &[bool]) -> Result<TextRow> {
    binary
        .iter()
        .enumerate()
        .map(|(idx, is_binary)| {
            if *is_binary {
                // Payload is never serialized; report only whether it is NULL
                let value: Option<Vec<u8>> = row.get(idx).ok().flatten();
                Ok(value.map(|_| String::new()))
            } else {
                row.get::<usize, Option<String>>(idx)
                    .with_context(|| format!("Failed to convert Oracle column {}", idx))
            }
        })
        .collect()
}

/// Runs on a blocking thread: executes the query and pushes rows until done.
fn stream_query(
    conn: &::oracle::Connection,
    query: &BoundQuery,
    columns_tx: oneshot::Sender<Result<Vec<ColumnMeta>>>,
    rows_tx: mpsc::Sender<Result<Fetch>>,
) {
    let params = named_params(query);
    let result_set = match conn.query_named(&query.sql, &params) {
        Ok(rs) => rs,
        Err(e) => {
            let _ = columns_tx.send(
                Err(anyhow::Error::from(e)).with_context(|| format!("Oracle query failed: {}", query.sql)),
            );
            return;
        }
    };

    let columns: Vec<ColumnMeta> = result_set
        .column_info()
        .iter()
        .map(|c| ColumnMeta::new(c.name(), c.oracle_type().to_string()))
        .collect();
    let binary: Vec<bool> = columns.iter().map(ColumnMeta::is_binary).collect();
    if columns_tx.send(Ok(columns)).is_err() {
        return;
    }

    for row in result_set {
        let item = row
            .map_err(anyhow::Error::from)
            .and_then(|row| row_to_text(&row, &binary))
            .map(Fetch::Row);
        let failed = item.is_err();
        if rows_tx.blocking_send(item).is_err() || failed {
            return;
        }
    }
    let _ = rows_tx.blocking_send(Ok(Fetch::Done));
}

struct OracleCursor {
    columns: Vec<ColumnMeta>,
    rows: mpsc::Receiver<Result<Fetch>>,
    done: bool,
}

#[async_trait]
impl RowCursor for OracleCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<TextRow>> {
        if self.done {
            return Ok(None);
        }
        match self.rows.recv().await {
            Some(Ok(Fetch::Row(row))) => Ok(Some(row)),
            Some(Ok(Fetch::Done)) => {
                self.done = true;
                Ok(None)
            }
            Some(Err(e)) => Err(e.context("Failed to read row from Oracle")),
            None => Err(anyhow!("Oracle fetch thread ended before the result was complete")),
        }
    }
}

#[async_trait]
impl SourceConnection for OracleConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    async fn open_cursor<'a>(&'a mut self, query: &BoundQuery) -> Result<Box<dyn RowCursor + 'a>> {
        let (columns_tx, columns_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(ROW_BUFFER);
        let conn = Arc::clone(&self.conn);
        let query = query.clone();

        tokio::task::spawn_blocking(move || stream_query(&conn, &query, columns_tx, rows_tx));

        let columns = columns_rx
            .await
            .context("Oracle fetch thread exited before returning metadata")??;

        Ok(Box::new(OracleCursor {
            columns,
            rows: rows_rx,
            done: false,
        }))
    }

    async fn query_scalar(&mut self, query: &BoundQuery) -> Result<Option<i64>> {
        let conn = Arc::clone(&self.conn);
        let query = query.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<i64>> {
            let params = named_params(&query);
            match conn.query_row_named(&query.sql, &params) {
                Ok(row) => Ok(row.get::<usize, Option<i64>>(0)?),
                Err(::oracle::Error::NoDataFound) => Ok(None),
                Err(e) => Err(anyhow::Error::from(e))
                    .with_context(|| format!("Oracle query failed: {}", query.sql)),
            }
        })
        .await
        .context("Oracle query task panicked")?
    }
}
