// ABOUTME: SQL Server Change Tracking adapter (CHANGETABLE / CHANGE_TRACKING_CURRENT_VERSION)
// ABOUTME: Joins changes back to the base table on its primary key to materialise full rows

use super::{position_to_i64, position_to_u64, ChangeRead, ChangeTracker};
use crate::dialect::{BoundQuery, Dialect, QueryParam, TableRef};
use crate::source::SourceConnection;
use anyhow::{bail, Result};
use async_trait::async_trait;

const DIALECT: Dialect = Dialect::SqlServer;

pub struct SqlServerChangeTracker;

fn bind_table(sql: String, table: &TableRef) -> BoundQuery {
    let query = BoundQuery::new(sql).bind("table_name", QueryParam::Text(table.name().to_string()));
    match table.schema() {
        Some(schema) => query.bind("owner", QueryParam::Text(schema.to_string())),
        None => query,
    }
}

fn registration_query(table: &TableRef) -> BoundQuery {
    let sql = match table.schema() {
        Some(_) => format!(
            "SELECT COUNT(*) FROM sys.change_tracking_tables ctt \
             INNER JOIN sys.tables t ON ctt.object_id = t.object_id \
             INNER JOIN sys.schemas s ON t.schema_id = s.schema_id \
             WHERE t.name = {} AND s.name = {}",
            DIALECT.param_placeholder(1, "table_name"),
            DIALECT.param_placeholder(2, "owner")
        ),
        None => format!(
            "SELECT COUNT(*) FROM sys.change_tracking_tables ctt \
             INNER JOIN sys.tables t ON ctt.object_id = t.object_id \
             WHERE t.name = {}",
            DIALECT.param_placeholder(1, "table_name")
        ),
    };
    bind_table(sql, table)
}

fn primary_key_query(table: &TableRef) -> BoundQuery {
    let mut sql = format!(
        "SELECT kcu.COLUMN_NAME FROM INFORMATION_SCHEMA.TABLE_CONSTRAINTS tc \
         INNER JOIN INFORMATION_SCHEMA.KEY_COLUMN_USAGE kcu \
         ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME \
         AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA AND tc.TABLE_NAME = kcu.TABLE_NAME \
         WHERE tc.CONSTRAINT_TYPE = 'PRIMARY KEY' AND tc.TABLE_NAME = {}",
        DIALECT.param_placeholder(1, "table_name")
    );
    if table.schema().is_some() {
        sql.push_str(&format!(
            " AND tc.TABLE_SCHEMA = {}",
            DIALECT.param_placeholder(2, "owner")
        ));
    }
    sql.push_str(" ORDER BY kcu.ORDINAL_POSITION");
    bind_table(sql, table)
}

async fn primary_key_columns(
    conn: &mut dyn SourceConnection,
    table: &TableRef,
) -> Result<Vec<String>> {
    let rows = conn.query_rows(&primary_key_query(table)).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect())
}

#[async_trait]
impl ChangeTracker for SqlServerChangeTracker {
    async fn is_enabled(&self, conn: &mut dyn SourceConnection, table: &TableRef) -> Result<bool> {
        let count = conn
            .query_scalar(&registration_query(table))
            .await?
            .unwrap_or(0);
        if count == 0 {
            return Ok(false);
        }

        if primary_key_columns(conn, table).await?.is_empty() {
            tracing::warn!(
                "{} is registered for change tracking but has no primary key; not using it",
                table
            );
            return Ok(false);
        }
        Ok(true)
    }

    async fn current_position(
        &self,
        conn: &mut dyn SourceConnection,
        _table: &TableRef,
    ) -> Result<Option<u64>> {
        let query = BoundQuery::new("SELECT CHANGE_TRACKING_CURRENT_VERSION()");
        conn.query_scalar(&query)
            .await?
            .map(position_to_u64)
            .transpose()
    }

    async fn build_incremental_query(
        &self,
        conn: &mut dyn SourceConnection,
        table: &TableRef,
        since_position: u64,
    ) -> Result<ChangeRead> {
        let min_valid = BoundQuery::new(format!(
            "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(OBJECT_ID({}))",
            DIALECT.param_placeholder(1, "object_name")
        ))
        .bind("object_name", QueryParam::Text(DIALECT.quote_table(table)));

        if let Some(min) = conn.query_scalar(&min_valid).await? {
            let min = position_to_u64(min)?;
            if since_position < min {
                tracing::warn!(
                    "Change window for {} was purged (watermark {} < min valid {}); full scan required",
                    table,
                    since_position,
                    min
                );
                return Ok(ChangeRead::WindowPurged);
            }
        }

        let keys = primary_key_columns(conn, table).await?;
        if keys.is_empty() {
            bail!("{} has no primary key to join change rows on", table);
        }
        let since = position_to_i64(since_position)?;
        Ok(ChangeRead::Since(DIALECT.build_change_query(table, since, &keys)))
    }
}
