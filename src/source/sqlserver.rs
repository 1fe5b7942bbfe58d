// ABOUTME: SQL Server SourceConnection backed by tiberius over a tokio TCP stream
// ABOUTME: Converts TDS column data to text rows for the serializer

use super::{ColumnMeta, RowCursor, SourceConnection, TextRow};
use crate::dialect::{BoundQuery, Dialect, QueryParam};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use tiberius::{Client, Column, ColumnData, ColumnType, Config, FromSql, Row, SqlBrowser, ToSql};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

pub struct SqlServerConnection {
    client: Client<Compat<TcpStream>>,
}

impl SqlServerConnection {
    /// Connect using an ADO.NET-style connection string
    /// (`Server=host\INSTANCE;Database=db;User Id=..;Password=..`).
    pub async fn connect(connection_string: &str) -> Result<Self> {
        let config = Config::from_ado_string(connection_string)
            .context("Invalid SQL Server connection string")?;

        // Resolves named instances through SQL Browser, plain host:port otherwise
        let tcp = TcpStream::connect_named(&config)
            .await
            .context("Failed to open TCP connection to SQL Server")?;
        tcp.set_nodelay(true)?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .context("SQL Server login failed")?;

        Ok(Self { client })
    }
}

fn sql_params(query: &BoundQuery) -> Vec<&dyn ToSql> {
    query
        .params
        .iter()
        .map(|p| match &p.value {
            QueryParam::Timestamp(ts) => ts as &dyn ToSql,
            QueryParam::Integer(v) => v as &dyn ToSql,
            QueryParam::Text(s) => s as &dyn ToSql,
        })
        .collect()
}

fn type_name(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::BigVarBin => "varbinary",
        ColumnType::BigBinary => "binary",
        ColumnType::Image => "image",
        ColumnType::Bit | ColumnType::Bitn => "bit",
        ColumnType::Int1 => "tinyint",
        ColumnType::Int2 => "smallint",
        ColumnType::Int4 | ColumnType::Intn => "int",
        ColumnType::Int8 => "bigint",
        ColumnType::Float4 => "real",
        ColumnType::Float8 | ColumnType::Floatn => "float",
        ColumnType::Money | ColumnType::Money4 => "money",
        ColumnType::Decimaln => "decimal",
        ColumnType::Numericn => "numeric",
        ColumnType::Datetime | ColumnType::Datetimen => "datetime",
        ColumnType::Datetime4 => "smalldatetime",
        ColumnType::Datetime2 => "datetime2",
        ColumnType::Daten => "date",
        ColumnType::Timen => "time",
        ColumnType::DatetimeOffsetn => "datetimeoffset",
        ColumnType::Guid => "uniqueidentifier",
        ColumnType::BigVarChar => "varchar",
        ColumnType::BigChar => "char",
        ColumnType::NVarchar => "nvarchar",
        ColumnType::NChar => "nchar",
        ColumnType::Text => "text",
        ColumnType::NText => "ntext",
        ColumnType::Xml => "xml",
        _ => "sql_variant",
    }
}

fn column_meta(column: &Column) -> ColumnMeta {
    ColumnMeta::new(column.name(), type_name(column.column_type()))
}

fn cell_to_text(data: &ColumnData<'static>) -> Result<Option<String>> {
    let text = match data {
        ColumnData::U8(v) => v.map(|v| v.to_string()),
        ColumnData::I16(v) => v.map(|v| v.to_string()),
        ColumnData::I32(v) => v.map(|v| v.to_string()),
        ColumnData::I64(v) => v.map(|v| v.to_string()),
        ColumnData::F32(v) => v.map(|v| v.to_string()),
        ColumnData::F64(v) => v.map(|v| v.to_string()),
        ColumnData::Bit(v) => v.map(|v| v.to_string()),
        ColumnData::String(v) => v.as_ref().map(|s| s.to_string()),
        ColumnData::Guid(v) => v.map(|g| g.to_string()),
        // Binary payloads are replaced by the serializer; only nullness matters
        ColumnData::Binary(v) => v.as_ref().map(|_| String::new()),
        ColumnData::Numeric(v) => v.as_ref().map(|n| n.to_string()),
        ColumnData::Xml(v) => v.as_ref().map(|x| x.to_string()),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)?.map(|d| d.format("%Y-%m-%d").to_string()),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(|t| t.format("%H:%M:%S%.f").to_string()),
        ColumnData::DateTimeOffset(_) => {
            DateTime::<FixedOffset>::from_sql(data)?.map(|dt| dt.to_rfc3339())
        }
    };
    Ok(text)
}

fn cell_to_i64(data: &ColumnData<'static>) -> Option<i64> {
    match data {
        ColumnData::U8(v) => v.map(i64::from),
        ColumnData::I16(v) => v.map(i64::from),
        ColumnData::I32(v) => v.map(i64::from),
        ColumnData::I64(v) => *v,
        ColumnData::Numeric(v) => v.as_ref().and_then(|n| i64::try_from(n.int_part()).ok()),
        ColumnData::Bit(v) => v.map(i64::from),
        _ => None,
    }
}

fn row_to_text(row: Row) -> Result<TextRow> {
    row.into_iter().map(|cell| cell_to_text(&cell)).collect()
}

struct SqlServerCursor<'a> {
    columns: Vec<ColumnMeta>,
    rows: BoxStream<'a, tiberius::Result<Row>>,
}

#[async_trait]
impl RowCursor for SqlServerCursor<'_> {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<TextRow>> {
        match self.rows.try_next().await.context("Failed to read row from SQL Server")? {
            Some(row) => Ok(Some(row_to_text(row)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SourceConnection for SqlServerConnection {
    fn dialect(&self) -> Dialect {
        Dialect::SqlServer
    }

    async fn open_cursor<'a>(&'a mut self, query: &BoundQuery) -> Result<Box<dyn RowCursor + 'a>> {
        let params = sql_params(query);
        let mut stream = self
            .client
            .query(query.sql.as_str(), &params)
            .await
            .with_context(|| format!("SQL Server query failed: {}", query.sql))?;

        let columns = stream
            .columns()
            .await
            .context("Failed to read SQL Server result metadata")?
            .map(|cols| cols.iter().map(column_meta).collect())
            .unwrap_or_default();

        Ok(Box::new(SqlServerCursor {
            columns,
            rows: stream.into_row_stream(),
        }))
    }

    async fn query_scalar(&mut self, query: &BoundQuery) -> Result<Option<i64>> {
        let params = sql_params(query);
        let row = self
            .client
            .query(query.sql.as_str(), &params)
            .await
            .with_context(|| format!("SQL Server query failed: {}", query.sql))?
            .into_row()
            .await
            .context("Failed to read SQL Server scalar")?;

        Ok(row.and_then(|row| row.into_iter().next()).and_then(|cell| cell_to_i64(&cell)))
    }
}
