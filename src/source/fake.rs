// ABOUTME: Scripted in-memory SourceConnection for unit tests
// ABOUTME: Answers statements by SQL fragment and records everything executed

use super::{ColumnMeta, RowCursor, SourceConnection, TextRow};
use crate::dialect::{BoundQuery, Dialect};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Scalar(Option<i64>),
    Rows {
        columns: Vec<ColumnMeta>,
        rows: Vec<TextRow>,
    },
    /// Yields `rows`, then fails mid-stream.
    BrokenStream {
        columns: Vec<ColumnMeta>,
        rows: Vec<TextRow>,
    },
    Error(String),
    /// Never answers.
    Hang,
}

/// Source whose answers are chosen by the first rule whose fragment occurs in the SQL.
pub(crate) struct ScriptedSource {
    dialect: Dialect,
    rules: Vec<(String, Reply)>,
    pub executed: Vec<BoundQuery>,
}

impl ScriptedSource {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            rules: Vec::new(),
            executed: Vec::new(),
        }
    }

    pub fn on(mut self, fragment: &str, reply: Reply) -> Self {
        self.rules.push((fragment.to_string(), reply));
        self
    }

    pub fn executed_sql(&self) -> Vec<&str> {
        self.executed.iter().map(|q| q.sql.as_str()).collect()
    }

    fn reply_for(&mut self, query: &BoundQuery) -> Result<Reply> {
        self.executed.push(query.clone());
        self.rules
            .iter()
            .find(|(fragment, _)| query.sql.contains(fragment.as_str()))
            .map(|(_, reply)| reply.clone())
            .ok_or_else(|| anyhow!("no scripted reply for: {}", query.sql))
    }
}

pub(crate) fn text_columns(names: &[&str]) -> Vec<ColumnMeta> {
    names.iter().map(|n| ColumnMeta::new(*n, "varchar")).collect()
}

pub(crate) fn row(values: &[Option<&str>]) -> TextRow {
    values.iter().map(|v| v.map(str::to_string)).collect()
}

struct ScriptedCursor {
    columns: Vec<ColumnMeta>,
    rows: VecDeque<TextRow>,
    fail_at_end: bool,
}

#[async_trait]
impl RowCursor for ScriptedCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<TextRow>> {
        match self.rows.pop_front() {
            Some(row) => Ok(Some(row)),
            None if self.fail_at_end => Err(anyhow!("connection reset while streaming")),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SourceConnection for ScriptedSource {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn open_cursor<'a>(&'a mut self, query: &BoundQuery) -> Result<Box<dyn RowCursor + 'a>> {
        let (columns, rows, fail_at_end) = match self.reply_for(query)? {
            Reply::Rows { columns, rows } => (columns, rows, false),
            Reply::BrokenStream { columns, rows } => (columns, rows, true),
            Reply::Scalar(value) => (
                text_columns(&["value"]),
                vec![vec![value.map(|v| v.to_string())]],
                false,
            ),
            Reply::Error(message) => return Err(anyhow!(message)),
            Reply::Hang => std::future::pending().await,
        };
        Ok(Box::new(ScriptedCursor {
            columns,
            rows: rows.into(),
            fail_at_end,
        }))
    }

    async fn query_scalar(&mut self, query: &BoundQuery) -> Result<Option<i64>> {
        match self.reply_for(query)? {
            Reply::Scalar(value) => Ok(value),
            Reply::Error(message) => Err(anyhow!(message)),
            Reply::Hang => std::future::pending().await,
            other => Err(anyhow!("scripted reply is not a scalar: {:?}", other)),
        }
    }
}
