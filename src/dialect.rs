// ABOUTME: SQL dialect handling for Oracle and SQL Server sources
// ABOUTME: Identifier quoting, placeholders, and the extraction query builders

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source database family.
///
/// Every piece of dialect-specific SQL in the crate is produced by a method
/// on this enum; callers never inspect driver or connection types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Oracle family: double-quoted upper-case identifiers, `:name` binds.
    Oracle,
    /// SQL Server family: bracketed identifiers, positional `@P1` binds.
    #[serde(alias = "mssql", alias = "sql_server")]
    SqlServer,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Oracle => write!(f, "oracle"),
            Dialect::SqlServer => write!(f, "sqlserver"),
        }
    }
}

/// A table identifier, optionally qualified by schema/owner.
///
/// The configured text is kept verbatim for display and logging. Table names
/// may contain spaces (`"linea venta"`), so only the first `.` separates the
/// schema from the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    schema: Option<String>,
    name: String,
}

impl TableRef {
    pub fn parse(identifier: &str) -> Self {
        let identifier = identifier.trim();
        match identifier.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => Self {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            },
            _ => Self {
                schema: None,
                name: identifier.to_string(),
            },
        }
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem-safe stem used for artifact and watermark file names.
    pub fn file_stem(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A typed bind value.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Timestamp(NaiveDateTime),
    Integer(i64),
    Text(String),
}

/// A bind value together with the name used by named-bind dialects.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub name: &'static str,
    pub value: QueryParam,
}

/// SQL text plus its parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    pub sql: String,
    pub params: Vec<BoundParam>,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, name: &'static str, value: QueryParam) -> Self {
        self.params.push(BoundParam { name, value });
        self
    }

    /// True when the statement carries a row filter (and therefore an ORDER BY).
    pub fn is_filtered(&self) -> bool {
        !self.params.is_empty()
    }
}

impl Dialect {
    /// Quote a single identifier for this dialect.
    ///
    /// Oracle folds unquoted identifiers to upper case, so quoted Oracle
    /// identifiers are upper-cased to match the catalog. SQL Server keeps
    /// the name as configured (spaces included).
    pub fn quote_identifier(self, identifier: &str) -> String {
        match self {
            Dialect::Oracle => {
                let upper = identifier.to_uppercase();
                let mut quoted = String::with_capacity(upper.len() + 2);
                quoted.push('"');
                for ch in upper.chars() {
                    if ch == '"' {
                        quoted.push('"');
                    }
                    quoted.push(ch);
                }
                quoted.push('"');
                quoted
            }
            Dialect::SqlServer => {
                let mut quoted = String::with_capacity(identifier.len() + 2);
                quoted.push('[');
                for ch in identifier.chars() {
                    if ch == ']' {
                        quoted.push(']');
                    }
                    quoted.push(ch);
                }
                quoted.push(']');
                quoted
            }
        }
    }

    /// Quote a possibly schema-qualified table.
    pub fn quote_table(self, table: &TableRef) -> String {
        match table.schema() {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(table.name())
            ),
            None => self.quote_identifier(table.name()),
        }
    }

    /// Placeholder text for the `position`-th (1-based) parameter named `name`.
    pub fn param_placeholder(self, position: usize, name: &str) -> String {
        match self {
            Dialect::Oracle => format!(":{}", name),
            Dialect::SqlServer => format!("@P{}", position),
        }
    }

    /// Catalog lookup as it is compared against the catalog (Oracle stores upper case).
    fn catalog_name(self, name: &str) -> String {
        match self {
            Dialect::Oracle => name.to_uppercase(),
            Dialect::SqlServer => name.to_string(),
        }
    }

    /// `(column name, declared type)` for every column, in catalog order.
    pub fn catalog_columns_query(self, table: &TableRef) -> BoundQuery {
        let table_param = QueryParam::Text(self.catalog_name(table.name()));
        match (self, table.schema()) {
            (Dialect::Oracle, None) => BoundQuery::new(format!(
                "SELECT COLUMN_NAME, DATA_TYPE FROM USER_TAB_COLUMNS \
                 WHERE TABLE_NAME = {} ORDER BY COLUMN_ID",
                self.param_placeholder(1, "table_name")
            ))
            .bind("table_name", table_param),
            (Dialect::Oracle, Some(owner)) => BoundQuery::new(format!(
                "SELECT COLUMN_NAME, DATA_TYPE FROM ALL_TAB_COLUMNS \
                 WHERE TABLE_NAME = {} AND OWNER = {} ORDER BY COLUMN_ID",
                self.param_placeholder(1, "table_name"),
                self.param_placeholder(2, "owner")
            ))
            .bind("table_name", table_param)
            .bind("owner", QueryParam::Text(self.catalog_name(owner))),
            (Dialect::SqlServer, None) => BoundQuery::new(format!(
                "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_NAME = {} ORDER BY ORDINAL_POSITION",
                self.param_placeholder(1, "table_name")
            ))
            .bind("table_name", table_param),
            (Dialect::SqlServer, Some(schema)) => BoundQuery::new(format!(
                "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_NAME = {} AND TABLE_SCHEMA = {} ORDER BY ORDINAL_POSITION",
                self.param_placeholder(1, "table_name"),
                self.param_placeholder(2, "owner")
            ))
            .bind("table_name", table_param)
            .bind("owner", QueryParam::Text(schema.to_string())),
        }
    }

    /// Unfiltered, unordered `SELECT *`.
    pub fn build_full_scan_query(self, table: &TableRef) -> BoundQuery {
        BoundQuery::new(format!("SELECT * FROM {}", self.quote_table(table)))
    }

    /// Rows whose `column` is strictly after `since`, in ascending column order.
    ///
    /// Without both a column and a `since` value there is nothing to filter
    /// on and the result is a plain full scan.
    pub fn build_timestamp_query(
        self,
        table: &TableRef,
        column: Option<&str>,
        since: Option<NaiveDateTime>,
    ) -> BoundQuery {
        let (column, since) = match (column, since) {
            (Some(column), Some(since)) if !column.trim().is_empty() => (column, since),
            _ => return self.build_full_scan_query(table),
        };

        let quoted_column = self.quote_identifier(column);
        BoundQuery::new(format!(
            "SELECT * FROM {} WHERE {} > {} ORDER BY {} ASC",
            self.quote_table(table),
            quoted_column,
            self.param_placeholder(1, "since"),
            quoted_column
        ))
        .bind("since", QueryParam::Timestamp(since))
    }

    /// Rows changed after `since_position` using the dialect's native tracking.
    ///
    /// Oracle exposes the per-row SCN as `ORA_ROWSCN`. SQL Server reads
    /// `CHANGETABLE(CHANGES ...)` and joins back to the base table on
    /// `key_columns` so that full rows are materialised (deleted rows come
    /// back with NULL base columns).
    pub fn build_change_query(
        self,
        table: &TableRef,
        since_position: i64,
        key_columns: &[String],
    ) -> BoundQuery {
        let quoted_table = self.quote_table(table);
        match self {
            Dialect::Oracle => BoundQuery::new(format!(
                "SELECT ORA_ROWSCN, t.* FROM {} t WHERE ORA_ROWSCN > {} ORDER BY ORA_ROWSCN ASC",
                quoted_table,
                self.param_placeholder(1, "since_scn")
            ))
            .bind("since_scn", QueryParam::Integer(since_position)),
            Dialect::SqlServer => {
                let join = key_columns
                    .iter()
                    .map(|c| {
                        let q = self.quote_identifier(c);
                        format!("t.{} = ct.{}", q, q)
                    })
                    .collect::<Vec<_>>()
                    .join(" AND ");
                let placeholder = self.param_placeholder(1, "since_version");
                BoundQuery::new(format!(
                    "SELECT ct.SYS_CHANGE_VERSION, ct.SYS_CHANGE_OPERATION, t.* \
                     FROM CHANGETABLE(CHANGES {table}, {p}) AS ct \
                     LEFT JOIN {table} AS t ON {join} \
                     WHERE ct.SYS_CHANGE_VERSION > {p} \
                     ORDER BY ct.SYS_CHANGE_VERSION ASC",
                    table = quoted_table,
                    p = placeholder,
                    join = join
                ))
                .bind("since_version", QueryParam::Integer(since_position))
            }
        }
    }
}
