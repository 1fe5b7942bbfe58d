// ABOUTME: Picks the best incremental-filter column of a table from catalog metadata
// ABOUTME: Scores column names against fragment buckets, falls back to temporal types

use crate::dialect::TableRef;
use crate::source::SourceConnection;
use anyhow::Result;

/// Name fragments and their scores, highest first. The first bucket a
/// column name matches decides its score.
const NAME_BUCKETS: &[(u32, &[&str])] = &[
    (10, &["MODIFICACION", "ULT_MOD", "UPDATED", "MODIFIED", "LAST_UPDATE"]),
    (9, &["CREACION", "FECHA_ALTA", "CREATED"]),
    (8, &["FECHA_VENTA", "SALE_DATE", "FECHA"]),
    (7, &["RECEP", "PEDIDO", "RECEIVED", "ORDER_DATE"]),
    (5, &["TIMESTAMP"]),
];

const TEMPORAL_TYPE_MARKERS: &[&str] = &["DATE", "TIME", "TIMESTAMP"];

/// Score of a column name, or 0 when it matches no bucket.
pub fn score_column_name(name: &str) -> u32 {
    let upper = name.to_uppercase();
    NAME_BUCKETS
        .iter()
        .find(|(_, fragments)| fragments.iter().any(|f| upper.contains(f)))
        .map(|(score, _)| *score)
        .unwrap_or(0)
}

/// Choose a column from `(name, declared type)` pairs in catalog order.
pub fn choose_column(columns: &[(String, String)]) -> Option<String> {
    let mut best: Option<(u32, &str)> = None;
    for (name, _) in columns {
        let score = score_column_name(name);
        if score > 0 && best.map_or(true, |(top, _)| score > top) {
            best = Some((score, name));
        }
    }
    if let Some((_, name)) = best {
        return Some(name.to_string());
    }

    columns
        .iter()
        .find(|(_, type_name)| {
            let upper = type_name.to_uppercase();
            TEMPORAL_TYPE_MARKERS.iter().any(|m| upper.contains(m))
        })
        .map(|(name, _)| name.clone())
}

async fn fetch_columns(conn: &mut dyn SourceConnection, table: &TableRef) -> Result<Vec<(String, String)>> {
    let query = conn.dialect().catalog_columns_query(table);
    let rows = conn.query_rows(&query).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let mut cells = row.into_iter();
            let name = cells.next().flatten()?;
            let type_name = cells.next().flatten().unwrap_or_default();
            Some((name, type_name))
        })
        .collect())
}

/// Detect the incremental column for `table`.
///
/// Catalog errors are logged and reported as "no column", which makes the
/// caller fall back to a full scan for this run.
pub async fn detect_timestamp_column(
    conn: &mut dyn SourceConnection,
    table: &TableRef,
) -> Option<String> {
    let columns = match fetch_columns(conn, table).await {
        Ok(columns) => columns,
        Err(e) => {
            tracing::warn!("Column detection failed for {}: {:#}", table, e);
            return None;
        }
    };

    let chosen = choose_column(&columns);
    match &chosen {
        Some(column) => tracing::debug!("Detected incremental column {}.{}", table, column),
        None => tracing::debug!("No incremental column found for {} ({} columns)", table, columns.len()),
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::source::fake::{row, text_columns, Reply, ScriptedSource};

    fn cols(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, t)| (n.to_string(), t.to_string()))
            .collect()
    }

    #[test]
    fn test_scores() {
        assert_eq!(score_column_name("FECHA_MODIFICACION"), 10);
        assert_eq!(score_column_name("created_at"), 9);
        assert_eq!(score_column_name("FECHA_VENTA"), 8);
        assert_eq!(score_column_name("order_date"), 7);
        assert_eq!(score_column_name("RECEPCION"), 7);
        assert_eq!(score_column_name("PEDIDO_DT"), 7);
        assert_eq!(score_column_name("received_on"), 7);
        // Any FECHA column ranks above reception and order names
        assert_eq!(score_column_name("FECHA_RECEP"), 8);
        assert_eq!(score_column_name("ROW_TIMESTAMP"), 5);
        assert_eq!(score_column_name("CODIGO"), 0);
    }

    #[test]
    fn test_highest_score_wins() {
        let columns = cols(&[
            ("ID", "NUMBER"),
            ("FECHA", "DATE"),
            ("FECHA_ALTA", "DATE"),
            ("ULT_MODIFICACION", "DATE"),
        ]);
        assert_eq!(choose_column(&columns).as_deref(), Some("ULT_MODIFICACION"));
    }

    #[test]
    fn test_ties_keep_catalog_order() {
        let columns = cols(&[("UPDATED_ON", "datetime"), ("LAST_UPDATE", "datetime")]);
        assert_eq!(choose_column(&columns).as_deref(), Some("UPDATED_ON"));
    }

    #[test]
    fn test_type_fallback_and_none() {
        let columns = cols(&[("ID", "int"), ("ALTA", "datetime2"), ("BAJA", "date")]);
        assert_eq!(choose_column(&columns).as_deref(), Some("ALTA"));

        let columns = cols(&[("ID", "int"), ("NOMBRE", "varchar")]);
        assert_eq!(choose_column(&columns), None);
    }

    #[tokio::test]
    async fn test_detect_reads_catalog() {
        let mut source = ScriptedSource::new(Dialect::Oracle).on(
            "USER_TAB_COLUMNS",
            Reply::Rows {
                columns: text_columns(&["COLUMN_NAME", "DATA_TYPE"]),
                rows: vec![
                    row(&[Some("ID"), Some("NUMBER")]),
                    row(&[Some("FECHA_VENTA"), Some("DATE")]),
                ],
            },
        );
        let table = TableRef::parse("ah_ventas");
        let column = detect_timestamp_column(&mut source, &table).await;
        assert_eq!(column.as_deref(), Some("FECHA_VENTA"));
        assert_eq!(source.executed.len(), 1);
    }

    #[tokio::test]
    async fn test_catalog_error_means_no_column() {
        let mut source = ScriptedSource::new(Dialect::SqlServer)
            .on("INFORMATION_SCHEMA.COLUMNS", Reply::Error("permission denied".into()));
        let table = TableRef::parse("ventas");
        assert_eq!(detect_timestamp_column(&mut source, &table).await, None);
    }
}
