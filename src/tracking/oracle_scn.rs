// ABOUTME: Oracle change tracking through system change numbers (SCN)
// ABOUTME: Uses DBA_CAPTURE for the enabled check and ORA_ROWSCN for row positions

use super::{position_to_i64, position_to_u64, ChangeRead, ChangeTracker};
use crate::dialect::{BoundQuery, Dialect, QueryParam, TableRef};
use crate::source::SourceConnection;
use anyhow::Result;
use async_trait::async_trait;

pub struct OracleScnTracker;

#[async_trait]
impl ChangeTracker for OracleScnTracker {
    async fn is_enabled(&self, conn: &mut dyn SourceConnection, table: &TableRef) -> Result<bool> {
        let query = BoundQuery::new(format!(
            "SELECT COUNT(*) FROM DBA_CAPTURE WHERE TABLE_NAME = {} AND STATUS = 'ENABLED'",
            Dialect::Oracle.param_placeholder(1, "table_name")
        ))
        .bind("table_name", QueryParam::Text(table.name().to_uppercase()));

        let count = conn.query_scalar(&query).await?.unwrap_or(0);
        Ok(count > 0)
    }

    // SCN is database-wide, so the table is not part of the lookup
    async fn current_position(
        &self,
        conn: &mut dyn SourceConnection,
        _table: &TableRef,
    ) -> Result<Option<u64>> {
        let query = BoundQuery::new("SELECT CURRENT_SCN FROM V$DATABASE");
        conn.query_scalar(&query)
            .await?
            .map(position_to_u64)
            .transpose()
    }

    async fn build_incremental_query(
        &self,
        _conn: &mut dyn SourceConnection,
        table: &TableRef,
        since_position: u64,
    ) -> Result<ChangeRead> {
        let since = position_to_i64(since_position)?;
        Ok(ChangeRead::Since(Dialect::Oracle.build_change_query(table, since, &[])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::fake::{Reply, ScriptedSource};

    #[tokio::test]
    async fn test_enabled_check_uses_upper_case_name() {
        let mut source =
            ScriptedSource::new(Dialect::Oracle).on("DBA_CAPTURE", Reply::Scalar(Some(1)));
        let table = TableRef::parse("ah_ventas");
        assert!(OracleScnTracker.is_enabled(&mut source, &table).await.unwrap());
        assert_eq!(
            source.executed[0].params[0].value,
            QueryParam::Text("AH_VENTAS".into())
        );
    }

    #[tokio::test]
    async fn test_not_enabled_when_count_is_zero() {
        let mut source =
            ScriptedSource::new(Dialect::Oracle).on("DBA_CAPTURE", Reply::Scalar(Some(0)));
        let table = TableRef::parse("ah_ventas");
        assert!(!OracleScnTracker.is_enabled(&mut source, &table).await.unwrap());
    }

    #[tokio::test]
    async fn test_current_position_reads_database_scn() {
        let mut source =
            ScriptedSource::new(Dialect::Oracle).on("V$DATABASE", Reply::Scalar(Some(1050)));
        let table = TableRef::parse("ah_ventas");
        let position = OracleScnTracker
            .current_position(&mut source, &table)
            .await
            .unwrap();
        assert_eq!(position, Some(1050));
    }
}
