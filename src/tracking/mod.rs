// ABOUTME: Native change-tracking adapters and their persisted watermarks
// ABOUTME: Oracle reads by row SCN, SQL Server by CHANGETABLE version

pub mod oracle_scn;
pub mod sqlserver_ct;
pub mod watermark;

pub use oracle_scn::OracleScnTracker;
pub use sqlserver_ct::SqlServerChangeTracker;
pub use watermark::WatermarkStore;

use crate::dialect::{BoundQuery, Dialect, TableRef};
use crate::source::SourceConnection;
use anyhow::{Context, Result};
use async_trait::async_trait;

/// How to read a tracked table's changes since a stored watermark.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRead {
    /// Rows changed after the watermark.
    Since(BoundQuery),
    /// The watermark predates the retained change window; a full scan is required.
    WindowPurged,
}

/// A dialect's native change-tracking primitive.
///
/// Adapters are read-only: enabling tracking on a table is an administrative
/// action outside this crate. "Not tracked" is `Ok(false)`, not an error.
#[async_trait]
pub trait ChangeTracker: Send + Sync {
    /// Whether `table` can be read incrementally through native tracking.
    async fn is_enabled(&self, conn: &mut dyn SourceConnection, table: &TableRef) -> Result<bool>;

    /// The source's current position, or `None` when tracking is unavailable.
    async fn current_position(
        &self,
        conn: &mut dyn SourceConnection,
        table: &TableRef,
    ) -> Result<Option<u64>>;

    /// Query for rows changed after `since_position`.
    async fn build_incremental_query(
        &self,
        conn: &mut dyn SourceConnection,
        table: &TableRef,
        since_position: u64,
    ) -> Result<ChangeRead>;
}

pub fn for_dialect(dialect: Dialect) -> Box<dyn ChangeTracker> {
    match dialect {
        Dialect::Oracle => Box::new(OracleScnTracker),
        Dialect::SqlServer => Box::new(SqlServerChangeTracker),
    }
}

pub(crate) fn position_to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("Negative change-tracking position: {}", value))
}

pub(crate) fn position_to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("Change-tracking position out of range: {}", value))
}
