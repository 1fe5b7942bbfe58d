// ABOUTME: TOML configuration for an extraction agent
// ABOUTME: Tenant, source, directories, post-processing limits, hand-off, and tracked tables

use crate::dialect::{Dialect, TableRef};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// How the source database stores its timestamp columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceClock {
    /// Wall-clock time of the machine running the agent (typical for ERP installs).
    #[default]
    Local,
    Utc,
}

impl SourceClock {
    /// Render an instant the way the source stores it, for use as a filter value.
    pub fn to_source(self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            SourceClock::Local => instant.with_timezone(&Local).naive_local(),
            SourceClock::Utc => instant.naive_utc(),
        }
    }

    /// Interpret a configured naive timestamp as an instant.
    pub fn from_source(self, naive: NaiveDateTime) -> DateTime<Utc> {
        match self {
            SourceClock::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
            SourceClock::Utc => Utc.from_utc_datetime(&naive),
        }
    }
}

/// Size thresholds for the post-processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessLimits {
    /// Artifacts larger than this are split into parts.
    pub partition_bytes: u64,
    /// Files at or above this size are gzipped.
    pub compress_bytes: u64,
    /// Lower bound on data lines per part.
    pub min_rows_per_partition: u64,
}

impl Default for PostProcessLimits {
    fn default() -> Self {
        Self {
            partition_bytes: 100 * MIB,
            compress_bytes: 10 * MIB,
            min_rows_per_partition: 1000,
        }
    }
}

/// Hand-off settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Directory artifacts are delivered into. None keeps them in `output_dir`.
    pub outbox_dir: Option<PathBuf>,
    /// Relative path prefix under the outbox, e.g. `tenant/raw`.
    pub destination_prefix: String,
    pub retries: u32,
    pub initial_backoff_secs: u64,
    pub keep_local_artifacts: bool,
    pub max_replays_per_run: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            outbox_dir: None,
            destination_prefix: String::new(),
            retries: 3,
            initial_backoff_secs: 2,
            keep_local_artifacts: false,
            max_replays_per_run: 5,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> u32 {
    100
}

/// One tracked table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableExportSpec {
    /// Table identifier, optionally `schema.table`.
    pub name: String,
    /// Explicit filter column. When absent the column is detected.
    #[serde(default)]
    pub incremental_column: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Ascending; lower runs first.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Last successful export, in the source clock.
    #[serde(default)]
    pub last_export: Option<NaiveDateTime>,
}

impl TableExportSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            incremental_column: None,
            enabled: true,
            priority: default_priority(),
            last_export: None,
        }
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::parse(&self.name)
    }
}

fn default_command_timeout() -> u64 {
    600
}

fn default_connect_retries() -> u32 {
    5
}

/// `%LOCALAPPDATA%\incremental-extractor` on Windows, `~/.incremental-extractor` elsewhere.
fn default_state_dir() -> PathBuf {
    #[cfg(windows)]
    let base = dirs::data_local_dir().map(|dir| dir.join("incremental-extractor"));

    #[cfg(not(windows))]
    let base = dirs::home_dir().map(|home| home.join(".incremental-extractor"));

    base.unwrap_or_else(|| PathBuf::from("state"))
}

/// Top-level agent configuration, loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub tenant_id: String,
    pub dialect: Dialect,
    /// May be omitted and supplied through the environment instead.
    #[serde(default)]
    pub connection_string: Option<String>,
    pub output_dir: PathBuf,
    /// Watermarks, retry queue and run ledger. Defaults to a per-user data directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub source_clock: SourceClock,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default)]
    pub post_process: PostProcessLimits,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub tables: Vec<TableExportSpec>,
}

impl AgentConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            bail!("tenant_id must not be empty");
        }
        if self.post_process.partition_bytes == 0 {
            bail!("post_process.partition_bytes must be greater than zero");
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            let name = table.name.trim();
            if name.is_empty() {
                bail!("table name must not be empty");
            }
            if !seen.insert(name.to_lowercase()) {
                bail!("table '{}' is configured more than once", name);
            }
        }
        Ok(())
    }

    /// Connection string from the environment override, else the file.
    pub fn resolve_connection_string(&self, override_value: Option<&str>) -> Result<String> {
        override_value
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.connection_string.clone())
            .filter(|s| !s.trim().is_empty())
            .context("No connection string: set `connection_string` or EXTRACTOR_CONNECTION_STRING")
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn watermark_dir(&self) -> PathBuf {
        self.state_dir.join("watermarks")
    }

    pub fn retry_queue_path(&self) -> PathBuf {
        self.state_dir.join("retry-queue.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("export-state.json")
    }

    /// Enabled tables, in ascending priority; ties keep file order.
    pub fn ordered_tables(&self) -> Vec<TableExportSpec> {
        let mut tables: Vec<TableExportSpec> =
            self.tables.iter().filter(|t| t.enabled).cloned().collect();
        tables.sort_by_key(|t| t.priority);
        tables
    }

    pub fn find_table(&self, name: &str) -> Option<&TableExportSpec> {
        self.tables
            .iter()
            .find(|t| t.name.trim().eq_ignore_ascii_case(name.trim()))
    }
}
