// ABOUTME: CLI entry point for incremental-extractor
// ABOUTME: Parses commands and routes to the run, queue, and detect-column handlers

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use incremental_extractor::{detect, source, AgentConfig, Pipeline, RetryQueue, TableRef};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "incremental-extractor")]
#[command(about = "Incremental table extractor for Oracle and SQL Server", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Source connection string (overrides `connection_string` in the config file)
    #[arg(
        long = "connection-string",
        env = "EXTRACTOR_CONNECTION_STRING",
        global = true,
        hide_env_values = true
    )]
    connection_string: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one extraction cycle over every enabled table
    Run {
        #[arg(long)]
        config: PathBuf,
    },
    /// List exports waiting in the retry queue
    Queue {
        #[arg(long)]
        config: PathBuf,
    },
    /// Show which incremental column would be used for a table
    DetectColumn {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        table: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run { config } => run(&config, cli.connection_string.as_deref()).await,
        Commands::Queue { config } => show_queue(&config),
        Commands::DetectColumn { config, table } => {
            detect_column(&config, &table, cli.connection_string.as_deref()).await
        }
    }
}

async fn connect(
    config: &AgentConfig,
    override_value: Option<&str>,
) -> anyhow::Result<Box<dyn source::SourceConnection>> {
    let connection_string = config.resolve_connection_string(override_value)?;
    source::connect(config.dialect, &connection_string, config.connect_retries).await
}

async fn run(config_path: &Path, override_value: Option<&str>) -> anyhow::Result<()> {
    let config = AgentConfig::load(config_path)?;
    let mut conn = connect(&config, override_value).await?;
    let pipeline = Pipeline::open(config)?;

    let summary = pipeline.run(conn.as_mut()).await?;
    let aggregate = summary.aggregate();
    println!("{}", aggregate.message);
    println!(
        "  rows: {}  artifacts delivered: {}  queued for retry: {}  duration: {}ms",
        summary.rows_exported,
        summary.artifacts_delivered,
        summary.queued_for_retry,
        summary.duration_ms
    );

    if !summary.is_success() {
        for error in &summary.errors {
            eprintln!("  ✗ {}", error);
        }
        anyhow::bail!(
            "{} table(s) failed: {}",
            aggregate.failed_tables.len(),
            aggregate.failed_tables.join(", ")
        );
    }
    Ok(())
}

fn show_queue(config_path: &Path) -> anyhow::Result<()> {
    let config = AgentConfig::load(config_path)?;
    let items = RetryQueue::read_all(&config.retry_queue_path())
        .context("Failed to read retry queue")?;
    if items.is_empty() {
        println!("Retry queue is empty");
        return Ok(());
    }

    let now = Utc::now();
    let waiting = items.iter().filter(|item| !item.is_eligible(now)).count();
    println!(
        "{} pending retry item(s), {} still backing off:",
        items.len(),
        waiting
    );
    for item in items {
        let next = match item.next_retry_at {
            Some(at) if at > now => format!("{} (waiting)", at.to_rfc3339()),
            Some(at) => at.to_rfc3339(),
            None => "now".to_string(),
        };
        println!(
            "  {}  retries={}  next={}  files={}  failed_at={}  error={}",
            item.table,
            item.retry_count,
            next,
            item.artifacts.len(),
            item.failed_at.to_rfc3339(),
            item.error
        );
    }
    Ok(())
}

async fn detect_column(
    config_path: &Path,
    table: &str,
    override_value: Option<&str>,
) -> anyhow::Result<()> {
    let config = AgentConfig::load(config_path)?;
    if let Some(column) = config
        .find_table(table)
        .and_then(|spec| spec.incremental_column.as_deref())
    {
        println!("{} (configured)", column);
        return Ok(());
    }

    let mut conn = connect(&config, override_value).await?;
    match detect::detect_timestamp_column(conn.as_mut(), &TableRef::parse(table)).await {
        Some(column) => println!("{} (detected)", column),
        None => println!("no incremental column; table will be fully scanned"),
    }
    Ok(())
}
