//! Replication bridge binary
//!
//! Activates one replication pair from flags or environment variables and
//! runs it until interrupted.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};
use walbridge::config::{BridgeConfig, DEFAULT_SERVER_ID};
use walbridge::supervisor::Supervisor;
use walbridge::types::Dialect;

#[derive(Parser, Debug)]
#[command(
    name = "walbridge",
    about = "Cross-engine logical replication bridge",
    version
)]
struct Args {
    /// Source connection string
    #[arg(long, env = "SOURCE_URL")]
    source_url: String,

    /// Target connection string
    #[arg(long, env = "TARGET_URL")]
    target_url: String,

    /// Source engine: postgresql or mysql
    #[arg(long, env = "SOURCE_DIALECT", default_value = "postgresql")]
    source_dialect: Dialect,

    /// Target engine: postgresql, mysql or redshift
    #[arg(long, env = "TARGET_DIALECT", default_value = "postgresql")]
    target_dialect: Dialect,

    /// Replication slot name (PostgreSQL sources)
    #[arg(long, env = "SLOT_NAME", default_value = "sub")]
    slot: String,

    /// Publication name (PostgreSQL sources)
    #[arg(long, env = "PUB_NAME", default_value = "pub")]
    publication: String,

    /// Replicated table on the source; schema.table for MySQL sources
    #[arg(long, env = "TABLE_SOURCE")]
    table_source: String,

    /// Table written on the target (defaults to the source table name)
    #[arg(long, env = "TABLE_DEST")]
    table_dest: Option<String>,

    /// Seconds between polls of an idle source and between reconciler passes
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 1)]
    poll_interval_secs: u64,

    /// Replica server id for binlog subscriptions (MySQL sources)
    #[arg(long, env = "SERVER_ID", default_value_t = DEFAULT_SERVER_ID)]
    server_id: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let args = Args::parse();

    let table_dest = args
        .table_dest
        .unwrap_or_else(|| args.table_source.rsplit('.').next().unwrap_or_default().to_string());

    let config = BridgeConfig::new(
        args.source_dialect,
        args.target_dialect,
        args.source_url,
        args.target_url,
        args.slot,
        args.publication,
        args.table_source,
        table_dest,
        args.poll_interval_secs,
        args.server_id,
    )?;

    info!(
        "Starting replication pair {} -> {} for table {}",
        config.source_dialect, config.target_dialect, config.table_source
    );

    let supervisor = Supervisor::new();
    let pair = supervisor.start(config).await?;
    info!("Replication pair {pair} running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    supervisor.stop(pair).await;

    Ok(())
}
