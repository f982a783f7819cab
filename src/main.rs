//! CoreMQ broker daemon — binary entry point.
//!
//! Loads configuration (file → env → CLI, highest priority last), starts the
//! TCP accept loop, and — if `cluster_nodes` names any peer — an outbound
//! replication client alongside it. See the `coremq` library for the broker
//! core.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coremq::config::Config;
use coremq::{Broker, ReplicationClient};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "coremq")]
#[command(version)]
#[command(about = "A lightweight publish/subscribe message broker over persistent TCP connections")]
struct Cli {
    /// Path to a `coremq.toml` configuration file.
    #[arg(long, default_value = "coremq.toml")]
    config: PathBuf,

    /// Bind address, overrides the config file and `COREMQ_ADDRESS`.
    #[arg(long)]
    address: Option<String>,

    /// Bind port, overrides the config file and `COREMQ_PORT`.
    #[arg(long)]
    port: Option<u16>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: Option<PathBuf>) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Some(path) = log_file {
        let file = std::fs::File::create(&path)
            .with_context(|| format!("failed to create log file: {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.clone())?;

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    config.apply_cli_overrides(cli.address, cli.port);

    log::info!("CoreMQ starting up...");

    let hostname = hostname::get()
        .context("failed to determine local hostname")?
        .to_string_lossy()
        .to_lowercase();
    let short_name = hostname.split('.').next().unwrap_or(&hostname).to_string();

    let broker = Broker::new(
        short_name,
        config.port,
        &config.cluster_nodes,
        &config.allowed_replicants,
    );

    let shutdown = CancellationToken::new();

    let replication_task = if config.cluster_nodes.is_empty() {
        None
    } else {
        let client = ReplicationClient::new(Arc::clone(&broker), &config.cluster_nodes);
        let shutdown = shutdown.clone();
        Some(tokio::spawn(client.run(shutdown)))
    };

    let shutdown_signal = shutdown.clone();
    let broker_signal = Arc::clone(&broker);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("received shutdown signal");
            broker_signal.mark_shutting_down();
            shutdown_signal.cancel();
        }
    });

    let bind_addr = config.bind_addr();
    coremq::server::serve(&bind_addr, broker, shutdown.clone())
        .await
        .with_context(|| format!("server failed on {bind_addr}"))?;

    broker.mark_shutting_down();
    shutdown.cancel();
    if let Some(task) = replication_task {
        let _ = task.await;
    }

    log::info!("CoreMQ is now shut down");
    Ok(())
}
