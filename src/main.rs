//! Stand-in endpoint simulator - CLI entry point

use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use standin::{
    server, BrokerSimulator, ExchangeJournal, HttpSimulator, SimulatorConfig, TemplateEngine,
};

#[derive(Parser, Debug)]
#[command(
    name = "standin",
    about = "Stand-in server for integration testing - simulates HTTP and message-broker endpoints",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "standin.yaml")]
    config: PathBuf,

    /// Listen address for the HTTP serving surface
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print the loaded config, or the bundled sample when none exists.
    if args.print_config {
        if args.config.exists() {
            let config = SimulatorConfig::from_file(&args.config)?;
            print!("{}", serde_yaml::to_string(&config)?);
        } else {
            print!("{}", include_str!("../demos/standin.yaml"));
        }
        return Ok(());
    }

    // Load configuration
    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        SimulatorConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no endpoints)");
        SimulatorConfig::default()
    };

    // Validate and exit if requested
    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} endpoints defined)",
            config.endpoints.len()
        );
        return Ok(());
    }

    let journal = Arc::new(ExchangeJournal::new(config.settings.journal_capacity));
    let templates = Arc::new(TemplateEngine::new());
    let config = Arc::new(config);

    // Broker endpoints come up first; a failed endpoint is logged and
    // skipped, never fatal.
    let brokers = Arc::new(BrokerSimulator::new(
        Arc::clone(&journal),
        Arc::clone(&templates),
    ));
    brokers.start_all(&config).await;

    let http = HttpSimulator::new(
        Arc::clone(&config),
        Arc::clone(&templates),
        Arc::clone(&journal),
    );
    server::serve(args.listen, http, shutdown_signal()).await?;

    brokers.shutdown().await;
    info!(
        total = journal.total(),
        matched = journal.matched_count(),
        unmatched = journal.unmatched_count(),
        "exchange totals at shutdown"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
    info!("Shutting down");
}
