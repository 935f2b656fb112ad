//! Traffic Gateway binary.
//!
//! Startup order: config → logging → metrics → listener → server.
//! Any configuration error aborts startup.

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use traffic_gateway::config::load_config;
use traffic_gateway::config::watcher::ConfigWatcher;
use traffic_gateway::http::HttpServer;
use traffic_gateway::lifecycle::{spawn_signal_listener, Shutdown};
use traffic_gateway::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "traffic-gateway")]
#[command(about = "HTTP API gateway with rate limiting and circuit breaking", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Reload routes when the configuration file changes
    #[arg(short, long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)?;
    logging::init_logging(&config.observability)?;

    tracing::info!(
        config = %cli.config.display(),
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        request_timeout_secs = config.timeouts.request_secs,
        "traffic-gateway v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address, metrics disabled"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    // Keep the watcher alive for the lifetime of the server.
    let (_watcher, config_updates) = if cli.watch {
        let (watcher, updates) = ConfigWatcher::new(&cli.config);
        (Some(watcher.run()?), updates)
    } else {
        let (_, updates) = mpsc::unbounded_channel();
        (None, updates)
    };

    let shutdown = Shutdown::new();
    spawn_signal_listener(&shutdown);

    let server = HttpServer::new(config)?;
    server.run(listener, config_updates, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
