//! Meshplane Daemon
//!
//! Serves the network ACL API, migrates stored matrices on startup and
//! forwards peer updates to the messaging backend.

use clap::Parser;
use meshplane_common::Database;
use meshplane_web::WebServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod app;
mod config;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "meshplaned")]
#[command(about = "Meshplane daemon - mesh network ACL control plane")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Do not run the ACL migration on startup
    #[arg(long)]
    skip_migration: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Meshplane daemon v{}", meshplane_common::VERSION);

    let config_path = cli.config.unwrap_or_else(DaemonConfig::default_path);
    let mut config = DaemonConfig::load_or_create(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.http_listen = listen;
    }
    let addr: SocketAddr = config.http_listen.parse()?;

    // Ensure store directory exists
    tokio::fs::create_dir_all(&config.store_path).await?;
    let db = Database::open(config.db_path())?;

    let app = app::App::build(&config, db);

    if config.migration.run_on_startup && !cli.skip_migration {
        app.migrate(config.migration.force).await?;
    } else {
        info!("ACL migration skipped");
    }

    let server = WebServer::new(app.acls.clone());
    let server_handle = tokio::spawn(server.serve(addr));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
                Err(e) => tracing::error!("HTTP server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    if let Some(publisher) = app.publisher {
        publisher.abort();
    }

    info!("Daemon shutdown complete");
    Ok(())
}
