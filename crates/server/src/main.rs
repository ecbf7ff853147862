//! Whisper Server
//!
//! Registers clients and answers public key lookups.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use server::config::{default_config_path, Config};
use server::Server;

/// Whisper Server - uid directory for end-to-end encrypted messaging.
#[derive(Parser, Debug)]
#[command(name = "whisper-server")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, value_name = "ADDR")]
    pub listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    if let Some(listen) = cli.listen {
        config.server.listen_address = listen;
    }
    config.validate().context("Invalid configuration")?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.log.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Whisper server starting...");
    tracing::debug!("Using configuration from {:?}", config_path);

    let server = Server::new(config)?;
    let listener = server.bind().await?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl-C, shutting down");
                shutdown.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run(listener).await?;
    tracing::info!("Whisper server stopped");
    Ok(())
}
