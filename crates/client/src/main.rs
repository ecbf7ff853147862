//! Whisper Client
//!
//! Command-line front end: register with a server, look up keys, list
//! cached contacts.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use client::{default_client_dir, Client, Messenger};
use protocol::Uid;

/// Whisper Client - register and look up contact keys.
#[derive(Parser, Debug)]
#[command(name = "whisper-client")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Client directory holding config, keys and cached contacts
    #[arg(short, long, global = true, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Server address (overrides the config file)
    #[arg(short, long, global = true, value_name = "ADDR")]
    pub server: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the client.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Connect to the server, registering on first use
    Connect,

    /// Look up and cache the public key of a uid
    Query {
        /// Uid to look up
        uid: Uid,
    },

    /// List cached contacts
    Contacts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dir = cli.dir.clone().unwrap_or_else(default_client_dir);
    let mut client = Client::open(&dir)
        .with_context(|| format!("Failed to open client directory {}", dir.display()))?;

    match cli.command {
        Commands::Connect => {
            connect(&mut client, cli.server.as_deref()).await?;
            if let Ok(server_key) = client.cached_key(Uid::SERVER) {
                println!("Server key: {}", server_key.fingerprint());
            }
            println!("Your key:   {}", client.identity().fingerprint());
        }
        Commands::Query { uid } => {
            connect(&mut client, cli.server.as_deref()).await?;
            let key = client.query_uid(uid).await?;
            println!("uid {}: {}", uid, key.fingerprint());
            print!("{}", key.to_pem()?);
        }
        Commands::Contacts => {
            let uids = client.list_uids()?;
            if uids.is_empty() {
                println!("No contacts cached.");
            }
            for uid in uids {
                let key = client.cached_key(uid)?;
                println!("{:>11}  {}", uid, key.fingerprint());
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}

/// Connects and runs the handshake, printing the local uid.
async fn connect(client: &mut Client, server: Option<&str>) -> anyhow::Result<()> {
    let mut config = client.config().clone();
    config.apply_env_overrides();
    let address = server.map(str::to_string).unwrap_or(config.address);

    client
        .connect(&address)
        .await
        .with_context(|| format!("Failed to reach server at {}", address))?;

    let was_registered = client.config().is_registered();
    let uid = Messenger::handshake(client).await?;
    if was_registered {
        println!("Authenticated as uid {}", uid);
    } else {
        println!("Registered as uid {}", uid);
    }
    Ok(())
}
