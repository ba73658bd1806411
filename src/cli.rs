//! Command-line interface

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::server;

#[derive(Parser)]
#[command(name = "renovoice", version, about = "Dual-persona renovation voice assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice service
    Serve {
        /// Listen host (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    }) {
        Commands::Serve { host, port } => {
            let mut config = Config::from_env();
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            server::start(config).await
        }
    }
}
