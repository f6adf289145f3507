//! Main entry point for the Studyhall messaging server CLI.

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;
use std::error::Error;
use std::path::PathBuf;

/// Main CLI structure for the Studyhall messaging server.
#[derive(Parser)]
#[command(name = "studyhall-server")]
#[command(about = "Real-time group messaging server for the Studyhall platform", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the messaging server
    Serve {
        /// Port to bind; overrides the configuration file.
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to the configuration file (yaml or json). Defaults
        /// apply when omitted.
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Initializes environment variables and returns the parsed CLI.
#[must_use]
pub fn initialize_cli() -> Cli {
    dotenv().ok();
    Cli::parse()
}

async fn handle_serve_command(
    port: Option<u16>,
    config: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let resolved_config =
        Config::load_config(config, port).map_err(|err| -> Box<dyn Error> { Box::new(err) })?;
    server::server::run(resolved_config).await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = initialize_cli();

    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
    }
}
