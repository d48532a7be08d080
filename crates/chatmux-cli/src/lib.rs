//! ChatMux command-line interface.

pub mod commands;

use clap::{Parser, Subcommand};

/// ChatMux - chat gateway over a pool of agent workers
#[derive(Parser)]
#[command(name = "chatmux")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, env = "CHATMUX_CONFIG")]
    pub config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Gateway server
    Gateway(commands::gateway::GatewayArgs),

    /// Configuration management
    Config(commands::config::ConfigArgs),

    /// Show version information
    Version,
}

/// Run the CLI with the given arguments.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Gateway(args) => commands::gateway::run(args, cli.config).await,
        Commands::Config(args) => commands::config::run(args, cli.config).await,
        Commands::Version => {
            println!("chatmux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
