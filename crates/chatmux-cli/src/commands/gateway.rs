//! Gateway command.

use chatmux_core::config::BindMode;
use chatmux_core::Config;
use chatmux_gateway::{GatewayContext, GatewayServer, MessagePipeline, SessionRegistry};
use chatmux_worker::{ProcessLauncher, WorkerPool};
use clap::Args;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Gateway command arguments.
#[derive(Args)]
pub struct GatewayArgs {
    #[command(subcommand)]
    pub command: GatewayCommand,
}

#[derive(clap::Subcommand)]
pub enum GatewayCommand {
    /// Start the gateway server
    Run {
        /// Bind mode (loopback, lan)
        #[arg(short, long)]
        bind: Option<String>,

        /// Port number
        #[arg(short, long, env = "CHATMUX_PORT")]
        port: Option<u16>,

        /// Authentication token required by the connect handshake
        #[arg(long, env = "CHATMUX_AUTH_TOKEN")]
        auth_token: Option<String>,

        /// Worker program to spawn
        #[arg(long)]
        worker: Option<String>,
    },

    /// Show gateway status
    Status,
}

/// Run the gateway command.
pub async fn run(args: GatewayArgs, config_path: Option<PathBuf>) -> anyhow::Result<()> {
    match args.command {
        GatewayCommand::Run {
            bind,
            port,
            auth_token,
            worker,
        } => {
            let mut config = load_config(config_path)?;

            if let Some(bind) = bind {
                config.gateway.bind = parse_bind_mode(&bind)?;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if auth_token.is_some() {
                config.gateway.auth_token = auth_token;
            }
            if let Some(worker) = worker {
                config.worker.program = worker;
            }
            config.validate()?;

            if config.gateway.bind != BindMode::Loopback && config.gateway.auth_token.is_none() {
                warn!("binding beyond loopback without an auth token");
            }

            serve(config).await
        }
        GatewayCommand::Status => {
            let config = load_config(config_path)?;
            let addr = format!("127.0.0.1:{}", config.gateway.port);
            match TcpStream::connect(&addr) {
                Ok(_) => println!("gateway is running on {}", addr),
                Err(_) => println!("gateway is not running on {}", addr),
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load(&path)?;
            config.apply_env();
            Ok(config)
        }
        None => Ok(Config::load_or_default()),
    }
}

fn parse_bind_mode(value: &str) -> anyhow::Result<BindMode> {
    match value {
        "loopback" => Ok(BindMode::Loopback),
        "lan" => Ok(BindMode::Lan),
        _ => anyhow::bail!("invalid bind mode: {}", value),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let launcher = Arc::new(ProcessLauncher::new(config.worker.clone()));
    let pool = WorkerPool::new(config.worker.clone(), launcher);
    pool.start().await;

    let registry = Arc::new(SessionRegistry::open_default(config.session.clone())?);
    let pipeline = Arc::new(
        MessagePipeline::new(pool.clone(), registry.clone())
            .with_acquire_timeout(config.worker.request_timeout()),
    );

    // periodic idle sweep
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = registry.sweep_idle().await {
                    warn!("idle sweep failed: {}", e);
                }
            }
        });
    }

    let context = Arc::new(GatewayContext::new(
        config,
        pool.clone(),
        registry,
        pipeline,
    ));
    let server = GatewayServer::new(context).await;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            pool.shutdown().await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind_mode() {
        assert_eq!(parse_bind_mode("loopback").unwrap(), BindMode::Loopback);
        assert_eq!(parse_bind_mode("lan").unwrap(), BindMode::Lan);
        assert!(parse_bind_mode("tailnet").is_err());
    }
}
