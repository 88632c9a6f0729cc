//! Blob service binary

use clap::{Parser, Subcommand};
use jupiter_blob::{Config, Server};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "jupiter-blob")]
#[command(about = "Hierarchical content-addressed blob storage", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the blob service
    Serve {
        /// Configuration file (defaults to $JUPITER_CONFIG or ./jupiter.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Bind address for HTTP, overrides the config file
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => {
            let mut config = match config {
                Some(path) => Config::load_from(&path.to_string_lossy())?,
                None => Config::load()?,
            };
            if let Some(bind) = bind {
                config.bind_addr = bind.parse()?;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.as_str().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutting down");
                }
                signal.cancel();
            });

            Server::new(config).serve(shutdown).await?;
        }
    }

    Ok(())
}
