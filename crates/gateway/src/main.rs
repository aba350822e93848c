//! `tandem` — the HTTP/SSE gateway binary.

mod api;
mod config;
mod session_lock;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "tandem", about = "Agentic execution engine gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP/SSE gateway.
    Serve {
        /// Path to the TOML config file (default: ./tandem.toml, or $TANDEM_CONFIG).
        #[arg(long)]
        config: Option<PathBuf>,
        /// Attach the in-memory demo board backend.
        #[arg(long)]
        demo: bool,
        /// Override the configured listen port.
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, demo, port } => {
            let mut cfg = config::load_config(config.as_deref())?;
            if let Some(port) = port {
                cfg.server.port = port;
            }

            let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
            let state = AppState::build(Arc::new(cfg), demo)?;
            let app = api::router(state);

            tracing::info!(%addr, demo, "tandem gateway listening");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
    }
    Ok(())
}
