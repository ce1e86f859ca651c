//! Sauer Server
//!
//! Runs a dedicated game server until interrupted.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sauer::{GameServer, ServerConfig, PROTOCOL_VERSION, VERSION};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// JSON config file; defaults apply when omitted
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(1);
        }
    };

    info!("Sauer Server v{} (protocol {})", VERSION, PROTOCOL_VERSION);
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    ServerConfig::load(args.config.as_deref()).with_context(|| match &args.config {
        Some(path) => format!("loading config from {}", path.display()),
        None => "loading default config".to_string(),
    })
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let server = GameServer::new(config);
    tokio::select! {
        result = server.run() => result.context("game server failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            server.shutdown();
            Ok(())
        }
    }
}
