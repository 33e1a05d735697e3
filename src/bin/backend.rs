#![forbid(unsafe_code)]

//! HTTP entry point for the media relay.
//!
//! Everything interesting lives in the library; this binary only parses the
//! command line, loads configuration and runs the Axum server until Ctrl+C.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::Parser;
use mediarelay::{
    config::{ConfigOverrides, load_config},
    logging::{LogLevel, init_tracing},
    relay::{AppState, router},
};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay YouTube and TikTok videos as streamed downloads.")]
struct BackendArgs {
    #[arg(
        long = "host",
        value_name = "ADDR",
        help = "Address to listen on (overrides MEDIARELAY_HOST)"
    )]
    host: Option<String>,
    #[arg(
        long = "port",
        value_name = "PORT",
        help = "Port to listen on (overrides MEDIARELAY_PORT)"
    )]
    port: Option<u16>,
    #[arg(
        long = "env-file",
        value_name = "PATH",
        help = "Read settings from this env file instead of ./.env"
    )]
    env_file: Option<PathBuf>,
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

impl BackendArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            env_path: self.env_file.clone(),
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/MEDIARELAY_HOST")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_tracing(args.log_level)?;

    let config = load_config(args.overrides()).context("loading relay configuration")?;
    let host = parse_host_arg(&config.host)?;
    if config.youtube_api_key.is_none() {
        warn!("YOUTUBE_API_KEY is not set; /api/youtube metadata lookups will fail");
    }

    let state = AppState::from_config(&config).context("initializing relay components")?;
    info!(
        backends = ?state.youtube.backend_names(),
        prefer_external = config.prefer_external_downloader,
        ytdlp = %config.ytdlp_binary.display(),
        "YouTube download chain ready"
    );
    let app = router(state);

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates the
    // process if the handler cannot be installed.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}
