//! # tether
//!
//! OpenAI-compatible completion server multiplexing every request over a
//! single upstream WebSocket.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether_server::{AllowAll, AppState, AuthGate, ModelCatalog, ServerConfig, WalletAuthGate};
use tether_telemetry::{init_telemetry, TelemetryConfig};
use tether_upstream::{CompletionGateway, UpstreamConfig};

/// Tether completion server.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "OpenAI-compatible gateway over a multiplexed upstream WebSocket")]
struct Cli {
    /// Upstream WebSocket endpoint.
    #[arg(long, env = "TETHER_UPSTREAM_URL", default_value = "wss://api.husky.gg/api")]
    upstream_url: String,

    /// Host to bind.
    #[arg(long, env = "TETHER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, env = "TETHER_PORT", default_value_t = 8000)]
    port: u16,

    #[arg(long, default_value_t = 3)]
    reconnect_delay_secs: u64,

    /// Consecutive failed connects before giving up.
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    #[arg(long, default_value_t = 30)]
    request_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    stream_idle_timeout_secs: u64,

    #[arg(long, env = "TETHER_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// Emit JSON log lines.
    #[arg(long, env = "TETHER_LOG_JSON", default_value_t = false)]
    log_json: bool,

    /// Skip wallet authentication (local use only).
    #[arg(long, default_value_t = false)]
    allow_all: bool,
}

impl Cli {
    fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            url: self.upstream_url.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            max_retries: self.max_retries,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            stream_idle_timeout: Duration::from_secs(self.stream_idle_timeout_secs),
            ..Default::default()
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = init_telemetry(&TelemetryConfig {
        log_level: cli.log_level,
        json: cli.log_json,
        ..Default::default()
    });
    let span = log.component("main");
    tracing::info!(parent: &span, upstream = %cli.upstream_url, "Starting tether");

    let upstream = cli.upstream_config();
    let auth_timeout = upstream.auth_timeout;
    let gateway = Arc::new(CompletionGateway::from_config(upstream, &log));

    // The receive loop keeps retrying if the first handshake fails.
    if let Err(e) = gateway.supervisor().connect().await {
        tracing::error!(parent: &span, error = %e, kind = e.error_kind(), "Initial upstream connect failed");
    }
    gateway.supervisor().start();

    let auth: Arc<dyn AuthGate> = if cli.allow_all {
        tracing::warn!(parent: &span, "Wallet authentication disabled");
        Arc::new(AllowAll)
    } else {
        Arc::new(WalletAuthGate::new(gateway.clone(), auth_timeout, &log))
    };

    let state = AppState::new(gateway.clone(), auth, ModelCatalog::default(), &log);
    let server = tether_server::start(cli.server_config(), state)
        .await
        .with_context(|| format!("Failed to bind {}:{}", cli.host, cli.port))?;
    tracing::info!(parent: &span, addr = %server.addr, "Tether ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!(parent: &span, "Shutting down");
    server.shutdown().await;
    gateway.supervisor().close().await;
    tracing::info!(parent: &span, "Shutdown complete");
    Ok(())
}
