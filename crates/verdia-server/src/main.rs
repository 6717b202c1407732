//! verdia-server - plant diagnosis service binary
//!
//! Startup path: parse CLI flags, initialize tracing, load configuration
//! (optional TOML file plus the credential from the environment), build the
//! provider and router state, then serve until ctrl-c.
//!
//! A missing credential does not abort startup: the service comes up, the
//! health probe answers, and analyze requests fail with a configuration
//! fault until the credential is provisioned.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use verdia_core::config::ServiceConfig;
use verdia_core::inference::GeminiProvider;
use verdia_server::routes;
use verdia_server::state::AppState;

/// verdia-server - plant photo diagnosis endpoint
#[derive(Parser, Debug)]
#[command(name = "verdia-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind the HTTP listener to
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Path to an optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (tracing `EnvFilter` syntax)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ServiceConfig::default(),
    };

    let credential = ServiceConfig::credential_from_env();
    if credential.is_none() {
        warn!("no inference credential in environment; analyze requests will fail until one is set");
    }

    let provider = GeminiProvider::new(config.inference.clone(), config.retry, credential)
        .context("failed to initialize inference client")?;

    let state = AppState::new(config, Arc::new(provider));
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    info!(addr = %args.bind, "verdia server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("verdia server stopped");
    Ok(())
}

/// Resolves when ctrl-c is received.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to install ctrl-c handler: {e}");
        // Without a signal handler the future must never resolve, or the
        // server would shut down immediately.
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
