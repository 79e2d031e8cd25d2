mod backoff;
mod config;
mod error;
mod gateway;
mod metrics;
mod middleware;
mod openapi;
mod path_index;
mod state;
mod tokeninfo;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::gateway::Gateway;

/// OpenAPI-driven reverse proxy with OAuth2 token introspection.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Config file path.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), config = %cli.config.display(), "starting gateway");

    let config = Config::from_file(&cli.config)?;
    config.validate()?;

    // The management endpoint serves the metrics exposition separately from
    // the api traffic.
    if !config.management.bind.is_empty() {
        let addr: SocketAddr = config::parse_bind(&config.management.bind)?;
        let management = Router::new().route("/metrics", get(metrics::exposition));
        tokio::spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(%addr, error = %err, "binding management endpoint");
                    return;
                }
            };
            if let Err(err) = axum::serve(listener, management).await {
                error!(error = %err, "management endpoint failed");
            }
        });
    }

    let gateway = Arc::new(Gateway::new(config));
    let runner = gateway.clone();
    let mut server = tokio::spawn(async move { runner.run().await });

    tokio::select! {
        signal = signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received, stopping gateway");
            gateway.shutdown_with_timeout(Duration::from_secs(10)).await;
            match server.await {
                Ok(result) => result,
                Err(join) => Err(join.into()),
            }
        }
        // The server ending on its own means a startup or serve error.
        result = &mut server => {
            match result {
                Ok(result) => result,
                Err(join) => Err(join.into()),
            }
        }
    }
}
