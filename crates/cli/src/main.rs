//! `relay`: composition root.
//!
//! 1. Parse arguments; secrets come from flags or their `RELAY_*` env vars.
//! 2. Load and validate `relay.toml`.
//! 3. Install tracing (fmt layer, optional OTLP export).
//! 4. Build the GitHub, Jenkins and registry adapters, hand them to the
//!    [`dispatch::Dispatcher`] and serve the HTTP surface until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dispatch::Dispatcher;
use github::{GithubClient, GithubConfig};
use jenkins::{JenkinsClient, JenkinsConfig};
use listener::AppState;
use registry::FileRegistrationStore;
use tracing::info;

mod config;
mod telemetry;

use config::RelayConfig;

#[derive(Debug, Parser)]
#[command(name = "relay", version, about = "Triggers Jenkins jobs from GitHub webhooks", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "RELAY_CONFIG", default_value = "relay.toml")]
    config: PathBuf,

    /// GitHub token used for label, pull request and contents lookups
    #[arg(long, env = "RELAY_GITHUB_TOKEN", hide_env_values = true)]
    github_token: String,

    /// Shared secret GitHub signs webhook deliveries with
    #[arg(long, env = "RELAY_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: String,

    /// Token required by the registration API
    #[arg(long, env = "RELAY_API_TOKEN", hide_env_values = true)]
    api_token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let _telemetry = telemetry::init(&config.telemetry)?;

    run(cli, config).await
}

async fn run(cli: Cli, config: RelayConfig) -> Result<()> {
    let github = GithubClient::new(GithubConfig {
        api_base: config.github.api_base.clone(),
        token: cli.github_token,
        request_timeout: config.github_timeout(),
        backoff: config.github_backoff(),
    })
    .context("failed to create GitHub client")?;

    let jenkins = JenkinsClient::new(JenkinsConfig {
        instances: config.jenkins_instances(|var| std::env::var(var).ok())?,
        request_timeout: config.jenkins_timeout(),
        backoff: config.jenkins_backoff(),
    })
    .context("failed to create Jenkins client")?;

    let store = Arc::new(
        FileRegistrationStore::open(config.registry.path.clone())
            .await
            .context("failed to open registration store")?,
    );

    let dispatcher = Dispatcher::new(
        store.clone(),
        Arc::new(github),
        Arc::new(jenkins),
        config.dispatch_settings()?,
    );
    let state = AppState::new(dispatcher, store, cli.webhook_secret, cli.api_token);

    let socket = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    listener::serve(socket, state, shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
