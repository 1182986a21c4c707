mod backend;
mod config;
mod gate;
mod health;
mod http;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::backend::supabase::SupabaseBackend;
use crate::backend::SettingsStore;
use crate::config::Config;
use crate::gate::clock::SystemClock;
use crate::gate::pass::PassKey;
use crate::gate::{Collaborators, RequestGate};
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "sitegate", about = "Maintenance and access gate in front of the operations app")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/sitegate/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gate: Arc<RequestGate>,
    pub metrics: MetricsRegistry,
    /// Client for the app origin and backend passthrough.  Never follows
    /// redirects, so they reach the browser unchanged.
    pub http_client: reqwest::Client,
    /// Settings store probed by `/healthz`.
    pub settings: Arc<dyn SettingsStore>,
    /// Injected as `apikey` on backend passthrough requests.
    pub backend_key: String,
    /// Code accepted by the gate pass endpoint; `None` disables issuance.
    pub access_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Gate setup
// ---------------------------------------------------------------------------

fn read_secret_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn build_pass_key(config: &Config) -> PassKey {
    match read_secret_env(&config.gate.pass_secret_env) {
        Some(secret) => {
            tracing::info!("gate passes are HMAC-signed");
            PassKey::new(Some(secret.into_bytes()))
        }
        None => {
            tracing::warn!(
                env_var = %config.gate.pass_secret_env,
                "no gate pass secret configured, unsigned passes will be accepted"
            );
            PassKey::new(None)
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .listen
        .parse()
        .context("invalid server.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting sitegate");

    // ---- HTTP clients ----
    // Backend calls get the gate timeout; proxied traffic may stream for
    // longer and only gets a connect timeout.
    let backend_timeout = Duration::from_millis(config.backend.timeout_ms);
    let backend_client = reqwest::Client::builder()
        .user_agent("sitegate/0.1")
        .timeout(backend_timeout)
        .build()
        .context("failed to build backend reqwest client")?;
    let http_client = reqwest::Client::builder()
        .user_agent("sitegate/0.1")
        .connect_timeout(backend_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("failed to build proxy reqwest client")?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Backend collaborators ----
    let backend = Arc::new(SupabaseBackend::from_config(&config.backend, backend_client)?);
    tracing::info!(backend_url = %backend.base_url(), "backend client initialised");

    // ---- Request gate ----
    let gate = RequestGate::new(
        &config,
        Collaborators {
            auth: backend.clone(),
            settings: backend.clone(),
            roles: backend.clone(),
        },
        build_pass_key(&config),
        Arc::new(SystemClock),
        Arc::clone(&metrics.metrics),
    );

    let access_code = read_secret_env(&config.gate.access_code_env);
    if access_code.is_none() {
        tracing::warn!(
            env_var = %config.gate.access_code_env,
            "no gate access code configured, gate passes cannot be issued"
        );
    }

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        gate: Arc::new(gate),
        metrics,
        http_client,
        settings: backend.clone(),
        backend_key: backend.anon_key().to_string(),
        access_code,
    };

    run_http_server(state).await?;

    tracing::info!("sitegate shut down cleanly");
    Ok(())
}
