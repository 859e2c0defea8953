/*
 * 5D Labs Agent Platform - Cluster Agent
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Cluster Agent - keeps in-cluster state in sync with the console
//!
//! This service:
//! - Polls the console for the objects managed in this cluster
//! - Listens for push events on the console websocket
//! - Reconciles each object into the cluster through per-domain controllers
//! - Serves liveness and readiness probes

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use cluster_agent::namespaces::{self, NamespaceReconciler};
use cluster_agent::{AgentConfig, Manager};
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cluster-agent", version, about = "Console cluster agent")]
struct Args {
    /// ID of this cluster in the console
    #[arg(long, env = "CLUSTER_ID")]
    cluster_id: String,

    /// Console base URL
    #[arg(long, env = "CONSOLE_URL")]
    console_url: String,

    /// Deploy token used for both the API and the websocket
    #[arg(long, env = "DEPLOY_TOKEN", hide_env_values = true)]
    deploy_token: String,

    /// Path to the agent configuration file
    #[arg(long, env = "AGENT_CONFIG_PATH", default_value = "/config/config.yaml")]
    config: PathBuf,

    /// Address for the health check server
    #[arg(long, env = "PROBE_ADDR", default_value = "0.0.0.0:9001")]
    probe_addr: SocketAddr,

    #[arg(long)]
    max_concurrent_reconciles: Option<usize>,

    /// Default poll interval in seconds
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Maximum poll jitter in seconds
    #[arg(long)]
    poll_jitter: Option<u64>,

    /// Cache TTL in seconds
    #[arg(long)]
    refresh_interval: Option<u64>,

    /// Emit JSON logs
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Cluster Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;

    let kube = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let manager = config
        .apply(Manager::builder())
        .console_client_args(&args.console_url, &args.deploy_token)
        .socket_args(&args.cluster_id, &args.console_url, &args.deploy_token)
        .build()
        .context("failed to build controller manager")?;
    let manager = Arc::new(manager);

    let console = manager
        .client()
        .cloned()
        .context("console client is not configured")?;
    let refresh = config.refresh_interval();
    let page_size = config.page_size;
    manager.add_reconciler_or_die(namespaces::IDENTIFIER, || {
        Ok(NamespaceReconciler::new(console, kube, refresh, page_size))
    });

    let token = CancellationToken::new();
    manager.start(token.clone())?;

    let state = AppState {
        manager: Arc::clone(&manager),
    };
    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.probe_addr).await?;
    info!("Probe server listening on {}", args.probe_addr);

    let stopped = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                () = shutdown_signal() => {},
                () = stopped.cancelled() => {
                    error!("Controller manager stopped on its own, shutting down");
                },
            }
        })
        .await?;

    token.cancel();
    // re-raises an unrecovered controller panic, failing the process
    manager.wait().await;
    info!("Cluster agent stopped");

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cluster_agent=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Mounted file first (defaults when absent), then command-line overrides.
fn load_config(args: &Args) -> anyhow::Result<AgentConfig> {
    let mut config = if args.config.exists() {
        let config = AgentConfig::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?;
        info!("Loaded agent configuration from {}", args.config.display());
        config
    } else {
        warn!(
            "Configuration file {} not found. Using defaults.",
            args.config.display()
        );
        AgentConfig::default()
    };

    if let Some(workers) = args.max_concurrent_reconciles {
        config.max_concurrent_reconciles = workers;
    }
    if let Some(seconds) = args.poll_interval {
        config.poll_interval_seconds = seconds;
    }
    if let Some(seconds) = args.poll_jitter {
        config.poll_jitter_seconds = seconds;
    }
    if let Some(seconds) = args.refresh_interval {
        config.refresh_interval_seconds = seconds;
    }

    config.validate()?;
    Ok(config)
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (code, status) = if state.manager.is_faulted() {
        (StatusCode::SERVICE_UNAVAILABLE, "faulted")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        code,
        Json(json!({
            "status": status,
            "service": "cluster-agent",
            "version": env!("CARGO_PKG_VERSION"),
            "controllers": state.manager.health(),
        })),
    )
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.manager.is_started() || state.manager.is_faulted() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({
        "status": "ready",
        "service": "cluster-agent",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
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
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
