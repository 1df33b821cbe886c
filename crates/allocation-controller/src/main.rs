//! Allocation Controller
//!
//! Real-time first-come-first-served resource allocation over WebSockets.
//!
//! # Servers
//!
//! - HTTP server for the claimant WebSocket and operator endpoints
//!   (default: 0.0.0.0:8080)
//! - HTTP server for health probes and Prometheus metrics
//!   (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Load and validate the locations and claimants documents
//! 4. Spawn the admission pipeline (`SessionActor`) and build the scheduler
//! 5. Start the health HTTP server (liveness, readiness, metrics)
//! 6. Start the API HTTP server
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use allocation_controller::catalog::Catalog;
use allocation_controller::config::Config;
use allocation_controller::observability::{health_router, HealthState};
use allocation_controller::server::{api_router, AppState};
use allocation_controller::session::{
    AllocationState, ConnectionRegistry, SessionActor, SessionScheduler,
};
use anyhow::Context;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "allocation_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Allocation Controller");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        api_bind_address = %config.api_bind_address,
        health_bind_address = %config.health_bind_address,
        start_time = %config.start_time.to_rfc3339(),
        countdown_seconds = config.countdown_seconds,
        global_cap = config.global_cap,
        off_home_cap = config.off_home_cap,
        home_location = %config.home_location,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder before any metrics are recorded
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus metrics recorder")?;

    // Initialize health state
    let health_state = Arc::new(HealthState::new());

    // Load and validate the boot catalog; any inconsistency is fatal here,
    // before a single connection is accepted.
    let catalog = Catalog::load(
        &config.locations_path,
        &config.claimants_path,
        &config.home_location,
    )
    .map_err(|e| {
        error!(error = %e, "Failed to load catalog");
        e
    })?;
    info!(
        locations = catalog.locations.len(),
        resources = catalog.resource_count(),
        claimants = catalog.claimants.len(),
        "Catalog loaded"
    );

    let claimants: HashMap<String, String> = catalog
        .claimants
        .iter()
        .map(|c| (c.token.clone(), c.display_name.clone()))
        .collect();

    // Spawn the admission pipeline
    let shutdown_token = CancellationToken::new();
    let registry = Arc::new(ConnectionRegistry::new());
    let allocation_state = AllocationState::from_catalog(
        &catalog,
        config.global_cap,
        config.off_home_cap,
        &config.home_location,
    );
    let (session, _pipeline_task) = SessionActor::spawn(
        allocation_state,
        Arc::clone(&registry),
        shutdown_token.child_token(),
    );
    let scheduler = SessionScheduler::new(
        session.clone(),
        Arc::clone(&registry),
        config.start_time,
        config.countdown_seconds,
        shutdown_token.child_token(),
    );

    // Start the health HTTP server (liveness, readiness, metrics)
    let health_addr: SocketAddr = config
        .health_bind_address
        .parse()
        .with_context(|| format!("Invalid health bind address {}", config.health_bind_address))?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener before spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .with_context(|| format!("Failed to bind health server to {health_addr}"))?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start the API HTTP server
    let api_addr: SocketAddr = config
        .api_bind_address
        .parse()
        .with_context(|| format!("Invalid API bind address {}", config.api_bind_address))?;

    let app = api_router(AppState {
        session,
        registry,
        scheduler,
        claimants: Arc::new(claimants),
    });

    let api_listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("Failed to bind API server to {api_addr}"))?;

    let api_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %api_addr, "API server starting");
        let server = axum::serve(api_listener, app).with_graceful_shutdown(async move {
            api_shutdown_token.cancelled().await;
            info!("API server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "API server failed");
        }
    });

    health_state.set_ready();
    info!("Allocation Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    shutdown_token.cancel();

    // Give tasks time to shut down
    tokio::time::sleep(Duration::from_secs(2)).await;

    info!("Allocation Controller shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
