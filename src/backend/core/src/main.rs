//! Lingua Server - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;

use lingua_core::{
    api::{self, AppState},
    config::Config,
    db::Database,
    middleware::auth::{AuthConfig, AuthLayer},
    rbac::{PgStore, Rbac},
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load()?;

    let metrics = telemetry::init_telemetry(&config.observability, &config.rbac.service)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.rbac.service,
        "Starting Lingua Server"
    );

    let db = Database::new(&config.database).await?;
    db.startup_validation(config.database.auto_migrate).await?;
    tracing::info!("Database ready");

    // Roles and rules must be loaded before any route is declared.
    let rbac = Rbac::new(config.rbac.clone(), Arc::new(PgStore::new(db.pool().clone())))?;
    let init = rbac.init().await?;
    tracing::info!(
        roles = init.roles,
        roles_created = init.roles_created.len(),
        rules = init.registry.persisted,
        "RBAC loaded"
    );

    let auth = AuthLayer::from_config(AuthConfig::from(&config.auth))?;
    let state = AppState::new(rbac.clone(), metrics, Some(db.clone()));
    let app = api::build_router(state, auth);
    tracing::info!(routes = rbac.registry().fresh_count(), "Routes declared");

    if config.rbac.sync_on_startup {
        match rbac.synchronize().await {
            Ok(report) if report.is_complete() => {
                tracing::info!(
                    created = report.created,
                    moved = report.moved,
                    deleted = report.obsolete_deleted,
                    "Startup synchronization complete"
                );
            }
            Ok(report) => {
                tracing::warn!(
                    failures = report.failures.len(),
                    sweep_errors = report.sweep_errors.len(),
                    "Startup synchronization finished with failures"
                );
            }
            // The previous rule set stays in force.
            Err(e) => tracing::error!(error = %e, "Startup synchronization failed"),
        }
    }

    let addr: SocketAddr = config.bind_address().parse()?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    db.close().await;
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
