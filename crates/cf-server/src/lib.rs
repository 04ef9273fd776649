//! cf-server: HTTP API for the clipforge orchestrator.
//!
//! - Nine multipart upload routes under `/api/video/{operation}`
//! - Job status, listing, cancellation and artifact lookup under `/api/jobs`
//! - SSE job events at `/api/events`
//! - Finished outputs served statically from `/output`
//! - Graceful shutdown that drains the orchestrator

pub mod context;
pub mod error;
pub mod middleware;
pub mod router;
pub mod routes;

use std::net::SocketAddr;

use cf_core::config::Config;
use tokio_util::sync::CancellationToken;

use crate::context::AppContext;

/// Start the clipforge server.
///
/// Discovers the engines, starts the orchestrator and serves the API until
/// a shutdown signal arrives, then drains the orchestrator within the
/// configured grace period.
pub async fn start(config: Config) -> cf_core::Result<()> {
    config.check()?;
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let tools = cf_av::ToolRegistry::discover(&config.tools);
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}; jobs needing it will fail", info.name);
        }
    }

    let ctx = AppContext::new(config.clone(), tools)?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| cf_core::Error::Internal(format!("Invalid server address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| cf_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;
    tracing::info!("Listening on {addr}");

    serve(listener, ctx, CancellationToken::new()).await?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Serve the API on `listener` until a signal arrives or `cancel` fires.
///
/// The orchestrator starts draining as soon as the signal arrives, alongside
/// the HTTP drain, so handlers waiting on a job see it reach a terminal state
/// within the shutdown grace period. Returns once both have finished.
pub async fn serve(
    listener: tokio::net::TcpListener,
    ctx: AppContext,
    cancel: CancellationToken,
) -> cf_core::Result<()> {
    let app = router::build_router(ctx.clone());
    let orchestrator = ctx.orchestrator.clone();
    let grace = ctx.config.orchestrator.shutdown_grace();
    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel();

    let signal = async move {
        shutdown_signal(cancel).await;
        let drain = tokio::spawn(async move { orchestrator.shutdown(grace).await });
        // The receiver lives until serve returns.
        let _ = drain_tx.send(drain);
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| cf_core::Error::Internal(format!("Server error: {e}")));

    if let Ok(drain) = drain_rx.await {
        if let Err(e) = drain.await {
            tracing::error!("Orchestrator drain failed: {e}");
        }
    }
    served
}

/// Wait for SIGINT, SIGTERM or `cancel`.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
