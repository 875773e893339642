pub mod app;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;

use futures::future::join_all;
use tracing::{debug, info};

use crate::app::build_app;
use crate::state::AppState;

pub async fn serve(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    serve_with_state(addr, AppState::default(), shutdown_signal()).await
}

/// Serve until `shutdown` resolves, then stop every remaining session.
pub async fn serve_with_state(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_app(state.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Playback API listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    let stopped = stop_all_sessions(&state).await;
    info!(count = stopped, "Sessions stopped");
    Ok(())
}

/// Stop and forget every session. Returns how many were stopped.
pub async fn stop_all_sessions(state: &AppState) -> usize {
    let handles: Vec<_> = state.sessions.iter().map(|e| e.value().clone()).collect();
    state.sessions.clear();

    let results = join_all(handles.iter().map(|h| h.stop())).await;
    for (handle, result) in handles.iter().zip(&results) {
        if result.is_err() {
            debug!(session_id = handle.id(), "Session already stopped");
        }
    }
    handles.len()
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Interrupted"),
        _ = terminate => info!("Terminated"),
    }
}
