//! Authenticated control surface for held packets.
//!
//! # Routes
//! - `GET  /admin/status`
//! - `GET  /admin/packets/held`
//! - `POST /admin/packets/{id}/resume`
//! - `POST /admin/packets/{id}/pause`

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::lifecycle::ShutdownSignal;
use crate::net::ProxyServer;
use self::auth::admin_auth_middleware;
use self::handlers::*;

/// Shared state behind every admin route.
#[derive(Clone)]
pub struct AdminState {
    pub server: ProxyServer,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/packets/held", get(get_held))
        .route("/admin/packets/{id}/resume", post(resume_packet))
        .route("/admin/packets/{id}/pause", post(pause_packet))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until shutdown.
pub async fn serve(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move { shutdown.recv().await })
        .await?;
    tracing::info!("Admin API stopped");
    Ok(())
}
