//! Secondary HTTP status/override surface, reusing the teacher's
//! `AppState`/`CorsLayer` axum wiring. The CLI remains the primary operator
//! interface per §6; this router exists for lightweight remote polling.

mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::controller::Controller;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
}

pub async fn start_server(controller: Arc<Controller>, addr: &str) -> std::io::Result<()> {
    let state = AppState { controller };
    let app = Router::new()
        .route("/status", get(handlers::get_status))
        .route("/override", post(handlers::post_override))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status server listening");
    axum::serve(listener, app).await
}
