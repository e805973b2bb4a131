//! HTTP surface: a WebSocket upgrade route for signaling and a health probe.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::routing::get;
use axum::{Extension, Router};

use crate::directory::{Directory, Pairings};
use crate::relay::client_connected;

#[allow(clippy::unused_async)]
async fn health_handler() -> &'static str {
    "OK"
}

#[allow(clippy::unused_async)]
async fn signaling_handler(
    ws: WebSocketUpgrade,
    Extension(directory): Extension<Arc<Directory>>,
    Extension(pairings): Extension<Arc<Pairings>>,
) -> Response {
    ws.on_upgrade(move |socket| client_connected(socket, directory, pairings))
}

/// Build the application router with a fresh directory and pairing table.
pub fn create_router() -> Router {
    let directory = Arc::new(Directory::default());
    let pairings = Arc::new(Pairings::default());
    Router::new()
        .route("/health", get(health_handler))
        .route("/one-to-one", get(signaling_handler))
        .layer(Extension(directory))
        .layer(Extension(pairings))
}
