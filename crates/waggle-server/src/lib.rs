pub mod routes;
mod retry;
mod signature;
mod state;
mod webhook;

use anyhow::Result;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use retry::with_retry;
pub use signature::{sign, verify_signature};
pub use state::AppState;
pub use webhook::WebhookHandler;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api/v1", routes::api_router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("waggle-server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
