pub mod integration;
pub mod webhooks;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/webhooks", webhooks::router())
        .nest("/admin/integration", integration::router())
}
