use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use waggle_schema::WebhookEvent;

use crate::signature::verify_signature;
use crate::state::AppState;
use crate::webhook::WebhookHandler;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/whatsapp", post(whatsapp_webhook))
        .route("/whatsapp/health", get(webhook_health))
}

/// Receive webhook events from the WhatsApp bridge.
///
/// When a webhook secret is configured the raw body must carry a valid
/// HMAC signature. Downstream failures never produce a 5xx: the bridge
/// would only retry redundantly, so errors ride back in a 200 body.
async fn whatsapp_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if let Some(secret) = &state.settings.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|value| value.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            return Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": "Invalid webhook signature"})),
            ));
        }
    }

    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": format!("invalid webhook payload: {e}")})),
            ))
        }
    };

    let mut handler = WebhookHandler::new(
        state.store.clone(),
        state.agent.clone(),
        state.settings.system_number.clone(),
    );
    if let Some(delivery) = &state.delivery {
        handler = handler.with_delivery(delivery.clone());
    }
    Ok(Json(handler.handle(event).await))
}

async fn webhook_health() -> Json<Value> {
    Json(json!({"status": "healthy", "service": "webhook_handler"}))
}
