//! Telegram webhook ingress: POST /telegram/{token}/webhook.
//!
//! Telegram redelivers any update answered with a non-2xx status, which would
//! stall the chat behind one bad message. Every response is therefore 200;
//! the real outcome travels in the `x-original-status` header and the logs.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use relay_telegram::{Outcome, Reply, Update};

use crate::app::AppState;

pub const ORIGINAL_STATUS: HeaderName = HeaderName::from_static("x-original-status");

/// POST /telegram/{token}/webhook
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    body: Bytes,
) -> Response {
    if !state.config.telegram.is_known_token(&token) {
        warn!("webhook for unknown bot token");
        return respond(
            StatusCode::NOT_FOUND,
            json!({"error": "UNKNOWN_BOT", "message": "Unknown bot token"}),
        );
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!(error = %e, "invalid webhook payload");
            return respond(
                StatusCode::BAD_REQUEST,
                json!({"error": "INVALID_PAYLOAD", "message": e.to_string()}),
            );
        }
    };
    let update_id = update.update_id;
    debug!(update_id, bytes = body.len(), "telegram update arrived");

    let messenger = state.messenger(&token);
    match state.pipeline.handle_update(&token, update, messenger).await {
        Outcome::Stop(reply) => {
            info!(update_id, ?reply, "update handled");
            let message_id = match reply {
                Reply::Delivered { message_id } => Some(message_id),
                Reply::Text(_) | Reply::Silent => None,
            };
            respond(StatusCode::OK, json!({"ok": true, "message_id": message_id}))
        }
        Outcome::Fail(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": e.code(), "message": e.to_string()}),
        ),
        Outcome::Continue => respond(StatusCode::OK, json!({"ok": true})),
    }
}

/// Always 200, with the status the request really deserved in a header.
fn respond(original: StatusCode, body: Value) -> Response {
    let mut resp = (StatusCode::OK, Json(body)).into_response();
    resp.headers_mut()
        .insert(ORIGINAL_STATUS, HeaderValue::from(original.as_u16()));
    resp
}
