use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use bytes::Bytes;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::{errors::ServiceError, gateway::WEBHOOK_SIGNATURE_HEADER, AppState};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub success: bool,
    #[schema(example = "Webhook processed successfully")]
    pub message: String,
}

// POST /api/v1/gateway/webhook
/// Verify and acknowledge a processor callback. The payload is logged but
/// does not change any transaction or payment.
#[utoipa::path(
    post,
    path = "/api/v1/gateway/webhook",
    request_body = String,
    params(
        ("x-gateway-signature" = String, Header, description = "Hex HMAC-SHA256 of the raw body keyed with the integrity secret")
    ),
    responses(
        (status = 200, description = "Webhook accepted", body = WebhookAck),
        (status = 400, description = "Missing signature or invalid payload", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse)
    ),
    tag = "Gateway"
)]
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ServiceError> {
    let signature = headers
        .get(WEBHOOK_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            warn!("gateway webhook without signature");
            ServiceError::BadRequest("Missing webhook signature".to_string())
        })?;

    if !state.gateway.verify_webhook_signature(&body, signature) {
        warn!("gateway webhook signature verification failed");
        counter!("checkout.webhooks.rejected", 1);
        return Err(ServiceError::Unauthorized(
            "Invalid webhook signature".to_string(),
        ));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?;

    let event = payload.get("event").and_then(Value::as_str).unwrap_or("");
    let transaction = payload.pointer("/data/transaction");
    let reference = transaction
        .and_then(|t| t.get("reference"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let status = transaction
        .and_then(|t| t.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("");

    info!(event, reference, status, "gateway webhook received");
    counter!("checkout.webhooks.accepted", 1);

    Ok(Json(WebhookAck {
        success: true,
        message: "Webhook processed successfully".to_string(),
    }))
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook", post(gateway_webhook))
}
