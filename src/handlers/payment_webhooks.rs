use axum::{
    extract::State,
    http::HeaderMap,
    response::Response,
    routing::post,
    Router,
};
use bytes::Bytes;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, warn};

use super::common::success_response;
use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::webhooks::{
    verify_signature, StripeEvent, WebhookDispatcher, MAX_WEBHOOK_BODY_BYTES, SIGNATURE_HEADER,
};

// POST /api/payments/webhook
#[utoipa::path(
    post,
    path = "/api/payments/webhook",
    request_body(content = String, description = "Raw Stripe event JSON", content_type = "application/json"),
    params(("Stripe-Signature" = String, Header, description = "t=<timestamp>,v1=<hex hmac>")),
    responses(
        (status = 200, description = "Webhook accepted"),
        (status = 400, description = "Missing secret, invalid signature or payload", body = crate::errors::ErrorResponse),
        (status = 413, description = "Payload too large")
    ),
    tag = "Payments"
)]
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServiceError> {
    let secret = state
        .config
        .stripe_webhook_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            warn!("Webhook received but no webhook secret is configured");
            ServiceError::InvalidSignature("webhook secret not configured".to_string())
        })?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ServiceError::InvalidSignature("missing Stripe-Signature header".to_string())
        })?;

    if let Err(e) = verify_signature(
        &body,
        signature,
        secret,
        state.config.webhook_tolerance_secs,
        chrono::Utc::now().timestamp(),
    ) {
        warn!("Payment webhook signature verification failed: {}", e);
        return Err(e);
    }

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid webhook payload: {}", e)))?;

    let disposition = WebhookDispatcher::new(state.store.clone())
        .dispatch(&event)
        .await;
    debug!(event_id = %event.id, ?disposition, "Webhook processed");

    Ok(success_response(json!({ "status": "success" })))
}

/// The webhook route with its body size cap.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route(
        "/webhook",
        post(stripe_webhook).layer(RequestBodyLimitLayer::new(MAX_WEBHOOK_BODY_BYTES)),
    )
}
