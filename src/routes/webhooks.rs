use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};

use crate::{
    dto::webhooks::WebhookAck,
    error::AppResult,
    response::ApiResponse,
    services::webhook_service,
    state::AppState,
};

/// Header the gateway signs the raw body into.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub fn router() -> Router<AppState> {
    Router::new().route("/payment", post(payment_webhook))
}

/// Unauthenticated callback from the payment gateway. Verification happens
/// against the raw bytes, so the body must not be deserialized before the
/// signature check.
#[utoipa::path(
    post,
    path = "/api/webhooks/payment",
    request_body(content = Vec<u8>, content_type = "application/json"),
    responses(
        (status = 200, description = "Processed (including idempotent no-ops)", body = ApiResponse<WebhookAck>),
        (status = 400, description = "Malformed event"),
        (status = 401, description = "Bad or missing signature"),
    ),
    tag = "Webhooks"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<ApiResponse<WebhookAck>>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let resp = webhook_service::handle_webhook(&state, &body, signature).await?;
    Ok(Json(resp))
}
