//! Gateway webhook receiver.
//!
//! POST /api/webhooks/gateway with the raw body and a `Gateway-Signature`
//! header. The body must reach verification byte for byte, so it is taken
//! as [`Bytes`] rather than parsed JSON.

use super::error::AppError;
use crate::server::state::AppState;
use crate::settlement::SettlementOutcome;
use axum::{Json, body::Bytes, extract::State, http::HeaderMap};

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "Gateway-Signature";

/// Receive a gateway callback.
///
/// Every authenticated event is acknowledged with 200, including duplicates,
/// stale transitions and rejected settlements, so the gateway does not
/// redeliver them.
///
/// # Errors
///
/// 401 for bad signatures, 422 for malformed bodies, 404 for unknown
/// intents, 5xx when the gateway should retry.
pub async fn receive_gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SettlementOutcome>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let outcome = state.engine.handle_webhook(&body, signature).await?;
    Ok(Json(outcome))
}
