//! Purchase and cart endpoints.
//!
//! - POST /api/competitions/:id/purchase - Buy tickets directly
//! - PUT /api/cart/:competition_id - Set a cart line

use super::error::AppError;
use super::extractors::CurrentUser;
use crate::purchase::PurchaseReceipt;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use raffle_core::types::CompetitionId;
use serde::Deserialize;

/// Body carrying a ticket quantity.
#[derive(Debug, Deserialize)]
pub struct QuantityRequest {
    /// Number of tickets
    pub quantity: u32,
}

/// Buy tickets in a competition without going through the gateway.
///
/// # Example
///
/// ```bash
/// curl -X POST http://localhost:8080/api/competitions/<id>/purchase \
///   -H "X-User-Id: 550e8400-e29b-41d4-a716-446655440000" \
///   -H "Content-Type: application/json" \
///   -d '{"quantity": 2}'
/// ```
///
/// # Errors
///
/// 422 for validation failures, 404 for unknown competitions.
pub async fn purchase_tickets(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(competition_id): Path<CompetitionId>,
    Json(request): Json<QuantityRequest>,
) -> Result<(StatusCode, Json<PurchaseReceipt>), AppError> {
    let receipt = state
        .engine
        .purchase_ticket(user_id, competition_id, request.quantity)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// Set the quantity of a cart line. Zero removes it.
///
/// # Errors
///
/// 404 for unknown competitions.
pub async fn put_cart_line(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(competition_id): Path<CompetitionId>,
    Json(request): Json<QuantityRequest>,
) -> Result<StatusCode, AppError> {
    state
        .engine
        .set_cart_quantity(user_id, competition_id, request.quantity)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
