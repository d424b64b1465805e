//! Payment endpoints.
//!
//! - POST /api/payments/intents/single - Intent for one competition
//! - POST /api/payments/intents/checkout - Intent for the cart
//! - GET /api/payments/:intent_id - Poll status (owner only)
//! - POST /api/payments/:id/refund - Refund a succeeded payment
//! - POST /api/payments/:id/retry - Reopen a failed payment
//!
//! # Payment Flow
//!
//! 1. Client creates an intent and receives a `client_secret`
//! 2. Client completes payment with the gateway directly
//! 3. Gateway calls the webhook; tickets are issued once
//! 4. Client polls the status endpoint for ticket numbers

use super::error::AppError;
use super::extractors::CurrentUser;
use crate::purchase::IntentReceipt;
use crate::refund::{RefundReceipt, RetryReceipt};
use crate::server::state::AppState;
use crate::settlement::PaymentView;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use raffle_core::types::{CompetitionId, IntentId, Money, PaymentId};
use serde::Deserialize;

/// Request for a single-competition intent.
#[derive(Debug, Deserialize)]
pub struct SingleIntentRequest {
    /// Competition to buy into
    pub competition_id: CompetitionId,
    /// Number of tickets
    pub quantity: u32,
}

/// Request for a cart checkout intent.
#[derive(Debug, Default, Deserialize)]
pub struct CheckoutIntentRequest {
    /// Points to redeem against the cart
    #[serde(default)]
    pub points_to_redeem: Option<u64>,
}

/// Request to refund a payment.
#[derive(Debug, Deserialize)]
pub struct RefundPaymentRequest {
    /// Refund reason
    pub reason: String,
    /// Amount in cents (if None, full refund)
    #[serde(default)]
    pub amount_cents: Option<u64>,
    /// Must be set to refund less than the full amount
    #[serde(default)]
    pub partial: bool,
}

/// Create a payment intent for tickets in one competition.
///
/// # Example
///
/// ```bash
/// curl -X POST http://localhost:8080/api/payments/intents/single \
///   -H "X-User-Id: 550e8400-e29b-41d4-a716-446655440000" \
///   -H "Content-Type: application/json" \
///   -d '{"competition_id": "660e8400-e29b-41d4-a716-446655440001", "quantity": 3}'
/// ```
///
/// # Errors
///
/// 422 for validation failures, 404 for unknown competitions.
pub async fn create_single_intent(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<SingleIntentRequest>,
) -> Result<(StatusCode, Json<IntentReceipt>), AppError> {
    let receipt = state
        .engine
        .create_single_intent(user_id, request.competition_id, request.quantity)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// Create a payment intent for the caller's cart.
///
/// # Errors
///
/// 422 for an empty cart, a bad redemption or a charge below the minimum.
pub async fn create_checkout_intent(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(request): Json<CheckoutIntentRequest>,
) -> Result<(StatusCode, Json<IntentReceipt>), AppError> {
    let receipt = state
        .engine
        .create_checkout_intent(user_id, request.points_to_redeem)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// Payment status for the owning user.
///
/// # Errors
///
/// 404 for unknown intents and for other users' payments.
pub async fn get_payment(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(intent_id): Path<String>,
) -> Result<Json<PaymentView>, AppError> {
    let view = state
        .engine
        .get_payment_status(&IntentId::new(intent_id), user_id)
        .await?;
    Ok(Json(view))
}

/// Refund a succeeded payment.
///
/// Access control for operators sits in front of this service.
///
/// # Errors
///
/// 409 unless the payment succeeded, 422 for bad amounts.
pub async fn refund_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<PaymentId>,
    Json(request): Json<RefundPaymentRequest>,
) -> Result<Json<RefundReceipt>, AppError> {
    let receipt = state
        .engine
        .refund_payment(
            payment_id,
            request.reason,
            request.amount_cents.map(Money::from_cents),
            request.partial,
        )
        .await?;
    Ok(Json(receipt))
}

/// Reopen a failed payment.
///
/// # Errors
///
/// 409 unless the payment failed.
pub async fn retry_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<PaymentId>,
) -> Result<Json<RetryReceipt>, AppError> {
    let receipt = state.engine.retry_payment(payment_id).await?;
    Ok(Json(receipt))
}
