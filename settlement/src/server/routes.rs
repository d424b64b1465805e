//! Router configuration for the settlement server.

use super::health::{health_check, readiness_check};
use super::state::AppState;
use crate::api::{payments, purchases, webhooks};
use axum::{
    Router,
    routing::{get, post, put},
};
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
///
/// Health checks sit at the root; everything else is nested under `/api`.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Direct purchase and cart
        .route(
            "/competitions/:id/purchase",
            post(purchases::purchase_tickets),
        )
        .route("/cart/:competition_id", put(purchases::put_cart_line))
        // Payments
        .route(
            "/payments/intents/single",
            post(payments::create_single_intent),
        )
        .route(
            "/payments/intents/checkout",
            post(payments::create_checkout_intent),
        )
        .route("/payments/:id", get(payments::get_payment))
        .route("/payments/:id/refund", post(payments::refund_payment))
        .route("/payments/:id/retry", post(payments::retry_payment))
        // Gateway callbacks
        .route(
            "/webhooks/gateway",
            post(webhooks::receive_gateway_webhook),
        );

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
