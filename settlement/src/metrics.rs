//! Business metrics for the settlement engine.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `raffle_tickets_issued_total` - Tickets issued by purchases and settlements
//! - `raffle_payment_intents_total{payment_type}` - Intents created
//! - `raffle_settlements_total{outcome}` - Webhook outcomes (settled, duplicate, rejected, ...)
//! - `raffle_webhook_rejections_total{reason}` - Webhooks refused before any state change
//! - `raffle_refunds_total` / `raffle_refunded_cents_total` - Confirmed refunds
//! - `raffle_points_earned_total` / `raffle_points_redeemed_total` - Points movements
//! - `raffle_transaction_downgrades_total` - Coordinator fell back to sequential writes

use metrics::describe_counter;

/// Initialize and register all business metrics descriptions.
///
/// This should be called once at application startup, before any metrics are recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "raffle_tickets_issued_total",
        "Total number of tickets issued"
    );
    describe_counter!(
        "raffle_payment_intents_total",
        "Total number of payment intents created by payment type"
    );
    describe_counter!(
        "raffle_settlements_total",
        "Total number of gateway callbacks handled by outcome"
    );
    describe_counter!(
        "raffle_webhook_rejections_total",
        "Total number of webhooks rejected before processing"
    );
    describe_counter!("raffle_refunds_total", "Total number of confirmed refunds");
    describe_counter!(
        "raffle_refunded_cents_total",
        "Total amount refunded in cents"
    );
    describe_counter!(
        "raffle_points_earned_total",
        "Total loyalty points credited"
    );
    describe_counter!(
        "raffle_points_redeemed_total",
        "Total loyalty points redeemed at checkout"
    );
    describe_counter!(
        "raffle_transaction_downgrades_total",
        "Times the coordinator downgraded to non-transactional writes"
    );

    tracing::info!("Business metrics registered");
}

/// Record tickets issued for one competition.
pub fn record_tickets_issued(quantity: u32) {
    metrics::counter!("raffle_tickets_issued_total").increment(u64::from(quantity));
}

/// Record a payment intent created.
pub fn record_intent_created(payment_type: &'static str) {
    metrics::counter!("raffle_payment_intents_total", "payment_type" => payment_type).increment(1);
}

/// Record a webhook outcome.
pub fn record_settlement(outcome: &'static str) {
    metrics::counter!("raffle_settlements_total", "outcome" => outcome).increment(1);
    tracing::debug!(outcome, "Recorded settlement metric");
}

/// Record a webhook refused before processing.
pub fn record_webhook_rejected(reason: &'static str) {
    metrics::counter!("raffle_webhook_rejections_total", "reason" => reason).increment(1);
}

/// Record a confirmed refund.
pub fn record_refund(amount_cents: u64) {
    metrics::counter!("raffle_refunds_total").increment(1);
    metrics::counter!("raffle_refunded_cents_total").increment(amount_cents);
}

/// Record points credited.
pub fn record_points_earned(points: u64) {
    metrics::counter!("raffle_points_earned_total").increment(points);
}

/// Record points redeemed.
pub fn record_points_redeemed(points: u64) {
    metrics::counter!("raffle_points_redeemed_total").increment(points);
}

/// Record a coordinator downgrade.
pub fn record_transaction_downgrade(unit: &'static str) {
    metrics::counter!("raffle_transaction_downgrades_total", "unit" => unit).increment(1);
}
