//! Payment settlement: signed gateway callbacks to exactly-once issuance.
//!
//! A `succeeded` callback turns a pending payment into tickets, inventory,
//! points and a cleared cart. The `tickets_created` flag on the payment row
//! is the idempotency guard: it is written last, in the same unit as
//! everything it guards, and a payment that carries it is never issued
//! again.
//!
//! # Signatures
//!
//! ```text
//! Gateway-Signature: t=1735689600,v1=<hex HMAC-SHA256(secret, "1735689600.<raw body>")>
//! ```

use crate::app::SettlementEngine;
use crate::coordinator::UnitOfWork;
use crate::error::{Result, SettlementError};
use crate::metrics;
use crate::points;
use crate::purchase::{IssueRequest, TicketIssuer};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use raffle_core::ledger::LedgerSession;
use raffle_core::types::{
    IntentId, Money, Payment, PaymentId, PaymentStatus, PurchaseShape, TicketId, TicketNumber,
    UserId,
};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashSet;

type HmacSha256 = Hmac<Sha256>;

/// Verifies `t=<unix seconds>,v1=<hex>` webhook signatures.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance_secs: u64,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("tolerance_secs", &self.tolerance_secs)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    /// Verifier for `secret`, accepting timestamps within `tolerance_secs` of now.
    #[must_use]
    pub fn new(secret: &str, tolerance_secs: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            tolerance_secs,
        }
    }

    /// Produce a signature header for `body` at `timestamp`.
    ///
    /// # Errors
    ///
    /// [`SettlementError::InvalidSignature`] if the secret cannot key the MAC.
    pub fn sign(&self, body: &[u8], timestamp: i64) -> Result<String> {
        let mac = self.mac(body, timestamp)?.finalize().into_bytes();
        Ok(format!("t={timestamp},v1={}", hex::encode(mac)))
    }

    /// Check `header` against `body`.
    ///
    /// # Errors
    ///
    /// [`SettlementError::InvalidSignature`] if the header is missing a part,
    /// the timestamp is outside the tolerance, or no `v1` signature matches.
    pub fn verify(&self, header: &str, body: &[u8], now: DateTime<Utc>) -> Result<()> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| SettlementError::InvalidSignature("missing timestamp".into()))?;
        if signatures.is_empty() {
            return Err(SettlementError::InvalidSignature("missing v1 signature".into()));
        }
        if now.timestamp().abs_diff(timestamp) > self.tolerance_secs {
            return Err(SettlementError::InvalidSignature(
                "timestamp outside tolerance".into(),
            ));
        }

        let expected = self.mac(body, timestamp)?;
        let valid = signatures.iter().any(|signature| {
            hex::decode(signature)
                .map(|bytes| expected.clone().verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });
        if valid {
            Ok(())
        } else {
            Err(SettlementError::InvalidSignature("signature mismatch".into()))
        }
    }

    fn mac(&self, body: &[u8], timestamp: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| SettlementError::InvalidSignature(format!("unusable secret: {err}")))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }
}

/// Decoded webhook body.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GatewayEvent {
    /// `processing`, `succeeded`, `failed` or `canceled`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Payment the event refers to
    pub intent_id: IntentId,
    /// Raw gateway object, stored for audit
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl GatewayEvent {
    /// Failure reason from `payload.reason` or `payload.last_payment_error.message`.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        self.payload
            .get("reason")
            .and_then(serde_json::Value::as_str)
            .or_else(|| {
                self.payload
                    .pointer("/last_payment_error/message")
                    .and_then(serde_json::Value::as_str)
            })
            .map(str::to_string)
    }
}

/// What a callback did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// Tickets issued
    Settled {
        /// New tickets
        ticket_ids: Vec<TicketId>,
    },
    /// Duplicate delivery; nothing changed
    AlreadySettled {
        /// Tickets from the original settlement
        ticket_ids: Vec<TicketId>,
    },
    /// Status moved without issuance
    StatusUpdated {
        /// New status
        status: PaymentStatus,
    },
    /// Money captured but issuance refused; flagged for refund
    Rejected {
        /// Why issuance was refused
        reason: String,
    },
    /// Acknowledged without effect
    Ignored {
        /// Why nothing happened
        reason: String,
    },
}

impl SettlementOutcome {
    /// Metric label
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Settled { .. } => "settled",
            Self::AlreadySettled { .. } => "duplicate",
            Self::StatusUpdated { .. } => "status_updated",
            Self::Rejected { .. } => "rejected",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// Client-facing view of a payment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentView {
    /// Payment id
    pub payment_id: PaymentId,
    /// Gateway correlation key
    pub intent_id: IntentId,
    /// Lifecycle status
    pub status: PaymentStatus,
    /// `single_purchase` or `cart_checkout`
    pub payment_type: String,
    /// Amount charged
    pub amount: Money,
    /// Whether tickets were issued
    pub tickets_created: bool,
    /// Issued ticket numbers
    pub ticket_numbers: Vec<TicketNumber>,
    /// Failure or rejection reason
    pub failure_reason: Option<String>,
    /// Amount refunded, if any
    pub refund_amount: Option<Money>,
}

struct SettleSucceeded<'a> {
    issuer: TicketIssuer<'a>,
    intent_id: IntentId,
    payload: serde_json::Value,
}

impl UnitOfWork for SettleSucceeded<'_> {
    type Output = SettlementOutcome;

    fn name(&self) -> &'static str {
        "settle_payment"
    }

    fn run<'a>(
        &'a self,
        session: &'a mut dyn LedgerSession,
    ) -> BoxFuture<'a, Result<SettlementOutcome>> {
        Box::pin(async move {
            let mut payment = session
                .payment_by_intent(self.intent_id.clone())
                .await?
                .ok_or(SettlementError::PaymentNotFound)?;

            if payment.tickets_created {
                return Ok(SettlementOutcome::AlreadySettled {
                    ticket_ids: payment.ticket_ids,
                });
            }
            if payment.status.is_terminal() {
                return Ok(SettlementOutcome::Ignored {
                    reason: format!("payment is {}", payment.status),
                });
            }

            let now = self.issuer.now;
            if payment.status != PaymentStatus::Succeeded {
                payment.transition_to(PaymentStatus::Succeeded, now);
            }
            payment.gateway_payload = Some(self.payload.clone());

            let ticket_ids = issue_purchase(session, &self.issuer, &payment).await?;

            payment.tickets_created = true;
            payment.ticket_ids.clone_from(&ticket_ids);
            payment.failure_reason = None;
            payment.updated_at = now;
            session.save_payment(payment).await?;

            Ok(SettlementOutcome::Settled { ticket_ids })
        })
    }
}

/// Issue everything a payment's stored shape buys.
///
/// Write order is inventory and tickets per line, then lifetime spend and
/// points, then the cart. The caller writes the payment row last.
async fn issue_purchase(
    session: &mut dyn LedgerSession,
    issuer: &TicketIssuer<'_>,
    payment: &Payment,
) -> Result<Vec<TicketId>> {
    let settings = session.points_settings().await?;
    let mut reserved = HashSet::new();
    let mut ticket_ids = Vec::new();
    let mut lines = Vec::new();

    for line in payment.purchase.lines() {
        let issued = issuer
            .issue(
                session,
                &IssueRequest {
                    user_id: payment.user_id,
                    competition_id: line.competition_id,
                    quantity: line.quantity,
                    unit_price: Some(line.unit_price),
                    payment_id: Some(payment.id),
                },
                &mut reserved,
            )
            .await?;
        ticket_ids.extend(issued.tickets.iter().map(|ticket| ticket.id));
        lines.push(issued);
    }

    points::record_spend(session, payment.user_id, payment.amount).await?;
    match &payment.purchase {
        PurchaseShape::Single(_) => {
            let earned = points::points_for_spend(payment.amount, &settings);
            let description = lines.first().map_or_else(
                || "Ticket purchase".to_string(),
                |line| format!("Purchased {} tickets for {}", line.tickets.len(), line.title),
            );
            points::earn(
                session,
                payment.user_id,
                earned,
                description,
                Some(payment.id),
                issuer.now,
            )
            .await?;
        }
        PurchaseShape::Cart {
            items,
            cart_total,
            points_redeemed,
            discount,
        } => {
            for line in &lines {
                let spend = points::prorated_spend(line.subtotal(), *discount, *cart_total);
                points::earn(
                    session,
                    payment.user_id,
                    points::points_for_spend(spend, &settings),
                    format!("Purchased {} tickets for {}", line.tickets.len(), line.title),
                    Some(payment.id),
                    issuer.now,
                )
                .await?;
            }
            points::redeem(
                session,
                payment.user_id,
                *points_redeemed,
                Some(payment.id),
                issuer.now,
            )
            .await?;
            session
                .remove_cart_lines(
                    payment.user_id,
                    items.iter().map(|item| item.competition_id).collect(),
                )
                .await?;
        }
    }
    Ok(ticket_ids)
}

struct RecordRejection {
    intent_id: IntentId,
    reason: String,
    payload: serde_json::Value,
    now: DateTime<Utc>,
}

impl UnitOfWork for RecordRejection {
    type Output = SettlementOutcome;

    fn name(&self) -> &'static str {
        "record_settlement_rejection"
    }

    fn run<'a>(
        &'a self,
        session: &'a mut dyn LedgerSession,
    ) -> BoxFuture<'a, Result<SettlementOutcome>> {
        Box::pin(async move {
            let mut payment = session
                .payment_by_intent(self.intent_id.clone())
                .await?
                .ok_or(SettlementError::PaymentNotFound)?;
            if payment.tickets_created {
                return Ok(SettlementOutcome::AlreadySettled {
                    ticket_ids: payment.ticket_ids,
                });
            }
            if payment.status != PaymentStatus::Succeeded
                && !payment.transition_to(PaymentStatus::Succeeded, self.now)
            {
                return Ok(SettlementOutcome::Ignored {
                    reason: format!("payment is {}", payment.status),
                });
            }
            payment.failure_reason = Some(format!("settlement rejected: {}", self.reason));
            payment.gateway_payload = Some(self.payload.clone());
            payment.updated_at = self.now;
            session.save_payment(payment).await?;

            Ok(SettlementOutcome::Rejected {
                reason: self.reason.clone(),
            })
        })
    }
}

struct UpdateStatus {
    intent_id: IntentId,
    status: PaymentStatus,
    reason: Option<String>,
    payload: serde_json::Value,
    now: DateTime<Utc>,
}

impl UnitOfWork for UpdateStatus {
    type Output = SettlementOutcome;

    fn name(&self) -> &'static str {
        "update_payment_status"
    }

    fn run<'a>(
        &'a self,
        session: &'a mut dyn LedgerSession,
    ) -> BoxFuture<'a, Result<SettlementOutcome>> {
        Box::pin(async move {
            let mut payment = session
                .payment_by_intent(self.intent_id.clone())
                .await?
                .ok_or(SettlementError::PaymentNotFound)?;
            let current = payment.status;
            if payment.tickets_created || !payment.transition_to(self.status, self.now) {
                return Ok(SettlementOutcome::Ignored {
                    reason: format!("stale {} callback for {current} payment", self.status),
                });
            }
            if matches!(self.status, PaymentStatus::Failed | PaymentStatus::Canceled) {
                payment.failure_reason = Some(
                    self.reason
                        .clone()
                        .unwrap_or_else(|| format!("payment {}", self.status)),
                );
            }
            payment.gateway_payload = Some(self.payload.clone());
            session.save_payment(payment).await?;

            Ok(SettlementOutcome::StatusUpdated {
                status: self.status,
            })
        })
    }
}

impl SettlementEngine {
    /// Authenticate and apply a gateway webhook.
    ///
    /// Nothing is read or written before the signature checks out.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::InvalidSignature`] for bad or stale signatures
    /// - [`SettlementError::MalformedWebhook`] if the body is not an event
    /// - [`SettlementError::PaymentNotFound`] for unknown intents
    /// - Internal errors; the gateway should redeliver
    pub async fn handle_webhook(&self, body: &[u8], signature: &str) -> Result<SettlementOutcome> {
        if let Err(err) = self.webhooks.verify(signature, body, self.now()) {
            tracing::warn!(error = %err, "Rejected webhook");
            metrics::record_webhook_rejected("signature");
            return Err(err);
        }
        let event: GatewayEvent = serde_json::from_slice(body).map_err(|e| {
            metrics::record_webhook_rejected("malformed");
            SettlementError::MalformedWebhook(e.to_string())
        })?;
        self.apply_event(event).await
    }

    /// Apply an already authenticated gateway event.
    ///
    /// # Errors
    ///
    /// See [`handle_webhook`](Self::handle_webhook).
    pub async fn apply_event(&self, event: GatewayEvent) -> Result<SettlementOutcome> {
        let now = self.now();
        let outcome = match event.event_type.as_str() {
            "succeeded" => self.settle(&event, now).await,
            "processing" | "failed" | "canceled" => {
                let status = match event.event_type.as_str() {
                    "processing" => PaymentStatus::Processing,
                    "failed" => PaymentStatus::Failed,
                    _ => PaymentStatus::Canceled,
                };
                self.coordinator
                    .run(&UpdateStatus {
                        intent_id: event.intent_id.clone(),
                        status,
                        reason: event.failure_reason(),
                        payload: event.payload.clone(),
                        now,
                    })
                    .await
            }
            other => Ok(SettlementOutcome::Ignored {
                reason: format!("unhandled event type {other}"),
            }),
        }?;

        metrics::record_settlement(outcome.label());
        match &outcome {
            SettlementOutcome::Settled { ticket_ids } => tracing::info!(
                intent_id = %event.intent_id,
                tickets = ticket_ids.len(),
                "Payment settled"
            ),
            SettlementOutcome::Rejected { reason } => tracing::warn!(
                intent_id = %event.intent_id,
                reason = %reason,
                "Payment captured but settlement rejected; refund required"
            ),
            other => tracing::info!(
                intent_id = %event.intent_id,
                event_type = %event.event_type,
                outcome = other.label(),
                "Webhook processed"
            ),
        }
        Ok(outcome)
    }

    async fn settle(&self, event: &GatewayEvent, now: DateTime<Utc>) -> Result<SettlementOutcome> {
        let unit = SettleSucceeded {
            issuer: self.issuer(now),
            intent_id: event.intent_id.clone(),
            payload: event.payload.clone(),
        };
        match self.coordinator.run(&unit).await {
            Err(err)
                if err.is_business_rejection()
                    && !matches!(err, SettlementError::PaymentNotFound) =>
            {
                self.coordinator
                    .run(&RecordRejection {
                        intent_id: event.intent_id.clone(),
                        reason: err.to_string(),
                        payload: event.payload.clone(),
                        now,
                    })
                    .await
            }
            other => other,
        }
    }

    /// Status of a payment, visible only to the user who made it.
    ///
    /// # Errors
    ///
    /// [`SettlementError::PaymentNotFound`] for unknown intents and for
    /// payments owned by someone else.
    pub async fn get_payment_status(
        &self,
        intent_id: &IntentId,
        user_id: UserId,
    ) -> Result<PaymentView> {
        let mut session = self.read_session().await?;
        let payment = session
            .payment_by_intent(intent_id.clone())
            .await?
            .filter(|payment| payment.user_id == user_id)
            .ok_or(SettlementError::PaymentNotFound)?;
        let ticket_numbers = session
            .tickets(payment.ticket_ids.clone())
            .await?
            .into_iter()
            .map(|ticket| ticket.ticket_number)
            .collect();

        Ok(PaymentView {
            payment_id: payment.id,
            intent_id: payment.intent_id,
            status: payment.status,
            payment_type: payment.purchase.payment_type().to_string(),
            amount: payment.amount,
            tickets_created: payment.tickets_created,
            ticket_numbers,
            failure_reason: payment.failure_reason,
            refund_amount: payment.refund_amount,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use raffle_testing::test_clock;
    use raffle_core::environment::Clock;

    const SECRET: &str = "whsec_test";

    #[test]
    fn signature_round_trip() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let now = test_clock().now();
        let body = br#"{"type":"succeeded","intent_id":"pi_123"}"#;
        let header = verifier.sign(body, now.timestamp()).unwrap();

        assert!(verifier.verify(&header, body, now).is_ok());
    }

    #[test]
    fn tampered_body_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let now = test_clock().now();
        let header = verifier.sign(b"{\"amount\":100}", now.timestamp()).unwrap();

        let err = verifier.verify(&header, b"{\"amount\":1}", now).unwrap_err();
        assert!(matches!(err, SettlementError::InvalidSignature(_)));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let now = test_clock().now();
        let header = verifier.sign(b"{}", now.timestamp() - 600).unwrap();

        assert!(verifier.verify(&header, b"{}", now).is_err());
    }

    #[test]
    fn other_secret_is_rejected() {
        let now = test_clock().now();
        let header = WebhookVerifier::new("whsec_other", 300)
            .sign(b"{}", now.timestamp())
            .unwrap();

        assert!(WebhookVerifier::new(SECRET, 300).verify(&header, b"{}", now).is_err());
    }

    #[test]
    fn empty_secret_still_signs_and_verifies() {
        let verifier = WebhookVerifier::new("", 300);
        let now = test_clock().now();
        let header = verifier.sign(b"{}", now.timestamp()).unwrap();

        assert!(verifier.verify(&header, b"{}", now).is_ok());
        assert!(WebhookVerifier::new(SECRET, 300).verify(&header, b"{}", now).is_err());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let verifier = WebhookVerifier::new(SECRET, 300);
        let now = test_clock().now();
        for header in ["", "v1=abcd", "t=notanumber,v1=abcd", "t=1735689600"] {
            assert!(verifier.verify(header, b"{}", now).is_err(), "{header}");
        }
    }

    #[test]
    fn failure_reason_prefers_reason_then_gateway_error() {
        let event: GatewayEvent = serde_json::from_value(serde_json::json!({
            "type": "failed",
            "intent_id": "pi_1",
            "payload": {"last_payment_error": {"message": "Your card was declined."}}
        }))
        .unwrap();
        assert_eq!(event.failure_reason().as_deref(), Some("Your card was declined."));

        let event: GatewayEvent = serde_json::from_value(serde_json::json!({
            "type": "canceled",
            "intent_id": "pi_1",
            "payload": {"reason": "abandoned"}
        }))
        .unwrap();
        assert_eq!(event.failure_reason().as_deref(), Some("abandoned"));
    }
}
