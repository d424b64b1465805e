//! Refunds and retries.
//!
//! A refund is confirmed by the gateway first; only then does the reversal
//! unit touch the ledger. The reversal re-checks the payment status under
//! lock, so two concurrent refunds cannot both reverse inventory.
//!
//! Earned points are kept on refund. Only lifetime spend is reduced, and
//! only when the settlement recorded it.

use crate::app::SettlementEngine;
use crate::coordinator::UnitOfWork;
use crate::error::{Result, SettlementError};
use crate::metrics;
use crate::points;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use raffle_core::ledger::LedgerSession;
use raffle_core::types::{CompetitionId, IntentId, Money, PaymentId, PaymentStatus, TicketStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of a confirmed refund.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundReceipt {
    /// Refunded payment
    pub payment_id: PaymentId,
    /// Gateway refund id
    pub refund_id: String,
    /// Amount refunded
    pub amount: Money,
    /// Tickets moved to `refunded`
    pub tickets_refunded: usize,
}

/// Outcome of a retry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryReceipt {
    /// Payment reopened
    pub payment_id: PaymentId,
    /// Intent the client should complete again
    pub intent_id: IntentId,
    /// New status
    pub status: PaymentStatus,
}

fn require_status(
    operation: &'static str,
    required: PaymentStatus,
    actual: PaymentStatus,
) -> Result<()> {
    if actual == required {
        Ok(())
    } else {
        Err(SettlementError::InvalidPaymentState {
            operation,
            required,
            actual,
        })
    }
}

struct ReverseSettlement {
    payment_id: PaymentId,
    amount: Money,
    reason: String,
    now: DateTime<Utc>,
}

impl UnitOfWork for ReverseSettlement {
    type Output = usize;

    fn name(&self) -> &'static str {
        "reverse_settlement"
    }

    fn run<'a>(&'a self, session: &'a mut dyn LedgerSession) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut payment = session
                .payment(self.payment_id)
                .await?
                .ok_or(SettlementError::PaymentNotFound)?;
            require_status("refund", PaymentStatus::Succeeded, payment.status)?;

            let tickets: Vec<_> = session
                .tickets(payment.ticket_ids.clone())
                .await?
                .into_iter()
                .filter(|ticket| ticket.status != TicketStatus::Refunded)
                .collect();

            let mut per_competition: BTreeMap<CompetitionId, u32> = BTreeMap::new();
            for ticket in &tickets {
                *per_competition.entry(ticket.competition_id).or_default() += 1;
            }
            for (competition_id, count) in &per_competition {
                let Some(competition) = session.competition(*competition_id).await? else {
                    tracing::warn!(
                        competition_id = %competition_id,
                        "Refunded tickets reference a missing competition"
                    );
                    continue;
                };
                let sold = competition.tickets_sold.saturating_sub(*count);
                if !session
                    .compare_and_set_tickets_sold(*competition_id, competition.tickets_sold, sold)
                    .await?
                {
                    return Err(SettlementError::ConcurrentModification);
                }
            }

            session
                .update_ticket_status(
                    tickets.iter().map(|ticket| ticket.id).collect(),
                    TicketStatus::Refunded,
                )
                .await?;
            // A rejected settlement never recorded spend for this payment.
            if payment.tickets_created {
                points::reverse_spend(session, payment.user_id, self.amount).await?;
            }

            payment.transition_to(PaymentStatus::Refunded, self.now);
            payment.refund_amount = Some(self.amount);
            payment.refund_reason = Some(self.reason.clone());
            payment.refunded_at = Some(self.now);
            session.save_payment(payment).await?;

            Ok(tickets.len())
        })
    }
}

struct ReopenPayment {
    payment_id: PaymentId,
    now: DateTime<Utc>,
}

impl UnitOfWork for ReopenPayment {
    type Output = RetryReceipt;

    fn name(&self) -> &'static str {
        "retry_payment"
    }

    fn run<'a>(&'a self, session: &'a mut dyn LedgerSession) -> BoxFuture<'a, Result<RetryReceipt>> {
        Box::pin(async move {
            let mut payment = session
                .payment(self.payment_id)
                .await?
                .ok_or(SettlementError::PaymentNotFound)?;
            require_status("retry", PaymentStatus::Failed, payment.status)?;

            payment.transition_to(PaymentStatus::Pending, self.now);
            payment.failure_reason = None;
            let receipt = RetryReceipt {
                payment_id: payment.id,
                intent_id: payment.intent_id.clone(),
                status: payment.status,
            };
            session.save_payment(payment).await?;
            Ok(receipt)
        })
    }
}

impl SettlementEngine {
    /// Refund a succeeded payment, fully or partially.
    ///
    /// `amount` defaults to the full charge. A smaller amount needs
    /// `partial`. On gateway confirmation every ticket of the payment is
    /// marked refunded and its inventory released.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::PaymentNotFound`]
    /// - [`SettlementError::InvalidPaymentState`] unless the payment succeeded
    /// - [`SettlementError::InvalidRefundAmount`], [`SettlementError::PartialRefundNotAllowed`]
    /// - [`SettlementError::Gateway`] if the gateway refuses; nothing is reversed
    pub async fn refund_payment(
        &self,
        payment_id: PaymentId,
        reason: impl Into<String>,
        amount: Option<Money>,
        partial: bool,
    ) -> Result<RefundReceipt> {
        let payment = {
            let mut session = self.read_session().await?;
            session
                .payment(payment_id)
                .await?
                .ok_or(SettlementError::PaymentNotFound)?
        };
        require_status("refund", PaymentStatus::Succeeded, payment.status)?;

        let amount = amount.unwrap_or(payment.amount);
        if amount.is_zero() || amount > payment.amount {
            return Err(SettlementError::InvalidRefundAmount {
                requested: amount,
                original: payment.amount,
            });
        }
        if amount < payment.amount && !partial {
            return Err(SettlementError::PartialRefundNotAllowed {
                requested: amount,
                original: payment.amount,
            });
        }

        let confirmation = self
            .gateway
            .create_refund(&payment.intent_id, amount)
            .await?;

        let unit = ReverseSettlement {
            payment_id,
            amount,
            reason: reason.into(),
            now: self.now(),
        };
        let tickets_refunded = self.coordinator.run(&unit).await.inspect_err(|err| {
            tracing::error!(
                payment_id = %payment_id,
                refund_id = %confirmation.refund_id,
                error = %err,
                "Gateway confirmed refund but ledger reversal failed"
            );
        })?;

        metrics::record_refund(amount.cents());
        tracing::info!(
            payment_id = %payment_id,
            refund_id = %confirmation.refund_id,
            amount = amount.cents(),
            tickets_refunded,
            "Payment refunded"
        );

        Ok(RefundReceipt {
            payment_id,
            refund_id: confirmation.refund_id,
            amount,
            tickets_refunded,
        })
    }

    /// Reopen a failed payment for another attempt on the same intent.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::PaymentNotFound`]
    /// - [`SettlementError::InvalidPaymentState`] unless the payment failed
    pub async fn retry_payment(&self, payment_id: PaymentId) -> Result<RetryReceipt> {
        let receipt = self
            .coordinator
            .run(&ReopenPayment {
                payment_id,
                now: self.now(),
            })
            .await?;
        tracing::info!(payment_id = %payment_id, intent_id = %receipt.intent_id, "Payment reopened");
        Ok(receipt)
    }
}
