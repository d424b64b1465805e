//! Engine wiring.
//!
//! [`SettlementEngine`] owns the collaborators every operation needs. The
//! operations themselves live with their component: purchases in
//! [`purchase`](crate::purchase), gateway callbacks in
//! [`settlement`](crate::settlement), reversals in [`refund`](crate::refund).

use crate::config::SettlementConfig;
use crate::coordinator::TransactionCoordinator;
use crate::error::Result;
use crate::payment_gateway::PaymentGateway;
use crate::purchase::TicketIssuer;
use crate::settlement::WebhookVerifier;
use crate::ticket_number::{RandomTicketNumberGenerator, TicketNumberGenerator};
use chrono::{DateTime, Utc};
use raffle_core::environment::Clock;
use raffle_core::ledger::{LedgerSession, LedgerStore, SessionMode};
use std::sync::Arc;

/// Ticket issuance and payment settlement engine.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct SettlementEngine {
    pub(crate) coordinator: TransactionCoordinator,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) ticket_numbers: Arc<dyn TicketNumberGenerator>,
    pub(crate) webhooks: WebhookVerifier,
    pub(crate) config: SettlementConfig,
}

impl SettlementEngine {
    /// Build an engine over `store` using random ticket numbers.
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        config: SettlementConfig,
    ) -> Self {
        let ticket_numbers = Arc::new(RandomTicketNumberGenerator::new(Arc::clone(&clock)));
        let webhooks = WebhookVerifier::new(&config.webhook_secret, config.webhook_tolerance_secs);
        Self {
            coordinator: TransactionCoordinator::new(store, config.transactions),
            gateway,
            clock,
            ticket_numbers,
            webhooks,
            config,
        }
    }

    /// Replace the ticket number generator.
    #[must_use]
    pub fn with_ticket_numbers(mut self, generator: Arc<dyn TicketNumberGenerator>) -> Self {
        self.ticket_numbers = generator;
        self
    }

    /// The transaction coordinator, for capability inspection
    #[must_use]
    pub const fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Active business rules
    #[must_use]
    pub const fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Signature checker for inbound webhooks
    #[must_use]
    pub const fn webhooks(&self) -> &WebhookVerifier {
        &self.webhooks
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn issuer(&self, now: DateTime<Utc>) -> TicketIssuer<'_> {
        TicketIssuer {
            generator: self.ticket_numbers.as_ref(),
            max_attempts: self.config.max_ticket_number_attempts,
            now,
        }
    }

    /// Non-locking session for validations and reads outside a unit of work.
    pub(crate) async fn read_session(&self) -> Result<Box<dyn LedgerSession>> {
        Ok(self
            .coordinator
            .store()
            .begin(SessionMode::Autocommit)
            .await?)
    }
}
