//! Purchase orchestration.
//!
//! Three entry points sell tickets:
//!
//! - [`SettlementEngine::purchase_ticket`] issues immediately, no gateway.
//! - [`SettlementEngine::create_single_intent`] and
//!   [`SettlementEngine::create_checkout_intent`] validate, open a gateway
//!   intent and record a `pending` payment. Tickets are issued later by the
//!   settlement handler from the stored purchase shape.
//!
//! All three share [`validate_line`] and [`TicketIssuer`], so a line is
//! checked the same way at intent time and again at settlement time.

use crate::app::SettlementEngine;
use crate::coordinator::UnitOfWork;
use crate::error::{Result, SettlementError};
use crate::metrics;
use crate::points::{self, Redemption};
use crate::ticket_number::{TicketNumberGenerator, allocate_ticket_numbers};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use raffle_core::ledger::LedgerSession;
use raffle_core::types::{
    CartLine, Competition, CompetitionId, IntentId, Money, Payment, PaymentId, PurchaseLine,
    PurchaseShape, Ticket, TicketId, TicketNumber, TicketStatus, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Check that `user_id` may buy `quantity` tickets in `competition_id`.
///
/// Checks run in order: quantity, existence, status, inventory, per-person
/// cap. Returns the competition as read (locked in transactional sessions).
///
/// # Errors
///
/// The first failing rule, as a validation or not-found error.
pub async fn validate_line(
    session: &mut dyn LedgerSession,
    user_id: UserId,
    competition_id: CompetitionId,
    quantity: u32,
) -> Result<Competition> {
    if quantity == 0 {
        return Err(SettlementError::InvalidQuantity);
    }
    let competition = session
        .competition(competition_id)
        .await?
        .ok_or(SettlementError::CompetitionNotFound)?;
    if !competition.is_active() {
        return Err(SettlementError::CompetitionNotActive);
    }
    if quantity > competition.remaining() {
        return Err(SettlementError::InsufficientInventory {
            remaining: competition.remaining(),
        });
    }

    let held = session.count_active_tickets(user_id, competition_id).await?;
    let allowance = competition.max_per_person.saturating_sub(held);
    if quantity > allowance {
        return Err(SettlementError::PerPersonLimit {
            limit: competition.max_per_person,
            remaining: allowance,
        });
    }
    Ok(competition)
}

/// One line of tickets to issue.
#[derive(Clone, Debug)]
pub struct IssueRequest {
    /// Buyer
    pub user_id: UserId,
    /// Competition
    pub competition_id: CompetitionId,
    /// Tickets to issue
    pub quantity: u32,
    /// Price snapshot; `None` charges the competition's current price
    pub unit_price: Option<Money>,
    /// Settling payment
    pub payment_id: Option<PaymentId>,
}

/// Tickets issued for one line.
#[derive(Clone, Debug)]
pub struct IssuedLine {
    /// Competition title at issue time
    pub title: String,
    /// Price charged per ticket
    pub unit_price: Money,
    /// New tickets
    pub tickets: Vec<Ticket>,
}

impl IssuedLine {
    /// `unit_price × tickets`
    #[must_use]
    pub fn subtotal(&self) -> Money {
        let count = u32::try_from(self.tickets.len()).unwrap_or(u32::MAX);
        self.unit_price.checked_multiply(count).unwrap_or(Money::ZERO)
    }
}

/// Issues tickets inside a unit of work.
pub struct TicketIssuer<'a> {
    /// Candidate source
    pub generator: &'a dyn TicketNumberGenerator,
    /// Attempts per ticket number
    pub max_attempts: u32,
    /// Purchase timestamp stamped on tickets
    pub now: DateTime<Utc>,
}

impl TicketIssuer<'_> {
    /// Validate, allocate numbers, bump inventory, then insert tickets.
    ///
    /// Inventory moves with a compare-and-set before any ticket is written,
    /// so a lost race in a sequential session leaves no orphan tickets.
    /// `reserved` collects numbers across the lines of one unit.
    ///
    /// # Errors
    ///
    /// - Validation errors from [`validate_line`]
    /// - [`SettlementError::TicketNumberExhausted`]
    /// - [`SettlementError::ConcurrentModification`] if inventory moved underneath
    pub async fn issue(
        &self,
        session: &mut dyn LedgerSession,
        request: &IssueRequest,
        reserved: &mut HashSet<TicketNumber>,
    ) -> Result<IssuedLine> {
        let competition =
            validate_line(session, request.user_id, request.competition_id, request.quantity)
                .await?;
        let numbers = allocate_ticket_numbers(
            session,
            self.generator,
            request.quantity,
            self.max_attempts,
            reserved,
        )
        .await?;

        let sold = competition.tickets_sold + request.quantity;
        if !session
            .compare_and_set_tickets_sold(competition.id, competition.tickets_sold, sold)
            .await?
        {
            tracing::warn!(
                competition_id = %competition.id,
                expected = competition.tickets_sold,
                "Inventory changed between read and write"
            );
            return Err(SettlementError::ConcurrentModification);
        }

        let unit_price = request.unit_price.unwrap_or(competition.ticket_price);
        let tickets: Vec<Ticket> = numbers
            .into_iter()
            .map(|ticket_number| Ticket {
                id: TicketId::new(),
                ticket_number,
                user_id: request.user_id,
                competition_id: competition.id,
                price: unit_price,
                status: TicketStatus::Active,
                purchase_date: self.now,
                payment_id: request.payment_id,
            })
            .collect();
        session.insert_tickets(tickets.clone()).await?;

        metrics::record_tickets_issued(request.quantity);
        tracing::info!(
            competition_id = %competition.id,
            user_id = %request.user_id,
            quantity = request.quantity,
            tickets_sold = sold,
            "Tickets issued"
        );

        Ok(IssuedLine {
            title: competition.title,
            unit_price,
            tickets,
        })
    }
}

/// Result of a direct purchase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PurchaseReceipt {
    /// Issued tickets
    pub tickets: Vec<Ticket>,
    /// Amount added to lifetime spend
    pub total: Money,
    /// Points credited
    pub points_earned: u64,
}

/// Result of opening a gateway intent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntentReceipt {
    /// Pending payment
    pub payment_id: PaymentId,
    /// Gateway correlation key
    pub intent_id: IntentId,
    /// Secret for completing payment with the gateway
    pub client_secret: String,
    /// Amount to be charged
    pub amount: Money,
    /// Discount from redeemed points
    pub discount: Money,
    /// Points that will be debited at settlement
    pub points_redeemed: u64,
}

struct DirectPurchase<'a> {
    issuer: TicketIssuer<'a>,
    request: IssueRequest,
}

impl UnitOfWork for DirectPurchase<'_> {
    type Output = PurchaseReceipt;

    fn name(&self) -> &'static str {
        "direct_purchase"
    }

    fn run<'a>(
        &'a self,
        session: &'a mut dyn LedgerSession,
    ) -> BoxFuture<'a, Result<PurchaseReceipt>> {
        Box::pin(async move {
            let settings = session.points_settings().await?;
            let mut reserved = HashSet::new();
            let issued = self.issuer.issue(session, &self.request, &mut reserved).await?;

            let total = issued.subtotal();
            let user_id = self.request.user_id;
            points::record_spend(session, user_id, total).await?;
            let points_earned = points::points_for_spend(total, &settings);
            points::earn(
                session,
                user_id,
                points_earned,
                format!("Purchased {} tickets for {}", issued.tickets.len(), issued.title),
                None,
                self.issuer.now,
            )
            .await?;

            Ok(PurchaseReceipt {
                tickets: issued.tickets,
                total,
                points_earned,
            })
        })
    }
}

struct RecordIntent {
    payment: Payment,
}

impl UnitOfWork for RecordIntent {
    type Output = ();

    fn name(&self) -> &'static str {
        "record_intent"
    }

    fn run<'a>(&'a self, session: &'a mut dyn LedgerSession) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            session.insert_payment(self.payment.clone()).await?;
            Ok(())
        })
    }
}

impl SettlementEngine {
    /// Buy tickets immediately at the competition's current price.
    ///
    /// One unit of work: inventory, tickets, lifetime spend and earned
    /// points commit together.
    ///
    /// # Errors
    ///
    /// Validation errors leave the ledger untouched.
    pub async fn purchase_ticket(
        &self,
        user_id: UserId,
        competition_id: CompetitionId,
        quantity: u32,
    ) -> Result<PurchaseReceipt> {
        let unit = DirectPurchase {
            issuer: self.issuer(self.now()),
            request: IssueRequest {
                user_id,
                competition_id,
                quantity,
                unit_price: None,
                payment_id: None,
            },
        };
        let receipt = self.coordinator.run(&unit).await?;
        tracing::info!(
            user_id = %user_id,
            competition_id = %competition_id,
            quantity,
            total = receipt.total.cents(),
            "Direct purchase completed"
        );
        Ok(receipt)
    }

    /// Open a gateway intent for tickets in one competition.
    ///
    /// # Errors
    ///
    /// - Validation errors from [`validate_line`]
    /// - [`SettlementError::BelowMinimumCharge`]
    /// - [`SettlementError::Gateway`] if the intent cannot be created
    pub async fn create_single_intent(
        &self,
        user_id: UserId,
        competition_id: CompetitionId,
        quantity: u32,
    ) -> Result<IntentReceipt> {
        let competition = {
            let mut session = self.read_session().await?;
            validate_line(session.as_mut(), user_id, competition_id, quantity).await?
        };
        let line = PurchaseLine {
            competition_id,
            quantity,
            unit_price: competition.ticket_price,
        };
        let amount = line.subtotal().ok_or(SettlementError::AmountOverflow)?;
        self.check_minimum_charge(amount)?;

        let metadata = HashMap::from([
            ("competition_id".to_string(), competition_id.to_string()),
            ("quantity".to_string(), quantity.to_string()),
        ]);
        self.open_intent(
            user_id,
            amount,
            PurchaseShape::Single(line),
            Redemption::NONE,
            metadata,
        )
        .await
    }

    /// Open a gateway intent for the user's cart, optionally redeeming points.
    ///
    /// Only lines whose competition is active are charged. The discount is
    /// quoted now and the points are debited at settlement.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::EmptyCart`] if no line is chargeable
    /// - Redemption errors from [`points::quote_redemption`]
    /// - [`SettlementError::BelowMinimumCharge`]
    /// - [`SettlementError::Gateway`] if the intent cannot be created
    pub async fn create_checkout_intent(
        &self,
        user_id: UserId,
        points_to_redeem: Option<u64>,
    ) -> Result<IntentReceipt> {
        let (items, balance) = {
            let mut session = self.read_session().await?;
            let rows = session.cart(user_id).await?;
            let mut items = Vec::new();
            for row in rows {
                match session.competition(row.competition_id).await? {
                    Some(competition) if competition.is_active() && row.quantity > 0 => {
                        items.push(PurchaseLine {
                            competition_id: competition.id,
                            quantity: row.quantity,
                            unit_price: competition.ticket_price,
                        });
                    }
                    _ => {
                        tracing::debug!(
                            user_id = %user_id,
                            competition_id = %row.competition_id,
                            "Skipping cart line for inactive competition"
                        );
                    }
                }
            }
            let balance = session.user_points(user_id).await?.total_points;
            (items, balance)
        };
        if items.is_empty() {
            return Err(SettlementError::EmptyCart);
        }

        let cart_total = items.iter().try_fold(Money::ZERO, |total, line| {
            line.subtotal()
                .and_then(|subtotal| total.checked_add(subtotal))
                .ok_or(SettlementError::AmountOverflow)
        })?;

        let redemption = match points_to_redeem {
            Some(requested) if requested > 0 => points::quote_redemption(
                requested,
                balance,
                cart_total,
                self.config.redemption_points_per_dollar,
                self.config.minimum_redemption_points,
            )?,
            _ => Redemption::NONE,
        };
        let amount = cart_total.saturating_sub(redemption.discount);
        self.check_minimum_charge(amount)?;

        let metadata = HashMap::from([
            ("item_count".to_string(), items.len().to_string()),
            ("cart_total".to_string(), cart_total.cents().to_string()),
        ]);
        self.open_intent(
            user_id,
            amount,
            PurchaseShape::Cart {
                items,
                cart_total,
                points_redeemed: redemption.points,
                discount: redemption.discount,
            },
            redemption,
            metadata,
        )
        .await
    }

    /// Set the quantity of a cart line; zero removes it.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::CompetitionNotFound`]
    /// - [`SettlementError::Ledger`] if a write fails
    pub async fn set_cart_quantity(
        &self,
        user_id: UserId,
        competition_id: CompetitionId,
        quantity: u32,
    ) -> Result<()> {
        let mut session = self.read_session().await?;
        if session.competition(competition_id).await?.is_none() {
            return Err(SettlementError::CompetitionNotFound);
        }
        if quantity == 0 {
            session
                .remove_cart_lines(user_id, vec![competition_id])
                .await?;
        } else {
            session
                .put_cart_line(CartLine {
                    user_id,
                    competition_id,
                    quantity,
                })
                .await?;
        }
        session.commit().await?;
        tracing::debug!(user_id = %user_id, competition_id = %competition_id, quantity, "Cart updated");
        Ok(())
    }

    fn check_minimum_charge(&self, amount: Money) -> Result<()> {
        if amount < self.config.minimum_charge {
            return Err(SettlementError::BelowMinimumCharge {
                amount,
                minimum: self.config.minimum_charge,
            });
        }
        Ok(())
    }

    async fn open_intent(
        &self,
        user_id: UserId,
        amount: Money,
        purchase: PurchaseShape,
        redemption: Redemption,
        mut metadata: HashMap<String, String>,
    ) -> Result<IntentReceipt> {
        let payment_type = purchase.payment_type();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("payment_type".to_string(), payment_type.to_string());

        let intent = self
            .gateway
            .create_intent(amount, &self.config.currency, metadata)
            .await?;
        let payment = Payment::pending(
            intent.intent_id.clone(),
            user_id,
            amount,
            self.config.currency.clone(),
            purchase,
            self.now(),
        );
        let payment_id = payment.id;
        self.coordinator.run(&RecordIntent { payment }).await?;

        metrics::record_intent_created(payment_type);
        tracing::info!(
            payment_id = %payment_id,
            intent_id = %intent.intent_id,
            user_id = %user_id,
            amount = amount.cents(),
            payment_type,
            "Payment intent created"
        );

        Ok(IntentReceipt {
            payment_id,
            intent_id: intent.intent_id,
            client_secret: intent.client_secret,
            amount,
            discount: redemption.discount,
            points_redeemed: redemption.points,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::SettlementConfig;
    use crate::payment_gateway::MockPaymentGateway;
    use raffle_core::ledger::{LedgerStore, SessionMode};
    use raffle_testing::{InMemoryLedgerStore, fixtures, test_clock};
    use std::sync::Arc;

    fn engine(store: &InMemoryLedgerStore) -> SettlementEngine {
        SettlementEngine::new(
            Arc::new(store.clone()),
            MockPaymentGateway::shared(),
            Arc::new(test_clock()),
            SettlementConfig::default(),
        )
    }

    #[tokio::test]
    async fn validation_order_reports_first_failure() {
        let store = InMemoryLedgerStore::new();
        let closed = store.seed_competition(fixtures::closed_competition()).await;
        let mut session = store.begin(SessionMode::Autocommit).await.unwrap();
        let user = UserId::new();

        assert!(matches!(
            validate_line(session.as_mut(), user, closed.id, 0).await,
            Err(SettlementError::InvalidQuantity)
        ));
        assert!(matches!(
            validate_line(session.as_mut(), user, CompetitionId::new(), 1).await,
            Err(SettlementError::CompetitionNotFound)
        ));
        assert!(matches!(
            validate_line(session.as_mut(), user, closed.id, 1).await,
            Err(SettlementError::CompetitionNotActive)
        ));
    }

    #[tokio::test]
    async fn single_intent_records_pending_payment_without_tickets() {
        let store = InMemoryLedgerStore::new();
        let competition = store.seed_competition(fixtures::competition()).await;
        let engine = engine(&store);
        let user = UserId::new();

        let receipt = engine
            .create_single_intent(user, competition.id, 3)
            .await
            .unwrap();

        assert_eq!(receipt.amount, Money::from_dollars(15));
        let state = store.snapshot().await;
        let payment = state.payment_for_intent(&receipt.intent_id).unwrap();
        assert_eq!(payment.status, raffle_core::types::PaymentStatus::Pending);
        assert!(!payment.tickets_created);
        assert_eq!(state.competitions[&competition.id].tickets_sold, 0);
        assert!(state.tickets.is_empty());
    }

    #[tokio::test]
    async fn minimum_charge_is_enforced() {
        let store = InMemoryLedgerStore::new();
        let cheap = store
            .seed_competition(fixtures::competition_with(Money::from_cents(25), 100, 10, 0))
            .await;
        let engine = engine(&store);

        let err = engine
            .create_single_intent(UserId::new(), cheap.id, 1)
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::BelowMinimumCharge { .. }));
        assert!(store.snapshot().await.payments.is_empty());
    }

    #[tokio::test]
    async fn cart_quantity_zero_removes_line() {
        let store = InMemoryLedgerStore::new();
        let competition = store.seed_competition(fixtures::competition()).await;
        let engine = engine(&store);
        let user = UserId::new();

        engine.set_cart_quantity(user, competition.id, 2).await.unwrap();
        assert_eq!(store.snapshot().await.carts.len(), 1);

        engine.set_cart_quantity(user, competition.id, 0).await.unwrap();
        assert!(store.snapshot().await.carts.is_empty());
    }
}
