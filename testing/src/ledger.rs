//! In-memory ledger store for tests.
//!
//! Behaves like the Postgres store closely enough to exercise the settlement
//! engine end to end:
//!
//! - [`InMemoryLedgerStore::new`]: transactional. A transactional session
//!   holds the whole ledger lock and works on a private copy, so concurrent
//!   units serialize and a rollback leaves no trace.
//! - [`InMemoryLedgerStore::standalone`]: the probe reports no transaction
//!   support and transactional sessions are refused.
//! - [`InMemoryLedgerStore::rejecting_transactions`]: the probe claims support
//!   but every transactional `begin` fails with
//!   [`LedgerError::TransactionsUnsupported`], like a replica set that lost
//!   its primary after startup.

use raffle_core::ledger::{LedgerError, LedgerFuture, LedgerSession, LedgerStore, SessionMode};
use raffle_core::types::{
    CartLine, Competition, CompetitionId, IntentId, Payment, PaymentId, PointsEntry, PointsEntryId,
    PointsKind, PointsSettings, Ticket, TicketId, TicketNumber, TicketStatus, UserId, UserPoints,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Everything the ledger stores, exposed for test assertions.
#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    /// Competitions by id
    pub competitions: HashMap<CompetitionId, Competition>,
    /// Tickets by id
    pub tickets: HashMap<TicketId, Ticket>,
    /// Payments by id
    pub payments: HashMap<PaymentId, Payment>,
    /// Points counters by user
    pub user_points: HashMap<UserId, UserPoints>,
    /// Points history in append order
    pub points_history: Vec<PointsEntry>,
    /// Points settings, `None` until saved
    pub points_settings: Option<PointsSettings>,
    /// Cart rows keyed by `(user, competition)`
    pub carts: BTreeMap<(UserId, CompetitionId), CartLine>,
}

impl LedgerState {
    /// Tickets owned by a user in a competition, any status
    #[must_use]
    pub fn tickets_for(&self, user_id: UserId, competition_id: CompetitionId) -> Vec<&Ticket> {
        self.tickets
            .values()
            .filter(|t| t.user_id == user_id && t.competition_id == competition_id)
            .collect()
    }

    /// Payment for a gateway intent
    #[must_use]
    pub fn payment_for_intent(&self, intent_id: &IntentId) -> Option<&Payment> {
        self.payments.values().find(|p| &p.intent_id == intent_id)
    }

    /// History rows for a user in append order
    #[must_use]
    pub fn history_for(&self, user_id: UserId) -> Vec<&PointsEntry> {
        self.points_history
            .iter()
            .filter(|e| e.user_id == user_id)
            .collect()
    }

    /// Points counters for a user, zeroed when absent
    #[must_use]
    pub fn points_for(&self, user_id: UserId) -> UserPoints {
        self.user_points
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| UserPoints::empty(user_id))
    }

    fn compare_and_set_tickets_sold(
        &mut self,
        id: CompetitionId,
        expected: u32,
        new: u32,
    ) -> Result<bool, LedgerError> {
        let competition = self
            .competitions
            .get_mut(&id)
            .ok_or_else(|| LedgerError::NotFound(format!("competition {id}")))?;
        if competition.tickets_sold != expected {
            return Ok(false);
        }
        competition.tickets_sold = new;
        Ok(true)
    }

    fn count_active_tickets(&self, user_id: UserId, competition_id: CompetitionId) -> u32 {
        let count = self
            .tickets
            .values()
            .filter(|t| {
                t.user_id == user_id
                    && t.competition_id == competition_id
                    && t.status != TicketStatus::Refunded
            })
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn ticket_number_exists(&self, number: &TicketNumber) -> bool {
        self.tickets.values().any(|t| &t.ticket_number == number)
    }

    fn insert_tickets(&mut self, tickets: Vec<Ticket>) -> Result<(), LedgerError> {
        let mut batch = HashSet::new();
        for ticket in &tickets {
            if self.ticket_number_exists(&ticket.ticket_number)
                || !batch.insert(ticket.ticket_number.clone())
            {
                return Err(LedgerError::Conflict(format!(
                    "ticket_number {}",
                    ticket.ticket_number
                )));
            }
        }
        for ticket in tickets {
            self.tickets.insert(ticket.id, ticket);
        }
        Ok(())
    }

    fn update_ticket_status(&mut self, ids: &[TicketId], status: TicketStatus) {
        for id in ids {
            if let Some(ticket) = self.tickets.get_mut(id) {
                ticket.status = status;
            }
        }
    }

    fn insert_payment(&mut self, payment: Payment) -> Result<(), LedgerError> {
        if self.payment_for_intent(&payment.intent_id).is_some() {
            return Err(LedgerError::Conflict(format!(
                "intent_id {}",
                payment.intent_id
            )));
        }
        self.payments.insert(payment.id, payment);
        Ok(())
    }

    fn save_payment(&mut self, payment: Payment) -> Result<(), LedgerError> {
        match self.payments.get_mut(&payment.id) {
            Some(existing) => {
                *existing = payment;
                Ok(())
            }
            None => Err(LedgerError::NotFound(format!("payment {}", payment.id))),
        }
    }
}

/// How the store answers transaction requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransactionBehavior {
    Supported,
    Unsupported,
    RejectedAtRuntime,
}

/// In-memory [`LedgerStore`].
///
/// # Example
///
/// ```
/// use raffle_testing::InMemoryLedgerStore;
/// use raffle_core::types::{Competition, Money};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryLedgerStore::new();
/// let competition = store
///     .seed_competition(Competition::new("Car", Money::from_dollars(5), 10, 2))
///     .await;
/// let state = store.snapshot().await;
/// assert_eq!(state.competitions[&competition.id].tickets_sold, 0);
/// # });
/// ```
#[derive(Clone, Debug)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
    behavior: TransactionBehavior,
    probes: Arc<AtomicUsize>,
    transactional_begins: Arc<AtomicUsize>,
}

impl InMemoryLedgerStore {
    /// Store with full transaction support
    #[must_use]
    pub fn new() -> Self {
        Self::with_behavior(TransactionBehavior::Supported)
    }

    /// Store without transaction support (single-node deployment)
    #[must_use]
    pub fn standalone() -> Self {
        Self::with_behavior(TransactionBehavior::Unsupported)
    }

    /// Store whose probe claims support but which refuses every transaction
    #[must_use]
    pub fn rejecting_transactions() -> Self {
        Self::with_behavior(TransactionBehavior::RejectedAtRuntime)
    }

    fn with_behavior(behavior: TransactionBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            behavior,
            probes: Arc::new(AtomicUsize::new(0)),
            transactional_begins: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Clone of the current committed state
    pub async fn snapshot(&self) -> LedgerState {
        self.state.lock().await.clone()
    }

    /// Number of times [`LedgerStore::probe_transactions`] ran
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Number of transactional sessions requested
    #[must_use]
    pub fn transactional_begin_count(&self) -> usize {
        self.transactional_begins.load(Ordering::SeqCst)
    }

    /// Insert a competition directly
    pub async fn seed_competition(&self, competition: Competition) -> Competition {
        self.state
            .lock()
            .await
            .competitions
            .insert(competition.id, competition.clone());
        competition
    }

    /// Credit points with a matching `earned` history row
    pub async fn grant_points(&self, user_id: UserId, amount: u64) {
        let mut state = self.state.lock().await;
        let mut points = state.points_for(user_id);
        points.total_points += amount;
        points.total_earned += amount;
        state.user_points.insert(user_id, points);
        state.points_history.push(PointsEntry {
            id: PointsEntryId::new(),
            user_id,
            kind: PointsKind::Earned,
            amount,
            description: "Opening balance".to_string(),
            payment_id: None,
            created_at: Utc::now(),
        });
    }

    /// Replace the points settings singleton
    pub async fn set_points_settings(&self, settings: PointsSettings) {
        self.state.lock().await.points_settings = Some(settings);
    }

    /// Add a cart row directly
    pub async fn add_to_cart(&self, line: CartLine) {
        self.state
            .lock()
            .await
            .carts
            .insert((line.user_id, line.competition_id), line);
    }

    /// Insert a payment directly
    pub async fn seed_payment(&self, payment: Payment) {
        self.state.lock().await.payments.insert(payment.id, payment);
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn probe_transactions(&self) -> LedgerFuture<'_, bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let supported = self.behavior != TransactionBehavior::Unsupported;
        Box::pin(async move { Ok(supported) })
    }

    fn begin(&self, mode: SessionMode) -> LedgerFuture<'_, Box<dyn LedgerSession>> {
        Box::pin(async move {
            let access = match mode {
                SessionMode::Autocommit => Access::Autocommit(Arc::clone(&self.state)),
                SessionMode::Transactional => {
                    self.transactional_begins.fetch_add(1, Ordering::SeqCst);
                    match self.behavior {
                        TransactionBehavior::Supported => {
                            let guard = Arc::clone(&self.state).lock_owned().await;
                            let working = guard.clone();
                            Access::Transaction { guard, working }
                        }
                        TransactionBehavior::Unsupported => {
                            return Err(LedgerError::TransactionsUnsupported(
                                "standalone in-memory ledger".to_string(),
                            ));
                        }
                        TransactionBehavior::RejectedAtRuntime => {
                            return Err(LedgerError::TransactionsUnsupported(
                                "transaction numbers are only allowed on a replica set member"
                                    .to_string(),
                            ));
                        }
                    }
                }
            };
            Ok(Box::new(InMemorySession { access }) as Box<dyn LedgerSession>)
        })
    }
}

enum Access {
    Transaction {
        guard: OwnedMutexGuard<LedgerState>,
        working: LedgerState,
    },
    Autocommit(Arc<Mutex<LedgerState>>),
}

struct InMemorySession {
    access: Access,
}

impl InMemorySession {
    /// Run `op` against the working copy or, in autocommit mode, the shared state.
    fn apply<'a, T, F>(&'a mut self, op: F) -> LedgerFuture<'a, T>
    where
        T: Send + 'a,
        F: FnOnce(&mut LedgerState) -> Result<T, LedgerError> + Send + 'a,
    {
        match &mut self.access {
            Access::Transaction { working, .. } => Box::pin(std::future::ready(op(working))),
            Access::Autocommit(state) => {
                let state = Arc::clone(state);
                Box::pin(async move {
                    let mut guard = state.lock().await;
                    op(&mut guard)
                })
            }
        }
    }
}

impl LedgerSession for InMemorySession {
    fn is_transactional(&self) -> bool {
        matches!(self.access, Access::Transaction { .. })
    }

    fn competition(&mut self, id: CompetitionId) -> LedgerFuture<'_, Option<Competition>> {
        self.apply(move |s| Ok(s.competitions.get(&id).cloned()))
    }

    fn save_competition(&mut self, competition: Competition) -> LedgerFuture<'_, ()> {
        self.apply(move |s| {
            s.competitions.insert(competition.id, competition);
            Ok(())
        })
    }

    fn compare_and_set_tickets_sold(
        &mut self,
        id: CompetitionId,
        expected: u32,
        new: u32,
    ) -> LedgerFuture<'_, bool> {
        self.apply(move |s| s.compare_and_set_tickets_sold(id, expected, new))
    }

    fn count_active_tickets(
        &mut self,
        user_id: UserId,
        competition_id: CompetitionId,
    ) -> LedgerFuture<'_, u32> {
        self.apply(move |s| Ok(s.count_active_tickets(user_id, competition_id)))
    }

    fn ticket_number_exists(&mut self, number: TicketNumber) -> LedgerFuture<'_, bool> {
        self.apply(move |s| Ok(s.ticket_number_exists(&number)))
    }

    fn insert_tickets(&mut self, tickets: Vec<Ticket>) -> LedgerFuture<'_, ()> {
        self.apply(move |s| s.insert_tickets(tickets))
    }

    fn tickets(&mut self, ids: Vec<TicketId>) -> LedgerFuture<'_, Vec<Ticket>> {
        self.apply(move |s| Ok(ids.iter().filter_map(|id| s.tickets.get(id).cloned()).collect()))
    }

    fn update_ticket_status(
        &mut self,
        ids: Vec<TicketId>,
        status: TicketStatus,
    ) -> LedgerFuture<'_, ()> {
        self.apply(move |s| {
            s.update_ticket_status(&ids, status);
            Ok(())
        })
    }

    fn user_points(&mut self, user_id: UserId) -> LedgerFuture<'_, UserPoints> {
        self.apply(move |s| Ok(s.points_for(user_id)))
    }

    fn save_user_points(&mut self, points: UserPoints) -> LedgerFuture<'_, ()> {
        self.apply(move |s| {
            s.user_points.insert(points.user_id, points);
            Ok(())
        })
    }

    fn append_points_entry(&mut self, entry: PointsEntry) -> LedgerFuture<'_, ()> {
        self.apply(move |s| {
            s.points_history.push(entry);
            Ok(())
        })
    }

    fn points_history(&mut self, user_id: UserId) -> LedgerFuture<'_, Vec<PointsEntry>> {
        self.apply(move |s| Ok(s.history_for(user_id).into_iter().cloned().collect()))
    }

    fn points_settings(&mut self) -> LedgerFuture<'_, PointsSettings> {
        self.apply(|s| Ok(s.points_settings.unwrap_or_default()))
    }

    fn save_points_settings(&mut self, settings: PointsSettings) -> LedgerFuture<'_, ()> {
        self.apply(move |s| {
            s.points_settings = Some(settings);
            Ok(())
        })
    }

    fn cart(&mut self, user_id: UserId) -> LedgerFuture<'_, Vec<CartLine>> {
        self.apply(move |s| {
            Ok(s.carts
                .values()
                .filter(|line| line.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    fn put_cart_line(&mut self, line: CartLine) -> LedgerFuture<'_, ()> {
        self.apply(move |s| {
            s.carts.insert((line.user_id, line.competition_id), line);
            Ok(())
        })
    }

    fn remove_cart_lines(
        &mut self,
        user_id: UserId,
        competitions: Vec<CompetitionId>,
    ) -> LedgerFuture<'_, ()> {
        self.apply(move |s| {
            for competition_id in competitions {
                s.carts.remove(&(user_id, competition_id));
            }
            Ok(())
        })
    }

    fn payment_by_intent(&mut self, intent_id: IntentId) -> LedgerFuture<'_, Option<Payment>> {
        self.apply(move |s| Ok(s.payment_for_intent(&intent_id).cloned()))
    }

    fn payment(&mut self, id: PaymentId) -> LedgerFuture<'_, Option<Payment>> {
        self.apply(move |s| Ok(s.payments.get(&id).cloned()))
    }

    fn insert_payment(&mut self, payment: Payment) -> LedgerFuture<'_, ()> {
        self.apply(move |s| s.insert_payment(payment))
    }

    fn save_payment(&mut self, payment: Payment) -> LedgerFuture<'_, ()> {
        self.apply(move |s| s.save_payment(payment))
    }

    fn commit(self: Box<Self>) -> LedgerFuture<'static, ()> {
        Box::pin(async move {
            if let Access::Transaction { mut guard, working } = self.access {
                *guard = working;
            }
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> LedgerFuture<'static, ()> {
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use raffle_core::types::Money;

    fn competition() -> Competition {
        Competition::new("Watch", Money::from_dollars(2), 10, 5)
    }

    #[tokio::test]
    async fn rollback_discards_transactional_writes() {
        let store = InMemoryLedgerStore::new();
        let comp = store.seed_competition(competition()).await;

        let mut session = store.begin(SessionMode::Transactional).await.unwrap();
        assert!(session
            .compare_and_set_tickets_sold(comp.id, 0, 3)
            .await
            .unwrap());
        session.rollback().await.unwrap();

        let state = store.snapshot().await;
        assert_eq!(state.competitions[&comp.id].tickets_sold, 0);
    }

    #[tokio::test]
    async fn commit_publishes_transactional_writes() {
        let store = InMemoryLedgerStore::new();
        let comp = store.seed_competition(competition()).await;

        let mut session = store.begin(SessionMode::Transactional).await.unwrap();
        session
            .compare_and_set_tickets_sold(comp.id, 0, 3)
            .await
            .unwrap();
        session.commit().await.unwrap();

        let state = store.snapshot().await;
        assert_eq!(state.competitions[&comp.id].tickets_sold, 3);
    }

    #[tokio::test]
    async fn autocommit_writes_are_visible_immediately() {
        let store = InMemoryLedgerStore::standalone();
        let comp = store.seed_competition(competition()).await;

        let mut session = store.begin(SessionMode::Autocommit).await.unwrap();
        assert!(!session.is_transactional());
        session
            .compare_and_set_tickets_sold(comp.id, 0, 1)
            .await
            .unwrap();
        assert_eq!(store.snapshot().await.competitions[&comp.id].tickets_sold, 1);

        // A stale expectation is refused without writing.
        assert!(!session
            .compare_and_set_tickets_sold(comp.id, 0, 2)
            .await
            .unwrap());
        session.rollback().await.unwrap();
        assert_eq!(store.snapshot().await.competitions[&comp.id].tickets_sold, 1);
    }

    #[tokio::test]
    async fn standalone_store_refuses_transactions() {
        let store = InMemoryLedgerStore::standalone();
        assert!(!store.probe_transactions().await.unwrap());
        let err = store.begin(SessionMode::Transactional).await.err().unwrap();
        assert!(err.is_transactions_unsupported());
    }

    #[tokio::test]
    async fn duplicate_ticket_numbers_conflict() {
        let store = InMemoryLedgerStore::new();
        let comp = store.seed_competition(competition()).await;
        let ticket = Ticket {
            id: TicketId::new(),
            ticket_number: TicketNumber::new("RT-1-AAAAAA"),
            user_id: UserId::new(),
            competition_id: comp.id,
            price: comp.ticket_price,
            status: TicketStatus::Active,
            purchase_date: Utc::now(),
            payment_id: None,
        };
        let duplicate = Ticket {
            id: TicketId::new(),
            ..ticket.clone()
        };

        let mut session = store.begin(SessionMode::Autocommit).await.unwrap();
        let err = session
            .insert_tickets(vec![ticket, duplicate])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
        assert!(store.snapshot().await.tickets.is_empty());
    }
}
