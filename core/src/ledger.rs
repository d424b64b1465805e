//! Ledger store abstraction.
//!
//! The ledger holds every durable record the settlement engine mutates:
//! competitions, tickets, payments, points counters and history, carts and
//! the points settings singleton.
//!
//! Work happens through a [`LedgerSession`] obtained from a [`LedgerStore`].
//! A session is either:
//!
//! - **Transactional**: all writes become visible together on
//!   [`commit`](LedgerSession::commit); [`rollback`](LedgerSession::rollback)
//!   discards them. Locking reads (`competition`, `payment`,
//!   `payment_by_intent`) hold the row until the session ends.
//! - **Autocommit**: every write is applied immediately and independently.
//!   `commit` and `rollback` are no-ops.
//!
//! Stores that cannot run multi-record transactions report it through
//! [`LedgerStore::probe_transactions`] and by failing
//! [`LedgerStore::begin`] with [`LedgerError::TransactionsUnsupported`].
//!
//! # Example
//!
//! ```ignore
//! let mut session = store.begin(SessionMode::Transactional).await?;
//! if let Some(competition) = session.competition(id).await? {
//!     session
//!         .compare_and_set_tickets_sold(id, competition.tickets_sold, competition.tickets_sold + 1)
//!         .await?;
//! }
//! session.commit().await?;
//! ```

use crate::types::{
    CartLine, Competition, CompetitionId, IntentId, Payment, PaymentId, PointsEntry,
    PointsSettings, Ticket, TicketId, TicketNumber, TicketStatus, UserId, UserPoints,
};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by ledger operations.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The store cannot run multi-record transactions.
    ///
    /// This is the only error class that lets a caller fall back to
    /// autocommit sessions.
    #[error("Transactions not supported: {0}")]
    TransactionsUnsupported(String),

    /// A uniqueness constraint was violated (ticket number, intent id).
    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    /// A record expected to exist was missing.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored data could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Whether this error means the store rejected transactions.
    #[must_use]
    pub const fn is_transactions_unsupported(&self) -> bool {
        matches!(self, Self::TransactionsUnsupported(_))
    }
}

/// How a session applies its writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    /// All-or-nothing; rows read with a lock stay locked until commit/rollback.
    Transactional,
    /// Each write commits on its own.
    Autocommit,
}

/// A unit of access to the ledger.
///
/// Read methods that return `Option` yield `None` for missing records;
/// counters and settings fall back to their zero/default values.
pub trait LedgerSession: Send {
    /// Whether writes are deferred until [`commit`](Self::commit).
    fn is_transactional(&self) -> bool;

    /// Load a competition, locking it in transactional sessions.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn competition(&mut self, id: CompetitionId) -> LedgerFuture<'_, Option<Competition>>;

    /// Insert or replace a competition.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn save_competition(&mut self, competition: Competition) -> LedgerFuture<'_, ()>;

    /// Conditionally move `tickets_sold` from `expected` to `new`.
    ///
    /// Returns `false` when the stored value was not `expected`, leaving it
    /// untouched.
    ///
    /// # Errors
    ///
    /// - `NotFound`: Competition does not exist
    /// - `Database`: Query failed
    fn compare_and_set_tickets_sold(
        &mut self,
        id: CompetitionId,
        expected: u32,
        new: u32,
    ) -> LedgerFuture<'_, bool>;

    /// Count a user's non-refunded tickets in a competition.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn count_active_tickets(
        &mut self,
        user_id: UserId,
        competition_id: CompetitionId,
    ) -> LedgerFuture<'_, u32>;

    /// Whether a ticket number is already taken.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn ticket_number_exists(&mut self, number: TicketNumber) -> LedgerFuture<'_, bool>;

    /// Insert a batch of tickets.
    ///
    /// # Errors
    ///
    /// - `Conflict`: A ticket number already exists
    /// - `Database`: Query failed
    fn insert_tickets(&mut self, tickets: Vec<Ticket>) -> LedgerFuture<'_, ()>;

    /// Load tickets by id. Missing ids are skipped.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn tickets(&mut self, ids: Vec<TicketId>) -> LedgerFuture<'_, Vec<Ticket>>;

    /// Set the status of the given tickets.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn update_ticket_status(
        &mut self,
        ids: Vec<TicketId>,
        status: TicketStatus,
    ) -> LedgerFuture<'_, ()>;

    /// Load a user's points counters.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn user_points(&mut self, user_id: UserId) -> LedgerFuture<'_, UserPoints>;

    /// Insert or replace a user's points counters.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn save_user_points(&mut self, points: UserPoints) -> LedgerFuture<'_, ()>;

    /// Append a points history row.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn append_points_entry(&mut self, entry: PointsEntry) -> LedgerFuture<'_, ()>;

    /// Load a user's points history, oldest first.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    /// - `Serialization`: Stored kind is unknown
    fn points_history(&mut self, user_id: UserId) -> LedgerFuture<'_, Vec<PointsEntry>>;

    /// Load the points settings singleton.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn points_settings(&mut self) -> LedgerFuture<'_, PointsSettings>;

    /// Replace the points settings singleton.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn save_points_settings(&mut self, settings: PointsSettings) -> LedgerFuture<'_, ()>;

    /// Load a user's cart rows.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn cart(&mut self, user_id: UserId) -> LedgerFuture<'_, Vec<CartLine>>;

    /// Insert or replace a cart row.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn put_cart_line(&mut self, line: CartLine) -> LedgerFuture<'_, ()>;

    /// Delete a user's cart rows for the given competitions only.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    fn remove_cart_lines(
        &mut self,
        user_id: UserId,
        competitions: Vec<CompetitionId>,
    ) -> LedgerFuture<'_, ()>;

    /// Load a payment by its gateway intent, locking it in transactional sessions.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    /// - `Serialization`: Stored purchase shape is invalid
    fn payment_by_intent(&mut self, intent_id: IntentId) -> LedgerFuture<'_, Option<Payment>>;

    /// Load a payment by id, locking it in transactional sessions.
    ///
    /// # Errors
    ///
    /// - `Database`: Query failed
    /// - `Serialization`: Stored purchase shape is invalid
    fn payment(&mut self, id: PaymentId) -> LedgerFuture<'_, Option<Payment>>;

    /// Insert a new payment.
    ///
    /// # Errors
    ///
    /// - `Conflict`: The intent id is already recorded
    /// - `Database`: Query failed
    fn insert_payment(&mut self, payment: Payment) -> LedgerFuture<'_, ()>;

    /// Replace an existing payment.
    ///
    /// # Errors
    ///
    /// - `NotFound`: Payment does not exist
    /// - `Database`: Query failed
    fn save_payment(&mut self, payment: Payment) -> LedgerFuture<'_, ()>;

    /// Make the session's writes durable and release its locks.
    ///
    /// # Errors
    ///
    /// - `Database`: Commit failed
    fn commit(self: Box<Self>) -> LedgerFuture<'static, ()>;

    /// Discard the session's writes and release its locks.
    ///
    /// # Errors
    ///
    /// - `Database`: Rollback failed
    fn rollback(self: Box<Self>) -> LedgerFuture<'static, ()>;
}

/// Factory for ledger sessions.
pub trait LedgerStore: Send + Sync {
    /// Check whether this deployment supports multi-record transactions.
    ///
    /// # Errors
    ///
    /// - `Database`: The probe itself could not run
    fn probe_transactions(&self) -> LedgerFuture<'_, bool>;

    /// Open a session.
    ///
    /// # Errors
    ///
    /// - `TransactionsUnsupported`: `Transactional` was requested and the
    ///   store rejected it
    /// - `Database`: Connection could not be acquired
    fn begin(&self, mode: SessionMode) -> LedgerFuture<'_, Box<dyn LedgerSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transactions_unsupported_is_classified_for_fallback() {
        assert!(LedgerError::TransactionsUnsupported("standalone".into())
            .is_transactions_unsupported());
        assert!(!LedgerError::Database("timeout".into()).is_transactions_unsupported());
        assert!(!LedgerError::Conflict("ticket_number".into()).is_transactions_unsupported());
    }

    #[test]
    fn error_display() {
        let err = LedgerError::NotFound("payment 42".into());
        assert_eq!(err.to_string(), "Record not found: payment 42");
    }
}
