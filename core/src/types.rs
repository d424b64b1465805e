//! Domain types for the raffle settlement engine.
//!
//! Value objects (identifiers, [`Money`]), entities persisted by the
//! [`LedgerSession`](crate::ledger::LedgerSession) and the status enums that
//! drive the payment lifecycle.

use crate::ledger::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a competition
    CompetitionId
);
uuid_id!(
    /// Unique identifier for a ticket
    TicketId
);
uuid_id!(
    /// Unique identifier for a payment record
    PaymentId
);
uuid_id!(
    /// Unique identifier for a user (issued by the external auth layer)
    UserId
);
uuid_id!(
    /// Unique identifier for a points history entry
    PointsEntryId
);

/// Gateway correlation key for a payment (e.g. `pi_123`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(String);

impl IntentId {
    /// Wraps a gateway-issued intent id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Human-readable, store-unique ticket number printed on receipts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketNumber(String);

impl TicketNumber {
    /// Wraps a generated ticket number
    #[must_use]
    pub fn new(number: impl Into<String>) -> Self {
        Self(number.into())
    }

    /// Borrow the raw number
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Money Value Object (cents-based to avoid floating point errors)
// ============================================================================

/// Represents money in cents to avoid floating-point arithmetic errors
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero amount
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    /// Creates a `Money` value from dollars
    ///
    /// # Panics
    ///
    /// Panics if the conversion would overflow (dollars * 100 > `u64::MAX`).
    /// Use `checked_from_dollars` for non-panicking conversion.
    #[must_use]
    #[allow(clippy::panic)]
    pub const fn from_dollars(dollars: u64) -> Self {
        match dollars.checked_mul(100) {
            Some(cents) => Self(cents),
            None => panic!("Money::from_dollars overflow"),
        }
    }

    /// Creates a `Money` value from dollars with overflow checking
    #[must_use]
    pub const fn checked_from_dollars(dollars: u64) -> Option<Self> {
        match dollars.checked_mul(100) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(&self) -> u64 {
        self.0
    }

    /// Returns the amount in whole dollars (rounded down)
    #[must_use]
    pub const fn dollars(&self) -> u64 {
        self.0 / 100
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Subtracts two money amounts (returns None if result would be negative)
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        if self.0 >= other.0 {
            Some(Self(self.0 - other.0))
        } else {
            None
        }
    }

    /// Subtracts, flooring the result at zero
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Multiplies money by a quantity with overflow checking
    #[must_use]
    pub const fn checked_multiply(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as u64) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}.{:02}", self.0 / 100, self.0 % 100)
    }
}

// ============================================================================
// Competitions and tickets
// ============================================================================

/// Lifecycle of a competition. Only `Active` competitions sell tickets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompetitionStatus {
    /// Announced, not yet on sale
    Upcoming,
    /// On sale
    Active,
    /// Sales closed, draw pending
    Closed,
    /// Draw complete
    Completed,
}

impl CompetitionStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Upcoming => "upcoming",
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Completed => "completed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "upcoming" => Ok(Self::Upcoming),
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            "completed" => Ok(Self::Completed),
            _ => Err(LedgerError::Serialization(format!(
                "Invalid competition status: {s}"
            ))),
        }
    }
}

/// A time-boxed raffle with a fixed ticket inventory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competition {
    /// Competition ID
    pub id: CompetitionId,
    /// Display title
    pub title: String,
    /// Current ticket price
    pub ticket_price: Money,
    /// Total inventory
    pub max_tickets: u32,
    /// Per-user cap on non-refunded tickets
    pub max_per_person: u32,
    /// Tickets committed so far (`0..=max_tickets`)
    pub tickets_sold: u32,
    /// Lifecycle status
    pub status: CompetitionStatus,
}

impl Competition {
    /// Creates an active competition with nothing sold.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        ticket_price: Money,
        max_tickets: u32,
        max_per_person: u32,
    ) -> Self {
        Self {
            id: CompetitionId::new(),
            title: title.into(),
            ticket_price,
            max_tickets,
            max_per_person,
            tickets_sold: 0,
            status: CompetitionStatus::Active,
        }
    }

    /// Whether tickets can currently be sold
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == CompetitionStatus::Active
    }

    /// Remaining inventory
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.max_tickets.saturating_sub(self.tickets_sold)
    }
}

/// Status of an issued ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    /// Entered into the draw
    Active,
    /// Drawn as a winner
    Won,
    /// Not drawn
    Lost,
    /// Payment refunded
    Refunded,
}

impl TicketStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Won => "won",
            Self::Lost => "lost",
            Self::Refunded => "refunded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "active" => Ok(Self::Active),
            "won" => Ok(Self::Won),
            "lost" => Ok(Self::Lost),
            "refunded" => Ok(Self::Refunded),
            _ => Err(LedgerError::Serialization(format!(
                "Invalid ticket status: {s}"
            ))),
        }
    }
}

/// One uniquely numbered entry into a competition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket ID
    pub id: TicketId,
    /// Public receipt number
    pub ticket_number: TicketNumber,
    /// Owner
    pub user_id: UserId,
    /// Competition entered
    pub competition_id: CompetitionId,
    /// Price snapshot at purchase time
    pub price: Money,
    /// Current status
    pub status: TicketStatus,
    /// When the ticket was issued
    pub purchase_date: DateTime<Utc>,
    /// Settling payment, absent for direct purchases
    pub payment_id: Option<PaymentId>,
}

// ============================================================================
// Payments
// ============================================================================

/// Payment lifecycle driven by gateway callbacks.
///
/// ```text
/// pending ──► processing ──► succeeded ──► refunded
///    │             │
///    ├─────────────┼──► failed ──► pending (retry)
///    └─────────────┴──► canceled
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Intent created, awaiting the gateway
    Pending,
    /// Gateway reported the charge in flight
    Processing,
    /// Charge captured
    Succeeded,
    /// Charge failed
    Failed,
    /// Intent canceled
    Canceled,
    /// Refunded after success
    Refunded,
}

impl PaymentStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Refunded => "refunded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "refunded" => Ok(Self::Refunded),
            _ => Err(LedgerError::Serialization(format!(
                "Invalid payment status: {s}"
            ))),
        }
    }

    /// Whether `self → next` is a legal lifecycle step.
    ///
    /// `failed → succeeded` is allowed because a gateway may report a late
    /// success for the same intent after an earlier failure.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (
                    Self::Pending | Self::Processing,
                    Self::Succeeded | Self::Failed | Self::Canceled
                )
                | (Self::Failed, Self::Pending | Self::Succeeded)
                | (Self::Succeeded, Self::Refunded)
        )
    }

    /// No further transitions are possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Refunded)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One competition line of a purchase, with the unit price snapshotted at
/// intent creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLine {
    /// Competition purchased
    pub competition_id: CompetitionId,
    /// Tickets purchased
    pub quantity: u32,
    /// Unit price at intent time
    pub unit_price: Money,
}

impl PurchaseLine {
    /// `unit_price × quantity`, `None` on overflow
    #[must_use]
    pub const fn subtotal(&self) -> Option<Money> {
        self.unit_price.checked_multiply(self.quantity)
    }
}

/// What a payment buys. Settlement reads this, never fresh client input.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "payment_type", rename_all = "snake_case")]
pub enum PurchaseShape {
    /// Tickets for one competition
    #[serde(rename = "single_purchase")]
    Single(PurchaseLine),
    /// Snapshot of the user's cart at checkout
    #[serde(rename = "cart_checkout")]
    Cart {
        /// Active cart lines that were charged
        items: Vec<PurchaseLine>,
        /// Sum of line subtotals before discount
        cart_total: Money,
        /// Points redeemed for the discount
        points_redeemed: u64,
        /// Discount applied to the charge
        discount: Money,
    },
}

impl PurchaseShape {
    /// Wire name of the shape
    #[must_use]
    pub const fn payment_type(&self) -> &'static str {
        match self {
            Self::Single(_) => "single_purchase",
            Self::Cart { .. } => "cart_checkout",
        }
    }

    /// Lines to issue tickets for
    #[must_use]
    pub fn lines(&self) -> &[PurchaseLine] {
        match self {
            Self::Single(line) => std::slice::from_ref(line),
            Self::Cart { items, .. } => items,
        }
    }

    /// Points redeemed by this purchase
    #[must_use]
    pub const fn points_redeemed(&self) -> u64 {
        match self {
            Self::Single(_) => 0,
            Self::Cart {
                points_redeemed, ..
            } => *points_redeemed,
        }
    }
}

/// A gateway-backed purchase and its settlement state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment ID
    pub id: PaymentId,
    /// Gateway correlation key (unique)
    pub intent_id: IntentId,
    /// Purchaser
    pub user_id: UserId,
    /// Amount charged
    pub amount: Money,
    /// ISO currency code
    pub currency: String,
    /// Lifecycle status
    pub status: PaymentStatus,
    /// What is being bought
    pub purchase: PurchaseShape,
    /// Idempotency guard; flips to `true` exactly once
    pub tickets_created: bool,
    /// Tickets issued by settlement
    pub ticket_ids: Vec<TicketId>,
    /// Reason for failure or rejected settlement
    pub failure_reason: Option<String>,
    /// Raw gateway callback payload, kept for audit
    pub gateway_payload: Option<serde_json::Value>,
    /// Amount refunded
    pub refund_amount: Option<Money>,
    /// Operator-supplied refund reason
    pub refund_reason: Option<String>,
    /// When the refund was confirmed
    pub refunded_at: Option<DateTime<Utc>>,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Last updated at
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// A fresh `pending` payment for a gateway intent.
    #[must_use]
    pub fn pending(
        intent_id: IntentId,
        user_id: UserId,
        amount: Money,
        currency: impl Into<String>,
        purchase: PurchaseShape,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            intent_id,
            user_id,
            amount,
            currency: currency.into(),
            status: PaymentStatus::Pending,
            purchase,
            tickets_created: false,
            ticket_ids: Vec::new(),
            failure_reason: None,
            gateway_payload: None,
            refund_amount: None,
            refund_reason: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn transition_to(&mut self, next: PaymentStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = at;
        true
    }
}

// ============================================================================
// Points
// ============================================================================

/// Cached loyalty counters for a user. `PointsEntry` rows are the source of
/// truth; these are kept in step inside the same unit of work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPoints {
    /// Owner
    pub user_id: UserId,
    /// Current balance
    pub total_points: u64,
    /// Lifetime points earned
    pub total_earned: u64,
    /// Lifetime money spent (net of refunds)
    pub total_spent: Money,
    /// Lifetime points redeemed
    pub total_redeemed: u64,
}

impl UserPoints {
    /// Zeroed counters for a user with no history
    #[must_use]
    pub const fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            total_points: 0,
            total_earned: 0,
            total_spent: Money::ZERO,
            total_redeemed: 0,
        }
    }
}

/// Direction of a points movement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointsKind {
    /// Credited for a purchase
    Earned,
    /// Debited outside of checkout
    Spent,
    /// Debited as a checkout discount
    Redeemed,
}

impl PointsKind {
    /// Convert kind to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Earned => "earned",
            Self::Spent => "spent",
            Self::Redeemed => "redeemed",
        }
    }

    /// Parse kind from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known kind.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "earned" => Ok(Self::Earned),
            "spent" => Ok(Self::Spent),
            "redeemed" => Ok(Self::Redeemed),
            _ => Err(LedgerError::Serialization(format!(
                "Invalid points kind: {s}"
            ))),
        }
    }
}

/// Append-only points history row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsEntry {
    /// Entry ID
    pub id: PointsEntryId,
    /// Owner
    pub user_id: UserId,
    /// Direction
    pub kind: PointsKind,
    /// Points moved (> 0)
    pub amount: u64,
    /// Human-readable description
    pub description: String,
    /// Payment that caused the movement
    pub payment_id: Option<PaymentId>,
    /// Recorded at
    pub created_at: DateTime<Utc>,
}

/// Singleton points configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsSettings {
    /// Points credited per whole dollar spent
    pub points_per_dollar: u64,
    /// Whether purchases accrue points at all
    pub is_active: bool,
}

impl Default for PointsSettings {
    fn default() -> Self {
        Self {
            points_per_dollar: 1,
            is_active: true,
        }
    }
}

// ============================================================================
// Cart
// ============================================================================

/// One `(user, competition)` cart row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    /// Owner
    pub user_id: UserId,
    /// Competition in the cart
    pub competition_id: CompetitionId,
    /// Tickets wanted (≥ 1)
    pub quantity: u32,
}
