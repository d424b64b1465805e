//! Settlement engine errors.

use raffle_core::ledger::LedgerError;
use raffle_core::types::{Money, PaymentStatus};
use thiserror::Error;

use crate::payment_gateway::GatewayError;

/// How an error should be reported to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or a business rule refused the request; nothing was written
    Validation,
    /// A referenced record does not exist (or is not visible to the caller)
    NotFound,
    /// The record is in the wrong state for the operation
    Precondition,
    /// Webhook authentication failed
    Unauthorized,
    /// Lost a race with a concurrent writer
    Conflict,
    /// Gateway or store failure
    Internal,
}

/// Errors raised by purchase, settlement, refund and retry operations.
#[derive(Error, Debug)]
pub enum SettlementError {
    /// Quantity must be at least one
    #[error("Quantity must be at least 1")]
    InvalidQuantity,

    /// Competition does not exist
    #[error("Competition not found")]
    CompetitionNotFound,

    /// Competition is not on sale
    #[error("Competition is not active")]
    CompetitionNotActive,

    /// Not enough inventory left
    #[error("Not enough tickets available. Only {remaining} left.")]
    InsufficientInventory {
        /// Tickets still unsold
        remaining: u32,
    },

    /// Per-person cap would be exceeded
    #[error("You can purchase up to {remaining} more tickets for this competition.")]
    PerPersonLimit {
        /// Competition cap
        limit: u32,
        /// How many more the user may buy
        remaining: u32,
    },

    /// No active competitions in the cart
    #[error("Cart is empty or contains no active competitions")]
    EmptyCart,

    /// Redemption below the minimum
    #[error("A minimum of {minimum} points is required to redeem")]
    RedemptionBelowMinimum {
        /// Configured minimum
        minimum: u64,
    },

    /// Not enough points to redeem or spend
    #[error("Insufficient points: requested {requested}, balance {balance}")]
    InsufficientPoints {
        /// Points requested
        requested: u64,
        /// Current balance
        balance: u64,
    },

    /// Charge below what the gateway accepts
    #[error("Amount to charge ({amount}) is below the minimum payable amount of {minimum}")]
    BelowMinimumCharge {
        /// Computed charge
        amount: Money,
        /// Gateway floor
        minimum: Money,
    },

    /// Arithmetic overflow on money
    #[error("Amount overflow")]
    AmountOverflow,

    /// Payment does not exist
    #[error("Payment not found")]
    PaymentNotFound,

    /// Payment is in the wrong state for the operation
    #[error("Payment is {actual}; {operation} requires {required}")]
    InvalidPaymentState {
        /// Operation attempted
        operation: &'static str,
        /// Required status
        required: PaymentStatus,
        /// Current status
        actual: PaymentStatus,
    },

    /// Refund amount out of range
    #[error("Refund amount {requested} is invalid for payment of {original}")]
    InvalidRefundAmount {
        /// Requested refund
        requested: Money,
        /// Original charge
        original: Money,
    },

    /// Partial refund without the explicit flag
    #[error("Refund of {requested} is less than {original}; set partial to refund part of a payment")]
    PartialRefundNotAllowed {
        /// Requested refund
        requested: Money,
        /// Original charge
        original: Money,
    },

    /// Webhook signature missing, malformed, stale or wrong
    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    /// Webhook body could not be parsed
    #[error("Malformed webhook payload: {0}")]
    MalformedWebhook(String),

    /// Ticket-number generation hit its attempt bound
    #[error("Could not allocate a unique ticket number after {attempts} attempts")]
    TicketNumberExhausted {
        /// Attempts made for the failing ticket
        attempts: u32,
    },

    /// A concurrent writer changed the competition first
    #[error("Competition inventory changed concurrently, please retry")]
    ConcurrentModification,

    /// Payment gateway failure
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Ledger failure
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl SettlementError {
    /// Classify for reporting.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQuantity
            | Self::CompetitionNotActive
            | Self::InsufficientInventory { .. }
            | Self::PerPersonLimit { .. }
            | Self::EmptyCart
            | Self::RedemptionBelowMinimum { .. }
            | Self::InsufficientPoints { .. }
            | Self::BelowMinimumCharge { .. }
            | Self::AmountOverflow
            | Self::InvalidRefundAmount { .. }
            | Self::PartialRefundNotAllowed { .. }
            | Self::MalformedWebhook(_) => ErrorKind::Validation,
            Self::CompetitionNotFound | Self::PaymentNotFound => ErrorKind::NotFound,
            Self::InvalidPaymentState { .. } => ErrorKind::Precondition,
            Self::InvalidSignature(_) => ErrorKind::Unauthorized,
            Self::ConcurrentModification => ErrorKind::Conflict,
            Self::Ledger(LedgerError::Conflict(_)) => ErrorKind::Conflict,
            Self::TicketNumberExhausted { .. } | Self::Gateway(_) | Self::Ledger(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether settlement should record this as a rejected payment rather
    /// than propagate it.
    #[must_use]
    pub const fn is_business_rejection(&self) -> bool {
        matches!(self.kind(), ErrorKind::Validation | ErrorKind::NotFound)
    }
}

/// Result alias for settlement operations.
pub type Result<T> = std::result::Result<T, SettlementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_remaining_allowances() {
        let err = SettlementError::PerPersonLimit {
            limit: 10,
            remaining: 3,
        };
        assert_eq!(
            err.to_string(),
            "You can purchase up to 3 more tickets for this competition."
        );

        let err = SettlementError::InsufficientInventory { remaining: 0 };
        assert_eq!(err.to_string(), "Not enough tickets available. Only 0 left.");
    }

    #[test]
    fn classification() {
        assert_eq!(
            SettlementError::InvalidPaymentState {
                operation: "retry",
                required: PaymentStatus::Failed,
                actual: PaymentStatus::Succeeded,
            }
            .kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            SettlementError::TicketNumberExhausted { attempts: 50 }.kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            SettlementError::Ledger(LedgerError::Conflict("intent_id".into())).kind(),
            ErrorKind::Conflict
        );
        assert!(SettlementError::InsufficientInventory { remaining: 1 }.is_business_rejection());
        assert!(!SettlementError::ConcurrentModification.is_business_rejection());
    }
}
