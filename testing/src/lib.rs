//! # Raffle Testing
//!
//! Testing utilities for the raffle settlement engine.
//!
//! This crate provides:
//! - [`InMemoryLedgerStore`] with transactional, standalone and
//!   runtime-rejecting modes
//! - [`FixedClock`] for deterministic timestamps
//! - Fixture builders for competitions and payments
//! - proptest strategies for money and points arithmetic
//!
//! ## Example
//!
//! ```ignore
//! use raffle_testing::{InMemoryLedgerStore, fixtures, test_clock};
//!
//! #[tokio::test]
//! async fn sells_a_ticket() {
//!     let store = InMemoryLedgerStore::new();
//!     let competition = store.seed_competition(fixtures::competition()).await;
//!     // build an engine over `store` and purchase...
//! }
//! ```

use chrono::{DateTime, Utc};
use raffle_core::environment::Clock;

pub mod ledger;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use raffle_testing::mocks::FixedClock;
    /// use raffle_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Fixture builders for common test scenarios.
pub mod fixtures {
    use raffle_core::environment::Clock;
    use raffle_core::types::{
        Competition, CompetitionStatus, IntentId, Money, Payment, PurchaseLine, PurchaseShape,
        UserId,
    };

    /// Active competition: $5 tickets, 100 inventory, 10 per person.
    #[must_use]
    pub fn competition() -> Competition {
        Competition::new("Weekend Getaway", Money::from_dollars(5), 100, 10)
    }

    /// Active competition with the given inventory numbers.
    #[must_use]
    pub fn competition_with(
        ticket_price: Money,
        max_tickets: u32,
        max_per_person: u32,
        tickets_sold: u32,
    ) -> Competition {
        Competition {
            tickets_sold,
            ..Competition::new("Supercar Raffle", ticket_price, max_tickets, max_per_person)
        }
    }

    /// Competition that is not on sale.
    #[must_use]
    pub fn closed_competition() -> Competition {
        Competition {
            status: CompetitionStatus::Closed,
            ..competition()
        }
    }

    /// Pending single-purchase payment snapshotting the competition price.
    #[must_use]
    pub fn pending_single_payment(
        intent_id: &str,
        user_id: UserId,
        competition: &Competition,
        quantity: u32,
    ) -> Payment {
        let line = PurchaseLine {
            competition_id: competition.id,
            quantity,
            unit_price: competition.ticket_price,
        };
        let amount = line.subtotal().unwrap_or(Money::ZERO);
        Payment::pending(
            IntentId::new(intent_id),
            user_id,
            amount,
            "usd",
            PurchaseShape::Single(line),
            super::mocks::test_clock().now(),
        )
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use raffle_core::types::Money;

    /// Money amounts up to $100,000.
    pub fn money() -> impl Strategy<Value = Money> {
        (0u64..=10_000_000).prop_map(Money::from_cents)
    }

    /// Non-empty list of cart line subtotals, each at least one cent.
    pub fn line_subtotals() -> impl Strategy<Value = Vec<Money>> {
        prop::collection::vec((1u64..=500_000).prop_map(Money::from_cents), 1..8)
    }
}

// Re-export commonly used items
pub use ledger::{InMemoryLedgerStore, LedgerState};
pub use mocks::{FixedClock, test_clock};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }
}
