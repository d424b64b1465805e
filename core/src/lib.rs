//! # Raffle Core
//!
//! Domain types and storage traits shared by the raffle settlement engine.
//!
//! ## Core Concepts
//!
//! - **Competition**: a time-boxed raffle with a fixed ticket inventory
//! - **Ticket**: one uniquely numbered entry into a competition
//! - **Payment**: a gateway-backed purchase with an idempotent settlement flag
//! - **Points ledger**: append-only history backing each user's loyalty balance
//! - **Ledger store**: durable storage with optional multi-record transactions
//!
//! Business logic lives in `raffle-settlement`; this crate only defines the
//! vocabulary and the [`ledger::LedgerStore`] seam it is written against.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod ledger;
pub mod types;

/// Environment module - injected dependencies
///
/// External dependencies are abstracted behind traits so tests can swap in
/// deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use raffle_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
