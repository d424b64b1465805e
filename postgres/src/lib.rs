//! `PostgreSQL` ledger store for the raffle settlement engine.
//!
//! This crate implements the `LedgerStore` trait from `raffle-core` on top of
//! sqlx. It supports:
//!
//! - Transactional sessions with `SELECT ... FOR UPDATE` row locks
//! - Autocommit sessions for deployments that refuse transactions
//! - Unique constraints on ticket numbers and gateway intent ids
//! - Bundled schema migrations
//!
//! # Example
//!
//! ```ignore
//! use raffle_postgres::PostgresLedgerStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresLedgerStore::new("postgres://localhost/raffle", 10).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod ledger;

pub use ledger::PostgresLedgerStore;
