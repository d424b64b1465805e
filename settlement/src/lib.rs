//! # Raffle Settlement
//!
//! Ticket issuance and payment settlement for limited-inventory raffle
//! competitions.
//!
//! The engine:
//!
//! - reserves scarce inventory under concurrent demand,
//! - generates collision-free ticket numbers,
//! - turns an asynchronous gateway callback into an exactly-once set of
//!   ledger mutations (tickets, inventory, loyalty points, cart),
//! - reverses that state on refund.
//!
//! # Architecture
//!
//! ```text
//!   HTTP (axum)                         Gateway webhook
//!       │                                     │
//!       ▼                                     ▼
//! ┌──────────────┐                   ┌──────────────────┐
//! │   Purchase   │── create_intent ─►│ Payment gateway  │
//! │ orchestrator │                   └──────────────────┘
//! └──────────────┘                            │
//!       │                             ┌──────────────────┐
//!       │                             │    Settlement    │
//!       │                             │     handler      │
//!       │                             └──────────────────┘
//!       ▼                                     ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ Transaction coordinator (transactional / sequential) │
//! └──────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//!                 LedgerStore (PostgreSQL)
//! ```
//!
//! Every multi-record mutation is a [`UnitOfWork`](coordinator::UnitOfWork)
//! run by the [`TransactionCoordinator`](coordinator::TransactionCoordinator),
//! which commits atomically when the store supports transactions and falls
//! back to ordered autocommit writes when it does not.

pub mod api;
pub mod app;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod payment_gateway;
pub mod points;
pub mod purchase;
pub mod refund;
pub mod server;
pub mod settlement;
pub mod ticket_number;

pub use app::SettlementEngine;
pub use config::Config;
pub use coordinator::{TransactionCapability, TransactionCoordinator, TransactionSupport};
pub use error::{ErrorKind, Result, SettlementError};
pub use payment_gateway::{MockPaymentGateway, PaymentGateway};
pub use settlement::{GatewayEvent, SettlementOutcome, WebhookVerifier};
