//! HTTP API for the settlement engine.
//!
//! Handlers are thin: extract, call the engine, map errors through
//! [`AppError`].

pub mod error;
pub mod extractors;
pub mod payments;
pub mod purchases;
pub mod webhooks;

pub use error::AppError;
pub use extractors::{CurrentUser, USER_ID_HEADER};
