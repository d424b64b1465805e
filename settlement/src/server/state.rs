//! Application state for the settlement HTTP server.

use crate::app::SettlementEngine;
use std::sync::Arc;

/// Application state shared across all HTTP handlers.
///
/// Cloned (cheaply via Arc) for each request.
#[derive(Clone)]
pub struct AppState {
    /// Settlement engine
    pub engine: Arc<SettlementEngine>,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub const fn new(engine: Arc<SettlementEngine>) -> Self {
        Self { engine }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_clone() {
        fn assert_clone<T: Clone + Send + Sync + 'static>() {}
        assert_clone::<AppState>();
    }
}
