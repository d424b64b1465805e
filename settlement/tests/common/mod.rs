//! Shared setup for settlement integration tests.

#![allow(dead_code)]

use raffle_core::environment::Clock;
use raffle_core::types::IntentId;
use raffle_settlement::config::SettlementConfig;
use raffle_settlement::{MockPaymentGateway, SettlementEngine};
use raffle_testing::{InMemoryLedgerStore, test_clock};
use serde_json::json;
use std::sync::Arc;

/// Engine wired to an in-memory ledger, a mock gateway and a fixed clock.
pub struct Harness {
    pub store: InMemoryLedgerStore,
    pub gateway: MockPaymentGateway,
    pub engine: Arc<SettlementEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(InMemoryLedgerStore::new(), SettlementConfig::default())
    }

    pub fn with_store(store: InMemoryLedgerStore, config: SettlementConfig) -> Self {
        let gateway = MockPaymentGateway::new();
        let engine = SettlementEngine::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(test_clock()),
            config,
        );
        Self {
            store,
            gateway,
            engine: Arc::new(engine),
        }
    }

    /// Signed webhook body and header for `event_type` on `intent_id`.
    pub fn signed_event(
        &self,
        event_type: &str,
        intent_id: &IntentId,
        payload: serde_json::Value,
    ) -> (Vec<u8>, String) {
        let body = serde_json::to_vec(&json!({
            "type": event_type,
            "intent_id": intent_id,
            "payload": payload,
        }))
        .unwrap_or_default();
        let signature = self
            .engine
            .webhooks()
            .sign(&body, test_clock().now().timestamp())
            .expect("test secret signs");
        (body, signature)
    }

    /// Deliver a signed event through the public webhook entry point.
    pub async fn deliver(
        &self,
        event_type: &str,
        intent_id: &IntentId,
    ) -> raffle_settlement::Result<raffle_settlement::SettlementOutcome> {
        let (body, signature) =
            self.signed_event(event_type, intent_id, json!({ "id": intent_id }));
        self.engine.handle_webhook(&body, &signature).await
    }
}
