//! Payment gateway port and a mock implementation for development and tests.
//!
//! The engine never authorizes cards itself. It asks the gateway for a charge
//! intent, hands the client secret to the client, and later learns the
//! outcome through a signed webhook. Refunds are requested synchronously and
//! the gateway's confirmation is treated as final.

use raffle_core::types::{IntentId, Money};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Payment gateway result
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Payment gateway error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Gateway refused the request
    #[error("Gateway declined request: {reason}")]
    Declined {
        /// Decline reason
        reason: String,
    },
    /// Intent id unknown to the gateway
    #[error("Unknown payment intent: {0}")]
    UnknownIntent(String),
    /// Gateway timeout
    #[error("Gateway timeout")]
    Timeout,
    /// Other error
    #[error("Payment error: {message}")]
    Other {
        /// Error message
        message: String,
    },
}

/// A charge intent created with the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeIntent {
    /// Gateway correlation key
    pub intent_id: IntentId,
    /// Secret the client uses to complete payment with the gateway
    pub client_secret: String,
}

/// Gateway confirmation of a refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundConfirmation {
    /// Gateway refund id
    pub refund_id: String,
    /// Amount refunded
    pub amount: Money,
}

/// Payment gateway trait
///
/// Abstraction over processors like Stripe. Implementations must be safe to
/// share across request tasks.
pub trait PaymentGateway: Send + Sync {
    /// Create a charge intent for `amount`.
    ///
    /// # Errors
    ///
    /// Returns error if the gateway refuses or cannot be reached
    fn create_intent(
        &self,
        amount: Money,
        currency: &str,
        metadata: HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<ChargeIntent>> + Send + '_>>;

    /// Refund `amount` of a captured intent.
    ///
    /// # Errors
    ///
    /// Returns error if the refund is refused
    fn create_refund(
        &self,
        intent_id: &IntentId,
        amount: Money,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<RefundConfirmation>> + Send + '_>>;
}

/// Mock payment gateway (always succeeds for development)
///
/// Issues sequential `pi_mock_<n>` intent ids and records every call so
/// tests can assert on them. Refunds can be switched to fail.
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway {
    next_intent: Arc<AtomicU64>,
    intents: Arc<Mutex<Vec<(IntentId, Money, HashMap<String, String>)>>>,
    refunds: Arc<Mutex<Vec<(IntentId, Money)>>>,
    decline_refunds: Arc<Mutex<Option<String>>>,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Make subsequent refunds fail with `reason`.
    pub fn decline_refunds(&self, reason: impl Into<String>) {
        if let Ok(mut guard) = self.decline_refunds.lock() {
            *guard = Some(reason.into());
        }
    }

    /// Intents created so far with their amounts
    #[must_use]
    pub fn created_intents(&self) -> Vec<(IntentId, Money)> {
        self.intents
            .lock()
            .map(|intents| {
                intents
                    .iter()
                    .map(|(id, amount, _)| (id.clone(), *amount))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Metadata attached to an intent
    #[must_use]
    pub fn intent_metadata(&self, intent_id: &IntentId) -> Option<HashMap<String, String>> {
        self.intents.lock().ok().and_then(|intents| {
            intents
                .iter()
                .find(|(id, _, _)| id == intent_id)
                .map(|(_, _, metadata)| metadata.clone())
        })
    }

    /// Refunds requested so far
    #[must_use]
    pub fn refunds(&self) -> Vec<(IntentId, Money)> {
        self.refunds
            .lock()
            .map(|refunds| refunds.clone())
            .unwrap_or_default()
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn create_intent(
        &self,
        amount: Money,
        currency: &str,
        metadata: HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<ChargeIntent>> + Send + '_>> {
        let currency = currency.to_string();
        Box::pin(async move {
            let n = self.next_intent.fetch_add(1, Ordering::SeqCst) + 1;
            let intent_id = IntentId::new(format!("pi_mock_{n}"));
            let client_secret = format!("{intent_id}_secret_{}", uuid::Uuid::new_v4().simple());

            self.intents
                .lock()
                .map_err(|e| GatewayError::Other {
                    message: e.to_string(),
                })?
                .push((intent_id.clone(), amount, metadata));

            tracing::info!(
                intent_id = %intent_id,
                amount = amount.cents(),
                currency = %currency,
                "Mock payment intent created"
            );

            Ok(ChargeIntent {
                intent_id,
                client_secret,
            })
        })
    }

    fn create_refund(
        &self,
        intent_id: &IntentId,
        amount: Money,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<RefundConfirmation>> + Send + '_>> {
        let intent_id = intent_id.clone();
        Box::pin(async move {
            let declined = self
                .decline_refunds
                .lock()
                .map_err(|e| GatewayError::Other {
                    message: e.to_string(),
                })?
                .clone();
            if let Some(reason) = declined {
                return Err(GatewayError::Declined { reason });
            }

            self.refunds
                .lock()
                .map_err(|e| GatewayError::Other {
                    message: e.to_string(),
                })?
                .push((intent_id.clone(), amount));

            let refund_id = format!("re_mock_{}", uuid::Uuid::new_v4().simple());
            tracing::info!(
                intent_id = %intent_id,
                amount = amount.cents(),
                refund_id = %refund_id,
                "Mock refund processed successfully"
            );

            Ok(RefundConfirmation { refund_id, amount })
        })
    }
}
