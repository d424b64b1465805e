//! Transaction coordinator.
//!
//! Runs a [`UnitOfWork`] against the ledger, transactionally when the store
//! supports it and as independent autocommit writes when it does not.
//!
//! Capability is an explicit state machine seeded from configuration:
//!
//! ```text
//!            probe ok            runtime TransactionsUnsupported (auto only)
//! Unknown ─────────────► Supported ─────────────────────────────► Unsupported
//!    │                                                                 ▲
//!    └──────────────────────── probe says no ──────────────────────────┘
//! ```
//!
//! `enabled` starts at `Supported` and never downgrades. `disabled` starts at
//! `Unsupported`. Transitions are logged and counted.

use crate::error::{Result, SettlementError};
use crate::metrics;
use futures::future::BoxFuture;
use raffle_core::ledger::{LedgerError, LedgerSession, LedgerStore, SessionMode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Mutex;

/// Configured transaction behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionSupport {
    /// Probe once, downgrade on runtime rejection
    Auto,
    /// Always transactional; rejections propagate
    Enabled,
    /// Always sequential
    Disabled,
}

impl FromStr for TransactionSupport {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "enabled" | "true" | "on" => Ok(Self::Enabled),
            "disabled" | "false" | "off" => Ok(Self::Disabled),
            other => Err(format!("unknown transaction support mode: {other}")),
        }
    }
}

/// What the coordinator currently believes about the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionCapability {
    /// Not probed yet
    Unknown,
    /// Units run inside a transaction
    Supported,
    /// Units run as sequential autocommit writes
    Unsupported,
}

impl TransactionCapability {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Supported => 1,
            Self::Unsupported => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Supported,
            2 => Self::Unsupported,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for TransactionCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Supported => "supported",
            Self::Unsupported => "unsupported",
        })
    }
}

/// A sequence of ledger reads and writes that should commit together.
///
/// `run` may be invoked twice for one call to
/// [`TransactionCoordinator::run`]: once inside a transaction that the store
/// rejected, then again sequentially. It must not keep state between runs.
pub trait UnitOfWork: Send + Sync {
    /// Value produced on success
    type Output: Send;

    /// Short name for logs and metrics
    fn name(&self) -> &'static str;

    /// Perform the work against `session`.
    fn run<'a>(&'a self, session: &'a mut dyn LedgerSession) -> BoxFuture<'a, Result<Self::Output>>;
}

/// Runs units of work with the best atomicity the store offers.
pub struct TransactionCoordinator {
    store: Arc<dyn LedgerStore>,
    support: TransactionSupport,
    capability: AtomicU8,
    probe_lock: Mutex<()>,
}

impl TransactionCoordinator {
    /// Create a coordinator over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, support: TransactionSupport) -> Self {
        let initial = match support {
            TransactionSupport::Auto => TransactionCapability::Unknown,
            TransactionSupport::Enabled => TransactionCapability::Supported,
            TransactionSupport::Disabled => TransactionCapability::Unsupported,
        };
        Self {
            store,
            support,
            capability: AtomicU8::new(initial.to_u8()),
            probe_lock: Mutex::new(()),
        }
    }

    /// Current capability
    #[must_use]
    pub fn capability(&self) -> TransactionCapability {
        TransactionCapability::from_u8(self.capability.load(Ordering::Acquire))
    }

    /// Configured mode
    #[must_use]
    pub const fn support(&self) -> TransactionSupport {
        self.support
    }

    /// The store units run against
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Run `unit`, committing atomically when possible.
    ///
    /// In transactional mode any error rolls back and propagates. In `auto`
    /// mode a [`LedgerError::TransactionsUnsupported`] downgrades the
    /// capability and the whole unit is re-run sequentially.
    ///
    /// # Errors
    ///
    /// Returns the unit's error, or a ledger error from begin/commit.
    pub async fn run<U: UnitOfWork>(&self, unit: &U) -> Result<U::Output> {
        if self.resolve_capability().await? == TransactionCapability::Supported {
            match self.run_transactional(unit).await {
                Err(SettlementError::Ledger(err))
                    if err.is_transactions_unsupported()
                        && self.support == TransactionSupport::Auto =>
                {
                    self.downgrade(unit.name(), &err);
                }
                other => return other,
            }
        }
        self.run_sequential(unit).await
    }

    async fn resolve_capability(&self) -> Result<TransactionCapability> {
        let current = self.capability();
        if current != TransactionCapability::Unknown {
            return Ok(current);
        }

        let _guard = self.probe_lock.lock().await;
        let current = self.capability();
        if current != TransactionCapability::Unknown {
            return Ok(current);
        }

        let supported = self.store.probe_transactions().await?;
        let resolved = if supported {
            TransactionCapability::Supported
        } else {
            TransactionCapability::Unsupported
        };
        self.capability.store(resolved.to_u8(), Ordering::Release);
        tracing::info!(capability = %resolved, "Ledger transaction capability detected");
        if resolved == TransactionCapability::Unsupported {
            tracing::warn!(
                "Ledger does not support transactions; units of work will commit each write \
                 independently and a failure can leave partial state"
            );
        }
        Ok(resolved)
    }

    fn downgrade(&self, unit: &'static str, err: &LedgerError) {
        let previous = self.capability.swap(
            TransactionCapability::Unsupported.to_u8(),
            Ordering::AcqRel,
        );
        if TransactionCapability::from_u8(previous) == TransactionCapability::Supported {
            tracing::warn!(
                unit,
                error = %err,
                from = %TransactionCapability::Supported,
                to = %TransactionCapability::Unsupported,
                "Store rejected transaction; downgrading to sequential writes"
            );
            metrics::record_transaction_downgrade(unit);
        }
    }

    async fn run_transactional<U: UnitOfWork>(&self, unit: &U) -> Result<U::Output> {
        let mut session = self.store.begin(SessionMode::Transactional).await?;
        match unit.run(&mut *session).await {
            Ok(output) => {
                session.commit().await?;
                Ok(output)
            }
            Err(err) => {
                if let Err(rollback) = session.rollback().await {
                    tracing::error!(
                        unit = unit.name(),
                        error = %rollback,
                        "Rollback failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_sequential<U: UnitOfWork>(&self, unit: &U) -> Result<U::Output> {
        let mut session = self.store.begin(SessionMode::Autocommit).await?;
        let result = unit.run(&mut *session).await;
        if let Err(err) = &result {
            tracing::warn!(
                unit = unit.name(),
                error = %err,
                "Unit of work failed without a transaction; writes made before the failure remain"
            );
        }
        session.commit().await?;
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use raffle_core::types::{Competition, CompetitionId, Money};
    use raffle_testing::InMemoryLedgerStore;

    /// Bumps `tickets_sold` by one, then optionally fails.
    struct SellOne {
        competition_id: CompetitionId,
        fail_after_write: bool,
    }

    impl UnitOfWork for SellOne {
        type Output = u32;

        fn name(&self) -> &'static str {
            "sell_one"
        }

        fn run<'a>(&'a self, session: &'a mut dyn LedgerSession) -> BoxFuture<'a, Result<u32>> {
            Box::pin(async move {
                let competition = session
                    .competition(self.competition_id)
                    .await?
                    .ok_or(SettlementError::CompetitionNotFound)?;
                let sold = competition.tickets_sold + 1;
                session
                    .compare_and_set_tickets_sold(self.competition_id, competition.tickets_sold, sold)
                    .await?;
                if self.fail_after_write {
                    return Err(SettlementError::ConcurrentModification);
                }
                Ok(sold)
            })
        }
    }

    async fn setup(store: &InMemoryLedgerStore) -> CompetitionId {
        store
            .seed_competition(Competition::new("Bike", Money::from_dollars(1), 10, 10))
            .await
            .id
    }

    #[tokio::test]
    async fn probes_once_and_caches() {
        let store = InMemoryLedgerStore::new();
        let id = setup(&store).await;
        let coordinator = TransactionCoordinator::new(Arc::new(store.clone()), TransactionSupport::Auto);
        assert_eq!(coordinator.capability(), TransactionCapability::Unknown);

        for _ in 0..3 {
            coordinator
                .run(&SellOne { competition_id: id, fail_after_write: false })
                .await
                .unwrap();
        }

        assert_eq!(store.probe_count(), 1);
        assert_eq!(coordinator.capability(), TransactionCapability::Supported);
        assert_eq!(store.snapshot().await.competitions[&id].tickets_sold, 3);
    }

    #[tokio::test]
    async fn transactional_failure_rolls_back() {
        let store = InMemoryLedgerStore::new();
        let id = setup(&store).await;
        let coordinator = TransactionCoordinator::new(Arc::new(store.clone()), TransactionSupport::Auto);

        let err = coordinator
            .run(&SellOne { competition_id: id, fail_after_write: true })
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::ConcurrentModification));
        assert_eq!(store.snapshot().await.competitions[&id].tickets_sold, 0);
    }

    #[tokio::test]
    async fn sequential_failure_keeps_earlier_writes() {
        let store = InMemoryLedgerStore::standalone();
        let id = setup(&store).await;
        let coordinator = TransactionCoordinator::new(Arc::new(store.clone()), TransactionSupport::Auto);

        coordinator
            .run(&SellOne { competition_id: id, fail_after_write: true })
            .await
            .unwrap_err();

        assert_eq!(coordinator.capability(), TransactionCapability::Unsupported);
        assert_eq!(store.snapshot().await.competitions[&id].tickets_sold, 1);
    }

    #[tokio::test]
    async fn runtime_rejection_downgrades_and_reruns_sequentially() {
        let store = InMemoryLedgerStore::rejecting_transactions();
        let id = setup(&store).await;
        let coordinator = TransactionCoordinator::new(Arc::new(store.clone()), TransactionSupport::Auto);

        let sold = coordinator
            .run(&SellOne { competition_id: id, fail_after_write: false })
            .await
            .unwrap();
        assert_eq!(sold, 1);
        assert_eq!(coordinator.capability(), TransactionCapability::Unsupported);
        assert_eq!(store.transactional_begin_count(), 1);

        // Cached: no further transactional attempts.
        coordinator
            .run(&SellOne { competition_id: id, fail_after_write: false })
            .await
            .unwrap();
        assert_eq!(store.transactional_begin_count(), 1);
        assert_eq!(store.snapshot().await.competitions[&id].tickets_sold, 2);
    }

    #[tokio::test]
    async fn enabled_mode_does_not_downgrade() {
        let store = InMemoryLedgerStore::rejecting_transactions();
        let id = setup(&store).await;
        let coordinator =
            TransactionCoordinator::new(Arc::new(store.clone()), TransactionSupport::Enabled);

        let err = coordinator
            .run(&SellOne { competition_id: id, fail_after_write: false })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SettlementError::Ledger(LedgerError::TransactionsUnsupported(_))
        ));
        assert_eq!(coordinator.capability(), TransactionCapability::Supported);
        assert_eq!(store.probe_count(), 0);
        assert_eq!(store.snapshot().await.competitions[&id].tickets_sold, 0);
    }

    #[tokio::test]
    async fn disabled_mode_never_opens_transactions() {
        let store = InMemoryLedgerStore::new();
        let id = setup(&store).await;
        let coordinator =
            TransactionCoordinator::new(Arc::new(store.clone()), TransactionSupport::Disabled);

        coordinator
            .run(&SellOne { competition_id: id, fail_after_write: false })
            .await
            .unwrap();

        assert_eq!(store.probe_count(), 0);
        assert_eq!(store.transactional_begin_count(), 0);
    }

    #[test]
    fn parses_support_modes() {
        assert_eq!("auto".parse::<TransactionSupport>(), Ok(TransactionSupport::Auto));
        assert_eq!("ENABLED".parse::<TransactionSupport>(), Ok(TransactionSupport::Enabled));
        assert_eq!("off".parse::<TransactionSupport>(), Ok(TransactionSupport::Disabled));
        assert!("maybe".parse::<TransactionSupport>().is_err());
    }
}
