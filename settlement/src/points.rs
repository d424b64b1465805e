//! Loyalty points ledger.
//!
//! History rows are the source of truth. `UserPoints` counters are a cache
//! kept in step by writing both inside the same session; [`reconcile`]
//! recomputes the balance from history alone.

use crate::error::{Result, SettlementError};
use crate::metrics;
use chrono::{DateTime, Utc};
use raffle_core::ledger::LedgerSession;
use raffle_core::types::{
    Money, PaymentId, PointsEntry, PointsEntryId, PointsKind, PointsSettings, UserId,
};

/// Points credited for spending `spend`: `floor(cents × points_per_dollar / 100)`.
///
/// Zero when the points programme is inactive.
#[must_use]
pub fn points_for_spend(spend: Money, settings: &PointsSettings) -> u64 {
    if !settings.is_active {
        return 0;
    }
    let points = u128::from(spend.cents()) * u128::from(settings.points_per_dollar) / 100;
    u64::try_from(points).unwrap_or(u64::MAX)
}

/// Discount bought with redeemed points at checkout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Redemption {
    /// Points actually debited
    pub points: u64,
    /// Amount taken off the cart total
    pub discount: Money,
}

impl Redemption {
    /// No redemption
    pub const NONE: Self = Self {
        points: 0,
        discount: Money::ZERO,
    };
}

/// Price a redemption of `requested` points against `cart_total`.
///
/// The discount is whole dollars, `floor(requested / points_per_dollar)`,
/// capped at the cart total. Only the points the discount absorbs are
/// charged, so capping never burns surplus points.
///
/// # Errors
///
/// - [`SettlementError::RedemptionBelowMinimum`] if `requested < minimum`
/// - [`SettlementError::InsufficientPoints`] if `requested > balance`
pub fn quote_redemption(
    requested: u64,
    balance: u64,
    cart_total: Money,
    points_per_dollar: u64,
    minimum: u64,
) -> Result<Redemption> {
    if requested < minimum {
        return Err(SettlementError::RedemptionBelowMinimum { minimum });
    }
    if requested > balance {
        return Err(SettlementError::InsufficientPoints { requested, balance });
    }
    let rate = points_per_dollar.max(1);

    let uncapped = Money::checked_from_dollars(requested / rate)
        .ok_or(SettlementError::AmountOverflow)?;
    if uncapped < cart_total {
        return Ok(Redemption {
            points: (requested / rate) * rate,
            discount: uncapped,
        });
    }

    // Capped: charge ceil(cart_total_cents × rate / 100) points.
    let absorbed = (u128::from(cart_total.cents()) * u128::from(rate)).div_ceil(100);
    Ok(Redemption {
        points: u64::try_from(absorbed).map_err(|_| SettlementError::AmountOverflow)?,
        discount: cart_total,
    })
}

/// A line's share of the charge after the discount is spread pro rata:
/// `item − floor(item × discount / cart_total)`.
#[must_use]
pub fn prorated_spend(item: Money, discount: Money, cart_total: Money) -> Money {
    if cart_total.is_zero() || discount.is_zero() {
        return item;
    }
    let share = u128::from(item.cents()) * u128::from(discount.cents())
        / u128::from(cart_total.cents());
    item.saturating_sub(Money::from_cents(u64::try_from(share).unwrap_or(u64::MAX)))
}

/// Credit `points` to `user_id` with an `earned` history row.
///
/// Zero points writes nothing.
///
/// # Errors
///
/// Returns a ledger error if a read or write fails.
pub async fn earn(
    session: &mut dyn LedgerSession,
    user_id: UserId,
    points: u64,
    description: impl Into<String>,
    payment_id: Option<PaymentId>,
    now: DateTime<Utc>,
) -> Result<()> {
    if points == 0 {
        return Ok(());
    }
    let mut counters = session.user_points(user_id).await?;
    counters.total_points = counters.total_points.saturating_add(points);
    counters.total_earned = counters.total_earned.saturating_add(points);
    session.save_user_points(counters).await?;
    append(session, user_id, PointsKind::Earned, points, description, payment_id, now).await?;

    metrics::record_points_earned(points);
    tracing::debug!(user_id = %user_id, points, "Points earned");
    Ok(())
}

/// Debit `points` as a checkout discount with a `redeemed` history row.
///
/// # Errors
///
/// - [`SettlementError::InsufficientPoints`] if the balance is too low
/// - [`SettlementError::Ledger`] if a read or write fails
pub async fn redeem(
    session: &mut dyn LedgerSession,
    user_id: UserId,
    points: u64,
    payment_id: Option<PaymentId>,
    now: DateTime<Utc>,
) -> Result<()> {
    debit(session, user_id, PointsKind::Redeemed, points, payment_id, now).await?;
    metrics::record_points_redeemed(points);
    Ok(())
}

/// Debit `points` outside of checkout with a `spent` history row.
///
/// # Errors
///
/// - [`SettlementError::InsufficientPoints`] if the balance is too low
/// - [`SettlementError::Ledger`] if a read or write fails
pub async fn spend(
    session: &mut dyn LedgerSession,
    user_id: UserId,
    points: u64,
    payment_id: Option<PaymentId>,
    now: DateTime<Utc>,
) -> Result<()> {
    debit(session, user_id, PointsKind::Spent, points, payment_id, now).await
}

async fn debit(
    session: &mut dyn LedgerSession,
    user_id: UserId,
    kind: PointsKind,
    points: u64,
    payment_id: Option<PaymentId>,
    now: DateTime<Utc>,
) -> Result<()> {
    if points == 0 {
        return Ok(());
    }
    let mut counters = session.user_points(user_id).await?;
    if counters.total_points < points {
        return Err(SettlementError::InsufficientPoints {
            requested: points,
            balance: counters.total_points,
        });
    }
    counters.total_points -= points;
    if kind == PointsKind::Redeemed {
        counters.total_redeemed = counters.total_redeemed.saturating_add(points);
    }
    session.save_user_points(counters).await?;

    let description = match kind {
        PointsKind::Redeemed => format!("Redeemed {points} points at checkout"),
        _ => format!("Spent {points} points"),
    };
    append(session, user_id, kind, points, description, payment_id, now).await?;
    tracing::debug!(user_id = %user_id, points, kind = kind.as_str(), "Points debited");
    Ok(())
}

/// Add `amount` to the user's lifetime spend.
///
/// # Errors
///
/// Returns a ledger error if a read or write fails.
pub async fn record_spend(
    session: &mut dyn LedgerSession,
    user_id: UserId,
    amount: Money,
) -> Result<()> {
    let mut counters = session.user_points(user_id).await?;
    counters.total_spent = counters
        .total_spent
        .checked_add(amount)
        .ok_or(SettlementError::AmountOverflow)?;
    session.save_user_points(counters).await?;
    Ok(())
}

/// Take a refunded `amount` off the user's lifetime spend, floored at zero.
///
/// # Errors
///
/// Returns a ledger error if a read or write fails.
pub async fn reverse_spend(
    session: &mut dyn LedgerSession,
    user_id: UserId,
    amount: Money,
) -> Result<()> {
    let mut counters = session.user_points(user_id).await?;
    counters.total_spent = counters.total_spent.saturating_sub(amount);
    session.save_user_points(counters).await?;
    Ok(())
}

async fn append(
    session: &mut dyn LedgerSession,
    user_id: UserId,
    kind: PointsKind,
    amount: u64,
    description: impl Into<String>,
    payment_id: Option<PaymentId>,
    now: DateTime<Utc>,
) -> Result<()> {
    session
        .append_points_entry(PointsEntry {
            id: PointsEntryId::new(),
            user_id,
            kind,
            amount,
            description: description.into(),
            payment_id,
            created_at: now,
        })
        .await?;
    Ok(())
}

/// Totals recomputed from a user's history.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconciledPoints {
    /// Σ earned
    pub earned: u64,
    /// Σ spent
    pub spent: u64,
    /// Σ redeemed
    pub redeemed: u64,
}

impl ReconciledPoints {
    /// `earned − spent − redeemed`, `None` if the history goes negative
    #[must_use]
    pub fn balance(&self) -> Option<u64> {
        self.earned
            .checked_sub(self.spent)?
            .checked_sub(self.redeemed)
    }
}

/// Sum a history by kind.
#[must_use]
pub fn reconcile(history: &[PointsEntry]) -> ReconciledPoints {
    history
        .iter()
        .fold(ReconciledPoints::default(), |mut totals, entry| {
            let bucket = match entry.kind {
                PointsKind::Earned => &mut totals.earned,
                PointsKind::Spent => &mut totals.spent,
                PointsKind::Redeemed => &mut totals.redeemed,
            };
            *bucket = bucket.saturating_add(entry.amount);
            totals
        })
}

/// Whether the cached balance matches the history.
///
/// # Errors
///
/// Returns a ledger error if a read fails.
pub async fn verify_balance(session: &mut dyn LedgerSession, user_id: UserId) -> Result<bool> {
    let counters = session.user_points(user_id).await?;
    let history = session.points_history(user_id).await?;
    let reconciled = reconcile(&history);
    let consistent = reconciled.balance() == Some(counters.total_points);
    if !consistent {
        tracing::warn!(
            user_id = %user_id,
            cached = counters.total_points,
            earned = reconciled.earned,
            spent = reconciled.spent,
            redeemed = reconciled.redeemed,
            "Points balance does not match history"
        );
    }
    Ok(consistent)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use raffle_core::ledger::{LedgerStore, SessionMode};
    use raffle_testing::{InMemoryLedgerStore, properties};

    fn settings(points_per_dollar: u64) -> PointsSettings {
        PointsSettings {
            points_per_dollar,
            is_active: true,
        }
    }

    #[test]
    fn earning_floors_partial_dollars() {
        assert_eq!(points_for_spend(Money::from_cents(4_599), &settings(1)), 45);
        assert_eq!(points_for_spend(Money::from_cents(4_599), &settings(10)), 459);
        let inactive = PointsSettings {
            is_active: false,
            ..settings(10)
        };
        assert_eq!(points_for_spend(Money::from_dollars(100), &inactive), 0);
    }

    #[test]
    fn redemption_of_500_points_takes_five_dollars_off() {
        let quote = quote_redemption(500, 800, Money::from_dollars(50), 100, 100).unwrap();
        assert_eq!(quote.discount, Money::from_dollars(5));
        assert_eq!(quote.points, 500);
    }

    #[test]
    fn redemption_charges_only_whole_dollar_points() {
        let quote = quote_redemption(550, 800, Money::from_dollars(50), 100, 100).unwrap();
        assert_eq!(quote.discount, Money::from_dollars(5));
        assert_eq!(quote.points, 500);
    }

    #[test]
    fn redemption_capped_at_cart_total() {
        let quote = quote_redemption(2_000, 2_000, Money::from_cents(750), 100, 100).unwrap();
        assert_eq!(quote.discount, Money::from_cents(750));
        assert_eq!(quote.points, 750);
    }

    #[test]
    fn redemption_rules() {
        assert!(matches!(
            quote_redemption(99, 1_000, Money::from_dollars(10), 100, 100),
            Err(SettlementError::RedemptionBelowMinimum { minimum: 100 })
        ));
        assert!(matches!(
            quote_redemption(500, 300, Money::from_dollars(10), 100, 100),
            Err(SettlementError::InsufficientPoints {
                requested: 500,
                balance: 300
            })
        ));
    }

    #[test]
    fn prorating_spreads_discount_across_lines() {
        let total = Money::from_dollars(50);
        let discount = Money::from_dollars(5);
        assert_eq!(
            prorated_spend(Money::from_dollars(30), discount, total),
            Money::from_dollars(27)
        );
        assert_eq!(
            prorated_spend(Money::from_dollars(20), discount, total),
            Money::from_dollars(18)
        );
    }

    proptest! {
        #[test]
        fn prorated_lines_never_undershoot_the_charge(
            lines in properties::line_subtotals(),
            discount_cents in 0u64..=u64::MAX,
        ) {
            let total = lines
                .iter()
                .fold(Money::ZERO, |acc, line| acc.checked_add(*line).unwrap());
            let discount = Money::from_cents(discount_cents % (total.cents() + 1));
            let charged = total.checked_sub(discount).unwrap();

            let prorated: u64 = lines
                .iter()
                .map(|line| prorated_spend(*line, discount, total).cents())
                .sum();

            prop_assert!(prorated >= charged.cents());
            prop_assert!(prorated <= total.cents());
        }

        #[test]
        fn redemption_never_exceeds_request_or_cart(
            cart_total in properties::money(),
            requested in 100u64..=1_000_000,
        ) {
            let quote = quote_redemption(requested, requested, cart_total, 100, 100).unwrap();
            prop_assert!(quote.points <= requested);
            prop_assert!(quote.discount <= cart_total);
        }
    }

    #[tokio::test]
    async fn mutations_keep_history_and_counters_in_step() {
        let store = InMemoryLedgerStore::new();
        let user = UserId::new();
        let now = Utc::now();
        let mut session = store.begin(SessionMode::Autocommit).await.unwrap();

        earn(session.as_mut(), user, 700, "Purchase", None, now).await.unwrap();
        redeem(session.as_mut(), user, 300, None, now).await.unwrap();
        spend(session.as_mut(), user, 50, None, now).await.unwrap();
        record_spend(session.as_mut(), user, Money::from_dollars(20)).await.unwrap();
        reverse_spend(session.as_mut(), user, Money::from_dollars(25)).await.unwrap();

        let counters = session.user_points(user).await.unwrap();
        assert_eq!(counters.total_points, 350);
        assert_eq!(counters.total_earned, 700);
        assert_eq!(counters.total_redeemed, 300);
        assert_eq!(counters.total_spent, Money::ZERO);
        assert_eq!(session.points_history(user).await.unwrap().len(), 3);
        assert!(verify_balance(session.as_mut(), user).await.unwrap());
    }

    #[tokio::test]
    async fn overdraw_is_refused_without_writes() {
        let store = InMemoryLedgerStore::new();
        let user = UserId::new();
        store.grant_points(user, 100).await;
        let mut session = store.begin(SessionMode::Autocommit).await.unwrap();

        let err = redeem(session.as_mut(), user, 101, None, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::InsufficientPoints { .. }));
        assert_eq!(store.snapshot().await.history_for(user).len(), 1);
        assert_eq!(store.snapshot().await.points_for(user).total_points, 100);
    }
}
