//! Ticket number generation and collision-checked allocation.
//!
//! Numbers look like `RT-M5X2K9QZ-7KQ2HW`: a base-36 millisecond timestamp
//! followed by six characters drawn from an alphabet without look-alike
//! glyphs. Generators only propose candidates; [`allocate_ticket_numbers`]
//! checks each one against the ledger and the current batch.

use crate::error::{Result, SettlementError};
use raffle_core::environment::Clock;
use raffle_core::ledger::LedgerSession;
use raffle_core::types::TicketNumber;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

const PREFIX: &str = "RT";
const SUFFIX_LEN: usize = 6;
const SUFFIX_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Proposes ticket number candidates.
pub trait TicketNumberGenerator: Send + Sync {
    /// Produce a candidate. Uniqueness is checked by the caller.
    fn generate(&self) -> TicketNumber;
}

/// Timestamp-prefixed random generator used in production.
pub struct RandomTicketNumberGenerator {
    clock: Arc<dyn Clock>,
}

impl RandomTicketNumberGenerator {
    /// Generator stamping candidates with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl TicketNumberGenerator for RandomTicketNumberGenerator {
    fn generate(&self) -> TicketNumber {
        let millis = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or_default();
        let mut rng = rand::thread_rng();
        let suffix: String = (0..SUFFIX_LEN)
            .map(|_| char::from(SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())]))
            .collect();
        TicketNumber::new(format!("{PREFIX}-{}-{suffix}", to_base36(millis)))
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        // value % 36 < 36, always a valid index
        #[allow(clippy::cast_possible_truncation)]
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Allocate `count` ticket numbers unique in the ledger and in `reserved`.
///
/// `reserved` carries numbers already handed out earlier in the same unit of
/// work (e.g. other cart lines) and is extended with the new numbers. Each
/// ticket gets at most `max_attempts` candidates.
///
/// # Errors
///
/// - [`SettlementError::TicketNumberExhausted`] when a ticket runs out of attempts
/// - [`SettlementError::Ledger`] if the uniqueness lookup fails
pub async fn allocate_ticket_numbers(
    session: &mut dyn LedgerSession,
    generator: &dyn TicketNumberGenerator,
    count: u32,
    max_attempts: u32,
    reserved: &mut HashSet<TicketNumber>,
) -> Result<Vec<TicketNumber>> {
    let mut numbers = Vec::with_capacity(usize::try_from(count).unwrap_or_default());
    for _ in 0..count {
        let mut allocated = None;
        for attempt in 1..=max_attempts {
            let candidate = generator.generate();
            if reserved.contains(&candidate) {
                continue;
            }
            if session.ticket_number_exists(candidate.clone()).await? {
                tracing::debug!(attempt, number = %candidate, "Ticket number collision");
                continue;
            }
            allocated = Some(candidate);
            break;
        }

        let Some(number) = allocated else {
            tracing::error!(
                attempts = max_attempts,
                "Ticket number generation exhausted its attempt bound"
            );
            return Err(SettlementError::TicketNumberExhausted {
                attempts: max_attempts,
            });
        };
        reserved.insert(number.clone());
        numbers.push(number);
    }
    Ok(numbers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use raffle_core::ledger::{LedgerStore, SessionMode};
    use raffle_core::types::{Competition, Money, Ticket, TicketId, TicketStatus, UserId};
    use raffle_testing::{InMemoryLedgerStore, test_clock};
    use std::sync::Mutex;

    /// Replays a fixed list of candidates, repeating the last one forever.
    struct Scripted(Mutex<Vec<&'static str>>);

    impl Scripted {
        fn new(mut script: Vec<&'static str>) -> Self {
            script.reverse();
            Self(Mutex::new(script))
        }
    }

    impl TicketNumberGenerator for Scripted {
        fn generate(&self) -> TicketNumber {
            let mut script = self.0.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop().unwrap()
            } else {
                script[0]
            };
            TicketNumber::new(next)
        }
    }

    #[test]
    fn random_numbers_have_expected_shape() {
        let generator = RandomTicketNumberGenerator::new(Arc::new(test_clock()));
        let number = generator.generate();
        let parts: Vec<&str> = number.as_str().split('-').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "RT");
        assert_eq!(parts[1], to_base36(1_735_689_600_000));
        assert_eq!(parts[2].len(), SUFFIX_LEN);
        assert!(parts[2].bytes().all(|b| SUFFIX_ALPHABET.contains(&b)));
    }

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "Z");
        assert_eq!(to_base36(36), "10");
    }

    #[tokio::test]
    async fn skips_numbers_taken_in_store_and_batch() {
        let store = InMemoryLedgerStore::new();
        let competition = store
            .seed_competition(Competition::new("TV", Money::from_dollars(1), 10, 10))
            .await;
        let mut session = store.begin(SessionMode::Autocommit).await.unwrap();
        session
            .insert_tickets(vec![Ticket {
                id: TicketId::new(),
                ticket_number: TicketNumber::new("TAKEN"),
                user_id: UserId::new(),
                competition_id: competition.id,
                price: competition.ticket_price,
                status: TicketStatus::Active,
                purchase_date: chrono::Utc::now(),
                payment_id: None,
            }])
            .await
            .unwrap();

        let generator = Scripted::new(vec!["TAKEN", "A", "A", "B", "C"]);
        let mut reserved = HashSet::new();
        let numbers =
            allocate_ticket_numbers(session.as_mut(), &generator, 2, 50, &mut reserved)
                .await
                .unwrap();

        assert_eq!(numbers, vec![TicketNumber::new("A"), TicketNumber::new("B")]);
        assert_eq!(reserved.len(), 2);
    }

    #[tokio::test]
    async fn exhaustion_is_an_internal_error() {
        let store = InMemoryLedgerStore::new();
        let mut session = store.begin(SessionMode::Autocommit).await.unwrap();
        let generator = Scripted::new(vec!["SAME"]);
        let mut reserved = HashSet::new();

        let err = allocate_ticket_numbers(session.as_mut(), &generator, 2, 50, &mut reserved)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SettlementError::TicketNumberExhausted { attempts: 50 }
        ));
    }
}
