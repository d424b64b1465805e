//! `PostgreSQL` ledger store.

use chrono::{DateTime, Utc};
use raffle_core::ledger::{LedgerError, LedgerFuture, LedgerSession, LedgerStore, SessionMode};
use raffle_core::types::{
    CartLine, Competition, CompetitionId, CompetitionStatus, IntentId, Money, Payment, PaymentId,
    PaymentStatus, PointsEntry, PointsEntryId, PointsKind, PointsSettings, PurchaseShape, Ticket,
    TicketId, TicketNumber, TicketStatus, UserId, UserPoints,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

const COMPETITION_COLUMNS: &str =
    "id, title, ticket_price_cents, max_tickets, max_per_person, tickets_sold, status";

const TICKET_COLUMNS: &str =
    "id, ticket_number, user_id, competition_id, price_cents, status, purchase_date, payment_id";

const PAYMENT_COLUMNS: &str = "id, intent_id, user_id, amount_cents, currency, status, purchase, \
     tickets_created, ticket_ids, failure_reason, gateway_payload, refund_amount_cents, \
     refund_reason, refunded_at, created_at, updated_at";

/// `PostgreSQL`-backed [`LedgerStore`].
///
/// # Example
///
/// ```no_run
/// use raffle_postgres::PostgresLedgerStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresLedgerStore::new("postgres://localhost/raffle", 10).await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Connect to the database with a bounded pool.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the connection fails.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_error)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::Database(e.to_string()))
    }
}

impl LedgerStore for PostgresLedgerStore {
    fn probe_transactions(&self) -> LedgerFuture<'_, bool> {
        Box::pin(async move {
            match self.pool.begin().await {
                Ok(tx) => {
                    tx.rollback().await.map_err(db_error)?;
                    Ok(true)
                }
                Err(e) => match db_error(e) {
                    LedgerError::TransactionsUnsupported(reason) => {
                        tracing::warn!(reason = %reason, "Ledger probe: transactions unsupported");
                        Ok(false)
                    }
                    other => Err(other),
                },
            }
        })
    }

    fn begin(&self, mode: SessionMode) -> LedgerFuture<'_, Box<dyn LedgerSession>> {
        Box::pin(async move {
            let conn = match mode {
                SessionMode::Transactional => {
                    Conn::Transaction(self.pool.begin().await.map_err(db_error)?)
                }
                SessionMode::Autocommit => {
                    Conn::Pooled(self.pool.acquire().await.map_err(db_error)?)
                }
            };
            Ok(Box::new(PostgresSession { conn }) as Box<dyn LedgerSession>)
        })
    }
}

enum Conn {
    Transaction(Transaction<'static, Postgres>),
    Pooled(PoolConnection<Postgres>),
}

struct PostgresSession {
    conn: Conn,
}

impl PostgresSession {
    fn db(&mut self) -> &mut PgConnection {
        match &mut self.conn {
            Conn::Transaction(tx) => &mut **tx,
            Conn::Pooled(conn) => &mut **conn,
        }
    }

    const fn lock_clause(&self) -> &'static str {
        match self.conn {
            Conn::Transaction(_) => " FOR UPDATE",
            Conn::Pooled(_) => "",
        }
    }

    async fn load_payment(
        &mut self,
        column: &str,
        key: PaymentKey,
    ) -> Result<Option<Payment>, LedgerError> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE {column} = $1{}",
            self.lock_clause()
        );
        let query = sqlx::query(&sql);
        let query = match key {
            PaymentKey::Id(id) => query.bind(id),
            PaymentKey::Intent(intent) => query.bind(intent),
        };
        let row = query.fetch_optional(self.db()).await.map_err(db_error)?;
        row.as_ref().map(payment_from_row).transpose()
    }
}

enum PaymentKey {
    Id(Uuid),
    Intent(String),
}

impl LedgerSession for PostgresSession {
    fn is_transactional(&self) -> bool {
        matches!(self.conn, Conn::Transaction(_))
    }

    fn competition(&mut self, id: CompetitionId) -> LedgerFuture<'_, Option<Competition>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {COMPETITION_COLUMNS} FROM competitions WHERE id = $1{}",
                self.lock_clause()
            );
            let row = sqlx::query(&sql)
                .bind(*id.as_uuid())
                .fetch_optional(self.db())
                .await
                .map_err(db_error)?;
            row.as_ref().map(competition_from_row).transpose()
        })
    }

    fn save_competition(&mut self, competition: Competition) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO competitions (
                    id, title, ticket_price_cents, max_tickets, max_per_person, tickets_sold, status
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE SET
                    title = EXCLUDED.title,
                    ticket_price_cents = EXCLUDED.ticket_price_cents,
                    max_tickets = EXCLUDED.max_tickets,
                    max_per_person = EXCLUDED.max_per_person,
                    tickets_sold = EXCLUDED.tickets_sold,
                    status = EXCLUDED.status
                ",
            )
            .bind(*competition.id.as_uuid())
            .bind(&competition.title)
            .bind(cents_to_db(competition.ticket_price)?)
            .bind(count_to_db(competition.max_tickets)?)
            .bind(count_to_db(competition.max_per_person)?)
            .bind(count_to_db(competition.tickets_sold)?)
            .bind(competition.status.as_str())
            .execute(self.db())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn compare_and_set_tickets_sold(
        &mut self,
        id: CompetitionId,
        expected: u32,
        new: u32,
    ) -> LedgerFuture<'_, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE competitions SET tickets_sold = $3 WHERE id = $1 AND tickets_sold = $2",
            )
            .bind(*id.as_uuid())
            .bind(count_to_db(expected)?)
            .bind(count_to_db(new)?)
            .execute(self.db())
            .await
            .map_err(db_error)?;

            if result.rows_affected() == 1 {
                return Ok(true);
            }

            let exists = sqlx::query("SELECT 1 FROM competitions WHERE id = $1")
                .bind(*id.as_uuid())
                .fetch_optional(self.db())
                .await
                .map_err(db_error)?;
            if exists.is_none() {
                return Err(LedgerError::NotFound(format!("competition {id}")));
            }
            Ok(false)
        })
    }

    fn count_active_tickets(
        &mut self,
        user_id: UserId,
        competition_id: CompetitionId,
    ) -> LedgerFuture<'_, u32> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*) FROM tickets
                WHERE user_id = $1 AND competition_id = $2 AND status <> 'refunded'
                ",
            )
            .bind(*user_id.as_uuid())
            .bind(*competition_id.as_uuid())
            .fetch_one(self.db())
            .await
            .map_err(db_error)?;
            u32::try_from(count).map_err(|e| LedgerError::Serialization(e.to_string()))
        })
    }

    fn ticket_number_exists(&mut self, number: TicketNumber) -> LedgerFuture<'_, bool> {
        Box::pin(async move {
            let row = sqlx::query("SELECT 1 FROM tickets WHERE ticket_number = $1")
                .bind(number.as_str())
                .fetch_optional(self.db())
                .await
                .map_err(db_error)?;
            Ok(row.is_some())
        })
    }

    fn insert_tickets(&mut self, tickets: Vec<Ticket>) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            let mut ids = Vec::with_capacity(tickets.len());
            let mut numbers = Vec::with_capacity(tickets.len());
            let mut users = Vec::with_capacity(tickets.len());
            let mut competitions = Vec::with_capacity(tickets.len());
            let mut prices = Vec::with_capacity(tickets.len());
            let mut statuses = Vec::with_capacity(tickets.len());
            let mut dates = Vec::with_capacity(tickets.len());
            let mut payments = Vec::with_capacity(tickets.len());
            for ticket in &tickets {
                ids.push(*ticket.id.as_uuid());
                numbers.push(ticket.ticket_number.as_str().to_string());
                users.push(*ticket.user_id.as_uuid());
                competitions.push(*ticket.competition_id.as_uuid());
                prices.push(cents_to_db(ticket.price)?);
                statuses.push(ticket.status.as_str().to_string());
                dates.push(ticket.purchase_date);
                payments.push(ticket.payment_id.map(|p| *p.as_uuid()));
            }

            // Single statement so an autocommit batch is still all-or-nothing.
            sqlx::query(
                r"
                INSERT INTO tickets (
                    id, ticket_number, user_id, competition_id, price_cents,
                    status, purchase_date, payment_id
                )
                SELECT * FROM UNNEST(
                    $1::uuid[], $2::text[], $3::uuid[], $4::uuid[], $5::bigint[],
                    $6::text[], $7::timestamptz[], $8::uuid[]
                )
                ",
            )
            .bind(ids)
            .bind(numbers)
            .bind(users)
            .bind(competitions)
            .bind(prices)
            .bind(statuses)
            .bind(dates)
            .bind(payments)
            .execute(self.db())
            .await
            .map_err(db_error)?;

            tracing::debug!(count = tickets.len(), "Tickets inserted");
            Ok(())
        })
    }

    fn tickets(&mut self, ids: Vec<TicketId>) -> LedgerFuture<'_, Vec<Ticket>> {
        Box::pin(async move {
            let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
            let sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ANY($1)");
            let rows = sqlx::query(&sql)
                .bind(ids)
                .fetch_all(self.db())
                .await
                .map_err(db_error)?;
            rows.iter().map(ticket_from_row).collect()
        })
    }

    fn update_ticket_status(
        &mut self,
        ids: Vec<TicketId>,
        status: TicketStatus,
    ) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            let ids: Vec<Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
            sqlx::query("UPDATE tickets SET status = $2 WHERE id = ANY($1)")
                .bind(ids)
                .bind(status.as_str())
                .execute(self.db())
                .await
                .map_err(db_error)?;
            Ok(())
        })
    }

    fn user_points(&mut self, user_id: UserId) -> LedgerFuture<'_, UserPoints> {
        Box::pin(async move {
            // A missing row cannot be locked, so create it zeroed first.
            if self.is_transactional() {
                sqlx::query(
                    "INSERT INTO user_points (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
                )
                .bind(*user_id.as_uuid())
                .execute(self.db())
                .await
                .map_err(db_error)?;
            }
            let sql = format!(
                "SELECT total_points, total_earned, total_spent_cents, total_redeemed \
                 FROM user_points WHERE user_id = $1{}",
                self.lock_clause()
            );
            let row = sqlx::query(&sql)
                .bind(*user_id.as_uuid())
                .fetch_optional(self.db())
                .await
                .map_err(db_error)?;

            let Some(row) = row else {
                return Ok(UserPoints::empty(user_id));
            };
            Ok(UserPoints {
                user_id,
                total_points: points_from_db(row.try_get("total_points").map_err(db_error)?)?,
                total_earned: points_from_db(row.try_get("total_earned").map_err(db_error)?)?,
                total_spent: cents_from_db(row.try_get("total_spent_cents").map_err(db_error)?)?,
                total_redeemed: points_from_db(
                    row.try_get("total_redeemed").map_err(db_error)?,
                )?,
            })
        })
    }

    fn save_user_points(&mut self, points: UserPoints) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO user_points (
                    user_id, total_points, total_earned, total_spent_cents, total_redeemed
                ) VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id) DO UPDATE SET
                    total_points = EXCLUDED.total_points,
                    total_earned = EXCLUDED.total_earned,
                    total_spent_cents = EXCLUDED.total_spent_cents,
                    total_redeemed = EXCLUDED.total_redeemed
                ",
            )
            .bind(*points.user_id.as_uuid())
            .bind(points_to_db(points.total_points)?)
            .bind(points_to_db(points.total_earned)?)
            .bind(cents_to_db(points.total_spent)?)
            .bind(points_to_db(points.total_redeemed)?)
            .execute(self.db())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn append_points_entry(&mut self, entry: PointsEntry) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO points_history (
                    id, user_id, kind, amount, description, payment_id, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
            )
            .bind(*entry.id.as_uuid())
            .bind(*entry.user_id.as_uuid())
            .bind(entry.kind.as_str())
            .bind(points_to_db(entry.amount)?)
            .bind(&entry.description)
            .bind(entry.payment_id.map(|p| *p.as_uuid()))
            .bind(entry.created_at)
            .execute(self.db())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn points_history(&mut self, user_id: UserId) -> LedgerFuture<'_, Vec<PointsEntry>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, user_id, kind, amount, description, payment_id, created_at
                FROM points_history
                WHERE user_id = $1
                ORDER BY seq ASC
                ",
            )
            .bind(*user_id.as_uuid())
            .fetch_all(self.db())
            .await
            .map_err(db_error)?;
            rows.iter().map(points_entry_from_row).collect()
        })
    }

    fn points_settings(&mut self) -> LedgerFuture<'_, PointsSettings> {
        Box::pin(async move {
            let row = sqlx::query("SELECT points_per_dollar, is_active FROM points_settings")
                .fetch_optional(self.db())
                .await
                .map_err(db_error)?;
            let Some(row) = row else {
                return Ok(PointsSettings::default());
            };
            Ok(PointsSettings {
                points_per_dollar: points_from_db(
                    row.try_get("points_per_dollar").map_err(db_error)?,
                )?,
                is_active: row.try_get("is_active").map_err(db_error)?,
            })
        })
    }

    fn save_points_settings(&mut self, settings: PointsSettings) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO points_settings (singleton, points_per_dollar, is_active)
                VALUES (TRUE, $1, $2)
                ON CONFLICT (singleton) DO UPDATE SET
                    points_per_dollar = EXCLUDED.points_per_dollar,
                    is_active = EXCLUDED.is_active
                ",
            )
            .bind(points_to_db(settings.points_per_dollar)?)
            .bind(settings.is_active)
            .execute(self.db())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn cart(&mut self, user_id: UserId) -> LedgerFuture<'_, Vec<CartLine>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT competition_id, quantity FROM cart_items
                WHERE user_id = $1
                ORDER BY competition_id
                ",
            )
            .bind(*user_id.as_uuid())
            .fetch_all(self.db())
            .await
            .map_err(db_error)?;

            rows.iter()
                .map(|row| {
                    Ok(CartLine {
                        user_id,
                        competition_id: CompetitionId::from_uuid(
                            row.try_get("competition_id").map_err(db_error)?,
                        ),
                        quantity: count_from_db(row.try_get("quantity").map_err(db_error)?)?,
                    })
                })
                .collect()
        })
    }

    fn put_cart_line(&mut self, line: CartLine) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO cart_items (user_id, competition_id, quantity)
                VALUES ($1, $2, $3)
                ON CONFLICT (user_id, competition_id) DO UPDATE SET quantity = EXCLUDED.quantity
                ",
            )
            .bind(*line.user_id.as_uuid())
            .bind(*line.competition_id.as_uuid())
            .bind(count_to_db(line.quantity)?)
            .execute(self.db())
            .await
            .map_err(db_error)?;
            Ok(())
        })
    }

    fn remove_cart_lines(
        &mut self,
        user_id: UserId,
        competitions: Vec<CompetitionId>,
    ) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            let competitions: Vec<Uuid> = competitions.iter().map(|c| *c.as_uuid()).collect();
            sqlx::query("DELETE FROM cart_items WHERE user_id = $1 AND competition_id = ANY($2)")
                .bind(*user_id.as_uuid())
                .bind(competitions)
                .execute(self.db())
                .await
                .map_err(db_error)?;
            Ok(())
        })
    }

    fn payment_by_intent(&mut self, intent_id: IntentId) -> LedgerFuture<'_, Option<Payment>> {
        Box::pin(async move {
            self.load_payment("intent_id", PaymentKey::Intent(intent_id.as_str().to_string()))
                .await
        })
    }

    fn payment(&mut self, id: PaymentId) -> LedgerFuture<'_, Option<Payment>> {
        Box::pin(async move { self.load_payment("id", PaymentKey::Id(*id.as_uuid())).await })
    }

    fn insert_payment(&mut self, payment: Payment) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            let sql = format!(
                "INSERT INTO payments ({PAYMENT_COLUMNS}) VALUES \
                 ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
            );
            bind_payment(sqlx::query(&sql), &payment)?
                .execute(self.db())
                .await
                .map_err(db_error)?;
            Ok(())
        })
    }

    fn save_payment(&mut self, payment: Payment) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            let result = bind_payment(
                sqlx::query(
                    r"
                    UPDATE payments SET
                        intent_id = $2, user_id = $3, amount_cents = $4, currency = $5,
                        status = $6, purchase = $7, tickets_created = $8, ticket_ids = $9,
                        failure_reason = $10, gateway_payload = $11, refund_amount_cents = $12,
                        refund_reason = $13, refunded_at = $14, created_at = $15, updated_at = $16
                    WHERE id = $1
                    ",
                ),
                &payment,
            )?
            .execute(self.db())
            .await
            .map_err(db_error)?;

            if result.rows_affected() == 0 {
                return Err(LedgerError::NotFound(format!("payment {}", payment.id)));
            }
            Ok(())
        })
    }

    fn commit(self: Box<Self>) -> LedgerFuture<'static, ()> {
        Box::pin(async move {
            match self.conn {
                Conn::Transaction(tx) => tx.commit().await.map_err(db_error),
                Conn::Pooled(_) => Ok(()),
            }
        })
    }

    fn rollback(self: Box<Self>) -> LedgerFuture<'static, ()> {
        Box::pin(async move {
            match self.conn {
                Conn::Transaction(tx) => tx.rollback().await.map_err(db_error),
                Conn::Pooled(_) => Ok(()),
            }
        })
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_payment<'q>(query: PgQuery<'q>, payment: &Payment) -> Result<PgQuery<'q>, LedgerError> {
    let ticket_ids: Vec<Uuid> = payment.ticket_ids.iter().map(|id| *id.as_uuid()).collect();
    Ok(query
        .bind(*payment.id.as_uuid())
        .bind(payment.intent_id.as_str().to_string())
        .bind(*payment.user_id.as_uuid())
        .bind(cents_to_db(payment.amount)?)
        .bind(payment.currency.clone())
        .bind(payment.status.as_str())
        .bind(Json(payment.purchase.clone()))
        .bind(payment.tickets_created)
        .bind(ticket_ids)
        .bind(payment.failure_reason.clone())
        .bind(payment.gateway_payload.clone())
        .bind(payment.refund_amount.map(cents_to_db).transpose()?)
        .bind(payment.refund_reason.clone())
        .bind(payment.refunded_at)
        .bind(payment.created_at)
        .bind(payment.updated_at))
}

fn competition_from_row(row: &PgRow) -> Result<Competition, LedgerError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    Ok(Competition {
        id: CompetitionId::from_uuid(row.try_get("id").map_err(db_error)?),
        title: row.try_get("title").map_err(db_error)?,
        ticket_price: cents_from_db(row.try_get("ticket_price_cents").map_err(db_error)?)?,
        max_tickets: count_from_db(row.try_get("max_tickets").map_err(db_error)?)?,
        max_per_person: count_from_db(row.try_get("max_per_person").map_err(db_error)?)?,
        tickets_sold: count_from_db(row.try_get("tickets_sold").map_err(db_error)?)?,
        status: CompetitionStatus::parse(&status)?,
    })
}

fn ticket_from_row(row: &PgRow) -> Result<Ticket, LedgerError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    let number: String = row.try_get("ticket_number").map_err(db_error)?;
    let payment_id: Option<Uuid> = row.try_get("payment_id").map_err(db_error)?;
    Ok(Ticket {
        id: TicketId::from_uuid(row.try_get("id").map_err(db_error)?),
        ticket_number: TicketNumber::new(number),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(db_error)?),
        competition_id: CompetitionId::from_uuid(row.try_get("competition_id").map_err(db_error)?),
        price: cents_from_db(row.try_get("price_cents").map_err(db_error)?)?,
        status: TicketStatus::parse(&status)?,
        purchase_date: row.try_get("purchase_date").map_err(db_error)?,
        payment_id: payment_id.map(PaymentId::from_uuid),
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, LedgerError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    let intent: String = row.try_get("intent_id").map_err(db_error)?;
    let Json(purchase): Json<PurchaseShape> = row.try_get("purchase").map_err(db_error)?;
    let ticket_ids: Vec<Uuid> = row.try_get("ticket_ids").map_err(db_error)?;
    let refund_amount: Option<i64> = row.try_get("refund_amount_cents").map_err(db_error)?;
    let refunded_at: Option<DateTime<Utc>> = row.try_get("refunded_at").map_err(db_error)?;
    Ok(Payment {
        id: PaymentId::from_uuid(row.try_get("id").map_err(db_error)?),
        intent_id: IntentId::new(intent),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(db_error)?),
        amount: cents_from_db(row.try_get("amount_cents").map_err(db_error)?)?,
        currency: row.try_get("currency").map_err(db_error)?,
        status: PaymentStatus::parse(&status)?,
        purchase,
        tickets_created: row.try_get("tickets_created").map_err(db_error)?,
        ticket_ids: ticket_ids.into_iter().map(TicketId::from_uuid).collect(),
        failure_reason: row.try_get("failure_reason").map_err(db_error)?,
        gateway_payload: row.try_get("gateway_payload").map_err(db_error)?,
        refund_amount: refund_amount.map(cents_from_db).transpose()?,
        refund_reason: row.try_get("refund_reason").map_err(db_error)?,
        refunded_at,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

fn points_entry_from_row(row: &PgRow) -> Result<PointsEntry, LedgerError> {
    let kind: String = row.try_get("kind").map_err(db_error)?;
    let payment_id: Option<Uuid> = row.try_get("payment_id").map_err(db_error)?;
    Ok(PointsEntry {
        id: PointsEntryId::from_uuid(row.try_get("id").map_err(db_error)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(db_error)?),
        kind: PointsKind::parse(&kind)?,
        amount: points_from_db(row.try_get("amount").map_err(db_error)?)?,
        description: row.try_get("description").map_err(db_error)?,
        payment_id: payment_id.map(PaymentId::from_uuid),
        created_at: row.try_get("created_at").map_err(db_error)?,
    })
}

/// Classify a sqlx error.
///
/// Unique violations become `Conflict`. `feature_not_supported` and
/// `active_sql_transaction`-class refusals (e.g. a statement-pooling proxy)
/// become `TransactionsUnsupported`.
fn db_error(err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            metrics::counter!("raffle_ledger_conflicts_total").increment(1);
            return LedgerError::Conflict(db.message().to_string());
        }
        if matches!(db.code().as_deref(), Some("0A000" | "25001")) {
            return LedgerError::TransactionsUnsupported(db.message().to_string());
        }
    }
    LedgerError::Database(err.to_string())
}

fn cents_to_db(money: Money) -> Result<i64, LedgerError> {
    i64::try_from(money.cents()).map_err(|e| LedgerError::Serialization(e.to_string()))
}

fn cents_from_db(cents: i64) -> Result<Money, LedgerError> {
    u64::try_from(cents)
        .map(Money::from_cents)
        .map_err(|e| LedgerError::Serialization(e.to_string()))
}

fn points_to_db(points: u64) -> Result<i64, LedgerError> {
    i64::try_from(points).map_err(|e| LedgerError::Serialization(e.to_string()))
}

fn points_from_db(points: i64) -> Result<u64, LedgerError> {
    u64::try_from(points).map_err(|e| LedgerError::Serialization(e.to_string()))
}

fn count_to_db(count: u32) -> Result<i32, LedgerError> {
    i32::try_from(count).map_err(|e| LedgerError::Serialization(e.to_string()))
}

fn count_from_db(count: i32) -> Result<u32, LedgerError> {
    u32::try_from(count).map_err(|e| LedgerError::Serialization(e.to_string()))
}
