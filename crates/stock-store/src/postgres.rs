use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AllocationRecord, CorrelationId, Lot, LotId, LotTake, MedicineId, MessageId, Money, NewLot,
    OutboundEvent, OutboxId, OutboxStatus, PublishFailure, Result, StoreError,
    store::{
        AllocationLedger, IdempotencyLedger, LotLedger, OutboxLedger, OutboxStore,
        TransactionCoordinator, UnitOfWork,
    },
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const LOT_COLUMNS: &str = "id, medicine_id, batch_code, expiration_date, quantity, \
     unit_cost_cents, is_deleted, created_at, updated_at";

const OUTBOX_COLUMNS: &str = "id, correlation_id, routing_key, payload, status, created_at, \
     published_at, attempt_count, error_text, next_attempt_at";

/// Runs a database call with an upper bound on its duration.
async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

/// PostgreSQL-backed store.
///
/// Allocation correctness under concurrent consumers, possibly in separate
/// processes, relies on `SELECT ... FOR UPDATE` row locks taken by
/// [`LotLedger::eligible_lots`] and [`AllocationLedger::outstanding`].
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    timeout: Duration,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets the bound applied to every database call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// Inserts a lot and returns it with its assigned id.
    pub async fn insert_lot(&self, new_lot: NewLot) -> Result<Lot> {
        let row = bounded(
            self.timeout,
            sqlx::query(&format!(
                r#"
                INSERT INTO lots (medicine_id, batch_code, expiration_date, quantity, unit_cost_cents)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {LOT_COLUMNS}
                "#
            ))
            .bind(new_lot.medicine_id.map(|m| m.as_i32()))
            .bind(&new_lot.batch_code)
            .bind(new_lot.expiration_date)
            .bind(new_lot.quantity)
            .bind(new_lot.unit_cost.cents())
            .fetch_one(&self.pool),
        )
        .await?;

        row_to_lot(row)
    }

    pub async fn get_lot(&self, lot_id: LotId) -> Result<Option<Lot>> {
        let row = bounded(
            self.timeout,
            sqlx::query(&format!("SELECT {LOT_COLUMNS} FROM lots WHERE id = $1"))
                .bind(lot_id.as_i64())
                .fetch_optional(&self.pool),
        )
        .await?;

        row.map(row_to_lot).transpose()
    }

    /// Returns the outbox rows of one business transaction, oldest first.
    pub async fn outbox_for(&self, correlation_id: &CorrelationId) -> Result<Vec<OutboundEvent>> {
        let rows = bounded(
            self.timeout,
            sqlx::query(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox_messages \
                 WHERE correlation_id = $1 ORDER BY created_at ASC"
            ))
            .bind(correlation_id.as_str())
            .fetch_all(&self.pool),
        )
        .await?;

        rows.into_iter().map(row_to_outbound).collect()
    }
}

fn row_to_lot(row: PgRow) -> Result<Lot> {
    Ok(Lot {
        id: LotId::new(row.try_get("id")?),
        medicine_id: row
            .try_get::<Option<i32>, _>("medicine_id")?
            .map(MedicineId::new),
        batch_code: row.try_get("batch_code")?,
        expiration_date: row.try_get("expiration_date")?,
        quantity: row.try_get("quantity")?,
        unit_cost: Money::from_cents(row.try_get("unit_cost_cents")?),
        is_deleted: row.try_get("is_deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_allocation(row: PgRow) -> Result<AllocationRecord> {
    Ok(AllocationRecord {
        id: row.try_get("id")?,
        correlation_id: CorrelationId::new(row.try_get::<String, _>("correlation_id")?),
        lot_id: LotId::new(row.try_get("lot_id")?),
        medicine_id: MedicineId::new(row.try_get("medicine_id")?),
        quantity: row.try_get("quantity")?,
        unit_cost: Money::from_cents(row.try_get("unit_cost_cents")?),
        created_at: row.try_get("created_at")?,
        released_at: row.try_get("released_at")?,
    })
}

fn row_to_outbound(row: PgRow) -> Result<OutboundEvent> {
    let status: String = row.try_get("status")?;

    Ok(OutboundEvent {
        id: OutboxId::from_uuid(row.try_get::<Uuid, _>("id")?),
        correlation_id: CorrelationId::new(row.try_get::<String, _>("correlation_id")?),
        routing_key: row.try_get("routing_key")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        published_at: row.try_get("published_at")?,
        attempt_count: row.try_get("attempt_count")?,
        error_text: row.try_get("error_text")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
    })
}

/// A transaction on one pooled connection.
///
/// Dropping the unit without committing returns the connection to the pool
/// with the transaction rolled back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
    timeout: Duration,
}

#[async_trait]
impl TransactionCoordinator for PostgresStore {
    type Unit = PostgresUnitOfWork;

    async fn begin(&self) -> Result<PostgresUnitOfWork> {
        let tx = bounded(self.timeout, self.pool.begin()).await?;
        Ok(PostgresUnitOfWork {
            tx,
            timeout: self.timeout,
        })
    }

    async fn has_processed(&self, message_id: &MessageId) -> Result<bool> {
        let found: Option<i32> = bounded(
            self.timeout,
            sqlx::query_scalar("SELECT 1 FROM inbox_history WHERE message_id = $1")
                .bind(message_id.as_str())
                .fetch_optional(&self.pool),
        )
        .await?;

        Ok(found.is_some())
    }
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    fn lots(&mut self) -> &mut dyn LotLedger {
        self
    }

    fn allocations(&mut self) -> &mut dyn AllocationLedger {
        self
    }

    fn idempotency(&mut self) -> &mut dyn IdempotencyLedger {
        self
    }

    fn outbox(&mut self) -> &mut dyn OutboxLedger {
        self
    }

    async fn commit(self) -> Result<()> {
        // A failed commit drops the transaction, which rolls it back.
        let result = bounded(self.timeout, self.tx.commit())
            .await
            .map_err(|e| match e {
                StoreError::Database(db) => StoreError::CommitFailed(db.to_string()),
                other => other,
            });
        let outcome = if result.is_ok() { "committed" } else { "failed" };
        metrics::counter!("store_transactions_total", "outcome" => outcome).increment(1);
        result
    }

    async fn rollback(self) -> Result<()> {
        metrics::counter!("store_transactions_total", "outcome" => "rolled_back").increment(1);
        bounded(self.timeout, self.tx.rollback()).await
    }
}

#[async_trait]
impl LotLedger for PostgresUnitOfWork {
    async fn eligible_lots(&mut self, medicine_id: MedicineId) -> Result<Vec<Lot>> {
        let rows = bounded(
            self.timeout,
            sqlx::query(&format!(
                r#"
                SELECT {LOT_COLUMNS}
                FROM lots
                WHERE medicine_id = $1 AND is_deleted = FALSE AND quantity > 0
                ORDER BY expiration_date ASC, id ASC
                FOR UPDATE
                "#
            ))
            .bind(medicine_id.as_i32())
            .fetch_all(&mut *self.tx),
        )
        .await?;

        rows.into_iter().map(row_to_lot).collect()
    }

    async fn set_quantity(&mut self, lot_id: LotId, quantity: i32) -> Result<()> {
        let result = bounded(
            self.timeout,
            sqlx::query("UPDATE lots SET quantity = $2, updated_at = NOW() WHERE id = $1")
                .bind(lot_id.as_i64())
                .bind(quantity)
                .execute(&mut *self.tx),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LotNotFound(lot_id));
        }
        Ok(())
    }

    async fn restore_quantity(&mut self, lot_id: LotId, quantity: i32) -> Result<i32> {
        let restored: Option<i32> = bounded(
            self.timeout,
            sqlx::query_scalar(
                "UPDATE lots SET quantity = quantity + $2, updated_at = NOW() \
                 WHERE id = $1 RETURNING quantity",
            )
            .bind(lot_id.as_i64())
            .bind(quantity)
            .fetch_optional(&mut *self.tx),
        )
        .await?;

        restored.ok_or(StoreError::LotNotFound(lot_id))
    }
}

#[async_trait]
impl AllocationLedger for PostgresUnitOfWork {
    async fn record(&mut self, correlation_id: &CorrelationId, takes: &[LotTake]) -> Result<()> {
        for take in takes {
            bounded(
                self.timeout,
                sqlx::query(
                    r#"
                    INSERT INTO lot_allocations (correlation_id, lot_id, medicine_id, quantity, unit_cost_cents)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(correlation_id.as_str())
                .bind(take.lot_id.as_i64())
                .bind(take.medicine_id.as_i32())
                .bind(take.quantity)
                .bind(take.unit_cost.cents())
                .execute(&mut *self.tx),
            )
            .await?;
        }
        Ok(())
    }

    async fn outstanding(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<AllocationRecord>> {
        let rows = bounded(
            self.timeout,
            sqlx::query(
                r#"
                SELECT id, correlation_id, lot_id, medicine_id, quantity, unit_cost_cents,
                       created_at, released_at
                FROM lot_allocations
                WHERE correlation_id = $1 AND released_at IS NULL
                ORDER BY id ASC
                FOR UPDATE
                "#,
            )
            .bind(correlation_id.as_str())
            .fetch_all(&mut *self.tx),
        )
        .await?;

        rows.into_iter().map(row_to_allocation).collect()
    }

    async fn release(&mut self, correlation_id: &CorrelationId, at: DateTime<Utc>) -> Result<u64> {
        let result = bounded(
            self.timeout,
            sqlx::query(
                "UPDATE lot_allocations SET released_at = $2 \
                 WHERE correlation_id = $1 AND released_at IS NULL",
            )
            .bind(correlation_id.as_str())
            .bind(at)
            .execute(&mut *self.tx),
        )
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresUnitOfWork {
    async fn has_processed(&mut self, message_id: &MessageId) -> Result<bool> {
        let found: Option<i32> = bounded(
            self.timeout,
            sqlx::query_scalar("SELECT 1 FROM inbox_history WHERE message_id = $1")
                .bind(message_id.as_str())
                .fetch_optional(&mut *self.tx),
        )
        .await?;

        Ok(found.is_some())
    }

    async fn mark_processed(&mut self, message_id: &MessageId, routing_key: &str) -> Result<bool> {
        // Blocks on a concurrent uncommitted insert of the same id, then
        // reports it as already present once that transaction commits.
        let result = bounded(
            self.timeout,
            sqlx::query(
                r#"
                INSERT INTO inbox_history (message_id, routing_key, processed_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (message_id) DO NOTHING
                "#,
            )
            .bind(message_id.as_str())
            .bind(routing_key)
            .execute(&mut *self.tx),
        )
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl OutboxLedger for PostgresUnitOfWork {
    async fn enqueue(&mut self, event: &OutboundEvent) -> Result<()> {
        bounded(
            self.timeout,
            sqlx::query(
                r#"
                INSERT INTO outbox_messages
                    (id, correlation_id, routing_key, payload, status, created_at,
                     published_at, attempt_count, error_text, next_attempt_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(event.id.as_uuid())
            .bind(event.correlation_id.as_str())
            .bind(&event.routing_key)
            .bind(&event.payload)
            .bind(event.status.as_str())
            .bind(event.created_at)
            .bind(event.published_at)
            .bind(event.attempt_count)
            .bind(&event.error_text)
            .bind(event.next_attempt_at)
            .execute(&mut *self.tx),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn fetch_pending(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboundEvent>> {
        let rows = bounded(
            self.timeout,
            sqlx::query(&format!(
                r#"
                SELECT {OUTBOX_COLUMNS}
                FROM outbox_messages
                WHERE status = $1 AND next_attempt_at <= $2
                ORDER BY created_at ASC
                LIMIT $3
                "#
            ))
            .bind(OutboxStatus::Pending.as_str())
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool),
        )
        .await?;

        rows.into_iter().map(row_to_outbound).collect()
    }

    async fn mark_published(&self, id: OutboxId, at: DateTime<Utc>) -> Result<()> {
        bounded(
            self.timeout,
            sqlx::query(
                "UPDATE outbox_messages SET status = $2, published_at = $3 \
                 WHERE id = $1 AND status = $4",
            )
            .bind(id.as_uuid())
            .bind(OutboxStatus::Published.as_str())
            .bind(at)
            .bind(OutboxStatus::Pending.as_str())
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    async fn record_failure(&self, id: OutboxId, failure: &PublishFailure) -> Result<()> {
        let status = if failure.dead_letter {
            OutboxStatus::Failed
        } else {
            OutboxStatus::Pending
        };

        bounded(
            self.timeout,
            sqlx::query(
                r#"
                UPDATE outbox_messages
                SET attempt_count = attempt_count + 1,
                    error_text = $2,
                    next_attempt_at = $3,
                    status = $4
                WHERE id = $1 AND status = $5
                "#,
            )
            .bind(id.as_uuid())
            .bind(&failure.error)
            .bind(failure.next_attempt_at)
            .bind(status.as_str())
            .bind(OutboxStatus::Pending.as_str())
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }
}
