//! Postgres-backed ledger.
//!
//! ## Atomicity
//!
//! `append_line_item` runs in one transaction: it locks the bill row (`FOR UPDATE`),
//! checks the status and the reference, inserts the item and increments
//! `bill.total_amount`. Either both writes commit or neither does. A total that would
//! overflow `Decimal` is refused before anything is written.
//!
//! `close_bill` is a single conditional `UPDATE ... WHERE status = 'open'`; a caller that
//! loses the race sees zero affected rows and gets `CloseOutcome::AlreadyClosed`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | LedgerError |
//! |------------|----------------------|-------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on bill insert, otherwise `Conflict` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Conflict` |
//! | Database (foreign key / check violation) | `23503` / `23514` | `InvalidData` |
//! | Database (connection exception) | `08***` | `Unavailable` |
//! | Database (other) | Any other | `InvalidData` |
//! | PoolTimedOut / PoolClosed / Io / Tls | N/A | `Unavailable` |
//! | RowNotFound | N/A | `InvalidData` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Row};
use tracing::{instrument, Span};

use billflow_billing::{Bill, BillStatus, LineItem};
use billflow_core::{AccountId, BillId, Currency, LineItemId};

use super::r#trait::{AppendOutcome, CloseOutcome, LedgerError, LedgerStore};

const SCHEMA: &str = include_str!("../../migrations/0001_billing.sql");

/// Postgres-backed ledger store.
///
/// Uses the SQLx connection pool, which is `Send + Sync`; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `bill` and `bill_item` tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn fetch_bill(&self, bill_id: BillId) -> Result<Option<Bill>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, status, account_id, currency, total_amount, period_start, period_end, created_at
            FROM bill
            WHERE id = $1
            "#,
        )
        .bind(bill_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_bill", e))?;

        row.map(|r| bill_from_row(&r)).transpose()
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    #[instrument(skip(self, bill), fields(bill_id = %bill.id, account_id = %bill.account_id), err)]
    async fn create_bill(&self, bill: &Bill) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO bill (
                id,
                status,
                account_id,
                currency,
                total_amount,
                period_start,
                period_end,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(bill.id.as_uuid())
        .bind(bill.status.as_str())
        .bind(bill.account_id.as_str())
        .bind(bill.currency.code())
        .bind(bill.total_amount)
        .bind(bill.period_start)
        .bind(bill.period_end)
        .bind(bill.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LedgerError::AlreadyExists(bill.id)
            } else {
                map_sqlx_error("create_bill", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), fields(bill_id = %bill_id), err)]
    async fn get_bill(&self, bill_id: BillId) -> Result<Option<Bill>, LedgerError> {
        self.fetch_bill(bill_id).await
    }

    #[instrument(
        skip(self, line_item),
        fields(
            bill_id = %line_item.bill_id,
            reference = %line_item.reference,
            outcome = tracing::field::Empty
        ),
        err
    )]
    async fn append_line_item(&self, line_item: &LineItem) -> Result<AppendOutcome, LedgerError> {
        let span = Span::current();
        let bill_id = line_item.bill_id;
        let delta = line_item
            .normalized_amount()
            .map_err(|e| LedgerError::InvalidData(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Row lock serializes writers for this bill until commit.
        let locked = sqlx::query("SELECT status, total_amount FROM bill WHERE id = $1 FOR UPDATE")
            .bind(bill_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_bill", e))?;

        let Some(locked) = locked else {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LedgerError::NotFound(bill_id));
        };
        let status: String = locked
            .try_get("status")
            .map_err(|e| map_sqlx_error("lock_bill", e))?;
        let current_total: Decimal = locked
            .try_get("total_amount")
            .map_err(|e| map_sqlx_error("lock_bill", e))?;

        if parse_status(&status)? != BillStatus::Open {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LedgerError::BillClosed(bill_id));
        }

        let existing = sqlx::query(
            r#"
            SELECT id, bill_id, reference, description, amount, currency, exchange_rate, created_at
            FROM bill_item
            WHERE bill_id = $1 AND reference = $2
            "#,
        )
        .bind(bill_id.as_uuid())
        .bind(&line_item.reference)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_line_item", e))?;

        if let Some(row) = existing {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            span.record("outcome", "duplicate");
            return Ok(AppendOutcome::Duplicate {
                existing: line_item_from_row(&row)?,
                total: current_total,
            });
        }

        if current_total.checked_add(delta).is_none() {
            tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(LedgerError::InvalidData(format!("bill {bill_id} total overflow")));
        }

        sqlx::query(
            r#"
            INSERT INTO bill_item (
                id,
                bill_id,
                reference,
                description,
                amount,
                currency,
                exchange_rate,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(line_item.id.as_uuid())
        .bind(bill_id.as_uuid())
        .bind(&line_item.reference)
        .bind(&line_item.description)
        .bind(line_item.amount)
        .bind(line_item.currency.code())
        .bind(line_item.exchange_rate)
        .bind(line_item.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_line_item", e))?;

        let total: Decimal = sqlx::query_scalar(
            "UPDATE bill SET total_amount = total_amount + $2 WHERE id = $1 RETURNING total_amount",
        )
        .bind(bill_id.as_uuid())
        .bind(delta)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_bill_total", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        span.record("outcome", "appended");
        Ok(AppendOutcome::Appended {
            line_item: line_item.clone(),
            total,
        })
    }

    #[instrument(skip(self), fields(bill_id = %bill_id, outcome = tracing::field::Empty), err)]
    async fn close_bill(&self, bill_id: BillId) -> Result<CloseOutcome, LedgerError> {
        let span = Span::current();

        let updated = sqlx::query(
            r#"
            UPDATE bill
            SET status = 'closed'
            WHERE id = $1 AND status = 'open'
            RETURNING id, status, account_id, currency, total_amount, period_start, period_end, created_at
            "#,
        )
        .bind(bill_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("close_bill", e))?;

        if let Some(row) = updated {
            span.record("outcome", "closed");
            return Ok(CloseOutcome::Closed(bill_from_row(&row)?));
        }

        match self.fetch_bill(bill_id).await? {
            Some(bill) => {
                span.record("outcome", "already_closed");
                Ok(CloseOutcome::AlreadyClosed(bill))
            }
            None => Err(LedgerError::NotFound(bill_id)),
        }
    }

    #[instrument(skip(self), fields(bill_id = %bill_id), err)]
    async fn list_line_items(&self, bill_id: BillId) -> Result<Vec<LineItem>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, bill_id, reference, description, amount, currency, exchange_rate, created_at
            FROM bill_item
            WHERE bill_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(bill_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_line_items", e))?;

        rows.iter().map(line_item_from_row).collect()
    }

    #[instrument(skip(self), fields(account_id = %account_id, status = ?status), err)]
    async fn list_bills(
        &self,
        account_id: &AccountId,
        status: Option<BillStatus>,
    ) -> Result<Vec<Bill>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, account_id, currency, total_amount, period_start, period_end, created_at
            FROM bill
            WHERE account_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(account_id.as_str())
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_bills", e))?;

        rows.iter().map(bill_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_open_bills(&self) -> Result<Vec<Bill>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, account_id, currency, total_amount, period_start, period_end, created_at
            FROM bill
            WHERE status = 'open'
            ORDER BY period_end ASC, id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_open_bills", e))?;

        rows.iter().map(bill_from_row).collect()
    }
}

/// Map SQLx errors to `LedgerError`, classifying what is worth retrying.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => LedgerError::Conflict(msg),
                Some("23503") | Some("23514") => LedgerError::InvalidData(msg),
                Some(code) if code.starts_with("08") => LedgerError::Unavailable(msg),
                _ => LedgerError::InvalidData(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            LedgerError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => LedgerError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => LedgerError::Unavailable(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::RowNotFound => {
            LedgerError::InvalidData(format!("unexpected row not found in {}", operation))
        }
        other => LedgerError::InvalidData(format!("sqlx error in {}: {}", operation, other)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn parse_status(raw: &str) -> Result<BillStatus, LedgerError> {
    raw.parse()
        .map_err(|e| LedgerError::InvalidData(format!("bill.status: {e}")))
}

// SQLx row types

#[derive(Debug)]
struct BillRow {
    id: uuid::Uuid,
    status: String,
    account_id: String,
    currency: String,
    total_amount: Decimal,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for BillRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(BillRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            account_id: row.try_get("account_id")?,
            currency: row.try_get("currency")?,
            total_amount: row.try_get("total_amount")?,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<BillRow> for Bill {
    type Error = LedgerError;

    fn try_from(row: BillRow) -> Result<Self, Self::Error> {
        Ok(Bill {
            id: BillId::from_uuid(row.id),
            status: parse_status(&row.status)?,
            account_id: AccountId::new(row.account_id)
                .map_err(|e| LedgerError::InvalidData(format!("bill.account_id: {e}")))?,
            currency: Currency::new(&row.currency)
                .map_err(|e| LedgerError::InvalidData(format!("bill.currency: {e}")))?,
            total_amount: row.total_amount,
            period_start: row.period_start,
            period_end: row.period_end,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct LineItemRow {
    id: uuid::Uuid,
    bill_id: uuid::Uuid,
    reference: String,
    description: String,
    amount: Decimal,
    currency: String,
    exchange_rate: Decimal,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LineItemRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(LineItemRow {
            id: row.try_get("id")?,
            bill_id: row.try_get("bill_id")?,
            reference: row.try_get("reference")?,
            description: row.try_get("description")?,
            amount: row.try_get("amount")?,
            currency: row.try_get("currency")?,
            exchange_rate: row.try_get("exchange_rate")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<LineItemRow> for LineItem {
    type Error = LedgerError;

    fn try_from(row: LineItemRow) -> Result<Self, Self::Error> {
        Ok(LineItem {
            id: LineItemId::from_uuid(row.id),
            bill_id: BillId::from_uuid(row.bill_id),
            reference: row.reference,
            description: row.description,
            amount: row.amount,
            currency: Currency::new(&row.currency)
                .map_err(|e| LedgerError::InvalidData(format!("bill_item.currency: {e}")))?,
            exchange_rate: row.exchange_rate,
            created_at: row.created_at,
        })
    }
}

fn bill_from_row(row: &sqlx::postgres::PgRow) -> Result<Bill, LedgerError> {
    BillRow::from_row(row)
        .map_err(|e| LedgerError::InvalidData(format!("failed to decode bill row: {e}")))?
        .try_into()
}

fn line_item_from_row(row: &sqlx::postgres::PgRow) -> Result<LineItem, LedgerError> {
    LineItemRow::from_row(row)
        .map_err(|e| LedgerError::InvalidData(format!("failed to decode bill_item row: {e}")))?
        .try_into()
}
