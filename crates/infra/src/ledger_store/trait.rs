use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use billflow_billing::{Bill, BillStatus, LineItem};
use billflow_core::{AccountId, BillId, DomainError};

/// Ledger operation error.
///
/// These are **infrastructure errors**. Deterministic failures (`AlreadyExists`,
/// `NotFound`, `BillClosed`, `InvalidData`) are never retried; the rest are transient
/// and handled by the activity executor's retry policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("bill {0} already exists")]
    AlreadyExists(BillId),

    #[error("bill {0} not found")]
    NotFound(BillId),

    #[error("bill {0} is closed")]
    BillClosed(BillId),

    #[error("invalid ledger data: {0}")]
    InvalidData(String),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// Serialization failure or lost race inside the storage engine.
    #[error("ledger conflict: {0}")]
    Conflict(String),

    #[error("ledger operation timed out: {0}")]
    Timeout(String),
}

impl LedgerError {
    /// Connectivity, serialization conflicts and timeouts are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Unavailable(_) | LedgerError::Conflict(_) | LedgerError::Timeout(_)
        )
    }

    /// Domain view of a deterministic failure, as reported to callers.
    pub fn to_domain(&self) -> DomainError {
        match self {
            LedgerError::AlreadyExists(id) => DomainError::conflict(format!("bill {id} already exists")),
            LedgerError::NotFound(_) => DomainError::not_found(),
            LedgerError::BillClosed(id) => DomainError::precondition(format!("bill {id} is already closed")),
            LedgerError::InvalidData(msg) => DomainError::invalid_argument(msg.clone()),
            other => DomainError::conflict(other.to_string()),
        }
    }
}

/// Result of appending a line item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Item stored and the bill total incremented, in one atomic step.
    Appended { line_item: LineItem, total: Decimal },
    /// An item with the same reference already exists; nothing was written.
    Duplicate { existing: LineItem, total: Decimal },
}

impl AppendOutcome {
    pub fn total(&self) -> Decimal {
        match self {
            AppendOutcome::Appended { total, .. } | AppendOutcome::Duplicate { total, .. } => *total,
        }
    }
}

/// Result of the compare-and-set close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call moved the bill from `Open` to `Closed`.
    Closed(Bill),
    /// The bill was already closed; nothing was written.
    AlreadyClosed(Bill),
}

/// Storage boundary for bills and their line items.
///
/// Every mutation is safe to retry:
/// - `create_bill` fails with `AlreadyExists` rather than overwriting;
/// - `append_line_item` is keyed on `(bill_id, reference)` and inserts the item and bumps
///   the total in one atomic unit;
/// - `close_bill` only writes when the stored status is still `Open`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_bill(&self, bill: &Bill) -> Result<(), LedgerError>;

    async fn get_bill(&self, bill_id: BillId) -> Result<Option<Bill>, LedgerError>;

    /// Fails with `BillClosed` if the bill is no longer open.
    async fn append_line_item(&self, line_item: &LineItem) -> Result<AppendOutcome, LedgerError>;

    async fn close_bill(&self, bill_id: BillId) -> Result<CloseOutcome, LedgerError>;

    /// Line items in insertion order.
    async fn list_line_items(&self, bill_id: BillId) -> Result<Vec<LineItem>, LedgerError>;

    async fn list_bills(
        &self,
        account_id: &AccountId,
        status: Option<BillStatus>,
    ) -> Result<Vec<Bill>, LedgerError>;

    /// Every bill still `Open`, across accounts. Used by restart recovery.
    async fn list_open_bills(&self) -> Result<Vec<Bill>, LedgerError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn create_bill(&self, bill: &Bill) -> Result<(), LedgerError> {
        (**self).create_bill(bill).await
    }

    async fn get_bill(&self, bill_id: BillId) -> Result<Option<Bill>, LedgerError> {
        (**self).get_bill(bill_id).await
    }

    async fn append_line_item(&self, line_item: &LineItem) -> Result<AppendOutcome, LedgerError> {
        (**self).append_line_item(line_item).await
    }

    async fn close_bill(&self, bill_id: BillId) -> Result<CloseOutcome, LedgerError> {
        (**self).close_bill(bill_id).await
    }

    async fn list_line_items(&self, bill_id: BillId) -> Result<Vec<LineItem>, LedgerError> {
        (**self).list_line_items(bill_id).await
    }

    async fn list_bills(
        &self,
        account_id: &AccountId,
        status: Option<BillStatus>,
    ) -> Result<Vec<Bill>, LedgerError> {
        (**self).list_bills(account_id, status).await
    }

    async fn list_open_bills(&self) -> Result<Vec<Bill>, LedgerError> {
        (**self).list_open_bills().await
    }
}
