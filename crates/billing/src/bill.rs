use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use billflow_core::{AccountId, BillId, Currency, DomainError, DomainResult};

use crate::line_item::{LineItem, sum_line_items};

/// Bill status lifecycle. Transitions only `Open -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillStatus {
    Open,
    Closed,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Open => "open",
            BillStatus::Closed => "closed",
        }
    }

    /// Status changes are monotonic: nothing leaves `Closed`, nothing re-enters `Open`.
    pub fn can_transition_to(self, next: BillStatus) -> bool {
        matches!((self, next), (BillStatus::Open, BillStatus::Closed))
    }
}

impl core::fmt::Display for BillStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for BillStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(BillStatus::Open),
            "closed" => Ok(BillStatus::Closed),
            other => Err(DomainError::invalid_argument(format!("unknown bill status '{other}'"))),
        }
    }
}

/// Command: open a new bill for an account and billing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBill {
    pub bill_id: BillId,
    pub account_id: AccountId,
    pub currency: Currency,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl CreateBill {
    /// New request with a system-assigned (UUIDv7) bill identifier.
    pub fn new(
        account_id: AccountId,
        currency: Currency,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Self {
        Self {
            bill_id: BillId::new(),
            account_id,
            currency,
            period_start,
            period_end,
        }
    }

    /// Use a caller-assigned identifier instead.
    pub fn with_bill_id(mut self, bill_id: BillId) -> Self {
        self.bill_id = bill_id;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.period_end <= self.period_start {
            return Err(DomainError::invalid_argument(format!(
                "period_end ({}) must be after period_start ({})",
                self.period_end, self.period_start
            )));
        }
        Ok(())
    }
}

/// Durable bill record.
///
/// `total_amount` is the stored running total, always expressed in the bill currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bill {
    pub id: BillId,
    pub status: BillStatus,
    pub account_id: AccountId,
    pub currency: Currency,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Bill {
    /// A freshly opened bill with a zero total.
    pub fn open(cmd: &CreateBill, created_at: DateTime<Utc>) -> Self {
        Self {
            id: cmd.bill_id,
            status: BillStatus::Open,
            account_id: cmd.account_id.clone(),
            currency: cmd.currency.clone(),
            period_start: cmd.period_start,
            period_end: cmd.period_end,
            total_amount: Decimal::ZERO,
            created_at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == BillStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status == BillStatus::Closed
    }

    pub fn ensure_open(&self) -> DomainResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DomainError::precondition(format!("bill {} is already closed", self.id)))
        }
    }

    /// Time left until the period ends, saturating at zero once it has elapsed.
    pub fn remaining_until_close(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.period_end - now).to_std().unwrap_or(std::time::Duration::ZERO)
    }

    /// Accept a line item into the running total.
    ///
    /// Rejects items for other bills, any item once the bill is closed, and items that
    /// would overflow the total. A rejected item leaves the bill untouched.
    pub fn apply_line_item(&mut self, item: &LineItem) -> DomainResult<()> {
        self.ensure_open()?;
        if item.bill_id != self.id {
            return Err(DomainError::invalid_argument(format!(
                "line item belongs to bill {}, not {}",
                item.bill_id, self.id
            )));
        }
        let total = self
            .total_amount
            .checked_add(item.normalized_amount()?)
            .ok_or_else(|| DomainError::invalid_argument("bill total overflow"))?;
        self.total_amount = total;
        Ok(())
    }

    /// Transition to `Closed`. Fails if the bill is already closed.
    pub fn close(&mut self) -> DomainResult<()> {
        if !self.status.can_transition_to(BillStatus::Closed) {
            return Err(DomainError::precondition(format!("bill {} is already closed", self.id)));
        }
        self.status = BillStatus::Closed;
        Ok(())
    }
}

/// Bill with its line items, as served to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillDetails {
    pub bill: Bill,
    pub line_items: Vec<LineItem>,
    pub total_amount: Decimal,
}

impl BillDetails {
    pub fn new(bill: Bill, line_items: Vec<LineItem>) -> Self {
        let total_amount = bill.total_amount;
        Self {
            bill,
            line_items,
            total_amount,
        }
    }

    /// The stored total agrees with summing the line items on read.
    pub fn is_consistent(&self) -> bool {
        sum_line_items(&self.line_items).is_ok_and(|sum| sum == self.total_amount)
    }
}
