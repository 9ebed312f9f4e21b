use serde::{Deserialize, Serialize};

use billflow_billing::NewLineItem;
use billflow_core::BillId;

/// Request to append a charge to an open bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLineItem {
    pub bill_id: BillId,
    pub line_item: NewLineItem,
}

impl AddLineItem {
    pub fn new(bill_id: BillId, line_item: NewLineItem) -> Self {
        Self { bill_id, line_item }
    }

    pub fn reference(&self) -> &str {
        &self.line_item.reference
    }
}

/// Request to close a bill before its period ends. Idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseBill {
    pub bill_id: BillId,
}

impl CloseBill {
    pub fn new(bill_id: BillId) -> Self {
        Self { bill_id }
    }
}

/// External signals accepted by a bill controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BillSignal {
    AddLineItem(AddLineItem),
    CloseBill(CloseBill),
}

impl BillSignal {
    pub fn bill_id(&self) -> BillId {
        match self {
            BillSignal::AddLineItem(s) => s.bill_id,
            BillSignal::CloseBill(s) => s.bill_id,
        }
    }

    pub fn signal_type(&self) -> &'static str {
        match self {
            BillSignal::AddLineItem(_) => "add_line_item",
            BillSignal::CloseBill(_) => "close_bill",
        }
    }
}

impl From<AddLineItem> for BillSignal {
    fn from(value: AddLineItem) -> Self {
        BillSignal::AddLineItem(value)
    }
}

impl From<CloseBill> for BillSignal {
    fn from(value: CloseBill) -> Self {
        BillSignal::CloseBill(value)
    }
}
