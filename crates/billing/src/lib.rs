//! Billing domain module: bills, line items, and the rules that guard them.

pub mod bill;
pub mod line_item;

pub use bill::{Bill, BillDetails, BillStatus, CreateBill};
pub use line_item::{LineItem, NewLineItem, sum_line_items};
