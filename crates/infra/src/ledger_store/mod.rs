//! Durable storage for bills and line items.
//!
//! The store is a passive system of record: it enforces per-bill atomicity and the
//! storage-level guards (unique reference per bill, compare-and-set close) but owns no
//! lifecycle logic of its own.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryLedgerStore, LedgerOp, WriteStats};
pub use postgres::PostgresLedgerStore;
pub use r#trait::{AppendOutcome, CloseOutcome, LedgerError, LedgerStore};
