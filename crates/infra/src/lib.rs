//! Infrastructure layer: ledger storage, activity execution, bill controllers and the
//! runtime that supervises them.

pub mod activity;
pub mod config;
pub mod ledger_store;
pub mod lifecycle;
pub mod runtime;

pub use config::BillingConfig;
pub use runtime::{BillingRuntime, RuntimeError};
