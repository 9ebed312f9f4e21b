//! Durable mutations with per-attempt timeout, retry and backoff.
//!
//! The executor is the only component that writes to the ledger on behalf of a bill
//! controller. Transient ledger errors are retried; deterministic ones are surfaced
//! on the first attempt.

pub mod executor;
pub mod types;

pub use executor::{ActivityExecutor, ExecutorStats};
pub use types::{ActivityConfig, ActivityError, ActivityKind, BackoffStrategy, RetryPolicy};
