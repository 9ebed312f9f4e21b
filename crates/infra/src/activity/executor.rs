//! Activity executor: timeout, retry and backoff around ledger mutations.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use billflow_billing::{Bill, LineItem};
use billflow_core::{BillId, Clock};

use super::types::{ActivityConfig, ActivityError, ActivityKind};
use crate::ledger_store::{AppendOutcome, CloseOutcome, LedgerError, LedgerStore};

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub activities_succeeded: u64,
    pub activities_rejected: u64,
    pub activities_exhausted: u64,
    /// Attempts that were followed by another attempt.
    pub retries: u64,
    pub attempts_timed_out: u64,
}

/// Runs ledger mutations for bill controllers.
///
/// Each attempt gets its own timeout, derived from the time left until the bill's
/// period end and clamped to the configured bounds. Every mutation is written so a
/// retry after a lost reply has no double effect:
/// - append is keyed on the line-item reference, and a duplicate carrying our own item
///   id is reported as the original append;
/// - close is compare-and-set, and `AlreadyClosed` on a retry means our earlier attempt
///   landed.
pub struct ActivityExecutor<S> {
    store: S,
    config: ActivityConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl<S: LedgerStore> ActivityExecutor<S> {
    pub fn new(store: S, config: ActivityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ActivityConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Insert the bill record. `AlreadyExists` is only tolerated on a retry, and only
    /// when the stored bill matches the one being created.
    pub async fn create_bill(&self, bill: &Bill) -> Result<(), ActivityError> {
        let store = &self.store;
        self.execute(ActivityKind::CreateBill, bill.id, Some(bill), move |attempt| async move {
            match store.create_bill(bill).await {
                Err(LedgerError::AlreadyExists(id)) if attempt > 1 => match store.get_bill(id).await? {
                    Some(existing)
                        if existing.account_id == bill.account_id && existing.currency == bill.currency =>
                    {
                        Ok(())
                    }
                    _ => Err(LedgerError::AlreadyExists(id)),
                },
                other => other,
            }
        })
        .await
    }

    pub async fn load_bill(&self, bill_id: BillId) -> Result<Option<Bill>, ActivityError> {
        let store = &self.store;
        self.execute(ActivityKind::LoadBill, bill_id, None, move |_| store.get_bill(bill_id))
            .await
    }

    pub async fn append_line_item(
        &self,
        bill: &Bill,
        line_item: &LineItem,
    ) -> Result<AppendOutcome, ActivityError> {
        let store = &self.store;
        self.execute(ActivityKind::AppendLineItem, bill.id, Some(bill), move |_| async move {
            match store.append_line_item(line_item).await? {
                AppendOutcome::Duplicate { existing, total } if existing.id == line_item.id => {
                    Ok(AppendOutcome::Appended {
                        line_item: existing,
                        total,
                    })
                }
                outcome => Ok(outcome),
            }
        })
        .await
    }

    pub async fn close_bill(&self, bill: &Bill) -> Result<CloseOutcome, ActivityError> {
        let store = &self.store;
        let bill_id = bill.id;
        self.execute(ActivityKind::CloseBill, bill_id, Some(bill), move |attempt| async move {
            match store.close_bill(bill_id).await? {
                CloseOutcome::AlreadyClosed(closed) if attempt > 1 => Ok(CloseOutcome::Closed(closed)),
                outcome => Ok(outcome),
            }
        })
        .await
    }

    fn attempt_timeout(&self, bill: Option<&Bill>) -> Duration {
        match bill {
            Some(bill) => self
                .config
                .attempt_timeout(bill.remaining_until_close(self.clock.now())),
            None => self.config.max_attempt_timeout,
        }
    }

    fn record(&self, f: impl FnOnce(&mut ExecutorStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    async fn execute<T, F, Fut>(
        &self,
        kind: ActivityKind,
        bill_id: BillId,
        bill: Option<&Bill>,
        mut op: F,
    ) -> Result<T, ActivityError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let timeout = self.attempt_timeout(bill);

            let result = match tokio::time::timeout(timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => {
                    self.record(|s| s.attempts_timed_out += 1);
                    Err(LedgerError::Timeout(format!(
                        "{kind} attempt {attempt} exceeded {}ms",
                        timeout.as_millis()
                    )))
                }
            };

            match result {
                Ok(value) => {
                    self.record(|s| s.activities_succeeded += 1);
                    if attempt > 1 {
                        info!(activity = %kind, bill_id = %bill_id, attempt, "activity succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_transient() => {
                    self.record(|s| s.activities_rejected += 1);
                    debug!(activity = %kind, bill_id = %bill_id, attempt, error = %error, "activity rejected");
                    return Err(ActivityError::Rejected { kind, error });
                }
                Err(error) => {
                    if !self.config.retry.should_retry(attempt) {
                        self.record(|s| s.activities_exhausted += 1);
                        error!(
                            activity = %kind,
                            bill_id = %bill_id,
                            attempts = attempt,
                            error = %error,
                            "activity retries exhausted"
                        );
                        return Err(ActivityError::Exhausted {
                            kind,
                            attempts: attempt,
                            last_error: error,
                        });
                    }

                    let delay = self.config.retry.delay_for_attempt(attempt);
                    self.record(|s| s.retries += 1);
                    warn!(
                        activity = %kind,
                        bill_id = %bill_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient ledger failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    use billflow_billing::{CreateBill, NewLineItem};
    use billflow_core::{AccountId, Currency, SystemClock};

    use crate::activity::types::RetryPolicy;
    use crate::ledger_store::{InMemoryLedgerStore, LedgerOp};

    fn executor(max_attempts: u32) -> ActivityExecutor<Arc<InMemoryLedgerStore>> {
        let config = ActivityConfig {
            retry: RetryPolicy::fixed(max_attempts, Duration::from_millis(1)),
            max_attempt_timeout: Duration::from_millis(50),
            min_attempt_timeout: Duration::from_millis(10),
        };
        ActivityExecutor::new(Arc::new(InMemoryLedgerStore::new()), config, Arc::new(SystemClock))
    }

    fn bill() -> Bill {
        let now = Utc::now();
        let cmd = CreateBill::new(
            AccountId::new("acct-exec").unwrap(),
            Currency::new("USD").unwrap(),
            now,
            now + ChronoDuration::hours(1),
        );
        Bill::open(&cmd, now)
    }

    fn line_item(bill: &Bill, reference: &str) -> LineItem {
        NewLineItem {
            reference: reference.to_string(),
            description: "seats".to_string(),
            amount: dec!(12.50),
            currency: Currency::new("USD").unwrap(),
            exchange_rate: dec!(1),
        }
        .into_line_item(bill.id, Utc::now())
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let exec = executor(5);
        let bill = bill();
        exec.store()
            .fail_next(LedgerOp::CreateBill, 2, LedgerError::Unavailable("connection reset".into()));

        exec.create_bill(&bill).await.unwrap();

        assert_eq!(exec.store().stats().bills_created, 1);
        let stats = exec.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.activities_succeeded, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let exec = executor(3);
        let bill = bill();
        exec.store()
            .fail_next(LedgerOp::CreateBill, 5, LedgerError::Conflict("serialization failure".into()));

        let err = exec.create_bill(&bill).await.unwrap_err();
        assert_eq!(
            err,
            ActivityError::Exhausted {
                kind: ActivityKind::CreateBill,
                attempts: 3,
                last_error: LedgerError::Conflict("serialization failure".into()),
            }
        );
        assert_eq!(exec.store().stats().bills_created, 0);
    }

    #[tokio::test]
    async fn deterministic_failures_are_not_retried() {
        let exec = executor(5);
        let bill = bill();
        exec.create_bill(&bill).await.unwrap();

        let err = exec.create_bill(&bill).await.unwrap_err();
        assert!(matches!(
            err,
            ActivityError::Rejected {
                error: LedgerError::AlreadyExists(_),
                ..
            }
        ));
        assert_eq!(exec.stats().retries, 0);
    }

    #[tokio::test]
    async fn slow_attempt_times_out_and_is_retried() {
        let exec = executor(3);
        let bill = bill();
        exec.create_bill(&bill).await.unwrap();
        exec.store()
            .stall_next(LedgerOp::AppendLineItem, 1, Duration::from_millis(500));

        let outcome = exec.append_line_item(&bill, &line_item(&bill, "R1")).await.unwrap();

        assert!(matches!(outcome, AppendOutcome::Appended { .. }));
        assert_eq!(outcome.total(), dec!(12.50));
        assert_eq!(exec.stats().attempts_timed_out, 1);
        assert_eq!(exec.store().stats().line_items_inserted, 1);
    }

    #[tokio::test]
    async fn replaying_the_same_item_is_not_double_counted() {
        let exec = executor(3);
        let bill = bill();
        exec.create_bill(&bill).await.unwrap();
        let item = line_item(&bill, "R1");

        exec.append_line_item(&bill, &item).await.unwrap();
        // Same item id: our own earlier write, reported as the original append.
        let replay = exec.append_line_item(&bill, &item).await.unwrap();
        assert!(matches!(replay, AppendOutcome::Appended { .. }));

        // Same reference, new item: a redelivered signal.
        let redelivered = exec.append_line_item(&bill, &line_item(&bill, "R1")).await.unwrap();
        assert!(matches!(redelivered, AppendOutcome::Duplicate { .. }));

        assert_eq!(redelivered.total(), dec!(12.50));
        assert_eq!(exec.store().stats().line_items_inserted, 1);
    }

    #[tokio::test]
    async fn close_is_reported_once() {
        let exec = executor(3);
        let bill = bill();
        exec.create_bill(&bill).await.unwrap();

        assert!(matches!(exec.close_bill(&bill).await.unwrap(), CloseOutcome::Closed(_)));
        assert!(matches!(
            exec.close_bill(&bill).await.unwrap(),
            CloseOutcome::AlreadyClosed(_)
        ));
        assert_eq!(exec.store().stats().status_updates, 1);
    }
}
