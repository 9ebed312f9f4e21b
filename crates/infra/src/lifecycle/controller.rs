//! Bill lifecycle controller.
//!
//! One controller runs per open bill. It owns the bill's mailbox and deadline and
//! processes exactly one event at a time:
//!
//! ```text
//! Created --start--> Open --close / deadline--> Closed
//! ```
//!
//! Every durable step goes through the [`ActivityExecutor`]; the loop is suspended
//! while a mutation is in flight, so no two mutations for the same bill overlap. The
//! stored bill status doubles as the controller's persisted position: a restarted
//! controller reloads it and carries on from there.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use billflow_billing::{Bill, CreateBill};
use billflow_core::{BillId, DomainError};
use billflow_events::{AddLineItem, CloseReason, Inbound, Mailbox, SignalOutcome};

use super::deadline::{Deadline, DeadlineScheduler};
use crate::activity::{ActivityError, ActivityExecutor};
use crate::ledger_store::{AppendOutcome, CloseOutcome, LedgerError, LedgerStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Wait before retrying a deadline close that failed.
    pub deadline_retry: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            deadline_retry: Duration::from_secs(5),
        }
    }
}

/// Failure to open a bill. Fatal to the controller; nothing is compensated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CreationError {
    #[error("invalid bill: {0}")]
    Invalid(DomainError),

    #[error("bill {0} already exists")]
    Duplicate(BillId),

    #[error("failed to create bill: {0}")]
    Ledger(ActivityError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResumeError {
    #[error("bill {0} not found")]
    NotFound(BillId),

    #[error("failed to load bill: {0}")]
    Ledger(ActivityError),
}

/// Final state of a controller that stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerReport {
    pub bill: Bill,
    /// Set only when this controller performed the close.
    pub closed_by: Option<CloseReason>,
}

enum ControllerEvent {
    Signal(Inbound),
    DeadlineElapsed,
}

pub struct LifecycleController<S> {
    bill: Bill,
    executor: Arc<ActivityExecutor<S>>,
    scheduler: DeadlineScheduler,
    deadline: Deadline,
    mailbox: Mailbox,
    settings: ControllerSettings,
    closed_by: Option<CloseReason>,
}

impl<S: LedgerStore> LifecycleController<S> {
    /// Create the bill record and arm its deadline.
    pub async fn start(
        cmd: CreateBill,
        executor: Arc<ActivityExecutor<S>>,
        scheduler: DeadlineScheduler,
        mailbox: Mailbox,
        settings: ControllerSettings,
    ) -> Result<Self, CreationError> {
        if mailbox.bill_id() != cmd.bill_id {
            return Err(CreationError::Invalid(DomainError::invalid_argument(format!(
                "mailbox belongs to bill {}, not {}",
                mailbox.bill_id(),
                cmd.bill_id
            ))));
        }
        cmd.validate().map_err(CreationError::Invalid)?;

        let bill = Bill::open(&cmd, executor.clock().now());
        executor.create_bill(&bill).await.map_err(|e| match e {
            ActivityError::Rejected {
                error: LedgerError::AlreadyExists(id),
                ..
            } => CreationError::Duplicate(id),
            other => CreationError::Ledger(other),
        })?;

        let deadline = scheduler.arm(bill.period_end);
        info!(
            bill_id = %bill.id,
            account_id = %bill.account_id,
            period_end = %bill.period_end,
            "bill opened"
        );

        Ok(Self {
            bill,
            executor,
            scheduler,
            deadline,
            mailbox,
            settings,
            closed_by: None,
        })
    }

    /// Rebuild a controller from the stored bill after a restart.
    ///
    /// The deadline is re-armed against the stored `period_end`, so time spent down
    /// counts against the period.
    pub async fn resume(
        bill_id: BillId,
        executor: Arc<ActivityExecutor<S>>,
        scheduler: DeadlineScheduler,
        mailbox: Mailbox,
        settings: ControllerSettings,
    ) -> Result<Self, ResumeError> {
        let bill = executor
            .load_bill(bill_id)
            .await
            .map_err(ResumeError::Ledger)?
            .ok_or(ResumeError::NotFound(bill_id))?;

        let mut deadline = scheduler.arm(bill.period_end);
        if bill.is_closed() {
            deadline.cancel();
        }
        info!(
            bill_id = %bill.id,
            status = %bill.status,
            total = %bill.total_amount,
            period_end = %bill.period_end,
            "bill controller resumed"
        );

        Ok(Self {
            bill,
            executor,
            scheduler,
            deadline,
            mailbox,
            settings,
            closed_by: None,
        })
    }

    /// Last known durable state.
    pub fn bill(&self) -> &Bill {
        &self.bill
    }

    /// Process events until the bill closes or the mailbox is shut.
    ///
    /// After a close the mailbox is sealed and whatever is still buffered is answered
    /// (line items rejected, closes redundant). A shut mailbox leaves an open bill open.
    pub async fn run(mut self) -> ControllerReport {
        while self.bill.is_open() {
            let event = tokio::select! {
                inbound = self.mailbox.next() => match inbound {
                    Some(inbound) => ControllerEvent::Signal(inbound),
                    None => break,
                },
                _ = self.deadline.elapsed(), if self.deadline.is_armed() => ControllerEvent::DeadlineElapsed,
            };
            self.handle(event).await;
        }

        if self.bill.is_closed() {
            self.mailbox.seal();
            let mut drained = 0usize;
            while let Some(inbound) = self.mailbox.next().await {
                drained += 1;
                self.handle(ControllerEvent::Signal(inbound)).await;
            }
            debug!(bill_id = %self.bill.id, drained, "mailbox drained after close");
        } else {
            info!(bill_id = %self.bill.id, "mailbox shut, controller stopping with bill open");
        }

        ControllerReport {
            bill: self.bill,
            closed_by: self.closed_by,
        }
    }

    async fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Signal(Inbound::LineItem(delivery)) => {
                let outcome = self.add_line_item(delivery.signal()).await;
                delivery.respond(outcome);
            }
            ControllerEvent::Signal(Inbound::Close(delivery)) => {
                let outcome = self.close(CloseReason::Explicit).await;
                delivery.respond(outcome);
            }
            ControllerEvent::DeadlineElapsed => {
                let outcome = self.close(CloseReason::Deadline).await;
                if outcome.is_failure() {
                    warn!(
                        bill_id = %self.bill.id,
                        retry_in_ms = self.settings.deadline_retry.as_millis() as u64,
                        "deadline close failed, re-arming"
                    );
                    self.deadline = self.scheduler.arm_after(self.settings.deadline_retry);
                }
            }
        }
    }

    async fn add_line_item(&mut self, signal: &AddLineItem) -> SignalOutcome {
        let bill_id = self.bill.id;
        let reference = signal.reference();

        if let Err(err) = self.bill.ensure_open() {
            info!(bill_id = %bill_id, reference, outcome = "rejected", "line item for closed bill");
            return SignalOutcome::rejected(err);
        }
        if signal.bill_id != bill_id {
            return SignalOutcome::rejected(DomainError::invalid_argument(format!(
                "signal for bill {} delivered to bill {}",
                signal.bill_id, bill_id
            )));
        }
        if let Err(err) = signal.line_item.validate() {
            info!(bill_id = %bill_id, reference, error = %err, outcome = "rejected", "invalid line item");
            return SignalOutcome::rejected(err);
        }

        let item = signal
            .line_item
            .clone()
            .into_line_item(bill_id, self.executor.clock().now());

        match self.executor.append_line_item(&self.bill, &item).await {
            Ok(AppendOutcome::Appended { line_item, total }) => {
                self.bill.total_amount = total;
                info!(bill_id = %bill_id, reference, total = %total, outcome = "applied", "line item applied");
                SignalOutcome::Applied { line_item, total }
            }
            Ok(AppendOutcome::Duplicate { existing, total }) => {
                self.bill.total_amount = total;
                info!(bill_id = %bill_id, reference, total = %total, outcome = "duplicate", "line item already recorded");
                SignalOutcome::Duplicate {
                    line_item: existing,
                    total,
                }
            }
            Err(err) => {
                if matches!(err.ledger_error(), LedgerError::BillClosed(_)) {
                    // The ledger is ahead of us; adopt its status.
                    self.adopt_closed();
                }
                self.failure_outcome(&err, reference)
            }
        }
    }

    async fn close(&mut self, reason: CloseReason) -> SignalOutcome {
        let bill_id = self.bill.id;

        if self.bill.is_closed() {
            info!(bill_id = %bill_id, closed_by = %reason, outcome = "redundant", "bill already closed");
            return SignalOutcome::Redundant;
        }

        match self.executor.close_bill(&self.bill).await {
            Ok(CloseOutcome::Closed(bill)) => {
                self.bill = bill;
                self.deadline.cancel();
                self.closed_by = Some(reason);
                let total = self.bill.total_amount;
                info!(bill_id = %bill_id, closed_by = %reason, total = %total, outcome = "closed", "bill closed");
                SignalOutcome::Closed {
                    closed_by: reason,
                    total,
                }
            }
            Ok(CloseOutcome::AlreadyClosed(bill)) => {
                self.bill = bill;
                self.deadline.cancel();
                info!(bill_id = %bill_id, closed_by = %reason, outcome = "redundant", "ledger already closed");
                SignalOutcome::Redundant
            }
            Err(err) => self.failure_outcome(&err, reason.as_str()),
        }
    }

    fn adopt_closed(&mut self) {
        if self.bill.close().is_ok() {
            self.deadline.cancel();
        }
    }

    fn failure_outcome(&self, err: &ActivityError, context: &str) -> SignalOutcome {
        match err.rejection() {
            Some(domain) => {
                warn!(bill_id = %self.bill.id, context, error = %err, outcome = "rejected", "ledger rejected mutation");
                SignalOutcome::rejected(domain)
            }
            None => {
                error!(bill_id = %self.bill.id, context, error = %err, outcome = "failed", "ledger mutation failed, bill unchanged");
                SignalOutcome::failed(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use billflow_billing::NewLineItem;
    use billflow_core::{AccountId, Currency, SystemClock};
    use billflow_events::{CloseBill, EventRouter, InMemoryEventRouter, SignalEnvelope};

    use crate::activity::{ActivityConfig, RetryPolicy};
    use crate::ledger_store::InMemoryLedgerStore;

    type Executor = ActivityExecutor<Arc<InMemoryLedgerStore>>;

    fn executor() -> Arc<Executor> {
        let config = ActivityConfig {
            retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
            ..ActivityConfig::default()
        };
        Arc::new(ActivityExecutor::new(
            Arc::new(InMemoryLedgerStore::new()),
            config,
            Arc::new(SystemClock),
        ))
    }

    fn scheduler() -> DeadlineScheduler {
        DeadlineScheduler::new(Arc::new(SystemClock))
    }

    fn create_cmd() -> CreateBill {
        let now = Utc::now();
        CreateBill::new(
            AccountId::new("acct-ctl").unwrap(),
            Currency::new("USD").unwrap(),
            now,
            now + chrono::Duration::hours(1),
        )
    }

    fn add(bill_id: BillId, reference: &str) -> SignalEnvelope<AddLineItem> {
        SignalEnvelope::new(
            bill_id,
            AddLineItem::new(
                bill_id,
                NewLineItem {
                    reference: reference.to_string(),
                    description: "egress".to_string(),
                    amount: dec!(3),
                    currency: Currency::new("USD").unwrap(),
                    exchange_rate: dec!(1),
                },
            ),
        )
    }

    #[tokio::test]
    async fn start_rejects_mailbox_of_another_bill() {
        let router = InMemoryEventRouter::new(4);
        let mailbox = router.register(BillId::new()).unwrap();
        let exec = executor();

        let result = LifecycleController::start(
            create_cmd(),
            exec.clone(),
            scheduler(),
            mailbox,
            ControllerSettings::default(),
        )
        .await;
        assert!(matches!(result, Err(CreationError::Invalid(_))));
        assert_eq!(exec.store().stats().bills_created, 0);
    }

    #[tokio::test]
    async fn resumed_closed_bill_answers_buffered_signals_and_stops() {
        let exec = executor();
        let cmd = create_cmd();
        let bill = Bill::open(&cmd, Utc::now());
        exec.create_bill(&bill).await.unwrap();
        exec.store().close_bill(bill.id).await.unwrap();

        let router = InMemoryEventRouter::new(4);
        let mailbox = router.register(bill.id).unwrap();
        let line = router.route_line_item(add(bill.id, "R1")).await.unwrap();
        let close = router
            .route_close(SignalEnvelope::new(bill.id, CloseBill::new(bill.id)))
            .await
            .unwrap();

        let controller = LifecycleController::resume(
            bill.id,
            exec.clone(),
            scheduler(),
            mailbox,
            ControllerSettings::default(),
        )
        .await
        .unwrap();
        let report = controller.run().await;

        assert!(matches!(
            line.wait().await.unwrap(),
            SignalOutcome::Rejected {
                error: DomainError::PreconditionFailed(_)
            }
        ));
        assert_eq!(close.wait().await.unwrap(), SignalOutcome::Redundant);
        assert_eq!(report.closed_by, None);
        assert!(report.bill.is_closed());

        let stats = exec.store().stats();
        assert_eq!(stats.close_calls, 1);
        assert_eq!(stats.line_items_inserted, 0);
    }

    #[tokio::test]
    async fn ledger_closed_underneath_rejects_item_and_stops_loop() {
        let exec = executor();
        let cmd = create_cmd();
        let bill_id = cmd.bill_id;
        let router = InMemoryEventRouter::new(4);
        let mailbox = router.register(bill_id).unwrap();

        let controller = LifecycleController::start(
            cmd,
            exec.clone(),
            scheduler(),
            mailbox,
            ControllerSettings::default(),
        )
        .await
        .unwrap();
        let task = tokio::spawn(controller.run());

        exec.store().close_bill(bill_id).await.unwrap();

        let line = router.route_line_item(add(bill_id, "R1")).await.unwrap();
        assert!(matches!(
            line.wait().await.unwrap(),
            SignalOutcome::Rejected {
                error: DomainError::PreconditionFailed(_)
            }
        ));

        let report = task.await.unwrap();
        assert!(report.bill.is_closed());
        assert_eq!(report.closed_by, None);

        let stats = exec.store().stats();
        assert_eq!(stats.line_items_inserted, 0);
        assert_eq!(stats.status_updates, 1);
        assert!(!router.is_registered(bill_id));
    }

    #[tokio::test]
    async fn resume_of_unknown_bill_fails() {
        let router = InMemoryEventRouter::new(4);
        let bill_id = BillId::new();
        let mailbox = router.register(bill_id).unwrap();

        let result = LifecycleController::resume(
            bill_id,
            executor(),
            scheduler(),
            mailbox,
            ControllerSettings::default(),
        )
        .await;
        assert!(matches!(result, Err(ResumeError::NotFound(id)) if id == bill_id));
    }

    #[tokio::test]
    async fn line_items_then_close_in_one_loop() {
        let exec = executor();
        let cmd = create_cmd();
        let bill_id = cmd.bill_id;
        let router = InMemoryEventRouter::new(8);
        let mailbox = router.register(bill_id).unwrap();

        let controller = LifecycleController::start(
            cmd,
            exec.clone(),
            scheduler(),
            mailbox,
            ControllerSettings::default(),
        )
        .await
        .unwrap();
        let task = tokio::spawn(controller.run());

        let first = router.route_line_item(add(bill_id, "R1")).await.unwrap();
        assert!(matches!(first.wait().await.unwrap(), SignalOutcome::Applied { total, .. } if total == dec!(3)));

        let close = router
            .route_close(SignalEnvelope::new(bill_id, CloseBill::new(bill_id)))
            .await
            .unwrap();
        assert!(matches!(
            close.wait().await.unwrap(),
            SignalOutcome::Closed { closed_by: CloseReason::Explicit, total } if total == dec!(3)
        ));

        let report = task.await.unwrap();
        assert_eq!(report.closed_by, Some(CloseReason::Explicit));
        assert_eq!(report.bill.total_amount, dec!(3));
        assert!(!router.is_registered(bill_id));
    }
}
