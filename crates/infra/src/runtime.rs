//! Collaborator-facing facade: creates bills, routes signals, answers queries and
//! supervises one controller task per open bill.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use billflow_billing::{Bill, BillDetails, BillStatus, CreateBill, NewLineItem};
use billflow_core::{AccountId, BillId, Clock, DomainError};
use billflow_events::{
    AddLineItem, CloseBill, EventRouter, RouterError, SignalEnvelope, SignalOutcome,
};

use crate::activity::ActivityExecutor;
use crate::config::BillingConfig;
use crate::ledger_store::{LedgerError, LedgerStore};
use crate::lifecycle::{
    ControllerReport, ControllerSettings, CreationError, DeadlineScheduler, LifecycleController,
    ResumeError,
};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("bill {0} not found")]
    UnknownBill(BillId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Creation(#[from] CreationError),

    #[error(transparent)]
    Resume(#[from] ResumeError),

    /// The bill is open but no controller is running for it.
    #[error("no running controller for open bill {0}")]
    ControllerGone(BillId),

    /// The controller could not persist the change; the bill is unchanged.
    #[error("signal for bill {bill_id} failed: {reason}")]
    Failed { bill_id: BillId, reason: String },
}

pub struct BillingRuntime<S> {
    store: S,
    executor: Arc<ActivityExecutor<S>>,
    router: Arc<dyn EventRouter>,
    scheduler: DeadlineScheduler,
    settings: ControllerSettings,
    tasks: Mutex<JoinSet<ControllerReport>>,
}

impl<S> BillingRuntime<S>
where
    S: LedgerStore + Clone + 'static,
{
    pub fn new(
        store: S,
        router: Arc<dyn EventRouter>,
        clock: Arc<dyn Clock>,
        config: &BillingConfig,
    ) -> Self {
        let executor = Arc::new(ActivityExecutor::new(
            store.clone(),
            config.activity_config(),
            clock.clone(),
        ));
        Self {
            store,
            executor,
            router,
            scheduler: DeadlineScheduler::new(clock),
            settings: config.controller_settings(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn executor(&self) -> &ActivityExecutor<S> {
        &self.executor
    }

    pub fn is_running(&self, bill_id: BillId) -> bool {
        self.router.is_registered(bill_id)
    }

    /// Open a bill and start its controller. Returns once the bill is durably stored.
    pub async fn create_bill(&self, cmd: CreateBill) -> Result<Bill, RuntimeError> {
        cmd.validate()
            .map_err(|e| RuntimeError::Creation(CreationError::Invalid(e)))?;

        let bill_id = cmd.bill_id;
        let mailbox = self.router.register(bill_id).map_err(|e| match e {
            RouterError::AlreadyRegistered(id) => RuntimeError::Creation(CreationError::Duplicate(id)),
            other => RuntimeError::Router(other),
        })?;

        let controller = match LifecycleController::start(
            cmd,
            self.executor.clone(),
            self.scheduler.clone(),
            mailbox,
            self.settings.clone(),
        )
        .await
        {
            Ok(controller) => controller,
            Err(err) => {
                self.router.unregister(bill_id);
                warn!(bill_id = %bill_id, error = %err, "bill creation failed");
                return Err(err.into());
            }
        };

        let bill = controller.bill().clone();
        self.spawn(controller).await;
        Ok(bill)
    }

    /// Route a line item to the bill's controller and wait for the outcome.
    ///
    /// Invalid items, unknown bills and bills already closed in the ledger are rejected
    /// here, without routing.
    pub async fn add_line_item(
        &self,
        bill_id: BillId,
        line_item: NewLineItem,
    ) -> Result<SignalOutcome, RuntimeError> {
        line_item.validate()?;
        self.require_bill(bill_id).await?.ensure_open()?;

        let envelope = SignalEnvelope::new(bill_id, AddLineItem::new(bill_id, line_item));
        let outcome = match self.router.route_line_item(envelope).await {
            Ok(pending) => pending.wait().await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(SignalOutcome::Rejected { error }) => Err(error.into()),
            Ok(SignalOutcome::Failed { reason }) => Err(RuntimeError::Failed { bill_id, reason }),
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                // The bill may have closed while the signal was in flight.
                self.require_bill(bill_id).await?.ensure_open()?;
                Err(self.not_running(bill_id, err))
            }
        }
    }

    /// Request a close and wait until the controller has applied it. Closing an already
    /// closed bill returns its details unchanged.
    pub async fn close_bill(&self, bill_id: BillId) -> Result<BillDetails, RuntimeError> {
        let envelope = SignalEnvelope::new(bill_id, CloseBill::new(bill_id));
        let outcome = match self.router.route_close(envelope).await {
            Ok(pending) => pending.wait().await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(SignalOutcome::Closed { .. }) | Ok(SignalOutcome::Redundant) => self.get_bill(bill_id).await,
            Ok(SignalOutcome::Rejected { error }) => Err(error.into()),
            Ok(SignalOutcome::Failed { reason }) => Err(RuntimeError::Failed { bill_id, reason }),
            Ok(other) => Err(RuntimeError::Failed {
                bill_id,
                reason: format!("unexpected outcome '{}' for close", other.label()),
            }),
            Err(err) => {
                let details = self.get_bill(bill_id).await?;
                if details.bill.is_closed() {
                    Ok(details)
                } else {
                    Err(self.not_running(bill_id, err))
                }
            }
        }
    }

    pub async fn get_bill(&self, bill_id: BillId) -> Result<BillDetails, RuntimeError> {
        let bill = self.require_bill(bill_id).await?;
        let line_items = self.store.list_line_items(bill_id).await?;
        Ok(BillDetails::new(bill, line_items))
    }

    pub async fn list_bills(
        &self,
        account_id: &AccountId,
        status: Option<BillStatus>,
    ) -> Result<Vec<Bill>, RuntimeError> {
        Ok(self.store.list_bills(account_id, status).await?)
    }

    /// Resume a controller for every open bill that has none. Returns how many were
    /// started.
    pub async fn recover(&self) -> Result<usize, RuntimeError> {
        let open = self.store.list_open_bills().await?;
        let mut resumed = 0;

        for bill in open {
            if self.router.is_registered(bill.id) {
                continue;
            }
            let mailbox = match self.router.register(bill.id) {
                Ok(mailbox) => mailbox,
                Err(RouterError::AlreadyRegistered(_)) => continue,
                Err(err) => return Err(err.into()),
            };

            match LifecycleController::resume(
                bill.id,
                self.executor.clone(),
                self.scheduler.clone(),
                mailbox,
                self.settings.clone(),
            )
            .await
            {
                Ok(controller) => {
                    self.spawn(controller).await;
                    resumed += 1;
                }
                Err(err) => {
                    self.router.unregister(bill.id);
                    error!(bill_id = %bill.id, error = %err, "failed to resume bill controller");
                }
            }
        }

        info!(resumed, "recovery sweep finished");
        Ok(resumed)
    }

    /// Stop every controller. Open bills stay open for the next `recover`.
    pub async fn shutdown(&self) -> Vec<ControllerReport> {
        let closed = self.router.close_all();
        info!(mailboxes = closed, "shutting down bill controllers");

        let mut tasks = self.tasks.lock().await;
        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!(error = %err, "bill controller task failed"),
            }
        }
        reports
    }

    async fn spawn(&self, controller: LifecycleController<S>) {
        let bill_id = controller.bill().id;
        let router = self.router.clone();

        let mut tasks = self.tasks.lock().await;
        // Reap finished controllers so the set does not grow without bound.
        while let Some(joined) = tasks.try_join_next() {
            if let Err(err) = joined {
                error!(error = %err, "bill controller task failed");
            }
        }
        tasks.spawn(async move {
            let report = controller.run().await;
            if report.bill.is_closed() {
                router.unregister(bill_id);
            }
            report
        });
    }

    async fn require_bill(&self, bill_id: BillId) -> Result<Bill, RuntimeError> {
        self.store
            .get_bill(bill_id)
            .await?
            .ok_or(RuntimeError::UnknownBill(bill_id))
    }

    fn not_running(&self, bill_id: BillId, err: RouterError) -> RuntimeError {
        warn!(bill_id = %bill_id, error = %err, "open bill has no running controller");
        RuntimeError::ControllerGone(bill_id)
    }
}
