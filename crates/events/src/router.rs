//! Per-bill signal routing.
//!
//! The router owns one [`Mailbox`] per running controller. Each mailbox has a separate
//! bounded channel per signal kind (line items, close requests); the deadline is armed by
//! the controller itself and never travels through the router.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: callers may re-route a signal after a crash or a lost reply, so the
//!   controller must treat redelivery as normal (line items de-duplicate on `reference`,
//!   close is idempotent).
//! - **No cross-kind ordering**: a close may overtake an earlier line item. Order between
//!   kinds is decided by the controller's serialized loop only.
//! - **Backpressure**: channels are bounded; `route_*` waits for capacity.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use billflow_core::BillId;

use crate::envelope::SignalEnvelope;
use crate::outcome::SignalOutcome;
use crate::signal::{AddLineItem, BillSignal, CloseBill};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("no controller registered for bill {0}")]
    UnknownBill(BillId),

    #[error("a controller is already registered for bill {0}")]
    AlreadyRegistered(BillId),

    /// The controller stopped accepting signals (bill closed or runtime shutting down).
    #[error("mailbox for bill {0} is closed")]
    MailboxClosed(BillId),

    /// The controller dropped the signal without answering.
    #[error("controller for bill {0} exited without replying")]
    NoReply(BillId),

    #[error("router state lock poisoned")]
    Poisoned,
}

/// A signal plus the channel its outcome is reported on.
#[derive(Debug)]
pub struct Delivery<S> {
    envelope: SignalEnvelope<S>,
    reply: oneshot::Sender<SignalOutcome>,
}

impl<S> Delivery<S> {
    /// A delivery whose outcome the sender waits for.
    pub fn new(envelope: SignalEnvelope<S>) -> (Self, PendingOutcome) {
        let bill_id = envelope.bill_id();
        let (tx, rx) = oneshot::channel();
        let delivery = Self {
            envelope,
            reply: tx,
        };
        (delivery, PendingOutcome { bill_id, rx })
    }

    pub fn signal(&self) -> &S {
        self.envelope.signal()
    }

    /// Report the outcome. A sender that stopped waiting is not an error.
    pub fn respond(self, outcome: SignalOutcome) {
        let _ = self.reply.send(outcome);
    }
}

/// Outcome of a routed signal, resolved once the controller has processed it.
#[derive(Debug)]
pub struct PendingOutcome {
    bill_id: BillId,
    rx: oneshot::Receiver<SignalOutcome>,
}

impl PendingOutcome {
    pub fn bill_id(&self) -> BillId {
        self.bill_id
    }

    pub async fn wait(self) -> Result<SignalOutcome, RouterError> {
        self.rx.await.map_err(|_| RouterError::NoReply(self.bill_id))
    }
}

/// One item taken from a mailbox.
#[derive(Debug)]
pub enum Inbound {
    LineItem(Delivery<AddLineItem>),
    Close(Delivery<CloseBill>),
}

/// Receiving side of a bill's channels, owned by its controller.
#[derive(Debug)]
pub struct Mailbox {
    bill_id: BillId,
    line_items: mpsc::Receiver<Delivery<AddLineItem>>,
    closes: mpsc::Receiver<Delivery<CloseBill>>,
}

impl Mailbox {
    pub fn new(
        bill_id: BillId,
        line_items: mpsc::Receiver<Delivery<AddLineItem>>,
        closes: mpsc::Receiver<Delivery<CloseBill>>,
    ) -> Self {
        Self {
            bill_id,
            line_items,
            closes,
        }
    }

    pub fn bill_id(&self) -> BillId {
        self.bill_id
    }

    /// Next signal of either kind, or `None` once every sender is gone and the
    /// buffers are empty. Cancel-safe.
    pub async fn next(&mut self) -> Option<Inbound> {
        tokio::select! {
            Some(d) = self.closes.recv() => Some(Inbound::Close(d)),
            Some(d) = self.line_items.recv() => Some(Inbound::LineItem(d)),
            else => None,
        }
    }

    /// Stop accepting new signals. Already-buffered signals can still be drained
    /// with [`Mailbox::next`].
    pub fn seal(&mut self) {
        self.line_items.close();
        self.closes.close();
    }
}

#[derive(Debug, Clone)]
struct Route {
    line_items: mpsc::Sender<Delivery<AddLineItem>>,
    closes: mpsc::Sender<Delivery<CloseBill>>,
}

impl Route {
    fn is_closed(&self) -> bool {
        self.line_items.is_closed() && self.closes.is_closed()
    }
}

/// Routes signals to running bill controllers.
#[async_trait]
pub trait EventRouter: Send + Sync {
    /// Open a mailbox for `bill_id`. Fails if a live controller already holds one.
    fn register(&self, bill_id: BillId) -> Result<Mailbox, RouterError>;

    /// Drop the routing entry. Buffered signals stay readable by the mailbox owner.
    fn unregister(&self, bill_id: BillId);

    fn is_registered(&self, bill_id: BillId) -> bool;

    /// Drop every routing entry; returns how many were removed.
    fn close_all(&self) -> usize;

    async fn route_line_item(
        &self,
        envelope: SignalEnvelope<AddLineItem>,
    ) -> Result<PendingOutcome, RouterError>;

    async fn route_close(
        &self,
        envelope: SignalEnvelope<CloseBill>,
    ) -> Result<PendingOutcome, RouterError>;

    async fn route(
        &self,
        envelope: SignalEnvelope<BillSignal>,
    ) -> Result<PendingOutcome, RouterError> {
        let signal = envelope.signal().clone();
        match signal {
            BillSignal::AddLineItem(s) => self.route_line_item(envelope.map(|_| s)).await,
            BillSignal::CloseBill(s) => self.route_close(envelope.map(|_| s)).await,
        }
    }
}

#[async_trait]
impl<R> EventRouter for Arc<R>
where
    R: EventRouter + ?Sized,
{
    fn register(&self, bill_id: BillId) -> Result<Mailbox, RouterError> {
        (**self).register(bill_id)
    }

    fn unregister(&self, bill_id: BillId) {
        (**self).unregister(bill_id)
    }

    fn is_registered(&self, bill_id: BillId) -> bool {
        (**self).is_registered(bill_id)
    }

    fn close_all(&self) -> usize {
        (**self).close_all()
    }

    async fn route_line_item(
        &self,
        envelope: SignalEnvelope<AddLineItem>,
    ) -> Result<PendingOutcome, RouterError> {
        (**self).route_line_item(envelope).await
    }

    async fn route_close(
        &self,
        envelope: SignalEnvelope<CloseBill>,
    ) -> Result<PendingOutcome, RouterError> {
        (**self).route_close(envelope).await
    }
}

/// In-process router backed by bounded tokio channels.
#[derive(Debug)]
pub struct InMemoryEventRouter {
    capacity: usize,
    routes: RwLock<HashMap<BillId, Route>>,
}

impl InMemoryEventRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            routes: RwLock::new(HashMap::new()),
        }
    }

    fn route_for(&self, bill_id: BillId) -> Result<Route, RouterError> {
        let routes = self.routes.read().map_err(|_| RouterError::Poisoned)?;
        routes.get(&bill_id).cloned().ok_or(RouterError::UnknownBill(bill_id))
    }
}

impl Default for InMemoryEventRouter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventRouter for InMemoryEventRouter {
    fn register(&self, bill_id: BillId) -> Result<Mailbox, RouterError> {
        let mut routes = self.routes.write().map_err(|_| RouterError::Poisoned)?;
        if let Some(existing) = routes.get(&bill_id) {
            if !existing.is_closed() {
                return Err(RouterError::AlreadyRegistered(bill_id));
            }
        }

        let (line_tx, line_rx) = mpsc::channel(self.capacity);
        let (close_tx, close_rx) = mpsc::channel(self.capacity);
        routes.insert(
            bill_id,
            Route {
                line_items: line_tx,
                closes: close_tx,
            },
        );
        debug!(bill_id = %bill_id, "mailbox registered");

        Ok(Mailbox::new(bill_id, line_rx, close_rx))
    }

    fn unregister(&self, bill_id: BillId) {
        if let Ok(mut routes) = self.routes.write() {
            if routes.remove(&bill_id).is_some() {
                debug!(bill_id = %bill_id, "mailbox unregistered");
            }
        }
    }

    fn is_registered(&self, bill_id: BillId) -> bool {
        self.routes
            .read()
            .map(|routes| routes.get(&bill_id).is_some_and(|r| !r.is_closed()))
            .unwrap_or(false)
    }

    fn close_all(&self) -> usize {
        match self.routes.write() {
            Ok(mut routes) => {
                let n = routes.len();
                routes.clear();
                n
            }
            Err(_) => 0,
        }
    }

    async fn route_line_item(
        &self,
        envelope: SignalEnvelope<AddLineItem>,
    ) -> Result<PendingOutcome, RouterError> {
        let bill_id = envelope.bill_id();
        let route = self.route_for(bill_id)?;
        let (delivery, pending) = Delivery::new(envelope);
        route
            .line_items
            .send(delivery)
            .await
            .map_err(|_| RouterError::MailboxClosed(bill_id))?;
        Ok(pending)
    }

    async fn route_close(
        &self,
        envelope: SignalEnvelope<CloseBill>,
    ) -> Result<PendingOutcome, RouterError> {
        let bill_id = envelope.bill_id();
        let route = self.route_for(bill_id)?;
        let (delivery, pending) = Delivery::new(envelope);
        route
            .closes
            .send(delivery)
            .await
            .map_err(|_| RouterError::MailboxClosed(bill_id))?;
        Ok(pending)
    }
}
