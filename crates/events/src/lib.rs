//! Signals delivered to bill lifecycle controllers, and the router that carries them.

pub mod envelope;
pub mod outcome;
pub mod router;
pub mod signal;

pub use envelope::SignalEnvelope;
pub use outcome::{CloseReason, SignalOutcome};
pub use router::{
    Delivery, EventRouter, InMemoryEventRouter, Inbound, Mailbox, PendingOutcome, RouterError,
};
pub use signal::{AddLineItem, BillSignal, CloseBill};
