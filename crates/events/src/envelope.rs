use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use billflow_core::BillId;

/// Envelope for a signal in transit to a bill controller.
///
/// Notes:
/// - `delivery_id` identifies one delivery attempt, not the signal itself. A redelivered
///   `AddLineItem` carries a fresh `delivery_id`; de-duplication keys on the line-item
///   reference instead.
/// - `received_at` is when the router accepted the signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope<S> {
    delivery_id: Uuid,
    bill_id: BillId,
    received_at: DateTime<Utc>,
    signal: S,
}

impl<S> SignalEnvelope<S> {
    pub fn new(bill_id: BillId, signal: S) -> Self {
        Self {
            delivery_id: Uuid::now_v7(),
            bill_id,
            received_at: Utc::now(),
            signal,
        }
    }

    pub fn delivery_id(&self) -> Uuid {
        self.delivery_id
    }

    pub fn bill_id(&self) -> BillId {
        self.bill_id
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn signal(&self) -> &S {
        &self.signal
    }

    pub fn into_signal(self) -> S {
        self.signal
    }

    /// Re-wrap the payload, keeping delivery metadata.
    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> SignalEnvelope<T> {
        SignalEnvelope {
            delivery_id: self.delivery_id,
            bill_id: self.bill_id,
            received_at: self.received_at,
            signal: f(self.signal),
        }
    }
}
