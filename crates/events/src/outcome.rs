use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use billflow_billing::LineItem;
use billflow_core::DomainError;

/// Which path closed a bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Explicit,
    Deadline,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Explicit => "explicit",
            CloseReason::Deadline => "deadline",
        }
    }
}

impl core::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a controller processing one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SignalOutcome {
    /// Line item persisted and added to the total.
    Applied { line_item: LineItem, total: Decimal },
    /// The reference was already recorded; nothing changed.
    Duplicate { line_item: LineItem, total: Decimal },
    /// This signal closed the bill.
    Closed { closed_by: CloseReason, total: Decimal },
    /// Close requested on a bill that is already closed. Not an error.
    Redundant,
    /// Rejected before any durable effect (validation or precondition).
    Rejected { error: DomainError },
    /// The durable mutation could not be completed; the bill is unchanged.
    Failed { reason: String },
}

impl SignalOutcome {
    pub fn rejected(error: DomainError) -> Self {
        SignalOutcome::Rejected { error }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        SignalOutcome::Failed { reason: reason.into() }
    }

    /// Short label for the `outcome` log field.
    pub fn label(&self) -> &'static str {
        match self {
            SignalOutcome::Applied { .. } => "applied",
            SignalOutcome::Duplicate { .. } => "duplicate",
            SignalOutcome::Closed { .. } => "closed",
            SignalOutcome::Redundant => "redundant",
            SignalOutcome::Rejected { .. } => "rejected",
            SignalOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SignalOutcome::Rejected { .. } | SignalOutcome::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_is_not_a_failure() {
        assert!(!SignalOutcome::Redundant.is_failure());
        assert!(SignalOutcome::rejected(DomainError::precondition("closed")).is_failure());
        assert!(SignalOutcome::Failed { reason: "db down".into() }.is_failure());
        assert_eq!(SignalOutcome::Redundant.label(), "redundant");
    }
}
