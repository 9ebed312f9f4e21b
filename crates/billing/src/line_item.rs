use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use billflow_core::{BillId, Currency, DomainError, DomainResult, LineItemId};

/// A charge requested for a bill, not yet persisted.
///
/// `reference` is the caller's correlation token and doubles as the
/// de-duplication key within a bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLineItem {
    pub reference: String,
    pub description: String,
    pub amount: Decimal,
    pub currency: Currency,
    /// Multiplier converting `amount` into the bill currency.
    pub exchange_rate: Decimal,
}

impl NewLineItem {
    pub fn validate(&self) -> DomainResult<()> {
        if self.amount < Decimal::ZERO {
            return Err(DomainError::invalid_argument("amount is negative"));
        }
        if self.exchange_rate <= Decimal::ZERO {
            return Err(DomainError::invalid_argument("exchange_rate must be positive"));
        }
        if self.reference.trim().is_empty() {
            return Err(DomainError::invalid_argument("reference must not be empty"));
        }
        self.normalized_amount()?;
        Ok(())
    }

    pub fn normalized_amount(&self) -> DomainResult<Decimal> {
        normalize(self.amount, self.exchange_rate)
    }

    pub fn into_line_item(self, bill_id: BillId, created_at: DateTime<Utc>) -> LineItem {
        LineItem {
            id: LineItemId::new(),
            bill_id,
            reference: self.reference,
            description: self.description,
            amount: self.amount,
            currency: self.currency,
            exchange_rate: self.exchange_rate,
            created_at,
        }
    }
}

/// Persisted, immutable line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub bill_id: BillId,
    pub reference: String,
    pub description: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub exchange_rate: Decimal,
    pub created_at: DateTime<Utc>,
}

impl LineItem {
    /// Amount expressed in the owning bill's currency.
    pub fn normalized_amount(&self) -> DomainResult<Decimal> {
        normalize(self.amount, self.exchange_rate)
    }
}

fn normalize(amount: Decimal, exchange_rate: Decimal) -> DomainResult<Decimal> {
    amount
        .checked_mul(exchange_rate)
        .ok_or_else(|| DomainError::invalid_argument("line item amount overflow"))
}

/// Summation-on-read total, used to audit the stored running total.
pub fn sum_line_items(items: &[LineItem]) -> DomainResult<Decimal> {
    items.iter().try_fold(Decimal::ZERO, |total, item| {
        total
            .checked_add(item.normalized_amount()?)
            .ok_or_else(|| DomainError::invalid_argument("line item total overflow"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use crate::bill::{Bill, CreateBill};
    use billflow_core::AccountId;

    fn new_item(reference: &str, amount: Decimal, rate: Decimal) -> NewLineItem {
        NewLineItem {
            reference: reference.to_string(),
            description: "compute hours".to_string(),
            amount,
            currency: Currency::new("EUR").unwrap(),
            exchange_rate: rate,
        }
    }

    #[test]
    fn negative_amount_is_invalid_argument() {
        let err = new_item("R1", dec!(-0.01), dec!(1)).validate().unwrap_err();
        assert_eq!(err, DomainError::invalid_argument("amount is negative"));
    }

    #[test]
    fn zero_amount_is_accepted() {
        assert!(new_item("R1", dec!(0), dec!(1)).validate().is_ok());
    }

    #[test]
    fn non_positive_exchange_rate_is_rejected() {
        assert!(new_item("R1", dec!(1), dec!(0)).validate().is_err());
        assert!(new_item("R1", dec!(1), dec!(-1.5)).validate().is_err());
    }

    #[test]
    fn blank_reference_is_rejected() {
        assert!(new_item("  ", dec!(1), dec!(1)).validate().is_err());
    }

    #[test]
    fn normalized_amount_applies_exchange_rate() {
        let item = new_item("R1", dec!(100.00), dec!(1.25));
        assert_eq!(item.normalized_amount().unwrap(), dec!(125.0000));
    }

    #[test]
    fn overflowing_normalization_is_invalid_argument() {
        let err = new_item("R1", Decimal::MAX, dec!(2)).validate().unwrap_err();
        assert_eq!(err, DomainError::invalid_argument("line item amount overflow"));
        assert!(new_item("R1", Decimal::MAX, dec!(1)).validate().is_ok());
    }

    #[test]
    fn sum_reports_overflow_instead_of_panicking() {
        let bill_id = BillId::new();
        let items = vec![
            new_item("R1", Decimal::MAX, dec!(1)).into_line_item(bill_id, Utc::now()),
            new_item("R2", dec!(1), dec!(1)).into_line_item(bill_id, Utc::now()),
        ];
        assert!(matches!(sum_line_items(&items), Err(DomainError::InvalidArgument(_))));
    }

    #[test]
    fn serde_keeps_decimal_precision() {
        let item = new_item("R1", dec!(0.1), dec!(3)).into_line_item(BillId::new(), Utc::now());
        let json = serde_json::to_string(&item).unwrap();
        let back: LineItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount, dec!(0.1));
        assert_eq!(back.normalized_amount().unwrap(), dec!(0.3));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn running_total_equals_sum_of_accepted_items(
            entries in prop::collection::vec((0i64..1_000_000, 1u32..500), 0..40)
        ) {
            let start = Utc::now();
            let cmd = CreateBill {
                bill_id: BillId::new(),
                account_id: AccountId::new("acct-prop").unwrap(),
                currency: Currency::new("USD").unwrap(),
                period_start: start,
                period_end: start + chrono::Duration::hours(1),
            };
            let mut bill = Bill::open(&cmd, start);
            let mut items = Vec::new();

            for (i, (cents, rate_hundredths)) in entries.iter().enumerate() {
                let item = new_item(
                    &format!("R{i}"),
                    Decimal::new(*cents, 2),
                    Decimal::new(i64::from(*rate_hundredths), 2),
                )
                .into_line_item(bill.id, start);
                bill.apply_line_item(&item).unwrap();
                items.push(item);
            }

            prop_assert_eq!(bill.total_amount, sum_line_items(&items).unwrap());
            prop_assert!(bill.total_amount >= Decimal::ZERO);
        }
    }
}
