use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use billflow_billing::{Bill, BillStatus, LineItem};
use billflow_core::{AccountId, BillId};

use super::r#trait::{AppendOutcome, CloseOutcome, LedgerError, LedgerStore};

/// Store operations, used to target injected faults.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    CreateBill,
    GetBill,
    AppendLineItem,
    CloseBill,
    ListLineItems,
    ListBills,
}

/// Counts of durable writes actually applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub bills_created: u64,
    pub line_items_inserted: u64,
    pub total_updates: u64,
    /// Successful `Open -> Closed` transitions.
    pub status_updates: u64,
    pub duplicates_skipped: u64,
    /// Every `close_bill` call that reached the store, including no-ops.
    pub close_calls: u64,
}

#[derive(Debug, Clone)]
enum Fault {
    Fail(LedgerError),
    Stall(Duration),
}

#[derive(Debug, Default)]
struct State {
    bills: HashMap<BillId, Bill>,
    line_items: HashMap<BillId, Vec<LineItem>>,
    stats: WriteStats,
}

/// In-memory ledger.
///
/// Intended for tests/dev. Supports one-shot fault injection per operation so retry and
/// timeout paths can be exercised without a database.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<State>,
    faults: Mutex<HashMap<LedgerOp, VecDeque<Fault>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls to `op` fail with `error` before touching state.
    pub fn fail_next(&self, op: LedgerOp, times: u32, error: LedgerError) {
        self.push_faults(op, times, Fault::Fail(error));
    }

    /// Delay the next `times` calls to `op` by `delay` before they touch state.
    pub fn stall_next(&self, op: LedgerOp, times: u32, delay: Duration) {
        self.push_faults(op, times, Fault::Stall(delay));
    }

    pub fn stats(&self) -> WriteStats {
        self.state
            .read()
            .map(|s| s.stats.clone())
            .unwrap_or_default()
    }

    fn push_faults(&self, op: LedgerOp, times: u32, fault: Fault) {
        if let Ok(mut faults) = self.faults.lock() {
            let queue = faults.entry(op).or_default();
            for _ in 0..times {
                queue.push_back(fault.clone());
            }
        }
    }

    async fn inject(&self, op: LedgerOp) -> Result<(), LedgerError> {
        let fault = {
            let mut faults = self.faults.lock().map_err(|_| poisoned())?;
            faults.get_mut(&op).and_then(VecDeque::pop_front)
        };

        match fault {
            None => Ok(()),
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

fn poisoned() -> LedgerError {
    LedgerError::Unavailable("ledger state lock poisoned".to_string())
}

fn sorted(mut bills: Vec<Bill>) -> Vec<Bill> {
    bills.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    bills
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_bill(&self, bill: &Bill) -> Result<(), LedgerError> {
        self.inject(LedgerOp::CreateBill).await?;

        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.bills.contains_key(&bill.id) {
            return Err(LedgerError::AlreadyExists(bill.id));
        }
        state.bills.insert(bill.id, bill.clone());
        state.line_items.insert(bill.id, Vec::new());
        state.stats.bills_created += 1;
        Ok(())
    }

    async fn get_bill(&self, bill_id: BillId) -> Result<Option<Bill>, LedgerError> {
        self.inject(LedgerOp::GetBill).await?;

        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.bills.get(&bill_id).cloned())
    }

    async fn append_line_item(&self, line_item: &LineItem) -> Result<AppendOutcome, LedgerError> {
        self.inject(LedgerOp::AppendLineItem).await?;

        let mut state = self.state.write().map_err(|_| poisoned())?;
        let State {
            bills,
            line_items,
            stats,
        } = &mut *state;

        let bill = bills
            .get_mut(&line_item.bill_id)
            .ok_or(LedgerError::NotFound(line_item.bill_id))?;
        if bill.is_closed() {
            return Err(LedgerError::BillClosed(bill.id));
        }

        let items = line_items.entry(bill.id).or_default();
        if let Some(existing) = items.iter().find(|i| i.reference == line_item.reference) {
            stats.duplicates_skipped += 1;
            return Ok(AppendOutcome::Duplicate {
                existing: existing.clone(),
                total: bill.total_amount,
            });
        }

        // Item and total change under the same write lock.
        bill.apply_line_item(line_item)
            .map_err(|e| LedgerError::InvalidData(e.to_string()))?;
        items.push(line_item.clone());
        stats.line_items_inserted += 1;
        stats.total_updates += 1;

        Ok(AppendOutcome::Appended {
            line_item: line_item.clone(),
            total: bill.total_amount,
        })
    }

    async fn close_bill(&self, bill_id: BillId) -> Result<CloseOutcome, LedgerError> {
        self.inject(LedgerOp::CloseBill).await?;

        let mut state = self.state.write().map_err(|_| poisoned())?;
        state.stats.close_calls += 1;

        let bill = state
            .bills
            .get_mut(&bill_id)
            .ok_or(LedgerError::NotFound(bill_id))?;
        if bill.close().is_err() {
            return Ok(CloseOutcome::AlreadyClosed(bill.clone()));
        }
        let closed = bill.clone();
        state.stats.status_updates += 1;
        Ok(CloseOutcome::Closed(closed))
    }

    async fn list_line_items(&self, bill_id: BillId) -> Result<Vec<LineItem>, LedgerError> {
        self.inject(LedgerOp::ListLineItems).await?;

        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.line_items.get(&bill_id).cloned().unwrap_or_default())
    }

    async fn list_bills(
        &self,
        account_id: &AccountId,
        status: Option<BillStatus>,
    ) -> Result<Vec<Bill>, LedgerError> {
        self.inject(LedgerOp::ListBills).await?;

        let state = self.state.read().map_err(|_| poisoned())?;
        let bills = state
            .bills
            .values()
            .filter(|b| &b.account_id == account_id)
            .filter(|b| status.is_none_or(|s| b.status == s))
            .cloned()
            .collect();
        Ok(sorted(bills))
    }

    async fn list_open_bills(&self) -> Result<Vec<Bill>, LedgerError> {
        self.inject(LedgerOp::ListBills).await?;

        let state = self.state.read().map_err(|_| poisoned())?;
        let bills = state.bills.values().filter(|b| b.is_open()).cloned().collect();
        Ok(sorted(bills))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    use billflow_billing::{CreateBill, NewLineItem};
    use billflow_core::Currency;

    fn open_bill(account: &str) -> Bill {
        let start = Utc::now();
        let cmd = CreateBill::new(
            AccountId::new(account).unwrap(),
            Currency::new("USD").unwrap(),
            start,
            start + ChronoDuration::hours(1),
        );
        Bill::open(&cmd, start)
    }

    fn item(bill: &Bill, reference: &str, amount: rust_decimal::Decimal) -> LineItem {
        NewLineItem {
            reference: reference.to_string(),
            description: "storage".to_string(),
            amount,
            currency: Currency::new("USD").unwrap(),
            exchange_rate: dec!(1),
        }
        .into_line_item(bill.id, Utc::now())
    }

    #[tokio::test]
    async fn duplicate_bill_id_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let bill = open_bill("acct-1");
        store.create_bill(&bill).await.unwrap();
        assert_eq!(
            store.create_bill(&bill).await.unwrap_err(),
            LedgerError::AlreadyExists(bill.id)
        );
        assert_eq!(store.stats().bills_created, 1);
    }

    #[tokio::test]
    async fn append_is_keyed_on_reference() {
        let store = InMemoryLedgerStore::new();
        let bill = open_bill("acct-1");
        store.create_bill(&bill).await.unwrap();

        let first = store.append_line_item(&item(&bill, "R1", dec!(40))).await.unwrap();
        assert!(matches!(first, AppendOutcome::Appended { .. }));

        let again = store.append_line_item(&item(&bill, "R1", dec!(40))).await.unwrap();
        assert!(matches!(again, AppendOutcome::Duplicate { .. }));
        assert_eq!(again.total(), dec!(40));

        let stats = store.stats();
        assert_eq!(stats.line_items_inserted, 1);
        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(store.list_line_items(bill.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overflowing_total_is_refused_and_store_stays_usable() {
        let store = InMemoryLedgerStore::new();
        let bill = open_bill("acct-1");
        store.create_bill(&bill).await.unwrap();
        store
            .append_line_item(&item(&bill, "R1", rust_decimal::Decimal::MAX))
            .await
            .unwrap();

        let err = store.append_line_item(&item(&bill, "R2", dec!(1))).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidData(_)));
        assert_eq!(store.list_line_items(bill.id).await.unwrap().len(), 1);
        assert_eq!(store.stats().line_items_inserted, 1);

        let other = open_bill("acct-2");
        store.create_bill(&other).await.unwrap();
        assert_eq!(store.get_bill(other.id).await.unwrap(), Some(other));
    }

    #[tokio::test]
    async fn close_is_compare_and_set() {
        let store = InMemoryLedgerStore::new();
        let bill = open_bill("acct-1");
        store.create_bill(&bill).await.unwrap();

        assert!(matches!(store.close_bill(bill.id).await.unwrap(), CloseOutcome::Closed(_)));
        assert!(matches!(
            store.close_bill(bill.id).await.unwrap(),
            CloseOutcome::AlreadyClosed(_)
        ));

        let stats = store.stats();
        assert_eq!(stats.status_updates, 1);
        assert_eq!(stats.close_calls, 2);

        let err = store.append_line_item(&item(&bill, "R9", dec!(1))).await.unwrap_err();
        assert_eq!(err, LedgerError::BillClosed(bill.id));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let store = InMemoryLedgerStore::new();
        let bill = open_bill("acct-1");
        store.fail_next(LedgerOp::CreateBill, 2, LedgerError::Unavailable("down".into()));

        assert!(store.create_bill(&bill).await.unwrap_err().is_transient());
        assert!(store.create_bill(&bill).await.is_err());
        store.create_bill(&bill).await.unwrap();
        assert_eq!(store.stats().bills_created, 1);
    }

    #[tokio::test]
    async fn list_bills_filters_by_account_and_status() {
        let store = InMemoryLedgerStore::new();
        let a1 = open_bill("acct-a");
        let a2 = open_bill("acct-a");
        let b1 = open_bill("acct-b");
        for b in [&a1, &a2, &b1] {
            store.create_bill(b).await.unwrap();
        }
        store.close_bill(a2.id).await.unwrap();

        let acct_a = AccountId::new("acct-a").unwrap();
        assert_eq!(store.list_bills(&acct_a, None).await.unwrap().len(), 2);

        let open = store.list_bills(&acct_a, Some(BillStatus::Open)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, a1.id);

        let all_open = store.list_open_bills().await.unwrap();
        assert_eq!(all_open.len(), 2);
    }
}
