//! Expense and budget bookkeeping on top of the store and the sync coordinator.
//!
//! Every mutation is two separate writes: the entity, then its outbox entry.
//! A crash in between leaves the entity stored without a pending sync.
//!
//! Budget saves are serialized by a book-local lock so the one budget per
//! category and month check cannot race. Writes that bypass the book are not
//! covered.

use crate::core::{
    Budget, EntityType, Expense, IndexQuery, Result, StorageFault, SyncAction, SyncError,
    YearMonth,
};
use crate::scheduler::BudgetReader;
use crate::storage::DurableStore;
use crate::sync::SyncCoordinator;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Level, event};

const SPENT_EPSILON: f64 = 1e-9;

/// Sum of the amounts of `expenses` that fall in the budget's category and month.
pub fn compute_spent(budget: &Budget, expenses: &[Expense]) -> f64 {
    expenses
        .iter()
        .filter(|expense| budget.covers(expense))
        .map(|expense| expense.amount)
        .sum()
}

/// Copies of `budgets` with `spent` recomputed from `expenses`.
pub fn recompute_all(budgets: &[Budget], expenses: &[Expense]) -> Vec<Budget> {
    budgets
        .iter()
        .map(|budget| Budget {
            spent: compute_spent(budget, expenses),
            ..budget.clone()
        })
        .collect()
}

pub struct ExpenseBook {
    store: DurableStore,
    sync: Arc<SyncCoordinator>,
    budget_writes: Mutex<()>,
}

impl ExpenseBook {
    pub fn new(store: DurableStore, sync: Arc<SyncCoordinator>) -> Self {
        Self {
            store,
            sync,
            budget_writes: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn sync(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    /// Adds or updates an expense and queues the matching sync action.
    pub async fn save_expense(&self, mut expense: Expense) -> Result<Expense> {
        validate_amount("amount", expense.amount)?;
        let previous = self.store.get::<Expense>(&expense.id).await?;
        let action = match &previous {
            Some(prev) => {
                expense.created_at = prev.created_at;
                expense.updated_at = Utc::now();
                SyncAction::Update
            }
            None => SyncAction::Create,
        };

        self.store.put(&expense).await?;
        self.sync
            .queue_for_sync(EntityType::Expense, action, to_payload(&expense)?)
            .await?;

        let mut affected = vec![(expense.category.clone(), expense.month())];
        if let Some(prev) = previous {
            let month = prev.month();
            affected.push((prev.category, month));
        }
        self.refresh_affected(affected).await?;
        Ok(expense)
    }

    /// Returns false when no expense had that id; nothing is queued then.
    pub async fn delete_expense(&self, id: &str) -> Result<bool> {
        let Some(existing) = self.store.get::<Expense>(id).await? else {
            return Ok(false);
        };
        self.store.delete::<Expense>(id).await?;
        self.sync
            .queue_for_sync(EntityType::Expense, SyncAction::Delete, json!({ "id": id }))
            .await?;
        self.refresh_affected(vec![(existing.category.clone(), existing.month())])
            .await?;
        Ok(true)
    }

    /// Adds or updates a budget. One budget per category and month.
    pub async fn save_budget(&self, mut budget: Budget) -> Result<Budget> {
        validate_amount("monthly limit", budget.monthly_limit)?;
        let _serial = self.budget_writes.lock().await;
        if let Some(other) = self.budget_for(&budget.category, budget.month).await? {
            if other.id != budget.id {
                return Err(SyncError::Validation(format!(
                    "budget already exists for {} in {}",
                    budget.category, budget.month
                )));
            }
        }

        let previous = self.store.get::<Budget>(&budget.id).await?;
        let action = match &previous {
            Some(prev) => {
                budget.created_at = prev.created_at;
                budget.updated_at = Utc::now();
                SyncAction::Update
            }
            None => SyncAction::Create,
        };
        budget.spent = compute_spent(&budget, &self.expenses_by_category(&budget.category).await?);

        self.store.put(&budget).await?;
        self.sync
            .queue_for_sync(EntityType::Budget, action, to_payload(&budget)?)
            .await?;
        Ok(budget)
    }

    pub async fn delete_budget(&self, id: &str) -> Result<bool> {
        if !self.store.delete::<Budget>(id).await? {
            return Ok(false);
        }
        self.sync
            .queue_for_sync(EntityType::Budget, SyncAction::Delete, json!({ "id": id }))
            .await?;
        Ok(true)
    }

    pub async fn expenses(&self) -> Result<Vec<Expense>> {
        Ok(self.store.get_all().await?)
    }

    pub async fn budgets(&self) -> Result<Vec<Budget>> {
        Ok(self.store.get_all().await?)
    }

    pub async fn expenses_by_category(&self, category: &str) -> Result<Vec<Expense>> {
        Ok(self
            .store
            .get_by_index("category", &IndexQuery::eq(category))
            .await?)
    }

    /// Expenses dated within `[start, end]`, oldest first.
    pub async fn expenses_between(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Expense>> {
        Ok(self
            .store
            .get_by_index("date", &IndexQuery::between(start, end))
            .await?)
    }

    pub async fn budget_for(&self, category: &str, month: YearMonth) -> Result<Option<Budget>> {
        let in_category: Vec<Budget> = self
            .store
            .get_by_index("category", &IndexQuery::eq(category))
            .await?;
        Ok(in_category.into_iter().find(|budget| budget.month == month))
    }

    /// Recomputes `spent` for every budget; stale ones are persisted and
    /// queued as updates. Returns how many changed.
    pub async fn refresh_budget_spent(&self) -> Result<usize> {
        let budgets = self.budgets().await?;
        let expenses = self.expenses().await?;
        let mut changed = 0;
        for (stored, fresh) in budgets.iter().zip(recompute_all(&budgets, &expenses)) {
            if self.persist_if_stale(stored, fresh).await? {
                changed += 1;
            }
        }
        if changed > 0 {
            event!(Level::DEBUG, changed, "budget spent refreshed");
        }
        Ok(changed)
    }

    async fn refresh_affected(&self, keys: Vec<(String, YearMonth)>) -> Result<()> {
        let mut seen: Vec<(String, YearMonth)> = Vec::with_capacity(keys.len());
        for key in keys {
            if seen.contains(&key) {
                continue;
            }
            let (category, month) = &key;
            if let Some(budget) = self.budget_for(category, *month).await? {
                let expenses = self.expenses_by_category(category).await?;
                let fresh = Budget {
                    spent: compute_spent(&budget, &expenses),
                    ..budget.clone()
                };
                self.persist_if_stale(&budget, fresh).await?;
            }
            seen.push(key);
        }
        Ok(())
    }

    async fn persist_if_stale(&self, stored: &Budget, mut fresh: Budget) -> Result<bool> {
        if (stored.spent - fresh.spent).abs() <= SPENT_EPSILON {
            return Ok(false);
        }
        fresh.updated_at = Utc::now();
        self.store.put(&fresh).await?;
        self.sync
            .queue_for_sync(EntityType::Budget, SyncAction::Update, to_payload(&fresh)?)
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl BudgetReader for ExpenseBook {
    async fn current_budgets(&self) -> Result<Vec<Budget>> {
        let budgets = self.budgets().await?;
        let expenses = self.expenses().await?;
        Ok(recompute_all(&budgets, &expenses))
    }
}

fn validate_amount(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SyncError::Validation(format!(
            "{} must be a positive number, got {}",
            field, value
        )))
    }
}

fn to_payload<T: serde::Serialize>(record: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(record).map_err(StorageFault::from)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ConnectivityMonitor;
    use crate::core::{DispatchFault, OutboxEntry};
    use crate::dispatch::{Dispatcher, LoggingDispatcher};
    use crate::outbox::Outbox;
    use std::time::Duration;

    /// A remote that never answers.
    struct Unresponsive;

    #[async_trait]
    impl Dispatcher for Unresponsive {
        async fn dispatch(&self, _entry: &OutboxEntry) -> std::result::Result<(), DispatchFault> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn book(online: bool) -> ExpenseBook {
        let store = DurableStore::in_memory();
        let sync = SyncCoordinator::new(
            Outbox::new(store.clone()),
            Arc::new(LoggingDispatcher::default()),
            ConnectivityMonitor::new(online),
        );
        ExpenseBook::new(store, sync)
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn october() -> YearMonth {
        YearMonth::new(2026, 10).unwrap()
    }

    #[test]
    fn test_compute_spent_matches_category_and_month() {
        let budget = Budget::new("Groceries", 200.0, october());
        let expenses = vec![
            Expense::new(20.0, "Groceries", day(2026, 10, 1), ""),
            Expense::new(30.5, "Groceries", day(2026, 10, 31), ""),
            Expense::new(99.0, "Groceries", day(2026, 11, 1), ""),
            Expense::new(5.0, "Transport", day(2026, 10, 15), ""),
        ];
        assert_eq!(compute_spent(&budget, &expenses), 50.5);
        assert_eq!(recompute_all(&[budget], &expenses)[0].spent, 50.5);
    }

    async fn groceries_spent(book: &ExpenseBook) -> f64 {
        book.budget_for("Groceries", october())
            .await
            .unwrap()
            .unwrap()
            .spent
    }

    #[tokio::test]
    async fn test_spent_tracks_add_update_delete() {
        let book = book(false);
        let budget = book
            .save_budget(Budget::new("Groceries", 100.0, october()))
            .await
            .unwrap();
        assert_eq!(budget.spent, 0.0);

        let lunch = book
            .save_expense(Expense::new(40.0, "Groceries", day(2026, 10, 3), "lunch"))
            .await
            .unwrap();
        assert_eq!(groceries_spent(&book).await, 40.0);

        book.save_expense(Expense { amount: 55.0, ..lunch.clone() })
            .await
            .unwrap();
        assert_eq!(groceries_spent(&book).await, 55.0);

        // Moving the expense out of the month takes it out of the budget.
        book.save_expense(Expense {
            date: day(2026, 9, 30),
            amount: 55.0,
            ..lunch.clone()
        })
        .await
        .unwrap();
        assert_eq!(groceries_spent(&book).await, 0.0);

        book.save_expense(Expense { date: day(2026, 10, 9), ..lunch.clone() })
            .await
            .unwrap();
        assert!(book.delete_expense(&lunch.id).await.unwrap());
        assert_eq!(groceries_spent(&book).await, 0.0);
        assert!(!book.delete_expense(&lunch.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_mutations_queue_outbox_entries_in_order() {
        let book = book(false);
        let expense = book
            .save_expense(Expense::new(12.0, "Transport", day(2026, 10, 2), ""))
            .await
            .unwrap();
        book.save_expense(Expense { amount: 13.0, ..expense.clone() })
            .await
            .unwrap();
        book.delete_expense(&expense.id).await.unwrap();

        let queued = book.sync().outbox().peek().await.unwrap();
        let actions: Vec<_> = queued.iter().map(|e| (e.entity_type, e.action)).collect();
        assert_eq!(
            actions,
            vec![
                (EntityType::Expense, SyncAction::Create),
                (EntityType::Expense, SyncAction::Update),
                (EntityType::Expense, SyncAction::Delete),
            ]
        );
        assert_eq!(queued[2].payload, json!({ "id": expense.id }));
    }

    #[tokio::test]
    async fn test_duplicate_budget_for_month_is_rejected() {
        let book = book(false);
        book.save_budget(Budget::new("Dining", 100.0, october()))
            .await
            .unwrap();
        let err = book
            .save_budget(Budget::new("Dining", 150.0, october()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = book
            .save_budget(Budget::new("Travel", 0.0, october()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_refresh_repairs_stale_cache() {
        let book = book(false);
        let budget = book
            .save_budget(Budget::new("Health", 300.0, october()))
            .await
            .unwrap();
        // Write an expense behind the book's back so the cache goes stale.
        book.store()
            .put(&Expense::new(120.0, "Health", day(2026, 10, 20), ""))
            .await
            .unwrap();

        assert_eq!(book.current_budgets().await.unwrap()[0].spent, 120.0);
        assert_eq!(book.refresh_budget_spent().await.unwrap(), 1);
        assert_eq!(book.refresh_budget_spent().await.unwrap(), 0);
        let stored = book.store().get::<Budget>(&budget.id).await.unwrap().unwrap();
        assert_eq!(stored.spent, 120.0);
    }

    #[tokio::test]
    async fn test_date_range_query() {
        let book = book(false);
        for d in [1, 10, 20, 30] {
            book.save_expense(Expense::new(1.0, "Other", day(2026, 10, d), ""))
                .await
                .unwrap();
        }
        let hits = book
            .expenses_between(day(2026, 10, 10), day(2026, 10, 20))
            .await
            .unwrap();
        let days: Vec<_> = hits.iter().map(|e| e.date).collect();
        assert_eq!(days, vec![day(2026, 10, 10), day(2026, 10, 20)]);
    }

    #[tokio::test]
    async fn test_save_returns_while_remote_is_unresponsive() {
        let store = DurableStore::in_memory();
        let sync = SyncCoordinator::new(
            Outbox::new(store.clone()),
            Arc::new(Unresponsive),
            ConnectivityMonitor::new(true),
        );
        let book = ExpenseBook::new(store, sync);

        let saved = tokio::time::timeout(
            Duration::from_secs(2),
            book.save_expense(Expense::new(7.5, "Transport", day(2026, 10, 4), "bus")),
        )
        .await
        .expect("save_expense returns without waiting for the drain")
        .unwrap();

        assert_eq!(book.expenses().await.unwrap(), vec![saved]);
        assert_eq!(book.sync().outbox().len().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_budgets_for_same_month_admit_one() {
        let book = Arc::new(book(false));
        let mut handles = Vec::new();
        for limit in [100.0, 150.0, 200.0, 250.0] {
            let book = book.clone();
            handles.push(tokio::spawn(async move {
                book.save_budget(Budget::new("Dining", limit, october())).await
            }));
        }

        let (mut saved, mut rejected) = (0, 0);
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => saved += 1,
                Err(SyncError::Validation(_)) => rejected += 1,
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
        assert_eq!((saved, rejected), (1, 3));
        assert_eq!(book.budgets().await.unwrap().len(), 1);
    }
}
