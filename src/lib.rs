// ============================================================================
// budgetsync library
// ============================================================================

pub mod config;
pub mod connectivity;
pub mod core;
pub mod dispatch;
pub mod ledger;
pub mod outbox;
pub mod scheduler;
pub mod storage;
pub mod sync;

pub use config::{AppConfig, SchedulerConfig, StoreConfig, SyncConfig};
pub use connectivity::{
    ConnectionEvent, ConnectionQuality, ConnectionState, ConnectivityMonitor, ConnectivityProbe,
    EffectiveType, Subscription, TcpProbe, spawn_probe_loop,
};
pub use core::{
    Budget, DispatchFault, EntityType, Expense, OutboxEntry, Result, StorageFault, SyncAction,
    SyncError, YearMonth,
};
pub use dispatch::{Dispatcher, HttpDispatcher, LoggingDispatcher, dispatcher_from_config};
pub use ledger::{ExpenseBook, compute_spent, recompute_all};
pub use outbox::{DrainReport, Outbox};
pub use scheduler::{
    BackgroundDeps, BackgroundTasks, HostWakeup, Notifier, TaskPriority, TaskScheduler,
};
pub use storage::{DurabilityMode, DurableStore};
pub use sync::{SyncCoordinator, SyncOutcome, SyncPhase, TriggerReason};

use std::sync::Arc;

// ============================================================================
// Application wiring
// ============================================================================

/// Every service of the offline-first core, constructed once and shared.
///
/// # Examples
///
/// ```no_run
/// use budgetsync::{AppConfig, BudgetSync, Expense};
///
/// # async fn run() -> budgetsync::Result<()> {
/// let app = BudgetSync::open(AppConfig::default(), true).await?;
/// let today = chrono::Utc::now().date_naive();
/// app.book().save_expense(Expense::new(12.5, "Transport", today, "bus")).await?;
/// app.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct BudgetSync {
    config: AppConfig,
    store: DurableStore,
    connectivity: Arc<ConnectivityMonitor>,
    coordinator: Arc<SyncCoordinator>,
    book: Arc<ExpenseBook>,
    scheduler: TaskScheduler,
    _reconnect: Subscription,
}

impl BudgetSync {
    /// Opens the store and wires the coordinator to reconnect events.
    /// Must run inside a tokio runtime.
    pub async fn open(config: AppConfig, initially_online: bool) -> Result<Self> {
        config.validate()?;
        let store = DurableStore::open(&config.store).await?;
        let dispatcher = dispatcher_from_config(&config.sync)?;
        let connectivity = ConnectivityMonitor::new(initially_online);
        let coordinator = SyncCoordinator::new(
            Outbox::new(store.clone()),
            dispatcher,
            connectivity.clone(),
        );
        let reconnect = coordinator.attach_reconnect(&connectivity)?;
        let book = Arc::new(ExpenseBook::new(store.clone(), coordinator.clone()));
        let scheduler = TaskScheduler::from_config(&config.scheduler);

        Ok(Self {
            config,
            store,
            connectivity,
            coordinator,
            book,
            scheduler,
            _reconnect: reconnect,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn book(&self) -> &Arc<ExpenseBook> {
        &self.book
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Starts the budget reminder, data sync and cleanup loops.
    pub fn start_background(
        &self,
        notifier: Arc<dyn Notifier>,
        host: Arc<dyn HostWakeup>,
    ) -> BackgroundTasks {
        BackgroundTasks::start(
            &self.scheduler,
            &self.config.scheduler,
            &self.config.sync,
            BackgroundDeps {
                sync: self.coordinator.clone(),
                budgets: self.book.clone(),
                housekeeping: Arc::new(self.store.clone()),
                notifier,
                connectivity: self.connectivity.clone(),
                host,
            },
        )
    }

    /// Waits for in-flight background drains, then checkpoints and closes the store.
    pub async fn close(&self) -> Result<()> {
        self.scheduler.shutdown();
        self.coordinator.settle().await;
        self.store.close().await?;
        Ok(())
    }
}
