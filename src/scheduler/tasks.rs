use super::budget::{BudgetAlert, alert_notification, evaluate_budgets};
use super::capabilities::{BudgetReader, Housekeeping, HostWakeup, Notifier, SyncTrigger};
use super::periodic::{PeriodicHandle, PeriodicOptions};
use super::runner::{ScheduleOptions, TaskScheduler};
use super::TaskPriority;
use crate::config::{SchedulerConfig, SyncConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::core::{Result, YearMonth};
use std::sync::Arc;
use tracing::{Level, event};

pub const BUDGET_REMINDERS: &str = "budget-reminders";
pub const DATA_SYNC: &str = "data-sync";
pub const CLEANUP: &str = "cleanup";

/// Collaborators of the background loops.
#[derive(Clone)]
pub struct BackgroundDeps {
    pub sync: Arc<dyn SyncTrigger>,
    pub budgets: Arc<dyn BudgetReader>,
    pub housekeeping: Arc<dyn Housekeeping>,
    pub notifier: Arc<dyn Notifier>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub host: Arc<dyn HostWakeup>,
}

/// Evaluates budgets of `month` and raises a notification per alert.
pub async fn check_budgets(
    reader: &dyn BudgetReader,
    notifier: &dyn Notifier,
    month: YearMonth,
) -> Result<Vec<BudgetAlert>> {
    let budgets = reader.current_budgets().await?;
    let alerts = evaluate_budgets(&budgets, month);
    if notifier.permitted() {
        for alert in &alerts {
            notifier.notify(&alert_notification(alert));
        }
    }
    Ok(alerts)
}

/// The budget reminder, data sync and cleanup loops.
pub struct BackgroundTasks {
    handles: Vec<PeriodicHandle>,
}

impl BackgroundTasks {
    pub fn start(
        scheduler: &TaskScheduler,
        config: &SchedulerConfig,
        sync_config: &SyncConfig,
        deps: BackgroundDeps,
    ) -> Self {
        let plan = [
            (BUDGET_REMINDERS, config.budget_reminder_interval()),
            (DATA_SYNC, config.data_sync_interval()),
            (CLEANUP, config.cleanup_interval()),
        ];
        for (name, interval) in plan {
            if !deps.host.register(name, interval) {
                event!(Level::DEBUG, task = name, "host wake-up unavailable; in-process only");
            }
        }

        let reminders = {
            let deps = deps.clone();
            let notifications = scheduler.clone();
            scheduler.schedule_periodic(
                move || {
                    let deps = deps.clone();
                    let scheduler = notifications.clone();
                    async move { remind(&scheduler, &deps).await }
                },
                config.budget_reminder_interval(),
                PeriodicOptions::named(BUDGET_REMINDERS),
            )
        };

        let data_sync = {
            let deps = deps.clone();
            let skip_on_slow = sync_config.skip_on_slow_connection;
            scheduler.schedule_periodic(
                move || {
                    let deps = deps.clone();
                    async move {
                        if !deps.connectivity.is_online() {
                            event!(Level::DEBUG, "offline; scheduled sync skipped");
                            return Ok(());
                        }
                        if skip_on_slow && deps.connectivity.is_slow_connection() {
                            event!(Level::DEBUG, "slow connection; scheduled sync skipped");
                            return Ok(());
                        }
                        deps.sync.scheduled_sync().await
                    }
                },
                config.data_sync_interval(),
                PeriodicOptions::named(DATA_SYNC),
            )
        };

        let cleanup = {
            let housekeeping = deps.housekeeping.clone();
            scheduler.schedule_periodic(
                move || {
                    let housekeeping = housekeeping.clone();
                    async move {
                        event!(Level::DEBUG, "running cleanup");
                        housekeeping.housekeeping().await
                    }
                },
                config.cleanup_interval(),
                PeriodicOptions::named(CLEANUP),
            )
        };

        event!(Level::INFO, tasks = 3, "background tasks started");
        Self {
            handles: vec![reminders, data_sync, cleanup],
        }
    }

    pub fn handles(&self) -> &[PeriodicHandle] {
        &self.handles
    }

    pub fn handle(&self, name: &str) -> Option<&PeriodicHandle> {
        self.handles.iter().find(|handle| handle.name() == name)
    }

    /// Cancels every loop and waits for them to exit.
    pub async fn shutdown(mut self) {
        let handles = std::mem::take(&mut self.handles);
        for handle in &handles {
            handle.cancel();
        }
        for handle in handles {
            handle.join().await;
        }
        event!(Level::INFO, "background tasks stopped");
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }
}

// Notifications are queued at user-visible priority and not awaited: the
// reminder itself may be occupying the priority worker.
async fn remind(scheduler: &TaskScheduler, deps: &BackgroundDeps) -> Result<()> {
    let budgets = deps.budgets.current_budgets().await?;
    let alerts = evaluate_budgets(&budgets, YearMonth::current());
    if alerts.is_empty() || !deps.notifier.permitted() {
        return Ok(());
    }
    for alert in alerts {
        let notifier = deps.notifier.clone();
        let notification = alert_notification(&alert);
        scheduler.schedule_once(
            move || async move {
                notifier.notify(&notification);
                Ok(())
            },
            ScheduleOptions::default().priority(TaskPriority::UserVisible),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::capabilities::{Notification, NoHostWakeup};
    use crate::core::{Budget, SyncError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Fakes {
        syncs: AtomicUsize,
        cleanups: AtomicUsize,
        budgets: Mutex<Vec<Budget>>,
        notes: Mutex<Vec<Notification>>,
        denied: bool,
    }

    #[async_trait]
    impl SyncTrigger for Fakes {
        async fn scheduled_sync(&self) -> Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl BudgetReader for Fakes {
        async fn current_budgets(&self) -> Result<Vec<Budget>> {
            Ok(self.budgets.lock().unwrap().clone())
        }
    }

    #[async_trait]
    impl Housekeeping for Fakes {
        async fn housekeeping(&self) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Scheduler("disk full".to_string()))
        }
    }

    impl Notifier for Fakes {
        fn permitted(&self) -> bool {
            !self.denied
        }

        fn notify(&self, notification: &Notification) {
            self.notes.lock().unwrap().push(notification.clone());
        }
    }

    fn deps(fakes: &Arc<Fakes>, monitor: &Arc<ConnectivityMonitor>) -> BackgroundDeps {
        BackgroundDeps {
            sync: fakes.clone(),
            budgets: fakes.clone(),
            housekeeping: fakes.clone(),
            notifier: fakes.clone(),
            connectivity: monitor.clone(),
            host: Arc::new(NoHostWakeup),
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            budget_reminder_interval_ms: 30_000,
            data_sync_interval_ms: 5_000,
            cleanup_interval_ms: 60_000,
            strategy: None,
        }
    }

    fn over_budget() -> Budget {
        let mut budget = Budget::new("Dining", 100.0, YearMonth::current());
        budget.spent = 120.0;
        budget
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_loop_skips_while_offline() {
        let fakes = Arc::new(Fakes::default());
        let monitor = ConnectivityMonitor::new(false);
        let scheduler = TaskScheduler::new();
        let tasks = BackgroundTasks::start(
            &scheduler,
            &fast_config(),
            &SyncConfig::default(),
            deps(&fakes, &monitor),
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fakes.syncs.load(Ordering::SeqCst), 0);
        assert_eq!(tasks.handle(DATA_SYNC).unwrap().iterations(), 2);

        monitor.set_online(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fakes.syncs.load(Ordering::SeqCst), 1);
        tasks.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reminders_notify_and_failing_cleanup_keeps_running() {
        let fakes = Arc::new(Fakes::default());
        fakes.budgets.lock().unwrap().push(over_budget());
        let monitor = ConnectivityMonitor::new(true);
        let scheduler = TaskScheduler::new();
        let tasks = BackgroundTasks::start(
            &scheduler,
            &fast_config(),
            &SyncConfig::default(),
            deps(&fakes, &monitor),
        );

        tokio::time::sleep(Duration::from_secs(125)).await;
        let notes = fakes.notes.lock().unwrap().clone();
        assert_eq!(notes.len(), 4);
        assert_eq!(notes[0].title, "Budget Exceeded: Dining");
        assert_eq!(fakes.cleanups.load(Ordering::SeqCst), 2);
        assert!(tasks.handle(CLEANUP).is_some_and(|h| !h.is_cancelled()));
        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_check_budgets_without_permission_is_silent() {
        let fakes = Arc::new(Fakes {
            denied: true,
            ..Fakes::default()
        });
        fakes.budgets.lock().unwrap().push(over_budget());

        let alerts = check_budgets(fakes.as_ref(), fakes.as_ref(), YearMonth::current())
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(fakes.notes.lock().unwrap().is_empty());
    }
}
