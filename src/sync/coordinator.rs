use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::core::{EntityType, OutboxEntry, Result, SyncAction, SyncError};
use crate::dispatch::Dispatcher;
use crate::outbox::{DrainReport, Outbox};
use crate::scheduler::SyncTrigger;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::task::TaskTracker;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Reconnect,
    SchedulerTick,
    Enqueue,
    Manual,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerReason::Reconnect => "reconnect",
            TriggerReason::SchedulerTick => "scheduler_tick",
            TriggerReason::Enqueue => "enqueue",
            TriggerReason::Manual => "manual",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Draining,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Drained(DrainReport),
    Failed(SyncError),
    SkippedOffline,
    SkippedBusy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    pub drains_succeeded: u64,
    pub drains_failed: u64,
    pub triggers_skipped: u64,
    pub last_outcome: Option<SyncOutcome>,
    pub last_drain_at: Option<DateTime<Utc>>,
}

/// Single-flight driver of outbox drains.
///
/// A drain starts only when the monitor reports online and no other drain is
/// running. There is no internal retry: a failed drain waits for the next
/// trigger.
pub struct SyncCoordinator {
    outbox: Outbox,
    dispatcher: Arc<dyn Dispatcher>,
    connectivity: Arc<ConnectivityMonitor>,
    draining: AtomicBool,
    stats: Mutex<SyncStats>,
    background: TaskTracker,
}

/// Clears the draining flag even if the drain future is dropped or panics.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    pub fn new(
        outbox: Outbox,
        dispatcher: Arc<dyn Dispatcher>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            dispatcher,
            connectivity,
            draining: AtomicBool::new(false),
            stats: Mutex::new(SyncStats::default()),
            background: TaskTracker::new(),
        })
    }

    /// Waits for drains started by enqueue or reconnect to finish.
    pub async fn settle(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn phase(&self) -> SyncPhase {
        if self.draining.load(Ordering::Acquire) {
            SyncPhase::Draining
        } else {
            SyncPhase::Idle
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Runs one drain cycle if online and idle.
    pub async fn trigger(&self, reason: TriggerReason) -> SyncOutcome {
        if !self.connectivity.is_online() {
            event!(Level::DEBUG, %reason, "offline; drain skipped");
            return self.record(SyncOutcome::SkippedOffline);
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            event!(Level::DEBUG, %reason, "drain already in flight");
            return self.record(SyncOutcome::SkippedBusy);
        }
        let _guard = DrainGuard(&self.draining);

        event!(Level::DEBUG, %reason, "drain started");
        let outcome = match self.outbox.drain_all(self.dispatcher.as_ref()).await {
            Ok(report) => {
                if report.dispatched > 0 {
                    event!(
                        Level::INFO,
                        %reason,
                        dispatched = report.dispatched,
                        "sync completed"
                    );
                }
                SyncOutcome::Drained(report)
            }
            Err(err) => {
                event!(Level::WARN, %reason, error = %err, "sync failed; queue kept for next trigger");
                SyncOutcome::Failed(err)
            }
        };
        self.record(outcome)
    }

    /// Persists a mutation to the outbox and, when online, starts a drain in
    /// the background. Returns once the entry is durable.
    pub async fn queue_for_sync(
        self: &Arc<Self>,
        entity_type: EntityType,
        action: SyncAction,
        payload: serde_json::Value,
    ) -> Result<OutboxEntry> {
        let entry = OutboxEntry::new(entity_type, action, payload);
        self.outbox.enqueue(&entry).await?;
        if self.connectivity.is_online() {
            let coordinator = Arc::clone(self);
            self.background.spawn(async move {
                coordinator.trigger(TriggerReason::Enqueue).await;
            });
        }
        Ok(entry)
    }

    /// Drains on every offline to online flip of `monitor`.
    ///
    /// Must be called inside a tokio runtime; drains are spawned onto it.
    pub fn attach_reconnect(
        self: &Arc<Self>,
        monitor: &Arc<ConnectivityMonitor>,
    ) -> Result<Subscription> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SyncError::Scheduler(format!("attach_reconnect: {}", e)))?;
        let coordinator = Arc::downgrade(self);
        Ok(monitor.on_change(move |change| {
            if !change.is_reconnect() {
                return;
            }
            if let Some(coordinator) = coordinator.upgrade() {
                let background = coordinator.background.clone();
                background.spawn_on(
                    async move {
                        coordinator.trigger(TriggerReason::Reconnect).await;
                    },
                    &runtime,
                );
            }
        }))
    }

    fn record(&self, outcome: SyncOutcome) -> SyncOutcome {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &outcome {
            SyncOutcome::Drained(_) => {
                stats.drains_succeeded += 1;
                stats.last_drain_at = Some(Utc::now());
            }
            SyncOutcome::Failed(_) => {
                stats.drains_failed += 1;
                stats.last_drain_at = Some(Utc::now());
            }
            SyncOutcome::SkippedOffline | SyncOutcome::SkippedBusy => stats.triggers_skipped += 1,
        }
        stats.last_outcome = Some(outcome.clone());
        outcome
    }
}

#[async_trait]
impl SyncTrigger for SyncCoordinator {
    async fn scheduled_sync(&self) -> Result<()> {
        match self.trigger(TriggerReason::SchedulerTick).await {
            SyncOutcome::Failed(err) => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DispatchFault;
    use crate::storage::DurableStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Waits for a permit before each dispatch.
    struct Gate {
        permits: Semaphore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dispatcher for Gate {
        async fn dispatch(&self, _entry: &OutboxEntry) -> std::result::Result<(), DispatchFault> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|e| DispatchFault::Unreachable(e.to_string()))?;
            permit.forget();
            Ok(())
        }
    }

    struct Down;

    #[async_trait]
    impl Dispatcher for Down {
        async fn dispatch(&self, _entry: &OutboxEntry) -> std::result::Result<(), DispatchFault> {
            Err(DispatchFault::Unreachable("connection refused".to_string()))
        }
    }

    async fn seeded_outbox(n: usize) -> Outbox {
        let outbox = Outbox::new(DurableStore::in_memory());
        for i in 0..n {
            let entry = OutboxEntry::new(EntityType::Expense, SyncAction::Create, json!({"n": i}));
            outbox.enqueue(&entry).await.unwrap();
        }
        outbox
    }

    #[tokio::test]
    async fn test_concurrent_triggers_run_one_drain() {
        let gate = Arc::new(Gate {
            permits: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        });
        let coordinator = SyncCoordinator::new(
            seeded_outbox(2).await,
            gate.clone(),
            ConnectivityMonitor::new(true),
        );

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.trigger(TriggerReason::Manual).await })
        };
        while coordinator.phase() != SyncPhase::Draining {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            coordinator.trigger(TriggerReason::SchedulerTick).await,
            SyncOutcome::SkippedBusy
        );

        gate.permits.add_permits(2);
        let outcome = first.await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Drained(DrainReport {
                dispatched: 2,
                cleared: 2
            })
        );
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.phase(), SyncPhase::Idle);

        let stats = coordinator.stats();
        assert_eq!(stats.drains_succeeded, 1);
        assert_eq!(stats.triggers_skipped, 1);
    }

    #[tokio::test]
    async fn test_offline_trigger_does_not_dispatch() {
        let gate = Arc::new(Gate {
            permits: Semaphore::new(10),
            calls: AtomicUsize::new(0),
        });
        let coordinator =
            SyncCoordinator::new(seeded_outbox(3).await, gate.clone(), ConnectivityMonitor::new(false));

        assert_eq!(
            coordinator.trigger(TriggerReason::Manual).await,
            SyncOutcome::SkippedOffline
        );
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.outbox().len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_drain_returns_to_idle_and_reports_error() {
        let coordinator =
            SyncCoordinator::new(seeded_outbox(2).await, Arc::new(Down), ConnectivityMonitor::new(true));

        let outcome = coordinator.trigger(TriggerReason::Manual).await;
        assert!(matches!(
            outcome,
            SyncOutcome::Failed(SyncError::Dispatch(DispatchFault::Unreachable(_)))
        ));
        assert_eq!(coordinator.phase(), SyncPhase::Idle);
        assert_eq!(coordinator.outbox().len().await.unwrap(), 2);
        assert!(coordinator.scheduled_sync().await.is_err());
        assert_eq!(coordinator.stats().drains_failed, 2);
    }

    #[tokio::test]
    async fn test_reconnect_drains_automatically() {
        let gate = Arc::new(Gate {
            permits: Semaphore::new(10),
            calls: AtomicUsize::new(0),
        });
        let monitor = ConnectivityMonitor::new(false);
        let coordinator =
            SyncCoordinator::new(seeded_outbox(0).await, gate.clone(), monitor.clone());
        let _subscription = coordinator.attach_reconnect(&monitor).unwrap();

        coordinator
            .queue_for_sync(EntityType::Budget, SyncAction::Update, json!({"id": "b-1"}))
            .await
            .unwrap();
        assert_eq!(gate.calls.load(Ordering::SeqCst), 0);

        monitor.set_online(true);
        tokio::time::timeout(Duration::from_secs(2), async {
            while !coordinator.outbox().is_empty().await.unwrap() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outbox drained after reconnect");
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enqueue_drains_in_background_and_settles() {
        let gate = Arc::new(Gate {
            permits: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        });
        let coordinator = SyncCoordinator::new(
            seeded_outbox(0).await,
            gate.clone(),
            ConnectivityMonitor::new(true),
        );

        coordinator
            .queue_for_sync(EntityType::Expense, SyncAction::Create, json!({"id": "e-1"}))
            .await
            .unwrap();
        assert_eq!(coordinator.outbox().len().await.unwrap(), 1);

        gate.permits.add_permits(1);
        tokio::time::timeout(Duration::from_secs(2), coordinator.settle())
            .await
            .expect("background drain finished");
        assert!(coordinator.outbox().is_empty().await.unwrap());
        assert_eq!(coordinator.stats().drains_succeeded, 1);
    }
}
