use super::TaskPriority;
use super::runner::{ScheduleOptions, TaskOutcome, TaskScheduler};
use crate::core::Result;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

#[derive(Debug, Clone)]
pub struct PeriodicOptions {
    pub name: String,
    pub priority: TaskPriority,
    /// Run the first iteration without waiting one interval.
    pub immediate: bool,
}

impl Default for PeriodicOptions {
    fn default() -> Self {
        Self {
            name: "periodic".to_string(),
            priority: TaskPriority::Background,
            immediate: false,
        }
    }
}

impl PeriodicOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }
}

/// Handle to a self-rescheduling loop.
///
/// Dropping the handle leaves the loop running; call [`PeriodicHandle::cancel`].
pub struct PeriodicHandle {
    name: String,
    cancel: CancellationToken,
    iterations: Arc<AtomicU64>,
    join: JoinHandle<()>,
}

impl PeriodicHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops re-arming. An iteration already running still completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of iterations whose body ran, including failed ones.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Waits for the loop to exit. Only returns after `cancel`.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

impl TaskScheduler {
    /// Runs `task` every `interval` through [`TaskScheduler::schedule_once`].
    ///
    /// The next run is armed only after the previous one finished, so runs
    /// never overlap. Failures are logged and the loop continues.
    pub fn schedule_periodic<F, Fut>(
        &self,
        task: F,
        interval: Duration,
        options: PeriodicOptions,
    ) -> PeriodicHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let iterations = Arc::new(AtomicU64::new(0));
        let task = Arc::new(task);
        let scheduler = self.clone();
        let PeriodicOptions {
            name,
            priority,
            immediate,
        } = options;

        let join = {
            let cancel = cancel.clone();
            let iterations = iterations.clone();
            let name = name.clone();
            tokio::spawn(async move {
                let mut delay = if immediate { Duration::ZERO } else { interval };
                while !cancel.is_cancelled() {
                    let task = task.clone();
                    let handle = scheduler.schedule_once(
                        move || task(),
                        ScheduleOptions {
                            priority,
                            delay,
                            cancel: cancel.clone(),
                        },
                    );
                    let outcome = handle.wait().await;
                    if outcome.ran() {
                        iterations.fetch_add(1, Ordering::SeqCst);
                    }
                    match outcome {
                        TaskOutcome::Completed => {}
                        TaskOutcome::Failed(error) => {
                            event!(Level::WARN, task = %name, %error, "periodic task failed; continuing");
                        }
                        TaskOutcome::Cancelled => break,
                    }
                    delay = interval;
                }
                event!(Level::DEBUG, task = %name, "periodic task stopped");
            })
        };

        event!(
            Level::DEBUG,
            task = %name,
            interval_ms = interval.as_millis() as u64,
            immediate,
            "periodic task scheduled"
        );

        PeriodicHandle {
            name,
            cancel,
            iterations,
            join,
        }
    }
}
