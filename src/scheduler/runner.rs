use super::TaskPriority;
use super::strategy::{QueuedJob, SchedulerCapabilities, StrategyKind, run_priority_worker};
use crate::config::SchedulerConfig;
use crate::core::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

pub(crate) type Job = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TaskOutcome::Completed)
    }

    /// True when the task body actually ran, successfully or not.
    pub fn ran(&self) -> bool {
        !matches!(self, TaskOutcome::Cancelled)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub priority: TaskPriority,
    pub delay: Duration,
    pub cancel: CancellationToken,
}

impl ScheduleOptions {
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// A task handed to [`TaskScheduler::schedule_once`].
pub struct TaskHandle {
    strategy: StrategyKind,
    cancel: CancellationToken,
    join: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    /// Tier the task was routed to.
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// Prevents the task from starting. A body already running is not interrupted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> TaskOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => TaskOutcome::Cancelled,
            Err(err) => TaskOutcome::Failed(err.to_string()),
        }
    }
}

/// Priority-aware task runner with tiered strategies.
///
/// Tier selection per task: the priority queue worker when available; else
/// the idle tier for zero-delay tasks; else the timer. Every tier honours the
/// requested delay and cancellation token.
///
/// Priority-queue tasks run one at a time on a single worker, so a task must
/// not wait on the handle of another task scheduled on the same worker.
#[derive(Clone)]
pub struct TaskScheduler {
    capabilities: SchedulerCapabilities,
    queue: Option<mpsc::UnboundedSender<QueuedJob>>,
    next_seq: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl TaskScheduler {
    /// Probes the runtime and starts the priority worker when possible.
    pub fn new() -> Self {
        Self::with_capabilities(SchedulerCapabilities::probe())
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        let probed = SchedulerCapabilities::probe();
        match config.strategy {
            Some(kind) => Self::with_capabilities(probed.restrict_to(kind)),
            None => Self::with_capabilities(probed),
        }
    }

    pub fn with_capabilities(capabilities: SchedulerCapabilities) -> Self {
        let shutdown = CancellationToken::new();
        let queue = if capabilities.priority_queue {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_priority_worker(rx, shutdown.clone()));
            Some(tx)
        } else {
            None
        };
        event!(
            Level::DEBUG,
            strategy = %capabilities.preferred(),
            "task scheduler ready"
        );
        Self {
            capabilities,
            queue,
            next_seq: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    pub fn capabilities(&self) -> SchedulerCapabilities {
        self.capabilities
    }

    /// The tier a task with `delay` would be routed to right now.
    pub fn strategy_for(&self, delay: Duration) -> StrategyKind {
        let worker_alive = self.queue.as_ref().is_some_and(|tx| !tx.is_closed());
        if worker_alive {
            StrategyKind::PriorityQueue
        } else if self.capabilities.idle && delay.is_zero() {
            StrategyKind::Idle
        } else {
            StrategyKind::Timer
        }
    }

    pub fn schedule_once<F, Fut>(&self, task: F, options: ScheduleOptions) -> TaskHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job: Job = Box::new(move || task().boxed());
        let ScheduleOptions {
            priority,
            delay,
            cancel,
        } = options;
        let strategy = self.strategy_for(delay);
        let token = cancel.clone();

        let join = match (strategy, self.queue.clone()) {
            (StrategyKind::PriorityQueue, Some(sender)) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    if !wait_for_delay(delay, &cancel).await {
                        return TaskOutcome::Cancelled;
                    }
                    let (done, outcome) = oneshot::channel();
                    let queued = QueuedJob {
                        priority,
                        seq,
                        job,
                        cancel: cancel.clone(),
                        done,
                    };
                    if let Err(mpsc::error::SendError(queued)) = sender.send(queued) {
                        event!(Level::DEBUG, seq, "priority worker gone, running directly");
                        return run_guarded(queued.job, &cancel).await;
                    }
                    outcome.await.unwrap_or(TaskOutcome::Cancelled)
                })
            }
            (StrategyKind::Idle, _) => tokio::spawn(async move {
                if cancel.is_cancelled() {
                    return TaskOutcome::Cancelled;
                }
                tokio::task::yield_now().await;
                run_guarded(job, &cancel).await
            }),
            _ => tokio::spawn(async move {
                if !wait_for_delay(delay, &cancel).await {
                    return TaskOutcome::Cancelled;
                }
                run_guarded(job, &cancel).await
            }),
        };

        TaskHandle {
            strategy,
            cancel: token,
            join,
        }
    }

    /// Stops the priority worker. Later tasks fall back to the other tiers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns false when cancelled before the delay elapsed.
async fn wait_for_delay(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Runs the job unless already cancelled. Errors and panics become `Failed`.
pub(crate) async fn run_guarded(job: Job, cancel: &CancellationToken) -> TaskOutcome {
    if cancel.is_cancelled() {
        return TaskOutcome::Cancelled;
    }
    match AssertUnwindSafe(async move { job().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => TaskOutcome::Completed,
        Ok(Err(err)) => {
            event!(Level::WARN, error = %err, "scheduled task failed");
            TaskOutcome::Failed(err.to_string())
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            event!(Level::ERROR, panic = %message, "scheduled task panicked");
            TaskOutcome::Failed(message)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "task panicked".to_string()
    }
}
