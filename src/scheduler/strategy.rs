use super::TaskPriority;
use super::runner::{Job, TaskOutcome, run_guarded};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

/// How a single task gets onto the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Dedicated worker draining a priority-ordered queue.
    PriorityQueue,
    /// Yield to the runtime once, then run. Only for zero-delay tasks.
    Idle,
    /// Sleep for the requested delay, then run.
    Timer,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::PriorityQueue => "priority_queue",
            StrategyKind::Idle => "idle",
            StrategyKind::Timer => "timer",
        };
        write!(f, "{}", name)
    }
}

/// What the host runtime can offer, probed once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerCapabilities {
    pub priority_queue: bool,
    pub idle: bool,
}

impl SchedulerCapabilities {
    pub fn probe() -> Self {
        let in_runtime = tokio::runtime::Handle::try_current().is_ok();
        Self {
            priority_queue: in_runtime,
            idle: in_runtime,
        }
    }

    /// Only the timer tier.
    pub fn timer_only() -> Self {
        Self {
            priority_queue: false,
            idle: false,
        }
    }

    /// Narrows the probed capabilities to a forced starting tier.
    pub fn restrict_to(self, kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::PriorityQueue => self,
            StrategyKind::Idle => Self {
                priority_queue: false,
                ..self
            },
            StrategyKind::Timer => Self::timer_only(),
        }
    }

    pub fn preferred(&self) -> StrategyKind {
        if self.priority_queue {
            StrategyKind::PriorityQueue
        } else if self.idle {
            StrategyKind::Idle
        } else {
            StrategyKind::Timer
        }
    }
}

pub(crate) struct QueuedJob {
    pub(crate) priority: TaskPriority,
    pub(crate) seq: u64,
    pub(crate) job: Job,
    pub(crate) cancel: CancellationToken,
    pub(crate) done: oneshot::Sender<TaskOutcome>,
}

// Max-heap: higher priority first, then lower sequence number.
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .rank()
            .cmp(&other.priority.rank())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

/// Runs queued jobs one at a time, highest priority first.
///
/// Exits when every sender is gone or `shutdown` fires. Jobs still queued at
/// that point are dropped and their handles resolve as cancelled.
pub(crate) async fn run_priority_worker(
    mut rx: mpsc::UnboundedReceiver<QueuedJob>,
    shutdown: CancellationToken,
) {
    let mut heap: BinaryHeap<QueuedJob> = BinaryHeap::new();
    loop {
        if heap.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = rx.recv() => match next {
                    Some(job) => heap.push(job),
                    None => break,
                },
            }
        }
        while let Ok(job) = rx.try_recv() {
            heap.push(job);
        }
        if shutdown.is_cancelled() {
            break;
        }

        if let Some(queued) = heap.pop() {
            let outcome = run_guarded(queued.job, &queued.cancel).await;
            let _ = queued.done.send(outcome);
        }
    }
    event!(
        Level::DEBUG,
        dropped = heap.len(),
        "priority worker stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restrict_never_widens() {
        let none = SchedulerCapabilities::timer_only();
        assert_eq!(none.restrict_to(StrategyKind::PriorityQueue), none);
        assert_eq!(none.preferred(), StrategyKind::Timer);

        let all = SchedulerCapabilities {
            priority_queue: true,
            idle: true,
        };
        assert_eq!(all.preferred(), StrategyKind::PriorityQueue);
        assert_eq!(all.restrict_to(StrategyKind::Idle).preferred(), StrategyKind::Idle);
        assert_eq!(all.restrict_to(StrategyKind::Timer).preferred(), StrategyKind::Timer);
    }

    #[test]
    fn test_strategy_kind_serde_names() {
        let kind: StrategyKind = serde_json::from_str("\"priority_queue\"").unwrap();
        assert_eq!(kind, StrategyKind::PriorityQueue);
        assert_eq!(serde_json::to_string(&StrategyKind::Timer).unwrap(), "\"timer\"");
    }

    #[tokio::test]
    async fn test_probe_inside_runtime_offers_every_tier() {
        let caps = SchedulerCapabilities::probe();
        assert!(caps.priority_queue);
        assert!(caps.idle);
    }
}
