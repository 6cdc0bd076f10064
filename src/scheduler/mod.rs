//! Background task scheduling.
//!
//! [`TaskScheduler`] runs one-shot and periodic tasks through one of three
//! strategies picked at construction; [`BackgroundTasks`] wires the budget
//! reminder, data sync and cleanup loops onto it.

pub mod budget;
pub mod capabilities;
pub mod periodic;
pub mod runner;
pub mod strategy;
pub mod tasks;

use serde::{Deserialize, Serialize};

pub use budget::{BudgetAlert, alert_notification, evaluate_budget, evaluate_budgets};
pub use capabilities::{
    BudgetReader, Housekeeping, HostWakeup, NoHostWakeup, Notification, Notifier, SyncTrigger,
    TracingNotifier,
};
pub use periodic::{PeriodicHandle, PeriodicOptions};
pub use runner::{ScheduleOptions, TaskHandle, TaskOutcome, TaskScheduler};
pub use strategy::{SchedulerCapabilities, StrategyKind};
pub use tasks::{BackgroundDeps, BackgroundTasks, check_budgets};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskPriority {
    UserBlocking,
    #[default]
    UserVisible,
    Background,
}

impl TaskPriority {
    pub(crate) fn rank(&self) -> u8 {
        match self {
            TaskPriority::UserBlocking => 2,
            TaskPriority::UserVisible => 1,
            TaskPriority::Background => 0,
        }
    }
}
