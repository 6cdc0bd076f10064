//! Capabilities the background tasks depend on. Wired once at startup.

use crate::core::{Budget, Result};
use crate::storage::DurableStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{Level, event};

/// Something that can drain pending mutations when asked by a scheduled tick.
#[async_trait]
pub trait SyncTrigger: Send + Sync {
    async fn scheduled_sync(&self) -> Result<()>;
}

/// Source of budgets with an up-to-date `spent`.
#[async_trait]
pub trait BudgetReader: Send + Sync {
    async fn current_budgets(&self) -> Result<Vec<Budget>>;
}

#[async_trait]
pub trait Housekeeping: Send + Sync {
    async fn housekeeping(&self) -> Result<()>;
}

#[async_trait]
impl Housekeeping for DurableStore {
    async fn housekeeping(&self) -> Result<()> {
        self.compact().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub tag: String,
}

/// Best-effort user-visible alerts.
pub trait Notifier: Send + Sync {
    /// Without permission, callers skip `notify` silently.
    fn permitted(&self) -> bool {
        true
    }

    fn notify(&self, notification: &Notification);
}

/// Emits notifications as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) {
        event!(
            Level::INFO,
            tag = %notification.tag,
            body = %notification.body,
            "{}",
            notification.title
        );
    }
}

/// Host mechanism that can wake the process periodically (OS timer, service
/// manager, mobile background fetch).
pub trait HostWakeup: Send + Sync {
    /// Returns false when the host cannot honour the registration.
    fn register(&self, tag: &str, min_interval: Duration) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoHostWakeup;

impl HostWakeup for NoHostWakeup {
    fn register(&self, _tag: &str, _min_interval: Duration) -> bool {
        false
    }
}
