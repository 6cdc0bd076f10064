//! Remote dispatch seam.
//!
//! The outbox hands entries to a [`Dispatcher`] one at a time. What sits
//! behind it (HTTP endpoint, message bus, nothing at all) is not the sync
//! layer's concern; retries and backoff belong to the implementation, and the
//! provided ones do neither.

use crate::config::SyncConfig;
use crate::core::{DispatchFault, EntityType, OutboxEntry, SyncAction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, event};

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, entry: &OutboxEntry) -> std::result::Result<(), DispatchFault>;
}

#[async_trait]
impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    async fn dispatch(&self, entry: &OutboxEntry) -> std::result::Result<(), DispatchFault> {
        (**self).dispatch(entry).await
    }
}

/// What goes over the wire for one outbox entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntry {
    pub entity_type: EntityType,
    pub action: SyncAction,
    pub payload: serde_json::Value,
}

impl From<&OutboxEntry> for WireEntry {
    fn from(entry: &OutboxEntry) -> Self {
        Self {
            entity_type: entry.entity_type,
            action: entry.action,
            payload: entry.payload.clone(),
        }
    }
}

/// Accepts everything after an optional delay, logging each entry.
#[derive(Debug, Clone, Default)]
pub struct LoggingDispatcher {
    latency: Duration,
}

impl LoggingDispatcher {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Dispatcher for LoggingDispatcher {
    async fn dispatch(&self, entry: &OutboxEntry) -> std::result::Result<(), DispatchFault> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        event!(
            Level::INFO,
            entry_id = %entry.id,
            entity_type = %entry.entity_type,
            action = %entry.action,
            "synced outbox entry"
        );
        Ok(())
    }
}

/// POSTs each entry as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDispatcher {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> std::result::Result<Self, DispatchFault> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchFault::Unreachable(format!("build http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, entry: &OutboxEntry) -> std::result::Result<(), DispatchFault> {
        let body = WireEntry::from(entry);
        let response = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", entry.id.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    DispatchFault::Encoding(e.to_string())
                } else {
                    DispatchFault::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            event!(Level::DEBUG, entry_id = %entry.id, status = status.as_u16(), "entry accepted");
            return Ok(());
        }

        let reason = response.text().await.unwrap_or_default();
        Err(DispatchFault::Rejected {
            status: status.as_u16(),
            reason,
        })
    }
}

/// HTTP when an endpoint is configured, logging otherwise.
pub fn dispatcher_from_config(
    config: &SyncConfig,
) -> std::result::Result<Arc<dyn Dispatcher>, DispatchFault> {
    match &config.endpoint {
        Some(endpoint) => Ok(Arc::new(HttpDispatcher::new(
            endpoint.clone(),
            config.request_timeout(),
        )?)),
        None => Ok(Arc::new(LoggingDispatcher::new(Duration::from_millis(
            config.simulated_latency_ms,
        )))),
    }
}
