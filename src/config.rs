use crate::core::{Result, SyncError};
use crate::scheduler::StrategyKind;
use crate::storage::DurabilityMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for journal and snapshot. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,

    pub durability: DurabilityMode,

    /// Journal appends between automatic checkpoints
    pub checkpoint_every_ops: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            durability: DurabilityMode::Strict,
            checkpoint_every_ops: 256,
        }
    }
}

impl StoreConfig {
    pub fn data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.data_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn checkpoint_every_ops(mut self, ops: usize) -> Self {
        self.checkpoint_every_ops = ops;
        self
    }
}

/// Cadence of the periodic background tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub budget_reminder_interval_ms: u64,
    pub data_sync_interval_ms: u64,
    pub cleanup_interval_ms: u64,

    /// Force a strategy instead of probing. `None` probes at construction.
    pub strategy: Option<StrategyKind>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            budget_reminder_interval_ms: 30 * 60 * 1000,
            data_sync_interval_ms: 5 * 60 * 1000,
            cleanup_interval_ms: 60 * 60 * 1000,
            strategy: None,
        }
    }
}

impl SchedulerConfig {
    pub fn budget_reminder_interval(&self) -> Duration {
        Duration::from_millis(self.budget_reminder_interval_ms)
    }

    pub fn data_sync_interval(&self) -> Duration {
        Duration::from_millis(self.data_sync_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn strategy(mut self, kind: StrategyKind) -> Self {
        self.strategy = Some(kind);
        self
    }
}

/// Sync and remote dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote endpoint; without one entries are only logged.
    pub endpoint: Option<String>,

    /// Per-request timeout for the HTTP dispatcher
    pub request_timeout_ms: u64,

    /// Simulated latency of the logging dispatcher
    pub simulated_latency_ms: u64,

    /// Skip scheduled drains on slow-2g/2g connections
    pub skip_on_slow_connection: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout_ms: 10_000,
            simulated_latency_ms: 100,
            skip_on_slow_connection: true,
        }
    }
}

impl SyncConfig {
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub sync: SyncConfig,
}

impl AppConfig {
    /// Reads a JSON config file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("budget_reminder_interval_ms", self.scheduler.budget_reminder_interval_ms),
            ("data_sync_interval_ms", self.scheduler.data_sync_interval_ms),
            ("cleanup_interval_ms", self.scheduler.cleanup_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.store.checkpoint_every_ops == 0 {
            return Err(SyncError::Config(
                "checkpoint_every_ops must be greater than zero".to_string(),
            ));
        }
        if let Some(endpoint) = &self.sync.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(SyncError::Config(format!(
                    "endpoint '{}' must be an http(s) URL",
                    endpoint
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_background_cadence() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.budget_reminder_interval(), Duration::from_secs(30 * 60));
        assert_eq!(config.scheduler.data_sync_interval(), Duration::from_secs(5 * 60));
        assert_eq!(config.scheduler.cleanup_interval(), Duration::from_secs(60 * 60));
        assert!(config.store.data_dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = AppConfig::from_json_str(
            r#"{"store": {"data_dir": "/tmp/budgetsync", "durability": {"eventual": {"sync_interval_ms": 50}}},
                "sync": {"endpoint": "https://example.test/sync"}}"#,
        )
        .unwrap();
        assert_eq!(config.store.data_dir, Some(PathBuf::from("/tmp/budgetsync")));
        assert_eq!(
            config.store.durability,
            DurabilityMode::Eventual { sync_interval_ms: 50 }
        );
        assert_eq!(config.store.checkpoint_every_ops, 256);
        assert_eq!(config.sync.endpoint.as_deref(), Some("https://example.test/sync"));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let err = AppConfig::from_json_str(r#"{"scheduler": {"data_sync_interval_ms": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(msg) if msg.contains("data_sync_interval_ms")));
    }

    #[test]
    fn test_non_http_endpoint_is_rejected() {
        let config = AppConfig {
            sync: SyncConfig::default().endpoint("ftp://nope"),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
