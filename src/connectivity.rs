//! Connectivity monitor.
//!
//! Holds the last known online/offline flag and connection quality and
//! notifies subscribers when either changes. Platform adapters (or the
//! bundled TCP probe loop) feed it through [`ConnectivityMonitor::set_online`]
//! and [`ConnectivityMonitor::update_quality`].
//!
//! Subscribers run synchronously on the thread that reported the change, in
//! registration order. Notifications never interleave: a second change waits
//! until every callback for the first one has returned. Callbacks must
//! therefore not report changes back into the monitor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Coarse bandwidth class, as reported by the Network Information API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    G2,
    #[serde(rename = "3g")]
    G3,
    #[serde(rename = "4g")]
    G4,
    #[serde(rename = "unknown")]
    Unknown,
}

impl EffectiveType {
    pub fn is_slow(&self) -> bool {
        matches!(self, Self::Slow2g | Self::G2)
    }

    /// Classifies a measured round trip with the Network Information
    /// thresholds.
    pub fn from_rtt(rtt: Duration) -> Self {
        match rtt.as_millis() {
            ms if ms >= 2000 => Self::Slow2g,
            ms if ms >= 1400 => Self::G2,
            ms if ms >= 270 => Self::G3,
            _ => Self::G4,
        }
    }

    pub fn typical_downlink_mbps(&self) -> f64 {
        match self {
            Self::Slow2g => 0.05,
            Self::G2 => 0.07,
            Self::G3 => 0.7,
            Self::G4 => 10.0,
            Self::Unknown => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slow2g => "slow-2g",
            Self::G2 => "2g",
            Self::G3 => "3g",
            Self::G4 => "4g",
            Self::Unknown => "unknown",
        }
    }
}

/// Connection-quality signal, without the online flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionQuality {
    pub effective_type: EffectiveType,
    pub downlink_mbps: f64,
    pub rtt_ms: u64,
    pub save_data: bool,
}

impl ConnectionQuality {
    pub fn from_rtt(rtt: Duration) -> Self {
        let effective_type = EffectiveType::from_rtt(rtt);
        Self {
            effective_type,
            downlink_mbps: effective_type.typical_downlink_mbps(),
            rtt_ms: rtt.as_millis() as u64,
            save_data: false,
        }
    }
}

/// Snapshot handed to callers and subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub online: bool,
    pub effective_type: EffectiveType,
    pub downlink_mbps: f64,
    pub rtt_ms: u64,
    pub save_data: bool,
}

impl ConnectionState {
    pub fn is_slow(&self) -> bool {
        self.effective_type.is_slow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionChange {
    WentOnline,
    WentOffline,
    QualityChanged,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionEvent {
    pub change: ConnectionChange,
    pub online: bool,
    pub info: Option<ConnectionState>,
}

impl ConnectionEvent {
    pub fn is_reconnect(&self) -> bool {
        self.change == ConnectionChange::WentOnline
    }
}

type Callback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct MonitorState {
    online: bool,
    quality: Option<ConnectionQuality>,
}

impl MonitorState {
    fn info(&self) -> Option<ConnectionState> {
        self.quality.map(|q| ConnectionState {
            online: self.online,
            effective_type: q.effective_type,
            downlink_mbps: q.downlink_mbps,
            rtt_ms: q.rtt_ms,
            save_data: q.save_data,
        })
    }
}

/// Process-wide connectivity state. Construct once and share through `Arc`.
pub struct ConnectivityMonitor {
    state: RwLock<MonitorState>,
    subscribers: RwLock<Vec<(u64, Callback)>>,
    next_subscriber: AtomicU64,
    emit: Mutex<()>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(MonitorState {
                online,
                quality: None,
            }),
            subscribers: RwLock::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            emit: Mutex::new(()),
        })
    }

    pub fn is_online(&self) -> bool {
        self.read_state().online
    }

    /// Last observed quality, or `None` when no quality signal was ever seen.
    pub fn connection_info(&self) -> Option<ConnectionState> {
        self.read_state().info()
    }

    pub fn is_slow_connection(&self) -> bool {
        self.connection_info().is_some_and(|info| info.is_slow())
    }

    pub fn estimated_bandwidth(&self) -> f64 {
        self.connection_info()
            .map(|info| info.downlink_mbps)
            .unwrap_or_default()
    }

    pub fn round_trip_time(&self) -> u64 {
        self.connection_info()
            .map(|info| info.rtt_ms)
            .unwrap_or_default()
    }

    /// Registers `callback` for every subsequent change.
    pub fn on_change<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            monitor: Arc::downgrade(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Platform online/offline signal. Subscribers hear about actual flips only.
    pub fn set_online(&self, online: bool) {
        let _emit = self.emit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let event = {
            let mut state = self.write_state();
            if state.online == online {
                return;
            }
            state.online = online;
            ConnectionEvent {
                change: if online {
                    ConnectionChange::WentOnline
                } else {
                    ConnectionChange::WentOffline
                },
                online,
                info: state.info(),
            }
        };
        if online {
            info!("network online");
        } else {
            warn!("network offline");
        }
        self.notify(&event);
    }

    /// Platform connection-quality signal.
    pub fn update_quality(&self, quality: ConnectionQuality) {
        let _emit = self.emit.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let event = {
            let mut state = self.write_state();
            if state.quality == Some(quality) {
                return;
            }
            state.quality = Some(quality);
            ConnectionEvent {
                change: ConnectionChange::QualityChanged,
                online: state.online,
                info: state.info(),
            }
        };
        debug!(
            effective_type = quality.effective_type.as_str(),
            downlink_mbps = quality.downlink_mbps,
            rtt_ms = quality.rtt_ms,
            save_data = quality.save_data,
            "network quality changed"
        );
        if quality.effective_type.is_slow() {
            warn!(effective_type = quality.effective_type.as_str(), "slow connection");
        }
        self.notify(&event);
    }

    fn notify(&self, event: &ConnectionEvent) {
        // Snapshot so callbacks may subscribe or unsubscribe without deadlock.
        let callbacks: Vec<Callback> = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    fn read_state(&self) -> MonitorState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, MonitorState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle returned by [`ConnectivityMonitor::on_change`].
///
/// Dropping it does not unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    monitor: Weak<ConnectivityMonitor>,
}

impl Subscription {
    /// Removes exactly the callback this handle was returned for.
    pub fn unsubscribe(self) -> bool {
        self.monitor
            .upgrade()
            .map(|monitor| monitor.unsubscribe(self.id))
            .unwrap_or(false)
    }
}

// ============================================================================
// Probing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub rtt: Option<Duration>,
}

/// Source of online/quality signals on hosts without platform events.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> ProbeResult;
}

/// Considers the network up when a TCP connection to `addr` succeeds in time.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => ProbeResult {
                reachable: true,
                rtt: Some(started.elapsed()),
            },
            Ok(Err(err)) => {
                debug!(addr = %self.addr, error = %err, "probe connect failed");
                ProbeResult {
                    reachable: false,
                    rtt: None,
                }
            }
            Err(_) => ProbeResult {
                reachable: false,
                rtt: None,
            },
        }
    }
}

/// Polls `probe` every `interval` and feeds the monitor until cancelled.
pub fn spawn_probe_loop(
    monitor: Arc<ConnectivityMonitor>,
    probe: Arc<dyn ConnectivityProbe>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let result = probe.probe().await;
            monitor.set_online(result.reachable);
            if let Some(rtt) = result.rtt {
                monitor.update_quality(ConnectionQuality::from_rtt(rtt));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("connectivity probe loop cancelled");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}
