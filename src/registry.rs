//! Device registry — the telemetry lifecycle manager.
//!
//! Orchestrates per-device subscriptions: registration spawns one, queries
//! touch its activity clock, unregistration and the idle reaper close it via
//! the same remove-then-close path. The registry table is the only shared
//! mutable state in the service; every critical section is await-free, so
//! operations on different devices never wait on each other's I/O and
//! operations on the same device are totally ordered by the table lock. A
//! removed entry is owned by whoever removed it, which is what makes two
//! racing unregistrations resolve to exactly one close.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{AppResult, TelemetryError};
use crate::subscription::{BackoffPolicy, DeviceSubscription};
use crate::telemetry::Reading;
use crate::upstream::EventSource;

/// One registered device and the subscription it exclusively owns.
struct DeviceEntry {
    registered_at: DateTime<Utc>,
    /// Baseline is `registered_at`, so a never-queried device still ages out.
    last_queried: DateTime<Utc>,
    subscription: DeviceSubscription,
}

/// Whether `register` created a new entry or found an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    AlreadyRegistered,
}

/// Snapshot row returned by [`DeviceRegistry::list`].
#[derive(Clone, Debug)]
pub struct DeviceStatus {
    pub device_id: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub connected: bool,
}

/// Result of a telemetry query: the latest reading when one arrived yet.
#[derive(Clone, Debug)]
pub struct TelemetrySnapshot {
    pub device_id: String,
    pub reading: Option<Reading>,
    pub connected: bool,
}

struct ReaperTask {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Registry of device subscriptions with idle eviction.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceEntry>>,
    source: Arc<dyn EventSource>,
    sink_tx: mpsc::Sender<Reading>,
    inactivity_timeout: Duration,
    backoff: BackoffPolicy,
    reaper: Mutex<Option<ReaperTask>>,
}

impl DeviceRegistry {
    pub fn new(
        source: Arc<dyn EventSource>,
        sink_tx: mpsc::Sender<Reading>,
        inactivity_timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            source,
            sink_tx,
            inactivity_timeout,
            backoff,
            reaper: Mutex::new(None),
        }
    }

    /// Register `device_id` and open its upstream subscription.
    ///
    /// Idempotent: a second registration finds the existing entry and changes
    /// nothing — in particular it never opens a second subscription, even
    /// while the first is still reconnecting.
    pub async fn register(&self, device_id: &str) -> RegisterOutcome {
        let mut devices = self.devices.lock().await;
        if devices.contains_key(device_id) {
            debug!(device_id = %device_id, "device already registered");
            return RegisterOutcome::AlreadyRegistered;
        }
        let now = Utc::now();
        let subscription = DeviceSubscription::open(
            device_id.to_string(),
            Arc::clone(&self.source),
            self.sink_tx.clone(),
            self.backoff,
        );
        devices.insert(
            device_id.to_string(),
            DeviceEntry {
                registered_at: now,
                last_queried: now,
                subscription,
            },
        );
        info!(device_id = %device_id, "device registered");
        RegisterOutcome::Created
    }

    /// Remove `device_id` and close its subscription.
    ///
    /// The entry leaves the table first; the close runs outside the lock so
    /// other devices are not held up by upstream teardown. Close failures are
    /// logged by the subscription itself and never resurrect the entry.
    pub async fn unregister(&self, device_id: &str) -> AppResult<()> {
        let entry = self.devices.lock().await.remove(device_id);
        match entry {
            None => Err(TelemetryError::DeviceNotFound(device_id.to_string())),
            Some(mut entry) => {
                entry.subscription.close().await;
                info!(device_id = %device_id, "device unregistered");
                Ok(())
            }
        }
    }

    /// Snapshot of all registered devices, ordered by registration time.
    pub async fn list(&self) -> Vec<DeviceStatus> {
        let devices = self.devices.lock().await;
        let mut statuses: Vec<DeviceStatus> = devices
            .iter()
            .map(|(device_id, entry)| DeviceStatus {
                device_id: device_id.clone(),
                registered_at: entry.registered_at,
                last_seen: entry.last_queried,
                connected: entry.subscription.is_connected(),
            })
            .collect();
        statuses.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        statuses
    }

    /// Latest telemetry for `device_id`, bumping its activity clock.
    ///
    /// The bump happens in the same critical section the reaper uses for its
    /// expiry check, so a query either lands before an eviction (entry
    /// survives, timer reset) or after it (`DeviceNotFound`) — never between.
    pub async fn telemetry(&self, device_id: &str) -> AppResult<TelemetrySnapshot> {
        let mut devices = self.devices.lock().await;
        let entry = devices
            .get_mut(device_id)
            .ok_or_else(|| TelemetryError::DeviceNotFound(device_id.to_string()))?;
        entry.last_queried = Utc::now();
        Ok(TelemetrySnapshot {
            device_id: device_id.to_string(),
            reading: entry.subscription.latest(),
            connected: entry.subscription.is_connected(),
        })
    }

    /// Number of registered devices.
    pub async fn len(&self) -> usize {
        self.devices.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.lock().await.is_empty()
    }

    /// Evict every entry idle past the inactivity timeout. Returns how many
    /// were evicted. Runs from the reaper task; public so deployments can
    /// also trigger a sweep by hand.
    pub async fn sweep_idle(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<(String, DeviceEntry)> = {
            let mut devices = self.devices.lock().await;
            let ids: Vec<String> = devices
                .iter()
                .filter(|(_, entry)| {
                    now.signed_duration_since(entry.last_queried)
                        .to_std()
                        .map(|idle| idle > self.inactivity_timeout)
                        .unwrap_or(false)
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| devices.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = expired.len();
        for (device_id, mut entry) in expired {
            let idle = now.signed_duration_since(entry.last_queried);
            entry.subscription.close().await;
            info!(
                device_id = %device_id,
                idle_secs = idle.num_seconds(),
                "evicted idle device subscription"
            );
        }
        count
    }

    /// Start the periodic idle sweep.
    pub async fn spawn_reaper(self: Arc<Self>, sweep_interval: Duration) {
        let registry = Arc::clone(&self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let evicted = registry.sweep_idle().await;
                        if evicted > 0 {
                            debug!(evicted, "idle sweep finished");
                        }
                    }
                }
            }
        });
        let mut reaper = self.reaper.lock().await;
        if let Some(previous) = reaper.replace(ReaperTask {
            shutdown_tx,
            handle,
        }) {
            warn!("reaper was already running, replacing it");
            let _ = previous.shutdown_tx.send(());
        }
    }

    /// Tear down: stop the reaper and close every subscription. Called on
    /// process shutdown so no upstream stream outlives the service.
    pub async fn shutdown(&self) {
        if let Some(reaper) = self.reaper.lock().await.take() {
            let _ = reaper.shutdown_tx.send(());
            if tokio::time::timeout(Duration::from_secs(5), reaper.handle)
                .await
                .is_err()
            {
                warn!("reaper task did not stop in time");
            }
        }

        let entries: Vec<(String, DeviceEntry)> =
            self.devices.lock().await.drain().collect();
        for (device_id, mut entry) in entries {
            entry.subscription.close().await;
            debug!(device_id = %device_id, "subscription closed at shutdown");
        }
        info!("device registry shut down");
    }
}
