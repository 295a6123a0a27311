//! Per-device upstream subscription.
//!
//! A [`DeviceSubscription`] owns exactly one upstream stream, run by a
//! dedicated tokio task. The task decodes inbound events, keeps the latest
//! reading (monotonic in capture time) in a shared cell, forwards accepted
//! readings to the persistence channel, and reconnects with exponential
//! backoff on terminal stream errors. Cancellation is cooperative and checked
//! at every suspension point: opening the stream, awaiting the next message,
//! and sleeping out a backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::decode::{decode, RawEvent};
use crate::error::DecodeError;
use crate::telemetry::Reading;
use crate::upstream::EventSource;

/// How long `close` waits for the subscription task before aborting it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect pacing for a subscription that lost its upstream stream.
/// Delay starts at `base`, doubles per failed attempt and saturates at
/// `cap`; retries are unbounded until the subscription is closed.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.cap)
    }
}

/// State shared between the subscription task and its owner.
#[derive(Default)]
struct SubscriptionShared {
    latest: RwLock<Option<Reading>>,
    connected: AtomicBool,
}

impl SubscriptionShared {
    fn read_latest(&self) -> Option<Reading> {
        match self.latest.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Store `reading` unless it is older than what is already held.
    /// Returns whether the reading was accepted.
    fn apply(&self, reading: Reading) -> bool {
        let mut guard = match self.latest.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(current) = guard.as_ref() {
            if reading.captured_at < current.captured_at {
                return false;
            }
        }
        *guard = Some(reading);
        true
    }
}

/// Handle to one device's live upstream subscription.
///
/// Exclusively owned by the registry entry it belongs to; closing it is the
/// only way to release the upstream resources.
pub struct DeviceSubscription {
    device_id: String,
    shared: Arc<SubscriptionShared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DeviceSubscription {
    /// Spawn the subscription task for `device_id`. The stream opens inside
    /// the task; the subscription reports disconnected until the first
    /// accepted reading arrives.
    pub fn open(
        device_id: String,
        source: Arc<dyn EventSource>,
        sink_tx: mpsc::Sender<Reading>,
        backoff: BackoffPolicy,
    ) -> Self {
        let shared = Arc::new(SubscriptionShared::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_subscription(
            device_id.clone(),
            source,
            sink_tx,
            Arc::clone(&shared),
            backoff,
            shutdown_rx,
        ));
        Self {
            device_id,
            shared,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Most recently accepted reading, if any arrived yet.
    pub fn latest(&self) -> Option<Reading> {
        self.shared.read_latest()
    }

    /// Whether the upstream stream is currently delivering readings.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Stop the subscription task and release the upstream stream.
    ///
    /// Idempotent; also cancels a pending reconnect backoff. The task gets
    /// [`CLOSE_TIMEOUT`] to wind down before being aborted, and the caller's
    /// entry removal proceeds either way.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => debug!(device_id = %self.device_id, "subscription task stopped"),
            Ok(Err(err)) => {
                error!(device_id = %self.device_id, error = %err, "subscription task panicked")
            }
            Err(_) => {
                warn!(device_id = %self.device_id, "subscription task unresponsive, aborting");
                task.abort();
            }
        }
    }
}

async fn run_subscription(
    device_id: String,
    source: Arc<dyn EventSource>,
    sink_tx: mpsc::Sender<Reading>,
    shared: Arc<SubscriptionShared>,
    backoff: BackoffPolicy,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut delay = backoff.base;
    loop {
        let opened = tokio::select! {
            _ = &mut shutdown_rx => return,
            opened = source.open(&device_id) => opened,
        };

        match opened {
            Ok(mut stream) => {
                delay = backoff.base;
                debug!(device_id = %device_id, "upstream stream opened");
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => {
                            stream.close().await;
                            return;
                        }
                        event = stream.next_event() => match event {
                            Some(Ok(raw)) => {
                                handle_event(&device_id, &shared, &sink_tx, &raw);
                            }
                            Some(Err(err)) => {
                                warn!(device_id = %device_id, error = %err, "upstream stream failed");
                                break;
                            }
                            None => {
                                warn!(device_id = %device_id, "upstream stream ended");
                                break;
                            }
                        }
                    }
                }
                stream.close().await;
            }
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "failed to open upstream stream");
            }
        }

        shared.connected.store(false, Ordering::Relaxed);
        info!(device_id = %device_id, retry_in = ?delay, "reconnecting upstream stream");
        tokio::select! {
            _ = &mut shutdown_rx => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = backoff.next(delay);
    }
}

/// Decode and apply one inbound event. Decode failures are dropped here —
/// a single bad message never terminates the subscription.
fn handle_event(
    device_id: &str,
    shared: &SubscriptionShared,
    sink_tx: &mpsc::Sender<Reading>,
    raw: &RawEvent,
) {
    match decode(raw, device_id) {
        Ok(reading) => {
            if shared.apply(reading.clone()) {
                shared.connected.store(true, Ordering::Relaxed);
                if sink_tx.try_send(reading).is_err() {
                    warn!(device_id = %device_id, "persistence channel unavailable, reading not persisted");
                }
            } else {
                debug!(device_id = %device_id, "discarded stale reading");
            }
        }
        Err(DecodeError::ForeignDevice { .. }) => {
            debug!(device_id = %device_id, "filtered event for another device");
        }
        Err(err) => {
            warn!(device_id = %device_id, error = %err, "dropping undecodable event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::MockEventSource;
    use serde_json::json;

    fn event_at(device_id: &str, epoch_secs: i64, voltage: f64) -> RawEvent {
        RawEvent::telemetry(
            device_id,
            &json!({
                "timestamp": chrono::DateTime::from_timestamp(epoch_secs, 0),
                "phase1": {"v": voltage, "i": 5.2, "p": 1144.5, "f": 50.0, "pf": 0.99}
            }),
        )
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn test_backoff() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn applies_readings_in_order() {
        let source = Arc::new(MockEventSource::new());
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let mut sub = DeviceSubscription::open(
            "meter-1".into(),
            source.clone(),
            sink_tx,
            test_backoff(),
        );

        assert!(!sub.is_connected());
        assert!(sub.latest().is_none());

        wait_for(|| source.open_count() >= 1).await;
        source.push("meter-1", event_at("meter-1", 100, 220.1));
        wait_for(|| sub.latest().is_some()).await;

        let reading = sub.latest().expect("reading stored");
        assert_eq!(reading.phases[0].and_then(|p| p.voltage), Some(220.1));
        assert!(sub.is_connected());

        // Accepted readings also flow to the persistence channel.
        let persisted = sink_rx.recv().await.expect("sink received");
        assert_eq!(persisted, reading);

        source.push("meter-1", event_at("meter-1", 101, 221.0));
        wait_for(|| {
            sub.latest()
                .and_then(|r| r.phases[0])
                .and_then(|p| p.voltage)
                == Some(221.0)
        })
        .await;

        sub.close().await;
    }

    #[tokio::test]
    async fn discards_stale_reading() {
        let source = Arc::new(MockEventSource::new());
        let (sink_tx, mut sink_rx) = mpsc::channel(16);
        let mut sub = DeviceSubscription::open(
            "meter-1".into(),
            source.clone(),
            sink_tx,
            test_backoff(),
        );

        wait_for(|| source.open_count() >= 1).await;
        source.push("meter-1", event_at("meter-1", 100, 220.1));
        wait_for(|| sub.latest().is_some()).await;
        let _ = sink_rx.recv().await;

        source.push("meter-1", event_at("meter-1", 90, 999.0));
        // Push a sentinel after the stale one so we know it was processed.
        source.push("meter-1", event_at("meter-1", 100, 220.1));
        let second = sink_rx.recv().await.expect("sentinel persisted");
        assert_eq!(second.phases[0].and_then(|p| p.voltage), Some(220.1));

        let stored = sub.latest().expect("still stored");
        assert_eq!(stored.phases[0].and_then(|p| p.voltage), Some(220.1));

        sub.close().await;
    }

    #[tokio::test]
    async fn bad_messages_do_not_kill_the_stream() {
        let source = Arc::new(MockEventSource::new());
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let mut sub = DeviceSubscription::open(
            "meter-1".into(),
            source.clone(),
            sink_tx,
            test_backoff(),
        );

        wait_for(|| source.open_count() >= 1).await;
        let mut broken = event_at("meter-1", 100, 220.1);
        broken.payload = bytes::Bytes::from_static(b"not json at all");
        source.push("meter-1", broken);
        // Event for somebody else: filtered, not fatal.
        source.push("meter-1", event_at("meter-9", 100, 123.0));
        source.push("meter-1", event_at("meter-1", 100, 220.1));

        wait_for(|| sub.latest().is_some()).await;
        assert_eq!(source.open_count(), 1, "no reconnect happened");

        sub.close().await;
    }

    #[tokio::test]
    async fn reconnects_with_backoff_after_stream_failure() {
        let source = Arc::new(MockEventSource::new());
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let mut sub = DeviceSubscription::open(
            "meter-1".into(),
            source.clone(),
            sink_tx,
            test_backoff(),
        );

        wait_for(|| source.open_count() >= 1).await;
        source.push("meter-1", event_at("meter-1", 100, 220.1));
        wait_for(|| sub.is_connected()).await;

        source.fail_stream("meter-1");
        wait_for(|| source.open_count() >= 2).await;

        source.push("meter-1", event_at("meter-1", 101, 225.0));
        wait_for(|| {
            sub.latest()
                .and_then(|r| r.phases[0])
                .and_then(|p| p.voltage)
                == Some(225.0)
        })
        .await;
        assert!(sub.is_connected());

        sub.close().await;
    }

    #[tokio::test]
    async fn survives_repeated_open_failures() {
        let source = Arc::new(MockEventSource::new());
        source.fail_next_opens(3);
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let mut sub = DeviceSubscription::open(
            "meter-1".into(),
            source.clone(),
            sink_tx,
            test_backoff(),
        );

        wait_for(|| source.open_count() >= 4).await;
        source.push("meter-1", event_at("meter-1", 100, 220.1));
        wait_for(|| sub.is_connected()).await;

        sub.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_retries() {
        let source = Arc::new(MockEventSource::new());
        let (sink_tx, _sink_rx) = mpsc::channel(16);
        let mut sub = DeviceSubscription::open(
            "meter-1".into(),
            source.clone(),
            sink_tx,
            test_backoff(),
        );

        wait_for(|| source.open_count() >= 1).await;
        sub.close().await;
        sub.close().await;

        let opens_after_close = source.open_count();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            source.open_count(),
            opens_after_close,
            "no retries after close"
        );
    }
}
