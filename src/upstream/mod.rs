//! Upstream event-source seam.
//!
//! The registry only needs one capability from the cloud event stream: open a
//! per-device message subscription that yields raw telemetry events and can
//! be closed. [`EventSource`] is that seam. Three implementations live here:
//!
//! - [`mqtt::MqttEventSource`] — the production transport; one broker topic
//!   subscription per device id.
//! - [`simulated::SimulatedEventSource`] — a rand-driven three-phase
//!   generator for broker-less development.
//! - [`mock::MockEventSource`] — channel-backed injection for tests.
//!
//! Transport mechanics past this seam (authentication, partitioning,
//! checkpointing) are the broker's problem, not the registry's.

pub mod mock;
pub mod mqtt;
pub mod simulated;

use async_trait::async_trait;

use crate::decode::RawEvent;
use crate::error::UpstreamError;

pub use mock::MockEventSource;
pub use mqtt::MqttEventSource;
pub use simulated::SimulatedEventSource;

/// Factory for per-device event streams.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a subscription filtered to `device_id`.
    async fn open(&self, device_id: &str) -> Result<Box<dyn EventStream>, UpstreamError>;
}

/// One live, closable subscription delivering a single device's events.
#[async_trait]
pub trait EventStream: Send {
    /// Await the next event. `None` means the stream ended; `Some(Err(_))`
    /// is a terminal receive failure. Either way the caller is expected to
    /// close this stream and reopen through the source.
    async fn next_event(&mut self) -> Option<Result<RawEvent, UpstreamError>>;

    /// Release the underlying transport. Must be safe to call after the
    /// stream ended.
    async fn close(&mut self);
}
