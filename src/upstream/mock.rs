//! Channel-backed mock event source for tests.
//!
//! Tests inject events, terminal errors and open failures per device, and
//! can observe how many times a subscription (re)opened its stream.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::decode::RawEvent;
use crate::error::UpstreamError;
use crate::upstream::{EventSource, EventStream};

type EventSender = mpsc::UnboundedSender<Result<RawEvent, UpstreamError>>;
type EventReceiver = mpsc::UnboundedReceiver<Result<RawEvent, UpstreamError>>;

#[derive(Default)]
struct MockState {
    senders: HashMap<String, EventSender>,
    open_failures: u32,
    opens: u32,
}

/// In-process event source; every `open` hands back the receiving half of a
/// fresh unbounded channel keyed by device id.
#[derive(Default)]
pub struct MockEventSource {
    state: Mutex<MockState>,
}

impl MockEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make the next `n` calls to `open` fail with a connect error.
    pub fn fail_next_opens(&self, n: u32) {
        self.locked().open_failures = n;
    }

    /// Number of `open` calls observed so far (including failed ones).
    pub fn open_count(&self) -> u32 {
        self.locked().opens
    }

    /// Deliver an event on the device's current stream. Returns false when
    /// the device has no open stream.
    pub fn push(&self, device_id: &str, event: RawEvent) -> bool {
        self.locked()
            .senders
            .get(device_id)
            .is_some_and(|tx| tx.send(Ok(event)).is_ok())
    }

    /// Deliver a terminal receive error, forcing the subscriber to reconnect.
    pub fn fail_stream(&self, device_id: &str) {
        if let Some(tx) = self.locked().senders.get(device_id) {
            let _ = tx.send(Err(UpstreamError::Receive("mock stream failure".into())));
        }
    }

    /// End the device's current stream (subscriber sees end-of-stream).
    pub fn end_stream(&self, device_id: &str) {
        self.locked().senders.remove(device_id);
    }
}

#[async_trait]
impl EventSource for MockEventSource {
    async fn open(&self, device_id: &str) -> Result<Box<dyn EventStream>, UpstreamError> {
        let mut state = self.locked();
        state.opens += 1;
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(UpstreamError::Connect("mock open failure".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.senders.insert(device_id.to_string(), tx);
        Ok(Box::new(MockEventStream { rx }))
    }
}

struct MockEventStream {
    rx: EventReceiver,
}

#[async_trait]
impl EventStream for MockEventStream {
    async fn next_event(&mut self) -> Option<Result<RawEvent, UpstreamError>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}
