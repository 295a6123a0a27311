//! Telemetry decoder.
//!
//! Pure translation from a raw upstream event to a [`Reading`], keyed to the
//! device a subscription is filtered to. Decoding never touches shared state
//! and never fails the subscription: the caller logs the [`DecodeError`] and
//! drops the message.
//!
//! Wire format: the event's property map carries the device identity under
//! [`DEVICE_ID_PROPERTY`]; the payload is a JSON object with per-phase keys
//! `phase1`..`phase7`, each an object of short-named quantities (`v`, `i`,
//! `p`, `f`, `pf`). Unknown top-level and per-phase fields are ignored. A
//! phase key supplying no recognized quantity is absent, not zero-filled.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::DecodeError;
use crate::telemetry::{PhaseReading, Reading, MAX_PHASES};

/// Event property naming the device that produced a message. Matches the
/// connection-device-id system property stamped by IoT hub brokers.
pub const DEVICE_ID_PROPERTY: &str = "iothub-connection-device-id";

/// A raw message as delivered by the upstream event stream, before decoding.
#[derive(Clone, Debug)]
pub struct RawEvent {
    /// Broker/system properties attached to the message.
    pub properties: HashMap<String, String>,
    /// JSON message body.
    pub payload: Bytes,
    /// When the broker enqueued the message, if known. Used as the capture
    /// timestamp fallback when the body carries none.
    pub enqueued_at: Option<DateTime<Utc>>,
}

impl RawEvent {
    /// Build a telemetry event for `device_id` carrying `body` as its JSON
    /// payload. Used by the simulated source and by tests.
    pub fn telemetry(device_id: &str, body: &serde_json::Value) -> Self {
        let mut properties = HashMap::new();
        properties.insert(DEVICE_ID_PROPERTY.to_string(), device_id.to_string());
        Self {
            properties,
            payload: Bytes::from(body.to_string()),
            enqueued_at: Some(Utc::now()),
        }
    }
}

/// Per-phase quantities as they appear on the wire.
#[derive(Debug, Default, Deserialize)]
struct WirePhase {
    v: Option<f64>,
    i: Option<f64>,
    p: Option<f64>,
    f: Option<f64>,
    pf: Option<f64>,
}

impl From<WirePhase> for PhaseReading {
    fn from(wire: WirePhase) -> Self {
        PhaseReading {
            voltage: wire.v,
            current: wire.i,
            power: wire.p,
            frequency: wire.f,
            power_factor: wire.pf,
        }
    }
}

/// Decode a raw event into a reading for `expected_device`.
///
/// Messages for other devices decode to [`DecodeError::ForeignDevice`] so the
/// subscription can filter them out without treating them as corrupt.
pub fn decode(event: &RawEvent, expected_device: &str) -> Result<Reading, DecodeError> {
    let device_id = event
        .properties
        .get(DEVICE_ID_PROPERTY)
        .ok_or(DecodeError::MissingDeviceId)?;
    if device_id != expected_device {
        return Err(DecodeError::ForeignDevice {
            expected: expected_device.to_string(),
            actual: device_id.clone(),
        });
    }

    let body: serde_json::Value = serde_json::from_slice(&event.payload)
        .map_err(|err| DecodeError::Payload(err.to_string()))?;
    let body = body
        .as_object()
        .ok_or_else(|| DecodeError::Payload("payload is not a JSON object".to_string()))?;

    let captured_at = match body.get("timestamp") {
        Some(value) => serde_json::from_value::<DateTime<Utc>>(value.clone())
            .map_err(|err| DecodeError::Payload(format!("bad timestamp: {err}")))?,
        None => event.enqueued_at.ok_or(DecodeError::MissingTimestamp)?,
    };

    let mut phases: [Option<PhaseReading>; MAX_PHASES] = [None; MAX_PHASES];
    for (slot, number) in phases.iter_mut().zip(1..=MAX_PHASES) {
        let Some(value) = body.get(&format!("phase{number}")) else {
            continue;
        };
        let wire: WirePhase = serde_json::from_value(value.clone())
            .map_err(|err| DecodeError::Payload(format!("phase{number}: {err}")))?;
        let phase = PhaseReading::from(wire);
        if !phase.is_empty() {
            *slot = Some(phase);
        }
    }

    Ok(Reading {
        device_id: device_id.clone(),
        captured_at,
        phases,
    })
}
