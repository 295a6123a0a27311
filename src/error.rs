//! Custom error types for the service.
//!
//! This module defines the primary error type, `TelemetryError`, plus the two
//! narrow error enums that never cross the component boundaries they belong
//! to: `DecodeError` (owned by the decoder, absorbed by the subscription
//! loop) and `UpstreamError` (owned by the event-source seam, absorbed by the
//! reconnect loop).
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: wraps errors from `figment`, typically file parsing or
//!   format issues in the configuration file.
//! - **`Configuration`**: semantic configuration errors — values that parse
//!   but are logically invalid (bad log level, a topic template without a
//!   device placeholder). Caught during the validation step and fatal at
//!   startup: the process must not start serving with broken upstream
//!   credentials.
//! - **`DeviceNotFound`**: an operation referenced a device id with no
//!   registry entry. Surfaced to HTTP callers as a 404.
//! - **`Decode`**: a raw upstream message could not be turned into a reading.
//!   Never fatal; the offending message is dropped.
//! - **`Upstream`**: transient connectivity failure on the event stream.
//!   Handled by the subscription's backoff loop and never propagated past it.
//! - **`Sink`**: the persistence forward failed. Logged by the sink writer
//!   task; telemetry serving is unaffected.

use thiserror::Error;

/// Convenience alias for results using the service error type.
pub type AppResult<T> = std::result::Result<T, TelemetryError>;

/// Failure to turn a raw upstream event into a telemetry reading.
///
/// All variants are non-fatal: the subscription loop logs and drops the
/// message, never terminating on a single bad event.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("event carries no device identity property")]
    MissingDeviceId,

    #[error("event from device '{actual}' ignored (subscribed to '{expected}')")]
    ForeignDevice { expected: String, actual: String },

    #[error("event carries no capture timestamp")]
    MissingTimestamp,

    #[error("malformed telemetry payload: {0}")]
    Payload(String),
}

/// Transient failure on the upstream event stream.
///
/// These trigger the subscription's reconnect-with-backoff path and never
/// surface past the subscription boundary.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("failed to open upstream subscription: {0}")]
    Connect(String),

    #[error("upstream receive failed: {0}")]
    Receive(String),
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("device '{0}' is not registered")]
    DeviceNotFound(String),

    #[error("telemetry decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("upstream connection error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("storage sink error: {0}")]
    Sink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_folds_into_telemetry_error() {
        let err: TelemetryError = DecodeError::MissingDeviceId.into();
        assert!(matches!(err, TelemetryError::Decode(_)));
    }

    #[test]
    fn not_found_names_the_device() {
        let err = TelemetryError::DeviceNotFound("meter-7".into());
        assert!(err.to_string().contains("meter-7"));
    }
}
