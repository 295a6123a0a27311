//! # Gridpulse Core Library
//!
//! Gridpulse ingests electrical telemetry (voltage, current, power,
//! frequency, power factor across up to 7 phases) from IoT devices via a
//! cloud event stream, keeps the most recent reading per device in memory,
//! forwards accepted readings to an external storage API, and serves
//! everything over a polling HTTP API.
//!
//! ## Crate Structure
//!
//! - **`config`**: strongly-typed settings loaded with figment from TOML and
//!   environment, with semantic validation. See [`config::Settings`].
//! - **`error`**: the `TelemetryError` taxonomy plus the narrow `DecodeError`
//!   and `UpstreamError` enums.
//! - **`telemetry`**: the reading data model — 7 fixed phase slots where
//!   absent and zero are distinct.
//! - **`decode`**: pure translation from raw upstream events to readings,
//!   keyed to a device identity.
//! - **`upstream`**: the event-source seam and its MQTT, simulated and mock
//!   implementations.
//! - **`subscription`**: one tokio task per device owning its upstream
//!   stream, with monotonic latest-reading semantics and backoff reconnect.
//! - **`registry`**: the device lifecycle manager — registration, queries,
//!   idle reaping, shutdown. This is the heart of the service.
//! - **`sink`**: fire-and-forget forwarding of accepted readings to the
//!   storage API.
//! - **`api`**: the axum HTTP surface.
//! - **`logging`**: tracing subscriber setup.

pub mod api;
pub mod config;
pub mod decode;
pub mod error;
pub mod logging;
pub mod registry;
pub mod sink;
pub mod subscription;
pub mod telemetry;
pub mod upstream;
