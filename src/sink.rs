//! Persistence sink.
//!
//! Accepted readings flow through an mpsc channel into a writer task that
//! forwards them to the external storage API. The forward is fire-and-forget
//! from the registry's point of view: failures are logged and the reading is
//! dropped; telemetry serving is never blocked on storage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StorageSettings;
use crate::error::{AppResult, TelemetryError};
use crate::telemetry::{Reading, MAX_PHASES};

/// Destination for decoded readings.
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    /// Persist one reading. Errors are reported to the caller for logging
    /// only; nothing retries a failed insert.
    async fn insert_measurement(&self, reading: &Reading) -> AppResult<()>;
}

/// Sink used when no storage endpoint is configured; accepts and discards.
pub struct NullSink;

#[async_trait]
impl MeasurementSink for NullSink {
    async fn insert_measurement(&self, _reading: &Reading) -> AppResult<()> {
        Ok(())
    }
}

/// Wire shape of one measurement insert, per the storage API contract:
/// fixed-width per-phase arrays with zero-filled unused slots.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MeasurementRecord {
    device_id: String,
    voltage: [f64; MAX_PHASES],
    current: [f64; MAX_PHASES],
    power: [f64; MAX_PHASES],
    power_factor: [f64; MAX_PHASES],
    frequency: f64,
    captured_at: DateTime<Utc>,
}

impl MeasurementRecord {
    fn from_reading(reading: &Reading) -> Self {
        Self {
            device_id: reading.device_id.clone(),
            voltage: reading.sink_column(|p| p.voltage),
            current: reading.sink_column(|p| p.current),
            power: reading.sink_column(|p| p.power),
            power_factor: reading.sink_column(|p| p.power_factor),
            frequency: reading.grid_frequency(),
            captured_at: reading.captured_at,
        }
    }
}

/// Forwards readings to the external storage API over HTTP.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSink {
    pub fn new(settings: &StorageSettings) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|err| TelemetryError::Sink(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!(
                "{}/api/v1/measurements/",
                settings.endpoint.trim_end_matches('/')
            ),
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl MeasurementSink for HttpSink {
    async fn insert_measurement(&self, reading: &Reading) -> AppResult<()> {
        let record = MeasurementRecord::from_reading(reading);
        let mut request = self.client.post(&self.endpoint).json(&record);
        if let Some(api_key) = &self.api_key {
            request = request.header("X-API-Key", api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| TelemetryError::Sink(err.to_string()))?;
        response
            .error_for_status()
            .map_err(|err| TelemetryError::Sink(err.to_string()))?;
        Ok(())
    }
}

/// Drain the persistence channel into `sink`, logging failures. The task
/// ends when every sender is gone.
pub fn spawn_sink_writer(
    sink: Arc<dyn MeasurementSink>,
    mut rx: mpsc::Receiver<Reading>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(reading) = rx.recv().await {
            if let Err(err) = sink.insert_measurement(&reading).await {
                warn!(
                    device_id = %reading.device_id,
                    error = %err,
                    "failed to persist measurement"
                );
            }
        }
        debug!("sink writer stopped");
    })
}
