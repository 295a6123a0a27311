//! Gridpulse service entry point.
//!
//! Wires configuration, the upstream event source, the persistence sink, the
//! device registry with its idle reaper, and the HTTP API into one process.
//! Configuration problems are fatal before the listener opens; ctrl-c tears
//! the registry down so no upstream subscription outlives the service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use gridpulse::api::{self, AppState};
use gridpulse::config::{Settings, UpstreamMode};
use gridpulse::error::TelemetryError;
use gridpulse::logging;
use gridpulse::registry::DeviceRegistry;
use gridpulse::sink::{self, HttpSink, MeasurementSink, NullSink};
use gridpulse::subscription::BackoffPolicy;
use gridpulse::upstream::{EventSource, MqttEventSource, SimulatedEventSource};

/// Buffered readings between subscription tasks and the sink writer; beyond
/// this, readings are dropped rather than blocking telemetry serving.
const SINK_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser)]
#[command(name = "gridpulse")]
#[command(about = "Electrical telemetry lifecycle service", long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "config/gridpulse.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = Settings::load_from(&args.config)?;
    settings
        .validate()
        .map_err(TelemetryError::Configuration)?;
    logging::init(&settings.service)?;
    info!(config = %args.config.display(), "gridpulse starting");

    let source: Arc<dyn EventSource> = match settings.upstream.mode {
        UpstreamMode::Mqtt => {
            // validate() guarantees the section is present in mqtt mode.
            let mqtt = settings
                .upstream
                .mqtt
                .clone()
                .ok_or_else(|| TelemetryError::Configuration("missing mqtt settings".into()))?;
            info!(broker = %mqtt.broker_host, "using MQTT event source");
            Arc::new(MqttEventSource::new(mqtt))
        }
        UpstreamMode::Simulated => {
            info!("using simulated event source");
            Arc::new(SimulatedEventSource::new(
                settings.upstream.simulated.clone(),
            ))
        }
    };

    let measurement_sink: Arc<dyn MeasurementSink> = match &settings.storage {
        Some(storage) => {
            info!(endpoint = %storage.endpoint, "persisting measurements to storage API");
            Arc::new(HttpSink::new(storage)?)
        }
        None => {
            info!("no storage endpoint configured; measurements will not be persisted");
            Arc::new(NullSink)
        }
    };
    let (sink_tx, sink_rx) = mpsc::channel(SINK_CHANNEL_CAPACITY);
    let sink_writer = sink::spawn_sink_writer(measurement_sink, sink_rx);

    let registry = Arc::new(DeviceRegistry::new(
        source,
        sink_tx,
        settings.registry.inactivity_timeout,
        BackoffPolicy::default(),
    ));
    Arc::clone(&registry)
        .spawn_reaper(settings.registry.sweep_interval)
        .await;

    if let Some(device_id) = &settings.service.default_device {
        registry.register(device_id).await;
    }

    let app = api::router(AppState {
        registry: Arc::clone(&registry),
        api_key: settings.service.api_key.clone(),
        default_device: settings.service.default_device.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&settings.service.bind_addr).await?;
    info!(addr = %settings.service.bind_addr, "telemetry API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.shutdown().await;
    sink_writer.abort();
    info!("gridpulse stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
