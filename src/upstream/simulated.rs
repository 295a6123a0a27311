//! Simulated event source.
//!
//! Generates plausible polyphase readings on a fixed interval so the full
//! pipeline (decode, registry, API, sink) can run without a broker or real
//! hardware. Values are nominal voltage/frequency with a few percent of
//! random noise, the same shape a real meter reports.

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::config::SimulatedSettings;
use crate::decode::RawEvent;
use crate::error::UpstreamError;
use crate::upstream::{EventSource, EventStream};

/// Emits synthetic telemetry for any device id it is asked to open.
pub struct SimulatedEventSource {
    settings: SimulatedSettings,
}

impl SimulatedEventSource {
    pub fn new(settings: SimulatedSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl EventSource for SimulatedEventSource {
    async fn open(&self, device_id: &str) -> Result<Box<dyn EventStream>, UpstreamError> {
        let mut ticker = interval(self.settings.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ok(Box::new(SimulatedEventStream {
            device_id: device_id.to_string(),
            phases: self.settings.phases,
            nominal_voltage: self.settings.nominal_voltage,
            ticker,
        }))
    }
}

struct SimulatedEventStream {
    device_id: String,
    phases: usize,
    nominal_voltage: f64,
    ticker: Interval,
}

impl SimulatedEventStream {
    fn sample(&self) -> serde_json::Value {
        let mut rng = rand::thread_rng();
        let mut body = serde_json::Map::new();
        for number in 1..=self.phases {
            let voltage = self.nominal_voltage * (1.0 + rng.gen_range(-0.01..0.01));
            let current = rng.gen_range(0.5..16.0);
            let power_factor = rng.gen_range(0.92..1.0);
            body.insert(
                format!("phase{number}"),
                json!({
                    "v": voltage,
                    "i": current,
                    "p": voltage * current * power_factor,
                    "f": 50.0 + rng.gen_range(-0.05..0.05),
                    "pf": power_factor,
                }),
            );
        }
        serde_json::Value::Object(body)
    }
}

#[async_trait]
impl EventStream for SimulatedEventStream {
    async fn next_event(&mut self) -> Option<Result<RawEvent, UpstreamError>> {
        self.ticker.tick().await;
        let body = self.sample();
        Some(Ok(RawEvent::telemetry(&self.device_id, &body)))
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;

    #[tokio::test]
    async fn generated_events_decode_cleanly() {
        let source = SimulatedEventSource::new(SimulatedSettings {
            sample_interval: std::time::Duration::from_millis(1),
            phases: 3,
            nominal_voltage: 230.0,
        });
        let mut stream = source.open("sim-meter").await.expect("open");

        let event = stream
            .next_event()
            .await
            .expect("stream yields")
            .expect("no error");
        let reading = decode(&event, "sim-meter").expect("decodes");
        assert_eq!(reading.phase_count(), 3);
        let volts = reading.phases[0].and_then(|p| p.voltage).unwrap_or(0.0);
        assert!((volts - 230.0).abs() < 230.0 * 0.02);
    }
}
