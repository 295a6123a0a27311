//! Telemetry data model.
//!
//! A device reports up to [`MAX_PHASES`] electrical phases per reading. Every
//! measured quantity is optional at two levels: a phase may be entirely
//! absent from a reading (slot is `None`), and a present phase may omit
//! individual quantities. Zero and absent are distinct — a phase reporting
//! `0.0 V` is a measurement, a missing phase is not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of measurement phases a device can report.
pub const MAX_PHASES: usize = 7;

/// Measurements for a single electrical phase. Every field is optional;
/// devices report only the quantities they meter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseReading {
    /// Voltage in volts.
    pub voltage: Option<f64>,
    /// Current in amperes.
    pub current: Option<f64>,
    /// Active power in watts.
    pub power: Option<f64>,
    /// Line frequency in hertz.
    pub frequency: Option<f64>,
    /// Power factor, 0..=1.
    pub power_factor: Option<f64>,
}

impl PhaseReading {
    /// True when the phase carries no measurement at all. An all-empty phase
    /// is treated as absent, never stored as a zero-filled slot.
    pub fn is_empty(&self) -> bool {
        self.voltage.is_none()
            && self.current.is_none()
            && self.power.is_none()
            && self.frequency.is_none()
            && self.power_factor.is_none()
    }
}

/// One decoded telemetry snapshot from a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Identity of the reporting device.
    pub device_id: String,
    /// When the device captured the measurement.
    pub captured_at: DateTime<Utc>,
    /// Fixed phase slots; index = phase number − 1.
    pub phases: [Option<PhaseReading>; MAX_PHASES],
}

impl Reading {
    /// Number of phase slots up to and including the highest present phase.
    pub fn phase_count(&self) -> usize {
        self.phases
            .iter()
            .rposition(Option::is_some)
            .map_or(0, |idx| idx + 1)
    }

    /// Per-phase view of one quantity, trimmed past the highest present
    /// phase. Gaps below that stay as `None` so indices keep meaning phase
    /// number − 1.
    fn column(&self, field: impl Fn(&PhaseReading) -> Option<f64>) -> Vec<Option<f64>> {
        self.phases[..self.phase_count()]
            .iter()
            .map(|slot| slot.as_ref().and_then(&field))
            .collect()
    }

    /// Per-phase voltages for the query API.
    pub fn voltages(&self) -> Vec<Option<f64>> {
        self.column(|p| p.voltage)
    }

    /// Per-phase currents for the query API.
    pub fn currents(&self) -> Vec<Option<f64>> {
        self.column(|p| p.current)
    }

    /// Per-phase active power for the query API.
    pub fn powers(&self) -> Vec<Option<f64>> {
        self.column(|p| p.power)
    }

    /// Per-phase line frequency for the query API.
    pub fn frequencies(&self) -> Vec<Option<f64>> {
        self.column(|p| p.frequency)
    }

    /// Fixed-width column for the persistence sink: all [`MAX_PHASES`] slots,
    /// unused ones zero-filled per the storage contract.
    pub fn sink_column(&self, field: impl Fn(&PhaseReading) -> Option<f64>) -> [f64; MAX_PHASES] {
        let mut out = [0.0; MAX_PHASES];
        for (slot, value) in self.phases.iter().zip(out.iter_mut()) {
            *value = slot.as_ref().and_then(&field).unwrap_or(0.0);
        }
        out
    }

    /// Grid frequency for the persistence sink: the first phase reporting
    /// one (line frequency is common to all phases), 0.0 when none does.
    pub fn grid_frequency(&self) -> f64 {
        self.phases
            .iter()
            .flatten()
            .find_map(|p| p.frequency)
            .unwrap_or(0.0)
    }
}
