//! Instrument readings and the shared rig snapshot.
//!
//! The [`InstrumentSnapshot`] is owned and mutated by the bus worker only.
//! Everyone else (GUI, data logger, emergency sequencer) receives copies through
//! a `tokio::sync::watch` channel and never holds a mutable reference.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Temperature channels (TK4 addresses 1..=6).
pub const TEMPERATURE_CHANNELS: usize = 6;
/// Controllable heaters (TK4 addresses 1..=4).
pub const HEATER_COUNT: usize = 4;
/// PSM4 pressure channels.
pub const PRESSURE_CHANNELS: usize = 4;
/// Mass-flow controller channels.
pub const FLOW_CHANNELS: usize = 4;
/// Over-temperature hazard zones.
pub const TEMPERATURE_HAZARDS: usize = 3;
/// Over-pressure hazard zones.
pub const PRESSURE_HAZARDS: usize = 3;

/// Gas analyzer fields, in reply order.
pub const GAS_NAMES: [&str; 10] = [
    "CO", "CO2", "CH4", "CnHm", "H2", "O2", "C2H2", "C2H4", "HHV", "N2",
];

/// Latest value of one measured quantity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Reading {
    /// A decoded engineering value.
    Value(f64),
    /// The device did not answer, answered garbage, or reported a sensor fault.
    NotConnected,
    /// Never read yet.
    #[default]
    Unknown,
}

impl Reading {
    /// Numeric value, if any.
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Value(v) => Some(*v),
            _ => None,
        }
    }

    /// Holds a decoded value.
    pub fn is_value(&self) -> bool {
        matches!(self, Reading::Value(_))
    }

    /// Multiply a value reading; other states pass through.
    pub fn scaled(self, factor: f64) -> Reading {
        match self {
            Reading::Value(v) => Reading::Value(v * factor),
            other => other,
        }
    }
}

impl From<Option<f64>> for Reading {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => Reading::Value(v),
            _ => Reading::NotConnected,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Value(v) => write!(f, "{v:.2}"),
            Reading::NotConnected => f.write_str("NC"),
            Reading::Unknown => f.write_str("--"),
        }
    }
}

/// Which devices take part in the round-robin poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEnabled {
    /// Per TK4 address.
    #[serde(default = "all_on_6")]
    pub temperature: [bool; TEMPERATURE_CHANNELS],
    /// The PSM4.
    #[serde(default = "on")]
    pub pressure: bool,
    /// The power meter.
    #[serde(default = "on")]
    pub power_meter: bool,
    /// The mass-flow meter.
    #[serde(default = "on")]
    pub flow_meter: bool,
    /// Per flow controller channel.
    #[serde(default = "all_on_4")]
    pub flow_controller: [bool; FLOW_CHANNELS],
    /// The gas analyzer.
    #[serde(default = "on")]
    pub gas_analyzer: bool,
}

fn on() -> bool {
    true
}

fn all_on_6() -> [bool; TEMPERATURE_CHANNELS] {
    [true; TEMPERATURE_CHANNELS]
}

fn all_on_4() -> [bool; FLOW_CHANNELS] {
    [true; FLOW_CHANNELS]
}

impl Default for DeviceEnabled {
    fn default() -> Self {
        Self {
            temperature: all_on_6(),
            pressure: true,
            power_meter: true,
            flow_meter: true,
            flow_controller: all_on_4(),
            gas_analyzer: true,
        }
    }
}

/// Per-hazard latch flags. Index 0..3 per the zone tables in `safety::monitor`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyLatches {
    /// Over-temperature latch per zone.
    pub over_temperature: [bool; TEMPERATURE_HAZARDS],
    /// Over-pressure latch per PSM4 channel.
    pub over_pressure: [bool; PRESSURE_HAZARDS],
}

impl SafetyLatches {
    /// At least one latch is set.
    pub fn any(&self) -> bool {
        self.over_temperature.iter().chain(&self.over_pressure).any(|l| *l)
    }

    /// Reset every latch.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Alarm surface for the GUI / alarm-sound collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmState {
    /// Alarm is sounding.
    pub active: bool,
    /// Banner text.
    pub message: String,
}

impl AlarmState {
    /// An active alarm.
    pub fn raised(message: impl Into<String>) -> Self {
        Self {
            active: true,
            message: message.into(),
        }
    }

    /// An inactive banner.
    pub fn cleared(message: impl Into<String>) -> Self {
        Self {
            active: false,
            message: message.into(),
        }
    }
}

/// Aggregate of all latest readings and commanded state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSnapshot {
    /// TK4 process values, by address - 1.
    pub temperatures: [Reading; TEMPERATURE_CHANNELS],
    /// PSM4 channels, bar.
    pub pressures: [Reading; PRESSURE_CHANNELS],
    /// Active power.
    pub power: Reading,
    /// Integrated energy.
    pub energy: Reading,
    /// Mass-flow meter.
    pub flow_meter: Reading,
    /// Mass-flow controllers.
    pub flows: [Reading; FLOW_CHANNELS],
    /// Gas analyzer, in [`GAS_NAMES`] order.
    pub gases: [Reading; GAS_NAMES.len()],
    /// Last commanded setpoint per heater (°C).
    pub heater_setpoints: [f64; HEATER_COUNT],
    /// Heater run state as last commanded.
    pub heater_running: [bool; HEATER_COUNT],
    /// Last commanded setpoint per flow channel.
    pub flow_setpoints: [f64; FLOW_CHANNELS],
    /// Flow valve state as last commanded.
    pub flow_enabled: [bool; FLOW_CHANNELS],
    /// Devices in the poll.
    pub devices: DeviceEnabled,
    /// Hazard latches.
    pub latches: SafetyLatches,
    /// Number of completed poll passes.
    pub pass_count: u64,
    /// End of the last completed pass.
    pub updated_at: Option<DateTime<Local>>,
}

impl Default for InstrumentSnapshot {
    fn default() -> Self {
        Self {
            temperatures: [Reading::Unknown; TEMPERATURE_CHANNELS],
            pressures: [Reading::Unknown; PRESSURE_CHANNELS],
            power: Reading::Unknown,
            energy: Reading::Unknown,
            flow_meter: Reading::Unknown,
            flows: [Reading::Unknown; FLOW_CHANNELS],
            gases: [Reading::Unknown; GAS_NAMES.len()],
            heater_setpoints: [0.0; HEATER_COUNT],
            heater_running: [false; HEATER_COUNT],
            flow_setpoints: [0.0; FLOW_CHANNELS],
            flow_enabled: [false; FLOW_CHANNELS],
            devices: DeviceEnabled::default(),
            latches: SafetyLatches::default(),
            pass_count: 0,
            updated_at: None,
        }
    }
}

impl InstrumentSnapshot {
    /// Temperature of a TK4 address (1-based).
    pub fn temperature(&self, address: u8) -> Reading {
        address
            .checked_sub(1)
            .and_then(|i| self.temperatures.get(usize::from(i)))
            .copied()
            .unwrap_or(Reading::NotConnected)
    }
}

/// One row handed to the data logger after every full poll pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataRow {
    /// End of the pass.
    pub timestamp: DateTime<Local>,
    /// All six TK4 channels.
    pub temperatures: [Reading; TEMPERATURE_CHANNELS],
    /// Only the first three PSM4 channels are logged.
    pub pressures: [Reading; 3],
    /// Active power.
    pub power: Reading,
    /// Integrated energy.
    pub energy: Reading,
    /// Mass-flow meter.
    pub flow_meter: Reading,
    /// Mass-flow controllers.
    pub flows: [Reading; FLOW_CHANNELS],
    /// Gas analyzer fields.
    pub gases: [Reading; GAS_NAMES.len()],
}

impl DataRow {
    /// Column header, in record order.
    pub const HEADER: [&'static str; 27] = [
        "Timestamp", "Heater", "Preheater", "Reactor", "Temp1", "Temp2", "Temp3",
        "Pressure1", "Pressure2", "Pressure3", "Power", "Energy", "MFM_Flow",
        "MFC_CH4", "MFC_O2", "MFC_N2", "MFC_H2", "CO", "CO2", "CH4", "CnHm", "H2",
        "O2", "C2H2", "C2H4", "HHV", "N2",
    ];

    /// Placeholder for readings without a value. Columns are never omitted.
    pub const MISSING: &'static str = "NC";

    /// Row for the pass that ended at `timestamp`.
    pub fn from_snapshot(snapshot: &InstrumentSnapshot, timestamp: DateTime<Local>) -> Self {
        Self {
            timestamp,
            temperatures: snapshot.temperatures,
            pressures: [
                snapshot.pressures[0],
                snapshot.pressures[1],
                snapshot.pressures[2],
            ],
            power: snapshot.power,
            energy: snapshot.energy,
            flow_meter: snapshot.flow_meter,
            flows: snapshot.flows,
            gases: snapshot.gases,
        }
    }

    /// Render as string fields matching [`DataRow::HEADER`].
    pub fn to_record(&self) -> Vec<String> {
        let cell = |r: &Reading| match r.value() {
            Some(v) => format!("{v}"),
            None => Self::MISSING.to_string(),
        };
        let mut record = Vec::with_capacity(Self::HEADER.len());
        record.push(self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string());
        record.extend(self.temperatures.iter().map(cell));
        record.extend(self.pressures.iter().map(cell));
        record.push(cell(&self.power));
        record.push(cell(&self.energy));
        record.push(cell(&self.flow_meter));
        record.extend(self.flows.iter().map(cell));
        record.extend(self.gases.iter().map(cell));
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_snapshot_is_all_unknown() {
        let snap = InstrumentSnapshot::default();
        assert!(snap.temperatures.iter().all(|r| *r == Reading::Unknown));
        assert!(snap.gases.iter().all(|r| *r == Reading::Unknown));
        assert!(!snap.latches.any());
    }

    #[test]
    fn reading_from_option_rejects_nan() {
        assert_eq!(Reading::from(Some(f64::NAN)), Reading::NotConnected);
        assert_eq!(Reading::from(None), Reading::NotConnected);
        assert_eq!(Reading::from(Some(1.5)), Reading::Value(1.5));
    }

    #[test]
    fn temperature_lookup_by_address() {
        let mut snap = InstrumentSnapshot::default();
        snap.temperatures[1] = Reading::Value(42.0);
        assert_eq!(snap.temperature(2), Reading::Value(42.0));
        assert_eq!(snap.temperature(0), Reading::NotConnected);
        assert_eq!(snap.temperature(7), Reading::NotConnected);
    }

    #[test]
    fn data_row_never_omits_columns() {
        let mut snap = InstrumentSnapshot::default();
        snap.temperatures[0] = Reading::Value(21.5);
        snap.pressures[3] = Reading::Value(9.0);
        let row = DataRow::from_snapshot(&snap, Local::now());
        let record = row.to_record();

        assert_eq!(record.len(), DataRow::HEADER.len());
        assert_eq!(record[1], "21.5");
        assert_eq!(record[2], "NC");
        // fourth pressure channel is dropped by convention
        assert!(!record.contains(&"9".to_string()));
    }
}
