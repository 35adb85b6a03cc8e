//! Hazard latches.
//!
//! Evaluated by the bus worker after every full poll pass. Only a `Value`
//! reading can trip a latch; a missing sensor never raises an alarm.

use crate::config::LimitConfig;
use crate::snapshot::{InstrumentSnapshot, Reading, PRESSURE_HAZARDS, TEMPERATURE_HAZARDS};
use std::fmt;

/// TK4 address and label of each over-temperature zone, in latch order.
pub const TEMPERATURE_ZONES: [(u8, &str); TEMPERATURE_HAZARDS] =
    [(2, "Heater 1"), (1, "Heater 2 coil"), (3, "Reactor")];

/// A supervised condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hazard {
    /// Index into [`TEMPERATURE_ZONES`].
    OverTemperature(usize),
    /// PSM4 channel index (0-based).
    OverPressure(usize),
}

impl fmt::Display for Hazard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hazard::OverTemperature(zone) => {
                let label = TEMPERATURE_ZONES.get(*zone).map_or("unknown zone", |z| z.1);
                write!(f, "overtemperature at {label}")
            }
            Hazard::OverPressure(zone) => write!(f, "overpressure at sensor {}", zone + 1),
        }
    }
}

/// A latch transition.
#[derive(Debug, Clone, PartialEq)]
pub enum LatchEvent {
    /// A reading went above its limit.
    Tripped {
        /// Which hazard.
        hazard: Hazard,
        /// The offending reading.
        value: f64,
        /// The configured limit.
        limit: f64,
    },
    /// The reading is back within its limit or the sensor went away.
    Cleared {
        /// Which hazard.
        hazard: Hazard,
    },
}

impl LatchEvent {
    /// Alarm banner text.
    pub fn message(&self) -> String {
        match self {
            LatchEvent::Tripped { hazard, value, limit } => {
                format!("ALARM: {hazard} ({value:.1} > {limit:.1})")
            }
            LatchEvent::Cleared { hazard } => format!("Cleared: {hazard}"),
        }
    }
}

/// Limit checks run after every poll pass. The default has no limits.
#[derive(Debug, Clone, Default)]
pub struct SafetyMonitor {
    temperature_limits: [Option<f64>; TEMPERATURE_HAZARDS],
    pressure_limits: [Option<f64>; PRESSURE_HAZARDS],
}

impl SafetyMonitor {
    /// `None` disables a hazard.
    pub fn new(
        temperature_limits: [Option<f64>; TEMPERATURE_HAZARDS],
        pressure_limits: [Option<f64>; PRESSURE_HAZARDS],
    ) -> Self {
        Self {
            temperature_limits,
            pressure_limits,
        }
    }

    /// Limits from the settings.
    pub fn from_limits(limits: &LimitConfig) -> Self {
        Self::new(limits.temperature_limits(), limits.pressure_limits())
    }

    /// Update the snapshot's latches from its readings.
    ///
    /// Returns the transitions in evaluation order. At most one trip is
    /// reported per pass: evaluation stops at the first new breach.
    pub fn evaluate(&self, snapshot: &mut InstrumentSnapshot) -> Vec<LatchEvent> {
        let temperature = TEMPERATURE_ZONES.map(|(address, _)| snapshot.temperature(address));
        let pressure = [snapshot.pressures[0], snapshot.pressures[1], snapshot.pressures[2]];

        let checks = temperature
            .into_iter()
            .zip(self.temperature_limits)
            .enumerate()
            .map(|(zone, (reading, limit))| (Hazard::OverTemperature(zone), reading, limit))
            .chain(
                pressure
                    .into_iter()
                    .zip(self.pressure_limits)
                    .enumerate()
                    .map(|(zone, (reading, limit))| (Hazard::OverPressure(zone), reading, limit)),
            );

        let mut events = Vec::new();
        for (hazard, reading, limit) in checks {
            let Some(limit) = limit else { continue };
            let latch = match hazard {
                Hazard::OverTemperature(zone) => &mut snapshot.latches.over_temperature[zone],
                Hazard::OverPressure(zone) => &mut snapshot.latches.over_pressure[zone],
            };
            match reading {
                Reading::Value(value) if value > limit => {
                    if !*latch {
                        *latch = true;
                        events.push(LatchEvent::Tripped { hazard, value, limit });
                        return events;
                    }
                }
                Reading::Value(_) | Reading::NotConnected => {
                    if *latch {
                        *latch = false;
                        events.push(LatchEvent::Cleared { hazard });
                    }
                }
                Reading::Unknown => {}
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> SafetyMonitor {
        SafetyMonitor::new([Some(180.0), Some(300.0), None], [Some(5.0), None, None])
    }

    #[test]
    fn trips_once_then_clears() {
        let monitor = monitor();
        let mut snap = InstrumentSnapshot::default();

        snap.temperatures[1] = Reading::Value(185.0);
        let events = monitor.evaluate(&mut snap);
        assert_eq!(
            events,
            vec![LatchEvent::Tripped {
                hazard: Hazard::OverTemperature(0),
                value: 185.0,
                limit: 180.0
            }]
        );
        assert!(snap.latches.over_temperature[0]);

        // still over: latched, no new trip
        snap.temperatures[1] = Reading::Value(190.0);
        assert!(monitor.evaluate(&mut snap).is_empty());

        snap.temperatures[1] = Reading::Value(175.0);
        assert_eq!(
            monitor.evaluate(&mut snap),
            vec![LatchEvent::Cleared {
                hazard: Hazard::OverTemperature(0)
            }]
        );
        assert!(!snap.latches.any());
    }

    #[test]
    fn limit_is_strict() {
        let mut snap = InstrumentSnapshot::default();
        snap.temperatures[1] = Reading::Value(180.0);
        assert!(monitor().evaluate(&mut snap).is_empty());
    }

    #[test]
    fn missing_data_never_trips() {
        let mut snap = InstrumentSnapshot::default();
        snap.temperatures[1] = Reading::NotConnected;
        snap.pressures[0] = Reading::Unknown;
        assert!(monitor().evaluate(&mut snap).is_empty());
    }

    #[test]
    fn sensor_loss_clears_latch() {
        let mut snap = InstrumentSnapshot::default();
        snap.latches.over_pressure[0] = true;
        snap.pressures[0] = Reading::NotConnected;
        let events = monitor().evaluate(&mut snap);
        assert_eq!(events, vec![LatchEvent::Cleared { hazard: Hazard::OverPressure(0) }]);
    }

    #[test]
    fn first_breach_short_circuits() {
        let mut snap = InstrumentSnapshot::default();
        snap.temperatures[1] = Reading::Value(200.0);
        snap.pressures[0] = Reading::Value(9.0);
        let events = monitor().evaluate(&mut snap);
        assert_eq!(events.len(), 1);
        assert!(!snap.latches.over_pressure[0]);

        // next pass reaches the pressure zone
        let events = monitor().evaluate(&mut snap);
        assert!(matches!(
            events.as_slice(),
            [LatchEvent::Tripped { hazard: Hazard::OverPressure(0), .. }]
        ));
    }

    #[test]
    fn unconfigured_zone_is_ignored() {
        let mut snap = InstrumentSnapshot::default();
        snap.temperatures[2] = Reading::Value(10_000.0);
        assert!(monitor().evaluate(&mut snap).is_empty());
    }
}
