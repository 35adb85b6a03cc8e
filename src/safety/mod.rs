//! Hazard latching and the emergency stop/restart sequence.

pub mod emergency;
pub mod monitor;

pub use emergency::{
    EmergencyHandle, EmergencySequencer, InterlockGate, PreEmergencySnapshot, RestartReport,
    SequencerConfig,
};
pub use monitor::{Hazard, LatchEvent, SafetyMonitor};
