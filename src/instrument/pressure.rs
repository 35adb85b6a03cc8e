//! PSM4 four-channel pressure module.

use crate::protocol::modbus::{scale_register, RegisterBus};
use crate::snapshot::{Reading, PRESSURE_CHANNELS};
use tracing::warn;

/// Modbus unit address of the PSM4.
pub const PSM4_UNIT: u8 = 7;

/// Per-channel register block; the value pair sits one register past the base.
pub const CHANNEL_BASES: [u16; PRESSURE_CHANNELS] = [0x03E8, 0x03ED, 0x03F2, 0x03F7];

/// Readings above this are a sensor fault, not a real pressure.
pub const MAX_PLAUSIBLE_BAR: f64 = 20.0;

/// Decode one channel's `(raw, decimals)` pair into bar.
pub fn decode_pressure(raw: u16, decimals: u16) -> Reading {
    match scale_register(raw, decimals).scaled(0.1) {
        Reading::Value(v) if v > MAX_PLAUSIBLE_BAR => Reading::NotConnected,
        Reading::Value(v) => Reading::Value((v * 100.0).round() / 100.0),
        other => other,
    }
}

/// The PSM4 on the shared line.
#[derive(Debug, Clone, Copy)]
pub struct PressureModule {
    unit: u8,
}

impl Default for PressureModule {
    fn default() -> Self {
        Self { unit: PSM4_UNIT }
    }
}

impl PressureModule {
    /// Read every channel. A failing channel does not affect the others.
    pub async fn read_all_pressures<B>(&self, bus: &mut B) -> [Reading; PRESSURE_CHANNELS]
    where
        B: RegisterBus + ?Sized,
    {
        let mut out = [Reading::NotConnected; PRESSURE_CHANNELS];
        for (channel, base) in CHANNEL_BASES.iter().enumerate() {
            out[channel] = match bus.read_input_registers(self.unit, base + 1, 2).await {
                Ok(regs) if regs.len() == 2 => decode_pressure(regs[0], regs[1]),
                Ok(_) => Reading::NotConnected,
                Err(e) => {
                    warn!(unit = self.unit, channel = channel + 1, error = %e, "PSM4 read failed");
                    Reading::NotConnected
                }
            };
        }
        out
    }
}
