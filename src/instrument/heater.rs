//! TK4 temperature controllers.
//!
//! Six controllers share the Modbus line, one per unit address. Addresses 1..=4
//! drive heaters; 5 and 6 are plain thermocouple inputs.

use crate::protocol::modbus::{scale_register, RegisterBus};
use crate::snapshot::Reading;
use tracing::warn;

/// Process value block: raw value followed by its decimal places.
pub const PV_REGISTER: u16 = 0x03E8;
/// Setpoint, integer °C.
pub const SV_REGISTER: u16 = 0x0000;
/// Run/stop control register.
pub const RUN_STOP_REGISTER: u16 = 0x0032;
/// Run value.
pub const RUN: u16 = 0;
/// Stop value.
pub const STOP: u16 = 1;

/// TK4 controllers on the shared line, addressed by unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaterController;

impl HeaterController {
    /// Scaled process value of `unit`.
    pub async fn read_temperature<B>(&self, bus: &mut B, unit: u8) -> Reading
    where
        B: RegisterBus + ?Sized,
    {
        match bus.read_input_registers(unit, PV_REGISTER, 2).await {
            Ok(regs) if regs.len() == 2 => scale_register(regs[0], regs[1]),
            Ok(regs) => {
                warn!(unit, got = regs.len(), "TK4 returned wrong register count");
                Reading::NotConnected
            }
            Err(e) => {
                warn!(unit, error = %e, "TK4 temperature read failed");
                Reading::NotConnected
            }
        }
    }

    /// Write the setpoint. Fractional degrees are truncated.
    pub async fn set_setpoint<B>(&self, bus: &mut B, unit: u8, value: f64) -> bool
    where
        B: RegisterBus + ?Sized,
    {
        if !value.is_finite() || value < 0.0 || value > f64::from(u16::MAX) {
            warn!(unit, value, "TK4 setpoint out of register range");
            return false;
        }
        self.write(bus, unit, SV_REGISTER, value.trunc() as u16, "setpoint").await
    }

    /// Put `unit` in run mode.
    pub async fn start<B>(&self, bus: &mut B, unit: u8) -> bool
    where
        B: RegisterBus + ?Sized,
    {
        self.write(bus, unit, RUN_STOP_REGISTER, RUN, "run").await
    }

    /// Put `unit` in stop mode.
    pub async fn stop<B>(&self, bus: &mut B, unit: u8) -> bool
    where
        B: RegisterBus + ?Sized,
    {
        self.write(bus, unit, RUN_STOP_REGISTER, STOP, "stop").await
    }

    async fn write<B>(&self, bus: &mut B, unit: u8, register: u16, value: u16, what: &str) -> bool
    where
        B: RegisterBus + ?Sized,
    {
        match bus.write_register(unit, register, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!(unit, error = %e, "TK4 {what} write failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppResult, DaqError};
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Register file keyed by (unit, register); writes are recorded.
    #[derive(Default)]
    struct FakeBus {
        inputs: HashMap<(u8, u16), Vec<u16>>,
        writes: Vec<(u8, u16, u16)>,
    }

    #[async_trait]
    impl RegisterBus for FakeBus {
        async fn read_input_registers(&mut self, unit: u8, register: u16, _count: u16) -> AppResult<Vec<u16>> {
            self.inputs
                .get(&(unit, register))
                .cloned()
                .ok_or_else(|| DaqError::DeviceNotConnected(format!("unit {unit}")))
        }

        async fn write_register(&mut self, unit: u8, register: u16, value: u16) -> AppResult<()> {
            self.writes.push((unit, register, value));
            Ok(())
        }
    }

    #[tokio::test]
    async fn reads_scaled_temperature() {
        let mut bus = FakeBus::default();
        bus.inputs.insert((2, PV_REGISTER), vec![1853, 1]);
        let t = HeaterController.read_temperature(&mut bus, 2).await;
        assert_eq!(t, Reading::Value(185.3));
    }

    #[tokio::test]
    async fn open_thermocouple_is_not_connected() {
        let mut bus = FakeBus::default();
        bus.inputs.insert((1, PV_REGISTER), vec![31000, 1]);
        assert_eq!(HeaterController.read_temperature(&mut bus, 1).await, Reading::NotConnected);
    }

    #[tokio::test]
    async fn silent_unit_is_not_connected() {
        let mut bus = FakeBus::default();
        assert_eq!(HeaterController.read_temperature(&mut bus, 5).await, Reading::NotConnected);
    }

    #[tokio::test]
    async fn setpoint_and_run_stop_registers() {
        let mut bus = FakeBus::default();
        assert!(HeaterController.set_setpoint(&mut bus, 2, 250.7).await);
        assert!(HeaterController.start(&mut bus, 2).await);
        assert!(HeaterController.stop(&mut bus, 2).await);
        assert!(!HeaterController.set_setpoint(&mut bus, 2, -1.0).await);
        assert_eq!(
            bus.writes,
            vec![(2, SV_REGISTER, 250), (2, RUN_STOP_REGISTER, RUN), (2, RUN_STOP_REGISTER, STOP)]
        );
    }
}
