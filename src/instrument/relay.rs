//! Eight-channel Modbus relay board.
//!
//! Channel `n` (1-based) is register `n - 1`. The group register toggles every
//! relay in one frame.

use crate::protocol::modbus::RegisterBus;
use std::time::Duration;
use tracing::{debug, warn};

/// Modbus unit address of the relay board.
pub const RELAY_UNIT: u8 = 8;
/// Relay channels on the board.
pub const RELAY_CHANNELS: u8 = 8;
/// Energise value for a channel register.
pub const ON: u16 = 0x0100;
/// Release value for a channel register.
pub const OFF: u16 = 0x0200;
/// Register addressing every channel at once.
pub const GROUP_REGISTER: u16 = 0x0000;
/// Group value energising every channel.
pub const GROUP_OPEN_ALL: u16 = 0x0700;
/// Group value releasing every channel.
pub const GROUP_CLOSE_ALL: u16 = 0x0800;

/// Start relay of heater `index` (0-based).
pub fn heater_start_relay(index: usize) -> u8 {
    (index * 2 + 1) as u8
}

/// Stop relay of heater `index` (0-based).
pub fn heater_stop_relay(index: usize) -> u8 {
    (index * 2 + 2) as u8
}

/// Odd channels start heaters, even channels stop them.
pub fn is_start_relay(channel: u8) -> bool {
    channel % 2 == 1
}

/// Heater index (0-based) switched off by stop relay `channel`.
pub fn stopped_heater(channel: u8) -> Option<usize> {
    (channel >= 2 && channel % 2 == 0 && channel <= RELAY_CHANNELS).then(|| usize::from(channel / 2 - 1))
}

/// The relay board on the shared Modbus line.
#[derive(Debug, Clone, Copy)]
pub struct RelayModule {
    unit: u8,
}

impl Default for RelayModule {
    fn default() -> Self {
        Self { unit: RELAY_UNIT }
    }
}

impl RelayModule {
    /// Energise `channel`, hold for `duration`, release.
    ///
    /// The release is attempted even if the energise write failed.
    pub async fn pulse<B>(&self, bus: &mut B, channel: u8, duration: Duration) -> bool
    where
        B: RegisterBus + ?Sized,
    {
        if !(1..=RELAY_CHANNELS).contains(&channel) {
            warn!(channel, "Relay channel out of range");
            return false;
        }
        let register = u16::from(channel - 1);
        let on = self.write(bus, register, ON).await;
        tokio::time::sleep(duration).await;
        let off = self.write(bus, register, OFF).await;
        debug!(channel, on, off, "Relay pulsed");
        on && off
    }

    /// Energise every channel with one group write.
    pub async fn open_all<B>(&self, bus: &mut B) -> bool
    where
        B: RegisterBus + ?Sized,
    {
        self.write(bus, GROUP_REGISTER, GROUP_OPEN_ALL).await
    }

    /// Release every channel with one group write.
    pub async fn close_all<B>(&self, bus: &mut B) -> bool
    where
        B: RegisterBus + ?Sized,
    {
        self.write(bus, GROUP_REGISTER, GROUP_CLOSE_ALL).await
    }

    async fn write<B>(&self, bus: &mut B, register: u16, value: u16) -> bool
    where
        B: RegisterBus + ?Sized,
    {
        match bus.write_register(self.unit, register, value).await {
            Ok(()) => true,
            Err(e) => {
                warn!(unit = self.unit, register, value, error = %e, "Relay write failed");
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

    #[derive(Default)]
    struct Recorder {
        writes: Vec<(u8, u16, u16)>,
        fail_on: Option<u16>,
    }

    #[async_trait]
    impl RegisterBus for Recorder {
        async fn read_input_registers(&mut self, _: u8, _: u16, _: u16) -> AppResult<Vec<u16>> {
            Ok(vec![])
        }

        async fn write_register(&mut self, unit: u8, register: u16, value: u16) -> AppResult<()> {
            self.writes.push((unit, register, value));
            if self.fail_on == Some(value) {
                return Err(DaqError::DeviceNotConnected("relay".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn heater_relay_pairs() {
        assert_eq!((heater_start_relay(0), heater_stop_relay(0)), (1, 2));
        assert_eq!((heater_start_relay(3), heater_stop_relay(3)), (7, 8));
        for index in 0..4 {
            assert!(is_start_relay(heater_start_relay(index)));
            assert!(!is_start_relay(heater_stop_relay(index)));
            assert_eq!(stopped_heater(heater_stop_relay(index)), Some(index));
            assert_eq!(stopped_heater(heater_start_relay(index)), None);
        }
        assert_eq!(stopped_heater(0), None);
        assert_eq!(stopped_heater(10), None);
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_writes_on_then_off() {
        let mut bus = Recorder::default();
        assert!(RelayModule::default().pulse(&mut bus, 3, Duration::from_secs(1)).await);
        assert_eq!(bus.writes, vec![(8, 2, ON), (8, 2, OFF)]);
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_releases_after_failed_energise() {
        let mut bus = Recorder {
            fail_on: Some(ON),
            ..Default::default()
        };
        assert!(!RelayModule::default().pulse(&mut bus, 1, Duration::from_secs(1)).await);
        assert_eq!(bus.writes.last(), Some(&(8, 0, OFF)));
    }

    #[tokio::test]
    async fn group_commands() {
        let mut bus = Recorder::default();
        let relays = RelayModule::default();
        assert!(relays.open_all(&mut bus).await);
        assert!(relays.close_all(&mut bus).await);
        assert!(!relays.pulse(&mut bus, 9, Duration::ZERO).await);
        assert_eq!(
            bus.writes,
            vec![(8, GROUP_REGISTER, GROUP_OPEN_ALL), (8, GROUP_REGISTER, GROUP_CLOSE_ALL)]
        );
    }
}
