//! Byte-level serial links.
//!
//! A [`SerialLink`] is one physical (or simulated) port. It knows nothing about
//! Modbus or ASCII framing; it opens with a set of [`LineSettings`], moves bytes,
//! and reports short reads as short reads. Codecs in `crate::protocol` decide
//! what a short read means.
//!
//! - [`SerialPortLink`]: real hardware via the `serialport` crate.
//! - [`MockLink`]: scripted responder with an event log, used by the simulator
//!   and the tests.

pub mod mock;
pub mod serial_adapter;
pub mod simulator;

pub use mock::{LinkEvent, LinkLog, MockLink};
pub use serial_adapter::{list_ports, SerialPortLink};
pub use simulator::RigSimulator;

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Parity bit setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Framing and timing of one open port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    /// Bits per second.
    pub baud_rate: u32,
    /// 7 or 8.
    pub data_bits: u8,
    /// 1 or 2.
    pub stop_bits: u8,
    /// Parity bit.
    pub parity: Parity,
    /// Read timeout for a single reply.
    pub timeout: Duration,
}

impl LineSettings {
    /// Modbus RTU on the shared RS-485 line: 9600 8N2, 200 ms.
    pub const fn modbus_rtu() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 2,
            parity: Parity::None,
            timeout: Duration::from_millis(200),
        }
    }

    /// ASCII flow protocol on the shared RS-485 line: 9600 8N1, 100 ms.
    pub const fn ascii_flow() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            timeout: Duration::from_millis(100),
        }
    }

    /// Power meter port: 9600 8N1, line-oriented text.
    pub const fn power_meter() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            timeout: Duration::from_secs(1),
        }
    }

    /// Gas analyzer port: 9600 8N1, 1 s.
    pub const fn gas_analyzer() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            timeout: Duration::from_secs(1),
        }
    }

    /// Same framing at another speed.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

/// One serial port, opened and closed explicitly.
///
/// Reads never fail on timeout: they return whatever arrived (possibly nothing).
/// Errors are reserved for a port that is closed or broken.
#[async_trait]
pub trait SerialLink: Send {
    /// Port identifier, e.g. `/dev/ttyUSB0` or `COM6`.
    fn port_name(&self) -> &str;

    /// An open call succeeded and no close followed.
    fn is_open(&self) -> bool;

    /// Open with the given settings. Opening an open link reopens it.
    async fn open(&mut self, settings: &LineSettings) -> AppResult<()>;

    /// Close the port. Closing a closed link is a no-op.
    async fn close(&mut self);

    /// Discard unread input.
    async fn clear_input(&mut self) -> AppResult<()>;

    /// Write and flush `data`.
    async fn write_all(&mut self, data: &[u8]) -> AppResult<()>;

    /// Read until `delimiter` (included), `max` bytes, or the read timeout.
    async fn read_until(&mut self, delimiter: u8, max: usize) -> AppResult<Vec<u8>>;

    /// Read up to `len` bytes, stopping early only on the read timeout.
    async fn read_up_to(&mut self, len: usize) -> AppResult<Vec<u8>>;
}

/// Make sure `link` is open, trying exactly one reopen if it is not.
///
/// Returns `true` when the port had to be (re)opened, so callers can re-run
/// any device configuration.
pub async fn ensure_open(link: &mut dyn SerialLink, settings: &LineSettings) -> AppResult<bool> {
    if link.is_open() {
        return Ok(false);
    }
    debug!(port = link.port_name(), "Port closed, attempting reconnect");
    match link.open(settings).await {
        Ok(()) => Ok(true),
        Err(e) => {
            warn!(port = link.port_name(), error = %e, "Reconnect failed");
            Err(e)
        }
    }
}
