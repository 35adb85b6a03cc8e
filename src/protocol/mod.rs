//! Wire codecs for the two protocol families sharing the RS-485 line.
//!
//! Each family exposes a small async trait ([`RegisterBus`], [`FramedBus`]) so the
//! device drivers in `crate::instrument` can be exercised against any
//! implementation, and a session type that borrows the line for one call.

pub mod ascii;
pub mod modbus;

pub use ascii::{AsciiFrame, AsciiSession, FramedBus, IdFormat};
pub use modbus::{ModbusSession, RegisterBus};
