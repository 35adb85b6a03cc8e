//! Four-channel mass-flow controller on the ASCII protocol.
//!
//! Each channel answers to its own two-digit decimal id.

use crate::error::DaqError;
use crate::protocol::ascii::{check_ack, encode_f32, parse_float_reply, AsciiFrame, FramedBus, IdFormat};
use crate::snapshot::{Reading, FLOW_CHANNELS};
use tracing::warn;

const READ: &str = "03";
const FLOW_ADDRESS: &str = "0038";
const WRITE: &str = "01";
const SETPOINT_ADDRESS: &str = "07";
const VALVE: &str = "58";
const VALVE_ADDRESS: &str = "02";

/// Minimum length of a flow read reply.
const READ_REPLY_LEN: usize = 15;

/// The four mass-flow controllers, addressed by channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowController;

impl FlowController {
    fn frame(channel: u8, command: &'static str, address: &'static str) -> AsciiFrame {
        AsciiFrame::new(channel, IdFormat::Decimal, command, address)
    }

    /// Current flow of `channel`.
    pub async fn read_flow<B>(&self, bus: &mut B, channel: u8) -> Reading
    where
        B: FramedBus + ?Sized,
    {
        let reply = match bus.transact(&Self::frame(channel, READ, FLOW_ADDRESS)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(channel, error = %e, "MFC read failed");
                return Reading::NotConnected;
            }
        };
        match parse_float_reply(&reply, READ_REPLY_LEN) {
            Ok(v) => Reading::from(Some(f64::from(v))),
            Err(e) => {
                warn!(channel, error = %e, "MFC reply rejected");
                Reading::NotConnected
            }
        }
    }

    /// Every channel in turn.
    pub async fn read_all<B>(&self, bus: &mut B) -> [Reading; FLOW_CHANNELS]
    where
        B: FramedBus + ?Sized,
    {
        let mut out = [Reading::NotConnected; FLOW_CHANNELS];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = self.read_flow(bus, (i + 1) as u8).await;
        }
        out
    }

    /// Write a setpoint; `true` when acknowledged.
    pub async fn set_flow<B>(&self, bus: &mut B, channel: u8, value: f64) -> bool
    where
        B: FramedBus + ?Sized,
    {
        let frame = Self::frame(channel, WRITE, SETPOINT_ADDRESS).with_data(encode_f32(value as f32));
        self.acknowledged(bus, &frame, &format!(":{channel:02}81")).await
    }

    /// Open or close the valve; `true` when acknowledged.
    pub async fn set_enabled<B>(&self, bus: &mut B, channel: u8, enabled: bool) -> bool
    where
        B: FramedBus + ?Sized,
    {
        let data = if enabled { "01" } else { "00" };
        let frame = Self::frame(channel, VALVE, VALVE_ADDRESS).with_data(data);
        self.acknowledged(bus, &frame, &format!(":{channel:02}D8")).await
    }

    async fn acknowledged<B>(&self, bus: &mut B, frame: &AsciiFrame, prefix: &str) -> bool
    where
        B: FramedBus + ?Sized,
    {
        let result = match bus.transact(frame).await {
            Ok(reply) => check_ack(&reply, prefix).map_err(DaqError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(channel = frame.device_id, error = %e, "MFC write failed");
                false
            }
        }
    }
}
