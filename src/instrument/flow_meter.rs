//! Single-channel mass-flow meter on the ASCII protocol (hex device id).

use crate::error::DaqError;
use crate::protocol::ascii::{parse_float_reply, AsciiFrame, FramedBus, IdFormat};
use crate::snapshot::Reading;
use tracing::warn;

/// Device id of the meter, written as hex.
pub const MFM_DEVICE_ID: u8 = 1;
const READ_REPLY_LEN: usize = 16;

/// The mass-flow meter on the shared line.
#[derive(Debug, Clone, Copy)]
pub struct FlowMeter {
    device_id: u8,
}

impl Default for FlowMeter {
    fn default() -> Self {
        Self {
            device_id: MFM_DEVICE_ID,
        }
    }
}

impl FlowMeter {
    /// Current flow, or `NotConnected` on any failure.
    pub async fn read_flow<B>(&self, bus: &mut B) -> Reading
    where
        B: FramedBus + ?Sized,
    {
        let frame = AsciiFrame::new(self.device_id, IdFormat::Hex, "03", "00");
        let decoded = match bus.transact(&frame).await {
            Ok(reply) => parse_float_reply(&reply, READ_REPLY_LEN).map_err(DaqError::from),
            Err(e) => Err(e),
        };
        match decoded {
            Ok(v) => Reading::from(Some(f64::from(v))),
            Err(e) => {
                warn!(device = self.device_id, error = %e, "MFM read failed");
                Reading::NotConnected
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppResult;
    use async_trait::async_trait;

    struct Canned(&'static [u8]);

    #[async_trait]
    impl FramedBus for Canned {
        async fn transact(&mut self, frame: &AsciiFrame) -> AppResult<Vec<u8>> {
            assert_eq!(frame.body(), ":010300");
            Ok(self.0.to_vec())
        }
    }

    #[tokio::test]
    async fn decodes_meter_reply() {
        let mut bus = Canned(b":010304412000003B\r");
        assert_eq!(FlowMeter::default().read_flow(&mut bus).await, Reading::Value(10.0));
    }

    #[tokio::test]
    async fn short_reply_is_not_connected() {
        let mut bus = Canned(b":0103044120\r");
        assert_eq!(FlowMeter::default().read_flow(&mut bus).await, Reading::NotConnected);
    }
}
