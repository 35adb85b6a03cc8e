//! Gas analyzer on its own serial port.
//!
//! A fixed four-byte query returns ten big-endian u16 concentrations, each in
//! hundredths. Some firmware wraps the block in a three-byte header and a
//! trailing checksum; the bare 20-byte block is accepted too.

use crate::adapters::{ensure_open, LineSettings, SerialLink};
use crate::error::{AppResult, DecodeError};
use crate::snapshot::{Reading, GAS_NAMES};
use std::time::Duration;
use tracing::warn;

/// Fixed read request.
pub const QUERY: [u8; 4] = [0x11, 0x01, 0x01, 0xED];

const BLOCK_LEN: usize = 2 * GAS_NAMES.len();
const HEADER_LEN: usize = 3;
const MAX_REPLY: usize = 32;

/// Time the analyzer needs before its reply is complete.
const REPLY_DELAY: Duration = Duration::from_millis(200);

/// Decode ten big-endian hundredths, with or without the three-byte header.
pub fn decode_gas_block(reply: &[u8]) -> Result<[f64; GAS_NAMES.len()], DecodeError> {
    let block = if reply.len() >= HEADER_LEN + BLOCK_LEN {
        &reply[HEADER_LEN..HEADER_LEN + BLOCK_LEN]
    } else if reply.len() == BLOCK_LEN {
        reply
    } else {
        return Err(DecodeError::UnexpectedLength(reply.len()));
    };
    let mut values = [0.0; GAS_NAMES.len()];
    for (slot, pair) in values.iter_mut().zip(block.chunks_exact(2)) {
        *slot = f64::from(u16::from_be_bytes([pair[0], pair[1]])) / 100.0;
    }
    Ok(values)
}

/// Gas analyzer driver. Owns its port exclusively.
pub struct GasAnalyzer {
    link: Box<dyn SerialLink>,
    settings: LineSettings,
}

impl GasAnalyzer {
    /// Nothing is opened until the first read.
    pub fn new(link: Box<dyn SerialLink>, settings: LineSettings) -> Self {
        Self { link, settings }
    }

    async fn exchange(&mut self) -> AppResult<[f64; GAS_NAMES.len()]> {
        ensure_open(self.link.as_mut(), &self.settings).await?;
        self.link.clear_input().await?;
        self.link.write_all(&QUERY).await?;
        tokio::time::sleep(REPLY_DELAY).await;
        let reply = self.link.read_up_to(MAX_REPLY).await?;
        Ok(decode_gas_block(&reply)?)
    }

    /// All fields, or all `NotConnected` on failure.
    pub async fn read_gases(&mut self) -> [Reading; GAS_NAMES.len()] {
        match self.exchange().await {
            Ok(values) => values.map(Reading::Value),
            Err(e) => {
                warn!(error = %e, "Gas analyzer read failed");
                if e.is_disconnect() {
                    self.link.close().await;
                }
                [Reading::NotConnected; GAS_NAMES.len()]
            }
        }
    }

    /// Release the port.
    pub async fn close(&mut self) {
        self.link.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockLink;

    fn block() -> Vec<u8> {
        (1..=10u16).flat_map(|i| (i * 150).to_be_bytes()).collect()
    }

    #[test]
    fn decodes_framed_and_bare_blocks() {
        let mut framed = vec![0x16, 0x15, 0x01];
        framed.extend(block());
        framed.push(0x00);
        let values = decode_gas_block(&framed).unwrap();
        assert_eq!(values[0], 1.5);
        assert_eq!(values[9], 15.0);
        assert_eq!(decode_gas_block(&block()).unwrap(), values);
    }

    #[test]
    fn rejects_other_lengths() {
        assert_eq!(decode_gas_block(&[0; 21]), Err(DecodeError::UnexpectedLength(21)));
        assert_eq!(decode_gas_block(&[]), Err(DecodeError::UnexpectedLength(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_analyzer_is_not_connected() {
        let mut gas = GasAnalyzer::new(Box::new(MockLink::silent("gas")), LineSettings::gas_analyzer());
        assert!(gas.read_gases().await.iter().all(|r| *r == Reading::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn reads_ten_gases() {
        let link = MockLink::new("gas", |_, req| (req == QUERY.as_slice()).then(block));
        let mut gas = GasAnalyzer::new(Box::new(link), LineSettings::gas_analyzer());
        let readings = gas.read_gases().await;
        assert_eq!(readings[4], Reading::Value(7.5));
    }
}
