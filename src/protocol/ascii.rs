//! ASCII framing for the mass-flow controllers and the mass-flow meter.
//!
//! ```text
//! ':' + device-id + command + address + data + checksum + '\r'
//! ```
//!
//! The checksum is the XOR of every preceding character (colon included),
//! rendered as two uppercase hex digits. Floats travel as the eight uppercase
//! hex digits of their big-endian IEEE-754 single-precision bits.

use crate::adapters::{ensure_open, LineSettings, SerialLink};
use crate::error::{AppResult, DaqError, DecodeError};
use async_trait::async_trait;
use tracing::trace;

/// First byte of every frame.
pub const START: u8 = b':';
/// Last byte of every frame.
pub const TERMINATOR: u8 = b'\r';

/// Longest reply any device on the line sends.
const MAX_REPLY: usize = 64;

/// Start offset of the 8-digit float payload in a read reply.
const PAYLOAD: std::ops::Range<usize> = 7..15;

/// How the device id is written into the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    /// Two decimal digits (flow controller channels).
    Decimal,
    /// Two uppercase hex digits (flow meter).
    Hex,
}

/// One request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsciiFrame {
    /// Device id on the line.
    pub device_id: u8,
    /// How `device_id` is rendered.
    pub id_format: IdFormat,
    /// Two-character command code.
    pub command: &'static str,
    /// Register or parameter address.
    pub address: &'static str,
    /// Payload, usually an encoded float.
    pub data: String,
}

impl AsciiFrame {
    /// A frame without payload.
    pub fn new(device_id: u8, id_format: IdFormat, command: &'static str, address: &'static str) -> Self {
        Self {
            device_id,
            id_format,
            command,
            address,
            data: String::new(),
        }
    }

    /// Attach a payload.
    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }

    /// The device id as it appears on the wire.
    pub fn id(&self) -> String {
        match self.id_format {
            IdFormat::Decimal => format!("{:02}", self.device_id),
            IdFormat::Hex => format!("{:02X}", self.device_id),
        }
    }

    /// Everything the checksum covers.
    pub fn body(&self) -> String {
        format!(":{}{}{}{}", self.id(), self.command, self.address, self.data)
    }

    /// Body, checksum and terminator.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        let mut frame = format!("{body}{:02X}", checksum(body.as_bytes())).into_bytes();
        frame.push(TERMINATOR);
        frame
    }
}

/// XOR over the 7-bit characters of `text`.
pub fn checksum(text: &[u8]) -> u8 {
    text.iter().fold(0u8, |acc, b| acc ^ (b & 0x7F))
}

/// Eight uppercase hex digits of the IEEE-754 bits.
pub fn encode_f32(value: f32) -> String {
    format!("{:08X}", value.to_bits())
}

/// Inverse of [`encode_f32`]. Anything but exactly eight hex digits is rejected.
pub fn decode_f32(hex: &str) -> Result<f32, DecodeError> {
    if hex.len() != 8 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DecodeError::InvalidHex(hex.to_string()));
    }
    u32::from_str_radix(hex, 16)
        .map(f32::from_bits)
        .map_err(|_| DecodeError::InvalidHex(hex.to_string()))
}

/// Check the trailing two-digit checksum of a reply long enough to carry one.
///
/// Shorter replies end right after the payload and pass unchecked.
pub fn verify_checksum(reply: &[u8]) -> Result<(), DecodeError> {
    let frame = reply.strip_suffix(&[TERMINATOR]).unwrap_or(reply);
    if frame.len() < PAYLOAD.end + 2 {
        return Ok(());
    }
    let (body, received) = frame.split_at(frame.len() - 2);
    let computed = checksum(body);
    let parsed = std::str::from_utf8(received)
        .ok()
        .filter(|t| t.bytes().all(|b| b.is_ascii_hexdigit()))
        .and_then(|t| u8::from_str_radix(t, 16).ok());
    if parsed == Some(computed) {
        Ok(())
    } else {
        Err(DecodeError::BadChecksum {
            computed,
            received: String::from_utf8_lossy(received).into_owned(),
        })
    }
}

/// Extract the float payload of a read reply at least `min_len` bytes long.
pub fn parse_float_reply(reply: &[u8], min_len: usize) -> Result<f32, DecodeError> {
    if reply.first() != Some(&START) {
        return Err(DecodeError::MissingStartColon);
    }
    let need = min_len.max(PAYLOAD.end);
    if reply.len() < need {
        return Err(DecodeError::Truncated {
            got: reply.len(),
            need,
        });
    }
    let hex = std::str::from_utf8(&reply[PAYLOAD])
        .map_err(|_| DecodeError::InvalidHex(String::from_utf8_lossy(&reply[PAYLOAD]).into_owned()))?;
    let value = decode_f32(hex)?;
    verify_checksum(reply)?;
    Ok(value)
}

/// A write is acknowledged when the reply starts with `prefix`.
pub fn check_ack(reply: &[u8], prefix: &str) -> Result<(), DecodeError> {
    if reply.starts_with(prefix.as_bytes()) {
        Ok(())
    } else {
        Err(DecodeError::NotAcknowledged(prefix.to_string()))
    }
}

/// Request/reply access to an ASCII line.
#[async_trait]
pub trait FramedBus: Send {
    /// Send `frame` and return the raw reply up to and including `'\r'`.
    async fn transact(&mut self, frame: &AsciiFrame) -> AppResult<Vec<u8>>;
}

/// An ASCII session borrowing the shared line for one transaction.
pub struct AsciiSession<'a> {
    link: &'a mut dyn SerialLink,
    settings: LineSettings,
}

impl<'a> AsciiSession<'a> {
    /// Borrow `link`, reopening it with `settings` if needed.
    pub fn new(link: &'a mut dyn SerialLink, settings: LineSettings) -> Self {
        Self { link, settings }
    }
}

#[async_trait]
impl FramedBus for AsciiSession<'_> {
    async fn transact(&mut self, frame: &AsciiFrame) -> AppResult<Vec<u8>> {
        ensure_open(self.link, &self.settings).await?;
        self.link.clear_input().await?;
        let bytes = frame.encode();
        trace!(frame = %String::from_utf8_lossy(&bytes).trim_end(), "ascii tx");
        self.link.write_all(&bytes).await?;
        let reply = self.link.read_until(TERMINATOR, MAX_REPLY).await?;
        if reply.is_empty() {
            return Err(DaqError::DeviceNotConnected(format!(
                "device {} did not answer",
                frame.id()
            )));
        }
        trace!(reply = %String::from_utf8_lossy(&reply).trim_end(), "ascii rx");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const COMMANDS: [&str; 4] = ["01", "03", "58", "81"];
    const ADDRESSES: [&str; 5] = ["00", "02", "07", "0038", "0104"];

    #[test]
    fn checksum_covers_colon() {
        let body = b":01030038";
        let expected = body.iter().fold(0u8, |a, b| a ^ b);
        assert_eq!(checksum(body), expected);
    }

    #[test]
    fn encoded_checksum_matches_body() {
        let mut rng = StdRng::seed_from_u64(0x5EED);
        for _ in 0..500 {
            let id_format = if rng.gen() { IdFormat::Decimal } else { IdFormat::Hex };
            let data = match rng.gen_range(0..3) {
                0 => String::new(),
                1 => format!("{:02X}", rng.gen::<u8>()),
                _ => encode_f32(f32::from_bits(rng.gen())),
            };
            let frame = AsciiFrame::new(
                rng.gen_range(0..=99),
                id_format,
                COMMANDS[rng.gen_range(0..COMMANDS.len())],
                ADDRESSES[rng.gen_range(0..ADDRESSES.len())],
            )
            .with_data(data);

            let bytes = frame.encode();
            let text = std::str::from_utf8(&bytes).unwrap();
            let (body, tail) = text.split_at(text.len() - 3);
            assert_eq!(body, frame.body());
            let expected = body.bytes().fold(0u8, |acc, b| acc ^ b);
            assert_eq!(tail, format!("{expected:02X}\r"), "{frame:?}");
        }
    }

    #[test]
    fn random_floats_survive_the_wire() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut checked = 0;
        while checked < 1000 {
            let value = f32::from_bits(rng.gen());
            if !value.is_finite() {
                continue;
            }
            let hex = encode_f32(value);
            assert_eq!(hex.len(), 8);
            assert_eq!(decode_f32(&hex).unwrap().to_bits(), value.to_bits());
            checked += 1;
        }
    }

    #[test]
    fn signed_or_short_hex_is_rejected() {
        for bad in ["+3F80000", "-3F80000", "3F80000", "3F8000000", " 3F80000", "3f80000g"] {
            assert!(matches!(decode_f32(bad), Err(DecodeError::InvalidHex(_))), "{bad}");
        }
        assert!(decode_f32("3f800000").is_ok());
        assert!(matches!(
            parse_float_reply(b":010304+3F800005A\r", 16),
            Err(DecodeError::InvalidHex(_))
        ));
    }

    #[test]
    fn corrupted_reply_fails_checksum() {
        assert_eq!(parse_float_reply(b":0103043F80000041\r", 16), Ok(1.0));
        assert_eq!(
            parse_float_reply(b":0103043F80000042\r", 16),
            Err(DecodeError::BadChecksum {
                computed: 0x41,
                received: "42".to_string(),
            })
        );
        // bit flip in the payload
        assert!(matches!(
            parse_float_reply(b":0103043F90000041\r", 16),
            Err(DecodeError::BadChecksum { .. })
        ));
        // no checksum field at all
        assert_eq!(parse_float_reply(b":0103043F800000\r", 15), Ok(1.0));
    }

    #[test]
    fn read_frame_layout() {
        let frame = AsciiFrame::new(1, IdFormat::Decimal, "03", "0038").encode();
        let text = String::from_utf8(frame).unwrap();
        assert!(text.starts_with(":01030038"));
        assert!(text.ends_with('\r'));
        assert_eq!(text.len(), ":01030038".len() + 3);
        let cs = u8::from_str_radix(&text[9..11], 16).unwrap();
        assert_eq!(cs, checksum(b":01030038"));
    }

    #[test]
    fn hex_id_for_meter() {
        let frame = AsciiFrame::new(10, IdFormat::Hex, "03", "00");
        assert_eq!(frame.body(), ":0A0300");
    }

    #[test]
    fn float_hex_encoding() {
        assert_eq!(encode_f32(1.0), "3F800000");
        assert_eq!(encode_f32(0.0), "00000000");
        assert_eq!(decode_f32("41200000").unwrap(), 10.0);
        let v = 12.34f32;
        assert_eq!(decode_f32(&encode_f32(v)).unwrap(), v);
    }

    #[test]
    fn float_reply_requires_colon_and_length() {
        let reply = b":0103043F80000041\r";
        assert_eq!(parse_float_reply(reply, 16).unwrap(), 1.0);
        assert_eq!(
            parse_float_reply(b"0103043F80000041\r", 16),
            Err(DecodeError::MissingStartColon)
        );
        assert!(matches!(
            parse_float_reply(b":010304\r", 16),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            parse_float_reply(b":010304ZZZZZZZZAB\r", 16),
            Err(DecodeError::InvalidHex(_))
        ));
    }

    #[test]
    fn ack_prefix() {
        assert!(check_ack(b":0181xx\r", ":0181").is_ok());
        assert!(check_ack(b":0281xx\r", ":0181").is_err());
    }
}
