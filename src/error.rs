//! Custom error types for the rig.
//!
//! `DaqError` is the single error type used across the crate. Device and codec
//! failures are *expected* on a test rig (unplugged thermocouples, a flow
//! controller that stops answering, a closed USB adapter), so the taxonomy is
//! split along the lines the bus worker cares about:
//!
//! - **`Decode`**: the device answered, but the frame was malformed, short, or
//!   failed its CRC/checksum. Wraps a [`DecodeError`] from the codec layer.
//! - **`DeviceNotConnected`**: no answer at all (timeout, port closed, reconnect failed).
//! - **`Validation`**: operator input out of range, rejected before it reaches the wire.
//! - **`BusContention`**: a session of one protocol family was requested while the
//!   other family owns the line. The scheduler makes this unreachable; debug builds
//!   assert on it.
//! - **`NoResponse`** / **`ChannelClosed`**: failures of the command channel itself.
//!
//! Drivers never let these escape to the worker loop: they log and map them to
//! `Reading::NotConnected` or a `false` acknowledgement.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Top-level error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be loaded or merged.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings loaded but are inconsistent.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Port or file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed reply.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// No answer at all.
    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),

    /// Operator input out of range.
    #[error("Invalid operator input: {0}")]
    Validation(String),

    /// Wrong protocol family for the current line owner.
    #[error("Bus contention: {held} owns the line, {requested} requested it")]
    BusContention {
        /// Current owner.
        held: String,
        /// Requested owner.
        requested: String,
    },

    /// A request got no reply in time.
    #[error("No response: {0}")]
    NoResponse(String),

    /// The bus worker is gone.
    #[error("Command channel closed")]
    ChannelClosed,

    /// The build lacks a cargo feature.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The pre-emergency state file could not be read or written.
    #[error("State persistence error: {0}")]
    Persistence(String),
}

/// Codec-level failures. Produced by `protocol::modbus` and `protocol::ascii`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Shorter than the frame needs.
    #[error("response truncated: got {got} bytes, need {need}")]
    Truncated {
        /// Bytes received.
        got: usize,
        /// Bytes required.
        need: usize,
    },

    /// Modbus CRC-16 mismatch.
    #[error("CRC mismatch: computed {computed:#06x}, received {received:#06x}")]
    BadCrc {
        /// CRC of the received bytes.
        computed: u16,
        /// CRC carried by the frame.
        received: u16,
    },

    /// ASCII XOR checksum mismatch.
    #[error("checksum mismatch: computed {computed:02X}, received {received}")]
    BadChecksum {
        /// XOR of the received body.
        computed: u8,
        /// Checksum digits carried by the frame.
        received: String,
    },

    /// Another unit answered.
    #[error("response from unit {got}, expected unit {expected}")]
    UnexpectedAddress {
        /// Unit addressed.
        expected: u8,
        /// Unit that answered.
        got: u8,
    },

    /// Reply to a different function.
    #[error("unexpected function code {got:#04x}, expected {expected:#04x}")]
    UnexpectedFunction {
        /// Function sent.
        expected: u8,
        /// Function in the reply.
        got: u8,
    },

    /// Modbus exception response.
    #[error("device exception code {0:#04x}")]
    Exception(u8),

    /// ASCII reply without the leading colon.
    #[error("frame does not start with ':'")]
    MissingStartColon,

    /// Payload is not eight hex digits.
    #[error("invalid hex payload '{0}'")]
    InvalidHex(String),

    /// Byte count does not match the request.
    #[error("unexpected response length {0}")]
    UnexpectedLength(usize),

    /// Write reply lacks the acknowledgement prefix.
    #[error("write not acknowledged (expected prefix '{0}')")]
    NotAcknowledged(String),

    /// Power meter or gas analyzer field is not a number.
    #[error("invalid numeric reply '{0}'")]
    InvalidNumber(String),
}

impl DaqError {
    /// True for failures that mean "the device did not answer"; these are
    /// worth one reconnect attempt on the next operation.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, DaqError::DeviceNotConnected(_) | DaqError::Io(_))
    }
}
