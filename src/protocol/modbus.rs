//! Modbus RTU framing for the TK4 temperature controllers, the PSM4 pressure
//! module and the relay board.
//!
//! Only the two function codes the rig uses are supported: read input
//! registers (0x04) and write single register (0x06). Frames carry a CRC-16
//! (Modbus polynomial) appended little-endian.

use crate::adapters::{ensure_open, LineSettings, SerialLink};
use crate::error::{AppResult, DaqError, DecodeError};
use crate::snapshot::Reading;
use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use tracing::trace;

/// Function code 0x04.
pub const READ_INPUT_REGISTERS: u8 = 0x04;
/// Function code 0x06.
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
/// Set in the function byte of an exception reply.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Raw register value a TK4 reports for an open or missing sensor.
pub const NOT_CONNECTED_SENTINEL: u16 = 31000;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Length of an exception reply: unit, function|0x80, code, CRC.
const EXCEPTION_LEN: usize = 5;

/// CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// What a request does with its register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOp {
    /// Read `count` consecutive input registers.
    Read {
        /// Registers to read.
        count: u16,
    },
    /// Write one holding register.
    Write {
        /// Value to store.
        value: u16,
    },
}

/// One request addressed to a slave unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRequest {
    /// Slave address.
    pub unit: u8,
    /// First register.
    pub register: u16,
    /// Read or write.
    pub op: RegisterOp,
}

impl RegisterRequest {
    /// Read input registers.
    pub fn read(unit: u8, register: u16, count: u16) -> Self {
        Self {
            unit,
            register,
            op: RegisterOp::Read { count },
        }
    }

    /// Write a single register.
    pub fn write(unit: u8, register: u16, value: u16) -> Self {
        Self {
            unit,
            register,
            op: RegisterOp::Write { value },
        }
    }

    /// Function code on the wire.
    pub fn function(&self) -> u8 {
        match self.op {
            RegisterOp::Read { .. } => READ_INPUT_REGISTERS,
            RegisterOp::Write { .. } => WRITE_SINGLE_REGISTER,
        }
    }

    /// Frame with CRC appended.
    pub fn encode(&self) -> Vec<u8> {
        let operand = match self.op {
            RegisterOp::Read { count } => count,
            RegisterOp::Write { value } => value,
        };
        let mut frame = Vec::with_capacity(8);
        frame.push(self.unit);
        frame.push(self.function());
        frame.extend_from_slice(&self.register.to_be_bytes());
        frame.extend_from_slice(&operand.to_be_bytes());
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Length of a successful reply.
    pub fn response_len(&self) -> usize {
        match self.op {
            RegisterOp::Read { count } => 5 + 2 * usize::from(count),
            RegisterOp::Write { .. } => 8,
        }
    }
}

/// A decoded successful reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterResponse {
    /// Values of a read, in register order.
    Registers(Vec<u16>),
    /// Echo of a write.
    Written {
        /// Register written.
        register: u16,
        /// Value stored.
        value: u16,
    },
}

fn check_crc(frame: &[u8]) -> Result<(), DecodeError> {
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if computed != received {
        return Err(DecodeError::BadCrc { computed, received });
    }
    Ok(())
}

/// Decode the reply to `request`.
pub fn decode_response(
    request: &RegisterRequest,
    frame: &[u8],
) -> Result<RegisterResponse, DecodeError> {
    if frame.len() < EXCEPTION_LEN {
        return Err(DecodeError::Truncated {
            got: frame.len(),
            need: request.response_len(),
        });
    }
    if frame[0] != request.unit {
        return Err(DecodeError::UnexpectedAddress {
            expected: request.unit,
            got: frame[0],
        });
    }

    let function = request.function();
    if frame[1] == function | EXCEPTION_FLAG {
        check_crc(&frame[..EXCEPTION_LEN])?;
        return Err(DecodeError::Exception(frame[2]));
    }
    if frame[1] != function {
        return Err(DecodeError::UnexpectedFunction {
            expected: function,
            got: frame[1],
        });
    }

    let need = request.response_len();
    if frame.len() < need {
        return Err(DecodeError::Truncated {
            got: frame.len(),
            need,
        });
    }
    let frame = &frame[..need];
    check_crc(frame)?;

    match request.op {
        RegisterOp::Read { count } => {
            let byte_count = usize::from(frame[2]);
            if byte_count != 2 * usize::from(count) {
                return Err(DecodeError::UnexpectedLength(byte_count));
            }
            let registers = frame[3..3 + byte_count]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(RegisterResponse::Registers(registers))
        }
        RegisterOp::Write { .. } => Ok(RegisterResponse::Written {
            register: u16::from_be_bytes([frame[2], frame[3]]),
            value: u16::from_be_bytes([frame[4], frame[5]]),
        }),
    }
}

/// Turn a `(raw, decimals)` register pair into an engineering value.
///
/// The sentinel raw value means the sensor is not connected.
pub fn scale_register(raw: u16, decimals: u16) -> Reading {
    if raw == NOT_CONNECTED_SENTINEL {
        return Reading::NotConnected;
    }
    let Ok(exp) = i32::try_from(decimals) else {
        return Reading::NotConnected;
    };
    if exp > 9 {
        return Reading::NotConnected;
    }
    Reading::Value(f64::from(raw) / 10f64.powi(exp))
}

/// Register access on a Modbus line.
#[async_trait]
pub trait RegisterBus: Send {
    /// Function 0x04 on `unit`.
    async fn read_input_registers(
        &mut self,
        unit: u8,
        register: u16,
        count: u16,
    ) -> AppResult<Vec<u16>>;

    /// Function 0x06 on `unit`; succeeds only on a matching echo.
    async fn write_register(&mut self, unit: u8, register: u16, value: u16) -> AppResult<()>;
}

/// A Modbus session borrowing the shared line for the duration of one call.
pub struct ModbusSession<'a> {
    link: &'a mut dyn SerialLink,
    settings: LineSettings,
}

impl<'a> ModbusSession<'a> {
    /// Borrow `link`, reopening it with `settings` if needed.
    pub fn new(link: &'a mut dyn SerialLink, settings: LineSettings) -> Self {
        Self { link, settings }
    }

    async fn transact(&mut self, request: RegisterRequest) -> AppResult<RegisterResponse> {
        ensure_open(self.link, &self.settings).await?;
        let result = self.exchange(&request).await;
        if matches!(result, Err(DaqError::Io(_))) {
            // A broken port gets reopened on the next call.
            self.link.close().await;
        }
        result
    }

    async fn exchange(&mut self, request: &RegisterRequest) -> AppResult<RegisterResponse> {
        self.link.clear_input().await?;
        let frame = request.encode();
        trace!(unit = request.unit, frame = ?frame, "modbus tx");
        self.link.write_all(&frame).await?;

        let mut reply = self.link.read_up_to(EXCEPTION_LEN).await?;
        if reply.is_empty() {
            return Err(DaqError::DeviceNotConnected(format!(
                "unit {} did not answer",
                request.unit
            )));
        }
        let is_exception = reply.len() > 1 && reply[1] & EXCEPTION_FLAG != 0;
        if !is_exception && reply.len() == EXCEPTION_LEN {
            let rest = self
                .link
                .read_up_to(request.response_len() - EXCEPTION_LEN)
                .await?;
            reply.extend(rest);
        }
        trace!(unit = request.unit, frame = ?reply, "modbus rx");
        Ok(decode_response(request, &reply)?)
    }
}

#[async_trait]
impl RegisterBus for ModbusSession<'_> {
    async fn read_input_registers(
        &mut self,
        unit: u8,
        register: u16,
        count: u16,
    ) -> AppResult<Vec<u16>> {
        match self.transact(RegisterRequest::read(unit, register, count)).await? {
            RegisterResponse::Registers(regs) => Ok(regs),
            RegisterResponse::Written { .. } => Err(DecodeError::UnexpectedFunction {
                expected: READ_INPUT_REGISTERS,
                got: WRITE_SINGLE_REGISTER,
            }
            .into()),
        }
    }

    async fn write_register(&mut self, unit: u8, register: u16, value: u16) -> AppResult<()> {
        match self.transact(RegisterRequest::write(unit, register, value)).await? {
            RegisterResponse::Written {
                register: r,
                value: v,
            } if r == register && v == value => Ok(()),
            _ => Err(DecodeError::UnexpectedLength(0).into()),
        }
    }
}
