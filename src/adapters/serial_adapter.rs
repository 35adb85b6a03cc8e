//! Serial link backed by the `serialport` crate.
//!
//! `serialport` is blocking, so every I/O call runs on Tokio's blocking pool
//! with the port behind an `Arc<Mutex<..>>`.

use super::{LineSettings, SerialLink};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use super::Parity;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// A physical serial port.
pub struct SerialPortLink {
    /// Port name (e.g., "/dev/ttyUSB0", "COM6")
    port_name: String,

    /// Settings of the current session, if open
    settings: Option<LineSettings>,

    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialPortLink {
    /// A closed link to `port_name`.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            settings: None,
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn handle(&self) -> AppResult<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| DaqError::DeviceNotConnected(format!("{} is closed", self.port_name)))
    }
}

/// Names of the serial ports present on this machine.
pub fn list_ports() -> AppResult<Vec<String>> {
    #[cfg(feature = "instrument_serial")]
    {
        let ports = serialport::available_ports()
            .map_err(|e| DaqError::DeviceNotConnected(format!("port enumeration failed: {e}")))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    #[cfg(not(feature = "instrument_serial"))]
    {
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

#[cfg(feature = "instrument_serial")]
fn join_error(e: tokio::task::JoinError) -> DaqError {
    DaqError::Io(std::io::Error::other(format!("serial I/O task failed: {e}")))
}

#[async_trait]
impl SerialLink for SerialPortLink {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.settings.is_some()
    }

    async fn open(&mut self, settings: &LineSettings) -> AppResult<()> {
        self.close().await;

        #[cfg(feature = "instrument_serial")]
        {
            let name = self.port_name.clone();
            let s = *settings;
            let port = tokio::task::spawn_blocking(move || {
                let data_bits = match s.data_bits {
                    7 => serialport::DataBits::Seven,
                    _ => serialport::DataBits::Eight,
                };
                let stop_bits = match s.stop_bits {
                    2 => serialport::StopBits::Two,
                    _ => serialport::StopBits::One,
                };
                let parity = match s.parity {
                    Parity::None => serialport::Parity::None,
                    Parity::Odd => serialport::Parity::Odd,
                    Parity::Even => serialport::Parity::Even,
                };
                serialport::new(&name, s.baud_rate)
                    .data_bits(data_bits)
                    .stop_bits(stop_bits)
                    .parity(parity)
                    .timeout(s.timeout)
                    .open()
            })
            .await
            .map_err(join_error)?
            .map_err(|e| {
                DaqError::DeviceNotConnected(format!("failed to open '{}': {e}", self.port_name))
            })?;

            self.port = Some(Arc::new(Mutex::new(port)));
            self.settings = Some(*settings);
            debug!(
                port = %self.port_name,
                baud = settings.baud_rate,
                stop_bits = settings.stop_bits,
                "Serial port opened"
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = settings;
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn close(&mut self) {
        #[cfg(feature = "instrument_serial")]
        {
            self.port = None;
        }
        if self.settings.take().is_some() {
            debug!(port = %self.port_name, "Serial port closed");
        }
    }

    async fn clear_input(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.handle()?;
            tokio::task::spawn_blocking(move || {
                port.blocking_lock()
                    .clear(serialport::ClearBuffer::Input)
                    .map_err(|e| DaqError::Io(std::io::Error::other(e.to_string())))
            })
            .await
            .map_err(join_error)?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.handle()?;
            let bytes = data.to_vec();
            tokio::task::spawn_blocking(move || -> AppResult<()> {
                use std::io::Write;
                let mut guard = port.blocking_lock();
                guard.write_all(&bytes)?;
                guard.flush()?;
                Ok(())
            })
            .await
            .map_err(join_error)?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = data;
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn read_until(&mut self, delimiter: u8, max: usize) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.handle()?;
            tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
                use std::io::Read;
                let mut guard = port.blocking_lock();
                let mut response = Vec::new();
                let mut byte = [0u8; 1];
                while response.len() < max {
                    match guard.read(&mut byte) {
                        Ok(1) => {
                            response.push(byte[0]);
                            if byte[0] == delimiter {
                                break;
                            }
                        }
                        Ok(_) => break,
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(response)
            })
            .await
            .map_err(join_error)?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (delimiter, max);
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }

    async fn read_up_to(&mut self, len: usize) -> AppResult<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.handle()?;
            tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
                use std::io::Read;
                let mut guard = port.blocking_lock();
                let mut response = vec![0u8; len];
                let mut filled = 0;
                while filled < len {
                    match guard.read(&mut response[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                        Err(e) => return Err(e.into()),
                    }
                }
                response.truncate(filled);
                Ok(response)
            })
            .await
            .map_err(join_error)?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = len;
            Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
        }
    }
}
