//! Line-oriented power meter on its own serial port.
//!
//! The meter is configured for remote control and manual watt-hour integration
//! every time its port is (re)opened. Power is numeric item 3, integrated energy
//! item 4.

use crate::adapters::{ensure_open, LineSettings, SerialLink};
use crate::error::{AppResult, DaqError, DecodeError};
use crate::snapshot::Reading;
use std::time::Duration;
use tracing::{debug, info, warn};

const TERMINATOR: &str = "\r\n";
const MAX_LINE: usize = 64;

const CONFIGURE: [&str; 4] = [
    ":COMMunicate:REMote ON",
    ":NUMERIC:NORMAL:ITEM4 WH,1",
    ":INTEGrate:MODE MANUAL",
    ":INTEGrate:FUNCtion WP",
];
const QUERY_POWER: &str = ":NUMERIC:NORMAL:VALUE?3";
const QUERY_ENERGY: &str = ":NUMERIC:NORMAL:VALUE?4";
const INTEGRATE_RESET: &str = ":INTEGrate:RESet";
const INTEGRATE_START: &str = ":INTEGrate:STARt";
const INTEGRATE_STOP: &str = ":INTEGrate:STOP";

/// Gap the meter needs between an integration reset and the next command.
const RESET_SETTLE: Duration = Duration::from_millis(500);

/// Gap after each configuration command.
const CONFIGURE_SETTLE: Duration = Duration::from_millis(200);

/// Parse one reply line; non-finite values are errors.
pub fn parse_numeric(line: &[u8]) -> Result<f64, DecodeError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    text.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DecodeError::InvalidNumber(text.to_string()))
}

/// Power meter driver. Owns its port exclusively.
pub struct PowerMeter {
    link: Box<dyn SerialLink>,
    settings: LineSettings,
    scaling: f64,
}

impl PowerMeter {
    /// `scaling` multiplies both power and energy.
    pub fn new(link: Box<dyn SerialLink>, settings: LineSettings, scaling: f64) -> Self {
        Self {
            link,
            settings,
            scaling,
        }
    }

    async fn connect(&mut self) -> AppResult<()> {
        if ensure_open(self.link.as_mut(), &self.settings).await? {
            for command in CONFIGURE {
                self.send(command).await?;
                tokio::time::sleep(CONFIGURE_SETTLE).await;
            }
            info!(port = self.link.port_name(), "Power meter configured");
        }
        Ok(())
    }

    async fn send(&mut self, command: &str) -> AppResult<()> {
        let line = format!("{command}{TERMINATOR}");
        self.link.write_all(line.as_bytes()).await
    }

    async fn query(&mut self, command: &str) -> AppResult<f64> {
        self.link.clear_input().await?;
        self.send(command).await?;
        let reply = self.link.read_until(b'\n', MAX_LINE).await?;
        if reply.is_empty() {
            return Err(DaqError::DeviceNotConnected(format!(
                "power meter did not answer {command}"
            )));
        }
        Ok(parse_numeric(&reply)?)
    }

    async fn read_pair(&mut self) -> AppResult<(f64, f64)> {
        self.connect().await?;
        let power = self.query(QUERY_POWER).await?;
        let energy = self.query(QUERY_ENERGY).await?;
        Ok((power, energy))
    }

    /// Scaled `(power, energy)`.
    pub async fn read(&mut self) -> (Reading, Reading) {
        match self.read_pair().await {
            Ok((p, e)) => (
                Reading::Value(p).scaled(self.scaling),
                Reading::Value(e).scaled(self.scaling),
            ),
            Err(err) => {
                warn!(error = %err, "Power meter read failed");
                if err.is_disconnect() {
                    self.link.close().await;
                }
                (Reading::NotConnected, Reading::NotConnected)
            }
        }
    }

    async fn run(&mut self, what: &str, commands: &[&str]) -> bool {
        let result = async {
            self.connect().await?;
            for (i, command) in commands.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(RESET_SETTLE).await;
                }
                self.send(command).await?;
            }
            AppResult::Ok(())
        }
        .await;
        match result {
            Ok(()) => {
                debug!("Power meter integration {what}");
                true
            }
            Err(e) => {
                warn!(error = %e, "Power meter integration {what} failed");
                false
            }
        }
    }

    /// Reset the integrator, then start it.
    pub async fn start_integration(&mut self) -> bool {
        self.run("start", &[INTEGRATE_RESET, INTEGRATE_START]).await
    }

    /// Stop the integrator.
    pub async fn stop_integration(&mut self) -> bool {
        self.run("stop", &[INTEGRATE_STOP]).await
    }

    /// Zero the integrator.
    pub async fn reset_integration(&mut self) -> bool {
        self.run("reset", &[INTEGRATE_RESET]).await
    }

    /// Release the port; the next operation reopens and reconfigures.
    pub async fn close(&mut self) {
        self.link.close().await;
    }
}
