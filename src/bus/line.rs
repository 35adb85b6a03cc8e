//! The shared RS-485 line and its single owner.
//!
//! The Modbus devices and the flow devices sit on the same physical line but use
//! different framing (8N2 vs 8N1). Exactly one protocol family holds the port at
//! any time; handing it to the other family closes the port and reopens it with
//! that family's settings before any frame is sent.
//!
//! `SharedLine` is owned by the bus worker, so no lock is needed: the borrow
//! checker guarantees a session is the only user of the port while it lives.

use crate::adapters::{LineSettings, SerialLink};
use crate::error::{AppResult, DaqError};
use crate::protocol::{AsciiSession, ModbusSession};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Which protocol family currently holds the shared line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BusOwnership {
    /// Modbus RTU devices: TK4s, PSM4, relay board.
    BinaryProtocolOwner,
    /// ASCII devices: flow controllers and flow meter.
    AsciiProtocolOwner,
}

impl BusOwnership {
    /// Port settings this family needs.
    pub fn line_settings(self) -> LineSettings {
        match self {
            BusOwnership::BinaryProtocolOwner => LineSettings::modbus_rtu(),
            BusOwnership::AsciiProtocolOwner => LineSettings::ascii_flow(),
        }
    }
}

impl fmt::Display for BusOwnership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusOwnership::BinaryProtocolOwner => f.write_str("binary"),
            BusOwnership::AsciiProtocolOwner => f.write_str("ascii"),
        }
    }
}

/// The RS-485 port and which family holds it.
pub struct SharedLine {
    link: Box<dyn SerialLink>,
    owner: Option<BusOwnership>,
    settle: Duration,
}

impl SharedLine {
    /// `settle` is waited after every reopen.
    pub fn new(link: Box<dyn SerialLink>, settle: Duration) -> Self {
        Self {
            link,
            owner: None,
            settle,
        }
    }

    /// Current holder; `None` until first claimed or after release.
    pub fn owner(&self) -> Option<BusOwnership> {
        self.owner
    }

    /// Underlying port name.
    pub fn port_name(&self) -> &str {
        self.link.port_name()
    }

    /// Hand the line to `owner`.
    ///
    /// A no-op if `owner` already holds an open line. Otherwise the current
    /// session is closed first, then the port is reopened with `owner`'s settings.
    /// On failure the line is left closed and unowned.
    pub async fn claim(&mut self, owner: BusOwnership) -> AppResult<()> {
        if self.owner == Some(owner) && self.link.is_open() {
            return Ok(());
        }
        if self.link.is_open() {
            self.link.close().await;
        }
        self.owner = None;

        if let Err(e) = self.link.open(&owner.line_settings()).await {
            warn!(port = self.link.port_name(), %owner, error = %e, "Could not claim shared line");
            return Err(e);
        }
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        self.owner = Some(owner);
        debug!(port = self.link.port_name(), %owner, "Shared line claimed");
        Ok(())
    }

    /// Close the port; nobody owns the line afterwards.
    pub async fn release(&mut self) {
        self.link.close().await;
        self.owner = None;
    }

    fn session_link(&mut self, wanted: BusOwnership) -> AppResult<&mut dyn SerialLink> {
        match self.owner {
            Some(held) if held != wanted && self.link.is_open() => {
                debug_assert!(false, "{wanted} session requested while {held} owns the line");
                Err(DaqError::BusContention {
                    held: held.to_string(),
                    requested: wanted.to_string(),
                })
            }
            _ => {
                // A closed line belongs to whoever asks; the session reopens it.
                self.owner = Some(wanted);
                Ok(self.link.as_mut())
            }
        }
    }

    /// A Modbus session on the line. The binary family must own it.
    pub fn binary(&mut self) -> AppResult<ModbusSession<'_>> {
        let settings = BusOwnership::BinaryProtocolOwner.line_settings();
        let link = self.session_link(BusOwnership::BinaryProtocolOwner)?;
        Ok(ModbusSession::new(link, settings))
    }

    /// An ASCII session on the line. The ASCII family must own it.
    pub fn ascii(&mut self) -> AppResult<AsciiSession<'_>> {
        let settings = BusOwnership::AsciiProtocolOwner.line_settings();
        let link = self.session_link(BusOwnership::AsciiProtocolOwner)?;
        Ok(AsciiSession::new(link, settings))
    }

    /// Claim for the binary family and open a session.
    pub async fn claim_binary(&mut self) -> AppResult<ModbusSession<'_>> {
        self.claim(BusOwnership::BinaryProtocolOwner).await?;
        self.binary()
    }

    /// Claim for the ASCII family and open a session.
    pub async fn claim_ascii(&mut self) -> AppResult<AsciiSession<'_>> {
        self.claim(BusOwnership::AsciiProtocolOwner).await?;
        self.ascii()
    }
}
