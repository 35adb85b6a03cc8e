//! In-memory serial link for tests and simulation.
//!
//! Every write is handed to a responder closure together with the settings the
//! link is currently open with; whatever the responder returns becomes readable
//! input. Opens, closes and writes are recorded in a shared [`LinkLog`].

use super::{LineSettings, SerialLink};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Something that happened on a mock link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Opened with these settings.
    Opened(LineSettings),
    /// Closed.
    Closed,
    /// Bytes written.
    Wrote(Vec<u8>),
}

type Responder = Box<dyn FnMut(&LineSettings, &[u8]) -> Option<Vec<u8>> + Send>;

/// Shared, cloneable view of a link's event history.
#[derive(Debug, Clone, Default)]
pub struct LinkLog {
    events: Arc<Mutex<Vec<LinkEvent>>>,
    refuse_open: Arc<AtomicBool>,
}

impl LinkLog {
    /// Everything so far, in order.
    pub fn events(&self) -> Vec<LinkEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// All writes, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LinkEvent::Wrote(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    /// Make subsequent `open` calls fail, as if the adapter were unplugged.
    pub fn set_refuse_open(&self, refuse: bool) {
        self.refuse_open.store(refuse, Ordering::SeqCst);
    }

    fn push(&self, event: LinkEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// A serial link whose peer is a closure.
pub struct MockLink {
    name: String,
    settings: Option<LineSettings>,
    input: VecDeque<u8>,
    responder: Responder,
    log: LinkLog,
}

impl MockLink {
    /// `responder` sees the current settings and each write.
    pub fn new<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: FnMut(&LineSettings, &[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        Self {
            name: name.into(),
            settings: None,
            input: VecDeque::new(),
            responder: Box::new(responder),
            log: LinkLog::default(),
        }
    }

    /// A link with nothing on the other end.
    pub fn silent(name: impl Into<String>) -> Self {
        Self::new(name, |_, _| None)
    }

    /// A handle on this link's history.
    pub fn log(&self) -> LinkLog {
        self.log.clone()
    }

    fn require_open(&self) -> AppResult<LineSettings> {
        self.settings
            .ok_or_else(|| DaqError::DeviceNotConnected(format!("{} is closed", self.name)))
    }
}

#[async_trait]
impl SerialLink for MockLink {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.settings.is_some()
    }

    async fn open(&mut self, settings: &LineSettings) -> AppResult<()> {
        if self.settings.is_some() {
            self.close().await;
        }
        if self.log.refuse_open.load(Ordering::SeqCst) {
            return Err(DaqError::DeviceNotConnected(format!(
                "failed to open '{}'",
                self.name
            )));
        }
        self.settings = Some(*settings);
        self.log.push(LinkEvent::Opened(*settings));
        Ok(())
    }

    async fn close(&mut self) {
        if self.settings.take().is_some() {
            self.input.clear();
            self.log.push(LinkEvent::Closed);
        }
    }

    async fn clear_input(&mut self) -> AppResult<()> {
        self.require_open()?;
        self.input.clear();
        Ok(())
    }

    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        let settings = self.require_open()?;
        self.log.push(LinkEvent::Wrote(data.to_vec()));
        if let Some(reply) = (self.responder)(&settings, data) {
            self.input.extend(reply);
        }
        Ok(())
    }

    async fn read_until(&mut self, delimiter: u8, max: usize) -> AppResult<Vec<u8>> {
        self.require_open()?;
        let mut out = Vec::new();
        while out.len() < max {
            match self.input.pop_front() {
                Some(b) => {
                    out.push(b);
                    if b == delimiter {
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(out)
    }

    async fn read_up_to(&mut self, len: usize) -> AppResult<Vec<u8>> {
        self.require_open()?;
        let n = len.min(self.input.len());
        Ok(self.input.drain(..n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_responder_round_trip() {
        let mut link = MockLink::new("mock", |_, req| Some(req.to_vec()));
        link.open(&LineSettings::modbus_rtu()).await.unwrap();
        link.write_all(b"abc\r").await.unwrap();
        assert_eq!(link.read_until(b'\r', 16).await.unwrap(), b"abc\r");
        assert!(link.read_up_to(4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_on_closed_link_fails() {
        let mut link = MockLink::silent("mock");
        let err = link.write_all(b"x").await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn log_records_open_write_close() {
        let mut link = MockLink::silent("mock");
        let log = link.log();
        link.open(&LineSettings::ascii_flow()).await.unwrap();
        link.write_all(b":01\r").await.unwrap();
        link.close().await;
        link.close().await;

        assert_eq!(
            log.events(),
            vec![
                LinkEvent::Opened(LineSettings::ascii_flow()),
                LinkEvent::Wrote(b":01\r".to_vec()),
                LinkEvent::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn refused_open_leaves_link_closed() {
        let mut link = MockLink::silent("mock");
        link.log().set_refuse_open(true);
        assert!(link.open(&LineSettings::modbus_rtu()).await.is_err());
        assert!(!link.is_open());
    }
}
