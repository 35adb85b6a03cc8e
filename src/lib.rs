//! Core library for the reactor rig controller.
//!
//! This library contains the wire codecs, device drivers, the single bus worker
//! that owns every serial port, and the safety interlock. It is used by the
//! `reactor_daq` binary and by the integration tests, which run the whole rig
//! against the in-process simulator.

pub mod adapters;
pub mod app;
pub mod bus;
pub mod config;
pub mod datalog;
pub mod error;
pub mod instrument;
pub mod messages;
pub mod protocol;
pub mod safety;
pub mod snapshot;
