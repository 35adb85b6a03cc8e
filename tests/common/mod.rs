//! Shared builders for the rig integration tests.
#![allow(dead_code)]

use reactor_daq::adapters::{LinkLog, RigSimulator};
use reactor_daq::app::{RigApp, RigHandle, RigLinks};
use reactor_daq::config::Settings;
use reactor_daq::datalog::{ChannelSink, RowSink};
use reactor_daq::snapshot::{DataRow, InstrumentSnapshot};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub struct TestRig {
    pub app: RigApp,
    pub handle: RigHandle,
    pub sim: RigSimulator,
    pub rs485: LinkLog,
    pub dir: TempDir,
}

/// Defaults with every file under `dir`.
pub fn settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.application.data_dir = dir.path().join("data");
    settings.application.state_file = Some(dir.path().join("pre_emergency.toml"));
    settings
}

pub fn start_with(sim: RigSimulator, settings: &Settings, dir: TempDir, sink: Box<dyn RowSink>) -> TestRig {
    let rs485 = sim.rs485_link("rs485");
    let log = rs485.log();
    let links = RigLinks {
        rs485: Box::new(rs485),
        power_meter: Box::new(sim.power_meter_link("power")),
        gas_analyzer: Box::new(sim.gas_analyzer_link("gas")),
    };
    let app = RigApp::start(settings, links, sink);
    TestRig {
        handle: app.handle(),
        app,
        sim,
        rs485: log,
        dir,
    }
}

/// A rig on default settings that forwards its data rows to the returned receiver.
pub fn start(sim: RigSimulator) -> (TestRig, mpsc::UnboundedReceiver<DataRow>) {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir);
    let (sink, rows) = ChannelSink::new();
    (start_with(sim, &settings, dir, Box::new(sink)), rows)
}

/// Wait until the published snapshot satisfies `done`.
pub async fn wait_until(handle: &RigHandle, done: impl FnMut(&InstrumentSnapshot) -> bool) -> InstrumentSnapshot {
    let mut rx = handle.subscribe();
    let snapshot = rx.wait_for(done).await.unwrap();
    snapshot.clone()
}

/// Count relay-board writes of `value` to the group register.
pub fn group_writes(sim: &RigSimulator, value: u16) -> usize {
    sim.state()
        .relay_writes
        .iter()
        .filter(|(register, v)| *register == 0 && *v == value)
        .count()
}
