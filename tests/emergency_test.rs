//! Emergency stop, hazard latching and restart on a simulated rig.

mod common;

use reactor_daq::adapters::RigSimulator;
use reactor_daq::datalog::NullSink;
use reactor_daq::instrument::relay::{GROUP_CLOSE_ALL, GROUP_OPEN_ALL, ON};
use reactor_daq::messages::{Command, CommandReply, Priority};
use reactor_daq::safety::PreEmergencySnapshot;
use reactor_daq::snapshot::{InstrumentSnapshot, Reading};
use std::time::Duration;
use tempfile::TempDir;

async fn wait_for_alarm(handle: &reactor_daq::app::RigHandle) {
    let mut alarm = handle.subscribe_alarm();
    alarm.wait_for(|a| a.active).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn double_trigger_opens_relays_once() {
    let (rig, _rows) = common::start(RigSimulator::default());
    rig.handle.wait_for_pass(1).await.unwrap();

    assert!(rig.handle.emergency_stop("first"));
    assert!(rig.handle.emergency_stop("second"));
    wait_for_alarm(&rig.handle).await;

    // let the delayed re-close and the safe-state commands run
    tokio::time::sleep(Duration::from_secs(3)).await;
    let passes = rig.handle.snapshot().pass_count;
    rig.handle.wait_for_pass(passes + 1).await.unwrap();

    assert_eq!(common::group_writes(&rig.sim, GROUP_OPEN_ALL), 1);
    assert_eq!(common::group_writes(&rig.sim, GROUP_CLOSE_ALL), 1);
    assert!(rig.handle.is_emergency_active());
    assert!(rig.handle.alarm().message.starts_with("EMERGENCY STOP"));

    let state_file = rig.dir.path().join("pre_emergency.toml");
    assert!(PreEmergencySnapshot::load(&state_file).unwrap().is_some());
    rig.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn restart_brings_back_only_what_was_running() {
    let (rig, _rows) = common::start(RigSimulator::default());
    let h = &rig.handle;
    for command in [
        Command::SetTemperatureSetpoint { address: 1, value: 250.0 },
        Command::StartHeater { address: 1 },
        Command::SetTemperatureSetpoint { address: 2, value: 120.0 },
        Command::SetFlowSetpoint { channel: 3, value: 12.5 },
        Command::SetFlowEnabled { channel: 3, enabled: true },
    ] {
        assert_eq!(h.request(command, Priority::Urgent).await.unwrap(), CommandReply::Ack(true));
    }
    h.wait_for_pass(1).await.unwrap();

    assert!(h.emergency_stop("test"));
    wait_for_alarm(h).await;
    common::wait_until(h, |s| !s.heater_running[0] && !s.flow_enabled[2]).await;
    let passes = h.snapshot().pass_count;
    h.wait_for_pass(passes + 1).await.unwrap();

    let stopped = rig.sim.state();
    assert_eq!(stopped.heater_running, [false; 4]);
    assert_eq!(stopped.heater_setpoints, [0; 4]);
    assert_eq!(stopped.flow_enabled, [false; 4]);

    let pulses_before = rig.sim.state().relay_writes.iter().filter(|w| **w == (0, ON)).count();
    let report = h.restart().await.unwrap();
    assert!(report.resumed, "{report:?}");
    assert!(report.failures.is_empty(), "{report:?}");
    assert_eq!(report.heaters_started, vec![1]);
    assert_eq!(report.flows_enabled, vec![3]);

    let sim = rig.sim.state();
    assert_eq!(sim.heater_running, [true, false, false, false]);
    assert_eq!(sim.heater_setpoints, [250, 120, 0, 0]);
    assert_eq!(sim.flow_enabled, [false, false, true, false]);
    assert_eq!(sim.flow_setpoints[2], 12.5);
    // heater 1 start relay is channel 1, register 0
    let pulses_after = sim.relay_writes.iter().filter(|w| **w == (0, ON)).count();
    assert_eq!(pulses_after, pulses_before + 1);

    assert!(!h.is_emergency_active());
    assert!(!h.alarm().active);
    assert!(!rig.dir.path().join("pre_emergency.toml").exists());
    rig.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn operator_cannot_energise_during_emergency() {
    let (rig, _rows) = common::start(RigSimulator::default());
    rig.handle.emergency_stop("test");
    wait_for_alarm(&rig.handle).await;

    let reply = rig
        .handle
        .request(Command::StartHeater { address: 2 }, Priority::Urgent)
        .await
        .unwrap();
    assert!(matches!(reply, CommandReply::Refused(_)));

    let reply = rig
        .handle
        .request(Command::SetFlowEnabled { channel: 1, enabled: false }, Priority::Urgent)
        .await
        .unwrap();
    assert_eq!(reply, CommandReply::Ack(true));

    let reply = rig
        .handle
        .request(Command::ReadTemperature { address: 1 }, Priority::Urgent)
        .await
        .unwrap();
    assert_eq!(reply, CommandReply::Reading(Reading::Value(25.0)));
    assert!(!rig.sim.state().heater_running[1]);
    rig.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heater_stop_relay_works_during_emergency() {
    let (rig, _rows) = common::start(RigSimulator::default());
    rig.handle.wait_for_pass(1).await.unwrap();
    rig.handle.emergency_stop("test");
    wait_for_alarm(&rig.handle).await;

    let reply = rig.handle.stop_heater(2).await.unwrap();
    assert_eq!(reply, CommandReply::Ack(true));
    // heater 2 stop relay is channel 4, register 3
    assert!(rig.sim.state().relay_writes.contains(&(3, ON)));
    assert!(!rig.handle.snapshot().heater_running[1]);

    let start_pulse = Command::PulseRelay {
        channel: 3,
        duration: Duration::from_secs(1),
    };
    let reply = rig.handle.request(start_pulse, Priority::Urgent).await.unwrap();
    assert!(matches!(reply, CommandReply::Refused(_)));
    assert!(!rig.sim.state().relay_writes.contains(&(2, ON)));

    assert!(rig.handle.stop_heater(5).await.is_err());
    rig.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn overtemperature_latches_once_and_clears() {
    let dir = TempDir::new().unwrap();
    let mut settings = common::settings(&dir);
    settings.limits.heater_1_max_temp = Some(180.0);
    let sim = RigSimulator::default();
    sim.update(|s| s.temperatures[1] = Some(185.0));
    let rig = common::start_with(sim, &settings, dir, Box::new(NullSink));

    let first = rig.handle.wait_for_pass(1).await.unwrap();
    assert!(first.latches.over_temperature[0]);
    wait_for_alarm(&rig.handle).await;

    // still hot: latched, no second emergency
    rig.handle.wait_for_pass(3).await.unwrap();
    assert!(rig.handle.snapshot().latches.over_temperature[0]);

    rig.sim.update(|s| s.temperatures[1] = Some(175.0));
    let cooled = rig.handle.wait_for_pass(5).await.unwrap();
    assert!(!cooled.latches.over_temperature[0]);
    assert_eq!(cooled.temperature(2), Reading::Value(175.0));

    assert_eq!(common::group_writes(&rig.sim, GROUP_OPEN_ALL), 1);
    // the emergency stays active until an explicit restart
    assert!(rig.handle.is_emergency_active());
    let alarm = rig.handle.alarm();
    assert!(alarm.active);
    assert!(alarm.message.starts_with("EMERGENCY STOP"), "{}", alarm.message);
    rig.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unplugged_sensor_never_trips() {
    let dir = TempDir::new().unwrap();
    let mut settings = common::settings(&dir);
    settings.limits.pressure_1_max = Some(5.0);
    let sim = RigSimulator::default();
    sim.update(|s| {
        s.temperatures[1] = None;
        // decodes above the plausible range: sensor fault
        s.pressures[0] = Some(25.0);
    });
    let rig = common::start_with(sim, &settings, dir, Box::new(NullSink));

    let snapshot = rig.handle.wait_for_pass(2).await.unwrap();
    assert_eq!(snapshot.temperature(2), Reading::NotConnected);
    assert_eq!(snapshot.pressures[0], Reading::NotConnected);
    assert!(!snapshot.latches.any());
    assert!(!rig.handle.is_emergency_active());
    assert_eq!(common::group_writes(&rig.sim, GROUP_OPEN_ALL), 0);
    rig.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn emergency_survives_process_restart() {
    let dir = TempDir::new().unwrap();
    let settings = common::settings(&dir);
    let mut before = InstrumentSnapshot::default();
    before.heater_running[3] = true;
    before.heater_setpoints[3] = 90.0;
    PreEmergencySnapshot::capture(&before)
        .save(settings.application.state_file.as_deref().unwrap())
        .unwrap();

    let rig = common::start_with(RigSimulator::default(), &settings, dir, Box::new(NullSink));
    assert!(rig.handle.is_emergency_active());
    assert!(rig.handle.alarm().active);

    let report = rig.handle.restart().await.unwrap();
    assert_eq!(report.heaters_started, vec![4]);
    let sim = rig.sim.state();
    assert!(sim.heater_running[3]);
    assert_eq!(sim.heater_setpoints[3], 90);
    // heater 4 start relay is channel 7, register 6
    assert!(sim.relay_writes.contains(&(6, ON)));
    rig.app.shutdown().await;
}
