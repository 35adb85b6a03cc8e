//! Urgent commands are serviced before queued background work and poll steps.

mod common;

use reactor_daq::adapters::RigSimulator;
use reactor_daq::instrument::heater::{PV_REGISTER, SV_REGISTER};
use reactor_daq::messages::{Command, CommandReply, Priority};
use reactor_daq::protocol::modbus::RegisterRequest;

#[tokio::test(start_paused = true)]
async fn urgent_setpoint_runs_before_queued_poll_read() {
    let (rig, _rows) = common::start(RigSimulator::default());

    // Both are queued before the worker gets to run.
    rig.handle
        .submit(Command::ReadTemperature { address: 2 }, Priority::Background)
        .await
        .unwrap();
    rig.handle
        .submit(
            Command::SetTemperatureSetpoint { address: 2, value: 250.0 },
            Priority::Urgent,
        )
        .await
        .unwrap();

    rig.handle.wait_for_pass(1).await.unwrap();

    let writes = rig.rs485.writes();
    assert_eq!(writes[0], RegisterRequest::write(2, SV_REGISTER, 250).encode());
    assert_eq!(writes[1], RegisterRequest::read(2, PV_REGISTER, 2).encode());
    // then the first poll step
    assert_eq!(writes[2], RegisterRequest::read(1, PV_REGISTER, 2).encode());

    assert_eq!(rig.sim.state().heater_setpoints[1], 250);
    assert_eq!(rig.handle.snapshot().heater_setpoints[1], 250.0);
    rig.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn urgent_commands_keep_fifo_order() {
    let (rig, _rows) = common::start(RigSimulator::default());

    for address in [3u8, 1, 4] {
        rig.handle
            .submit(Command::StartHeater { address }, Priority::Urgent)
            .await
            .unwrap();
    }
    let reply = rig
        .handle
        .request(Command::ReadPressures, Priority::Urgent)
        .await
        .unwrap();
    assert!(matches!(reply, CommandReply::Readings(ref r) if r.len() == 4));

    let units: Vec<u8> = rig.rs485.writes().iter().take(3).map(|frame| frame[0]).collect();
    assert_eq!(units, vec![3, 1, 4]);
    rig.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn requests_are_answered_while_polling() {
    let (rig, _rows) = common::start(RigSimulator::default());
    rig.handle.wait_for_pass(2).await.unwrap();

    let replies = futures::future::join_all((1..=6u8).map(|address| {
        rig.handle
            .request(Command::ReadTemperature { address }, Priority::Background)
    }))
    .await;
    for reply in replies {
        assert!(reply.unwrap().succeeded());
    }
    rig.app.shutdown().await;
}
