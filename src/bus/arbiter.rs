//! The bus worker.
//!
//! One task owns every serial port in the rig. Each turn of its loop it either
//! runs one queued command (urgent tier first) or one step of the round-robin
//! poll, so an urgent command never waits longer than a single device round
//! trip. After each full pass it stamps the snapshot, evaluates the hazard
//! latches, publishes the snapshot and hands a row to the data logger.

use super::line::{BusOwnership, SharedLine};
use crate::config::SchedulerConfig;
use crate::datalog::RowSink;
use crate::instrument::relay::stopped_heater;
use crate::instrument::{
    FlowController, FlowMeter, GasAnalyzer, HeaterController, PowerMeter, PressureModule,
    RelayModule,
};
use crate::messages::{Command, CommandReceiver, CommandReply, Envelope, Source};
use crate::safety::{EmergencyHandle, InterlockGate, LatchEvent, SafetyMonitor};
use crate::snapshot::{
    AlarmState, DataRow, DeviceEnabled, InstrumentSnapshot, Reading, FLOW_CHANNELS, GAS_NAMES,
    PRESSURE_CHANNELS,
};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// One device round trip of the background poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// One TK4 controller, by address.
    Temperature(u8),
    /// All four pressure channels.
    Pressures,
    /// Power and energy.
    Power,
    /// The mass-flow meter.
    FlowMeter,
    /// One mass-flow controller, by channel.
    FlowController(u8),
    /// All gas analyzer fields.
    GasAnalyzer,
}

/// Order of a full poll pass.
pub const POLL_SEQUENCE: [PollStep; 14] = [
    PollStep::Temperature(1),
    PollStep::Temperature(2),
    PollStep::Temperature(3),
    PollStep::Temperature(4),
    PollStep::Temperature(5),
    PollStep::Temperature(6),
    PollStep::Pressures,
    PollStep::Power,
    PollStep::FlowMeter,
    PollStep::FlowController(1),
    PollStep::FlowController(2),
    PollStep::FlowController(3),
    PollStep::FlowController(4),
    PollStep::GasAnalyzer,
];

fn index(one_based: u8) -> Option<usize> {
    usize::from(one_based).checked_sub(1)
}

impl PollStep {
    /// Whether the device behind this step is switched on in `devices`.
    pub fn is_enabled(self, devices: &DeviceEnabled) -> bool {
        match self {
            PollStep::Temperature(address) => index(address)
                .and_then(|i| devices.temperature.get(i))
                .copied()
                .unwrap_or(false),
            PollStep::Pressures => devices.pressure,
            PollStep::Power => devices.power_meter,
            PollStep::FlowMeter => devices.flow_meter,
            PollStep::FlowController(channel) => index(channel)
                .and_then(|i| devices.flow_controller.get(i))
                .copied()
                .unwrap_or(false),
            PollStep::GasAnalyzer => devices.gas_analyzer,
        }
    }

    /// The read this step performs.
    pub fn command(self) -> Command {
        match self {
            PollStep::Temperature(address) => Command::ReadTemperature { address },
            PollStep::Pressures => Command::ReadPressures,
            PollStep::Power => Command::ReadPower,
            PollStep::FlowMeter => Command::ReadMeterFlow,
            PollStep::FlowController(channel) => Command::ReadFlow { channel },
            PollStep::GasAnalyzer => Command::ReadGasComposition,
        }
    }
}

/// Worker timing.
#[derive(Debug, Clone, Copy)]
pub struct ArbiterConfig {
    /// Pause after a full pass.
    pub poll_interval: Duration,
    /// Upper bound on one idle wait for commands.
    pub command_poll: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for ArbiterConfig {
    fn from(scheduler: &SchedulerConfig) -> Self {
        Self {
            poll_interval: scheduler.poll_interval(),
            command_poll: scheduler.command_poll(),
        }
    }
}

/// The ports the worker owns.
pub struct BusDevices {
    /// The RS-485 line shared by the Modbus and ASCII families.
    pub line: SharedLine,
    /// Dedicated power meter port.
    pub power_meter: PowerMeter,
    /// Dedicated gas analyzer port.
    pub gas_analyzer: GasAnalyzer,
}

/// Owns every device and serialises all traffic to them.
pub struct BusArbiter {
    line: SharedLine,
    power_meter: PowerMeter,
    gas_analyzer: GasAnalyzer,
    heaters: HeaterController,
    pressure: PressureModule,
    relays: RelayModule,
    flow_controllers: FlowController,
    flow_meter: FlowMeter,
    monitor: SafetyMonitor,
    snapshot: InstrumentSnapshot,
    published: watch::Sender<InstrumentSnapshot>,
    alarm: Arc<watch::Sender<AlarmState>>,
    emergency: EmergencyHandle,
    gate: InterlockGate,
    sink: Box<dyn RowSink>,
    config: ArbiterConfig,
    cursor: usize,
    next_pass: Instant,
}

impl BusArbiter {
    /// The worker starts from the snapshot currently held by `published`.
    pub fn new(
        devices: BusDevices,
        published: watch::Sender<InstrumentSnapshot>,
        alarm: Arc<watch::Sender<AlarmState>>,
        emergency: EmergencyHandle,
        monitor: SafetyMonitor,
        sink: Box<dyn RowSink>,
        config: ArbiterConfig,
    ) -> Self {
        let snapshot = published.borrow().clone();
        Self {
            line: devices.line,
            power_meter: devices.power_meter,
            gas_analyzer: devices.gas_analyzer,
            heaters: HeaterController,
            pressure: PressureModule::default(),
            relays: RelayModule::default(),
            flow_controllers: FlowController,
            flow_meter: FlowMeter::default(),
            monitor,
            snapshot,
            published,
            alarm,
            gate: emergency.gate().clone(),
            emergency,
            sink,
            config,
            cursor: 0,
            next_pass: Instant::now(),
        }
    }

    /// Run until `shutdown` turns true or every command sender is gone.
    pub async fn run(mut self, mut commands: CommandReceiver, mut shutdown: watch::Receiver<bool>) {
        info!(port = self.line.port_name(), "Bus worker started");
        self.next_pass = Instant::now();

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested");
                break;
            }

            match commands.try_next() {
                Ok(Some(envelope)) => {
                    self.dispatch(envelope).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Command channel closed, stopping bus worker");
                    break;
                }
            }

            if Instant::now() >= self.next_pass {
                self.poll_step().await;
                continue;
            }

            let wake = self.next_pass.min(Instant::now() + self.config.command_poll);
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown signal dropped");
                        break;
                    }
                }
                envelope = commands.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope).await,
                    None => {
                        error!("Command channel closed, stopping bus worker");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(wake) => {}
            }
        }

        self.close_all().await;
    }

    async fn close_all(&mut self) {
        self.line.release().await;
        self.power_meter.close().await;
        self.gas_analyzer.close().await;
        info!("Bus worker stopped, all ports closed");
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        let Envelope {
            command,
            priority,
            source,
            reply,
        } = envelope;

        let outcome = if source == Source::Operator && self.gate.is_engaged() && command.energizes() {
            warn!(command = command.label(), "Refused: emergency stop active");
            CommandReply::Refused("emergency stop active".to_string())
        } else {
            debug!(command = command.label(), ?priority, ?source, "Executing command");
            let outcome = self.execute(&command).await;
            self.publish();
            outcome
        };

        if !outcome.succeeded() {
            debug!(command = command.label(), reply = ?outcome, "Command did not succeed");
        }
        if let Some(reply) = reply {
            if reply.send(outcome).is_err() {
                debug!(command = command.label(), "Requester gave up before the reply");
            }
        }
    }

    async fn poll_step(&mut self) {
        if let Some(step) = POLL_SEQUENCE.get(self.cursor).copied() {
            self.cursor += 1;
            if step.is_enabled(&self.snapshot.devices) {
                trace!(?step, "Poll step");
                self.execute(&step.command()).await;
            }
        }
        if self.cursor >= POLL_SEQUENCE.len() {
            self.cursor = 0;
            self.finish_pass();
            self.next_pass = Instant::now() + self.config.poll_interval;
        }
    }

    async fn execute(&mut self, command: &Command) -> CommandReply {
        let reply = match command {
            Command::ReadPower => {
                let (power, energy) = self.power_meter.read().await;
                CommandReply::Power { power, energy }
            }
            Command::StartIntegration => CommandReply::Ack(self.power_meter.start_integration().await),
            Command::StopIntegration => CommandReply::Ack(self.power_meter.stop_integration().await),
            Command::ResetIntegration => CommandReply::Ack(self.power_meter.reset_integration().await),
            Command::ReadGasComposition => {
                CommandReply::Readings(self.gas_analyzer.read_gases().await.to_vec())
            }
            Command::ResetLatches => {
                self.snapshot.latches.clear();
                info!(target: "abnormal", "Hazard latches reset");
                CommandReply::Ack(true)
            }
            c if c.is_ascii() => self.ascii_command(c).await,
            c => self.binary_command(c).await,
        };
        self.apply(command, &reply);
        reply
    }

    async fn binary_command(&mut self, command: &Command) -> CommandReply {
        let mut bus = match self.line.claim_binary().await {
            Ok(bus) => bus,
            Err(e) => {
                warn!(command = command.label(), error = %e, "Shared line unavailable");
                return unanswered(command);
            }
        };
        match command {
            Command::ReadTemperature { address } => {
                CommandReply::Reading(self.heaters.read_temperature(&mut bus, *address).await)
            }
            Command::SetTemperatureSetpoint { address, value } => {
                CommandReply::Ack(self.heaters.set_setpoint(&mut bus, *address, *value).await)
            }
            Command::StartHeater { address } => CommandReply::Ack(self.heaters.start(&mut bus, *address).await),
            Command::StopHeater { address } => CommandReply::Ack(self.heaters.stop(&mut bus, *address).await),
            Command::PulseRelay { channel, duration } => {
                CommandReply::Ack(self.relays.pulse(&mut bus, *channel, *duration).await)
            }
            Command::OpenAllRelays => CommandReply::Ack(self.relays.open_all(&mut bus).await),
            Command::CloseAllRelays => CommandReply::Ack(self.relays.close_all(&mut bus).await),
            Command::ReadPressures => {
                CommandReply::Readings(self.pressure.read_all_pressures(&mut bus).await.to_vec())
            }
            other => unanswered(other),
        }
    }

    /// Run an ASCII command with the line switched to ASCII framing.
    ///
    /// The binary family reclaims the line afterwards on every path, including
    /// a failed claim.
    async fn ascii_command(&mut self, command: &Command) -> CommandReply {
        let reply = match self.line.claim_ascii().await {
            Ok(mut bus) => match command {
                Command::ReadFlow { channel } => {
                    CommandReply::Reading(self.flow_controllers.read_flow(&mut bus, *channel).await)
                }
                Command::ReadAllFlows => {
                    CommandReply::Readings(self.flow_controllers.read_all(&mut bus).await.to_vec())
                }
                Command::ReadMeterFlow => CommandReply::Reading(self.flow_meter.read_flow(&mut bus).await),
                Command::SetFlowSetpoint { channel, value } => {
                    CommandReply::Ack(self.flow_controllers.set_flow(&mut bus, *channel, *value).await)
                }
                Command::SetFlowEnabled { channel, enabled } => CommandReply::Ack(
                    self.flow_controllers
                        .set_enabled(&mut bus, *channel, *enabled)
                        .await,
                ),
                other => unanswered(other),
            },
            Err(e) => {
                warn!(command = command.label(), error = %e, "Could not hand the line to the ASCII devices");
                unanswered(command)
            }
        };

        if let Err(e) = self.line.claim(BusOwnership::BinaryProtocolOwner).await {
            warn!(error = %e, "Could not return the line to the Modbus devices");
        }
        reply
    }

    /// Fold a command outcome into the snapshot.
    fn apply(&mut self, command: &Command, reply: &CommandReply) {
        let snap = &mut self.snapshot;
        match (command, reply) {
            (Command::ReadTemperature { address }, CommandReply::Reading(r)) => {
                if let Some(slot) = index(*address).and_then(|i| snap.temperatures.get_mut(i)) {
                    *slot = *r;
                }
            }
            (Command::ReadFlow { channel }, CommandReply::Reading(r)) => {
                if let Some(slot) = index(*channel).and_then(|i| snap.flows.get_mut(i)) {
                    *slot = *r;
                }
            }
            (Command::ReadMeterFlow, CommandReply::Reading(r)) => snap.flow_meter = *r,
            (Command::ReadPressures, CommandReply::Readings(rs)) => copy_into(&mut snap.pressures, rs),
            (Command::ReadAllFlows, CommandReply::Readings(rs)) => copy_into(&mut snap.flows, rs),
            (Command::ReadGasComposition, CommandReply::Readings(rs)) => copy_into(&mut snap.gases, rs),
            (Command::ReadPower, CommandReply::Power { power, energy }) => {
                snap.power = *power;
                snap.energy = *energy;
            }
            (Command::SetTemperatureSetpoint { address, value }, CommandReply::Ack(true)) => {
                if let Some(slot) = index(*address).and_then(|i| snap.heater_setpoints.get_mut(i)) {
                    *slot = *value;
                }
            }
            (Command::StartHeater { address }, CommandReply::Ack(true)) => {
                if let Some(slot) = index(*address).and_then(|i| snap.heater_running.get_mut(i)) {
                    *slot = true;
                }
            }
            (Command::StopHeater { address }, CommandReply::Ack(true)) => {
                if let Some(slot) = index(*address).and_then(|i| snap.heater_running.get_mut(i)) {
                    *slot = false;
                }
            }
            (Command::PulseRelay { channel, .. }, CommandReply::Ack(true)) => {
                if let Some(slot) = stopped_heater(*channel).and_then(|i| snap.heater_running.get_mut(i)) {
                    *slot = false;
                }
            }
            (Command::SetFlowSetpoint { channel, value }, CommandReply::Ack(true)) => {
                if let Some(slot) = index(*channel).and_then(|i| snap.flow_setpoints.get_mut(i)) {
                    *slot = *value;
                }
            }
            (Command::SetFlowEnabled { channel, enabled }, CommandReply::Ack(true)) => {
                if let Some(slot) = index(*channel).and_then(|i| snap.flow_enabled.get_mut(i)) {
                    *slot = *enabled;
                }
            }
            _ => {}
        }
    }

    fn finish_pass(&mut self) {
        let now = Local::now();
        self.snapshot.pass_count += 1;
        self.snapshot.updated_at = Some(now);

        let events = self.monitor.evaluate(&mut self.snapshot);
        self.publish();

        if let Err(e) = self.sink.append(&DataRow::from_snapshot(&self.snapshot, now)) {
            warn!(error = %e, "Could not log data row");
        }

        for event in events {
            let message = event.message();
            match event {
                LatchEvent::Tripped { .. } => {
                    error!(target: "abnormal", "{message}");
                    self.alarm.send_replace(AlarmState::raised(message.clone()));
                    if !self.emergency.trigger(message) {
                        error!("Emergency stop could not be requested");
                    }
                }
                LatchEvent::Cleared { .. } => {
                    warn!(target: "abnormal", "{message}");
                    // the emergency banner stays until Restart
                    if !self.gate.is_engaged() {
                        let active = self.snapshot.latches.any();
                        self.alarm.send_replace(AlarmState { active, message });
                    }
                }
            }
        }
        debug!(pass = self.snapshot.pass_count, "Poll pass complete");
    }

    fn publish(&self) {
        self.published.send_replace(self.snapshot.clone());
    }
}

fn copy_into<const N: usize>(target: &mut [Reading; N], readings: &[Reading]) {
    for (slot, reading) in target.iter_mut().zip(readings) {
        *slot = *reading;
    }
}

/// The reply for a command whose device could not be reached.
fn unanswered(command: &Command) -> CommandReply {
    match command {
        Command::ReadTemperature { .. } | Command::ReadFlow { .. } | Command::ReadMeterFlow => {
            CommandReply::Reading(Reading::NotConnected)
        }
        Command::ReadPressures => CommandReply::Readings(vec![Reading::NotConnected; PRESSURE_CHANNELS]),
        Command::ReadAllFlows => CommandReply::Readings(vec![Reading::NotConnected; FLOW_CHANNELS]),
        Command::ReadGasComposition => CommandReply::Readings(vec![Reading::NotConnected; GAS_NAMES.len()]),
        Command::ReadPower => CommandReply::Power {
            power: Reading::NotConnected,
            energy: Reading::NotConnected,
        },
        _ => CommandReply::Ack(false),
    }
}
