//! Rig wiring.
//!
//! [`RigApp::start`] builds the command channel, the snapshot and alarm watch
//! channels, spawns the emergency sequencer and the bus worker, and hands out a
//! cloneable [`RigHandle`] for everything else (CLI, GUI, tests).

use crate::adapters::{LineSettings, RigSimulator, SerialLink, SerialPortLink};
use crate::bus::arbiter::{ArbiterConfig, BusDevices};
use crate::bus::{BusArbiter, SharedLine};
use crate::config::{PortConfig, Settings};
use crate::datalog::RowSink;
use crate::error::{AppResult, DaqError};
use crate::instrument::relay::heater_stop_relay;
use crate::instrument::{GasAnalyzer, PowerMeter};
use crate::messages::{command_channel, Command, CommandReply, CommandSender, Priority};
use crate::safety::{
    EmergencyHandle, EmergencySequencer, InterlockGate, RestartReport, SafetyMonitor,
    SequencerConfig,
};
use crate::snapshot::{AlarmState, InstrumentSnapshot, HEATER_COUNT};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Length of the operator heater stop pulse.
pub const STOP_PULSE: Duration = Duration::from_secs(1);

/// The three ports of the rig.
pub struct RigLinks {
    /// Shared RS-485 line.
    pub rs485: Box<dyn SerialLink>,
    /// Power meter port.
    pub power_meter: Box<dyn SerialLink>,
    /// Gas analyzer port.
    pub gas_analyzer: Box<dyn SerialLink>,
}

impl RigLinks {
    /// Hardware ports named in the settings. Nothing is opened yet.
    pub fn from_settings(ports: &PortConfig) -> Self {
        Self {
            rs485: Box::new(SerialPortLink::new(&ports.rs485)),
            power_meter: Box::new(SerialPortLink::new(&ports.power_meter)),
            gas_analyzer: Box::new(SerialPortLink::new(&ports.gas_analyzer)),
        }
    }

    /// Links into `sim`.
    pub fn simulated(sim: &RigSimulator) -> Self {
        Self {
            rs485: Box::new(sim.rs485_link("sim-rs485")),
            power_meter: Box::new(sim.power_meter_link("sim-power")),
            gas_analyzer: Box::new(sim.gas_analyzer_link("sim-gas")),
        }
    }
}

/// Snapshot the worker starts from: enabled flags and last confirmed setpoints.
pub fn initial_snapshot(settings: &Settings) -> InstrumentSnapshot {
    InstrumentSnapshot {
        devices: settings.devices.clone(),
        heater_setpoints: settings.heaters.setpoints,
        flow_setpoints: settings.flows.setpoints,
        ..InstrumentSnapshot::default()
    }
}

/// Cloneable access to a running rig.
#[derive(Debug, Clone)]
pub struct RigHandle {
    commands: CommandSender,
    snapshot: watch::Receiver<InstrumentSnapshot>,
    alarm: watch::Receiver<AlarmState>,
    emergency: EmergencyHandle,
    reply_timeout: Duration,
}

impl RigHandle {
    /// The operator command sender.
    pub fn commands(&self) -> &CommandSender {
        &self.commands
    }

    /// Submit and wait for the reply, bounded by the configured reply timeout.
    pub async fn request(&self, command: Command, priority: Priority) -> AppResult<CommandReply> {
        self.commands.request(command, priority, self.reply_timeout).await
    }

    /// Fire and forget.
    pub async fn submit(&self, command: Command, priority: Priority) -> AppResult<()> {
        self.commands.submit(command, priority).await
    }

    /// Copy of the latest published snapshot.
    pub fn snapshot(&self) -> InstrumentSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Follow every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<InstrumentSnapshot> {
        self.snapshot.clone()
    }

    /// Current alarm banner.
    pub fn alarm(&self) -> AlarmState {
        self.alarm.borrow().clone()
    }

    /// Follow alarm changes.
    pub fn subscribe_alarm(&self) -> watch::Receiver<AlarmState> {
        self.alarm.clone()
    }

    /// Operator emergency stop.
    pub fn emergency_stop(&self, reason: &str) -> bool {
        warn!(target: "abnormal", reason, "Emergency stop requested by operator");
        self.emergency.trigger(format!("operator: {reason}"))
    }

    /// Switch heater `address` (1-based) off through its stop relay.
    ///
    /// Stop pulses pass the emergency gate.
    pub async fn stop_heater(&self, address: u8) -> AppResult<CommandReply> {
        let index = usize::from(address)
            .checked_sub(1)
            .filter(|i| *i < HEATER_COUNT)
            .ok_or_else(|| DaqError::Validation(format!("heater address {address} out of range 1..={HEATER_COUNT}")))?;
        let pulse = Command::PulseRelay {
            channel: heater_stop_relay(index),
            duration: STOP_PULSE,
        };
        self.request(pulse, Priority::Urgent).await
    }

    /// Resume from the pre-emergency snapshot.
    pub async fn restart(&self) -> AppResult<RestartReport> {
        self.emergency.restart().await
    }

    /// An emergency stop is in force.
    pub fn is_emergency_active(&self) -> bool {
        self.emergency.is_active()
    }

    /// Wait until at least `pass` poll passes have completed.
    pub async fn wait_for_pass(&self, pass: u64) -> AppResult<InstrumentSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| s.pass_count >= pass)
            .await
            .map_err(|_| DaqError::ChannelClosed)?;
        Ok(snapshot.clone())
    }
}

/// A running rig: sequencer and bus worker tasks.
pub struct RigApp {
    handle: RigHandle,
    shutdown: watch::Sender<bool>,
    worker: JoinHandle<()>,
    sequencer: JoinHandle<()>,
}

impl RigApp {
    /// Spawn the sequencer and the bus worker. Must be called inside a Tokio runtime.
    pub fn start(settings: &Settings, links: RigLinks, sink: Box<dyn RowSink>) -> Self {
        let scheduler = &settings.scheduler;
        let (commands, receiver) = command_channel(
            scheduler.command_channel_capacity,
            settings.limits.command_limits(),
        );
        let (published, snapshot) = watch::channel(initial_snapshot(settings));
        let (alarm_tx, alarm) = watch::channel(AlarmState::default());
        let alarm_tx = Arc::new(alarm_tx);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let sequencer = EmergencySequencer::new(
            &commands,
            snapshot.clone(),
            alarm_tx.clone(),
            InterlockGate::default(),
            SequencerConfig {
                reply_timeout: scheduler.reply_timeout(),
                restart_reply_timeout: scheduler.restart_reply_timeout(),
                state_file: settings.application.state_file.clone(),
                ..SequencerConfig::default()
            },
        );
        let (emergency, sequencer) = sequencer.spawn();

        let ports = &settings.ports;
        let devices = BusDevices {
            line: SharedLine::new(links.rs485, scheduler.reconnect_settle()),
            power_meter: PowerMeter::new(
                links.power_meter,
                LineSettings::power_meter().with_baud_rate(ports.power_meter_baud),
                settings.power_meter.scaling_factor,
            ),
            gas_analyzer: GasAnalyzer::new(
                links.gas_analyzer,
                LineSettings::gas_analyzer().with_baud_rate(ports.gas_analyzer_baud),
            ),
        };
        let arbiter = BusArbiter::new(
            devices,
            published,
            alarm_tx,
            emergency.clone(),
            SafetyMonitor::from_limits(&settings.limits),
            sink,
            ArbiterConfig::from(scheduler),
        );
        let worker = tokio::spawn(arbiter.run(receiver, shutdown_rx));
        info!(name = %settings.application.name, "Rig started");

        Self {
            handle: RigHandle {
                commands,
                snapshot,
                alarm,
                emergency,
                reply_timeout: scheduler.reply_timeout(),
            },
            shutdown,
            worker,
            sequencer,
        }
    }

    /// A handle to this rig.
    pub fn handle(&self) -> RigHandle {
        self.handle.clone()
    }

    /// Stop the worker, wait for it to close its ports, then stop the sequencer.
    pub async fn shutdown(self) {
        // the worker may already be gone
        let _ = self.shutdown.send(true);
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Bus worker ended abnormally");
        }
        self.sequencer.abort();
        info!("Rig stopped");
    }
}
