//! Message types for the bus worker.
//!
//! Everything that wants a device to do something sends a [`Command`] through a
//! [`CommandSender`]. The worker owns the matching [`CommandReceiver`] and is the
//! only code that ever touches a serial port. Synchronous callers attach a
//! oneshot reply channel and wait with a timeout; a timeout is reported as
//! [`DaqError::NoResponse`], never as success.

use crate::error::{AppResult, DaqError};
use crate::instrument::relay::is_start_relay;
use crate::snapshot::{Reading, FLOW_CHANNELS, HEATER_COUNT, TEMPERATURE_CHANNELS};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Scheduling tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Serviced before any further poll step, FIFO among themselves.
    Urgent,
    /// Serviced between poll steps.
    Background,
}

/// Who issued a command. Only operator commands are subject to the
/// emergency actuator gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// GUI, CLI or any other caller of `RigHandle`.
    Operator,
    /// The emergency sequencer.
    Interlock,
}

/// A request for the bus worker.
///
/// Addresses are TK4 unit addresses (1-based), channels are 1-based relay or
/// flow-controller channels.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Read the process value of one TK4 controller.
    ReadTemperature {
        /// TK4 unit address, 1..=6.
        address: u8,
    },
    /// Write a heater setpoint in °C.
    SetTemperatureSetpoint {
        /// Heater address, 1..=4.
        address: u8,
        /// Setpoint; fractional degrees are truncated on the wire.
        value: f64,
    },
    /// Put a heater controller in run mode.
    StartHeater {
        /// Heater address, 1..=4.
        address: u8,
    },
    /// Put a heater controller in stop mode.
    StopHeater {
        /// Heater address, 1..=4.
        address: u8,
    },
    /// Energise a relay channel for `duration`, then release it.
    PulseRelay {
        /// Relay channel, 1..=8.
        channel: u8,
        /// How long the relay stays energised.
        duration: Duration,
    },
    /// Group write: energise every relay.
    OpenAllRelays,
    /// Group write: release every relay.
    CloseAllRelays,
    /// Write a mass-flow controller setpoint.
    SetFlowSetpoint {
        /// Flow channel, 1..=4.
        channel: u8,
        /// Setpoint in the controller's units.
        value: f64,
    },
    /// Open or close a mass-flow controller valve.
    SetFlowEnabled {
        /// Flow channel, 1..=4.
        channel: u8,
        /// `true` opens the valve.
        enabled: bool,
    },
    /// Read one mass-flow controller.
    ReadFlow {
        /// Flow channel, 1..=4.
        channel: u8,
    },
    /// Read all four mass-flow controllers.
    ReadAllFlows,
    /// Read the mass-flow meter.
    ReadMeterFlow,
    /// Read the four PSM4 pressure channels.
    ReadPressures,
    /// Read power and integrated energy.
    ReadPower,
    /// Read the ten gas analyzer fields.
    ReadGasComposition,
    /// Reset the power meter integrator, then start it.
    StartIntegration,
    /// Stop the power meter integrator.
    StopIntegration,
    /// Reset the power meter integrator.
    ResetIntegration,
    /// Clear every hazard latch (issued by Restart).
    ResetLatches,
}

impl Command {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Command::ReadTemperature { .. } => "read_temperature",
            Command::SetTemperatureSetpoint { .. } => "set_temperature_setpoint",
            Command::StartHeater { .. } => "start_heater",
            Command::StopHeater { .. } => "stop_heater",
            Command::PulseRelay { .. } => "pulse_relay",
            Command::OpenAllRelays => "open_all_relays",
            Command::CloseAllRelays => "close_all_relays",
            Command::SetFlowSetpoint { .. } => "set_flow_setpoint",
            Command::SetFlowEnabled { .. } => "set_flow_enabled",
            Command::ReadFlow { .. } => "read_flow",
            Command::ReadAllFlows => "read_all_flows",
            Command::ReadMeterFlow => "read_meter_flow",
            Command::ReadPressures => "read_pressures",
            Command::ReadPower => "read_power",
            Command::ReadGasComposition => "read_gas_composition",
            Command::StartIntegration => "start_integration",
            Command::StopIntegration => "stop_integration",
            Command::ResetIntegration => "reset_integration",
            Command::ResetLatches => "reset_latches",
        }
    }

    /// Needs the ASCII protocol on the shared line.
    pub fn is_ascii(&self) -> bool {
        matches!(
            self,
            Command::SetFlowSetpoint { .. }
                | Command::SetFlowEnabled { .. }
                | Command::ReadFlow { .. }
                | Command::ReadAllFlows
                | Command::ReadMeterFlow
        )
    }

    /// Would put energy into the rig (blocked for operators during an emergency).
    pub fn energizes(&self) -> bool {
        match self {
            Command::StartHeater { .. } => true,
            // stop relays switch a heater off
            Command::PulseRelay { channel, .. } => is_start_relay(*channel),
            Command::SetFlowEnabled { enabled, .. } => *enabled,
            Command::SetTemperatureSetpoint { value, .. } | Command::SetFlowSetpoint { value, .. } => {
                *value != 0.0
            }
            _ => false,
        }
    }

    /// Range-check operator input before it reaches the wire.
    pub fn validate(&self, limits: &CommandLimits) -> AppResult<()> {
        let heater = |address: u8| {
            if (1..=HEATER_COUNT as u8).contains(&address) {
                Ok(())
            } else {
                Err(DaqError::Validation(format!("heater address {address} out of range 1..={HEATER_COUNT}")))
            }
        };
        let flow = |channel: u8| {
            if (1..=FLOW_CHANNELS as u8).contains(&channel) {
                Ok(())
            } else {
                Err(DaqError::Validation(format!("flow channel {channel} out of range 1..={FLOW_CHANNELS}")))
            }
        };
        let value_in = |value: f64, max: f64, what: &str| {
            if value.is_finite() && (0.0..=max).contains(&value) {
                Ok(())
            } else {
                Err(DaqError::Validation(format!("{what} {value} outside 0..={max}")))
            }
        };

        match self {
            Command::ReadTemperature { address } => {
                if (1..=TEMPERATURE_CHANNELS as u8).contains(address) {
                    Ok(())
                } else {
                    Err(DaqError::Validation(format!("temperature address {address} out of range")))
                }
            }
            Command::SetTemperatureSetpoint { address, value } => {
                heater(*address)?;
                value_in(*value, limits.max_heater_setpoint, "setpoint")
            }
            Command::StartHeater { address } | Command::StopHeater { address } => heater(*address),
            Command::PulseRelay { channel, duration } => {
                if !(1..=8).contains(channel) {
                    return Err(DaqError::Validation(format!("relay channel {channel} out of range 1..=8")));
                }
                if *duration > limits.max_pulse {
                    return Err(DaqError::Validation(format!("pulse of {duration:?} too long")));
                }
                Ok(())
            }
            Command::SetFlowSetpoint { channel, value } => {
                flow(*channel)?;
                value_in(*value, limits.max_flow_setpoint, "flow setpoint")
            }
            Command::SetFlowEnabled { channel, .. } | Command::ReadFlow { channel } => flow(*channel),
            _ => Ok(()),
        }
    }
}

/// Operator input limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandLimits {
    /// Largest heater setpoint, °C.
    pub max_heater_setpoint: f64,
    /// Largest flow setpoint.
    pub max_flow_setpoint: f64,
    /// Longest relay pulse.
    pub max_pulse: Duration,
}

impl Default for CommandLimits {
    fn default() -> Self {
        Self {
            max_heater_setpoint: 1200.0,
            max_flow_setpoint: 1000.0,
            max_pulse: Duration::from_secs(10),
        }
    }
}

/// Outcome delivered on a reply channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    /// Write acknowledged (`true`) or failed (`false`).
    Ack(bool),
    /// A single reading.
    Reading(Reading),
    /// One reading per channel, in channel order.
    Readings(Vec<Reading>),
    /// Power meter pair.
    Power {
        /// Active power, scaled.
        power: Reading,
        /// Integrated energy, scaled.
        energy: Reading,
    },
    /// Not executed; the message says why.
    Refused(String),
}

impl CommandReply {
    /// An acknowledged write or at least one value read.
    pub fn succeeded(&self) -> bool {
        match self {
            CommandReply::Ack(ok) => *ok,
            CommandReply::Reading(r) => r.is_value(),
            CommandReply::Readings(rs) => rs.iter().any(Reading::is_value),
            CommandReply::Power { power, .. } => power.is_value(),
            CommandReply::Refused(_) => false,
        }
    }
}

/// A queued command.
#[derive(Debug)]
pub struct Envelope {
    /// What to do.
    pub command: Command,
    /// Which queue it travels in.
    pub priority: Priority,
    /// Who asked.
    pub source: Source,
    /// Where the outcome goes, for synchronous callers.
    pub reply: Option<oneshot::Sender<CommandReply>>,
}

impl Envelope {
    /// Fire-and-forget envelope.
    pub fn new(command: Command, priority: Priority, source: Source) -> Self {
        Self {
            command,
            priority,
            source,
            reply: None,
        }
    }

    /// Helper to create an envelope with a reply channel.
    pub fn with_reply(
        command: Command,
        priority: Priority,
        source: Source,
    ) -> (Self, oneshot::Receiver<CommandReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                command,
                priority,
                source,
                reply: Some(tx),
            },
            rx,
        )
    }
}

/// Create the worker's command channel: one bounded queue per priority tier.
pub fn command_channel(capacity: usize, limits: CommandLimits) -> (CommandSender, CommandReceiver) {
    let (urgent_tx, urgent_rx) = mpsc::channel(capacity);
    let (background_tx, background_rx) = mpsc::channel(capacity);
    (
        CommandSender {
            urgent: urgent_tx,
            background: background_tx,
            source: Source::Operator,
            limits,
        },
        CommandReceiver {
            urgent: urgent_rx,
            background: background_rx,
        },
    )
}

/// Cloneable submission handle.
#[derive(Debug, Clone)]
pub struct CommandSender {
    urgent: mpsc::Sender<Envelope>,
    background: mpsc::Sender<Envelope>,
    source: Source,
    limits: CommandLimits,
}

impl CommandSender {
    /// A sender whose commands are tagged with `source`.
    pub fn with_source(&self, source: Source) -> Self {
        Self {
            source,
            ..self.clone()
        }
    }

    async fn enqueue(&self, envelope: Envelope) -> AppResult<()> {
        let queue = match envelope.priority {
            Priority::Urgent => &self.urgent,
            Priority::Background => &self.background,
        };
        queue.send(envelope).await.map_err(|_| DaqError::ChannelClosed)
    }

    /// Fire and forget.
    pub async fn submit(&self, command: Command, priority: Priority) -> AppResult<()> {
        command.validate(&self.limits)?;
        self.enqueue(Envelope::new(command, priority, self.source)).await
    }

    /// Submit and wait up to `timeout` for the worker's reply.
    pub async fn request(
        &self,
        command: Command,
        priority: Priority,
        timeout: Duration,
    ) -> AppResult<CommandReply> {
        command.validate(&self.limits)?;
        let label = command.label();
        let (envelope, rx) = Envelope::with_reply(command, priority, self.source);
        self.enqueue(envelope).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(DaqError::NoResponse(format!("{label}: worker dropped the request"))),
            Err(_) => Err(DaqError::NoResponse(format!("{label}: no reply within {timeout:?}"))),
        }
    }
}

/// Worker side of the command channel.
#[derive(Debug)]
pub struct CommandReceiver {
    urgent: mpsc::Receiver<Envelope>,
    background: mpsc::Receiver<Envelope>,
}

impl CommandReceiver {
    /// Next queued command without waiting, urgent tier first.
    ///
    /// Errors once every sender is gone and both queues are empty.
    pub fn try_next(&mut self) -> AppResult<Option<Envelope>> {
        use mpsc::error::TryRecvError;

        let urgent = match self.urgent.try_recv() {
            Ok(envelope) => return Ok(Some(envelope)),
            Err(e) => e,
        };
        match self.background.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Disconnected) if urgent == TryRecvError::Disconnected => {
                Err(DaqError::ChannelClosed)
            }
            Err(_) => Ok(None),
        }
    }

    /// Wait for the next command, urgent tier first. `None` once closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        tokio::select! {
            biased;
            Some(envelope) = self.urgent.recv() => Some(envelope),
            Some(envelope) = self.background.recv() => Some(envelope),
            else => None,
        }
    }
}
