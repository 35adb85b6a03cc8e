//! Emergency stop and restart.
//!
//! The sequencer runs as its own task and talks to the bus worker only through
//! the command channel, so the worker can trigger an emergency without waiting
//! on itself. While an emergency is active the [`InterlockGate`] is engaged and
//! the worker refuses energising operator commands; the sequencer's own
//! commands carry [`Source::Interlock`] and pass.
//!
//! The pre-emergency snapshot is written to the state file as soon as it is
//! taken, so a process restart during an emergency comes back still stopped
//! and still able to resume the previous operating point.

use crate::error::{AppResult, DaqError};
use crate::instrument::relay::heater_start_relay;
use crate::messages::{Command, CommandSender, Priority, Source};
use crate::snapshot::{AlarmState, InstrumentSnapshot, FLOW_CHANNELS, HEATER_COUNT};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Actuator gate shared by the sequencer and the bus worker.
#[derive(Debug, Clone, Default)]
pub struct InterlockGate(Arc<AtomicBool>);

impl InterlockGate {
    /// An emergency is active.
    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Engage the gate. Returns `false` if it was already engaged.
    pub fn engage(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    /// Let operator commands through again.
    pub fn release(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Actuator state captured at the moment an emergency starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreEmergencySnapshot {
    /// Heaters that were running.
    pub heater_on: [bool; HEATER_COUNT],
    /// Heater setpoints, °C.
    pub heater_setpoints: [f64; HEATER_COUNT],
    /// Flow controllers that were open.
    pub flow_on: [bool; FLOW_CHANNELS],
    /// Flow setpoints.
    pub flow_setpoints: [f64; FLOW_CHANNELS],
    /// When the emergency started.
    pub taken_at: DateTime<Local>,
}

impl PreEmergencySnapshot {
    /// Copy the actuator state out of a live snapshot.
    pub fn capture(snapshot: &InstrumentSnapshot) -> Self {
        Self {
            heater_on: snapshot.heater_running,
            heater_setpoints: snapshot.heater_setpoints,
            flow_on: snapshot.flow_enabled,
            flow_setpoints: snapshot.flow_setpoints,
            taken_at: Local::now(),
        }
    }

    /// Read a persisted snapshot; `Ok(None)` if there is no file.
    pub fn load(path: &Path) -> AppResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map(Some)
            .map_err(|e| DaqError::Persistence(format!("{}: {e}", path.display())))
    }

    /// Write the snapshot as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| DaqError::Persistence(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// What a restart managed to bring back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestartReport {
    /// Heater addresses started again.
    pub heaters_started: Vec<u8>,
    /// Flow channels enabled again.
    pub flows_enabled: Vec<u8>,
    /// Commands that failed or timed out; the restart carried on past them.
    pub failures: Vec<String>,
    /// `false` if there was no emergency to restart from.
    pub resumed: bool,
}

/// Sequencer timing and persistence.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Timeout for the relay-open request during activation.
    pub reply_timeout: Duration,
    /// Timeout for each request issued during restart.
    pub restart_reply_timeout: Duration,
    /// Delay between opening and re-closing all relays.
    pub relay_close_delay: Duration,
    /// Length of the heater start-relay pulse on restart.
    pub start_pulse: Duration,
    /// Where the pre-emergency snapshot is persisted, if anywhere.
    pub state_file: Option<PathBuf>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(2),
            restart_reply_timeout: Duration::from_secs(4),
            relay_close_delay: Duration::from_secs(1),
            start_pulse: Duration::from_secs(1),
            state_file: None,
        }
    }
}

#[derive(Debug)]
enum EmergencyRequest {
    Trigger { reason: String },
    Restart { reply: oneshot::Sender<RestartReport> },
}

/// Cloneable handle to the running sequencer.
#[derive(Debug, Clone)]
pub struct EmergencyHandle {
    tx: mpsc::Sender<EmergencyRequest>,
    gate: InterlockGate,
}

impl EmergencyHandle {
    /// Request an emergency stop without waiting for it.
    ///
    /// Returns `false` if the request could not be queued. Triggering while an
    /// emergency is already active is accepted and ignored by the sequencer.
    pub fn trigger(&self, reason: impl Into<String>) -> bool {
        match self.tx.try_send(EmergencyRequest::Trigger { reason: reason.into() }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // a trigger is already pending
                warn!("Emergency queue full, trigger coalesced");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Emergency sequencer is not running");
                false
            }
        }
    }

    /// Resume the pre-emergency operating point and wait for the outcome.
    pub async fn restart(&self) -> AppResult<RestartReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EmergencyRequest::Restart { reply })
            .await
            .map_err(|_| DaqError::ChannelClosed)?;
        rx.await.map_err(|_| DaqError::ChannelClosed)
    }

    /// An emergency is active.
    pub fn is_active(&self) -> bool {
        self.gate.is_engaged()
    }

    /// The gate this sequencer engages.
    pub fn gate(&self) -> &InterlockGate {
        &self.gate
    }
}

/// Drives the rig into its safe state and back out again.
pub struct EmergencySequencer {
    commands: CommandSender,
    snapshot: watch::Receiver<InstrumentSnapshot>,
    alarm: Arc<watch::Sender<AlarmState>>,
    gate: InterlockGate,
    config: SequencerConfig,
    pre_emergency: Option<PreEmergencySnapshot>,
}

impl EmergencySequencer {
    /// Build the sequencer, restoring a persisted emergency if one exists.
    pub fn new(
        commands: &CommandSender,
        snapshot: watch::Receiver<InstrumentSnapshot>,
        alarm: Arc<watch::Sender<AlarmState>>,
        gate: InterlockGate,
        config: SequencerConfig,
    ) -> Self {
        let pre_emergency = match config.state_file.as_deref().map(PreEmergencySnapshot::load) {
            Some(Ok(Some(saved))) => {
                warn!(taken_at = %saved.taken_at, "Restored pre-emergency snapshot; rig stays stopped until restart");
                gate.engage();
                alarm.send_replace(AlarmState::raised("EMERGENCY STOP: restored from previous session"));
                Some(saved)
            }
            Some(Err(e)) => {
                warn!(error = %e, "Ignoring unreadable pre-emergency state file");
                None
            }
            _ => None,
        };

        Self {
            commands: commands.with_source(Source::Interlock),
            snapshot,
            alarm,
            gate,
            config,
            pre_emergency,
        }
    }

    /// Spawn the sequencer task.
    pub fn spawn(self) -> (EmergencyHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(4);
        let handle = EmergencyHandle {
            tx,
            gate: self.gate.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut requests: mpsc::Receiver<EmergencyRequest>) {
        while let Some(request) = requests.recv().await {
            match request {
                EmergencyRequest::Trigger { reason } => self.activate(&reason).await,
                EmergencyRequest::Restart { reply } => {
                    let report = self.restart().await;
                    let _ = reply.send(report);
                }
            }
        }
        info!("Emergency sequencer stopped");
    }

    async fn activate(&mut self, reason: &str) {
        if !self.gate.engage() {
            info!(reason, "Emergency already active");
            return;
        }

        let pre = PreEmergencySnapshot::capture(&self.snapshot.borrow());
        if let Some(path) = &self.config.state_file {
            if let Err(e) = pre.save(path) {
                error!(error = %e, "Could not persist pre-emergency snapshot");
            }
        }
        self.pre_emergency = Some(pre);

        let message = format!("EMERGENCY STOP: {reason}");
        error!(target: "abnormal", "{message}");
        self.alarm.send_replace(AlarmState::raised(message));

        match self
            .commands
            .request(Command::OpenAllRelays, Priority::Urgent, self.config.reply_timeout)
            .await
        {
            Ok(reply) if reply.succeeded() => info!("All relays opened"),
            Ok(reply) => error!(?reply, "Opening all relays failed"),
            Err(e) => error!(error = %e, "Opening all relays did not complete"),
        }

        let commands = self.commands.clone();
        let delay = self.config.relay_close_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = commands.submit(Command::CloseAllRelays, Priority::Urgent).await {
                warn!(error = %e, "Could not queue relay close");
            }
        });

        let mut shutdown = Vec::with_capacity(2 * (HEATER_COUNT + FLOW_CHANNELS));
        for address in 1..=HEATER_COUNT as u8 {
            shutdown.push(Command::SetTemperatureSetpoint { address, value: 0.0 });
            shutdown.push(Command::StopHeater { address });
        }
        for channel in 1..=FLOW_CHANNELS as u8 {
            shutdown.push(Command::SetFlowSetpoint { channel, value: 0.0 });
            shutdown.push(Command::SetFlowEnabled { channel, enabled: false });
        }
        for command in shutdown {
            if let Err(e) = self.commands.submit(command, Priority::Background).await {
                warn!(error = %e, "Could not queue safe-state command");
            }
        }
    }

    async fn send(&self, command: Command, report: &mut RestartReport) -> bool {
        let label = command.label();
        match self
            .commands
            .request(command, Priority::Urgent, self.config.restart_reply_timeout)
            .await
        {
            Ok(reply) if reply.succeeded() => true,
            Ok(reply) => {
                report.failures.push(format!("{label}: {reply:?}"));
                false
            }
            Err(e) => {
                report.failures.push(format!("{label}: {e}"));
                false
            }
        }
    }

    async fn restart(&mut self) -> RestartReport {
        let mut report = RestartReport::default();
        let Some(pre) = self.pre_emergency.clone() else {
            warn!("Restart requested with no emergency active");
            return report;
        };
        info!(taken_at = %pre.taken_at, "Restarting from pre-emergency snapshot");

        for index in 0..HEATER_COUNT {
            let address = index as u8 + 1;
            let value = pre.heater_setpoints[index];
            self.send(Command::SetTemperatureSetpoint { address, value }, &mut report).await;
            if pre.heater_on[index] && self.send(Command::StartHeater { address }, &mut report).await {
                report.heaters_started.push(address);
            }
        }

        for index in 0..FLOW_CHANNELS {
            let channel = index as u8 + 1;
            let value = pre.flow_setpoints[index];
            self.send(Command::SetFlowSetpoint { channel, value }, &mut report).await;
            if pre.flow_on[index]
                && self
                    .send(Command::SetFlowEnabled { channel, enabled: true }, &mut report)
                    .await
            {
                report.flows_enabled.push(channel);
            }
        }

        for index in (0..HEATER_COUNT).filter(|i| pre.heater_on[*i]) {
            let pulse = Command::PulseRelay {
                channel: heater_start_relay(index),
                duration: self.config.start_pulse,
            };
            self.send(pulse, &mut report).await;
        }

        self.send(Command::ResetLatches, &mut report).await;

        if let Some(path) = &self.config.state_file {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %e, "Could not remove pre-emergency state file");
                }
            }
        }
        self.pre_emergency = None;
        self.gate.release();
        self.alarm.send_replace(AlarmState::cleared("RESTART: Operation resumed."));
        report.resumed = true;

        if report.failures.is_empty() {
            info!("Operation resumed");
        } else {
            warn!(failures = ?report.failures, "Operation resumed with failures");
        }
        report
    }
}
