//! Command-line entry point for the reactor rig controller.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reactor_daq::adapters::simulator::SimState;
use reactor_daq::adapters::{list_ports, RigSimulator};
use reactor_daq::app::{RigApp, RigHandle, RigLinks};
use reactor_daq::config::Settings;
use reactor_daq::datalog::CsvRowSink;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reactor_daq", version, about = "Reactor rig data acquisition and safety interlock")]
struct Cli {
    /// Settings file (TOML); REACTOR_* environment variables override it
    #[arg(short, long, default_value = "config/reactor.toml")]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run against the serial ports in the settings (default)
    Run,
    /// Run the same rig against the in-process simulator
    Simulate {
        /// Stop after this many poll passes
        #[arg(long)]
        passes: Option<u64>,
    },
    /// List the serial ports on this machine
    ListPorts,
    /// Write the effective settings (file, defaults and environment) as TOML
    WriteConfig {
        /// Target file; defaults to the --config path
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {:?}", cli.config))?;
    init_tracing(&settings.application.log_level, cli.json);

    match cli.mode.unwrap_or(Mode::Run) {
        Mode::Run => {
            info!(config = ?cli.config, "Starting rig on hardware ports");
            let links = RigLinks::from_settings(&settings.ports);
            run(&settings, links, None).await
        }
        Mode::Simulate { passes } => {
            info!("Starting rig on the simulator");
            let sim = RigSimulator::new(SimState {
                dynamics: true,
                ..SimState::default()
            });
            run(&settings, RigLinks::simulated(&sim), passes).await
        }
        Mode::ListPorts => {
            let ports = list_ports().context("Failed to enumerate serial ports")?;
            let configured = [
                ("rs485", &settings.ports.rs485),
                ("power_meter", &settings.ports.power_meter),
                ("gas_analyzer", &settings.ports.gas_analyzer),
            ];
            for port in &ports {
                let role = configured
                    .iter()
                    .find(|(_, name)| *name == port)
                    .map_or("", |(role, _)| *role);
                println!("{port}\t{role}");
            }
            for (role, name) in configured {
                if !ports.contains(name) {
                    warn!(role, port = %name, "Configured port not present");
                }
            }
            Ok(())
        }
        Mode::WriteConfig { output } => {
            let path = output.unwrap_or(cli.config);
            settings
                .save_to(&path)
                .with_context(|| format!("Failed to write settings to {path:?}"))?;
            info!(path = ?path, "Settings written");
            Ok(())
        }
    }
}

async fn run(settings: &Settings, links: RigLinks, passes: Option<u64>) -> Result<()> {
    let sink = CsvRowSink::new(settings.application.data_dir.clone())
        .with_context(|| format!("Failed to open data directory {:?}", settings.application.data_dir))?;
    let app = RigApp::start(settings, links, Box::new(sink));
    let handle = app.handle();
    tokio::spawn(report_alarms(handle.clone()));

    match passes {
        Some(passes) => {
            tokio::select! {
                snapshot = handle.wait_for_pass(passes) => {
                    let snapshot = snapshot.context("Rig stopped before the last pass")?;
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                }
                signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for Ctrl-C")?,
            }
        }
        None => tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?,
    }

    info!("Shutting down");
    app.shutdown().await;
    Ok(())
}

async fn report_alarms(handle: RigHandle) {
    let mut alarms = handle.subscribe_alarm();
    while alarms.changed().await.is_ok() {
        let alarm = alarms.borrow_and_update().clone();
        if alarm.active {
            warn!(target: "abnormal", message = %alarm.message, "ALARM");
        } else {
            info!(message = %alarm.message, "Alarm cleared");
        }
    }
}
