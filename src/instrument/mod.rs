//! Device drivers.
//!
//! Drivers on the shared RS-485 line are stateless and borrow a protocol session
//! per call (`RegisterBus` for the Modbus devices, `FramedBus` for the flow
//! devices). The power meter and the gas analyzer own their dedicated ports.
//!
//! No driver returns an error: failures are logged and surface as
//! `Reading::NotConnected` or a `false` acknowledgement.

pub mod flow_controller;
pub mod flow_meter;
pub mod gas_analyzer;
pub mod heater;
pub mod power_meter;
pub mod pressure;
pub mod relay;

pub use flow_controller::FlowController;
pub use flow_meter::FlowMeter;
pub use gas_analyzer::GasAnalyzer;
pub use heater::HeaterController;
pub use power_meter::PowerMeter;
pub use pressure::PressureModule;
pub use relay::RelayModule;
