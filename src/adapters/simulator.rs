//! In-process rig simulator.
//!
//! Answers the shared RS-485 line (Modbus and ASCII devices), the power meter
//! and the gas analyzer through [`MockLink`]s, so the full worker can run
//! without hardware. A frame that arrives while the line is open with the other
//! protocol family's settings is garbage to the devices: it gets no answer and
//! is counted in [`SimState::framing_errors`].

use super::{LineSettings, MockLink};
use crate::instrument::gas_analyzer::QUERY as GAS_QUERY;
use crate::instrument::heater::{PV_REGISTER, RUN, RUN_STOP_REGISTER, SV_REGISTER};
use crate::instrument::pressure::{CHANNEL_BASES, PSM4_UNIT};
use crate::instrument::relay::RELAY_UNIT;
use crate::protocol::ascii::{checksum, decode_f32, encode_f32};
use crate::protocol::modbus::{crc16, EXCEPTION_FLAG, NOT_CONNECTED_SENTINEL, READ_INPUT_REGISTERS, WRITE_SINGLE_REGISTER};
use crate::snapshot::{FLOW_CHANNELS, GAS_NAMES, HEATER_COUNT, PRESSURE_CHANNELS, TEMPERATURE_CHANNELS};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};

const AMBIENT: f64 = 25.0;
const HEATER_POWER_W: f64 = 500.0;

/// Everything the simulated devices know.
#[derive(Debug, Clone)]
pub struct SimState {
    /// `None` is an open thermocouple.
    pub temperatures: [Option<f64>; TEMPERATURE_CHANNELS],
    /// TK4 setpoint registers, whole °C.
    pub heater_setpoints: [u16; HEATER_COUNT],
    /// TK4 run/stop state.
    pub heater_running: [bool; HEATER_COUNT],
    /// PSM4 channels in bar; `None` is an unplugged sensor.
    pub pressures: [Option<f64>; PRESSURE_CHANNELS],
    /// `(register, value)` writes seen by the relay board, in order.
    pub relay_writes: Vec<(u16, u16)>,
    /// Flow controller setpoints.
    pub flow_setpoints: [f32; FLOW_CHANNELS],
    /// Flow controller valves.
    pub flow_enabled: [bool; FLOW_CHANNELS],
    /// Mass-flow meter reading.
    pub meter_flow: f32,
    /// Power meter reading, W.
    pub power: f64,
    /// Integrated energy, Wh.
    pub energy: f64,
    /// Integrator running.
    pub integrating: bool,
    /// Gas analyzer fields.
    pub gases: [f64; GAS_NAMES.len()],
    /// Modbus units that never answer.
    pub silent_units: Vec<u8>,
    /// The ASCII devices never answer.
    pub flow_devices_silent: bool,
    /// Frames that arrived under the wrong line settings.
    pub framing_errors: usize,
    /// Heaters move toward their setpoint on every read, readings get jitter.
    pub dynamics: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            temperatures: [Some(AMBIENT); TEMPERATURE_CHANNELS],
            heater_setpoints: [0; HEATER_COUNT],
            heater_running: [false; HEATER_COUNT],
            pressures: [Some(1.0), Some(1.0), Some(1.0), None],
            relay_writes: Vec::new(),
            flow_setpoints: [0.0; FLOW_CHANNELS],
            flow_enabled: [false; FLOW_CHANNELS],
            meter_flow: 0.0,
            power: 0.0,
            energy: 0.0,
            integrating: false,
            gases: [0.1, 0.04, 0.0, 0.0, 0.0, 20.9, 0.0, 0.0, 0.0, 78.0],
            silent_units: Vec::new(),
            flow_devices_silent: false,
            framing_errors: 0,
            dynamics: false,
        }
    }
}

struct Sim {
    state: SimState,
    rng: StdRng,
}

/// Cloneable handle to one simulated rig.
#[derive(Clone)]
pub struct RigSimulator {
    inner: Arc<Mutex<Sim>>,
}

impl Default for RigSimulator {
    fn default() -> Self {
        Self::new(SimState::default())
    }
}

impl RigSimulator {
    /// A rig in `state`, with seeded noise.
    pub fn new(state: SimState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Sim {
                state,
                rng: StdRng::seed_from_u64(7),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Sim> {
        // A panicking responder only happens in a failing test; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current device state.
    pub fn state(&self) -> SimState {
        self.lock().state.clone()
    }

    /// Mutate the device state, e.g. to heat a zone past its limit.
    pub fn update(&self, f: impl FnOnce(&mut SimState)) {
        f(&mut self.lock().state);
    }

    /// Link to the shared RS-485 line.
    pub fn rs485_link(&self, name: &str) -> MockLink {
        let sim = self.clone();
        MockLink::new(name, move |settings, request| sim.lock().rs485(settings, request))
    }

    /// Link to the power meter port.
    pub fn power_meter_link(&self, name: &str) -> MockLink {
        let sim = self.clone();
        MockLink::new(name, move |_, request| sim.lock().state.power_meter(request))
    }

    /// Link to the gas analyzer port.
    pub fn gas_analyzer_link(&self, name: &str) -> MockLink {
        let sim = self.clone();
        MockLink::new(name, move |_, request| sim.lock().state.gas_analyzer(request))
    }
}

impl Sim {
    fn rs485(&mut self, settings: &LineSettings, request: &[u8]) -> Option<Vec<u8>> {
        let is_ascii_frame = request.first() == Some(&b':');
        if *settings == LineSettings::modbus_rtu() && !is_ascii_frame {
            self.modbus(request)
        } else if *settings == LineSettings::ascii_flow() && is_ascii_frame {
            self.state.ascii(request)
        } else {
            self.state.framing_errors += 1;
            None
        }
    }

    fn modbus(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request.len() != 8 || crc16(&request[..6]).to_le_bytes() != [request[6], request[7]] {
            return None;
        }
        let unit = request[0];
        if self.state.silent_units.contains(&unit) {
            return None;
        }
        let function = request[1];
        let register = u16::from_be_bytes([request[2], request[3]]);
        let operand = u16::from_be_bytes([request[4], request[5]]);

        let registers = match (unit, function) {
            (1..=6, READ_INPUT_REGISTERS) if register == PV_REGISTER => {
                let index = usize::from(unit - 1);
                self.advance_heater(index);
                let raw = match self.state.temperatures[index] {
                    Some(t) => {
                        let jitter = if self.state.dynamics {
                            self.rng.gen_range(-0.2..0.2)
                        } else {
                            0.0
                        };
                        ((t + jitter).max(0.0) * 10.0).round() as u16
                    }
                    None => NOT_CONNECTED_SENTINEL,
                };
                Some([raw, 1])
            }
            (PSM4_UNIT, READ_INPUT_REGISTERS) => CHANNEL_BASES
                .iter()
                .position(|base| base + 1 == register)
                .map(|channel| match self.state.pressures[channel] {
                    Some(p) => [(p * 100.0).round() as u16, 1],
                    None => [NOT_CONNECTED_SENTINEL, 1],
                }),
            (1..=4, WRITE_SINGLE_REGISTER) => {
                let index = usize::from(unit - 1);
                match register {
                    SV_REGISTER => self.state.heater_setpoints[index] = operand,
                    RUN_STOP_REGISTER => self.state.heater_running[index] = operand == RUN,
                    _ => return Some(exception(unit, function)),
                }
                self.state.power = HEATER_POWER_W
                    * self.state.heater_running.iter().filter(|r| **r).count() as f64;
                return Some(request.to_vec());
            }
            (RELAY_UNIT, WRITE_SINGLE_REGISTER) => {
                self.state.relay_writes.push((register, operand));
                return Some(request.to_vec());
            }
            _ => None,
        };

        match registers {
            Some([a, b]) => {
                let mut reply = vec![unit, function, 4];
                reply.extend_from_slice(&a.to_be_bytes());
                reply.extend_from_slice(&b.to_be_bytes());
                Some(with_crc(reply))
            }
            None => Some(exception(unit, function)),
        }
    }

    fn advance_heater(&mut self, index: usize) {
        if !self.state.dynamics || index >= HEATER_COUNT {
            return;
        }
        if let Some(t) = self.state.temperatures[index] {
            let target = if self.state.heater_running[index] {
                f64::from(self.state.heater_setpoints[index])
            } else {
                AMBIENT
            };
            self.state.temperatures[index] = Some(t + (target - t) * 0.05);
        }
    }
}

impl SimState {
    fn ascii(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if self.flow_devices_silent {
            return None;
        }
        let text = std::str::from_utf8(request).ok()?.strip_suffix('\r')?;
        if text.len() < 7 {
            return None;
        }
        let (body, cs) = text.split_at(text.len() - 2);
        if u8::from_str_radix(cs, 16).ok()? != checksum(body.as_bytes()) {
            return None;
        }
        let id = &body[1..3];
        let command = &body[3..5];
        let rest = &body[5..];

        match (command, rest) {
            ("03", "0038") => {
                let channel = mfc_index(id)?;
                let flow = if self.flow_enabled[channel] {
                    self.flow_setpoints[channel]
                } else {
                    0.0
                };
                Some(framed(&format!(":{id}0304{}", encode_f32(flow))))
            }
            ("03", "00") => {
                if u8::from_str_radix(id, 16).ok()? != 1 {
                    return None;
                }
                let total: f32 = (0..FLOW_CHANNELS)
                    .filter(|c| self.flow_enabled[*c])
                    .map(|c| self.flow_setpoints[c])
                    .sum();
                self.meter_flow = total;
                Some(framed(&format!(":{id}0304{}", encode_f32(total))))
            }
            ("01", data) if data.starts_with("07") => {
                let channel = mfc_index(id)?;
                self.flow_setpoints[channel] = decode_f32(&data[2..]).ok()?;
                Some(framed(&format!(":{id}8107")))
            }
            ("58", "0200") | ("58", "0201") => {
                let channel = mfc_index(id)?;
                self.flow_enabled[channel] = rest == "0201";
                Some(framed(&format!(":{id}D802")))
            }
            _ => None,
        }
    }

    fn power_meter(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let line = String::from_utf8_lossy(request);
        match line.trim_end() {
            ":NUMERIC:NORMAL:VALUE?3" => Some(format!("{:.1}\r\n", self.power).into_bytes()),
            ":NUMERIC:NORMAL:VALUE?4" => {
                if self.integrating {
                    self.energy += self.power / 3600.0;
                }
                Some(format!("{:.3}\r\n", self.energy).into_bytes())
            }
            ":INTEGrate:STARt" => {
                self.integrating = true;
                None
            }
            ":INTEGrate:STOP" => {
                self.integrating = false;
                None
            }
            ":INTEGrate:RESet" => {
                self.energy = 0.0;
                None
            }
            _ => None,
        }
    }

    fn gas_analyzer(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request != GAS_QUERY.as_slice() {
            return None;
        }
        let mut reply = vec![0x16, 0x15, 0x01];
        for value in self.gases {
            reply.extend_from_slice(&((value * 100.0).round() as u16).to_be_bytes());
        }
        let sum = reply.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        reply.push(0u8.wrapping_sub(sum));
        Some(reply)
    }
}

fn mfc_index(id: &str) -> Option<usize> {
    let channel: usize = id.parse().ok()?;
    (1..=FLOW_CHANNELS).contains(&channel).then(|| channel - 1)
}

fn framed(body: &str) -> Vec<u8> {
    format!("{body}{:02X}\r", checksum(body.as_bytes())).into_bytes()
}

fn with_crc(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn exception(unit: u8, function: u8) -> Vec<u8> {
    with_crc(vec![unit, function | EXCEPTION_FLAG, 0x02])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::SerialLink;
    use crate::protocol::ascii::{AsciiFrame, IdFormat};
    use crate::protocol::modbus::RegisterRequest;

    #[tokio::test]
    async fn answers_tk4_read() {
        let sim = RigSimulator::default();
        sim.update(|s| s.temperatures[1] = Some(185.0));
        let mut link = sim.rs485_link("rs485");
        link.open(&LineSettings::modbus_rtu()).await.unwrap();
        link.write_all(&RegisterRequest::read(2, PV_REGISTER, 2).encode()).await.unwrap();
        let reply = link.read_up_to(9).await.unwrap();
        assert_eq!(&reply[..7], &[2, 0x04, 4, 0x07, 0x3A, 0x00, 0x01]);
    }

    #[tokio::test]
    async fn wrong_framing_is_ignored() {
        let sim = RigSimulator::default();
        let mut link = sim.rs485_link("rs485");
        link.open(&LineSettings::ascii_flow()).await.unwrap();
        link.write_all(&RegisterRequest::read(2, PV_REGISTER, 2).encode()).await.unwrap();
        assert!(link.read_up_to(9).await.unwrap().is_empty());
        assert_eq!(sim.state().framing_errors, 1);
    }

    #[tokio::test]
    async fn mfc_accepts_setpoint_and_valve() {
        let sim = RigSimulator::default();
        let mut link = sim.rs485_link("rs485");
        link.open(&LineSettings::ascii_flow()).await.unwrap();
        let set = AsciiFrame::new(3, IdFormat::Decimal, "01", "07").with_data(encode_f32(2.5));
        link.write_all(&set.encode()).await.unwrap();
        let ack = link.read_until(b'\r', 64).await.unwrap();
        assert!(ack.starts_with(b":0381"));
        let on = AsciiFrame::new(3, IdFormat::Decimal, "58", "02").with_data("01");
        link.write_all(&on.encode()).await.unwrap();
        link.read_until(b'\r', 64).await.unwrap();

        let state = sim.state();
        assert_eq!(state.flow_setpoints[2], 2.5);
        assert!(state.flow_enabled[2]);
    }

    #[test]
    fn gas_reply_is_framed_block() {
        let mut state = SimState::default();
        let reply = state.gas_analyzer(&GAS_QUERY).unwrap();
        assert_eq!(reply.len(), 24);
    }
}
