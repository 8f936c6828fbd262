//! In-process instruments for running testers without hardware
//!
//! The simulated SMU drives a resistive DUT and clamps at its compliance
//! limit; the simulated lock-in returns a fixed snapshot. Every handle shares
//! its state with the resource manager that created it, so tests can inspect
//! what a tester did after the fact.

use super::interface::SourceFunction;
use super::transport::{ResourceManager, Transport};
use super::{DeviceKind, parse_number};
use crate::config::BenchConfig;
use crate::error::BenchError;
use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SIM_RESISTANCE_OHMS: f64 = 1e3;

#[derive(Debug, Clone, PartialEq)]
pub struct SmuState {
    pub resistance: f64,
    pub function: SourceFunction,
    /// Programmed level of the sourced quantity
    pub level: f64,
    pub output_on: bool,
    pub floating: bool,
    pub voltage_compliance: Option<f64>,
    pub current_compliance: Option<f64>,
}

impl SmuState {
    fn new(resistance: f64) -> Self {
        Self {
            resistance,
            function: SourceFunction::Volt,
            level: 0.0,
            output_on: false,
            floating: false,
            voltage_compliance: None,
            current_compliance: None,
        }
    }

    /// `(voltage, current, clamped)` at the terminals
    pub fn terminals(&self) -> (f64, f64, bool) {
        if !self.output_on {
            return (0.0, 0.0, false);
        }
        match self.function {
            SourceFunction::Volt => {
                let current = self.level / self.resistance;
                match self.current_compliance {
                    Some(limit) if current.abs() > limit => {
                        let clamped = limit.copysign(current);
                        (clamped * self.resistance, clamped, true)
                    }
                    _ => (self.level, current, false),
                }
            }
            SourceFunction::Curr => {
                let voltage = self.level * self.resistance;
                match self.voltage_compliance {
                    Some(limit) if voltage.abs() > limit => {
                        let clamped = limit.copysign(voltage);
                        (clamped, clamped / self.resistance, true)
                    }
                    _ => (voltage, self.level, false),
                }
            }
        }
    }
}

/// Injected failure: `command` answers `remaining` more times, then errors
#[derive(Debug, Clone)]
struct Fault {
    command: String,
    remaining: usize,
}

fn check_fault(fault: &mut Option<Fault>, head: &str, command: &str) -> Result<(), BenchError> {
    match fault {
        Some(fault) if fault.command.eq_ignore_ascii_case(head) => {
            if fault.remaining == 0 {
                return Err(BenchError::Protocol(format!("Simulated failure on '{command}'")));
            }
            fault.remaining -= 1;
            Ok(())
        }
        _ => Ok(()),
    }
}

#[derive(Debug)]
struct SmuShared {
    state: SmuState,
    commands: Vec<String>,
    fault: Option<Fault>,
}

/// Simulated source-measure unit attached to a resistor
#[derive(Debug, Clone)]
pub struct SimSmu {
    shared: Arc<Mutex<SmuShared>>,
}

impl SimSmu {
    pub fn new(resistance: f64) -> Self {
        Self {
            shared: Arc::new(Mutex::new(SmuShared {
                state: SmuState::new(resistance),
                commands: Vec::new(),
                fault: None,
            })),
        }
    }

    pub fn state(&self) -> SmuState {
        self.shared.lock().state.clone()
    }

    /// Let `command` succeed `successes` times, then fail every later call
    pub fn fail_after(&self, command: &str, successes: usize) {
        self.shared.lock().fault = Some(Fault {
            command: command.to_string(),
            remaining: successes,
        });
    }

    pub fn commands(&self) -> Vec<String> {
        self.shared.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.shared.lock().commands.clear();
    }

    fn handle(&self, command: &str) -> Result<Option<String>, BenchError> {
        let mut shared = self.shared.lock();
        shared.commands.push(command.to_string());
        let (head, arg) = split_command(command);
        check_fault(&mut shared.fault, &head, command)?;
        let state = &mut shared.state;

        let number = || parse_number(arg, command);

        match head.as_str() {
            "*RST" => {
                *state = SmuState::new(state.resistance);
            }
            "*CLS" => {}
            "*IDN?" => return Ok(Some("GMOS-SIM,SMU,0001,1.0".to_string())),
            "FUNC:MODE" => state.function = parse_function(arg, command)?,
            "SOUR:VOLT:MODE" | "SOUR:CURR:MODE" => {}
            "SOUR:VOLT" | "SOUR:CURR" => {
                let wanted = if head == "SOUR:VOLT" {
                    SourceFunction::Volt
                } else {
                    SourceFunction::Curr
                };
                if state.function != wanted {
                    return Err(BenchError::Protocol(format!(
                        "'{command}' while sourcing {}",
                        state.function
                    )));
                }
                state.level = number()?;
            }
            "SENS:VOLT:PROT" => state.voltage_compliance = Some(number()?),
            "SENS:CURR:PROT" => state.current_compliance = Some(number()?),
            "OUTP" => state.output_on = number()? != 0.0,
            "OUTP:LOW" => state.floating = arg.eq_ignore_ascii_case("FLO"),
            "MEAS:VOLT:DC?" => return Ok(Some(state.terminals().0.to_string())),
            "MEAS:CURR:DC?" => return Ok(Some(state.terminals().1.to_string())),
            "SENS:VOLT:PROT:TRIP?" | "SENS:CURR:PROT:TRIP?" => {
                let (_, _, clamped) = state.terminals();
                let limited = state.function.complement();
                let asked = if head.starts_with("SENS:VOLT") {
                    SourceFunction::Volt
                } else {
                    SourceFunction::Curr
                };
                let tripped = clamped && asked == limited;
                return Ok(Some(if tripped { "1" } else { "0" }.to_string()));
            }
            _ => return Err(unknown_command(command)),
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiaState {
    pub frequency: f64,
    pub amplitude: f64,
    pub offset: f64,
    pub x: f64,
    pub y: f64,
    pub r: f64,
    pub theta: f64,
}

impl Default for LiaState {
    fn default() -> Self {
        Self {
            frequency: 0.0,
            amplitude: 0.0,
            offset: 0.0,
            x: 1.0,
            y: 2.0,
            r: 3.0,
            theta: 4.0,
        }
    }
}

#[derive(Debug, Default)]
struct LiaShared {
    state: LiaState,
    commands: Vec<String>,
    fault: Option<Fault>,
}

/// Simulated lock-in amplifier with a fixed snapshot reading
#[derive(Debug, Clone, Default)]
pub struct SimLia {
    shared: Arc<Mutex<LiaShared>>,
}

impl SimLia {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(frequency, amplitude, offset)` of the reference output
    pub fn reference(&self) -> (f64, f64, f64) {
        let shared = self.shared.lock();
        (shared.state.frequency, shared.state.amplitude, shared.state.offset)
    }

    /// Let `command` succeed `successes` times, then fail every later call
    pub fn fail_after(&self, command: &str, successes: usize) {
        self.shared.lock().fault = Some(Fault {
            command: command.to_string(),
            remaining: successes,
        });
    }

    pub fn commands(&self) -> Vec<String> {
        self.shared.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.shared.lock().commands.clear();
    }

    fn handle(&self, command: &str) -> Result<Option<String>, BenchError> {
        let mut shared = self.shared.lock();
        shared.commands.push(command.to_string());
        let (head, arg) = split_command(command);
        check_fault(&mut shared.fault, &head, command)?;
        let state = &mut shared.state;

        let number = || parse_number(arg, command);

        match head.as_str() {
            "*RST" => {
                let (x, y, r, theta) = (state.x, state.y, state.r, state.theta);
                *state = LiaState {
                    x,
                    y,
                    r,
                    theta,
                    ..LiaState::default()
                };
            }
            "*CLS" | "COUT" | "APHS" => {}
            "*IDN?" => return Ok(Some("GMOS-SIM,LIA,0001,1.0".to_string())),
            "FREQ" => state.frequency = number()?,
            "SLVL" => state.amplitude = number()?,
            "SOFF" => state.offset = number()?,
            "SNAPD?" => {
                return Ok(Some(format!(
                    "{}, {}, {}, {}",
                    state.x, state.y, state.r, state.theta
                )));
            }
            _ => return Err(unknown_command(command)),
        }
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub enum SimInstrument {
    Smu(SimSmu),
    Lia(SimLia),
}

impl SimInstrument {
    fn handle(&self, command: &str) -> Result<Option<String>, BenchError> {
        match self {
            SimInstrument::Smu(smu) => smu.handle(command),
            SimInstrument::Lia(lia) => lia.handle(command),
        }
    }
}

struct SimTransport {
    instrument: SimInstrument,
}

impl Transport for SimTransport {
    fn write(&mut self, command: &str) -> Result<(), BenchError> {
        self.instrument.handle(command).map(|_| ())
    }

    fn query(&mut self, command: &str) -> Result<String, BenchError> {
        self.instrument
            .handle(command)?
            .ok_or_else(|| BenchError::Protocol(format!("'{command}' produced no response")))
    }
}

/// Resource manager serving simulated instruments by address
#[derive(Debug, Default)]
pub struct SimulatedResourceManager {
    resources: Mutex<BTreeMap<String, SimInstrument>>,
    opened: Mutex<Vec<String>>,
}

impl SimulatedResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate one simulated instrument per distinct address of the bench
    pub fn for_bench(bench: &BenchConfig) -> Self {
        let rm = Self::new();
        for (role, address) in bench {
            if rm.resources.lock().contains_key(address) {
                continue;
            }
            match DeviceKind::from_role(role) {
                Ok(DeviceKind::Smu) => {
                    rm.add_smu(address, SIM_RESISTANCE_OHMS);
                }
                Ok(DeviceKind::Lia) => {
                    rm.add_lia(address);
                }
                Err(_) => debug!("No simulated instrument for role '{role}'"),
            }
        }
        rm
    }

    pub fn add_smu(&self, address: &str, resistance: f64) -> SimSmu {
        let smu = SimSmu::new(resistance);
        self.resources
            .lock()
            .insert(address.to_string(), SimInstrument::Smu(smu.clone()));
        smu
    }

    pub fn add_lia(&self, address: &str) -> SimLia {
        let lia = SimLia::new();
        self.resources
            .lock()
            .insert(address.to_string(), SimInstrument::Lia(lia.clone()));
        lia
    }

    pub fn smu(&self, address: &str) -> Option<SimSmu> {
        match self.resources.lock().get(address) {
            Some(SimInstrument::Smu(smu)) => Some(smu.clone()),
            _ => None,
        }
    }

    pub fn lia(&self, address: &str) -> Option<SimLia> {
        match self.resources.lock().get(address) {
            Some(SimInstrument::Lia(lia)) => Some(lia.clone()),
            _ => None,
        }
    }

    /// Addresses opened so far, in order
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().clone()
    }
}

impl ResourceManager for SimulatedResourceManager {
    fn open_resource(&self, address: &str) -> Result<Box<dyn Transport>, BenchError> {
        let instrument = self
            .resources
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| BenchError::InvalidAddress(format!("No instrument at {address}")))?;
        self.opened.lock().push(address.to_string());
        debug!("Opened simulated instrument at {address}");
        Ok(Box::new(SimTransport { instrument }))
    }

    fn list_resources(&self) -> Result<Vec<String>, BenchError> {
        Ok(self.resources.lock().keys().cloned().collect())
    }
}

fn split_command(command: &str) -> (String, &str) {
    let command = command.trim();
    match command.split_once(' ') {
        Some((head, arg)) => (head.to_uppercase(), arg.trim()),
        None => (command.to_uppercase(), ""),
    }
}

fn parse_function(arg: &str, command: &str) -> Result<SourceFunction, BenchError> {
    match arg.to_uppercase().as_str() {
        "VOLT" => Ok(SourceFunction::Volt),
        "CURR" => Ok(SourceFunction::Curr),
        _ => Err(BenchError::Protocol(format!("Unknown source function in '{command}'"))),
    }
}

fn unknown_command(command: &str) -> BenchError {
    BenchError::Protocol(format!("Unknown command '{command}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_source_clamps_at_current_compliance() {
        let mut state = SmuState::new(1e3);
        state.output_on = true;
        state.level = 5.0;
        assert_eq!(state.terminals(), (5.0, 5e-3, false));

        state.current_compliance = Some(1e-3);
        let (v, i, clamped) = state.terminals();
        assert!(clamped);
        assert_eq!(i, 1e-3);
        assert!((v - 1.0).abs() < 1e-12);

        state.level = -5.0;
        assert_eq!(state.terminals().1, -1e-3);
    }

    #[test]
    fn test_output_off_reads_zero() {
        let mut state = SmuState::new(1e3);
        state.level = 1.0;
        assert_eq!(state.terminals(), (0.0, 0.0, false));
    }

    #[test]
    fn test_source_in_wrong_function_is_rejected() {
        let smu = SimSmu::new(1e3);
        smu.handle("FUNC:MODE CURR").unwrap();
        assert!(matches!(smu.handle("SOUR:VOLT 1"), Err(BenchError::Protocol(_))));
        smu.handle("SOUR:CURR 1e-6").unwrap();
        assert_eq!(smu.state().level, 1e-6);
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let lia = SimLia::new();
        assert!(lia.handle("BOGUS 1").is_err());
        assert_eq!(lia.commands(), vec!["BOGUS 1"]);
    }

    #[test]
    fn test_injected_fault_after_successes() {
        let lia = SimLia::new();
        lia.fail_after("snapd?", 2);

        assert!(lia.handle("SNAPD?").is_ok());
        assert!(lia.handle("FREQ 10").is_ok());
        assert!(lia.handle("SNAPD?").is_ok());
        assert!(matches!(lia.handle("SNAPD?"), Err(BenchError::Protocol(_))));
        assert!(lia.handle("SLVL 0").is_ok());
    }

    #[test]
    fn test_for_bench_shares_instruments_by_address() {
        let bench: BenchConfig = [
            ("smu", "A"),
            ("heater_smu", "A"),
            ("drain_smu", "B"),
            ("lia", "C"),
            ("scope", "D"),
        ]
        .into_iter()
        .map(|(r, a)| (r.to_string(), a.to_string()))
        .collect();

        let rm = SimulatedResourceManager::for_bench(&bench);
        assert_eq!(rm.list_resources().unwrap(), vec!["A", "B", "C"]);
        assert!(rm.smu("A").is_some());
        assert!(rm.lia("C").is_some());
        assert!(rm.lia("A").is_none());
    }
}
