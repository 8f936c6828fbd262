use crate::error::BenchError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quantity an SMU sources; the complementary quantity is measured and
/// limited by the compliance setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFunction {
    Volt,
    Curr,
}

impl SourceFunction {
    pub fn scpi(&self) -> &'static str {
        match self {
            SourceFunction::Volt => "VOLT",
            SourceFunction::Curr => "CURR",
        }
    }

    /// The measured quantity whose protection limit applies
    pub fn complement(&self) -> SourceFunction {
        match self {
            SourceFunction::Volt => SourceFunction::Curr,
            SourceFunction::Curr => SourceFunction::Volt,
        }
    }
}

impl fmt::Display for SourceFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scpi())
    }
}

/// One lock-in snapshot: in-phase, quadrature, magnitude, phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockInMeasurement {
    pub x: f64,
    pub y: f64,
    pub r: f64,
    pub theta: f64,
}

/// Source-measure unit operations used by the testers
///
/// Implementations map each call onto the instrument's command set; the
/// testers only ever talk to this trait, so a bench can swap SMU models
/// without touching the sweep logic.
pub trait SourceMeter: Send {
    /// Select fixed-level sourcing of voltage or current
    fn set_function(&mut self, function: SourceFunction) -> Result<(), BenchError>;

    fn set_voltage(&mut self, voltage: f64) -> Result<(), BenchError>;

    fn set_current(&mut self, current: f64) -> Result<(), BenchError>;

    /// Set the output level of whichever quantity `function` names
    fn set_level(&mut self, function: SourceFunction, value: f64) -> Result<(), BenchError> {
        match function {
            SourceFunction::Volt => self.set_voltage(value),
            SourceFunction::Curr => self.set_current(value),
        }
    }

    fn set_voltage_compliance(&mut self, limit: f64) -> Result<(), BenchError>;

    fn set_current_compliance(&mut self, limit: f64) -> Result<(), BenchError>;

    /// Compliance on the quantity complementary to `function`
    fn set_compliance(&mut self, function: SourceFunction, limit: f64) -> Result<(), BenchError> {
        match function.complement() {
            SourceFunction::Volt => self.set_voltage_compliance(limit),
            SourceFunction::Curr => self.set_current_compliance(limit),
        }
    }

    /// Leave the low terminal floating while the output is off
    fn set_output_floating(&mut self) -> Result<(), BenchError>;

    fn set_on(&mut self) -> Result<(), BenchError>;

    fn set_off(&mut self) -> Result<(), BenchError>;

    /// Read back `(voltage, current)`
    fn measure(&mut self) -> Result<(f64, f64), BenchError>;

    /// Whether the protection limit of the measured quantity clamped the output
    fn compliance_tripped(&mut self) -> Result<bool, BenchError>;
}

/// Lock-in amplifier operations used by the testers
pub trait LockInAmplifier: Send {
    fn set_channel_output(&mut self, channel: u8, function: u8) -> Result<(), BenchError>;

    fn set_frequency(&mut self, frequency: f64) -> Result<(), BenchError>;

    fn set_amplitude(&mut self, amplitude: f64) -> Result<(), BenchError>;

    fn set_offset(&mut self, offset: f64) -> Result<(), BenchError>;

    /// Zero the phase against the current reference
    fn auto_phase(&mut self) -> Result<(), BenchError>;

    fn measure(&mut self) -> Result<LockInMeasurement, BenchError>;

    /// Zero the reference output
    fn set_off(&mut self) -> Result<(), BenchError> {
        self.set_offset(0.0)?;
        self.set_amplitude(0.0)
    }
}
