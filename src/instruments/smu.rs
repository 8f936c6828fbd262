use super::interface::{SourceFunction, SourceMeter};
use super::{Instrument, ResourceManager};
use crate::error::BenchError;

/// SCPI source-measure unit
pub struct Smu {
    instrument: Instrument,
    function: SourceFunction,
}

impl Smu {
    /// Open, reset, and leave the low terminal floating
    pub fn open(rm: &dyn ResourceManager, role: &str, address: &str) -> Result<Self, BenchError> {
        let mut smu = Self {
            instrument: Instrument::open(rm, role, address)?,
            function: SourceFunction::Volt,
        };
        smu.set_output_floating()?;
        Ok(smu)
    }

}

impl SourceMeter for Smu {
    fn set_function(&mut self, function: SourceFunction) -> Result<(), BenchError> {
        self.instrument.write(&format!("FUNC:MODE {}", function.scpi()))?;
        self.instrument
            .write(&format!("SOUR:{}:MODE FIX", function.scpi()))?;
        self.function = function;
        Ok(())
    }

    fn set_voltage(&mut self, voltage: f64) -> Result<(), BenchError> {
        self.instrument.write(&format!("SOUR:VOLT {voltage}"))
    }

    fn set_current(&mut self, current: f64) -> Result<(), BenchError> {
        self.instrument.write(&format!("SOUR:CURR {current}"))
    }

    fn set_voltage_compliance(&mut self, limit: f64) -> Result<(), BenchError> {
        self.instrument.write(&format!("SENS:VOLT:PROT {limit}"))
    }

    fn set_current_compliance(&mut self, limit: f64) -> Result<(), BenchError> {
        self.instrument.write(&format!("SENS:CURR:PROT {limit}"))
    }

    fn set_output_floating(&mut self) -> Result<(), BenchError> {
        self.instrument.write("OUTP:LOW FLO")
    }

    fn set_on(&mut self) -> Result<(), BenchError> {
        self.instrument.write("OUTP 1")
    }

    fn set_off(&mut self) -> Result<(), BenchError> {
        self.instrument.write("OUTP 0")
    }

    fn measure(&mut self) -> Result<(f64, f64), BenchError> {
        let current = self.instrument.query_f64("MEAS:CURR:DC?")?;
        let voltage = self.instrument.query_f64("MEAS:VOLT:DC?")?;
        Ok((voltage, current))
    }

    fn compliance_tripped(&mut self) -> Result<bool, BenchError> {
        let limited = self.function.complement();
        let response = self
            .instrument
            .query(&format!("SENS:{}:PROT:TRIP?", limited.scpi()))?;
        match response.trim() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(BenchError::Protocol(format!(
                "Unexpected compliance state '{other}'"
            ))),
        }
    }
}
