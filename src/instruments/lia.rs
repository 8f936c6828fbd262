use super::interface::{LockInAmplifier, LockInMeasurement};
use super::{Instrument, ResourceManager, parse_number};
use crate::error::BenchError;

/// SR8xx-style lock-in amplifier
pub struct Lia {
    instrument: Instrument,
}

impl Lia {
    pub fn open(rm: &dyn ResourceManager, role: &str, address: &str) -> Result<Self, BenchError> {
        Ok(Self {
            instrument: Instrument::open(rm, role, address)?,
        })
    }
}

impl LockInAmplifier for Lia {
    fn set_channel_output(&mut self, channel: u8, function: u8) -> Result<(), BenchError> {
        self.instrument.write(&format!("COUT {channel}, {function}"))
    }

    fn set_frequency(&mut self, frequency: f64) -> Result<(), BenchError> {
        self.instrument.write(&format!("FREQ {frequency}"))
    }

    fn set_amplitude(&mut self, amplitude: f64) -> Result<(), BenchError> {
        self.instrument.write(&format!("SLVL {amplitude}"))
    }

    fn set_offset(&mut self, offset: f64) -> Result<(), BenchError> {
        self.instrument.write(&format!("SOFF {offset}"))
    }

    fn auto_phase(&mut self) -> Result<(), BenchError> {
        self.instrument.write("APHS")
    }

    fn measure(&mut self) -> Result<LockInMeasurement, BenchError> {
        let response = self.instrument.query("SNAPD?")?;
        let values = response
            .split(',')
            .map(|part| parse_number(part, "SNAPD?"))
            .collect::<Result<Vec<_>, _>>()?;

        match values.as_slice() {
            [x, y, r, theta] => Ok(LockInMeasurement {
                x: *x,
                y: *y,
                r: *r,
                theta: *theta,
            }),
            _ => Err(BenchError::Protocol(format!(
                "SNAPD? returned {} values, expected 4: '{response}'",
                values.len()
            ))),
        }
    }
}
