pub mod interface;
pub mod lia;
pub mod sim;
pub mod smu;
pub mod transport;

pub use interface::{LockInAmplifier, LockInMeasurement, SourceFunction, SourceMeter};
pub use lia::Lia;
pub use sim::{SimLia, SimSmu, SimulatedResourceManager};
pub use smu::Smu;
pub use transport::{ConnectionConfig, ResourceManager, TcpResourceManager, Transport};

use crate::error::BenchError;
use log::{debug, info};
use std::fmt;

/// Instrument family inferred from a role name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Smu,
    Lia,
}

impl DeviceKind {
    /// `smu`/`lia` anywhere in the role name picks the family
    pub fn from_role(role: &str) -> Result<Self, BenchError> {
        let lower = role.to_lowercase();
        if lower.contains("smu") {
            Ok(DeviceKind::Smu)
        } else if lower.contains("lia") {
            Ok(DeviceKind::Lia)
        } else {
            Err(BenchError::UnsupportedDevice(role.to_string()))
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Smu => write!(f, "SMU"),
            DeviceKind::Lia => write!(f, "LIA"),
        }
    }
}

/// One opened instrument: a transport plus the role it plays on the bench
///
/// Opening resets the instrument and reads its identity; dropping closes the
/// transport.
pub struct Instrument {
    transport: Box<dyn Transport>,
    role: String,
    address: String,
    identity: String,
}

impl Instrument {
    pub fn open(rm: &dyn ResourceManager, role: &str, address: &str) -> Result<Self, BenchError> {
        let transport = rm.open_resource(address)?;
        let mut instrument = Self {
            transport,
            role: role.to_string(),
            address: address.to_string(),
            identity: String::new(),
        };

        instrument.reset()?;
        instrument.identity = instrument.query("*IDN?")?;
        info!("Connected {instrument}");
        Ok(instrument)
    }

    fn reset(&mut self) -> Result<(), BenchError> {
        self.write("*RST")?;
        self.write("*CLS")
    }

    pub fn write(&mut self, command: &str) -> Result<(), BenchError> {
        debug!("{} <- {}", self.role, command);
        self.transport.write(command)
    }

    pub fn query(&mut self, command: &str) -> Result<String, BenchError> {
        let response = self.transport.query(command)?;
        debug!("{} <- {} -> {}", self.role, command, response);
        Ok(response)
    }

    /// Query a single numeric value
    pub fn query_f64(&mut self, command: &str) -> Result<f64, BenchError> {
        let response = self.query(command)?;
        parse_number(&response, command)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.role, self.identity, self.address)
    }
}

impl Drop for Instrument {
    fn drop(&mut self) {
        if let Err(e) = self.transport.close() {
            debug!("Closing {} failed: {}", self.role, e);
        }
    }
}

pub(crate) fn parse_number(response: &str, command: &str) -> Result<f64, BenchError> {
    response.trim().parse::<f64>().map_err(|_| {
        BenchError::Protocol(format!("'{command}' returned non-numeric '{response}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_kind_from_role() {
        assert_eq!(DeviceKind::from_role("smu").unwrap(), DeviceKind::Smu);
        assert_eq!(DeviceKind::from_role("heater_smu").unwrap(), DeviceKind::Smu);
        assert_eq!(DeviceKind::from_role("Drain_SMU").unwrap(), DeviceKind::Smu);
        assert_eq!(DeviceKind::from_role("lia").unwrap(), DeviceKind::Lia);
        assert!(matches!(
            DeviceKind::from_role("scope"),
            Err(BenchError::UnsupportedDevice(_))
        ));
    }

    #[test]
    fn test_open_resets_and_identifies() {
        let rm = SimulatedResourceManager::new();
        let smu = rm.add_smu("TCPIP0::sim::1::SOCKET", 1e3);

        let instrument = Instrument::open(&rm, "smu", "TCPIP0::sim::1::SOCKET").unwrap();
        assert!(instrument.identity().contains("SMU"));
        assert_eq!(
            instrument.to_string(),
            "smu (GMOS-SIM,SMU,0001,1.0) at TCPIP0::sim::1::SOCKET"
        );
        assert_eq!(smu.commands(), vec!["*RST", "*CLS", "*IDN?"]);
        assert_eq!(rm.opened(), vec!["TCPIP0::sim::1::SOCKET".to_string()]);
    }

    #[test]
    fn test_open_unknown_address_fails() {
        let rm = SimulatedResourceManager::new();
        assert!(matches!(
            Instrument::open(&rm, "smu", "TCPIP0::sim::9::SOCKET"),
            Err(BenchError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(" 1.5E-3\n", "MEAS:CURR:DC?").unwrap(), 1.5e-3);
        assert!(matches!(
            parse_number("ERR", "MEAS:CURR:DC?"),
            Err(BenchError::Protocol(_))
        ));
    }
}
