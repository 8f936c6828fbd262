//! Measurement topologies
//!
//! A tester owns its device handles and a [`RunState`]. Work happens inside a
//! [`Session`]: opening one configures the instruments, dropping it powers
//! them off and tidies the results directory, whichever way the session ends.

pub mod bias_search;
pub mod iv;
pub mod three_terminal;

pub use bias_search::{BiasSearchOutcome, acquire_bias_point};
pub use iv::{IvSweep, IvTester};
pub use three_terminal::{ThreeTerminalSweep, Tester3T};

use crate::config::AppConfig;
use crate::error::BenchError;
use crate::fixture::RunState;
use crate::instruments::DeviceKind;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

pub trait Tester {
    /// Class name; also the base of default result-file names
    const NAME: &'static str;

    /// Put every instrument into its operating mode
    fn enter(&mut self) -> Result<(), BenchError>;

    /// Return every instrument to a safe, outputs-off state
    fn exit(&mut self) -> Result<(), BenchError>;

    fn run_state(&mut self) -> &mut RunState;

    fn session(&mut self) -> Result<Session<'_, Self>, BenchError>
    where
        Self: Sized,
    {
        Session::open(self)
    }
}

/// Scoped guard around an entered tester
pub struct Session<'a, T: Tester> {
    tester: &'a mut T,
}

impl<'a, T: Tester> Session<'a, T> {
    pub fn open(tester: &'a mut T) -> Result<Self, BenchError> {
        tester.run_state().open()?;
        if let Err(e) = tester.enter() {
            release(tester);
            return Err(e);
        }
        Ok(Self { tester })
    }
}

impl<T: Tester> Deref for Session<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.tester
    }
}

impl<T: Tester> DerefMut for Session<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.tester
    }
}

impl<T: Tester> Drop for Session<'_, T> {
    fn drop(&mut self) {
        release(self.tester);
    }
}

fn release<T: Tester>(tester: &mut T) {
    if let Err(e) = tester.exit() {
        warn!("{}: failed to power down instruments: {}", T::NAME, e);
    }
    tester.run_state().close();
}

/// Map each role a tester drives to its configured address
///
/// Everything is checked against the configuration before any instrument is
/// opened: the tester's roles must be listed in `required`, every listed role
/// must name a supported device that the selected bench provides, and no two
/// listed roles may share an address.
pub(crate) fn resolve_roles(
    config: &AppConfig,
    tester: &str,
    required: &[String],
    roles: &[&str],
) -> Result<BTreeMap<String, String>, BenchError> {
    for role in roles {
        if !required.iter().any(|r| r == role) {
            return Err(BenchError::Config(format!(
                "{tester} drives '{role}' but it is not in required_devices"
            )));
        }
    }

    let bench = config.bench()?;
    let mut resolved = BTreeMap::new();
    let mut seen: BTreeMap<&str, &str> = BTreeMap::new();

    for role in required {
        DeviceKind::from_role(role)?;
        let address = bench
            .get(role)
            .ok_or_else(|| BenchError::MissingDevice(role.clone()))?;

        if let Some(other) = seen.insert(address.as_str(), role.as_str()) {
            return Err(BenchError::Config(format!(
                "'{other}' and '{role}' are both configured at {address}"
            )));
        }
        if roles.contains(&role.as_str()) {
            resolved.insert(role.clone(), address.clone());
        } else {
            debug!("{tester}: required role '{role}' is not driven by this tester");
        }
    }

    Ok(resolved)
}

pub(crate) fn address<'a>(
    resolved: &'a BTreeMap<String, String>,
    role: &str,
) -> Result<&'a str, BenchError> {
    resolved
        .get(role)
        .map(String::as_str)
        .ok_or_else(|| BenchError::MissingDevice(role.to_string()))
}
