use super::bias_search::{BiasSearchOutcome, acquire_bias_point};
use super::{Tester, address, resolve_roles};
use crate::config::{AppConfig, ThreeTerminalConfig};
use crate::error::BenchError;
use crate::fixture::{RunOutcome, RunRequest, RunState};
use crate::instruments::{
    Lia, LockInAmplifier, ResourceManager, Smu, SourceFunction, SourceMeter,
};
use crate::sweep::{self, SweepParams, SweepPolicy, SweepValue, cartesian};
use log::{info, warn};
use std::thread;

pub const HEADER: [&str; 6] = [
    "Heater [V]",
    "LIA.Freq [Hz]",
    "LIA.Amp [V]",
    "LIA.Offset [V]",
    "LIA.X [V]",
    "LIA.R [V]",
];

/// Sweep axes of the three-terminal measurement, outermost first
#[derive(Debug, Clone)]
pub struct ThreeTerminalSweep {
    pub heater: SweepValue,
    pub frequency: SweepValue,
    pub amplitude: SweepValue,
    pub offset: SweepValue,
}

impl ThreeTerminalSweep {
    pub fn from_config(config: &ThreeTerminalConfig) -> Self {
        Self {
            heater: config.heater.clone(),
            frequency: config.frequency.clone(),
            amplitude: config.amplitude.clone(),
            offset: config.offset.clone(),
        }
    }
}

impl SweepParams for ThreeTerminalSweep {
    /// `[heater, frequency, amplitude, offset]`
    type Resolved = Vec<Vec<f64>>;

    fn apply_override(&mut self, name: &str, value: SweepValue) -> Result<(), BenchError> {
        let slot = match name {
            "heater" => &mut self.heater,
            "frequency" => &mut self.frequency,
            "amplitude" => &mut self.amplitude,
            "offset" => &mut self.offset,
            other => {
                return Err(BenchError::Config(format!(
                    "Tester3T has no sweep parameter '{other}'"
                )));
            }
        };
        *slot = value;
        Ok(())
    }

    fn resolve(&self, policy: SweepPolicy) -> Result<Vec<Vec<f64>>, BenchError> {
        let axes = vec![
            sweep::resolve("heater", &self.heater, policy)?,
            sweep::resolve("frequency", &self.frequency, policy)?,
            sweep::resolve("amplitude", &self.amplitude, policy)?,
            sweep::resolve("offset", &self.offset, policy)?,
        ];

        match cartesian(&axes).combinations() {
            Some(combinations) if combinations <= sweep::MAX_SWEEP_POINTS => Ok(axes),
            _ => Err(BenchError::Config(format!(
                "Sweep of {:?} points per axis has more than {} combinations",
                axes.iter().map(Vec::len).collect::<Vec<_>>(),
                sweep::MAX_SWEEP_POINTS
            ))),
        }
    }
}

struct Devices {
    heater: Box<dyn SourceMeter>,
    drain: Box<dyn SourceMeter>,
    lia: Box<dyn LockInAmplifier>,
}

/// Heater / drain / lock-in measurement on a three-terminal device
///
/// The heater SMU sources voltage, the drain SMU sources a fixed bias current
/// and the lock-in reads the drain response at each heater, frequency,
/// amplitude and offset combination.
pub struct Tester3T {
    devices: Devices,
    settings: ThreeTerminalConfig,
    defaults: ThreeTerminalSweep,
    run: RunState,
    last_bias: Option<BiasSearchOutcome>,
}

impl Tester3T {
    pub fn new(rm: &dyn ResourceManager, config: &AppConfig) -> Result<Self, BenchError> {
        config.validate()?;
        config.tester_3t.validate()?;
        let settings = config.tester_3t.clone();
        let roles = resolve_roles(
            config,
            Self::NAME,
            &settings.required_devices,
            &["heater_smu", "drain_smu", "lia"],
        )?;

        let defaults = ThreeTerminalSweep::from_config(&settings);
        defaults.resolve(settings.sweep_policy)?;

        let heater = Smu::open(rm, "heater_smu", address(&roles, "heater_smu")?)?;
        let drain = Smu::open(rm, "drain_smu", address(&roles, "drain_smu")?)?;
        let lia = Lia::open(rm, "lia", address(&roles, "lia")?)?;

        Ok(Self {
            devices: Devices {
                heater: Box::new(heater),
                drain: Box::new(drain),
                lia: Box::new(lia),
            },
            settings,
            defaults,
            run: RunState::new(Self::NAME, &config.results_dir),
            last_bias: None,
        })
    }

    /// Outcome of the bias-point search of the most recent invocation
    pub fn last_bias(&self) -> Option<BiasSearchOutcome> {
        self.last_bias
    }

    /// Run the full heater x frequency x amplitude x offset sweep
    ///
    /// Records `(heater, frequency, amplitude, offset, X, R)` per combination.
    pub fn execute(&mut self, request: &RunRequest) -> Result<RunOutcome<()>, BenchError> {
        let header: Vec<String> = HEADER.iter().map(|h| h.to_string()).collect();
        let settle = self.settings.settle()?;
        let heater_settle = self.settings.heater_settle()?;
        let settings = &self.settings;
        let devices = &mut self.devices;
        let last_bias = &mut self.last_bias;
        *last_bias = None;

        self.run.execute(
            &self.defaults,
            settings.sweep_policy,
            &header,
            request,
            |axes: &Vec<Vec<f64>>, recorder| {
                let mut combinations = cartesian(axes);
                info!(
                    "Three-terminal sweep over {} combination(s)",
                    combinations.combinations().unwrap_or(usize::MAX)
                );

                let first = combinations
                    .next()
                    .ok_or_else(|| BenchError::Config("Sweep has no combinations".to_string()))?;
                devices.lia.set_frequency(first[1])?;
                devices.lia.set_amplitude(first[2])?;
                devices.lia.set_offset(first[3])?;

                devices.drain.set_current(settings.drain_idc)?;
                devices.drain.set_on()?;
                devices.heater.set_voltage(first[0])?;
                devices.heater.set_on()?;
                thread::sleep(heater_settle);
                if settings.auto_phase {
                    devices.lia.auto_phase()?;
                }

                let search = &settings.bias_search;
                if search.enabled {
                    let outcome =
                        acquire_bias_point(devices.drain.as_mut(), settings.drain_idc, search)?;
                    *last_bias = Some(outcome);
                    if !outcome.converged {
                        if search.abort_on_failure {
                            return Err(BenchError::Config(format!(
                                "No drain bias point in {:?} V after {} attempt(s)",
                                search.window, outcome.attempts
                            )));
                        }
                        warn!("Continuing without a converged bias point");
                    }
                }

                for combination in cartesian(axes) {
                    let &[heater, frequency, amplitude, offset] = combination.as_slice() else {
                        return Err(BenchError::Config(format!(
                            "Expected 4 sweep axes, got {}",
                            combination.len()
                        )));
                    };
                    devices.heater.set_voltage(heater)?;
                    devices.lia.set_frequency(frequency)?;
                    devices.lia.set_amplitude(amplitude)?;
                    devices.lia.set_offset(offset)?;
                    thread::sleep(settle);

                    let reading = devices.lia.measure()?;
                    recorder.record(&[heater, frequency, amplitude, offset, reading.x, reading.r])?;
                }
                Ok(())
            },
        )
    }
}

impl Tester for Tester3T {
    const NAME: &'static str = "Tester3T";

    fn enter(&mut self) -> Result<(), BenchError> {
        let devices = &mut self.devices;
        devices.heater.set_function(SourceFunction::Volt)?;
        devices.heater.set_current_compliance(self.settings.heater_icomp)?;
        devices.drain.set_function(SourceFunction::Curr)?;
        devices.drain.set_voltage_compliance(self.settings.drain_vcomp)?;
        devices.lia.set_channel_output(1, 0)?;
        devices.lia.set_channel_output(2, 0)
    }

    /// Every output is attempted even when an earlier one fails
    fn exit(&mut self) -> Result<(), BenchError> {
        let heater = self.devices.heater.set_off();
        let drain = self.devices.drain.set_off();
        let lia = self.devices.lia.set_off();
        heater.and(drain).and(lia)
    }

    fn run_state(&mut self) -> &mut RunState {
        &mut self.run
    }
}
