use super::{Tester, address, resolve_roles};
use crate::config::{AppConfig, IvTesterConfig};
use crate::error::BenchError;
use crate::fixture::{RunOutcome, RunRequest, RunState};
use crate::instruments::{ResourceManager, Smu, SourceMeter};
use crate::sweep::{self, SweepParams, SweepPolicy, SweepValue};
use log::info;
use std::thread;

/// Sweep parameters of the two-terminal IV measurement
#[derive(Debug, Clone)]
pub struct IvSweep {
    /// Source level, volts or amps depending on `output_mode`
    pub output: SweepValue,
}

impl SweepParams for IvSweep {
    type Resolved = Vec<f64>;

    fn apply_override(&mut self, name: &str, value: SweepValue) -> Result<(), BenchError> {
        match name {
            "output" => self.output = value,
            other => {
                return Err(BenchError::Config(format!(
                    "IvTester has no sweep parameter '{other}'"
                )));
            }
        }
        Ok(())
    }

    fn resolve(&self, policy: SweepPolicy) -> Result<Vec<f64>, BenchError> {
        sweep::resolve("output", &self.output, policy)
    }
}

/// Two-terminal IV sweep on a single SMU
pub struct IvTester {
    smu: Box<dyn SourceMeter>,
    settings: IvTesterConfig,
    defaults: IvSweep,
    run: RunState,
}

impl IvTester {
    pub fn new(rm: &dyn ResourceManager, config: &AppConfig) -> Result<Self, BenchError> {
        config.validate()?;
        config.iv_tester.validate()?;
        let settings = config.iv_tester.clone();
        let roles = resolve_roles(config, Self::NAME, &settings.required_devices, &["smu"])?;

        let defaults = IvSweep {
            output: settings.output.clone(),
        };
        defaults.resolve(settings.sweep_policy)?;

        let smu = Smu::open(rm, "smu", address(&roles, "smu")?)?;
        Ok(Self {
            smu: Box::new(smu),
            settings,
            defaults,
            run: RunState::new(Self::NAME, &config.results_dir),
        })
    }

    pub fn header(&self) -> Vec<String> {
        vec![
            format!("Set {}", self.settings.output_mode.scpi()),
            "V (V)".to_string(),
            "I (A)".to_string(),
        ]
    }

    /// Sweep the source level and record `(set, V, I)` per step
    pub fn execute(&mut self, request: &RunRequest) -> Result<RunOutcome<()>, BenchError> {
        let header = self.header();
        let mode = self.settings.output_mode;
        let sleep = self.settings.settle()?;
        let smu = &mut self.smu;

        self.run.execute(
            &self.defaults,
            self.settings.sweep_policy,
            &header,
            request,
            |levels: &Vec<f64>, recorder| {
                info!("IV sweep over {} {} level(s)", levels.len(), mode);
                smu.set_on()?;
                for &level in levels {
                    smu.set_level(mode, level)?;
                    thread::sleep(sleep);
                    let (voltage, current) = smu.measure()?;
                    recorder.record(&[level, voltage, current])?;
                }
                Ok(())
            },
        )
    }
}

impl Tester for IvTester {
    const NAME: &'static str = "IvTester";

    fn enter(&mut self) -> Result<(), BenchError> {
        let mode = self.settings.output_mode;
        self.smu.set_function(mode)?;
        self.smu.set_compliance(mode, self.settings.compliance)?;
        self.smu.set_output_floating()
    }

    fn exit(&mut self) -> Result<(), BenchError> {
        self.smu.set_off()
    }

    fn run_state(&mut self) -> &mut RunState {
        &mut self.run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::{SimulatedResourceManager, SourceFunction};
    use std::fs;

    const ADDRESS: &str = "TCPIP0::sim::5025::SOCKET";

    fn setup(results: &std::path::Path) -> (AppConfig, SimulatedResourceManager) {
        let mut config = AppConfig::default();
        config.results_dir = results.to_path_buf();
        config
            .benches
            .insert("sim".to_string(), [("smu".to_string(), ADDRESS.to_string())].into());
        config.iv_tester.default_sleep_s = 0.0;

        let rm = SimulatedResourceManager::new();
        rm.add_smu(ADDRESS, 1e3);
        (config, rm)
    }

    #[test]
    fn test_linear_sweep_writes_one_row_per_level() {
        let dir = tempfile::tempdir().unwrap();
        let (config, rm) = setup(dir.path());
        let mut tester = IvTester::new(&rm, &config).unwrap();

        let outcome = {
            let mut session = tester.session().unwrap();
            session.execute(&RunRequest::new()).unwrap()
        };

        assert_eq!(outcome.rows, 4);
        assert!(outcome.path.ends_with("IvTester.csv"));
        let content = fs::read_to_string(&outcome.path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "Set VOLT,V (V),I (A)");
        assert_eq!(&lines[1..], ["0,0,0", "0.25,0.25,0.00025", "0.5,0.5,0.0005", "0.75,0.75,0.00075"]);
    }

    #[test]
    fn test_session_configures_and_powers_down() {
        let dir = tempfile::tempdir().unwrap();
        let (config, rm) = setup(dir.path());
        let sim = rm.smu(ADDRESS).unwrap();
        let mut tester = IvTester::new(&rm, &config).unwrap();

        {
            let mut session = tester.session().unwrap();
            let state = sim.state();
            assert_eq!(state.function, SourceFunction::Volt);
            assert_eq!(state.current_compliance, Some(0.01));
            assert!(state.floating);

            session
                .execute(&RunRequest::new().with("output", SweepValue::Scalar(0.1)))
                .unwrap();
            assert!(sim.state().output_on);
        }

        assert!(!sim.state().output_on);
    }

    #[test]
    fn test_current_mode_uses_voltage_compliance() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, rm) = setup(dir.path());
        config.iv_tester.output_mode = SourceFunction::Curr;
        config.iv_tester.compliance = 2.0;
        config.iv_tester.output = SweepValue::list(vec![1e-3, 5e-3]);
        let sim = rm.smu(ADDRESS).unwrap();
        let mut tester = IvTester::new(&rm, &config).unwrap();

        let mut session = tester.session().unwrap();
        let outcome = session.execute(&RunRequest::new().filename("curr")).unwrap();
        drop(session);

        assert_eq!(sim.state().voltage_compliance, Some(2.0));
        let content = fs::read_to_string(&outcome.path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "Set CURR,V (V),I (A)");
        // second level clamps at 2 V
        assert_eq!(lines[2], "0.005,2,0.002");
    }

    #[test]
    fn test_overrides_do_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let (config, rm) = setup(dir.path());
        let mut tester = IvTester::new(&rm, &config).unwrap();
        let mut session = tester.session().unwrap();

        let first = session
            .execute(&RunRequest::new().with("output", SweepValue::list(vec![0.1, 0.2])))
            .unwrap();
        let second = session.execute(&RunRequest::new()).unwrap();

        assert_eq!(first.rows, 2);
        assert_eq!(second.rows, 4);
        assert!(second.path.ends_with("IvTester_1.csv"));
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (config, rm) = setup(dir.path());
        let mut tester = IvTester::new(&rm, &config).unwrap();
        let mut session = tester.session().unwrap();

        let result = session.execute(&RunRequest::new().with("heater", SweepValue::Scalar(1.0)));
        assert!(matches!(result, Err(BenchError::Config(_))));
    }

    #[test]
    fn test_bad_default_fails_before_opening() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, rm) = setup(dir.path());
        config.iv_tester.sweep_policy = SweepPolicy::Fixed;

        assert!(matches!(IvTester::new(&rm, &config), Err(BenchError::Config(_))));
        assert!(rm.opened().is_empty());
    }

    #[test]
    fn test_missing_smu_fails_before_opening() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, rm) = setup(dir.path());
        config.benches.insert("sim".to_string(), Default::default());

        assert!(matches!(
            IvTester::new(&rm, &config),
            Err(BenchError::MissingDevice(_))
        ));
        assert!(rm.opened().is_empty());
    }

    #[test]
    fn test_other_tester_section_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, rm) = setup(dir.path());
        config.tester_3t.bias_search.window = [0.6, 0.4];

        assert!(IvTester::new(&rm, &config).is_ok());
    }

    #[test]
    fn test_oversized_sleep_fails_before_opening() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, rm) = setup(dir.path());
        config.iv_tester.default_sleep_s = 1e30;

        assert!(matches!(IvTester::new(&rm, &config), Err(BenchError::Config(_))));
        assert!(rm.opened().is_empty());
    }

    #[test]
    fn test_read_failure_keeps_completed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let (config, rm) = setup(dir.path());
        let smu = rm.smu(ADDRESS).unwrap();
        let mut tester = IvTester::new(&rm, &config).unwrap();

        let path = {
            let mut session = tester.session().unwrap();
            smu.fail_after("MEAS:VOLT:DC?", 2);
            let result = session.execute(&RunRequest::new());
            assert!(matches!(result, Err(BenchError::Protocol(_))));
            session.run.last_result().unwrap().to_path_buf()
        };

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(
            content.lines().collect::<Vec<_>>(),
            vec!["Set VOLT,V (V),I (A)", "0,0,0", "0.25,0.25,0.00025"]
        );
        assert!(!smu.state().output_on);
        assert_eq!(smu.commands().last().map(String::as_str), Some("OUTP 0"));
    }

    #[test]
    fn test_empty_session_leaves_no_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (config, rm) = setup(dir.path());
        let mut tester = IvTester::new(&rm, &config).unwrap();

        let run_dir = {
            let session = tester.session().unwrap();
            let run_dir = session.run.results_dir().to_path_buf();
            assert!(run_dir.is_dir());
            run_dir
        };
        assert!(!run_dir.exists());
    }
}
