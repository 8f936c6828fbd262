use crate::error::BenchError;
use crate::instruments::{ConnectionConfig, SourceFunction};
use crate::sweep::{SweepPolicy, SweepValue};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files tried, in order, when no configuration path is given
pub const DEFAULT_CONFIG_FILES: [&str; 3] = ["gmos_bench.toml", "gmos_bench.json", "config.toml"];

/// Role name to resource address for one physical bench
pub type BenchConfig = BTreeMap<String, String>;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Key into `benches` selecting the instruments in use
    pub connected_devices: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    pub benches: BTreeMap<String, BenchConfig>,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub iv_tester: IvTesterConfig,
    pub tester_3t: ThreeTerminalConfig,
    #[serde(default)]
    pub plot: PlotSettings,
}

/// Socket timeouts for networked instruments
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct ConnectionSettings {
    pub connect_timeout_s: f64,
    pub read_timeout_s: f64,
    pub write_timeout_s: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct IvTesterConfig {
    pub required_devices: Vec<String>,
    pub output_mode: SourceFunction,
    /// Limit on the measured quantity
    pub compliance: f64,
    pub default_sleep_s: f64,
    #[serde(default)]
    pub sweep_policy: SweepPolicy,
    pub output: SweepValue,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ThreeTerminalConfig {
    pub required_devices: Vec<String>,
    pub heater_icomp: f64,
    pub drain_vcomp: f64,
    pub drain_idc: f64,
    pub heater_sleep_s: f64,
    pub default_sleep_s: f64,
    #[serde(default)]
    pub sweep_policy: SweepPolicy,
    pub heater: SweepValue,
    pub frequency: SweepValue,
    pub amplitude: SweepValue,
    pub offset: SweepValue,
    /// Run the lock-in auto-phase once the heater has settled
    #[serde(default)]
    pub auto_phase: bool,
    #[serde(default)]
    pub bias_search: BiasSearchConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BiasSearchConfig {
    pub enabled: bool,
    /// Acceptable drain voltage `[low, high]`
    pub window: [f64; 2],
    pub max_attempts: u32,
    pub settle_s: f64,
    pub abort_on_failure: bool,
    pub strategy: BiasStrategy,
}

/// How the next drain current is chosen after a reading outside the window
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BiasStrategy {
    Midpoint { ceiling: f64 },
    Ohmic { ceiling: f64 },
}

impl BiasStrategy {
    pub fn ceiling(&self) -> f64 {
        match self {
            BiasStrategy::Midpoint { ceiling } | BiasStrategy::Ohmic { ceiling } => *ceiling,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    #[default]
    Linear,
    Log,
}

/// Column selection and labelling for result plots; empty labels and title
/// fall back to the CSV header and file name
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct PlotSettings {
    pub x_column: usize,
    pub y_column: usize,
    pub x_label: String,
    pub y_label: String,
    pub x_scale: Scale,
    pub y_scale: Scale,
    pub title: String,
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("measurement_results")
}

impl Default for AppConfig {
    fn default() -> Self {
        let bench: BenchConfig = [
            ("smu", "TCPIP0::127.0.0.1::5025::SOCKET"),
            ("heater_smu", "TCPIP0::127.0.0.1::5025::SOCKET"),
            ("drain_smu", "TCPIP0::127.0.0.1::5026::SOCKET"),
            ("lia", "TCPIP0::127.0.0.1::1234::SOCKET"),
        ]
        .into_iter()
        .map(|(role, address)| (role.to_string(), address.to_string()))
        .collect();

        Self {
            connected_devices: "sim".to_string(),
            results_dir: default_results_dir(),
            benches: BTreeMap::from([("sim".to_string(), bench)]),
            connection: ConnectionSettings::default(),
            logging: LoggingConfig::default(),
            iv_tester: IvTesterConfig::default(),
            tester_3t: ThreeTerminalConfig::default(),
            plot: PlotSettings::default(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            connect_timeout_s: defaults.connect_timeout.as_secs_f64(),
            read_timeout_s: defaults.read_timeout.as_secs_f64(),
            write_timeout_s: defaults.write_timeout.as_secs_f64(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for IvTesterConfig {
    fn default() -> Self {
        Self {
            required_devices: vec!["smu".to_string()],
            output_mode: SourceFunction::Volt,
            compliance: 0.01,
            default_sleep_s: 0.1,
            sweep_policy: SweepPolicy::Linear,
            output: SweepValue::Range([0.0, 1.0, 0.25]),
        }
    }
}

impl Default for ThreeTerminalConfig {
    fn default() -> Self {
        Self {
            required_devices: vec![
                "heater_smu".to_string(),
                "drain_smu".to_string(),
                "lia".to_string(),
            ],
            heater_icomp: 0.1,
            drain_vcomp: 2.0,
            drain_idc: 1e-6,
            heater_sleep_s: 1.0,
            default_sleep_s: 0.1,
            sweep_policy: SweepPolicy::Linear,
            heater: SweepValue::Range([2.5, 5.1, 0.1]),
            frequency: SweepValue::Scalar(1000.0),
            amplitude: SweepValue::Scalar(0.05),
            offset: SweepValue::Scalar(0.9),
            auto_phase: false,
            bias_search: BiasSearchConfig::default(),
        }
    }
}

impl Default for BiasSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window: [0.4, 0.6],
            max_attempts: 10,
            settle_s: 0.1,
            abort_on_failure: false,
            strategy: BiasStrategy::Midpoint { ceiling: 1e-4 },
        }
    }
}

impl Default for PlotSettings {
    fn default() -> Self {
        Self {
            x_column: 0,
            y_column: 1,
            x_label: String::new(),
            y_label: String::new(),
            x_scale: Scale::Linear,
            y_scale: Scale::Linear,
            title: String::new(),
        }
    }
}

impl AppConfig {
    /// Addresses of the bench selected by `connected_devices`
    pub fn bench(&self) -> Result<&BenchConfig, BenchError> {
        self.benches.get(&self.connected_devices).ok_or_else(|| {
            BenchError::Config(format!(
                "connected_devices names unknown bench '{}'",
                self.connected_devices
            ))
        })
    }

    /// Checks shared by every tester: the selected bench and socket timeouts
    ///
    /// Tester sections are checked by the tester that uses them.
    pub fn validate(&self) -> Result<(), BenchError> {
        self.bench()?;
        self.connection.connection_config()?;
        Ok(())
    }
}

impl ConnectionSettings {
    pub fn connection_config(&self) -> Result<ConnectionConfig, BenchError> {
        let timeout = |key: &str, value: f64| {
            positive(key, value)?;
            seconds(key, value)
        };
        Ok(ConnectionConfig {
            connect_timeout: timeout("connection.connect_timeout_s", self.connect_timeout_s)?,
            read_timeout: timeout("connection.read_timeout_s", self.read_timeout_s)?,
            write_timeout: timeout("connection.write_timeout_s", self.write_timeout_s)?,
            ..ConnectionConfig::default()
        })
    }
}

impl IvTesterConfig {
    pub fn validate(&self) -> Result<(), BenchError> {
        positive("iv_tester.compliance", self.compliance)?;
        self.settle()?;
        unique_roles("iv_tester.required_devices", &self.required_devices)
    }

    /// Wait between setting a level and reading it back
    pub fn settle(&self) -> Result<Duration, BenchError> {
        seconds("iv_tester.default_sleep_s", self.default_sleep_s)
    }
}

impl ThreeTerminalConfig {
    pub fn validate(&self) -> Result<(), BenchError> {
        positive("tester_3t.heater_icomp", self.heater_icomp)?;
        positive("tester_3t.drain_vcomp", self.drain_vcomp)?;
        self.heater_settle()?;
        self.settle()?;
        unique_roles("tester_3t.required_devices", &self.required_devices)?;
        if !self.drain_idc.is_finite() {
            return Err(BenchError::Config(
                "tester_3t.drain_idc must be finite".to_string(),
            ));
        }
        self.bias_search.validate()
    }

    /// Wait after the heater is first switched on
    pub fn heater_settle(&self) -> Result<Duration, BenchError> {
        seconds("tester_3t.heater_sleep_s", self.heater_sleep_s)
    }

    /// Wait between pushing a combination and reading the lock-in
    pub fn settle(&self) -> Result<Duration, BenchError> {
        seconds("tester_3t.default_sleep_s", self.default_sleep_s)
    }
}

impl BiasSearchConfig {
    pub fn validate(&self) -> Result<(), BenchError> {
        if !(self.window[0] < self.window[1]) {
            return Err(BenchError::Config(format!(
                "tester_3t.bias_search.window must be ordered [low, high], got {:?}",
                self.window
            )));
        }
        if self.max_attempts == 0 {
            return Err(BenchError::Config(
                "tester_3t.bias_search.max_attempts must be at least 1".to_string(),
            ));
        }
        self.settle()?;
        positive("tester_3t.bias_search.strategy.ceiling", self.strategy.ceiling())
    }

    pub fn settle(&self) -> Result<Duration, BenchError> {
        seconds("tester_3t.bias_search.settle_s", self.settle_s)
    }
}

fn positive(key: &str, value: f64) -> Result<(), BenchError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(BenchError::Config(format!("{key} must be > 0, got {value}")))
    }
}

/// Configured seconds as a `Duration`; negative, NaN and oversized values are rejected
pub fn seconds(key: &str, value: f64) -> Result<Duration, BenchError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        BenchError::Config(format!("{key} must be a non-negative number of seconds, got {value}"))
    })
}

fn unique_roles(key: &str, roles: &[String]) -> Result<(), BenchError> {
    for (i, role) in roles.iter().enumerate() {
        if roles[..i].contains(role) {
            return Err(BenchError::Config(format!("{key} lists '{role}' twice")));
        }
    }
    Ok(())
}

/// Load the configuration document, layered with `GMOS_BENCH__*` environment overrides
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, BenchError> {
    let path = match config_path {
        Some(path) if path.exists() => path.to_path_buf(),
        Some(path) => {
            return Err(BenchError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        None => DEFAULT_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or_else(|| {
                BenchError::Config(format!(
                    "No config file given and none of {} found",
                    DEFAULT_CONFIG_FILES.join(", ")
                ))
            })?,
    };
    log::debug!("Loading configuration from {}", path.display());

    let config = Config::builder()
        .add_source(File::from(path.as_path()))
        .add_source(
            Environment::with_prefix("GMOS_BENCH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate()?;
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const LAB_TOML: &str = r#"
connected_devices = "lab"
results_dir = "results"

[benches.lab]
heater_smu = "TCPIP0::192.168.1.20::5025::SOCKET"
drain_smu = "TCPIP0::192.168.1.21::5025::SOCKET"
lia = "TCPIP0::192.168.1.22::1234::SOCKET"
smu = "TCPIP0::192.168.1.20::5025::SOCKET"

[iv_tester]
required_devices = ["smu"]
output_mode = "curr"
compliance = 2.0
default_sleep_s = 0.0
sweep_policy = "log"
output = [-9, -6, 4]

[tester_3t]
required_devices = ["heater_smu", "drain_smu", "lia"]
heater_icomp = 0.1
drain_vcomp = 2.0
drain_idc = 1e-6
heater_sleep_s = 1.0
default_sleep_s = 0.1
heater = [2.5, 5.1, 0.1]
frequency = 1000
amplitude = { values = [0.01, 0.05] }
offset = 0.9

[tester_3t.bias_search]
enabled = true
window = [0.4, 0.6]
max_attempts = 5
settle_s = 0.0
abort_on_failure = true
strategy = { type = "ohmic", ceiling = 1e-4 }
"#;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_toml_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "bench.toml", LAB_TOML);

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.connected_devices, "lab");
        assert_eq!(config.bench().unwrap().len(), 4);
        assert_eq!(config.iv_tester.output_mode, SourceFunction::Curr);
        assert_eq!(config.iv_tester.sweep_policy, SweepPolicy::Log);
        assert_eq!(config.iv_tester.output, SweepValue::Range([-9.0, -6.0, 4.0]));
        assert_eq!(config.tester_3t.sweep_policy, SweepPolicy::Linear);
        assert_eq!(config.tester_3t.frequency, SweepValue::Scalar(1000.0));
        assert_eq!(config.tester_3t.amplitude, SweepValue::list(vec![0.01, 0.05]));
        assert_eq!(
            config.tester_3t.bias_search.strategy,
            BiasStrategy::Ohmic { ceiling: 1e-4 }
        );
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.plot.x_scale, Scale::Linear);
    }

    #[test]
    fn test_load_json_document() {
        let dir = tempfile::tempdir().unwrap();
        let json = r#"{
            "connected_devices": "sim",
            "benches": { "sim": { "smu": "TCPIP0::127.0.0.1::5025::SOCKET" } },
            "iv_tester": {
                "required_devices": ["smu"], "output_mode": "volt", "compliance": 0.01,
                "default_sleep_s": 0.1, "output": [0.0, 1.0, 0.25]
            },
            "tester_3t": {
                "required_devices": ["heater_smu", "drain_smu", "lia"],
                "heater_icomp": 0.1, "drain_vcomp": 2.0, "drain_idc": 1e-6,
                "heater_sleep_s": 1.0, "default_sleep_s": 0.1,
                "heater": 2.5, "frequency": 1000.0, "amplitude": 0.05, "offset": 0.9
            },
            "plot": { "x_column": 0, "y_column": 2, "y_scale": "log" }
        }"#;
        let path = write(&dir, "bench.json", json);

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.plot.y_column, 2);
        assert_eq!(config.plot.y_scale, Scale::Log);
        assert!(!config.tester_3t.bias_search.enabled);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let content = LAB_TOML.replace("compliance = 2.0", "compliance = 2.0\ncompliunce = 1.0");
        let path = write(&dir, "typo.toml", &content);

        assert!(matches!(load_config(Some(&path)), Err(BenchError::ConfigLoad(_))));
    }

    #[test]
    fn test_unknown_sweep_policy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let content = LAB_TOML.replace("sweep_policy = \"log\"", "sweep_policy = \"geometric\"");
        let path = write(&dir, "policy.toml", &content);

        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let content = LAB_TOML.replace("drain_idc = 1e-6\n", "");
        let path = write(&dir, "missing.toml", &content);

        assert!(matches!(load_config(Some(&path)), Err(BenchError::ConfigLoad(_))));
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(load_config(Some(&path)), Err(BenchError::Config(_))));
    }

    #[test]
    fn test_validate_ranges() {
        assert!(AppConfig::default().validate().is_ok());

        let mut config = AppConfig::default();
        config.connected_devices = "nowhere".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.connection.read_timeout_s = 0.0;
        assert!(config.validate().is_err());

        let mut iv = IvTesterConfig::default();
        iv.compliance = 0.0;
        assert!(iv.validate().is_err());

        let mut t3 = ThreeTerminalConfig::default();
        t3.bias_search.window = [0.6, 0.4];
        assert!(t3.validate().is_err());

        let mut t3 = ThreeTerminalConfig::default();
        t3.required_devices.push("lia".to_string());
        assert!(t3.validate().is_err());

        let mut t3 = ThreeTerminalConfig::default();
        t3.heater_sleep_s = -1.0;
        assert!(t3.validate().is_err());
    }

    #[test]
    fn test_oversized_sleep_is_rejected() {
        let mut iv = IvTesterConfig::default();
        iv.default_sleep_s = 1e30;
        assert!(matches!(iv.validate(), Err(BenchError::Config(_))));

        let mut t3 = ThreeTerminalConfig::default();
        t3.bias_search.settle_s = f64::NAN;
        assert!(matches!(t3.validate(), Err(BenchError::Config(_))));

        assert_eq!(
            seconds("x", 0.25).unwrap(),
            Duration::from_millis(250)
        );
        assert!(seconds("x", f64::INFINITY).is_err());
    }

    #[test]
    fn test_tester_sections_do_not_block_loading() {
        let dir = tempfile::tempdir().unwrap();
        let content = LAB_TOML.replace("window = [0.4, 0.6]", "window = [0.6, 0.4]");
        let path = write(&dir, "window.toml", &content);

        let config = load_config(Some(&path)).unwrap();
        assert!(config.iv_tester.validate().is_ok());
        assert!(config.tester_3t.validate().is_err());
    }

    #[test]
    fn test_connection_timeouts_from_document() {
        let dir = tempfile::tempdir().unwrap();
        let content = format!("{LAB_TOML}\n[connection]\nread_timeout_s = 2.5\n");
        let path = write(&dir, "timeouts.toml", &content);

        let connection = load_config(Some(&path))
            .unwrap()
            .connection
            .connection_config()
            .unwrap();
        assert_eq!(connection.read_timeout, Duration::from_millis(2500));
        assert_eq!(connection.connect_timeout, Duration::from_secs(5));
    }
}
