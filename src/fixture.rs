//! Measurement-run fixture
//!
//! [`RunState`] owns everything that lives for one tester session: the start
//! timestamp, the results directory and the counter that hands out default
//! result-file names. [`RunState::execute`] wraps one measurement invocation:
//! it merges per-call overrides into the configured defaults, resolves the
//! sweep, picks the output path, opens the [`Recorder`], runs the measurement
//! body and closes the recorder again on every path out of the body.

use crate::error::BenchError;
use crate::recorder::Recorder;
use crate::sweep::{SweepParams, SweepPolicy, SweepValue};
use chrono::Local;
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Request keys that control output naming rather than sweep values
pub const RESERVED_KEYS: [&str; 2] = ["filename", "abspath"];

/// Options and overrides for a single measurement invocation
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Result file name, relative to the results directory unless `abspath`
    pub filename: Option<String>,
    /// Treat `filename` as a full path
    pub abspath: bool,
    /// Per-call sweep overrides, applied in order on top of the defaults
    pub overrides: Vec<(String, SweepValue)>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn abspath(mut self, abspath: bool) -> Self {
        self.abspath = abspath;
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: SweepValue) -> Self {
        self.overrides.push((name.into(), value));
        self
    }

    /// Set a `key=value` pair the way it arrives from the command line
    pub fn set(&mut self, key: &str, raw: &str) -> Result<(), BenchError> {
        match key.trim() {
            "filename" => self.filename = Some(raw.trim().to_string()),
            "abspath" => {
                self.abspath = raw.trim().parse::<bool>().map_err(|_| {
                    BenchError::Config(format!("abspath must be true or false, got '{raw}'"))
                })?
            }
            name => self.overrides.push((name.to_string(), raw.parse()?)),
        }
        Ok(())
    }
}

/// Hands out `<base>`, `<base>_1`, `<base>_2`, ...
#[derive(Debug, Clone)]
pub struct NameGenerator {
    base: String,
    issued: usize,
}

impl NameGenerator {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            issued: 0,
        }
    }

    pub fn next_name(&mut self) -> String {
        let name = match self.issued {
            0 => self.base.clone(),
            n => format!("{}_{}", self.base, n),
        };
        self.issued += 1;
        name
    }
}

/// Result of one measurement invocation
#[derive(Debug, Clone)]
pub struct RunOutcome<T> {
    pub path: PathBuf,
    pub rows: usize,
    pub value: T,
}

/// Per-session run state of a tester
#[derive(Debug)]
pub struct RunState {
    tester: &'static str,
    started: String,
    results_dir: PathBuf,
    names: NameGenerator,
    open: bool,
    last_result: Option<PathBuf>,
}

impl RunState {
    pub fn new(tester: &'static str, results_root: impl AsRef<Path>) -> Self {
        let started = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let results_dir = results_root.as_ref().join(tester).join(&started);
        Self {
            tester,
            started,
            results_dir,
            names: NameGenerator::new(tester),
            open: false,
            last_result: None,
        }
    }

    pub fn start_time(&self) -> &str {
        &self.started
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Path of the most recently opened result file
    pub fn last_result(&self) -> Option<&Path> {
        self.last_result.as_deref()
    }

    /// Create the results directory; called on session entry
    pub fn open(&mut self) -> Result<(), BenchError> {
        fs::create_dir_all(&self.results_dir)?;
        self.open = true;
        info!(
            "{} session started, results in {}",
            self.tester,
            self.results_dir.display()
        );
        Ok(())
    }

    /// Remove the results directory if nothing was written to it
    ///
    /// Never fails: cleanup problems are logged and swallowed.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let is_empty = match fs::read_dir(&self.results_dir) {
            Ok(mut entries) => entries.next().is_none(),
            Err(e) => {
                debug!("Could not inspect {}: {}", self.results_dir.display(), e);
                return;
            }
        };

        if is_empty {
            match fs::remove_dir(&self.results_dir) {
                Ok(()) => debug!("Removed empty results directory {}", self.results_dir.display()),
                Err(e) => warn!(
                    "Failed to remove empty results directory {}: {}",
                    self.results_dir.display(),
                    e
                ),
            }
        }
    }

    fn next_free_name(&mut self, dir: &Path) -> PathBuf {
        loop {
            let candidate = with_csv_extension(dir.join(self.names.next_name()));
            if !candidate.exists() {
                return candidate;
            }
        }
    }

    /// Decide where the result file of the next invocation goes
    pub fn output_path(&mut self, request: &RunRequest) -> Result<PathBuf, BenchError> {
        let path = match &request.filename {
            Some(filename) if request.abspath => {
                if !filename.contains(std::path::is_separator) {
                    return Err(BenchError::InvalidPath(format!(
                        "absolute filename '{filename}' has no path separator"
                    )));
                }
                if filename.ends_with(std::path::is_separator) {
                    self.next_free_name(Path::new(filename))
                } else {
                    with_csv_extension(PathBuf::from(filename))
                }
            }
            Some(filename) => with_csv_extension(self.results_dir.join(filename)),
            None => {
                let dir = self.results_dir.clone();
                self.next_free_name(&dir)
            }
        };
        Ok(path)
    }

    /// Run one measurement invocation inside the fixture
    ///
    /// `defaults` are cloned for every call, so overrides never leak into the
    /// next invocation.
    pub fn execute<P, F, T>(
        &mut self,
        defaults: &P,
        policy: SweepPolicy,
        header: &[String],
        request: &RunRequest,
        body: F,
    ) -> Result<RunOutcome<T>, BenchError>
    where
        P: SweepParams,
        F: FnOnce(&P::Resolved, &mut Recorder) -> Result<T, BenchError>,
    {
        if !self.open {
            return Err(BenchError::Config(format!(
                "{} measurement invoked outside an open session",
                self.tester
            )));
        }

        let mut params = defaults.clone();
        for (name, value) in &request.overrides {
            if RESERVED_KEYS.contains(&name.as_str()) {
                debug!("Skipping reserved key '{name}' in sweep overrides");
                continue;
            }
            params.apply_override(name, value.clone())?;
        }
        let sweep = params.resolve(policy)?;

        let path = self.output_path(request)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("{}: recording to {}", self.tester, path.display());

        let mut recorder = Recorder::create(&path, header)?;
        self.last_result = Some(path.clone());

        let result = body(&sweep, &mut recorder);
        let closed = recorder.finish();

        let value = result?;
        let rows = closed?;
        info!("{}: {} row(s) written to {}", self.tester, rows, path.display());

        Ok(RunOutcome { path, rows, value })
    }
}

fn with_csv_extension(path: PathBuf) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "csv") {
        return path;
    }
    let mut raw = path.into_os_string();
    raw.push(".csv");
    PathBuf::from(raw)
}
