//! Sweep parameter resolution
//!
//! A sweep parameter is configured either as a single scalar, a
//! `[start, stop, step]` triple or an explicit list of values. The triple is
//! expanded according to the active [`SweepPolicy`]:
//!
//! - `linear`: `start + i * step` with an exclusive stop
//! - `log`: `10^x` for `count` exponents evenly spaced between `start` and
//!   `stop` inclusive; the third element is the count
//! - `fixed`: only scalars and explicit lists are accepted
//!
//! Every resolved sequence is non-empty, finite and bounded in length.

use crate::error::BenchError;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound on the number of points a single axis may expand to
pub const MAX_SWEEP_POINTS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SweepPolicy {
    Fixed,
    #[default]
    Linear,
    Log,
}

impl FromStr for SweepPolicy {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" => Ok(SweepPolicy::Fixed),
            "linear" => Ok(SweepPolicy::Linear),
            "log" => Ok(SweepPolicy::Log),
            other => Err(BenchError::Config(format!(
                "Unknown sweep policy '{other}' (expected fixed, linear or log)"
            ))),
        }
    }
}

impl fmt::Display for SweepPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepPolicy::Fixed => write!(f, "fixed"),
            SweepPolicy::Linear => write!(f, "linear"),
            SweepPolicy::Log => write!(f, "log"),
        }
    }
}

/// Raw value of a sweep parameter before resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SweepValue {
    /// Held fixed for the whole run
    Scalar(f64),
    /// `[start, stop, step]` under `linear`, `[start_exp, stop_exp, count]` under `log`
    Range([f64; 3]),
    /// Explicit list, used as given regardless of policy
    Values { values: Vec<f64> },
}

impl SweepValue {
    pub fn list(values: Vec<f64>) -> Self {
        SweepValue::Values { values }
    }
}

/// Command-line syntax: `x` scalar, `a:b:c` range triple, `a,b,c` explicit list
impl FromStr for SweepValue {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |part: &str| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| BenchError::Config(format!("Invalid number '{part}' in '{s}'")))
        };

        if s.contains(':') {
            let parts = s.split(':').map(parse).collect::<Result<Vec<_>, _>>()?;
            match parts.as_slice() {
                [start, stop, step] => Ok(SweepValue::Range([*start, *stop, *step])),
                _ => Err(BenchError::Config(format!(
                    "Range '{s}' must have the form start:stop:step"
                ))),
            }
        } else if s.contains(',') {
            let values = s.split(',').map(parse).collect::<Result<Vec<_>, _>>()?;
            Ok(SweepValue::list(values))
        } else {
            Ok(SweepValue::Scalar(parse(s)?))
        }
    }
}

/// Expand a named sweep parameter into the ordered sequence of values it takes
pub fn resolve(
    name: &str,
    value: &SweepValue,
    policy: SweepPolicy,
) -> Result<Vec<f64>, BenchError> {
    let values = match value {
        SweepValue::Scalar(x) => vec![*x],
        SweepValue::Values { values } => values.clone(),
        SweepValue::Range([start, stop, step]) => match policy {
            SweepPolicy::Fixed => {
                return Err(BenchError::Config(format!(
                    "{name}: range [{start}, {stop}, {step}] given under fixed sweep policy"
                )));
            }
            SweepPolicy::Linear => arange(*start, *stop, *step),
            SweepPolicy::Log => logspace(*start, *stop, *step),
        }
        .map_err(|e| BenchError::Config(format!("{name}: {e}")))?,
    };

    if values.is_empty() {
        return Err(BenchError::Config(format!("{name}: sweep is empty")));
    }
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(BenchError::Config(format!(
            "{name}: sweep contains non-finite value {bad}"
        )));
    }

    debug!("Resolved {name} ({policy}): {} point(s)", values.len());
    Ok(values)
}

fn arange(start: f64, stop: f64, step: f64) -> Result<Vec<f64>, String> {
    if !(start.is_finite() && stop.is_finite() && step.is_finite()) || step == 0.0 {
        return Err(format!(
            "invalid linear range [{start}, {stop}) with step {step}"
        ));
    }

    let count = ((stop - start) / step).ceil();
    if count < 1.0 {
        return Err(format!("linear range [{start}, {stop}) with step {step} is empty"));
    }
    if count > MAX_SWEEP_POINTS as f64 {
        return Err(format!(
            "linear range [{start}, {stop}) with step {step} exceeds {MAX_SWEEP_POINTS} points"
        ));
    }

    Ok((0..count as usize)
        .map(|i| start + i as f64 * step)
        .collect())
}

fn logspace(start: f64, stop: f64, count: f64) -> Result<Vec<f64>, String> {
    if !(start.is_finite() && stop.is_finite()) {
        return Err(format!("invalid log range [{start}, {stop}]"));
    }
    if count.fract() != 0.0 || count < 1.0 || count > MAX_SWEEP_POINTS as f64 {
        return Err(format!(
            "log range point count must be a positive integer up to {MAX_SWEEP_POINTS}, got {count}"
        ));
    }

    let n = count as usize;
    if n == 1 {
        return Ok(vec![10f64.powf(start)]);
    }

    let delta = (stop - start) / (n - 1) as f64;
    Ok((0..n)
        .map(|i| {
            // pin the last exponent so the endpoint is exact
            let exponent = if i == n - 1 { stop } else { start + i as f64 * delta };
            10f64.powf(exponent)
        })
        .collect())
}

/// Iterator over every combination of the given axes
///
/// The first axis varies slowest, the last axis fastest.
#[derive(Debug, Clone)]
pub struct Cartesian<'a> {
    axes: &'a [Vec<f64>],
    indices: Vec<usize>,
    done: bool,
}

pub fn cartesian(axes: &[Vec<f64>]) -> Cartesian<'_> {
    Cartesian {
        axes,
        indices: vec![0; axes.len()],
        done: axes.is_empty() || axes.iter().any(|axis| axis.is_empty()),
    }
}

impl Cartesian<'_> {
    /// Total number of combinations, `None` if it does not fit in `usize`
    pub fn combinations(&self) -> Option<usize> {
        if self.axes.is_empty() {
            return Some(0);
        }
        self.axes
            .iter()
            .try_fold(1usize, |total, axis| total.checked_mul(axis.len()))
    }
}

impl Iterator for Cartesian<'_> {
    type Item = Vec<f64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let item = self
            .indices
            .iter()
            .zip(self.axes)
            .map(|(&i, axis)| axis[i])
            .collect();

        for k in (0..self.axes.len()).rev() {
            self.indices[k] += 1;
            if self.indices[k] < self.axes[k].len() {
                return Some(item);
            }
            self.indices[k] = 0;
        }

        self.done = true;
        Some(item)
    }
}

/// Statically declared sweep parameters of one tester variant
///
/// Defaults come from configuration; per-call overrides replace a named
/// parameter wholesale before the whole set is resolved.
pub trait SweepParams: Clone {
    type Resolved;

    fn apply_override(&mut self, name: &str, value: SweepValue) -> Result<(), BenchError>;

    fn resolve(&self, policy: SweepPolicy) -> Result<Self::Resolved, BenchError>;
}
