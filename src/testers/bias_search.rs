use crate::config::{BiasSearchConfig, BiasStrategy};
use crate::error::BenchError;
use crate::instruments::SourceMeter;
use log::{debug, info, warn};
use std::thread;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasSearchOutcome {
    pub converged: bool,
    pub attempts: u32,
    /// Last current applied to the drain
    pub drain_current: f64,
    /// Drain voltage read at that current
    pub drain_voltage: f64,
}

impl BiasStrategy {
    /// Current to try after a reading outside the window
    pub fn next_current(&self, current: f64, voltage: f64, tripped: bool, window: [f64; 2]) -> f64 {
        let midpoint = |ceiling: f64| (current + ceiling) / 2.0;
        match *self {
            BiasStrategy::Midpoint { ceiling } => midpoint(ceiling),
            BiasStrategy::Ohmic { ceiling } => {
                if tripped || voltage == 0.0 || !voltage.is_finite() {
                    return midpoint(ceiling);
                }
                let target = (window[0] + window[1]) / 2.0;
                (current * target / voltage).clamp(-ceiling, ceiling)
            }
        }
    }
}

/// Step the drain current until the drain voltage settles inside the window
///
/// Runs at most `max_attempts` iterations. Running out of attempts is not an
/// error; the caller decides what a missed bias point means.
pub fn acquire_bias_point(
    drain: &mut dyn SourceMeter,
    start_current: f64,
    search: &BiasSearchConfig,
) -> Result<BiasSearchOutcome, BenchError> {
    let [low, high] = search.window;
    let settle = search.settle()?;
    let mut current = start_current;
    let mut outcome = BiasSearchOutcome {
        converged: false,
        attempts: 0,
        drain_current: current,
        drain_voltage: f64::NAN,
    };

    while outcome.attempts < search.max_attempts {
        outcome.attempts += 1;
        drain.set_current(current)?;
        thread::sleep(settle);

        let (voltage, _) = drain.measure()?;
        let tripped = drain.compliance_tripped()?;
        outcome.drain_current = current;
        outcome.drain_voltage = voltage;
        debug!(
            "Bias search attempt {}: I = {:e} A, V = {} V{}",
            outcome.attempts,
            current,
            voltage,
            if tripped { " (compliance)" } else { "" }
        );

        if !tripped && (low..=high).contains(&voltage) {
            outcome.converged = true;
            info!(
                "Bias point found after {} attempt(s): I = {:e} A, V = {} V",
                outcome.attempts, current, voltage
            );
            return Ok(outcome);
        }

        current = search
            .strategy
            .next_current(current, voltage, tripped, search.window);
    }

    warn!(
        "No bias point in [{low}, {high}] V after {} attempt(s); last V = {} V",
        outcome.attempts, outcome.drain_voltage
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::{SimulatedResourceManager, Smu, SourceFunction};

    const ADDRESS: &str = "TCPIP0::sim::5026::SOCKET";

    fn drain(resistance: f64, vcomp: f64) -> Smu {
        let rm = SimulatedResourceManager::new();
        rm.add_smu(ADDRESS, resistance);
        let mut smu = Smu::open(&rm, "drain_smu", ADDRESS).unwrap();
        smu.set_function(SourceFunction::Curr).unwrap();
        smu.set_voltage_compliance(vcomp).unwrap();
        smu.set_on().unwrap();
        smu
    }

    fn search(strategy: BiasStrategy) -> BiasSearchConfig {
        BiasSearchConfig {
            enabled: true,
            window: [0.4, 0.6],
            max_attempts: 10,
            settle_s: 0.0,
            abort_on_failure: false,
            strategy,
        }
    }

    #[test]
    fn test_midpoint_converges() {
        let mut smu = drain(1e4, 2.0);
        let outcome =
            acquire_bias_point(&mut smu, 1e-6, &search(BiasStrategy::Midpoint { ceiling: 1e-4 }))
                .unwrap();

        assert!(outcome.converged);
        assert_eq!(outcome.attempts, 2);
        assert!((outcome.drain_current - 5.05e-5).abs() < 1e-12);
        assert!((outcome.drain_voltage - 0.505).abs() < 1e-9);
    }

    #[test]
    fn test_ohmic_converges() {
        let mut smu = drain(1e3, 2.0);
        let outcome =
            acquire_bias_point(&mut smu, 1e-6, &search(BiasStrategy::Ohmic { ceiling: 1e-3 }))
                .unwrap();

        assert!(outcome.converged);
        assert_eq!(outcome.attempts, 2);
        assert!((outcome.drain_voltage - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unreachable_window_exhausts_attempts() {
        // 1 kOhm at 100 uA tops out at 0.1 V
        let mut smu = drain(1e3, 2.0);
        let outcome =
            acquire_bias_point(&mut smu, 1e-6, &search(BiasStrategy::Midpoint { ceiling: 1e-4 }))
                .unwrap();

        assert!(!outcome.converged);
        assert_eq!(outcome.attempts, 10);
        assert!(outcome.drain_voltage < 0.4);
    }

    #[test]
    fn test_ohmic_falls_back_to_midpoint_on_compliance() {
        let strategy = BiasStrategy::Ohmic { ceiling: 1e-4 };
        assert_eq!(strategy.next_current(1e-3, 2.0, true, [0.4, 0.6]), (1e-3 + 1e-4) / 2.0);

        let next = strategy.next_current(1e-5, 1.0, false, [0.4, 0.6]);
        assert!((next - 5e-6).abs() < 1e-15);

        assert_eq!(strategy.next_current(1e-5, 1e-3, false, [0.4, 0.6]), 1e-4);
    }

    #[test]
    fn test_compliance_reading_is_never_accepted() {
        // voltage clamps at 0.5 V, inside the window, but the limit tripped
        let mut smu = drain(1e6, 0.5);
        let outcome =
            acquire_bias_point(&mut smu, 1e-5, &search(BiasStrategy::Midpoint { ceiling: 1e-4 }))
                .unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.drain_voltage, 0.5);
    }
}
