pub mod config;
pub mod error;
pub mod fixture;
pub mod instruments;
pub mod plotting;
pub mod recorder;
pub mod sweep;
pub mod testers;

pub use config::{
    AppConfig, BiasSearchConfig, BiasStrategy, ConnectionSettings, PlotSettings, Scale, load_config,
};
pub use error::BenchError;
pub use fixture::{NameGenerator, RunOutcome, RunRequest, RunState};
pub use instruments::{
    ConnectionConfig, DeviceKind, Instrument, Lia, LockInAmplifier, LockInMeasurement,
    ResourceManager, SimulatedResourceManager, Smu, SourceFunction, SourceMeter,
    TcpResourceManager, Transport,
};
pub use plotting::{Plotter, Series};
pub use recorder::Recorder;
pub use sweep::{SweepParams, SweepPolicy, SweepValue, cartesian, resolve};
pub use testers::{
    BiasSearchOutcome, IvSweep, IvTester, Session, Tester, Tester3T, ThreeTerminalSweep,
};
