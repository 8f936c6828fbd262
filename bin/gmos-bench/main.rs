use clap::{Parser, Subcommand};
use env_logger::Env;
use gmos_bench::{
    AppConfig, BenchError, IvTester, Plotter, ResourceManager, RunOutcome, RunRequest,
    SimulatedResourceManager, TcpResourceManager, Tester, Tester3T, load_config,
};
use log::{LevelFilter, error, info, warn};
use std::path::{Path, PathBuf};

/// GMOS bench measurement tool
#[derive(Parser, Debug)]
#[command(name = "gmos-bench")]
#[command(about = "IV and three-terminal lock-in sweeps on GMOS devices", long_about = None)]
struct Args {
    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Run against simulated instruments instead of the configured bench
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Two-terminal IV sweep on one SMU
    Iv(RunArgs),
    /// Heater x frequency x amplitude x offset sweep with drain SMU and lock-in
    ThreeTerminal(RunArgs),
    /// Plot a result file using the [plot] settings
    Plot {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Show the selected bench and any discoverable resources
    Resources,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Sweep override, repeatable: `heater=1:2:0.5`, `frequency=100,200`, `offset=0.9`
    #[arg(short, long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Result file name, relative to the run's results directory
    #[arg(short, long)]
    filename: Option<String>,

    /// Treat --filename as a full path
    #[arg(long, requires = "filename")]
    abspath: bool,

    /// Plot the result file when the sweep finishes
    #[arg(long)]
    plot: bool,
}

impl RunArgs {
    fn request(&self) -> Result<RunRequest, BenchError> {
        let mut request = RunRequest::new().abspath(self.abspath);
        if let Some(filename) = &self.filename {
            request = request.filename(filename.as_str());
        }
        for pair in &self.set {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                BenchError::Config(format!("Expected KEY=VALUE, got '{pair}'"))
            })?;
            request.set(key, value)?;
        }
        Ok(request)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let loaded = load_config(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .or_else(|| loaded.as_ref().ok().map(|c| c.logging.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    initialize_logging(&log_level);

    let config = match loaded {
        Ok(config) => config,
        Err(e) if matches!(args.command, Command::Plot { .. }) => {
            warn!("Failed to load config ({}), using default plot settings", e);
            AppConfig::default()
        }
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };
    log_startup_info(&config, args.config.as_deref(), args.simulate);

    let result = dispatch(&args, &config);
    if let Err(e) = &result {
        error!("✗ {}", e);
    }
    Ok(result?)
}

fn dispatch(args: &Args, config: &AppConfig) -> Result<(), BenchError> {
    match &args.command {
        Command::Iv(run) => {
            let rm = resource_manager(config, args.simulate)?;
            let request = run.request()?;
            let mut tester = IvTester::new(rm.as_ref(), config)?;
            let outcome = tester.session()?.execute(&request);
            report(outcome, run.plot, config)
        }
        Command::ThreeTerminal(run) => {
            let rm = resource_manager(config, args.simulate)?;
            let request = run.request()?;
            let mut tester = Tester3T::new(rm.as_ref(), config)?;
            let outcome = tester.session()?.execute(&request);
            if let Some(bias) = tester.last_bias() {
                info!(
                    "Bias search: converged = {}, {} attempt(s), I = {:e} A, V = {} V",
                    bias.converged, bias.attempts, bias.drain_current, bias.drain_voltage
                );
            }
            report(outcome, run.plot, config)
        }
        Command::Plot { file } => plot(file, config).map(|_| ()),
        Command::Resources => list_resources(config, args.simulate),
    }
}

fn resource_manager(
    config: &AppConfig,
    simulate: bool,
) -> Result<Box<dyn ResourceManager>, BenchError> {
    if simulate {
        info!("Using simulated instruments");
        Ok(Box::new(SimulatedResourceManager::for_bench(config.bench()?)))
    } else {
        let connection = config.connection.connection_config()?;
        Ok(Box::new(TcpResourceManager::new(connection)))
    }
}

fn report(
    outcome: Result<RunOutcome<()>, BenchError>,
    plot_result: bool,
    config: &AppConfig,
) -> Result<(), BenchError> {
    let outcome = outcome?;
    info!(
        "✓ {} row(s) written to {}",
        outcome.rows,
        outcome.path.display()
    );
    if plot_result {
        plot(&outcome.path, config)?;
    }
    Ok(())
}

fn plot(file: &Path, config: &AppConfig) -> Result<PathBuf, BenchError> {
    Plotter::new(config.plot.clone()).plot_2d(file)
}

fn list_resources(config: &AppConfig, simulate: bool) -> Result<(), BenchError> {
    for (role, address) in config.bench()? {
        println!("{role:<12} {address}");
    }
    let discovered = resource_manager(config, simulate)?.list_resources()?;
    if discovered.is_empty() {
        info!("No resources discovered on the bus");
    }
    for address in discovered {
        println!("found        {address}");
    }
    Ok(())
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>, simulate: bool) {
    info!("=== GMOS Bench ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: default search path"),
    }
    info!(
        "Bench: {}{}",
        config.connected_devices,
        if simulate { " (simulated)" } else { "" }
    );
    info!("Results: {}", config.results_dir.display());
}

/// env_logger with millisecond timestamps
fn initialize_logging(log_level: &str) {
    let level = log_level.parse::<LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Unknown log level '{log_level}', falling back to info");
        LevelFilter::Info
    });

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}
