use thiserror::Error;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Instrument timeout")]
    Timeout,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),
    #[error("Unsupported device role: {0}")]
    UnsupportedDevice(String),
    #[error("Required device not connected: {0}")]
    MissingDevice(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid output path: {0}")]
    InvalidPath(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Plot error: {0}")]
    Plot(String),
}
