//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(#[from] ::config::ConfigError),

    #[error("Admission error: {0}")]
    Admission(#[from] vigil_admission::AdmissionError),

    #[error("Executor error: {0}")]
    Executor(#[from] vigil_executor::ExecutorError),

    #[error("Position error: {0}")]
    Position(#[from] vigil_position::PositionError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] vigil_persistence::PersistenceError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] vigil_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
