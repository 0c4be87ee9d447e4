//! Position error types.

use thiserror::Error;
use vigil_persistence::PersistenceError;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Durable state error: {0}")]
    Persistence(#[from] PersistenceError),
}

pub type PositionResult<T> = Result<T, PositionError>;
