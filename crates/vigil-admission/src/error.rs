//! Admission error types.
//!
//! Admission itself never fails at runtime (a denial is a value); these
//! errors only come from invalid configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Breaker thresholds must ascend: warning={warning}, throttled={throttled}, blocked={blocked}")]
    ThresholdOrder {
        warning: u32,
        throttled: u32,
        blocked: u32,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;
