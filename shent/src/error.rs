//! Error handling module for the shent CLI.
//!
//! Wraps the errors of the barrier pipeline together with the CLI's own
//! configuration and validation failures.

use shen_barrier::sim::SimError;
use shen_barrier::BarrierError;
use shen_lir::LirError;
use thiserror::Error;

/// Main error type for the shent CLI application.
#[derive(Error, Debug)]
pub enum ShentError {
    /// Error when a configuration file is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error when command-line input is inconsistent with the configuration.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Barrier emission was aborted.
    #[error("Emission failed: {0}")]
    Barrier(#[from] BarrierError),

    /// Emitted code could not be assembled into a program.
    #[error("Assembly failed: {0}")]
    Lir(#[from] LirError),

    /// The simulated runtime rejected the emitted code.
    #[error("Simulation failed: {0}")]
    Simulation(#[from] SimError),

    /// Error when IO operations fail.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error when JSON serialization fails.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using ShentError.
pub type Result<T> = std::result::Result<T, ShentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ShentError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_validation_error_display() {
        let err = ShentError::Validation("--narrow needs compressed references".to_string());
        assert_eq!(err.to_string(), "Validation error: --narrow needs compressed references");
    }

    #[test]
    fn test_barrier_error_conversion() {
        let err: ShentError = BarrierError::Internal("boom".to_string()).into();
        assert!(matches!(err, ShentError::Barrier(_)));
        assert!(err.to_string().starts_with("Emission failed:"));
    }

    #[test]
    fn test_sim_error_conversion() {
        let err: ShentError = SimError::SatbFull.into();
        assert!(matches!(err, ShentError::Simulation(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ShentError = io_err.into();
        assert!(matches!(err, ShentError::Io(_)));
    }
}
