//! Error types for generative teaching operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GtnError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Numerical divergence in {stage} at step {step}: value {value}")]
    Divergence {
        stage: String,
        step: usize,
        value: f64,
    },

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Data exhausted: {0}")]
    DataExhausted(String),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl GtnError {
    /// Build a divergence error for a non-finite or exploding value
    pub fn divergence(stage: impl Into<String>, step: usize, value: f64) -> Self {
        GtnError::Divergence {
            stage: stage.into(),
            step,
            value,
        }
    }
}
