use thiserror::Error;

/// Errors that abandon a single symbol's cycle (or, for `CorruptState`,
/// prevent the engine from starting). Risk rejections are not errors;
/// they travel as `RiskVerdict` values.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("No signals available: {0}")]
    NoSignalsAvailable(String),

    #[error("Market data unavailable: {0}")]
    DataUnavailable(String),

    #[error("No stop loss configurable: {0}")]
    NoStopLossConfigurable(String),

    #[error("Cycle deadline exceeded: {0}")]
    CycleDeadlineExceeded(String),

    #[error("Corrupt persisted state: {0}")]
    CorruptState(String),
}
