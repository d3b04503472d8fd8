pub mod error;
pub mod types;

pub use error::PipelineError;
pub use types::{
    Decision, Direction, ExecutionResult, MarketSnapshot, Ohlc, PortfolioState, Position,
    PositionSide, RiskVerdict, Signal, VerdictReason,
};
