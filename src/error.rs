use thiserror::Error;

/// Errors raised by [`crate::simulator::backtest`] and [`crate::analyzer::analyze`].
///
/// Both variants are fatal to the current call: nothing here is retried or
/// swallowed. `InvariantViolation` indicates a bug in the calling strategy
/// (a callback handle used outside of its documented state), not a data
/// problem.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BacktestError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
