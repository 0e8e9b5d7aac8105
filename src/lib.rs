//! Bar-driven, single-asset backtest simulator and trade-sequence analyzer.
//!
//! [`simulator::backtest`] runs a [`strategy::Strategy`] against an ordered
//! bar series and returns the [`trade::Trade`]s it produced; [`analyzer::analyze`]
//! reduces those trades into a portfolio-level [`analyzer::Analysis`]. The two
//! are independent — `analyze` takes a plain trade slice and does not require
//! its input to have come from `backtest`.

pub mod analyzer;
pub mod bar;
pub mod error;
pub mod position;
pub mod simulator;
pub mod strategy;
pub mod trade;

pub use analyzer::{analyze, Analysis, AnalysisOptions};
pub use bar::{OhlcBar, SimpleBar};
pub use error::BacktestError;
pub use position::{Direction, Position, Sample};
pub use simulator::backtest;
pub use strategy::{EnterHandle, ExitHandle, SimOptions, Strategy};
pub use trade::Trade;
