use serde::{Deserialize, Serialize};

use crate::position::{Direction, Sample};

/// An immutable snapshot of a closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub direction: Direction,
    pub entry_time: i64,
    pub entry_price: f64,
    pub exit_time: i64,
    pub exit_price: f64,
    pub profit: f64,
    pub profit_pct: f64,
    /// Fee-adjusted multiplicative growth factor for this trade.
    pub growth: f64,
    pub holding_period: u64,
    /// One of `"stop-loss"`, `"profit-target"`, `"exit-rule"`, `"finalize"`.
    pub exit_reason: String,

    pub risk_pct: Option<f64>,
    pub rmultiple: Option<f64>,
    pub stop_price: Option<f64>,
    pub profit_target: Option<f64>,
    pub runup: f64,

    pub risk_series: Option<Vec<Sample>>,
    pub stop_price_series: Option<Vec<Sample>>,
    pub rate_of_return_series: Option<Vec<Sample>>,
}
