use serde::{Deserialize, Serialize};

/// A single `{time, value}` observation recorded into one of a position's
/// per-bar sample vectors (risk, rate of return, stop price).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(time: i64, value: f64) -> Self {
        Self { time, value }
    }
}

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

/// An open position. At most one exists at a time inside the simulator.
///
/// All the `Option` fields are present only when the strategy's
/// corresponding callback (`stop_loss`, `trailing_stop_loss`, `profit_target`)
/// is configured, or when the matching `SimOptions` recording flag is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub direction: Direction,
    pub entry_time: i64,
    pub entry_price: f64,

    pub growth: f64,
    pub profit: f64,
    pub profit_pct: f64,
    pub holding_period: u64,
    pub cur_rate_of_return: f64,
    pub runup: f64,

    pub initial_stop_price: Option<f64>,
    pub cur_stop_price: Option<f64>,
    pub initial_unit_risk: Option<f64>,
    pub initial_risk_pct: Option<f64>,
    pub cur_risk_pct: Option<f64>,
    pub cur_r_multiple: Option<f64>,
    pub profit_target: Option<f64>,

    pub risk_series: Option<Vec<Sample>>,
    pub stop_price_series: Option<Vec<Sample>>,
    pub rate_of_return_series: Option<Vec<Sample>>,
}

impl Position {
    pub fn new(direction: Direction, entry_time: i64, entry_price: f64) -> Self {
        Self {
            direction,
            entry_time,
            entry_price,
            growth: 1.0,
            profit: 0.0,
            profit_pct: 0.0,
            holding_period: 0,
            cur_rate_of_return: 0.0,
            runup: 0.0,
            initial_stop_price: None,
            cur_stop_price: None,
            initial_unit_risk: None,
            initial_risk_pct: None,
            cur_risk_pct: None,
            cur_r_multiple: None,
            profit_target: None,
            risk_series: None,
            stop_price_series: None,
            rate_of_return_series: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_position_has_documented_defaults() {
        let p = Position::new(Direction::Long, 0, 100.0);
        assert_eq!(p.growth, 1.0);
        assert_eq!(p.profit, 0.0);
        assert_eq!(p.holding_period, 0);
        assert_eq!(p.cur_rate_of_return, 0.0);
        assert_eq!(p.runup, 0.0);
        assert!(p.initial_stop_price.is_none());
        assert!(p.risk_series.is_none());
    }
}
