use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::error::BacktestError;
use crate::trade::Trade;

const YEAR_MS: f64 = 365.0 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Controls the Sharpe-ratio reconstruction pass. All fields are optional;
/// without a `starting_date` and a derivable `timeframe`, `Analysis.sharpe_ratio`
/// is reported as `0.0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisOptions {
    pub starting_date: Option<i64>,
    pub ending_date: Option<i64>,
    pub timeframe: Option<i64>,
}

/// Portfolio-level performance over a trade sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub starting_capital: f64,
    pub final_capital: f64,
    pub profit: f64,
    pub profit_pct: f64,
    pub growth: f64,
    pub total_trades: u64,
    pub total_bar_count: u64,

    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub max_risk_pct: Option<f64>,

    pub expectancy: Option<f64>,
    pub rmultiple_std_dev: Option<f64>,
    pub sharpe_ratio: f64,
    pub system_quality: Option<f64>,
    pub profit_factor: Option<f64>,

    pub num_winning_trades: u64,
    pub num_losing_trades: u64,
    pub proportion_winning: f64,
    pub proportion_losing: f64,
    pub average_winning_trade: f64,
    pub average_losing_trade: f64,
    pub return_on_account: Option<f64>,
    pub average_profit_per_trade: f64,
    pub expected_value: f64,
}

impl Analysis {
    fn flat(starting_capital: f64) -> Self {
        Self {
            starting_capital,
            final_capital: starting_capital,
            profit: 0.0,
            profit_pct: 0.0,
            growth: 1.0,
            total_trades: 0,
            total_bar_count: 0,
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            max_risk_pct: None,
            expectancy: None,
            rmultiple_std_dev: None,
            sharpe_ratio: 0.0,
            system_quality: None,
            profit_factor: None,
            num_winning_trades: 0,
            num_losing_trades: 0,
            proportion_winning: 0.0,
            proportion_losing: 0.0,
            average_winning_trade: 0.0,
            average_losing_trade: 0.0,
            return_on_account: None,
            average_profit_per_trade: 0.0,
            expected_value: 0.0,
        }
    }
}

/// Reduces a trade sequence into a portfolio-level [`Analysis`].
///
/// `starting_capital` must be positive. An empty `trades` slice produces a
/// flat analysis (no profit, no drawdown) rather than an error — there is
/// nothing invalid about a strategy that never traded.
pub fn analyze(
    starting_capital: f64,
    trades: &[Trade],
    options: &AnalysisOptions,
) -> Result<Analysis, BacktestError> {
    if starting_capital <= 0.0 {
        return Err(BacktestError::InvalidInput(
            "starting_capital must be positive".to_string(),
        ));
    }

    if trades.is_empty() {
        return Ok(Analysis::flat(starting_capital));
    }

    let mut working_capital = starting_capital;
    let mut peak_capital = starting_capital;
    let mut max_drawdown = 0.0_f64;
    let mut max_drawdown_pct = 0.0_f64;
    let mut total_profits = 0.0_f64;
    let mut total_losses = 0.0_f64;
    let mut num_winning = 0u64;
    let mut num_losing = 0u64;
    let mut max_risk_pct: Option<f64> = None;
    let mut total_bar_count = 0u64;
    let mut rmultiples: Vec<f64> = Vec::new();

    for trade in trades {
        working_capital *= trade.growth;
        total_bar_count += trade.holding_period;

        let working_drawdown = if working_capital < peak_capital {
            working_capital - peak_capital
        } else {
            peak_capital = working_capital;
            0.0
        };
        max_drawdown = max_drawdown.min(working_drawdown);
        max_drawdown_pct = max_drawdown_pct.min(working_drawdown / peak_capital * 100.0);

        // A zero-profit trade counts as a loser: the reducer uses `> 0.0`,
        // not `>= 0.0`, to decide the winning side.
        if trade.profit > 0.0 {
            total_profits += trade.profit;
            num_winning += 1;
        } else {
            total_losses += trade.profit;
            num_losing += 1;
        }

        if let Some(risk_pct) = trade.risk_pct {
            max_risk_pct = Some(max_risk_pct.map_or(risk_pct, |m| m.max(risk_pct)));
        }

        if let Some(r) = trade.rmultiple {
            rmultiples.push(r);
        }
    }

    let total_trades = trades.len() as u64;
    let final_capital = working_capital;
    let profit = final_capital - starting_capital;
    let profit_pct = profit / starting_capital * 100.0;
    let growth = final_capital / starting_capital;

    let expectancy = if rmultiples.is_empty() {
        None
    } else {
        Some((&rmultiples[..]).mean())
    };
    let rmultiple_std_dev = if rmultiples.is_empty() {
        None
    } else {
        Some((&rmultiples[..]).population_std_dev())
    };
    let system_quality = match (expectancy, rmultiple_std_dev) {
        (Some(e), Some(s)) if s != 0.0 => Some(e / s),
        _ => None,
    };
    let profit_factor = if total_losses != 0.0 {
        Some(total_profits / total_losses.abs())
    } else {
        None
    };

    let proportion_winning = num_winning as f64 / total_trades as f64;
    let proportion_losing = num_losing as f64 / total_trades as f64;
    let average_winning_trade = if num_winning > 0 {
        total_profits / num_winning as f64
    } else {
        0.0
    };
    let average_losing_trade = if num_losing > 0 {
        total_losses / num_losing as f64
    } else {
        0.0
    };
    let return_on_account = if max_drawdown_pct != 0.0 {
        Some(profit_pct / max_drawdown_pct.abs())
    } else {
        None
    };
    let average_profit_per_trade = profit / total_trades as f64;
    let expected_value =
        proportion_winning * average_winning_trade + proportion_losing * average_losing_trade;

    let sharpe_ratio = reconstruct_sharpe(trades, options).unwrap_or(0.0);

    Ok(Analysis {
        starting_capital,
        final_capital,
        profit,
        profit_pct,
        growth,
        total_trades,
        total_bar_count,
        max_drawdown,
        max_drawdown_pct,
        max_risk_pct,
        expectancy,
        rmultiple_std_dev,
        sharpe_ratio,
        system_quality,
        profit_factor,
        num_winning_trades: num_winning,
        num_losing_trades: num_losing,
        proportion_winning,
        proportion_losing,
        average_winning_trade,
        average_losing_trade,
        return_on_account,
        average_profit_per_trade,
        expected_value,
    })
}

/// Infers a timeframe from the first trade's rate-of-return samples when
/// the caller didn't supply one: the trade's own duration divided by how
/// many samples it produced.
fn infer_timeframe(trades: &[Trade]) -> Option<i64> {
    let first = trades.first()?;
    let series = first.rate_of_return_series.as_ref()?;
    if series.is_empty() {
        return None;
    }
    let timeframe = (first.exit_time - first.entry_time) / series.len() as i64;
    if timeframe == 0 {
        None
    } else {
        Some(timeframe)
    }
}

/// Rebuilds a uniformly-sampled rate-of-return vector across
/// `[starting_date, ending_date)` by scattering every trade's
/// `rate_of_return_series` into `round((sample.time - starting_date) /
/// timeframe)`-indexed buckets (last write wins on a collision), then
/// reports the annualized mean-over-std-dev.
fn reconstruct_sharpe(trades: &[Trade], options: &AnalysisOptions) -> Option<f64> {
    let starting_date = options.starting_date?;
    let ending_date = options.ending_date?;
    let timeframe = options
        .timeframe
        .filter(|t| *t != 0)
        .or_else(|| infer_timeframe(trades))?;

    let span = ending_date - starting_date;
    if span <= 0 {
        return None;
    }
    let len = (span / timeframe) as usize;
    if len == 0 {
        return None;
    }

    let mut samples = vec![0.0_f64; len];
    for trade in trades {
        let Some(series) = trade.rate_of_return_series.as_ref() else {
            continue;
        };
        for sample in series {
            let idx = ((sample.time - starting_date) as f64 / timeframe as f64).round();
            if idx < 0.0 || idx >= len as f64 {
                continue;
            }
            samples[idx as usize] = sample.value;
        }
    }

    let mean = (&samples[..]).mean();
    let std_dev = (&samples[..]).population_std_dev();
    if std_dev == 0.0 {
        return None;
    }
    Some(mean / std_dev * (YEAR_MS / timeframe as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Direction;

    fn mock_trade(growth: f64, profit: f64) -> Trade {
        Trade {
            direction: Direction::Long,
            entry_time: 0,
            entry_price: 100.0,
            exit_time: 1,
            exit_price: 100.0 + profit,
            profit,
            profit_pct: profit,
            growth,
            holding_period: 1,
            exit_reason: "finalize".to_string(),
            risk_pct: None,
            rmultiple: None,
            stop_price: None,
            profit_target: None,
            runup: 0.0,
            risk_series: None,
            stop_price_series: None,
            rate_of_return_series: None,
        }
    }

    #[test]
    fn s5_two_trades_split_winner_and_loser() {
        let trades = vec![mock_trade(1.10, 100.0), mock_trade(0.95, -50.0)];
        let analysis = analyze(1000.0, &trades, &AnalysisOptions::default()).unwrap();
        assert!((analysis.final_capital - 1045.0).abs() < 1e-9);
        assert!((analysis.profit - 45.0).abs() < 1e-9);
        assert_eq!(analysis.num_winning_trades, 1);
        assert_eq!(analysis.num_losing_trades, 1);
        assert!((analysis.profit_factor.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_profit_trade_counts_as_losing() {
        let trades = vec![mock_trade(1.0, 0.0)];
        let analysis = analyze(1000.0, &trades, &AnalysisOptions::default()).unwrap();
        assert_eq!(analysis.num_winning_trades, 0);
        assert_eq!(analysis.num_losing_trades, 1);
    }

    #[test]
    fn non_positive_capital_is_invalid_input() {
        let err = analyze(0.0, &[], &AnalysisOptions::default()).unwrap_err();
        assert!(matches!(err, BacktestError::InvalidInput(_)));
    }

    #[test]
    fn no_trades_yields_flat_analysis() {
        let analysis = analyze(1000.0, &[], &AnalysisOptions::default()).unwrap();
        assert_eq!(analysis.total_trades, 0);
        assert_eq!(analysis.final_capital, 1000.0);
        assert!(analysis.expectancy.is_none());
    }

    #[test]
    fn drawdown_is_never_positive() {
        let trades = vec![mock_trade(1.2, 200.0), mock_trade(0.5, -500.0), mock_trade(1.3, 150.0)];
        let analysis = analyze(1000.0, &trades, &AnalysisOptions::default()).unwrap();
        assert!(analysis.max_drawdown <= 0.0);
        assert!(analysis.max_drawdown_pct <= 0.0);
    }

    #[test]
    fn s6_sharpe_reconstruction_from_uniform_samples() {
        let n = 100usize;
        let timeframe = 1_000i64;
        let mut series = Vec::with_capacity(n);
        let mut values = Vec::with_capacity(n);
        for i in 0..n {
            // A simple deterministic oscillation gives a non-degenerate
            // mean and standard deviation to check the formula against.
            let v = ((i % 2) as f64) * 0.01 - 0.005;
            series.push(crate::position::Sample::new(i as i64 * timeframe, v));
            values.push(v);
        }
        let trade = Trade {
            rate_of_return_series: Some(series),
            entry_time: 0,
            exit_time: n as i64 * timeframe,
            ..mock_trade(1.0, 0.0)
        };
        let options = AnalysisOptions {
            starting_date: Some(0),
            ending_date: Some(n as i64 * timeframe),
            timeframe: Some(timeframe),
        };
        let analysis = analyze(1000.0, &[trade], &options).unwrap();

        let mean = (&values[..]).mean();
        let std_dev = (&values[..]).population_std_dev();
        let expected = mean / std_dev * (YEAR_MS / timeframe as f64).sqrt();
        assert!((analysis.sharpe_ratio - expected).abs() < 1e-9);
    }

    #[test]
    fn sharpe_defaults_to_zero_without_a_starting_date() {
        let trades = vec![mock_trade(1.1, 10.0)];
        let analysis = analyze(1000.0, &trades, &AnalysisOptions::default()).unwrap();
        assert_eq!(analysis.sharpe_ratio, 0.0);
    }
}
