use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::bar::OhlcBar;
use crate::error::BacktestError;
use crate::position::{Direction, Position, Sample};
use crate::strategy::{EnterHandle, ExitHandle, SimOptions, Strategy};
use crate::trade::Trade;

/// Formats an epoch-millisecond timestamp for log lines. Falls back to the
/// raw integer if it doesn't fit a valid `DateTime`, which should never
/// happen for real bar data but keeps logging itself from panicking.
fn log_time(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// The simulator's internal state. Dispatch happens on the state observed at
/// the start of a bar — a transition set while handling one bar is acted on
/// only at the next bar, except for the immediate same-bar check documented
/// on [`PositionStatus::Enter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionStatus {
    None,
    Enter,
    Position,
    Exit,
}

type ExitTrigger = (i64, f64, String);

fn tighten(direction: Direction, a: f64, b: f64) -> f64 {
    match direction {
        Direction::Long => a.max(b),
        Direction::Short => a.min(b),
    }
}

/// Evaluates the three ordered intrabar exit checks (stop-loss, then profit
/// target, then the strategy's own `exit_rule`) and returns the first one
/// that fires, already resolved to a concrete `(time, price, reason)`.
fn check_intrabar_exit<B, S>(
    strategy: &S,
    position: &Position,
    entry_price: f64,
    bar: &B,
    lookback: &[B],
) -> Option<ExitTrigger>
where
    B: OhlcBar,
    S: Strategy<B>,
{
    let direction = position.direction;

    if let Some(stop) = position.cur_stop_price {
        let triggered = match direction {
            Direction::Long => bar.low() <= stop,
            Direction::Short => bar.high() >= stop,
        };
        if triggered {
            let price = match direction {
                Direction::Long => stop.min(bar.open()),
                Direction::Short => stop.max(bar.open()),
            };
            return Some((bar.time(), price, "stop-loss".to_string()));
        }
    }

    if let Some(target) = position.profit_target {
        let triggered = match direction {
            Direction::Long => bar.high() >= target,
            Direction::Short => bar.low() <= target,
        };
        if triggered {
            return Some((bar.time(), target, "profit-target".to_string()));
        }
    }

    let mut handle = ExitHandle::default();
    strategy.exit_rule(&mut handle, entry_price, position, bar, lookback);
    if handle.triggered() {
        let price = handle.price().unwrap_or_else(|| bar.open());
        let reason = handle.reason().unwrap_or("exit-rule").to_string();
        return Some((bar.time(), price, reason));
    }

    None
}

/// Recomputes the trailing stop, if the strategy defines one, tightening
/// (never loosening) `cur_stop_price`. On entry this also tightens
/// `initial_stop_price` itself, baking the trailing stop into the position's
/// baseline risk; on subsequent bars only `cur_stop_price` ratchets.
fn apply_trailing_stop<B, S>(
    strategy: &S,
    position: &mut Position,
    bar: &B,
    options: &SimOptions,
    is_entry: bool,
) where
    B: OhlcBar,
    S: Strategy<B>,
{
    let trailing_distance = match strategy.trailing_stop_loss(bar) {
        Some(d) => d.max(0.0),
        None => return,
    };
    let trailing_stop_price = match position.direction {
        Direction::Long => bar.close() - trailing_distance,
        Direction::Short => bar.close() + trailing_distance,
    };

    // When there's a fixed initial stop, ratchet against it (and, on the
    // entry bar, fold the ratchet into the baseline itself). When there
    // isn't one, the trailing stop is its own baseline: ratchet against
    // whatever it last resolved to, so a pure trailing-stop strategy still
    // only ever tightens and never gives back a favorable move.
    let new_cur_stop = match position.initial_stop_price {
        Some(initial) => {
            let tightened = tighten(position.direction, initial, trailing_stop_price);
            if is_entry {
                position.initial_stop_price = Some(tightened);
            }
            tightened
        }
        None => match position.cur_stop_price {
            Some(prev) => tighten(position.direction, prev, trailing_stop_price),
            None => trailing_stop_price,
        },
    };
    position.cur_stop_price = Some(new_cur_stop);

    if options.record_stop_price {
        let sample = Sample::new(bar.time(), new_cur_stop);
        position
            .stop_price_series
            .get_or_insert_with(Vec::new)
            .push(sample);
    }
}

fn update_runup<B: OhlcBar>(position: &mut Position, bar: &B) {
    position.runup = match position.direction {
        Direction::Long => position.runup.max(bar.high() - position.entry_price),
        Direction::Short => position.runup.max(position.entry_price - bar.low()),
    };
}

/// Opens a position at `bar.open`, wiring up the initial stop, profit
/// target and trailing stop, then immediately checks for a same-bar exit
/// (a gap past the stop on the entry bar itself).
fn open_position<B, S>(
    strategy: &S,
    direction: Direction,
    bar: &B,
    lookback: &[B],
    options: &SimOptions,
) -> (Position, Option<ExitTrigger>)
where
    B: OhlcBar,
    S: Strategy<B>,
{
    let entry_price = bar.open();
    let mut position = Position::new(direction, bar.time(), entry_price);

    if let Some(stop_distance) = strategy.stop_loss(entry_price, bar) {
        let stop_distance = stop_distance.max(0.0);
        let initial_stop = match direction {
            Direction::Long => entry_price - stop_distance,
            Direction::Short => entry_price + stop_distance,
        };
        position.initial_stop_price = Some(initial_stop);
        position.cur_stop_price = Some(initial_stop);

        let initial_unit_risk = (entry_price - initial_stop).abs();
        position.initial_unit_risk = Some(initial_unit_risk);
        position.initial_risk_pct = Some(initial_unit_risk / entry_price * 100.0);
        position.cur_risk_pct = position.initial_risk_pct;
        position.cur_r_multiple = Some(0.0);
    }

    if options.record_risk {
        let risk_pct = position.cur_risk_pct.unwrap_or(0.0);
        position.risk_series = Some(vec![Sample::new(bar.time(), risk_pct)]);
    }
    if options.record_rate_of_return {
        position.rate_of_return_series = Some(vec![Sample::new(bar.time(), 0.0)]);
    }

    if let Some(target_distance) = strategy.profit_target(entry_price, bar) {
        let target_distance = target_distance.max(0.0);
        position.profit_target = Some(match direction {
            Direction::Long => entry_price + target_distance,
            Direction::Short => entry_price - target_distance,
        });
    }

    let trigger = check_intrabar_exit(strategy, &position, entry_price, bar, lookback);

    apply_trailing_stop(strategy, &mut position, bar, options, true);
    update_runup(&mut position, bar);

    (position, trigger)
}

/// Marks an open position to market at `bar.open`, advancing
/// `holding_period` and appending the per-bar risk and rate-of-return
/// samples. Trailing stop recompute, the intrabar exit check and runup are
/// handled by the caller, which is why they aren't folded in here.
fn mark_to_market<B: OhlcBar>(position: &mut Position, bar: &B, options: &SimOptions) {
    let price = bar.open();
    let last_growth = position.growth;

    let profit = match position.direction {
        Direction::Long => price - position.entry_price,
        Direction::Short => -(price - position.entry_price),
    };
    position.profit = profit;
    position.profit_pct = profit / position.entry_price * 100.0;
    position.growth = match position.direction {
        Direction::Long => price / position.entry_price,
        Direction::Short => (2.0 * position.entry_price - price) / position.entry_price,
    };

    if let Some(stop) = position.cur_stop_price {
        let unit_risk = match position.direction {
            Direction::Long => price - stop,
            Direction::Short => stop - price,
        };
        position.cur_risk_pct = Some(unit_risk / price * 100.0);
        position.cur_r_multiple = Some(profit / unit_risk);
    }

    position.holding_period += 1;
    position.cur_rate_of_return = position.growth / last_growth - 1.0;

    if options.record_risk {
        let risk_pct = position.cur_risk_pct.unwrap_or(0.0);
        position
            .risk_series
            .get_or_insert_with(Vec::new)
            .push(Sample::new(bar.time(), risk_pct));
    }
    if options.record_rate_of_return {
        position
            .rate_of_return_series
            .get_or_insert_with(Vec::new)
            .push(Sample::new(bar.time(), position.cur_rate_of_return));
    }
}

/// Closes a position, applying fees exactly once, and produces the
/// immutable `Trade` record.
fn finalize_position<B, S>(
    strategy: &S,
    mut position: Position,
    exit_time: i64,
    exit_price: f64,
    exit_reason: String,
) -> Trade
where
    B: OhlcBar,
    S: Strategy<B>,
{
    let profit = match position.direction {
        Direction::Long => exit_price - position.entry_price,
        Direction::Short => -(exit_price - position.entry_price),
    };
    let profit_pct = profit / position.entry_price * 100.0;
    let rmultiple = position.initial_unit_risk.map(|risk| profit / risk);
    if rmultiple.is_none() {
        tracing::warn!(
            entry_time = %log_time(position.entry_time),
            exit_time = %log_time(exit_time),
            "trade closed with an undefined rmultiple: no initial stop was ever set"
        );
    }

    let last_growth = position.growth;
    let mut growth = match position.direction {
        Direction::Long => exit_price / position.entry_price,
        Direction::Short => (2.0 * position.entry_price - exit_price) / position.entry_price,
    };
    growth *= 1.0 - strategy.fees();

    position.holding_period += 1;
    let cur_rate_of_return = growth / last_growth - 1.0;
    if let Some(series) = position.rate_of_return_series.as_mut() {
        series.push(Sample::new(exit_time, cur_rate_of_return));
    }

    tracing::debug!(
        entry_time = %log_time(position.entry_time),
        exit_time = %log_time(exit_time),
        exit_reason = %exit_reason,
        "position closed"
    );

    Trade {
        direction: position.direction,
        entry_time: position.entry_time,
        entry_price: position.entry_price,
        exit_time,
        exit_price,
        profit,
        profit_pct,
        growth,
        holding_period: position.holding_period,
        exit_reason,
        risk_pct: position.cur_risk_pct,
        rmultiple,
        stop_price: position.cur_stop_price,
        profit_target: position.profit_target,
        runup: position.runup,
        risk_series: position.risk_series,
        stop_price_series: position.stop_price_series,
        rate_of_return_series: position.rate_of_return_series,
    }
}

/// Runs a strategy against an ordered, finite bar series and returns the
/// trades it produced, in the order their exits occurred.
///
/// `bars` must be non-empty and at least `strategy.lookback_period()` long,
/// or this fails with [`BacktestError::InvalidInput`].
pub fn backtest<B, S>(
    strategy: &S,
    bars: Vec<B>,
    options: &SimOptions,
) -> Result<Vec<Trade>, BacktestError>
where
    B: OhlcBar,
    S: Strategy<B>,
{
    if bars.is_empty() {
        return Err(BacktestError::InvalidInput(
            "bar series is empty".to_string(),
        ));
    }

    let lookback_period = strategy.lookback_period().max(1);
    if bars.len() < lookback_period {
        return Err(BacktestError::InvalidInput(format!(
            "bar series has {} bars, fewer than the strategy's lookback_period of {}",
            bars.len(),
            lookback_period
        )));
    }

    let indicator_bars = strategy.prep_indicators(bars);
    if indicator_bars.is_empty() {
        return Err(BacktestError::InvalidInput(
            "prep_indicators produced an empty series".to_string(),
        ));
    }

    let bar_count = indicator_bars.len();
    let first_time = indicator_bars[0].time();
    let last_time = indicator_bars[bar_count - 1].time();
    let timeframe = ((last_time - first_time) as f64 / bar_count as f64).round() as i64;

    let mut trades = Vec::new();
    let mut buffer: VecDeque<B> = VecDeque::with_capacity(lookback_period);
    let mut status = PositionStatus::None;
    let mut position: Option<Position> = None;
    let mut pending_direction: Option<Direction> = None;
    let mut pending_exit: Option<ExitTrigger> = None;

    for bar in &indicator_bars {
        buffer.push_back(bar.clone());
        if buffer.len() > lookback_period {
            buffer.pop_front();
        }
        if buffer.len() < lookback_period {
            continue;
        }
        let lookback: &[B] = buffer.make_contiguous();

        match status {
            PositionStatus::None => {
                let mut handle = EnterHandle::default();
                strategy.entry_rule(&mut handle, bar, lookback);
                if let Some(direction) = handle.direction() {
                    pending_direction = Some(direction);
                    status = PositionStatus::Enter;
                }
            }
            PositionStatus::Enter => {
                let direction = pending_direction.take().ok_or_else(|| {
                    BacktestError::InvariantViolation(
                        "reached Enter state with no pending direction".to_string(),
                    )
                })?;
                tracing::debug!(time = %log_time(bar.time()), ?direction, "entering position");
                let (new_position, trigger) =
                    open_position(strategy, direction, bar, lookback, options);
                position = Some(new_position);
                status = PositionStatus::Position;
                if let Some(t) = trigger {
                    tracing::debug!(time = %log_time(bar.time()), reason = %t.2, "same-bar exit on entry");
                    pending_exit = Some(t);
                    status = PositionStatus::Exit;
                }
            }
            PositionStatus::Position => {
                let pos = position.as_mut().ok_or_else(|| {
                    BacktestError::InvariantViolation(
                        "reached Position state with no open position".to_string(),
                    )
                })?;
                mark_to_market(pos, bar, options);
                let trigger = check_intrabar_exit(strategy, pos, pos.entry_price, bar, lookback);
                apply_trailing_stop(strategy, pos, bar, options, false);
                update_runup(pos, bar);
                if let Some(t) = trigger {
                    tracing::debug!(time = %log_time(bar.time()), reason = %t.2, "intrabar exit");
                    pending_exit = Some(t);
                    status = PositionStatus::Exit;
                }
            }
            PositionStatus::Exit => {
                let pos = position.take().ok_or_else(|| {
                    BacktestError::InvariantViolation(
                        "reached Exit state with no open position".to_string(),
                    )
                })?;
                let (exit_time, exit_price, exit_reason) = pending_exit
                    .take()
                    .unwrap_or_else(|| (bar.time(), bar.open(), "exit-rule".to_string()));
                let trade = finalize_position(strategy, pos, exit_time, exit_price, exit_reason);
                tracing::debug!(time = %log_time(bar.time()), "position status Exit -> None");
                trades.push(trade);
                status = PositionStatus::None;
            }
        }
    }

    if let Some(pos) = position.take() {
        let last_bar = &indicator_bars[bar_count - 1];
        let exit_time = last_time + timeframe;
        tracing::debug!(time = %log_time(exit_time), "finalizing open position at end of series");
        let trade = finalize_position(
            strategy,
            pos,
            exit_time,
            last_bar.close(),
            "finalize".to_string(),
        );
        trades.push(trade);
    }

    Ok(trades)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::SimpleBar;

    fn bar(time: i64, open: f64, high: f64, low: f64, close: f64) -> SimpleBar {
        SimpleBar::new(time, open, high, low, close)
    }

    /// Enters on the very first dispatch and never exits on its own.
    struct AlwaysInLong;

    impl Strategy<SimpleBar> for AlwaysInLong {
        fn entry_rule(&self, enter: &mut EnterHandle, _bar: &SimpleBar, _lookback: &[SimpleBar]) {
            enter.enter(Direction::Long);
        }
    }

    #[test]
    fn s1_always_in_long_no_stops_finalizes_at_series_end() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 110.0, 110.0, 110.0, 110.0),
            bar(2, 120.0, 120.0, 120.0, 120.0),
        ];
        let trades = backtest(&AlwaysInLong, bars, &SimOptions::default()).unwrap();
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.exit_reason, "finalize");
        assert_eq!(t.entry_price, 110.0);
        assert_eq!(t.exit_price, 120.0);
        assert!((t.growth - 120.0 / 110.0).abs() < 1e-9);
        assert!(t.exit_time > t.entry_time);
        assert!(t.holding_period >= 1);
    }

    /// Enters long on the first dispatch with a fixed stop distance.
    struct FixedStopLong {
        stop_distance: f64,
    }

    impl Strategy<SimpleBar> for FixedStopLong {
        fn entry_rule(&self, enter: &mut EnterHandle, _bar: &SimpleBar, _lookback: &[SimpleBar]) {
            enter.enter(Direction::Long);
        }

        fn stop_loss(&self, _entry_price: f64, _bar: &SimpleBar) -> Option<f64> {
            Some(self.stop_distance)
        }
    }

    #[test]
    fn s2_stop_out_on_gap_down_fills_at_worse_of_stop_and_open() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
            bar(2, 90.0, 92.0, 88.0, 91.0),
            bar(3, 91.0, 91.0, 91.0, 91.0),
        ];
        let strategy = FixedStopLong { stop_distance: 5.0 };
        let trades = backtest(&strategy, bars, &SimOptions::default()).unwrap();
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.exit_reason, "stop-loss");
        assert_eq!(t.exit_price, 90.0);
    }

    /// Enters long with a fixed profit target distance.
    struct FixedTargetLong {
        target_distance: f64,
    }

    impl Strategy<SimpleBar> for FixedTargetLong {
        fn entry_rule(&self, enter: &mut EnterHandle, _bar: &SimpleBar, _lookback: &[SimpleBar]) {
            enter.enter(Direction::Long);
        }

        fn profit_target(&self, _entry_price: f64, _bar: &SimpleBar) -> Option<f64> {
            Some(self.target_distance)
        }
    }

    #[test]
    fn s3_profit_target_hit_intrabar_fills_at_target() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
            bar(2, 105.0, 115.0, 104.0, 112.0),
            bar(3, 112.0, 112.0, 112.0, 112.0),
        ];
        let strategy = FixedTargetLong {
            target_distance: 10.0,
        };
        let trades = backtest(&strategy, bars, &SimOptions::default()).unwrap();
        assert_eq!(trades.len(), 1);
        let t = &trades[0];
        assert_eq!(t.exit_reason, "profit-target");
        assert_eq!(t.exit_price, 110.0);
    }

    /// Enters long with a trailing stop and no initial stop.
    struct TrailingLong {
        trailing_distance: f64,
    }

    impl Strategy<SimpleBar> for TrailingLong {
        fn entry_rule(&self, enter: &mut EnterHandle, _bar: &SimpleBar, _lookback: &[SimpleBar]) {
            enter.enter(Direction::Long);
        }

        fn trailing_stop_loss(&self, _bar: &SimpleBar) -> Option<f64> {
            Some(self.trailing_distance)
        }
    }

    #[test]
    fn s4_trailing_stop_only_tightens() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 102.0, 99.0, 102.0),
            bar(2, 102.0, 109.0, 101.0, 108.0),
            bar(3, 108.0, 109.0, 105.0, 106.0),
            bar(4, 106.0, 106.0, 105.0, 106.0),
        ];
        let strategy = TrailingLong {
            trailing_distance: 5.0,
        };
        let trades = backtest(&strategy, bars, &SimOptions::default()).unwrap();
        assert_eq!(trades.len(), 1);
        // After the 108-close bar the stop should have ratcheted up to 103,
        // and the following 106-close bar must not loosen it back down.
        assert_eq!(trades[0].stop_price, Some(103.0));
    }

    #[test]
    fn fees_are_applied_exactly_once_at_close() {
        struct FeeStrategy {
            fee: f64,
        }
        impl Strategy<SimpleBar> for FeeStrategy {
            fn entry_rule(&self, enter: &mut EnterHandle, _bar: &SimpleBar, _lb: &[SimpleBar]) {
                enter.enter(Direction::Long);
            }
            fn fees(&self) -> f64 {
                self.fee
            }
        }
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
            bar(2, 110.0, 110.0, 110.0, 110.0),
        ];
        let no_fee = backtest(&FeeStrategy { fee: 0.0 }, bars.clone(), &SimOptions::default())
            .unwrap();
        let with_fee = backtest(&FeeStrategy { fee: 0.01 }, bars, &SimOptions::default()).unwrap();
        let expected = no_fee[0].growth * (1.0 - 0.01);
        assert!((with_fee[0].growth - expected).abs() < 1e-9);
    }

    #[test]
    fn empty_bar_series_is_invalid_input() {
        let err = backtest(&AlwaysInLong, Vec::<SimpleBar>::new(), &SimOptions::default())
            .unwrap_err();
        assert!(matches!(err, BacktestError::InvalidInput(_)));
    }

    #[test]
    fn fewer_bars_than_lookback_period_is_invalid_input() {
        struct NeedsFive;
        impl Strategy<SimpleBar> for NeedsFive {
            fn lookback_period(&self) -> usize {
                5
            }
            fn entry_rule(&self, _enter: &mut EnterHandle, _bar: &SimpleBar, _lb: &[SimpleBar]) {}
        }
        let bars = vec![bar(0, 100.0, 100.0, 100.0, 100.0)];
        let err = backtest(&NeedsFive, bars, &SimOptions::default()).unwrap_err();
        assert!(matches!(err, BacktestError::InvalidInput(_)));
    }

    #[test]
    fn a_strategy_that_never_enters_produces_no_trades() {
        struct NeverEnters;
        impl Strategy<SimpleBar> for NeverEnters {
            fn entry_rule(&self, _enter: &mut EnterHandle, _bar: &SimpleBar, _lb: &[SimpleBar]) {}
        }
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 101.0, 101.0, 101.0, 101.0),
        ];
        let trades = backtest(&NeverEnters, bars, &SimOptions::default()).unwrap();
        assert!(trades.is_empty());
    }

    #[test]
    fn sample_series_lengths_match_holding_period_invariants() {
        let bars = vec![
            bar(0, 100.0, 100.0, 100.0, 100.0),
            bar(1, 100.0, 100.0, 100.0, 100.0),
            bar(2, 101.0, 101.0, 101.0, 101.0),
            bar(3, 102.0, 102.0, 102.0, 102.0),
            bar(4, 103.0, 103.0, 103.0, 103.0),
        ];
        let options = SimOptions {
            record_risk: true,
            record_rate_of_return: true,
            record_stop_price: true,
        };
        let strategy = FixedStopLong { stop_distance: 50.0 };
        let trades = backtest(&strategy, bars, &options).unwrap();
        let t = &trades[0];
        let holding = t.holding_period as usize;
        assert_eq!(t.risk_series.as_ref().unwrap().len(), holding);
        assert_eq!(t.rate_of_return_series.as_ref().unwrap().len(), holding + 1);
    }
}
