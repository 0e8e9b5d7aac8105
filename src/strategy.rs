use crate::bar::OhlcBar;
use crate::position::{Direction, Position};

/// Recorded intent from `Strategy::entry_rule`.
///
/// The handle does not mutate the simulator directly — it records, at most,
/// one entry decision, which the simulator reads back once `entry_rule`
/// returns. This mirrors the intent-then-act split the teacher crate uses
/// in its trailing-stop and limit-order managers.
#[derive(Debug, Default)]
pub struct EnterHandle {
    direction: Option<Direction>,
}

impl EnterHandle {
    pub fn enter(&mut self, direction: Direction) {
        self.direction = Some(direction);
    }

    pub(crate) fn direction(&self) -> Option<Direction> {
        self.direction
    }
}

/// Recorded intent from `Strategy::exit_rule`.
///
/// `price` is an optional explicit fill price; when omitted the simulator
/// fills at the triggering bar's own open. `reason` defaults to
/// `"exit-rule"` when omitted.
#[derive(Debug, Default)]
pub struct ExitHandle {
    triggered: bool,
    price: Option<f64>,
    reason: Option<String>,
}

impl ExitHandle {
    pub fn exit(&mut self, price: Option<f64>, reason: Option<&str>) {
        self.triggered = true;
        self.price = price;
        self.reason = reason.map(str::to_string);
    }

    pub(crate) fn triggered(&self) -> bool {
        self.triggered
    }

    pub(crate) fn price(&self) -> Option<f64> {
        self.price
    }

    pub(crate) fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

/// Per-bar sample recording flags passed to `backtest`.
///
/// Each flag gates one of a position's sample vectors; all default to
/// `false`, matching the teacher's plain `Default`-deriving config structs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimOptions {
    pub record_stop_price: bool,
    pub record_risk: bool,
    pub record_rate_of_return: bool,
}

/// User-supplied trading rules. `entry_rule` is the only required method;
/// every other callback has a no-op default, so a minimal strategy needs to
/// implement just one function.
///
/// A strategy owns its own parameters as fields on the implementing type —
/// callbacks take `&self`, so there is no separate `parameters` threaded
/// through a context struct the way the design-level contract describes it;
/// `self` already is that context.
pub trait Strategy<B: OhlcBar> {
    /// Number of bars that must be buffered before any rule fires. Default 1.
    fn lookback_period(&self) -> usize {
        1
    }

    /// Optional indicator pre-pass. If not overridden, the indicator series
    /// is identical to the input series — the engine treats this as an
    /// opaque transformation either way.
    fn prep_indicators(&self, bars: Vec<B>) -> Vec<B> {
        bars
    }

    /// Called once per bar while flat. May call `enter.enter(direction)`.
    fn entry_rule(&self, enter: &mut EnterHandle, bar: &B, lookback: &[B]);

    /// Called once per bar while in a position. May call
    /// `exit.exit(price, reason)`.
    fn exit_rule(
        &self,
        _exit: &mut ExitHandle,
        _entry_price: f64,
        _position: &Position,
        _bar: &B,
        _lookback: &[B],
    ) {
    }

    /// Non-negative initial stop distance from entry. `None` means no
    /// initial stop is placed.
    fn stop_loss(&self, _entry_price: f64, _bar: &B) -> Option<f64> {
        None
    }

    /// Non-negative trailing stop distance from the current close. `None`
    /// means no trailing stop is active.
    fn trailing_stop_loss(&self, _bar: &B) -> Option<f64> {
        None
    }

    /// Non-negative profit target distance from entry. `None` means no
    /// target is placed.
    fn profit_target(&self, _entry_price: f64, _bar: &B) -> Option<f64> {
        None
    }

    /// Combined maker+taker fee fraction, applied once at close. Default 0.
    fn fees(&self) -> f64 {
        0.0
    }
}
