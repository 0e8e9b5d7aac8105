use serde::{Deserialize, Serialize};

/// A single OHLC price bar.
///
/// The simulator is parametric over this trait rather than a concrete struct
/// so a caller's bar type can carry whatever extra indicator columns
/// `Strategy::prep_indicators` computed, without this crate knowing about
/// them. `time` is milliseconds since the Unix epoch.
pub trait OhlcBar: Clone {
    fn time(&self) -> i64;
    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
}

/// A minimal concrete bar, convenient for callers that have no extra
/// indicator columns and for tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimpleBar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl SimpleBar {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
        }
    }
}

impl OhlcBar for SimpleBar {
    fn time(&self) -> i64 {
        self.time
    }
    fn open(&self) -> f64 {
        self.open
    }
    fn high(&self) -> f64 {
        self.high
    }
    fn low(&self) -> f64 {
        self.low
    }
    fn close(&self) -> f64 {
        self.close
    }
}
