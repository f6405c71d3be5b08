//! Bars and the rolling per-instrument bar window
//!
//! The gateway hands back history with "keep updating" semantics: the last
//! bar may still be forming. The window keeps closed bars separate from the
//! in-progress bar so pattern confirmation only ever sees closed bars.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{TradeError, TradeResult};

/// Immutable OHLC bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Bar {
    pub fn new(timestamp: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self { timestamp, open, high, low, close, volume: 0.0 }
    }

    /// Close at or above open
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    /// Close strictly below open
    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Range fully contained in `outer`, boundaries inclusive
    pub fn is_inside(&self, outer: &Bar) -> bool {
        self.low >= outer.low && self.high <= outer.high
    }
}

/// Bar timeframe requested from the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarSize {
    Hour,
    Day,
    Week,
}

impl BarSize {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
            Self::Week => Duration::weeks(1),
        }
    }
}

impl std::fmt::Display for BarSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hour => write!(f, "1 hour"),
            Self::Day => write!(f, "1 day"),
            Self::Week => write!(f, "1 week"),
        }
    }
}

/// History request passed to `BrokerGateway::get_bars`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarRequest {
    /// How far back to fetch, in calendar days
    pub lookback_days: u32,
    pub bar_size: BarSize,
}

impl Default for BarRequest {
    fn default() -> Self {
        Self { lookback_days: 1, bar_size: BarSize::Hour }
    }
}

/// Rolling window of the most recent bars for one instrument.
///
/// Closed bars are kept in non-decreasing timestamp order without duplicates;
/// at most `retention` of them are held. The optional in-progress bar is only
/// used for breakout comparison.
#[derive(Debug, Clone)]
pub struct BarWindow {
    symbol: String,
    closed: Vec<Bar>,
    in_progress: Option<Bar>,
    retention: usize,
}

impl BarWindow {
    /// Fewest closed bars any detector can work with
    pub const MIN_RETENTION: usize = 3;
    pub const DEFAULT_RETENTION: usize = 5;

    pub fn new(symbol: &str, retention: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            closed: Vec::new(),
            in_progress: None,
            retention: retention.max(Self::MIN_RETENTION),
        }
    }

    /// Build from a gateway history response.
    ///
    /// Bars are sorted and deduplicated; the last bar counts as in progress
    /// when its period has not ended at `now`.
    pub fn from_history(
        symbol: &str,
        mut bars: Vec<Bar>,
        retention: usize,
        bar_size: BarSize,
        now: DateTime<Utc>,
    ) -> Self {
        bars.sort_by_key(|b| b.timestamp);

        let mut window = Self::new(symbol, retention);
        let forming = match bars.last() {
            Some(last) if last.timestamp + bar_size.duration() > now => bars.pop(),
            _ => None,
        };

        for bar in bars {
            window.push(bar);
        }
        if let Some(bar) = forming {
            window.set_in_progress(bar);
        }
        window
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Append a closed bar, evicting the oldest beyond retention.
    ///
    /// A bar with the same timestamp as the newest replaces it; an older bar is
    /// ignored. Returns whether the window changed.
    pub fn push(&mut self, bar: Bar) -> bool {
        match self.closed.last() {
            Some(last) if bar.timestamp < last.timestamp => return false,
            Some(last) if bar.timestamp == last.timestamp => {
                if *last == bar {
                    return false;
                }
                self.closed.pop();
            }
            _ => {}
        }

        // A closed bar supersedes an in-progress bar for the same period
        if self.in_progress.as_ref().is_some_and(|b| b.timestamp <= bar.timestamp) {
            self.in_progress = None;
        }

        self.closed.push(bar);
        if self.closed.len() > self.retention {
            let excess = self.closed.len() - self.retention;
            self.closed.drain(..excess);
        }
        true
    }

    /// Replace the in-progress bar. Ignored unless newer than every closed bar.
    pub fn set_in_progress(&mut self, bar: Bar) {
        if self.closed.last().is_some_and(|last| bar.timestamp <= last.timestamp) {
            return;
        }
        self.in_progress = Some(bar);
    }

    /// Last `n` closed bars, oldest first
    pub fn latest(&self, n: usize) -> TradeResult<&[Bar]> {
        if self.closed.len() < n {
            return Err(TradeError::InsufficientData { needed: n, available: self.closed.len() });
        }
        Ok(&self.closed[self.closed.len() - n..])
    }

    /// Most recent closed bar
    pub fn last_closed(&self) -> TradeResult<&Bar> {
        self.closed.last().ok_or(TradeError::InsufficientData { needed: 1, available: 0 })
    }

    /// The bar currently forming
    pub fn current(&self) -> TradeResult<&Bar> {
        self.in_progress.as_ref().ok_or(TradeError::InsufficientData { needed: 1, available: 0 })
    }

    /// Latest traded price: in-progress close, else last closed close
    pub fn last_price(&self) -> Option<f64> {
        self.in_progress.as_ref().or(self.closed.last()).map(|b| b.close)
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }
}

/// Last-seen bar per instrument, for poll-and-diff evaluation.
#[derive(Debug, Default)]
pub struct BarCache {
    seen: HashMap<String, Bar>,
}

impl BarCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bar` as the latest for `symbol`; true when it differs from
    /// what was seen last poll.
    pub fn observe(&mut self, symbol: &str, bar: &Bar) -> bool {
        match self.seen.get(symbol) {
            Some(prev) if prev == bar => false,
            _ => {
                self.seen.insert(symbol.to_string(), bar.clone());
                true
            }
        }
    }

    pub fn forget(&mut self, symbol: &str) {
        self.seen.remove(symbol);
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
