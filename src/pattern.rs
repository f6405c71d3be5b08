//! Inside-bar pattern detection
//!
//! Detection and entry-trigger are separate steps:
//! 1. `PatternDetector::detect` qualifies an instrument for the watchlist from
//!    closed bars only (once per hour, at rollover)
//! 2. `check_trigger` runs every poll against the forming bar, using the
//!    confirmation bar captured at detection time
//!
//! Bars are named by role rather than position: the *inside* bar is the most
//! recent closed bar, the *context* bar is the one before it.

use serde::{Deserialize, Serialize};

use crate::bars::{Bar, BarWindow};
use crate::error::{TradeError, TradeResult};

/// Fewest bars (closed + forming) a window must hold before anything is evaluated
pub const MIN_EVALUABLE_BARS: usize = 3;

/// Which setup qualifies an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorVariant {
    /// Bullish inside bar
    #[default]
    InsideBar,
    /// Bullish inside bar whose context bar is also bullish
    StrictInsideBar,
    /// Bearish bar, a failed new low, then a bullish inside bar
    FailedBreakdown,
}

impl DetectorVariant {
    /// Closed bars the predicate inspects
    pub fn closed_bars_needed(&self) -> usize {
        match self {
            Self::InsideBar | Self::StrictInsideBar => 2,
            Self::FailedBreakdown => 3,
        }
    }
}

impl std::fmt::Display for DetectorVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsideBar => write!(f, "INSIDE"),
            Self::StrictInsideBar => write!(f, "STRICT_INSIDE"),
            Self::FailedBreakdown => write!(f, "FAILED_BREAKDOWN"),
        }
    }
}

/// A qualified long setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    pub variant: DetectorVariant,
    /// The inside bar; entry, stop and targets derive from it
    pub confirmation: Bar,
    /// The bar containing the inside bar
    pub context: Bar,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    NoSignal,
    LongSetup(Setup),
}

impl Signal {
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::LongSetup(_))
    }
}

/// Result of checking the forming bar against a setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCheck {
    /// Neither the high nor the low of the inside bar has been taken out
    Waiting,
    /// Forming bar traded below the inside bar's low
    Invalidated,
    /// Forming bar traded above the inside bar's high without breaking its low
    Breakout,
}

/// Core inside-bar predicate: contained (inclusive) and closing green
pub fn is_bullish_inside_bar(inside: &Bar, context: &Bar) -> bool {
    inside.is_inside(context) && inside.is_bullish()
}

/// Evaluate the forming bar against the confirmation bar.
///
/// Invalidation is checked before breakout, so a bar that takes out both
/// sides counts as invalidated.
pub fn check_trigger(confirmation: &Bar, current: &Bar) -> TriggerCheck {
    if current.low < confirmation.low {
        TriggerCheck::Invalidated
    } else if current.high > confirmation.high {
        TriggerCheck::Breakout
    } else {
        TriggerCheck::Waiting
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PatternDetector {
    variant: DetectorVariant,
}

impl PatternDetector {
    pub fn new(variant: DetectorVariant) -> Self {
        Self { variant }
    }

    pub fn variant(&self) -> DetectorVariant {
        self.variant
    }

    /// Run the configured predicate over the window's closed bars.
    ///
    /// Fails with `InsufficientData` until the window is evaluable; never
    /// reports a setup from a short window.
    pub fn detect(&self, window: &BarWindow) -> TradeResult<Signal> {
        let total = window.closed_len() + usize::from(window.current().is_ok());
        if total < MIN_EVALUABLE_BARS {
            return Err(TradeError::InsufficientData {
                needed: MIN_EVALUABLE_BARS,
                available: total,
            });
        }

        let bars = window.latest(self.variant.closed_bars_needed())?;
        let n = bars.len();
        let inside = &bars[n - 1];
        let context = &bars[n - 2];

        let qualified = match self.variant {
            DetectorVariant::InsideBar => is_bullish_inside_bar(inside, context),
            DetectorVariant::StrictInsideBar => {
                is_bullish_inside_bar(inside, context) && context.is_bullish()
            }
            DetectorVariant::FailedBreakdown => {
                let flush = &bars[n - 3];
                flush.is_bearish()
                    && context.low < flush.low
                    && is_bullish_inside_bar(inside, context)
            }
        };

        if !qualified {
            return Ok(Signal::NoSignal);
        }

        Ok(Signal::LongSetup(Setup {
            variant: self.variant,
            confirmation: inside.clone(),
            context: context.clone(),
        }))
    }
}
