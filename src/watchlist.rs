//! Per-session watchlist state machine
//!
//! ```text
//! Candidate --breakout + plan submitted--> Breakout --fill--> Filled
//!     |                                        |
//!     +--low broken / order rejected--> Invalidated
//!                                              +--unfilled at rollover--> Expired
//! ```
//!
//! At most one live (Candidate or Breakout) entry per instrument. Terminal
//! entries stay for the session so their orders can be reported, but a later
//! detection may supersede them.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::bars::Bar;
use crate::gateway::OrderId;
use crate::pattern::{check_trigger, Setup, TriggerCheck};
use crate::planner::BracketPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// Forming bar traded below the confirmation low
    LowBroken,
    /// Gateway refused the bracket
    OrderRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Candidate,
    Breakout,
    Invalidated(InvalidationReason),
    Filled,
    Expired,
}

impl EntryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalidated(_) | Self::Filled | Self::Expired)
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Candidate => write!(f, "CANDIDATE"),
            Self::Breakout => write!(f, "BREAKOUT"),
            Self::Invalidated(InvalidationReason::LowBroken) => write!(f, "INVALIDATED(low broken)"),
            Self::Invalidated(InvalidationReason::OrderRejected) => write!(f, "INVALIDATED(rejected)"),
            Self::Filled => write!(f, "FILLED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchEntry {
    pub symbol: String,
    pub state: EntryState,
    pub setup: Setup,
    /// Submitted bracket, once past Candidate
    pub plan: Option<BracketPlan>,
    /// Bracket order ids, entry first and stop last
    pub order_ids: Vec<OrderId>,
    pub detected_at: DateTime<Utc>,
}

impl WatchEntry {
    pub fn entry_order_id(&self) -> Option<OrderId> {
        self.order_ids.first().copied()
    }

    pub fn stop_order_id(&self) -> Option<OrderId> {
        self.order_ids.last().copied()
    }
}

/// Outcome of evaluating one entry against the forming bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Nothing to do this poll
    Unchanged,
    /// Entry moved to Invalidated
    Invalidated,
    /// Breakout confirmed; caller should plan and submit
    Triggered,
}

/// Entry counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchlistCounts {
    pub candidate: usize,
    pub breakout: usize,
    pub invalidated: usize,
    pub filled: usize,
    pub expired: usize,
}

#[derive(Debug, Default)]
pub struct Watchlist {
    entries: BTreeMap<String, WatchEntry>,
}

impl Watchlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly detected setup. A waiting Candidate is replaced by the
    /// newer detection; refused while the instrument has a bracket out.
    pub fn insert_candidate(&mut self, symbol: &str, setup: Setup, now: DateTime<Utc>) -> bool {
        if self.entries.get(symbol).is_some_and(|e| e.state == EntryState::Breakout) {
            return false;
        }

        debug!("{} -> CANDIDATE (confirmation high {:.4}, low {:.4})", symbol, setup.confirmation.high, setup.confirmation.low);
        self.entries.insert(
            symbol.to_string(),
            WatchEntry {
                symbol: symbol.to_string(),
                state: EntryState::Candidate,
                setup,
                plan: None,
                order_ids: Vec::new(),
                detected_at: now,
            },
        );
        true
    }

    /// Check a Candidate against the forming bar. Invalidation is applied
    /// before the breakout test; other states are left alone.
    pub fn evaluate(&mut self, symbol: &str, current: &Bar) -> Evaluation {
        let Some(entry) = self.entries.get_mut(symbol) else {
            return Evaluation::Unchanged;
        };
        if entry.state != EntryState::Candidate {
            return Evaluation::Unchanged;
        }

        match check_trigger(&entry.setup.confirmation, current) {
            TriggerCheck::Waiting => Evaluation::Unchanged,
            TriggerCheck::Invalidated => {
                debug!(
                    "{} -> INVALIDATED: low {:.4} < confirmation low {:.4}",
                    symbol, current.low, entry.setup.confirmation.low
                );
                entry.state = EntryState::Invalidated(InvalidationReason::LowBroken);
                Evaluation::Invalidated
            }
            TriggerCheck::Breakout => Evaluation::Triggered,
        }
    }

    /// Candidate -> Breakout once the bracket is with the gateway
    pub fn mark_submitted(&mut self, symbol: &str, plan: BracketPlan, order_ids: Vec<OrderId>) -> bool {
        match self.entries.get_mut(symbol) {
            Some(entry) if entry.state == EntryState::Candidate => {
                entry.state = EntryState::Breakout;
                entry.plan = Some(plan);
                entry.order_ids = order_ids;
                true
            }
            _ => false,
        }
    }

    /// Candidate -> Invalidated after the gateway refused the bracket
    pub fn mark_rejected(&mut self, symbol: &str) -> bool {
        self.transition(symbol, EntryState::Candidate, EntryState::Invalidated(InvalidationReason::OrderRejected))
    }

    pub fn mark_filled(&mut self, symbol: &str) -> bool {
        self.transition(symbol, EntryState::Breakout, EntryState::Filled)
    }

    /// Breakout -> Expired once the unfilled entry is cancelled
    pub fn expire(&mut self, symbol: &str) -> bool {
        self.transition(symbol, EntryState::Breakout, EntryState::Expired)
    }

    /// Candidate -> Expired when its confirmation bar is no longer the latest
    /// closed bar
    pub fn retire(&mut self, symbol: &str) -> bool {
        self.transition(symbol, EntryState::Candidate, EntryState::Expired)
    }

    fn transition(&mut self, symbol: &str, from: EntryState, to: EntryState) -> bool {
        match self.entries.get_mut(symbol) {
            Some(entry) if entry.state == from => {
                debug!("{} {} -> {}", symbol, from, to);
                entry.state = to;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&WatchEntry> {
        self.entries.get(symbol)
    }

    pub fn state(&self, symbol: &str) -> Option<EntryState> {
        self.entries.get(symbol).map(|e| e.state)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WatchEntry> {
        self.entries.values()
    }

    /// Symbols currently in `state`
    pub fn symbols_in(&self, state: EntryState) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.state == state)
            .map(|e| e.symbol.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn counts(&self) -> WatchlistCounts {
        let mut counts = WatchlistCounts::default();
        for entry in self.entries.values() {
            match entry.state {
                EntryState::Candidate => counts.candidate += 1,
                EntryState::Breakout => counts.breakout += 1,
                EntryState::Invalidated(_) => counts.invalidated += 1,
                EntryState::Filled => counts.filled += 1,
                EntryState::Expired => counts.expired += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{OrderKind, TimeInForce};
    use crate::pattern::DetectorVariant;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 4, h, 0, 0).unwrap()
    }

    fn setup() -> Setup {
        Setup {
            variant: DetectorVariant::InsideBar,
            confirmation: Bar::new(at(15), 9.3, 9.8, 9.2, 9.6),
            context: Bar::new(at(14), 9.5, 10.0, 9.0, 9.4),
        }
    }

    fn plan() -> BracketPlan {
        BracketPlan::new("ABCD", OrderKind::Limit { limit: 9.85 }, 3, vec![(10.51, 3, 1.0)], 9.19, TimeInForce::Day)
            .unwrap()
    }

    #[test]
    fn test_one_live_entry_per_symbol() {
        let mut list = Watchlist::new();
        assert!(list.insert_candidate("ABCD", setup(), at(16)));

        // A newer detection replaces the waiting Candidate
        let newer = Setup { confirmation: Bar::new(at(16), 9.4, 9.7, 9.3, 9.6), ..setup() };
        assert!(list.insert_candidate("ABCD", newer, at(17)));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get("ABCD").unwrap().setup.confirmation.high, 9.7);

        // With a bracket out the entry is kept
        list.mark_submitted("ABCD", plan(), vec![OrderId(1), OrderId(2), OrderId(3)]);
        assert!(!list.insert_candidate("ABCD", setup(), at(18)));
        assert_eq!(list.get("ABCD").unwrap().setup.confirmation.high, 9.7);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_retire_only_from_candidate() {
        let mut list = Watchlist::new();
        list.insert_candidate("ABCD", setup(), at(16));
        assert!(list.retire("ABCD"));
        assert_eq!(list.state("ABCD"), Some(EntryState::Expired));
        assert!(!list.retire("ABCD"));

        list.insert_candidate("WXYZ", setup(), at(16));
        list.mark_submitted("WXYZ", plan(), vec![OrderId(4), OrderId(5), OrderId(6)]);
        assert!(!list.retire("WXYZ"));
        assert_eq!(list.state("WXYZ"), Some(EntryState::Breakout));
    }

    #[test]
    fn test_invalidation_before_breakout() {
        let mut list = Watchlist::new();
        list.insert_candidate("ABCD", setup(), at(16));

        // Takes out both sides; invalidation wins
        let bar = Bar::new(at(16), 9.6, 9.9, 9.1, 9.3);
        assert_eq!(list.evaluate("ABCD", &bar), Evaluation::Invalidated);
        assert_eq!(list.state("ABCD"), Some(EntryState::Invalidated(InvalidationReason::LowBroken)));

        // Terminal: a second look changes nothing
        assert_eq!(list.evaluate("ABCD", &bar), Evaluation::Unchanged);
    }

    #[test]
    fn test_breakout_flow() {
        let mut list = Watchlist::new();
        list.insert_candidate("ABCD", setup(), at(16));

        let waiting = Bar::new(at(16), 9.6, 9.75, 9.5, 9.7);
        assert_eq!(list.evaluate("ABCD", &waiting), Evaluation::Unchanged);

        let breakout = Bar::new(at(16), 9.6, 9.85, 9.5, 9.82);
        assert_eq!(list.evaluate("ABCD", &breakout), Evaluation::Triggered);
        assert_eq!(list.state("ABCD"), Some(EntryState::Candidate));

        let ids = vec![OrderId(1), OrderId(2), OrderId(3)];
        assert!(list.mark_submitted("ABCD", plan(), ids));
        assert_eq!(list.state("ABCD"), Some(EntryState::Breakout));
        assert_eq!(list.get("ABCD").unwrap().stop_order_id(), Some(OrderId(3)));

        // Breakout entries are not re-triggered
        assert_eq!(list.evaluate("ABCD", &breakout), Evaluation::Unchanged);

        assert!(list.mark_filled("ABCD"));
        assert!(!list.expire("ABCD"));
        assert_eq!(list.counts().filled, 1);
    }

    #[test]
    fn test_expire_and_supersede() {
        let mut list = Watchlist::new();
        list.insert_candidate("ABCD", setup(), at(16));
        list.mark_submitted("ABCD", plan(), vec![OrderId(1), OrderId(2), OrderId(3)]);

        assert!(list.expire("ABCD"));
        assert_eq!(list.state("ABCD"), Some(EntryState::Expired));

        assert!(list.insert_candidate("ABCD", setup(), at(17)));
        assert_eq!(list.state("ABCD"), Some(EntryState::Candidate));
    }

    #[test]
    fn test_rejection_only_from_candidate() {
        let mut list = Watchlist::new();
        list.insert_candidate("ABCD", setup(), at(16));
        assert!(list.mark_rejected("ABCD"));
        assert_eq!(list.state("ABCD"), Some(EntryState::Invalidated(InvalidationReason::OrderRejected)));
        assert!(!list.mark_submitted("ABCD", plan(), vec![]));
        assert!(!list.mark_rejected("ZZZZ"));
    }
}
