//! Wall-clock access, session hours and the hourly rollover gate

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// Source of "now" plus the pause between polls.
///
/// Production uses [`SystemClock`]; tests drive a [`ManualClock`] whose sleep
/// advances simulated time instead of waiting.
#[allow(async_fn_in_trait)]
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(d) = duration.to_std() {
            tokio::time::sleep(d).await;
        }
    }
}

/// Settable clock; clones share the same time
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = t;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Wall-clock time of day in the session timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

impl TimeOfDay {
    pub const fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }

    fn minutes(&self) -> u32 {
        self.hour * 60 + self.minute
    }

    pub fn is_valid(&self) -> bool {
        self.hour < 24 && self.minute < 60
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Before session start; no trading
    PreOpen,
    Active,
    /// Flatten everything
    Liquidation,
    /// After session end
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreOpen => write!(f, "PRE-OPEN"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Liquidation => write!(f, "LIQUIDATION"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Session boundaries: `start <= liquidation <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHours {
    /// First time new entries may be considered
    pub start: TimeOfDay,
    /// Liquidation window opens
    pub liquidation: TimeOfDay,
    pub end: TimeOfDay,
}

impl Default for SessionHours {
    /// NYSE day with a 90 minute warm-up and a 5 minute liquidation window
    fn default() -> Self {
        Self {
            start: TimeOfDay::new(11, 0),
            liquidation: TimeOfDay::new(15, 55),
            end: TimeOfDay::new(16, 0),
        }
    }
}

impl SessionHours {
    pub fn phase(&self, hour: u32, minute: u32) -> SessionPhase {
        let current = hour * 60 + minute;
        if current < self.start.minutes() {
            SessionPhase::PreOpen
        } else if current < self.liquidation.minutes() {
            SessionPhase::Active
        } else if current < self.end.minutes() {
            SessionPhase::Liquidation
        } else {
            SessionPhase::Closed
        }
    }

    pub fn is_trading_hours(&self, hour: u32, minute: u32) -> bool {
        self.phase(hour, minute) == SessionPhase::Active
    }

    pub fn is_ordered(&self) -> bool {
        self.start.is_valid()
            && self.liquidation.is_valid()
            && self.end.is_valid()
            && self.start <= self.liquidation
            && self.liquidation <= self.end
    }
}

/// Hour tracker for the once-per-hour maintenance block.
///
/// The last-rollover hour only ever moves forward and is claimed before the
/// rollover work runs, so the block cannot execute twice for one hour.
#[derive(Debug, Clone)]
pub struct SessionClock {
    tz: Tz,
    hours: SessionHours,
    last_rollover: Option<NaiveDateTime>,
}

impl SessionClock {
    pub fn new(tz: Tz, hours: SessionHours) -> Self {
        Self { tz, hours, last_rollover: None }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Local hour bucket containing `now`
    pub fn hour_bucket(&self, now: DateTime<Utc>) -> NaiveDateTime {
        let local = now.with_timezone(&self.tz).naive_local();
        let hour = NaiveTime::from_hms_opt(local.hour(), 0, 0).unwrap_or(NaiveTime::MIN);
        local.date().and_time(hour)
    }

    pub fn phase(&self, now: DateTime<Utc>) -> SessionPhase {
        let local = now.with_timezone(&self.tz);
        self.hours.phase(local.hour(), local.minute())
    }

    /// Claim the rollover for the hour containing `now`.
    ///
    /// Returns the claimed bucket when this hour has not been processed yet;
    /// `None` otherwise.
    pub fn begin_rollover(&mut self, now: DateTime<Utc>) -> Option<NaiveDateTime> {
        let bucket = self.hour_bucket(now);
        if self.last_rollover.is_some_and(|last| bucket <= last) {
            return None;
        }
        self.last_rollover = Some(bucket);
        Some(bucket)
    }

    pub fn last_rollover(&self) -> Option<NaiveDateTime> {
        self.last_rollover
    }
}
