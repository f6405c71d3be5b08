//! Trader configuration

use anyhow::{Context, Result};
use chrono::Duration;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::bars::{BarRequest, BarSize, BarWindow};
use crate::clock::{SessionHours, TimeOfDay};
use crate::error::{TradeError, TradeResult};
use crate::gateway::{ScanCriteria, TimeInForce};
use crate::pattern::DetectorVariant;
use crate::planner::{EntryStyle, OrderPlanner};
use crate::sizing::{self, PriceTier, PriceTierTable};

/// Everything the session loop needs. Values are operator-tunable; none of
/// them are invariants of the strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderConfig {
    /// Account equity used for sizing, in dollars
    pub account_size: f64,

    /// Fraction of the account risked per trade (0.005 = 0.5%)
    pub risk_fraction: f64,

    /// IANA timezone the session hours are expressed in
    pub timezone: Tz,

    /// Start, liquidation and end of the trading session
    pub session: SessionHours,

    /// Seconds between polls
    pub poll_interval_secs: u64,

    /// Seconds between market-close attempts while liquidating
    pub liquidation_retry_secs: u64,

    /// Failed liquidation attempts before raising an operator alert
    pub liquidation_alert_attempts: u32,

    /// Concurrent bar requests per poll
    pub max_concurrent_fetches: usize,

    /// Closed bars kept per instrument
    pub window_retention: usize,

    pub bar_request: BarRequest,

    pub detector: DetectorVariant,

    /// Profit targets as multiples of risk per share, one leg each
    pub profit_multipliers: Vec<f64>,

    pub price_tiers: PriceTierTable,

    pub entry_style: EntryStyle,

    pub time_in_force: TimeInForce,

    /// Hourly stop maintenance only ever raises stops when set; otherwise the
    /// recomputed price is applied in either direction
    pub ratchet_stops: bool,

    /// Instruments whose orders survive the hourly cancellation
    pub protected_symbols: Vec<String>,

    /// Scanner specifications; results are concatenated
    pub scanners: Vec<ScanCriteria>,

    /// Fixed candidate list, used instead of the scanners when non-empty
    pub static_symbols: Vec<String>,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            account_size: 37_000.0,
            risk_fraction: 0.005,
            timezone: chrono_tz::America::New_York,
            session: SessionHours::default(),
            poll_interval_secs: 10,
            liquidation_retry_secs: 10,
            liquidation_alert_attempts: 6,
            max_concurrent_fetches: 8,
            window_retention: BarWindow::DEFAULT_RETENTION,
            bar_request: BarRequest::default(),
            detector: DetectorVariant::InsideBar,
            profit_multipliers: vec![1.0, 2.0, 4.0],
            price_tiers: PriceTierTable::default(),
            entry_style: EntryStyle::Limit,
            time_in_force: TimeInForce::Day,
            ratchet_stops: false,
            protected_symbols: Vec::new(),
            scanners: vec![
                ScanCriteria {
                    change_percent_above: Some(2.0),
                    price_above: Some(15.0),
                    price_below: Some(40.0),
                    volume_above: Some(750_000),
                    price_range_above: Some(0.1),
                    ..Default::default()
                },
                ScanCriteria {
                    change_percent_above: Some(1.0),
                    price_above: Some(0.5),
                    price_below: Some(15.0),
                    volume_above: Some(750_000),
                    price_range_above: Some(1.0),
                    ..Default::default()
                },
            ],
            static_symbols: Vec::new(),
        }
    }
}

impl TraderConfig {
    /// Hourly intraday inside-bar strategy
    pub fn hourly() -> Self {
        Self::default()
    }

    /// Daily-bar swing variant: small account, stop-limit GTC entries with a
    /// single 2R target, candidates from a fixed list
    pub fn swing_daily() -> Self {
        let tiers = vec![
            PriceTier {
                below: Some(1.0),
                entry_offset: 0.005,
                stop_offset: 0.005,
                trigger_offset: 0.005,
                decimals: 3,
            },
            PriceTier {
                below: None,
                entry_offset: 0.02,
                stop_offset: 0.01,
                trigger_offset: 0.01,
                decimals: 2,
            },
        ];

        Self {
            account_size: 600.0,
            risk_fraction: 0.01,
            session: SessionHours {
                start: TimeOfDay::new(9, 30),
                liquidation: TimeOfDay::new(16, 0),
                end: TimeOfDay::new(16, 0),
            },
            poll_interval_secs: 60,
            bar_request: BarRequest { lookback_days: 10, bar_size: BarSize::Day },
            profit_multipliers: vec![2.0],
            price_tiers: PriceTierTable::new(tiers).unwrap_or_default(),
            entry_style: EntryStyle::StopLimit,
            time_in_force: TimeInForce::Gtc,
            scanners: Vec::new(),
            ..Default::default()
        }
    }

    /// Load from a TOML file; missing keys take the hourly defaults
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> TradeResult<()> {
        if !(self.account_size > 0.0) {
            return Err(TradeError::InvalidConfig(format!("account_size must be positive, got {}", self.account_size)));
        }
        if !(self.risk_fraction > 0.0 && self.risk_fraction < 1.0) {
            return Err(TradeError::InvalidConfig(format!(
                "risk_fraction must be in (0, 1), got {}",
                self.risk_fraction
            )));
        }
        if !self.session.is_ordered() {
            return Err(TradeError::InvalidConfig(format!(
                "session hours out of order: start {} liquidation {} end {}",
                self.session.start, self.session.liquidation, self.session.end
            )));
        }
        if self.poll_interval_secs == 0 || self.liquidation_retry_secs == 0 {
            return Err(TradeError::InvalidConfig("poll intervals must be at least one second".into()));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(TradeError::InvalidConfig("max_concurrent_fetches must be at least 1".into()));
        }
        if self.profit_multipliers.is_empty() || self.profit_multipliers.len() > 3 {
            return Err(TradeError::InvalidConfig(format!(
                "expected one to three profit multipliers, got {}",
                self.profit_multipliers.len()
            )));
        }
        if self.profit_multipliers.iter().any(|m| !(*m > 0.0)) {
            return Err(TradeError::InvalidConfig("profit multipliers must be positive".into()));
        }
        if self.entry_style == EntryStyle::StopLimit
            && self.price_tiers.tiers().iter().any(|t| t.entry_offset < t.trigger_offset)
        {
            return Err(TradeError::InvalidConfig(
                "stop-limit entries need entry_offset >= trigger_offset in every price tier".into(),
            ));
        }
        if self.scanners.is_empty() && self.static_symbols.is_empty() {
            return Err(TradeError::InvalidConfig("no scanners and no static symbols configured".into()));
        }
        Ok(())
    }

    pub fn risk_budget(&self) -> f64 {
        sizing::risk_budget(self.account_size, self.risk_fraction)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::seconds(self.poll_interval_secs as i64)
    }

    pub fn liquidation_retry(&self) -> Duration {
        Duration::seconds(self.liquidation_retry_secs as i64)
    }

    pub fn is_protected(&self, symbol: &str) -> bool {
        self.protected_symbols.iter().any(|s| s == symbol)
    }

    pub fn planner(&self) -> OrderPlanner {
        OrderPlanner::new(
            self.risk_budget(),
            self.profit_multipliers.clone(),
            self.price_tiers.clone(),
            self.entry_style,
            self.time_in_force,
        )
    }
}
