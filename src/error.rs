//! Error taxonomy for the trading core
//!
//! Every per-instrument failure is one of these variants so the scheduler can
//! decide between "skip this instrument this poll", "retry next poll" and
//! "escalate". Only configuration errors and a dead gateway connection stop
//! the loop.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradeError {
    /// Bar window too short to evaluate yet
    #[error("insufficient data: need {needed} bars, have {available}")]
    InsufficientData { needed: usize, available: usize },

    /// Entry and stop collapsed or inverted
    #[error("invalid risk per share: {risk_per_share:.4}")]
    InvalidRisk { risk_per_share: f64 },

    #[error("broker gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("order rejected for {symbol}: {reason}")]
    OrderRejected { symbol: String, reason: String },

    #[error("liquidation stalled after {attempts} attempts, {open_positions} positions still open")]
    LiquidationStalled { attempts: u32, open_positions: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TradeError {
    /// Recoverable errors never abort the poll; they skip or retry.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidConfig(_))
    }

    /// Not-yet-evaluable, as opposed to something going wrong
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::InsufficientData { .. })
    }
}

pub type TradeResult<T> = std::result::Result<T, TradeError>;
