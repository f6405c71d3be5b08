//! Broker gateway boundary
//!
//! The trading core talks to a broker only through [`BrokerGateway`]. Order
//! types here are wire-neutral; each adapter maps them onto its own protocol.
//!
//! - [`paper`]: in-memory simulated broker (default, used by tests)
//! - `ib`: Interactive Brokers TWS / IB Gateway (`ibkr` feature)

pub mod paper;

#[cfg(feature = "ibkr")]
pub mod ib;

use serde::{Deserialize, Serialize};

use crate::bars::{Bar, BarRequest};
use crate::error::TradeResult;

pub use paper::PaperGateway;

#[cfg(feature = "ibkr")]
pub use ib::IbGateway;

/// Broker-assigned order id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub i32);

impl OrderId {
    /// The id `n` places after this one
    pub fn offset(&self, n: usize) -> Self {
        Self(self.0 + n as i32)
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type with its prices
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit { limit: f64 },
    Stop { stop: f64 },
    StopLimit { stop: f64, limit: f64 },
}

impl OrderKind {
    pub fn limit_price(&self) -> Option<f64> {
        match self {
            Self::Limit { limit } | Self::StopLimit { limit, .. } => Some(*limit),
            _ => None,
        }
    }

    pub fn stop_price(&self) -> Option<f64> {
        match self {
            Self::Stop { stop } | Self::StopLimit { stop, .. } => Some(*stop),
            _ => None,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stop { .. })
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MKT"),
            Self::Limit { limit } => write!(f, "LMT {}", limit),
            Self::Stop { stop } => write!(f, "STP {}", stop),
            Self::StopLimit { stop, limit } => write!(f, "STP LMT {}/{}", stop, limit),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    #[default]
    Day,
    Gtc,
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Day => write!(f, "DAY"),
            Self::Gtc => write!(f, "GTC"),
        }
    }
}

/// One order message as the gateway receives it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub order_id: OrderId,
    /// Set on bracket children; links them to the entry
    pub parent_id: Option<OrderId>,
    pub action: OrderAction,
    pub kind: OrderKind,
    pub quantity: u32,
    pub tif: TimeInForce,
    pub outside_rth: bool,
    /// False holds the order at the gateway until a later message in the
    /// same bracket is sent with `transmit = true`
    pub transmit: bool,
}

impl OrderSpec {
    /// Standalone market order, transmitted immediately
    pub fn market(order_id: OrderId, action: OrderAction, quantity: u32) -> Self {
        Self {
            order_id,
            parent_id: None,
            action,
            kind: OrderKind::Market,
            quantity,
            tif: TimeInForce::Day,
            outside_rth: false,
            transmit: true,
        }
    }
}

/// A working order reported by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub symbol: String,
    pub spec: OrderSpec,
    /// Shares already executed
    pub filled: u32,
}

impl OpenOrder {
    pub fn remaining(&self) -> u32 {
        self.spec.quantity.saturating_sub(self.filled)
    }
}

/// Net position in one instrument; negative quantity is short
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: f64,
    pub avg_cost: f64,
}

/// One execution with its commission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: u32,
    pub price: f64,
    pub commission: f64,
}

/// Market scanner filter. Thresholds are operator-tunable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanCriteria {
    pub scan_code: String,
    pub instrument: String,
    pub location_code: String,
    pub price_above: Option<f64>,
    pub price_below: Option<f64>,
    pub change_percent_above: Option<f64>,
    pub volume_above: Option<u64>,
    pub price_range_above: Option<f64>,
    pub max_rows: u32,
}

impl Default for ScanCriteria {
    fn default() -> Self {
        Self {
            scan_code: "TOP_OPEN_PERC_GAIN".to_string(),
            instrument: "STK".to_string(),
            location_code: "STK.US.MAJOR".to_string(),
            price_above: None,
            price_below: None,
            change_percent_above: None,
            volume_above: None,
            price_range_above: None,
            max_rows: 50,
        }
    }
}

impl ScanCriteria {
    /// Scanner filter tags as name/value pairs
    pub fn filter_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = Vec::new();
        if let Some(v) = self.change_percent_above {
            tags.push(("changePercAbove", v.to_string()));
        }
        if let Some(v) = self.price_below {
            tags.push(("priceBelow", v.to_string()));
        }
        if let Some(v) = self.price_above {
            tags.push(("priceAbove", v.to_string()));
        }
        if let Some(v) = self.volume_above {
            tags.push(("volumeAbove", v.to_string()));
        }
        if let Some(v) = self.price_range_above {
            tags.push(("priceRangeAbove", v.to_string()));
        }
        tags
    }
}

/// Order-management and market-data surface of a broker.
///
/// Read methods take `&self` and may run concurrently. Methods that change
/// broker state take `&mut self`, so all of them funnel through whoever owns
/// the gateway.
#[allow(async_fn_in_trait)]
pub trait BrokerGateway {
    /// Candidate symbols for one scanner specification
    async fn scan(&self, criteria: &ScanCriteria) -> TradeResult<Vec<String>>;

    /// Recent bars, oldest first. The last bar may still be forming.
    async fn get_bars(&self, symbol: &str, request: &BarRequest) -> TradeResult<Vec<Bar>>;

    /// Reserve `count` consecutive order ids and return the first
    async fn reserve_order_ids(&mut self, count: usize) -> TradeResult<OrderId>;

    /// Send one order message. Re-sending an existing id modifies that order.
    async fn place_order(&mut self, symbol: &str, spec: &OrderSpec) -> TradeResult<()>;

    async fn cancel_order(&mut self, order_id: OrderId) -> TradeResult<()>;

    async fn open_orders(&self) -> TradeResult<Vec<OpenOrder>>;

    async fn positions(&self) -> TradeResult<Vec<Position>>;

    /// Executions for the current session
    async fn fills(&self) -> TradeResult<Vec<Fill>>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&mut self) -> TradeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_kind_prices() {
        let kind = OrderKind::StopLimit { stop: 9.81, limit: 9.85 };
        assert_eq!(kind.stop_price(), Some(9.81));
        assert_eq!(kind.limit_price(), Some(9.85));
        assert!(!kind.is_stop());
        assert_eq!(OrderKind::Market.limit_price(), None);
    }

    #[test]
    fn test_scan_tags_skip_unset() {
        let criteria = ScanCriteria {
            price_above: Some(15.0),
            price_below: Some(40.0),
            volume_above: Some(750_000),
            ..Default::default()
        };
        let tags = criteria.filter_tags();
        assert_eq!(tags.len(), 3);
        assert!(tags.contains(&("volumeAbove", "750000".to_string())));
    }

    #[test]
    fn test_open_order_remaining() {
        let order = OpenOrder {
            symbol: "AAPL".into(),
            spec: OrderSpec::market(OrderId(7), OrderAction::Sell, 100),
            filled: 40,
        };
        assert_eq!(order.remaining(), 60);
        assert_eq!(OrderId(7).offset(3), OrderId(10));
    }
}
