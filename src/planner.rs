//! Bracket order planning
//!
//! A triggered setup becomes an immutable [`BracketPlan`]: one entry leg, one
//! or more profit legs and a protective stop. Prices come from the
//! confirmation bar plus the price-tier offsets, quantity from the fixed
//! fractional sizer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bars::BarWindow;
use crate::error::{TradeError, TradeResult};
use crate::gateway::{OrderAction, OrderId, OrderKind, OrderSpec, TimeInForce};
use crate::pattern::{Setup, MIN_EVALUABLE_BARS};
use crate::sizing::{self, PriceTierTable};

/// How the entry order is expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStyle {
    /// Limit at confirmation high + entry offset
    #[default]
    Limit,
    /// Stop trigger at confirmation high + trigger offset, limit at high + entry offset
    StopLimit,
}

/// One leg of a bracket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Leg {
    Entry { kind: OrderKind, quantity: u32 },
    ProfitLeg { price: f64, quantity: u32, multiplier: f64 },
    StopLeg { price: f64, quantity: u32 },
}

impl Leg {
    pub fn quantity(&self) -> u32 {
        match self {
            Self::Entry { quantity, .. } | Self::ProfitLeg { quantity, .. } | Self::StopLeg { quantity, .. } => *quantity,
        }
    }
}

/// Validated bracket: entry first, profit legs, stop last.
///
/// Profit leg quantities sum to the entry quantity; the stop covers all of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BracketPlan {
    id: Uuid,
    symbol: String,
    legs: Vec<Leg>,
    tif: TimeInForce,
}

impl BracketPlan {
    pub fn new(
        symbol: &str,
        entry: OrderKind,
        quantity: u32,
        profit_legs: Vec<(f64, u32, f64)>,
        stop_price: f64,
        tif: TimeInForce,
    ) -> TradeResult<Self> {
        let entry_price = entry
            .limit_price()
            .ok_or_else(|| TradeError::InvalidConfig(format!("entry for {} must carry a limit price", symbol)))?;

        if quantity == 0 {
            return Err(TradeError::InvalidConfig(format!("bracket for {} has zero quantity", symbol)));
        }
        if let OrderKind::StopLimit { stop, limit } = entry {
            if limit < stop {
                return Err(TradeError::InvalidConfig(format!(
                    "stop-limit entry for {} has limit {} below trigger {}",
                    symbol, limit, stop
                )));
            }
        }
        if stop_price >= entry_price {
            return Err(TradeError::InvalidRisk { risk_per_share: entry_price - stop_price });
        }
        if profit_legs.is_empty() {
            return Err(TradeError::InvalidConfig(format!("bracket for {} has no profit legs", symbol)));
        }

        let leg_total: u32 = profit_legs.iter().map(|(_, q, _)| *q).sum();
        if leg_total != quantity {
            return Err(TradeError::InvalidConfig(format!(
                "profit legs for {} sum to {} but entry is {}",
                symbol, leg_total, quantity
            )));
        }

        let mut legs = Vec::with_capacity(profit_legs.len() + 2);
        legs.push(Leg::Entry { kind: entry, quantity });
        for (price, qty, multiplier) in profit_legs {
            if qty == 0 || price <= entry_price {
                return Err(TradeError::InvalidConfig(format!(
                    "profit leg {} x{} for {} is not above entry {}",
                    price, qty, symbol, entry_price
                )));
            }
            legs.push(Leg::ProfitLeg { price, quantity: qty, multiplier });
        }
        legs.push(Leg::StopLeg { price: stop_price, quantity });

        Ok(Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            legs,
            tif,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn legs(&self) -> &[Leg] {
        &self.legs
    }

    pub fn tif(&self) -> TimeInForce {
        self.tif
    }

    pub fn entry_kind(&self) -> OrderKind {
        match self.legs[0] {
            Leg::Entry { kind, .. } => kind,
            _ => unreachable!("bracket always starts with its entry leg"),
        }
    }

    pub fn entry_price(&self) -> f64 {
        self.entry_kind().limit_price().unwrap_or_default()
    }

    pub fn quantity(&self) -> u32 {
        self.legs[0].quantity()
    }

    pub fn stop_price(&self) -> f64 {
        match self.legs[self.legs.len() - 1] {
            Leg::StopLeg { price, .. } => price,
            _ => unreachable!("bracket always ends with its stop leg"),
        }
    }

    pub fn profit_legs(&self) -> impl Iterator<Item = (f64, u32)> + '_ {
        self.legs.iter().filter_map(|leg| match leg {
            Leg::ProfitLeg { price, quantity, .. } => Some((*price, *quantity)),
            _ => None,
        })
    }

    pub fn risk_per_share(&self) -> f64 {
        self.entry_price() - self.stop_price()
    }

    /// Capital committed if the entry fills
    pub fn notional(&self) -> f64 {
        self.entry_price() * self.quantity() as f64
    }

    /// Messages needed to transmit the bracket
    pub fn message_count(&self) -> usize {
        self.legs.len()
    }

    /// Gateway messages for this bracket, using consecutive ids from `first_id`.
    ///
    /// The entry goes first; exits are its children. Only the final message
    /// (the stop) has `transmit` set, so the gateway releases the bracket as a
    /// unit.
    pub fn order_specs(&self, first_id: OrderId) -> Vec<OrderSpec> {
        let last = self.legs.len() - 1;
        let gtc = self.tif == TimeInForce::Gtc;

        self.legs
            .iter()
            .enumerate()
            .map(|(i, leg)| {
                let (action, kind, quantity, outside_rth) = match *leg {
                    Leg::Entry { kind, quantity } => (OrderAction::Buy, kind, quantity, false),
                    Leg::ProfitLeg { price, quantity, .. } => {
                        (OrderAction::Sell, OrderKind::Limit { limit: price }, quantity, gtc)
                    }
                    Leg::StopLeg { price, quantity } => {
                        (OrderAction::Sell, OrderKind::Stop { stop: price }, quantity, false)
                    }
                };
                OrderSpec {
                    order_id: first_id.offset(i),
                    parent_id: if i == 0 { None } else { Some(first_id) },
                    action,
                    kind,
                    quantity,
                    tif: self.tif,
                    outside_rth,
                    transmit: i == last,
                }
            })
            .collect()
    }
}

impl std::fmt::Display for BracketPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} BUY {} @ {} | stop {} | targets [",
            self.symbol,
            self.quantity(),
            self.entry_kind(),
            self.stop_price()
        )?;
        for (i, (price, qty)) in self.profit_legs().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}x{}", qty, price)?;
        }
        write!(f, "] {}", self.tif)
    }
}

/// Split `total` evenly over `legs`, remainder on the last leg
pub fn split_quantity(total: u32, legs: usize) -> Vec<u32> {
    if legs == 0 {
        return Vec::new();
    }
    let n = legs as u32;
    let base = total / n;
    let mut split = vec![base; legs];
    split[legs - 1] += total % n;
    split
}

/// Builds bracket plans from triggered setups
#[derive(Debug, Clone)]
pub struct OrderPlanner {
    risk_budget: f64,
    profit_multipliers: Vec<f64>,
    tiers: PriceTierTable,
    entry_style: EntryStyle,
    tif: TimeInForce,
}

impl OrderPlanner {
    pub fn new(
        risk_budget: f64,
        profit_multipliers: Vec<f64>,
        tiers: PriceTierTable,
        entry_style: EntryStyle,
        tif: TimeInForce,
    ) -> Self {
        Self { risk_budget, profit_multipliers, tiers, entry_style, tif }
    }

    pub fn tiers(&self) -> &PriceTierTable {
        &self.tiers
    }

    /// Plan a bracket for a triggered setup.
    ///
    /// `Ok(None)` when the sized quantity rounds to zero. Fails with
    /// `InsufficientData` on a short window and `InvalidRisk` when entry and
    /// stop collapse.
    pub fn plan(&self, setup: &Setup, window: &BarWindow) -> TradeResult<Option<BracketPlan>> {
        let total = window.closed_len() + usize::from(window.current().is_ok());
        if total < MIN_EVALUABLE_BARS {
            return Err(TradeError::InsufficientData { needed: MIN_EVALUABLE_BARS, available: total });
        }

        let confirmation = &setup.confirmation;
        let reference = window.last_price().unwrap_or(confirmation.close);
        let tier = self.tiers.tier_for(reference);

        let limit = tier.round(confirmation.high + tier.entry_offset);
        let stop = tier.round(confirmation.low - tier.stop_offset);
        let risk_per_share = tier.round(limit - stop);
        if risk_per_share <= 0.0 {
            return Err(TradeError::InvalidRisk { risk_per_share });
        }

        let quantity = sizing::size(self.risk_budget, risk_per_share)?;
        if quantity == 0 {
            return Ok(None);
        }

        let entry = match self.entry_style {
            EntryStyle::Limit => OrderKind::Limit { limit },
            EntryStyle::StopLimit => OrderKind::StopLimit {
                stop: tier.round(confirmation.high + tier.trigger_offset),
                limit,
            },
        };

        let profit_legs = split_quantity(quantity, self.profit_multipliers.len())
            .into_iter()
            .zip(&self.profit_multipliers)
            .filter(|(qty, _)| *qty > 0)
            .map(|(qty, &m)| (tier.round(limit + risk_per_share * m), qty, m))
            .collect();

        BracketPlan::new(window.symbol(), entry, quantity, profit_legs, stop, self.tif).map(Some)
    }
}
