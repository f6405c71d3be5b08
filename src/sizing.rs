//! Fixed-fractional position sizing and the price-tier offset table

use serde::{Deserialize, Serialize};

use crate::error::{TradeError, TradeResult};

/// Dollars at risk per trade
pub fn risk_budget(account_size: f64, risk_fraction: f64) -> f64 {
    account_size * risk_fraction
}

/// Shares to buy so that a stop-out loses `account_risk_budget`.
///
/// `round(budget / risk_per_share)`, floored at zero. A zero result means no
/// order should be placed.
pub fn size(account_risk_budget: f64, risk_per_share: f64) -> TradeResult<u32> {
    // Also rejects NaN
    if !(risk_per_share > 0.0) {
        return Err(TradeError::InvalidRisk { risk_per_share });
    }

    let shares = (account_risk_budget / risk_per_share).round();
    if !shares.is_finite() || shares <= 0.0 {
        return Ok(0);
    }
    Ok(shares.min(u32::MAX as f64) as u32)
}

/// Offsets and price precision for one price band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    /// Applies to prices strictly below this bound; `None` for the top tier
    #[serde(default)]
    pub below: Option<f64>,
    /// Added to the confirmation high for the entry limit
    pub entry_offset: f64,
    /// Subtracted from the reference low for the protective stop
    pub stop_offset: f64,
    /// Added to the confirmation high for a stop-limit trigger
    #[serde(default)]
    pub trigger_offset: f64,
    /// Decimal places prices are rounded to
    pub decimals: u32,
}

impl PriceTier {
    pub fn round(&self, price: f64) -> f64 {
        let factor = 10f64.powi(self.decimals as i32);
        (price * factor).round() / factor
    }

    fn covers(&self, price: f64) -> bool {
        self.below.map_or(true, |bound| price < bound)
    }
}

/// Price tiers ordered by ascending upper bound, ending in an unbounded tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PriceTier>", into = "Vec<PriceTier>")]
pub struct PriceTierTable {
    tiers: Vec<PriceTier>,
}

impl PriceTierTable {
    pub fn new(tiers: Vec<PriceTier>) -> TradeResult<Self> {
        let Some(last) = tiers.last() else {
            return Err(TradeError::InvalidConfig("price tier table is empty".into()));
        };
        if last.below.is_some() {
            return Err(TradeError::InvalidConfig("last price tier must be unbounded".into()));
        }

        let mut prev_bound = f64::NEG_INFINITY;
        for (i, tier) in tiers.iter().enumerate() {
            if tier.entry_offset < 0.0 || tier.stop_offset < 0.0 || tier.trigger_offset < 0.0 {
                return Err(TradeError::InvalidConfig(format!("price tier {} has a negative offset", i)));
            }
            match tier.below {
                Some(bound) if bound <= prev_bound => {
                    return Err(TradeError::InvalidConfig(format!(
                        "price tier {} bound {} is not ascending",
                        i, bound
                    )));
                }
                Some(bound) => prev_bound = bound,
                None if i + 1 != tiers.len() => {
                    return Err(TradeError::InvalidConfig(format!("price tier {} is unbounded but not last", i)));
                }
                None => {}
            }
        }

        Ok(Self { tiers })
    }

    /// Tier for an instrument trading at `price`
    pub fn tier_for(&self, price: f64) -> &PriceTier {
        self.tiers
            .iter()
            .find(|t| t.covers(price))
            .unwrap_or_else(|| &self.tiers[self.tiers.len() - 1])
    }

    pub fn tiers(&self) -> &[PriceTier] {
        &self.tiers
    }
}

impl Default for PriceTierTable {
    /// Sub-dollar names get half-cent offsets at three decimals
    fn default() -> Self {
        Self {
            tiers: vec![
                PriceTier {
                    below: Some(1.0),
                    entry_offset: 0.005,
                    stop_offset: 0.005,
                    trigger_offset: 0.005,
                    decimals: 3,
                },
                PriceTier {
                    below: None,
                    entry_offset: 0.05,
                    stop_offset: 0.01,
                    trigger_offset: 0.01,
                    decimals: 2,
                },
            ],
        }
    }
}

impl TryFrom<Vec<PriceTier>> for PriceTierTable {
    type Error = TradeError;

    fn try_from(tiers: Vec<PriceTier>) -> Result<Self, Self::Error> {
        Self::new(tiers)
    }
}

impl From<PriceTierTable> for Vec<PriceTier> {
    fn from(table: PriceTierTable) -> Self {
        table.tiers
    }
}
