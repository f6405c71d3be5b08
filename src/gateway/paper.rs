//! In-memory simulated broker
//!
//! Holds scripted bars, positions and working orders. Orders fill when a
//! price is marked through them (or immediately, for market orders), with
//! IB-style bracket behavior:
//! - messages with `transmit = false` wait for a later transmitting message
//!   from the same bracket
//! - children only work once their parent has filled
//! - a profit fill shrinks the stop; a stop fill cancels the other exits
//! - cancelling an unfilled parent cancels its children
//!
//! Clones share one book, so a test can keep a handle while the scheduler
//! owns the gateway.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    BrokerGateway, Fill, OpenOrder, OrderAction, OrderId, OrderKind, OrderSpec, Position, ScanCriteria,
};
use crate::bars::{Bar, BarRequest};
use crate::error::{TradeError, TradeResult};

/// Flat commission charged per execution
pub const DEFAULT_COMMISSION: f64 = 1.0;

#[derive(Debug, Clone)]
struct PaperOrder {
    symbol: String,
    spec: OrderSpec,
    filled: u32,
    transmitted: bool,
}

impl PaperOrder {
    fn remaining(&self) -> u32 {
        self.spec.quantity.saturating_sub(self.filled)
    }
}

#[derive(Debug)]
struct PaperBook {
    next_id: i32,
    /// Scan universe in insertion order
    universe: Vec<String>,
    bars: HashMap<String, Vec<Bar>>,
    /// Working orders; removed once filled or cancelled
    orders: BTreeMap<OrderId, PaperOrder>,
    /// Parents that have fully filled
    filled_parents: HashSet<OrderId>,
    positions: BTreeMap<String, Position>,
    fills: Vec<Fill>,
    commission: f64,
    stalled_closes: u32,
    transient_failures: u32,
    failed_fill_reads: u32,
    rejected_symbols: HashSet<String>,
    sent: Vec<(String, OrderSpec)>,
    cancelled: Vec<OrderId>,
}

impl Default for PaperBook {
    fn default() -> Self {
        Self {
            next_id: 1,
            universe: Vec::new(),
            bars: HashMap::new(),
            orders: BTreeMap::new(),
            filled_parents: HashSet::new(),
            positions: BTreeMap::new(),
            fills: Vec::new(),
            commission: DEFAULT_COMMISSION,
            stalled_closes: 0,
            transient_failures: 0,
            failed_fill_reads: 0,
            rejected_symbols: HashSet::new(),
            sent: Vec::new(),
            cancelled: Vec::new(),
        }
    }
}

impl PaperBook {
    fn mark_price(&self, symbol: &str) -> f64 {
        self.bars
            .get(symbol)
            .and_then(|b| b.last())
            .map(|b| b.close)
            .or_else(|| self.positions.get(symbol).map(|p| p.avg_cost))
            .unwrap_or(0.0)
    }

    fn is_working(&self, order: &PaperOrder) -> bool {
        order.transmitted && order.spec.parent_id.map_or(true, |p| self.filled_parents.contains(&p))
    }

    fn crosses(kind: &OrderKind, action: OrderAction, price: f64) -> bool {
        match (kind, action) {
            (OrderKind::Market, _) => true,
            (OrderKind::Limit { limit }, OrderAction::Buy) => price <= *limit,
            (OrderKind::Limit { limit }, OrderAction::Sell) => price >= *limit,
            (OrderKind::Stop { stop }, OrderAction::Buy) => price >= *stop,
            (OrderKind::Stop { stop }, OrderAction::Sell) => price <= *stop,
            (OrderKind::StopLimit { stop, limit }, OrderAction::Buy) => price >= *stop && price <= *limit,
            (OrderKind::StopLimit { stop, limit }, OrderAction::Sell) => price <= *stop && price >= *limit,
        }
    }

    fn apply_position(&mut self, symbol: &str, action: OrderAction, quantity: u32, price: f64) {
        let signed = match action {
            OrderAction::Buy => quantity as f64,
            OrderAction::Sell => -(quantity as f64),
        };
        let pos = self.positions.entry(symbol.to_string()).or_insert_with(|| Position {
            symbol: symbol.to_string(),
            quantity: 0.0,
            avg_cost: 0.0,
        });

        let new_qty = pos.quantity + signed;
        if pos.quantity == 0.0 || pos.quantity.signum() == signed.signum() {
            pos.avg_cost = (pos.avg_cost * pos.quantity.abs() + price * quantity as f64) / new_qty.abs();
        } else if new_qty != 0.0 && new_qty.signum() != pos.quantity.signum() {
            // Flipped through zero
            pos.avg_cost = price;
        }
        pos.quantity = new_qty;

        if pos.quantity == 0.0 {
            self.positions.remove(symbol);
        }
    }

    /// Execute the remainder of `id` at `price`
    fn execute(&mut self, id: OrderId, price: f64) -> Option<Fill> {
        let order = self.orders.remove(&id)?;
        let quantity = order.remaining();
        let fill = Fill {
            order_id: id,
            symbol: order.symbol.clone(),
            action: order.spec.action,
            quantity,
            price,
            commission: self.commission,
        };

        self.apply_position(&order.symbol, order.spec.action, quantity, price);
        self.fills.push(fill.clone());
        debug!("PAPER: filled {} {} {} {} @ {}", id, order.spec.action, quantity, order.symbol, price);

        match order.spec.parent_id {
            None => {
                self.filled_parents.insert(id);
            }
            Some(parent) => {
                let siblings: Vec<OrderId> = self
                    .orders
                    .iter()
                    .filter(|(_, o)| o.spec.parent_id == Some(parent))
                    .map(|(sid, _)| *sid)
                    .collect();

                if order.spec.kind.is_stop() {
                    for sid in siblings {
                        self.orders.remove(&sid);
                    }
                } else {
                    // Profit leg: shrink the protective stop by what just exited
                    for sid in siblings {
                        let Some(sibling) = self.orders.get_mut(&sid) else { continue };
                        if !sibling.spec.kind.is_stop() {
                            continue;
                        }
                        sibling.spec.quantity = sibling.spec.quantity.saturating_sub(quantity);
                        if sibling.remaining() == 0 {
                            self.orders.remove(&sid);
                        }
                    }
                }
            }
        }

        Some(fill)
    }
}

/// Simulated broker gateway
#[derive(Debug, Clone)]
pub struct PaperGateway {
    book: Arc<Mutex<PaperBook>>,
    connected: Arc<AtomicBool>,
}

impl Default for PaperGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Market data for a paper session, as loaded from JSON
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PaperFixture {
    /// Symbol -> bars, oldest first
    pub bars: BTreeMap<String, Vec<Bar>>,
    pub positions: Vec<Position>,
}

impl PaperGateway {
    pub fn new() -> Self {
        Self {
            book: Arc::new(Mutex::new(PaperBook::default())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Build from a JSON fixture: `{"bars": {"AAPL": [...]}, "positions": [...]}`
    pub async fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read paper fixture {}", path.display()))?;
        let fixture: PaperFixture = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse paper fixture {}", path.display()))?;

        let gateway = Self::new();
        for (symbol, bars) in fixture.bars {
            gateway.set_bars(&symbol, bars).await;
        }
        for position in fixture.positions {
            gateway.set_position(&position.symbol, position.quantity, position.avg_cost).await;
        }
        info!("Paper gateway loaded {}", path.display());
        Ok(gateway)
    }

    /// Replace the bar history for `symbol` and add it to the scan universe
    pub async fn set_bars(&self, symbol: &str, bars: Vec<Bar>) {
        let mut book = self.book.lock().await;
        if !book.universe.iter().any(|s| s == symbol) {
            book.universe.push(symbol.to_string());
        }
        book.bars.insert(symbol.to_string(), bars);
    }

    pub async fn set_position(&self, symbol: &str, quantity: f64, avg_cost: f64) {
        let mut book = self.book.lock().await;
        if quantity == 0.0 {
            book.positions.remove(symbol);
        } else {
            book.positions.insert(symbol.to_string(), Position { symbol: symbol.to_string(), quantity, avg_cost });
        }
    }

    pub async fn set_commission(&self, commission: f64) {
        self.book.lock().await.commission = commission;
    }

    /// The next `n` market orders that would reduce a position are accepted
    /// but never execute
    pub async fn stall_closing_orders(&self, n: u32) {
        self.book.lock().await.stalled_closes = n;
    }

    /// The next `n` order-changing calls fail as if the gateway were unreachable
    pub async fn fail_next_calls(&self, n: u32) {
        self.book.lock().await.transient_failures = n;
    }

    /// The next `n` reads of the execution list fail
    pub async fn fail_next_fill_reads(&self, n: u32) {
        self.book.lock().await.failed_fill_reads = n;
    }

    /// Drop the bar history for `symbol`; later bar requests for it fail
    pub async fn clear_bars(&self, symbol: &str) {
        self.book.lock().await.bars.remove(symbol);
    }

    /// Every order for `symbol` is refused
    pub async fn reject_symbol(&self, symbol: &str) {
        self.book.lock().await.rejected_symbols.insert(symbol.to_string());
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fill whatever working orders `price` trades through
    pub async fn mark(&self, symbol: &str, price: f64) -> Vec<Fill> {
        let mut book = self.book.lock().await;
        let mut fills = Vec::new();
        loop {
            let next = book
                .orders
                .iter()
                .find(|(_, o)| o.symbol == symbol && book.is_working(o) && PaperBook::crosses(&o.spec.kind, o.spec.action, price))
                .map(|(id, _)| *id);
            let Some(id) = next else { break };
            if let Some(fill) = book.execute(id, price) {
                fills.push(fill);
            }
        }
        fills
    }

    /// Fill one order outright, regardless of price
    pub async fn fill_order(&self, id: OrderId, price: f64) -> Option<Fill> {
        self.book.lock().await.execute(id, price)
    }

    /// Every message sent, in order
    pub async fn sent_orders(&self) -> Vec<(String, OrderSpec)> {
        self.book.lock().await.sent.clone()
    }

    pub async fn cancelled_orders(&self) -> Vec<OrderId> {
        self.book.lock().await.cancelled.clone()
    }

    fn check_transient(book: &mut PaperBook, what: &str) -> TradeResult<()> {
        if book.transient_failures > 0 {
            book.transient_failures -= 1;
            return Err(TradeError::GatewayUnavailable(format!("paper: simulated timeout on {}", what)));
        }
        Ok(())
    }
}

impl BrokerGateway for PaperGateway {
    /// Universe symbols whose last close sits inside the criteria's price band
    async fn scan(&self, criteria: &ScanCriteria) -> TradeResult<Vec<String>> {
        let book = self.book.lock().await;
        let symbols = book
            .universe
            .iter()
            .filter(|s| {
                let price = book.mark_price(s);
                criteria.price_above.map_or(true, |p| price > p) && criteria.price_below.map_or(true, |p| price < p)
            })
            .take(criteria.max_rows as usize)
            .cloned()
            .collect();
        Ok(symbols)
    }

    async fn get_bars(&self, symbol: &str, _request: &BarRequest) -> TradeResult<Vec<Bar>> {
        let book = self.book.lock().await;
        book.bars
            .get(symbol)
            .cloned()
            .ok_or_else(|| TradeError::GatewayUnavailable(format!("paper: no bars for {}", symbol)))
    }

    async fn reserve_order_ids(&mut self, count: usize) -> TradeResult<OrderId> {
        let mut book = self.book.lock().await;
        let first = OrderId(book.next_id);
        book.next_id += count as i32;
        Ok(first)
    }

    async fn place_order(&mut self, symbol: &str, spec: &OrderSpec) -> TradeResult<()> {
        let mut book = self.book.lock().await;
        Self::check_transient(&mut book, "place_order")?;

        if book.rejected_symbols.contains(symbol) {
            return Err(TradeError::OrderRejected {
                symbol: symbol.to_string(),
                reason: "paper: symbol not tradable".to_string(),
            });
        }
        book.sent.push((symbol.to_string(), spec.clone()));

        // Re-sending a working id modifies it in place
        if let Some(existing) = book.orders.get_mut(&spec.order_id) {
            existing.spec = spec.clone();
            existing.transmitted |= spec.transmit;
            debug!("PAPER: modified {} {}", spec.order_id, spec.kind);
            return Ok(());
        }

        if spec.kind == OrderKind::Market {
            let reduces = book.positions.get(symbol).is_some_and(|p| match spec.action {
                OrderAction::Sell => p.quantity > 0.0,
                OrderAction::Buy => p.quantity < 0.0,
            });
            if reduces && book.stalled_closes > 0 {
                book.stalled_closes -= 1;
                book.orders.insert(
                    spec.order_id,
                    PaperOrder { symbol: symbol.to_string(), spec: spec.clone(), filled: 0, transmitted: false },
                );
                debug!("PAPER: stalled {} {} {}", spec.order_id, spec.action, symbol);
                return Ok(());
            }

            let price = book.mark_price(symbol);
            book.orders.insert(
                spec.order_id,
                PaperOrder { symbol: symbol.to_string(), spec: spec.clone(), filled: 0, transmitted: true },
            );
            book.execute(spec.order_id, price);
            return Ok(());
        }

        book.orders.insert(
            spec.order_id,
            PaperOrder { symbol: symbol.to_string(), spec: spec.clone(), filled: 0, transmitted: spec.transmit },
        );

        if spec.transmit {
            let root = spec.parent_id.unwrap_or(spec.order_id);
            for order in book.orders.values_mut() {
                if order.spec.order_id == root || order.spec.parent_id == Some(root) {
                    order.transmitted = true;
                }
            }
        }
        Ok(())
    }

    async fn cancel_order(&mut self, order_id: OrderId) -> TradeResult<()> {
        let mut book = self.book.lock().await;
        Self::check_transient(&mut book, "cancel_order")?;

        if book.orders.remove(&order_id).is_none() {
            debug!("PAPER: cancel of unknown order {}", order_id);
            return Ok(());
        }
        book.cancelled.push(order_id);

        // Children of an unfilled parent go with it
        if !book.filled_parents.contains(&order_id) {
            let children: Vec<OrderId> = book
                .orders
                .iter()
                .filter(|(_, o)| o.spec.parent_id == Some(order_id))
                .map(|(id, _)| *id)
                .collect();
            for child in children {
                book.orders.remove(&child);
                book.cancelled.push(child);
            }
        }
        Ok(())
    }

    async fn open_orders(&self) -> TradeResult<Vec<OpenOrder>> {
        let book = self.book.lock().await;
        Ok(book
            .orders
            .values()
            .map(|o| OpenOrder { symbol: o.symbol.clone(), spec: o.spec.clone(), filled: o.filled })
            .collect())
    }

    async fn positions(&self) -> TradeResult<Vec<Position>> {
        Ok(self.book.lock().await.positions.values().cloned().collect())
    }

    async fn fills(&self) -> TradeResult<Vec<Fill>> {
        let mut book = self.book.lock().await;
        if book.failed_fill_reads > 0 {
            book.failed_fill_reads -= 1;
            return Err(TradeError::GatewayUnavailable("paper: simulated timeout on fills".into()));
        }
        Ok(book.fills.clone())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) -> TradeResult<()> {
        self.set_connected(false);
        info!("Paper gateway disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::TimeInForce;

    fn bracket(first: i32) -> Vec<OrderSpec> {
        let parent = OrderId(first);
        let mk = |offset: i32, action, kind, quantity, transmit| OrderSpec {
            order_id: OrderId(first + offset),
            parent_id: if offset == 0 { None } else { Some(parent) },
            action,
            kind,
            quantity,
            tif: TimeInForce::Day,
            outside_rth: false,
            transmit,
        };
        vec![
            mk(0, OrderAction::Buy, OrderKind::Limit { limit: 9.85 }, 10, false),
            mk(1, OrderAction::Sell, OrderKind::Limit { limit: 10.51 }, 5, false),
            mk(2, OrderAction::Sell, OrderKind::Limit { limit: 11.17 }, 5, false),
            mk(3, OrderAction::Sell, OrderKind::Stop { stop: 9.19 }, 10, true),
        ]
    }

    async fn place_all(gw: &mut PaperGateway, specs: &[OrderSpec]) {
        for spec in specs {
            gw.place_order("ABCD", spec).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_untransmitted_bracket_does_not_fill() {
        let mut gw = PaperGateway::new();
        let specs = bracket(1);
        gw.place_order("ABCD", &specs[0]).await.unwrap();

        assert!(gw.mark("ABCD", 9.80).await.is_empty());
        place_all(&mut gw, &specs[1..]).await;
        assert_eq!(gw.mark("ABCD", 9.80).await.len(), 1);
        assert_eq!(gw.positions().await.unwrap()[0].quantity, 10.0);
    }

    #[tokio::test]
    async fn test_profit_leg_shrinks_stop() {
        let mut gw = PaperGateway::new();
        place_all(&mut gw, &bracket(1)).await;
        gw.mark("ABCD", 9.80).await;

        let fills = gw.mark("ABCD", 10.60).await;
        assert_eq!(fills.len(), 1);

        let orders = gw.open_orders().await.unwrap();
        let stop = orders.iter().find(|o| o.spec.kind.is_stop()).unwrap();
        assert_eq!(stop.spec.quantity, 5);

        // Stop-out takes the rest and cancels the remaining target
        gw.mark("ABCD", 9.10).await;
        assert!(gw.open_orders().await.unwrap().is_empty());
        assert!(gw.positions().await.unwrap().is_empty());
        assert_eq!(gw.fills().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_parent_cascades() {
        let mut gw = PaperGateway::new();
        place_all(&mut gw, &bracket(1)).await;
        gw.cancel_order(OrderId(1)).await.unwrap();
        assert!(gw.open_orders().await.unwrap().is_empty());
        assert_eq!(gw.cancelled_orders().await.len(), 4);
    }

    #[tokio::test]
    async fn test_market_close_and_stall() {
        let mut gw = PaperGateway::new();
        gw.set_position("ABCD", 100.0, 9.5).await;
        gw.stall_closing_orders(1).await;

        let id = gw.reserve_order_ids(1).await.unwrap();
        gw.place_order("ABCD", &OrderSpec::market(id, OrderAction::Sell, 100)).await.unwrap();
        assert_eq!(gw.positions().await.unwrap().len(), 1);
        assert_eq!(gw.open_orders().await.unwrap().len(), 1);

        let id = gw.reserve_order_ids(1).await.unwrap();
        gw.place_order("ABCD", &OrderSpec::market(id, OrderAction::Sell, 100)).await.unwrap();
        assert!(gw.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_and_rejection() {
        let mut gw = PaperGateway::new();
        gw.fail_next_calls(1).await;
        let spec = OrderSpec::market(OrderId(1), OrderAction::Buy, 1);
        assert!(matches!(gw.place_order("ABCD", &spec).await, Err(TradeError::GatewayUnavailable(_))));
        assert!(gw.place_order("ABCD", &spec).await.is_ok());

        gw.reject_symbol("BAD").await;
        assert!(matches!(gw.place_order("BAD", &spec).await, Err(TradeError::OrderRejected { .. })));
    }

    #[tokio::test]
    async fn test_failed_fill_read_and_cleared_bars() {
        let mut gw = PaperGateway::new();
        gw.place_order("ABCD", &OrderSpec::market(OrderId(1), OrderAction::Buy, 1)).await.unwrap();

        gw.fail_next_fill_reads(1).await;
        assert!(matches!(gw.fills().await, Err(TradeError::GatewayUnavailable(_))));
        assert_eq!(gw.fills().await.unwrap().len(), 1);

        gw.set_bars("ABCD", Vec::new()).await;
        gw.clear_bars("ABCD").await;
        let request = BarRequest::default();
        assert!(gw.get_bars("ABCD", &request).await.is_err());
    }

    #[tokio::test]
    async fn test_scan_filters_by_price_band() {
        use chrono::{TimeZone, Utc};
        let gw = PaperGateway::new();
        let t = Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap();
        gw.set_bars("CHEAP", vec![Bar::new(t, 5.0, 5.2, 4.9, 5.1)]).await;
        gw.set_bars("MID", vec![Bar::new(t, 20.0, 21.0, 19.5, 20.5)]).await;

        let criteria = ScanCriteria { price_above: Some(15.0), price_below: Some(40.0), ..Default::default() };
        assert_eq!(gw.scan(&criteria).await.unwrap(), vec!["MID".to_string()]);
        assert_eq!(gw.scan(&ScanCriteria::default()).await.unwrap().len(), 2);
    }
}
