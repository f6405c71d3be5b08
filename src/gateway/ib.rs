//! Interactive Brokers gateway over the TWS socket API
//!
//! The `ibapi` client is synchronous; every request runs on the blocking
//! pool so the session loop never stalls on a socket read.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use ibapi::contracts::{Contract, SecurityType};
use ibapi::market_data::historical::{BarSize as HistBarSize, ToDuration, WhatToShow as HistWhatToShow};
use ibapi::orders::{order_builder, Action, ExecutionFilter, Executions, Order, Orders, TagValue};
use ibapi::accounts::PositionUpdate;
use ibapi::scanner::ScannerSubscription;
use ibapi::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    BrokerGateway, Fill, OpenOrder, OrderAction, OrderId, OrderKind, OrderSpec, Position, ScanCriteria, TimeInForce,
};
use crate::bars::{Bar, BarRequest, BarSize};
use crate::error::{TradeError, TradeResult};

pub struct IbGateway {
    client: Arc<Client>,
    next_id: i32,
    connected: Arc<AtomicBool>,
}

fn stock(symbol: &str) -> Contract {
    Contract {
        symbol: symbol.to_string(),
        security_type: SecurityType::Stock,
        exchange: "SMART".to_string(),
        currency: "USD".to_string(),
        ..Default::default()
    }
}

fn ib_action(action: OrderAction) -> Action {
    match action {
        OrderAction::Buy => Action::Buy,
        OrderAction::Sell => Action::Sell,
    }
}

fn from_ib_action(action: &Action) -> OrderAction {
    match action {
        Action::Buy => OrderAction::Buy,
        _ => OrderAction::Sell,
    }
}

/// Map a wire-neutral order message onto an `ibapi` order
fn build_order(spec: &OrderSpec) -> Order {
    let action = ib_action(spec.action);
    let quantity = spec.quantity as f64;

    let mut order = match spec.kind {
        OrderKind::Market => order_builder::market_order(action, quantity),
        OrderKind::Limit { limit } => order_builder::limit_order(action, quantity, limit),
        OrderKind::Stop { stop } => order_builder::stop(action, quantity, stop),
        OrderKind::StopLimit { stop, limit } => {
            let mut order = order_builder::limit_order(action, quantity, limit);
            order.order_type = "STP LMT".to_string();
            order.aux_price = Some(stop);
            order
        }
    };

    order.order_id = spec.order_id.0;
    order.parent_id = spec.parent_id.map_or(0, |p| p.0);
    order.transmit = spec.transmit;
    order.outside_rth = spec.outside_rth;
    order.tif = spec.tif.to_string();
    order
}

/// Inverse of [`build_order`] for orders reported by TWS
fn spec_from_order(order: &Order) -> Option<OrderSpec> {
    let kind = match order.order_type.as_str() {
        "MKT" => OrderKind::Market,
        "LMT" => OrderKind::Limit { limit: order.limit_price? },
        "STP" => OrderKind::Stop { stop: order.aux_price? },
        "STP LMT" => OrderKind::StopLimit { stop: order.aux_price?, limit: order.limit_price? },
        other => {
            debug!("IB: ignoring order {} of type {}", order.order_id, other);
            return None;
        }
    };

    Some(OrderSpec {
        order_id: OrderId(order.order_id),
        parent_id: (order.parent_id != 0).then_some(OrderId(order.parent_id)),
        action: from_ib_action(&order.action),
        kind,
        quantity: order.total_quantity.max(0.0).round() as u32,
        tif: if order.tif == "GTC" { TimeInForce::Gtc } else { TimeInForce::Day },
        outside_rth: order.outside_rth,
        transmit: order.transmit,
    })
}

fn unavailable(what: &str, err: impl std::fmt::Display) -> TradeError {
    TradeError::GatewayUnavailable(format!("{}: {}", what, err))
}

/// TWS message codes for a lost or missing connection
const CONNECTION_CODES: [i32; 4] = [502, 504, 1100, 2110];

fn reports_disconnect(text: &str) -> bool {
    let text = text.to_lowercase();
    ["connection", "broken pipe", "shutdown", "end of stream", "os error"]
        .iter()
        .any(|marker| text.contains(marker))
}

/// Whether a client error means the socket to TWS is gone
fn is_connection_loss(err: &ibapi::Error) -> bool {
    match err {
        ibapi::Error::Message(code, _) => CONNECTION_CODES.contains(code),
        other => reports_disconnect(&other.to_string()),
    }
}

impl IbGateway {
    /// Connect to TWS / IB Gateway and seed order ids from the server
    pub async fn connect(host: &str, port: u16, client_id: i32) -> Result<Self> {
        let url = format!("{}:{}", host, port);
        info!("Connecting to IB at {} (client id {})", url, client_id);

        let client = tokio::task::spawn_blocking(move || Client::connect(&url, client_id))
            .await
            .context("IB connect task panicked")?
            .context("Failed to connect to IB. Is TWS / IB Gateway running with the API enabled?")?;

        let client = Arc::new(client);
        let seed = {
            let client = client.clone();
            tokio::task::spawn_blocking(move || client.next_valid_order_id())
                .await
                .context("IB order id task panicked")?
                .context("Failed to fetch next valid order id")?
        };

        info!("Connected to IB (server version {}), next order id {}", client.server_version(), seed);

        Ok(Self {
            client,
            next_id: seed,
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Run a synchronous client call on the blocking pool
    async fn blocking<T, F>(&self, what: &'static str, f: F) -> TradeResult<T>
    where
        F: FnOnce(&Client) -> Result<T, ibapi::Error> + Send + 'static,
        T: Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || f(&client))
            .await
            .map_err(|e| unavailable(what, e))?
            .map_err(|e| self.client_error(what, e))
    }

    /// Map a client error, dropping the connected flag when the socket is gone
    fn client_error(&self, what: &str, err: ibapi::Error) -> TradeError {
        if is_connection_loss(&err) && self.connected.swap(false, Ordering::SeqCst) {
            warn!("IB connection lost during {}: {}", what, err);
        }
        unavailable(what, err)
    }
}

impl BrokerGateway for IbGateway {
    async fn scan(&self, criteria: &ScanCriteria) -> TradeResult<Vec<String>> {
        let subscription = ScannerSubscription {
            number_of_rows: criteria.max_rows as i32,
            instrument: Some(criteria.instrument.clone()),
            location_code: Some(criteria.location_code.clone()),
            scan_code: Some(criteria.scan_code.clone()),
            ..Default::default()
        };
        let filter: Vec<TagValue> = criteria
            .filter_tags()
            .into_iter()
            .map(|(tag, value)| TagValue { tag: tag.to_string(), value })
            .collect();

        self.blocking("scanner", move |client| {
            let results = client.scanner_subscription(&subscription, &filter)?;
            // One snapshot is enough; dropping the subscription cancels it
            Ok(results
                .next()
                .map(|rows| rows.into_iter().map(|row| row.contract_details.contract.symbol).collect())
                .unwrap_or_default())
        })
        .await
    }

    async fn get_bars(&self, symbol: &str, request: &BarRequest) -> TradeResult<Vec<Bar>> {
        let contract = stock(symbol);
        let days = request.lookback_days as i32;
        let (bar_size, what) = match request.bar_size {
            BarSize::Hour => (HistBarSize::Hour, HistWhatToShow::MidPoint),
            BarSize::Day => (HistBarSize::Day, HistWhatToShow::Trades),
            BarSize::Week => (HistBarSize::Week, HistWhatToShow::Trades),
        };

        let data = self
            .blocking("historical data", move |client| {
                client.historical_data(&contract, None, days.days(), bar_size, what, true)
            })
            .await?;

        Ok(data
            .bars
            .iter()
            .filter_map(|bar| {
                let timestamp = Utc.timestamp_opt(bar.date.unix_timestamp(), 0).single()?;
                Some(Bar {
                    timestamp,
                    open: bar.open,
                    high: bar.high,
                    low: bar.low,
                    close: bar.close,
                    volume: bar.volume,
                })
            })
            .collect())
    }

    async fn reserve_order_ids(&mut self, count: usize) -> TradeResult<OrderId> {
        let first = OrderId(self.next_id);
        self.next_id += count as i32;
        Ok(first)
    }

    async fn place_order(&mut self, symbol: &str, spec: &OrderSpec) -> TradeResult<()> {
        let contract = stock(symbol);
        let order = build_order(spec);
        let id = spec.order_id.0;
        debug!("IB: place {} {} {} {} {}", spec.order_id, spec.action, spec.quantity, symbol, spec.kind);

        let client = self.client.clone();
        let result = tokio::task::spawn_blocking(move || client.place_order(id, &contract, &order).map(|_| ()))
            .await
            .map_err(|e| unavailable("place order", e))?;

        match result {
            Ok(()) => Ok(()),
            Err(e) if is_connection_loss(&e) => Err(self.client_error("place order", e)),
            Err(ibapi::Error::Message(code, reason)) => Err(TradeError::OrderRejected {
                symbol: symbol.to_string(),
                reason: format!("{} ({})", reason, code),
            }),
            Err(e) => Err(self.client_error("place order", e)),
        }
    }

    async fn cancel_order(&mut self, order_id: OrderId) -> TradeResult<()> {
        let id = order_id.0;
        self.blocking("cancel order", move |client| client.cancel_order(id, "").map(|_| ()))
            .await
    }

    async fn open_orders(&self) -> TradeResult<Vec<OpenOrder>> {
        self.blocking("open orders", |client| {
            let mut orders: Vec<OpenOrder> = Vec::new();
            let mut filled: HashMap<i32, f64> = HashMap::new();

            for message in client.all_open_orders()?.iter() {
                match message {
                    Orders::OrderData(data) => {
                        if let Some(spec) = spec_from_order(&data.order) {
                            orders.push(OpenOrder { symbol: data.contract.symbol.clone(), spec, filled: 0 });
                        }
                    }
                    Orders::OrderStatus(status) => {
                        filled.insert(status.order_id, status.filled);
                    }
                    _ => {}
                }
            }

            for order in &mut orders {
                if let Some(qty) = filled.get(&order.spec.order_id.0) {
                    order.filled = qty.max(0.0).round() as u32;
                }
            }
            Ok(orders)
        })
        .await
    }

    async fn positions(&self) -> TradeResult<Vec<Position>> {
        self.blocking("positions", |client| {
            let mut positions = Vec::new();
            let updates = client.positions()?;
            for update in updates.iter() {
                match update {
                    PositionUpdate::Position(p) => {
                        if p.position != 0.0 {
                            positions.push(Position {
                                symbol: p.contract.symbol.clone(),
                                quantity: p.position,
                                avg_cost: p.average_cost,
                            });
                        }
                    }
                    PositionUpdate::PositionEnd => break,
                }
            }
            Ok(positions)
        })
        .await
    }

    async fn fills(&self) -> TradeResult<Vec<Fill>> {
        self.blocking("executions", |client| {
            let mut fills: Vec<(String, Fill)> = Vec::new();
            let mut commissions: HashMap<String, f64> = HashMap::new();

            for message in client.executions(ExecutionFilter::default())?.iter() {
                match message {
                    Executions::ExecutionData(data) => {
                        let exec = &data.execution;
                        let action = if exec.side == "BOT" { OrderAction::Buy } else { OrderAction::Sell };
                        fills.push((
                            exec.execution_id.clone(),
                            Fill {
                                order_id: OrderId(exec.order_id),
                                symbol: data.contract.symbol.clone(),
                                action,
                                quantity: exec.shares.max(0.0).round() as u32,
                                price: exec.price,
                                commission: 0.0,
                            },
                        ));
                    }
                    Executions::CommissionReport(report) => {
                        commissions.insert(report.execution_id.clone(), report.commission);
                    }
                    _ => {}
                }
            }

            Ok(fills
                .into_iter()
                .map(|(exec_id, mut fill)| {
                    fill.commission = commissions.get(&exec_id).copied().unwrap_or(0.0);
                    fill
                })
                .collect())
        })
        .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) -> TradeResult<()> {
        // The socket closes when the last client handle drops
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from IB");
        Ok(())
    }
}
