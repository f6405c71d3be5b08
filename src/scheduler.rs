//! Session scheduler - the trading control loop
//!
//! One `Scheduler` owns everything with session lifetime: the watchlist, the
//! hourly rollover gate, the last-seen bar cache and the retry queue. Each
//! poll runs, in order:
//! 1. connectivity check (a dead gateway ends the session)
//! 2. actions that failed on the previous poll
//! 3. fill sync (Breakout -> Filled)
//! 4. once per hour: cancel stale entries, move stops, rescan
//! 5. trigger/invalidation checks on every Candidate
//!
//! Bar fetches fan out concurrently; every gateway call that changes state is
//! made from this single path, one at a time.

use chrono::NaiveDateTime;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bars::{BarCache, BarWindow};
use crate::clock::{Clock, SessionClock, SessionPhase};
use crate::config::TraderConfig;
use crate::error::{TradeError, TradeResult};
use crate::gateway::{BrokerGateway, OpenOrder, OrderAction, OrderId, OrderKind, OrderSpec, Position};
use crate::pattern::{PatternDetector, Signal};
use crate::planner::OrderPlanner;
use crate::watchlist::{EntryState, Evaluation, InvalidationReason, Watchlist};

/// Events emitted by the scheduler
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// Hourly maintenance ran
    Rollover {
        hour: NaiveDateTime,
        new_candidates: usize,
    },
    CandidateAdded {
        symbol: String,
    },
    /// Candidate dropped at rollover without breaking out
    CandidateRetired {
        symbol: String,
    },
    Invalidated {
        symbol: String,
        reason: InvalidationReason,
    },
    /// Bracket accepted by the gateway
    PlanSubmitted {
        symbol: String,
        plan_id: Uuid,
        entry_order: OrderId,
        quantity: u32,
        entry_price: f64,
        stop_price: f64,
    },
    EntryFilled {
        symbol: String,
    },
    /// Unfilled entry cancelled at rollover
    EntryExpired {
        symbol: String,
    },
    StopAdjusted {
        symbol: String,
        order_id: OrderId,
        old_stop: f64,
        new_stop: f64,
    },
    /// Positions still open after repeated close attempts
    LiquidationStalled {
        attempts: u32,
        open_positions: usize,
    },
    SessionEnded {
        outcome: SessionOutcome,
        summary: SessionSummary,
    },
}

/// Why `run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionOutcome {
    /// Started before session start; nothing was done
    TooEarly,
    /// Started after the session; nothing was done
    SessionClosed,
    /// Liquidation finished with no open positions
    Liquidated,
    /// Shutdown requested between polls
    Shutdown,
    /// Gateway connection lost
    Disconnected,
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooEarly => write!(f, "too early to trade"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::Liquidated => write!(f, "liquidated"),
            Self::Shutdown => write!(f, "shutdown requested"),
            Self::Disconnected => write!(f, "gateway disconnected"),
        }
    }
}

/// Session statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub plans_submitted: usize,
    pub entries_filled: usize,
    pub entries_expired: usize,
    pub candidates_retired: usize,
    pub entries_invalidated: usize,
    pub orders_rejected: usize,
    pub stops_adjusted: usize,
    /// Entry price x quantity over all submitted plans
    pub submitted_notional: f64,
    pub liquidation_attempts: u32,
    /// Commissions over the session's fills, in dollars
    pub total_commissions: f64,
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "plans {} (${:.2}) | filled {} | expired {} | retired {} | invalidated {} | rejected {} | stops adjusted {} | commissions ${:.2}",
            self.plans_submitted,
            self.submitted_notional,
            self.entries_filled,
            self.entries_expired,
            self.candidates_retired,
            self.entries_invalidated,
            self.orders_rejected,
            self.stops_adjusted,
            self.total_commissions
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub summary: SessionSummary,
}

impl std::fmt::Display for SessionReport {
    /// Outcome and summary; liquidated sessions add the commission total
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.outcome, self.summary)?;
        if self.outcome == SessionOutcome::Liquidated {
            write!(f, "\nCommissions paid: ${:.2}", self.summary.total_commissions)?;
        }
        Ok(())
    }
}

/// Requests a clean stop at the next poll boundary
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Gateway action to repeat on the next poll
#[derive(Debug, Clone)]
enum PendingAction {
    Submit { symbol: String },
    CancelEntry { symbol: String, order_id: OrderId },
    ModifyStop { symbol: String, spec: OrderSpec, old_stop: f64 },
}

pub struct Scheduler<G: BrokerGateway, C: Clock> {
    config: TraderConfig,
    gateway: G,
    clock: C,
    detector: PatternDetector,
    planner: OrderPlanner,
    session: SessionClock,
    watchlist: Watchlist,
    bar_cache: BarCache,
    retries: Vec<PendingAction>,
    summary: SessionSummary,
    event_tx: broadcast::Sender<SchedulerEvent>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<G: BrokerGateway, C: Clock> Scheduler<G, C> {
    pub fn new(config: TraderConfig, gateway: G, clock: C) -> TradeResult<Self> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(1000);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            detector: PatternDetector::new(config.detector),
            planner: config.planner(),
            session: SessionClock::new(config.timezone, config.session),
            config,
            gateway,
            clock,
            watchlist: Watchlist::new(),
            bar_cache: BarCache::new(),
            retries: Vec::new(),
            summary: SessionSummary::default(),
            event_tx,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { tx: self.shutdown_tx.clone() }
    }

    pub fn watchlist(&self) -> &Watchlist {
        &self.watchlist
    }

    pub fn summary(&self) -> &SessionSummary {
        &self.summary
    }

    pub fn config(&self) -> &TraderConfig {
        &self.config
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Close the gateway connection
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.gateway.disconnect().await {
            warn!("Error during gateway disconnect: {}", e);
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Run the session to completion.
    ///
    /// Whether to trade at all is decided once, here: started before the
    /// session opens, the loop disconnects and returns without touching any
    /// orders.
    pub async fn run(&mut self) -> TradeResult<SessionReport> {
        let outcome = match self.session.phase(self.clock.now()) {
            SessionPhase::PreOpen => {
                info!("Too early to trade (session starts {} {})", self.config.session.start, self.config.timezone);
                SessionOutcome::TooEarly
            }
            SessionPhase::Closed => {
                info!("Session already over ({} {})", self.config.session.end, self.config.timezone);
                SessionOutcome::SessionClosed
            }
            SessionPhase::Active | SessionPhase::Liquidation => self.run_loop().await,
        };

        self.disconnect().await;

        info!("Session ended: {} | {}", outcome, self.summary);
        self.emit(SchedulerEvent::SessionEnded { outcome, summary: self.summary.clone() });

        Ok(SessionReport { outcome, summary: self.summary.clone() })
    }

    async fn run_loop(&mut self) -> SessionOutcome {
        info!(
            "Session active: liquidation at {}, poll every {}s",
            self.config.session.liquidation, self.config.poll_interval_secs
        );

        loop {
            if self.shutdown_requested() {
                info!("Shutdown requested, leaving session loop");
                return SessionOutcome::Shutdown;
            }

            match self.session.phase(self.clock.now()) {
                SessionPhase::Liquidation => {
                    self.liquidate().await;
                    return SessionOutcome::Liquidated;
                }
                SessionPhase::Closed => {
                    if self.config.session.liquidation < self.config.session.end {
                        // Slept past the liquidation window; flatten anyway
                        warn!("Session closed before liquidation ran, liquidating now");
                        self.liquidate().await;
                        return SessionOutcome::Liquidated;
                    }
                    return SessionOutcome::SessionClosed;
                }
                SessionPhase::PreOpen => {
                    debug!("Clock reports pre-open inside the session loop, idling");
                }
                SessionPhase::Active => {
                    if let Err(e) = self.poll_once().await {
                        warn!(
                            "{} - positions and orders are left as they are; operator attention required",
                            e
                        );
                        return SessionOutcome::Disconnected;
                    }
                }
            }

            let mut shutdown = self.shutdown_rx.clone();
            tokio::select! {
                _ = self.clock.sleep(self.config.poll_interval()) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One poll of the active session.
    ///
    /// Only a lost gateway connection is an error; everything per-instrument
    /// is logged and skipped.
    pub async fn poll_once(&mut self) -> TradeResult<()> {
        if !self.gateway.is_connected() {
            return Err(TradeError::GatewayUnavailable("connection lost during market hours".into()));
        }

        self.process_retries().await;
        self.sync_fills().await;

        if let Some(hour) = self.session.begin_rollover(self.clock.now()) {
            self.rollover(hour).await;
        }

        self.evaluate_candidates().await;
        Ok(())
    }

    async fn rollover(&mut self, hour: NaiveDateTime) {
        info!("Hourly rollover {}", hour);
        self.cancel_stale_entries().await;
        self.adjust_stops().await;
        let added = self.rescan().await;
        self.emit(SchedulerEvent::Rollover { hour, new_candidates: added.len() });
    }

    /// Candidate symbols from the static list or the concatenated scanners
    async fn candidate_universe(&self) -> Vec<String> {
        if !self.config.static_symbols.is_empty() {
            return self.config.static_symbols.clone();
        }

        let mut symbols = Vec::new();
        for criteria in &self.config.scanners {
            match self.gateway.scan(criteria).await {
                Ok(found) => {
                    debug!("Scanner {} returned {} symbols", criteria.scan_code, found.len());
                    symbols.extend(found);
                }
                Err(e) => warn!("Scanner {} failed: {}", criteria.scan_code, e),
            }
        }

        let mut seen = HashSet::new();
        symbols.retain(|s| seen.insert(s.clone()));
        symbols
    }

    /// Symbols with a position or a working order at the gateway
    async fn open_trade_symbols(&self) -> TradeResult<HashSet<String>> {
        let mut symbols: HashSet<String> = self
            .gateway
            .positions()
            .await?
            .into_iter()
            .filter(|p| p.quantity != 0.0)
            .map(|p| p.symbol)
            .collect();
        symbols.extend(self.gateway.open_orders().await?.into_iter().map(|o| o.symbol));
        Ok(symbols)
    }

    /// Fetch bar windows concurrently; results sorted by symbol
    async fn fetch_windows(&self, symbols: Vec<String>) -> Vec<(String, TradeResult<BarWindow>)> {
        let now = self.clock.now();
        let gateway = &self.gateway;
        let request = self.config.bar_request;
        let retention = self.config.window_retention;

        let mut results: Vec<_> = stream::iter(symbols)
            .map(|symbol| async move {
                let window = gateway
                    .get_bars(&symbol, &request)
                    .await
                    .map(|bars| BarWindow::from_history(&symbol, bars, retention, request.bar_size, now));
                (symbol, window)
            })
            .buffer_unordered(self.config.max_concurrent_fetches)
            .collect()
            .await;

        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Scan, detect and add new candidates. Returns the symbols added.
    ///
    /// A waiting Candidate is re-detected against the latest closed bar: a
    /// newer setup replaces it, otherwise it is retired once a later bar has
    /// closed.
    pub async fn rescan(&mut self) -> Vec<String> {
        let universe = self.candidate_universe().await;
        let busy = match self.open_trade_symbols().await {
            Ok(busy) => busy,
            Err(e) => {
                warn!("Skipping rescan, cannot read open trades: {}", e);
                return Vec::new();
            }
        };

        let mut symbols: Vec<String> = universe
            .into_iter()
            .filter(|s| !busy.contains(s))
            .filter(|s| self.watchlist.state(s) != Some(EntryState::Breakout))
            .collect();
        for symbol in self.watchlist.symbols_in(EntryState::Candidate) {
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }

        let now = self.clock.now();
        let bar_length = self.config.bar_request.bar_size.duration();
        let mut added = Vec::new();
        for (symbol, window) in self.fetch_windows(symbols).await {
            let newest_closed = window.as_ref().ok().and_then(|w| w.last_closed().ok()).map(|b| b.timestamp);
            let fresh = match window.and_then(|w| self.detector.detect(&w)) {
                Ok(Signal::LongSetup(setup)) if !busy.contains(&symbol) => Some(setup),
                Ok(_) => None,
                Err(e) if e.is_not_ready() => {
                    debug!("{} not evaluable yet: {}", symbol, e);
                    None
                }
                Err(e) => {
                    warn!("{} skipped during scan: {}", symbol, e);
                    None
                }
            };
            let waiting_on = self
                .watchlist
                .get(&symbol)
                .filter(|e| e.state == EntryState::Candidate)
                .map(|e| e.setup.confirmation.timestamp);

            match (fresh, waiting_on) {
                (Some(setup), Some(confirmed)) if setup.confirmation.timestamp == confirmed => {}
                (Some(setup), _) => {
                    if self.watchlist.insert_candidate(&symbol, setup, now) {
                        info!("{} added to watchlist ({})", symbol, self.detector.variant());
                        self.bar_cache.forget(&symbol);
                        self.emit(SchedulerEvent::CandidateAdded { symbol: symbol.clone() });
                        added.push(symbol);
                    }
                }
                (None, Some(confirmed)) => {
                    // Without bars, fall back to the clock
                    let superseded = match newest_closed {
                        Some(closed) => closed > confirmed,
                        None => confirmed + bar_length * 2 <= now,
                    };
                    if superseded {
                        self.record_retired(&symbol);
                    }
                }
                (None, None) => {}
            }
        }

        info!("Rescan added {} candidates ({} on watchlist)", added.len(), self.watchlist.len());
        added
    }

    /// Check every Candidate against its forming bar, submitting brackets on
    /// breakout
    async fn evaluate_candidates(&mut self) {
        let candidates = self.watchlist.symbols_in(EntryState::Candidate);
        if candidates.is_empty() {
            return;
        }
        self.evaluate_symbols(candidates, false).await;
    }

    async fn evaluate_symbols(&mut self, symbols: Vec<String>, force: bool) {
        let busy = match self.open_trade_symbols().await {
            Ok(busy) => busy,
            Err(e) => {
                warn!("Skipping evaluation, cannot read open trades: {}", e);
                for symbol in symbols.into_iter().filter(|_| force) {
                    self.retries.push(PendingAction::Submit { symbol });
                }
                return;
            }
        };

        let symbols: Vec<String> = symbols
            .into_iter()
            .filter(|s| {
                let skip = busy.contains(s);
                if skip {
                    debug!("{} has an open trade, not evaluating", s);
                }
                !skip
            })
            .collect();

        for (symbol, window) in self.fetch_windows(symbols).await {
            let window = match window {
                Ok(w) => w,
                Err(e) => {
                    warn!("{} skipped this poll: {}", symbol, e);
                    continue;
                }
            };
            let current = match window.current() {
                Ok(bar) => bar.clone(),
                Err(e) => {
                    debug!("{} has no forming bar: {}", symbol, e);
                    continue;
                }
            };

            // Unchanged bar, unchanged verdict
            if !self.bar_cache.observe(&symbol, &current) && !force {
                continue;
            }

            match self.watchlist.evaluate(&symbol, &current) {
                Evaluation::Unchanged => {}
                Evaluation::Invalidated => {
                    info!("{} invalidated: low {:.4} broke the inside bar", symbol, current.low);
                    self.summary.entries_invalidated += 1;
                    self.bar_cache.forget(&symbol);
                    self.emit(SchedulerEvent::Invalidated { symbol, reason: InvalidationReason::LowBroken });
                }
                Evaluation::Triggered => self.submit_plan(&symbol, &window).await,
            }
        }
    }

    /// Plan and transmit a bracket for a triggered Candidate
    async fn submit_plan(&mut self, symbol: &str, window: &BarWindow) {
        let Some(entry) = self.watchlist.get(symbol) else { return };

        let plan = match self.planner.plan(&entry.setup, window) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                info!("{} breakout but size rounds to zero shares, no order", symbol);
                return;
            }
            Err(e) => {
                warn!("{} breakout skipped this poll: {}", symbol, e);
                return;
            }
        };

        let first_id = match self.gateway.reserve_order_ids(plan.message_count()).await {
            Ok(id) => id,
            Err(e) => {
                warn!("{} order ids unavailable, retrying next poll: {}", symbol, e);
                self.retries.push(PendingAction::Submit { symbol: symbol.to_string() });
                return;
            }
        };

        let specs = plan.order_specs(first_id);
        for (i, spec) in specs.iter().enumerate() {
            if let Err(e) = self.gateway.place_order(symbol, spec).await {
                if i > 0 {
                    // Drop the half-sent bracket
                    if let Err(cancel_err) = self.gateway.cancel_order(first_id).await {
                        warn!("{} cleanup cancel of {} failed: {}", symbol, first_id, cancel_err);
                    }
                }
                match e {
                    TradeError::OrderRejected { .. } => {
                        warn!("{}", e);
                        self.watchlist.mark_rejected(symbol);
                        self.summary.orders_rejected += 1;
                        self.emit(SchedulerEvent::Invalidated {
                            symbol: symbol.to_string(),
                            reason: InvalidationReason::OrderRejected,
                        });
                    }
                    other => {
                        warn!("{} bracket not sent, retrying next poll: {}", symbol, other);
                        self.retries.push(PendingAction::Submit { symbol: symbol.to_string() });
                    }
                }
                return;
            }
        }

        info!("Bracket submitted: {}", plan);
        let event = SchedulerEvent::PlanSubmitted {
            symbol: symbol.to_string(),
            plan_id: plan.id(),
            entry_order: first_id,
            quantity: plan.quantity(),
            entry_price: plan.entry_price(),
            stop_price: plan.stop_price(),
        };
        self.summary.plans_submitted += 1;
        self.summary.submitted_notional += plan.notional();

        let ids = specs.iter().map(|s| s.order_id).collect();
        self.watchlist.mark_submitted(symbol, plan, ids);
        self.emit(event);
    }

    /// Breakout -> Filled for every entry the gateway reports executed
    async fn sync_fills(&mut self) {
        let breakouts = self.watchlist.symbols_in(EntryState::Breakout);
        if breakouts.is_empty() {
            return;
        }

        let filled: HashSet<OrderId> = match self.gateway.fills().await {
            Ok(fills) => fills.into_iter().map(|f| f.order_id).collect(),
            Err(e) => {
                warn!("Cannot read fills this poll: {}", e);
                return;
            }
        };

        for symbol in breakouts {
            let entry_id = self.watchlist.get(&symbol).and_then(|e| e.entry_order_id());
            if entry_id.is_some_and(|id| filled.contains(&id)) {
                self.record_filled(&symbol);
            }
        }
    }

    fn record_filled(&mut self, symbol: &str) {
        if self.watchlist.mark_filled(symbol) {
            info!("{} entry filled", symbol);
            self.summary.entries_filled += 1;
            self.emit(SchedulerEvent::EntryFilled { symbol: symbol.to_string() });
        }
    }

    fn record_retired(&mut self, symbol: &str) {
        if self.watchlist.retire(symbol) {
            info!("{} candidate retired, its inside bar is no longer the latest", symbol);
            self.summary.candidates_retired += 1;
            self.bar_cache.forget(symbol);
            self.emit(SchedulerEvent::CandidateRetired { symbol: symbol.to_string() });
        }
    }

    fn record_expired(&mut self, symbol: &str) {
        if self.watchlist.expire(symbol) {
            info!("{} entry expired unfilled", symbol);
            self.summary.entries_expired += 1;
            self.bar_cache.forget(symbol);
            self.emit(SchedulerEvent::EntryExpired { symbol: symbol.to_string() });
        }
    }

    /// Cancel unfilled entry orders outside the protected set
    async fn cancel_stale_entries(&mut self) {
        let orders = match self.gateway.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("Cannot read open orders, stale entries kept until next rollover: {}", e);
                return;
            }
        };

        let stale: Vec<OpenOrder> = orders
            .iter()
            .filter(|o| {
                o.spec.parent_id.is_none()
                    && o.spec.action == OrderAction::Buy
                    && o.spec.kind != OrderKind::Market
                    && o.filled == 0
                    && !self.config.is_protected(&o.symbol)
            })
            .cloned()
            .collect();

        for order in stale {
            match self.gateway.cancel_order(order.spec.order_id).await {
                Ok(()) => {
                    debug!("Cancelled unfilled entry {} for {}", order.spec.order_id, order.symbol);
                    self.expire_if_tracked(&order.symbol, order.spec.order_id);
                }
                Err(e) => {
                    warn!("{} cancel of {} failed, retrying next poll: {}", order.symbol, order.spec.order_id, e);
                    self.retries.push(PendingAction::CancelEntry {
                        symbol: order.symbol.clone(),
                        order_id: order.spec.order_id,
                    });
                }
            }
        }

        // Breakout entries whose orders disappeared without a fill
        let working: HashSet<OrderId> = orders.iter().map(|o| o.spec.order_id).collect();
        let pending: HashSet<OrderId> = self
            .retries
            .iter()
            .filter_map(|a| match a {
                PendingAction::CancelEntry { order_id, .. } => Some(*order_id),
                _ => None,
            })
            .collect();
        let vanished: Vec<(String, OrderId)> = self
            .watchlist
            .symbols_in(EntryState::Breakout)
            .into_iter()
            .filter_map(|symbol| {
                let id = self.watchlist.get(&symbol).and_then(|e| e.entry_order_id())?;
                (!working.contains(&id) && !pending.contains(&id)).then_some((symbol, id))
            })
            .collect();
        if vanished.is_empty() {
            return;
        }

        // The entry may have filled since the fill sync earlier in this poll
        let filled: HashSet<OrderId> = match self.gateway.fills().await {
            Ok(fills) => fills.into_iter().map(|f| f.order_id).collect(),
            Err(e) => {
                warn!("Cannot read fills, vanished entries kept until next rollover: {}", e);
                return;
            }
        };
        for (symbol, id) in vanished {
            if filled.contains(&id) {
                self.record_filled(&symbol);
            } else {
                self.record_expired(&symbol);
            }
        }
    }

    fn expire_if_tracked(&mut self, symbol: &str, order_id: OrderId) {
        let tracked = self
            .watchlist
            .get(symbol)
            .is_some_and(|e| e.state == EntryState::Breakout && e.entry_order_id() == Some(order_id));
        if tracked {
            self.record_expired(symbol);
        }
    }

    /// Move every working protective stop to the latest closed bar's low minus
    /// the tier offset. With `ratchet_stops` set a stop is never lowered.
    /// Returns how many moved.
    pub async fn adjust_stops(&mut self) -> usize {
        let orders = match self.gateway.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("Cannot read open orders, stops not adjusted: {}", e);
                return 0;
            }
        };

        let working: HashSet<OrderId> = orders.iter().filter(|o| o.filled == 0).map(|o| o.spec.order_id).collect();
        let stops: Vec<OpenOrder> = orders
            .into_iter()
            .filter(|o| o.spec.kind.is_stop() && o.spec.action == OrderAction::Sell)
            .filter(|o| !self.config.is_protected(&o.symbol))
            // Children of an entry that has not filled yet protect nothing
            .filter(|o| o.spec.parent_id.map_or(true, |p| !working.contains(&p)))
            .collect();
        if stops.is_empty() {
            return 0;
        }

        let mut symbols: Vec<String> = stops.iter().map(|o| o.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        let windows = self.fetch_windows(symbols).await;

        let mut adjusted = 0;
        for stop in stops {
            let Some((_, window)) = windows.iter().find(|(s, _)| *s == stop.symbol) else { continue };
            let window = match window {
                Ok(w) => w,
                Err(e) => {
                    warn!("{} stop not adjusted: {}", stop.symbol, e);
                    continue;
                }
            };
            let low = match window.last_closed() {
                Ok(bar) => bar.low,
                Err(e) => {
                    debug!("{} stop not adjusted: {}", stop.symbol, e);
                    continue;
                }
            };

            let old_stop = stop.spec.kind.stop_price().unwrap_or_default();
            let last_price = window.last_price().unwrap_or(low);
            let tier = self.planner.tiers().tier_for(last_price);
            let new_stop = tier.round(low - tier.stop_offset);

            if new_stop == old_stop || (self.config.ratchet_stops && new_stop < old_stop) {
                debug!("{} stop stays at {} (candidate {})", stop.symbol, old_stop, new_stop);
                continue;
            }
            if new_stop >= last_price {
                warn!("{} stop {} would be at or above last price {}, left at {}", stop.symbol, new_stop, last_price, old_stop);
                continue;
            }

            let spec = OrderSpec { kind: OrderKind::Stop { stop: new_stop }, transmit: true, ..stop.spec.clone() };
            if self.send_stop(&stop.symbol, spec, old_stop).await {
                adjusted += 1;
            }
        }

        info!("Stop maintenance: {} stops moved", adjusted);
        adjusted
    }

    async fn send_stop(&mut self, symbol: &str, spec: OrderSpec, old_stop: f64) -> bool {
        let new_stop = spec.kind.stop_price().unwrap_or_default();
        match self.gateway.place_order(symbol, &spec).await {
            Ok(()) => {
                info!("{} stop {} moved {} -> {}", symbol, spec.order_id, old_stop, new_stop);
                self.summary.stops_adjusted += 1;
                self.emit(SchedulerEvent::StopAdjusted {
                    symbol: symbol.to_string(),
                    order_id: spec.order_id,
                    old_stop,
                    new_stop,
                });
                true
            }
            Err(e @ TradeError::GatewayUnavailable(_)) => {
                warn!("{} stop update failed, retrying next poll: {}", symbol, e);
                self.retries.push(PendingAction::ModifyStop { symbol: symbol.to_string(), spec, old_stop });
                false
            }
            Err(e) => {
                warn!("{} stop update refused: {}", symbol, e);
                false
            }
        }
    }

    async fn process_retries(&mut self) {
        let pending = std::mem::take(&mut self.retries);
        if pending.is_empty() {
            return;
        }
        info!("Retrying {} gateway actions", pending.len());

        let mut resubmit = Vec::new();
        for action in pending {
            match action {
                PendingAction::Submit { symbol } => resubmit.push(symbol),
                PendingAction::CancelEntry { symbol, order_id } => match self.gateway.cancel_order(order_id).await {
                    Ok(()) => self.expire_if_tracked(&symbol, order_id),
                    Err(e) => {
                        warn!("{} cancel of {} failed again: {}", symbol, order_id, e);
                        self.retries.push(PendingAction::CancelEntry { symbol, order_id });
                    }
                },
                PendingAction::ModifyStop { symbol, spec, old_stop } => {
                    self.send_stop(&symbol, spec, old_stop).await;
                }
            }
        }

        let resubmit: Vec<String> = resubmit
            .into_iter()
            .filter(|s| self.watchlist.state(s) == Some(EntryState::Candidate))
            .collect();
        if !resubmit.is_empty() {
            self.evaluate_symbols(resubmit, true).await;
        }
    }

    async fn cancel_all_orders(&mut self) {
        let orders = match self.gateway.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                warn!("Cannot read open orders during liquidation: {}", e);
                return;
            }
        };
        for order in orders.iter().filter(|o| !self.config.is_protected(&o.symbol)) {
            if let Err(e) = self.gateway.cancel_order(order.spec.order_id).await {
                warn!("{} cancel of {} failed: {}", order.symbol, order.spec.order_id, e);
            }
        }
    }

    async fn close_positions(&mut self, positions: &[Position]) {
        for position in positions {
            let action = if position.quantity > 0.0 { OrderAction::Sell } else { OrderAction::Buy };
            let quantity = position.quantity.abs().round() as u32;

            let id = match self.gateway.reserve_order_ids(1).await {
                Ok(id) => id,
                Err(e) => {
                    warn!("{} close skipped this attempt: {}", position.symbol, e);
                    continue;
                }
            };
            match self.gateway.place_order(&position.symbol, &OrderSpec::market(id, action, quantity)).await {
                Ok(()) => info!("{} market {} {} to close", position.symbol, action, quantity),
                Err(e) => warn!("{} close order failed: {}", position.symbol, e),
            }
        }
    }

    /// Flatten everything outside the protected set and total commissions.
    ///
    /// Retries until the gateway reports no open positions. Past the alert
    /// threshold every further attempt raises an operator alert, but the loop
    /// never gives up.
    pub async fn liquidate(&mut self) -> f64 {
        info!("Liquidation window open, closing all positions");
        let mut attempts = 0u32;

        loop {
            self.cancel_all_orders().await;

            let open: Vec<Position> = match self.gateway.positions().await {
                Ok(positions) => positions
                    .into_iter()
                    .filter(|p| p.quantity != 0.0 && !self.config.is_protected(&p.symbol))
                    .collect(),
                Err(e) => {
                    warn!("Cannot read positions during liquidation: {}", e);
                    self.clock.sleep(self.config.liquidation_retry()).await;
                    continue;
                }
            };
            if open.is_empty() {
                break;
            }

            attempts += 1;
            if attempts > self.config.liquidation_alert_attempts {
                let alert = TradeError::LiquidationStalled { attempts, open_positions: open.len() };
                error!("OPERATOR ALERT: {}", alert);
                self.emit(SchedulerEvent::LiquidationStalled { attempts, open_positions: open.len() });
            }

            self.close_positions(&open).await;
            self.clock.sleep(self.config.liquidation_retry()).await;
        }

        let commissions = match self.gateway.fills().await {
            Ok(fills) => fills.iter().map(|f| f.commission).sum(),
            Err(e) => {
                warn!("Cannot read fills for the commission report: {}", e);
                0.0
            }
        };

        self.summary.liquidation_attempts = attempts;
        self.summary.total_commissions = commissions;
        info!("All positions closed after {} attempts, commissions paid ${:.2}", attempts, commissions);
        commissions
    }
}
