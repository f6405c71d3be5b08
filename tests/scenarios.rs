//! End-to-end session scenarios against the paper gateway and a manual clock

use chrono::{DateTime, TimeZone, Utc};

use inside_bar_trader::gateway::{BrokerGateway, OrderAction, OrderKind};
use inside_bar_trader::{
    Bar, EntryState, InvalidationReason, ManualClock, PaperGateway, Scheduler, SchedulerEvent, SessionOutcome,
    TraderConfig,
};

/// 2025-03-04 is EST, so New York = UTC - 5
fn utc(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 4, h, m, 0).unwrap()
}

fn bar(h: u32, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar::new(utc(h, 0), open, high, low, close)
}

fn config() -> TraderConfig {
    TraderConfig {
        static_symbols: vec!["ABCD".to_string()],
        scanners: Vec::new(),
        ..TraderConfig::hourly()
    }
}

/// Context 10:00 NY, green inside bar 11:00 NY, forming bar 12:00 NY
fn inside_bar_history(forming: Bar) -> Vec<Bar> {
    vec![bar(14, 9.4, 9.9, 9.1, 9.5), bar(15, 9.5, 10.0, 9.0, 9.4), bar(16, 9.3, 9.8, 9.2, 9.6), forming]
}

async fn setup() -> (PaperGateway, ManualClock, Scheduler<PaperGateway, ManualClock>) {
    let gateway = PaperGateway::new();
    let clock = ManualClock::new(utc(17, 10));
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.7, 9.5, 9.65))).await;
    let scheduler = Scheduler::new(config(), gateway.clone(), clock.clone()).unwrap();
    (gateway, clock, scheduler)
}

/// Detect on the first poll, break out on the second
async fn submit_bracket(gateway: &PaperGateway, scheduler: &mut Scheduler<PaperGateway, ManualClock>) {
    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Candidate));
    assert!(gateway.sent_orders().await.is_empty());

    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.9, 9.5, 9.88))).await;
    scheduler.poll_once().await.unwrap();
}

#[tokio::test]
async fn test_breakout_submits_sized_bracket() {
    let (gateway, _clock, mut scheduler) = setup().await;
    let mut events = scheduler.subscribe();

    submit_bracket(&gateway, &mut scheduler).await;

    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Breakout));

    let sent = gateway.sent_orders().await;
    assert_eq!(sent.len(), 4);
    let (symbol, entry) = &sent[0];
    assert_eq!(symbol, "ABCD");
    assert_eq!(entry.action, OrderAction::Buy);
    assert_eq!(entry.kind, OrderKind::Limit { limit: 9.85 });
    // $185 at risk over 9.85 - 9.19 = 0.66 per share
    assert_eq!(entry.quantity, 280);
    assert!(entry.parent_id.is_none());
    assert!(!entry.transmit);

    let targets: Vec<(f64, u32)> = sent[1..]
        .iter()
        .filter_map(|(_, s)| s.kind.limit_price().map(|p| (p, s.quantity)))
        .collect();
    assert_eq!(targets, vec![(10.51, 93), (11.17, 93), (12.49, 94)]);

    let (_, stop) = &sent[3];
    assert_eq!(stop.kind, OrderKind::Stop { stop: 9.19 });
    assert_eq!(stop.quantity, 280);
    assert_eq!(stop.parent_id, Some(entry.order_id));
    assert!(stop.transmit);

    assert_eq!(scheduler.summary().plans_submitted, 1);

    let mut submitted = None;
    while let Ok(event) = events.try_recv() {
        if let SchedulerEvent::PlanSubmitted { quantity, entry_price, stop_price, .. } = event {
            submitted = Some((quantity, entry_price, stop_price));
        }
    }
    assert_eq!(submitted, Some((280, 9.85, 9.19)));
}

#[tokio::test]
async fn test_red_inside_bar_is_ignored() {
    let gateway = PaperGateway::new();
    let clock = ManualClock::new(utc(17, 10));
    gateway
        .set_bars(
            "ABCD",
            vec![bar(15, 9.5, 10.0, 9.0, 9.4), bar(16, 9.6, 9.8, 9.2, 9.3), bar(17, 9.3, 9.9, 9.25, 9.85)],
        )
        .await;
    let mut scheduler = Scheduler::new(config(), gateway.clone(), clock).unwrap();

    scheduler.poll_once().await.unwrap();

    assert!(scheduler.watchlist().is_empty());
    assert!(gateway.sent_orders().await.is_empty());
}

#[tokio::test]
async fn test_low_break_invalidates_candidate() {
    let (gateway, _clock, mut scheduler) = setup().await;
    scheduler.poll_once().await.unwrap();

    // Takes out both sides; the low wins
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.95, 9.1, 9.3))).await;
    scheduler.poll_once().await.unwrap();

    assert_eq!(
        scheduler.watchlist().state("ABCD"),
        Some(EntryState::Invalidated(InvalidationReason::LowBroken))
    );
    assert!(gateway.sent_orders().await.is_empty());
    assert_eq!(scheduler.summary().entries_invalidated, 1);
}

#[tokio::test]
async fn test_rollover_expires_unfilled_entry() {
    let (gateway, clock, mut scheduler) = setup().await;
    submit_bracket(&gateway, &mut scheduler).await;
    let entry_id = scheduler.watchlist().get("ABCD").and_then(|e| e.entry_order_id()).unwrap();

    // 13:05 NY: the 12:00 bar closed as an outside bar, no new setup
    clock.set(utc(18, 5));
    gateway
        .set_bars(
            "ABCD",
            vec![
                bar(15, 9.5, 10.0, 9.0, 9.4),
                bar(16, 9.3, 9.8, 9.2, 9.6),
                bar(17, 9.6, 9.9, 9.1, 9.5),
                bar(18, 9.5, 9.6, 9.4, 9.55),
            ],
        )
        .await;
    scheduler.poll_once().await.unwrap();

    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Expired));
    assert!(gateway.cancelled_orders().await.contains(&entry_id));
    assert!(gateway.open_orders().await.unwrap().is_empty());
    assert_eq!(scheduler.summary().entries_expired, 1);
}

#[tokio::test]
async fn test_filled_entry_stop_is_raised_at_rollover() {
    let (gateway, clock, mut scheduler) = setup().await;
    submit_bracket(&gateway, &mut scheduler).await;
    let entry = scheduler.watchlist().get("ABCD").unwrap();
    let entry_id = entry.entry_order_id().unwrap();
    let stop_id = entry.stop_order_id().unwrap();

    gateway.fill_order(entry_id, 9.85).await.unwrap();
    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Filled));

    // 13:05 NY: the 12:00 bar closed with a low of 9.60
    clock.set(utc(18, 5));
    gateway
        .set_bars(
            "ABCD",
            vec![
                bar(15, 9.5, 10.0, 9.0, 9.4),
                bar(16, 9.3, 9.8, 9.2, 9.6),
                bar(17, 9.7, 9.95, 9.6, 9.9),
                bar(18, 9.9, 10.0, 9.85, 9.95),
            ],
        )
        .await;
    scheduler.poll_once().await.unwrap();

    let stop = gateway
        .open_orders()
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.spec.order_id == stop_id)
        .unwrap();
    assert_eq!(stop.spec.kind, OrderKind::Stop { stop: 9.59 });
    assert_eq!(scheduler.summary().stops_adjusted, 1);

    // Same bars next pass: an unchanged price is not resubmitted
    assert_eq!(scheduler.adjust_stops().await, 0);
}

/// Filled bracket rolled into 13:05 NY, where the 12:00 bar closed with a
/// low of 9.15, under the original 9.19 stop
async fn roll_filled_bracket_over_lower_low(config: TraderConfig) -> f64 {
    let gateway = PaperGateway::new();
    let clock = ManualClock::new(utc(17, 10));
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.7, 9.5, 9.65))).await;
    let mut scheduler = Scheduler::new(config, gateway.clone(), clock.clone()).unwrap();
    submit_bracket(&gateway, &mut scheduler).await;
    let entry = scheduler.watchlist().get("ABCD").unwrap();
    let entry_id = entry.entry_order_id().unwrap();
    let stop_id = entry.stop_order_id().unwrap();
    gateway.fill_order(entry_id, 9.85).await.unwrap();

    clock.set(utc(18, 5));
    gateway
        .set_bars(
            "ABCD",
            vec![
                bar(15, 9.5, 10.0, 9.0, 9.4),
                bar(16, 9.3, 9.8, 9.2, 9.6),
                bar(17, 9.85, 9.9, 9.15, 9.6),
                bar(18, 9.6, 9.7, 9.5, 9.65),
            ],
        )
        .await;
    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Filled));

    let stop = gateway
        .open_orders()
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.spec.order_id == stop_id)
        .unwrap();
    stop.spec.kind.stop_price().unwrap()
}

#[tokio::test]
async fn test_stop_follows_lower_low_by_default() {
    assert_eq!(roll_filled_bracket_over_lower_low(config()).await, 9.14);
}

#[tokio::test]
async fn test_ratchet_keeps_stop_from_moving_down() {
    let config = TraderConfig { ratchet_stops: true, ..config() };
    assert_eq!(roll_filled_bracket_over_lower_low(config).await, 9.19);
}

#[tokio::test]
async fn test_new_inside_bar_replaces_waiting_candidate() {
    let (gateway, clock, mut scheduler) = setup().await;
    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().get("ABCD").unwrap().setup.confirmation.high, 9.8);

    // 13:05 NY: the 12:00 bar closed as a green inside bar of its own
    clock.set(utc(18, 5));
    gateway
        .set_bars(
            "ABCD",
            vec![
                bar(15, 9.5, 10.0, 9.0, 9.4),
                bar(16, 9.3, 9.8, 9.2, 9.6),
                bar(17, 9.4, 9.7, 9.3, 9.6),
                bar(18, 9.6, 9.65, 9.5, 9.6),
            ],
        )
        .await;
    scheduler.poll_once().await.unwrap();

    let entry = scheduler.watchlist().get("ABCD").unwrap();
    assert_eq!(entry.state, EntryState::Candidate);
    assert_eq!(entry.setup.confirmation.timestamp, utc(17, 0));
    assert_eq!(entry.setup.confirmation.high, 9.7);
    assert_eq!(entry.setup.confirmation.low, 9.3);
    assert!(gateway.sent_orders().await.is_empty());
}

#[tokio::test]
async fn test_stale_candidate_is_retired_at_rollover() {
    let (gateway, clock, mut scheduler) = setup().await;
    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Candidate));

    // 13:05 NY: the 12:00 bar closed outside, and the forming bar clears the
    // old 9.80 inside-bar high
    clock.set(utc(18, 5));
    gateway
        .set_bars(
            "ABCD",
            vec![
                bar(15, 9.5, 10.0, 9.0, 9.4),
                bar(16, 9.3, 9.8, 9.2, 9.6),
                bar(17, 9.6, 9.9, 9.1, 9.5),
                bar(18, 9.5, 9.95, 9.4, 9.9),
            ],
        )
        .await;
    scheduler.poll_once().await.unwrap();

    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Expired));
    assert_eq!(scheduler.summary().candidates_retired, 1);
    assert!(gateway.sent_orders().await.is_empty());
}

#[tokio::test]
async fn test_candidate_waits_while_symbol_has_open_position() {
    let (gateway, _clock, mut scheduler) = setup().await;
    scheduler.poll_once().await.unwrap();

    gateway.set_position("ABCD", 100.0, 9.5).await;
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.9, 9.5, 9.88))).await;
    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Candidate));
    assert!(gateway.sent_orders().await.is_empty());

    // Position gone: the same breakout bar now triggers
    gateway.set_position("ABCD", 0.0, 0.0).await;
    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Breakout));
}

#[tokio::test]
async fn test_failing_symbol_does_not_block_others() {
    let gateway = PaperGateway::new();
    let clock = ManualClock::new(utc(17, 10));
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.7, 9.5, 9.65))).await;
    gateway.set_bars("WXYZ", inside_bar_history(bar(17, 9.6, 9.7, 9.5, 9.65))).await;
    let config = TraderConfig {
        static_symbols: vec!["ABCD".to_string(), "WXYZ".to_string()],
        ..config()
    };
    let mut scheduler = Scheduler::new(config, gateway.clone(), clock).unwrap();

    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().symbols_in(EntryState::Candidate).len(), 2);

    // WXYZ bar requests fail from here on while ABCD breaks out
    gateway.clear_bars("WXYZ").await;
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.9, 9.5, 9.88))).await;
    scheduler.poll_once().await.unwrap();

    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Breakout));
    assert_eq!(scheduler.watchlist().state("WXYZ"), Some(EntryState::Candidate));
    assert!(gateway.sent_orders().await.iter().all(|(symbol, _)| symbol == "ABCD"));
}

#[tokio::test]
async fn test_protected_entry_survives_rollover() {
    let gateway = PaperGateway::new();
    let clock = ManualClock::new(utc(17, 10));
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.7, 9.5, 9.65))).await;
    let config = TraderConfig { protected_symbols: vec!["ABCD".to_string()], ..config() };
    let mut scheduler = Scheduler::new(config, gateway.clone(), clock.clone()).unwrap();
    submit_bracket(&gateway, &mut scheduler).await;
    let entry_id = scheduler.watchlist().get("ABCD").and_then(|e| e.entry_order_id()).unwrap();

    clock.set(utc(18, 5));
    gateway
        .set_bars(
            "ABCD",
            vec![
                bar(15, 9.5, 10.0, 9.0, 9.4),
                bar(16, 9.3, 9.8, 9.2, 9.6),
                bar(17, 9.6, 9.8, 9.5, 9.7),
                bar(18, 9.7, 9.8, 9.6, 9.75),
            ],
        )
        .await;
    scheduler.poll_once().await.unwrap();

    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Breakout));
    assert!(gateway.cancelled_orders().await.is_empty());
    assert!(gateway.open_orders().await.unwrap().iter().any(|o| o.spec.order_id == entry_id));
    assert_eq!(scheduler.summary().entries_expired, 0);
}

#[tokio::test]
async fn test_entry_filled_after_missed_fill_sync_is_not_expired() {
    let (gateway, clock, mut scheduler) = setup().await;
    submit_bracket(&gateway, &mut scheduler).await;
    let entry_id = scheduler.watchlist().get("ABCD").and_then(|e| e.entry_order_id()).unwrap();
    gateway.fill_order(entry_id, 9.85).await.unwrap();

    // The fill sync at the top of the poll cannot read executions, so the
    // rollover is the first to see the entry gone from the open orders
    gateway.fail_next_fill_reads(1).await;
    clock.set(utc(18, 5));
    gateway
        .set_bars(
            "ABCD",
            vec![
                bar(15, 9.5, 10.0, 9.0, 9.4),
                bar(16, 9.3, 9.8, 9.2, 9.6),
                bar(17, 9.7, 9.95, 9.6, 9.9),
                bar(18, 9.9, 10.0, 9.85, 9.95),
            ],
        )
        .await;
    scheduler.poll_once().await.unwrap();

    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Filled));
    assert_eq!(scheduler.summary().entries_filled, 1);
    assert_eq!(scheduler.summary().entries_expired, 0);
}

#[tokio::test]
async fn test_transient_failure_retries_submission() {
    let (gateway, _clock, mut scheduler) = setup().await;
    scheduler.poll_once().await.unwrap();

    gateway.fail_next_calls(1).await;
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.9, 9.5, 9.88))).await;
    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Candidate));
    assert!(gateway.sent_orders().await.is_empty());

    // Bar unchanged; the queued retry re-evaluates anyway
    scheduler.poll_once().await.unwrap();
    assert_eq!(scheduler.watchlist().state("ABCD"), Some(EntryState::Breakout));
    assert_eq!(gateway.sent_orders().await.len(), 4);
}

#[tokio::test]
async fn test_rejected_bracket_invalidates() {
    let (gateway, _clock, mut scheduler) = setup().await;
    scheduler.poll_once().await.unwrap();

    gateway.reject_symbol("ABCD").await;
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.9, 9.5, 9.88))).await;
    scheduler.poll_once().await.unwrap();

    assert_eq!(
        scheduler.watchlist().state("ABCD"),
        Some(EntryState::Invalidated(InvalidationReason::OrderRejected))
    );
    assert_eq!(scheduler.summary().orders_rejected, 1);
}

#[tokio::test]
async fn test_liquidation_retries_until_flat() {
    let gateway = PaperGateway::new();
    // 15:56 NY, inside the liquidation window
    let clock = ManualClock::new(utc(20, 56));
    gateway.set_bars("ABCD", vec![bar(20, 9.9, 10.1, 9.8, 10.0)]).await;
    gateway.set_position("ABCD", 280.0, 9.85).await;
    gateway.stall_closing_orders(1).await;

    let mut scheduler = Scheduler::new(config(), gateway.clone(), clock).unwrap();
    let report = scheduler.run().await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Liquidated);
    assert_eq!(report.summary.liquidation_attempts, 2);
    assert_eq!(report.summary.total_commissions, 1.0);
    assert!(report.to_string().contains("Commissions paid: $1.00"));
    assert!(gateway.positions().await.unwrap().is_empty());
    assert!(!gateway.is_connected());
}

#[tokio::test]
async fn test_protected_symbol_survives_liquidation() {
    let gateway = PaperGateway::new();
    let clock = ManualClock::new(utc(20, 56));
    gateway.set_bars("ABCD", vec![bar(20, 9.9, 10.1, 9.8, 10.0)]).await;
    gateway.set_position("ABCD", 100.0, 9.85).await;
    gateway.set_position("SPY", 10.0, 500.0).await;

    let config = TraderConfig { protected_symbols: vec!["SPY".to_string()], ..config() };
    let mut scheduler = Scheduler::new(config, gateway.clone(), clock).unwrap();
    let report = scheduler.run().await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Liquidated);
    let positions = gateway.positions().await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].symbol, "SPY");
}

#[tokio::test]
async fn test_flat_book_liquidation_still_reports_commissions() {
    let gateway = PaperGateway::new();
    let clock = ManualClock::new(utc(20, 56));
    gateway.set_bars("ABCD", vec![bar(20, 9.9, 10.1, 9.8, 10.0)]).await;

    let mut scheduler = Scheduler::new(config(), gateway.clone(), clock).unwrap();
    let report = scheduler.run().await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::Liquidated);
    assert_eq!(report.summary.liquidation_attempts, 0);
    assert!(report.to_string().contains("Commissions paid: $0.00"));
}

#[tokio::test]
async fn test_too_early_does_nothing() {
    let gateway = PaperGateway::new();
    // 10:30 NY, before the 11:00 start
    let clock = ManualClock::new(utc(15, 30));
    gateway.set_bars("ABCD", inside_bar_history(bar(17, 9.6, 9.9, 9.5, 9.88))).await;

    let mut scheduler = Scheduler::new(config(), gateway.clone(), clock).unwrap();
    let report = scheduler.run().await.unwrap();

    assert_eq!(report.outcome, SessionOutcome::TooEarly);
    assert!(scheduler.watchlist().is_empty());
    assert!(gateway.sent_orders().await.is_empty());
    assert!(!gateway.is_connected());
}

#[tokio::test]
async fn test_lost_connection_ends_session() {
    let (gateway, _clock, mut scheduler) = setup().await;
    gateway.set_connected(false);

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::Disconnected);
    assert!(gateway.sent_orders().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_between_polls() {
    let (gateway, _clock, mut scheduler) = setup().await;
    scheduler.shutdown_handle().shutdown();

    let report = scheduler.run().await.unwrap();
    assert_eq!(report.outcome, SessionOutcome::Shutdown);
    assert!(gateway.sent_orders().await.is_empty());
}
