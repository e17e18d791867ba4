// =============================================================================
// HotLoop — per-symbol tick consumer, order dispatcher
// =============================================================================
//
// Exactly one per symbol, not thread-safe: `PriceWindow`, the cooldown
// clock, and the tick counter are plain fields mutated in place by the
// single task that owns this loop, and are never shared with another
// task. The loop performs zero language-model calls and at most one
// exchange REST call per tick (order placement), plus an occasional
// position-reconciliation call.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::coordinator::LeadCoordinator;
use crate::exchange::client::ExchangeClient;
use crate::indicators::rsi::calculate_rsi;
use crate::market_data::MarketDataFeed;
use crate::position_engine::PositionEngine;
use crate::risk::{RiskEngine, RiskStateUpdate};
use crate::runtime_config::{ConfigHandle, TradingModeHandle};
use crate::signals::combiner::combine;
use crate::types::{Action, Advisory, Direction, Position, PriceWindow, Side, Tick, TradingMode};

/// AI-bias magnification applied to the local signal.
const BIAS_WEIGHT: f64 = 0.15;
/// One status line printed roughly every 20 ticks (~5%).
const LOG_SAMPLE_EVERY: u64 = 20;
/// Position reconciliation refreshed every this-many ticks, in addition to
/// the mandatory startup reconciliation.
const RECONCILE_EVERY_TICKS: u64 = 200;
const RSI_PERIOD: usize = 14;
const SIZE_PRECISION_DECIMALS: i32 = 5;
/// How often the loop checks whether the feed has gone stale and needs a
/// one-off REST fallback tick.
const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

pub struct HotLoop {
    symbol: String,
    feed: Arc<MarketDataFeed>,
    coordinator: Arc<LeadCoordinator>,
    exchange: Arc<ExchangeClient>,
    risk: Arc<RiskEngine>,
    positions: Arc<PositionEngine>,
    config: ConfigHandle,
    trading_mode: TradingModeHandle,
    price_window: PriceWindow,
    last_order_at: Option<DateTime<Utc>>,
    tick_count: u64,
    stop_flag: Arc<AtomicBool>,
}

impl HotLoop {
    pub fn new(
        symbol: impl Into<String>,
        feed: Arc<MarketDataFeed>,
        coordinator: Arc<LeadCoordinator>,
        exchange: Arc<ExchangeClient>,
        risk: Arc<RiskEngine>,
        positions: Arc<PositionEngine>,
        config: ConfigHandle,
        trading_mode: TradingModeHandle,
    ) -> Self {
        let price_window_capacity = config.read().price_window_capacity;
        Self {
            symbol: symbol.into(),
            feed,
            coordinator,
            exchange,
            risk,
            positions,
            config,
            trading_mode,
            price_window: PriceWindow::new(price_window_capacity),
            last_order_at: None,
            tick_count: 0,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A clone of the stop flag, for the `Supervisor` to signal shutdown
    /// without holding on to the loop itself (which is consumed by `run`).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop_flag.clone()
    }

    /// Consume the tick stream and dispatch orders until stopped. Intended
    /// to be spawned as its own task by the `Supervisor`.
    pub async fn run(mut self) {
        info!(symbol = %self.symbol, "hot loop started");
        self.reconcile().await;

        let mut ticks = self.feed.subscribe();
        let mut stale_check = tokio::time::interval(STALE_CHECK_INTERVAL);

        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }

            let tick = tokio::select! {
                res = ticks.recv() => match res {
                    Ok(tick) => tick,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(symbol = %self.symbol, skipped, "hot loop lagged behind tick stream");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = stale_check.tick() => {
                    match self.fetch_fallback_tick().await {
                        Some(tick) => tick,
                        None => continue,
                    }
                }
                _ = wait_for_stop(&self.stop_flag) => break,
            };

            self.tick_count += 1;
            if self.tick_count % RECONCILE_EVERY_TICKS == 0 {
                self.reconcile().await;
            }

            self.handle_tick(tick).await;
        }

        info!(symbol = %self.symbol, "hot loop stopped");
    }

    async fn handle_tick(&mut self, tick: Tick) {
        if !tick.is_valid() {
            return;
        }

        // Step 1.
        self.price_window.push(tick.last_price);

        let config = self.config.read().clone();
        let now = Utc::now();

        // Step 2.
        let advisory = self.coordinator.latest_advisory();
        let decay_window = chrono::Duration::seconds(config.decay_window_seconds);
        let (effective_confidence, effective_action) = match &advisory {
            Some(a) if !a.is_stale(now, decay_window) => (a.confidence, a.action),
            _ => (0.0, Action::Hold),
        };

        // Step 3.
        let depth = self.feed.orderbook().get(&self.symbol);
        let local_signal = combine(&self.price_window, depth.as_ref(), &config);
        let bias_strength = match effective_action {
            Action::Long => effective_confidence,
            Action::Short => -effective_confidence,
            Action::Hold | Action::Close => 0.0,
        };
        let adjusted_signal = local_signal + BIAS_WEIGHT * bias_strength;

        // Step 4.
        let confirmed = local_confirmation(effective_action, effective_confidence, &self.price_window);

        if self.tick_count % LOG_SAMPLE_EVERY == 0 {
            info!(
                symbol = %self.symbol,
                price = tick.last_price,
                local_signal,
                adjusted_signal,
                effective_confidence,
                confirmed,
                "hot loop status"
            );
        }

        let direction = match effective_action {
            Action::Long => Direction::Long,
            Action::Short => Direction::Short,
            Action::Close => Direction::Close,
            Action::Hold => return,
        };

        // Step 5 (cooldown) folded into the gate below, alongside the
        // confidence/confirmation/threshold gates of step 6.
        if !confirmed {
            return;
        }
        if effective_confidence < config.min_confidence {
            return;
        }
        if adjusted_signal.abs() < config.signal_threshold {
            return;
        }
        if !cooldown_elapsed(self.last_order_at, now, config.cooldown_seconds as i64) {
            return;
        }

        if *self.trading_mode.read() != TradingMode::Live {
            return;
        }

        let current_position = self.positions.get(&self.symbol);
        let current_side = current_position.as_ref().map(|p| p.side);

        let Some(side_code) = crate::types::side_code(direction, current_side) else {
            return;
        };

        let (size, side_for_risk) = match side_code {
            1 => (compute_size(self.risk.status().equity, config.risk_per_trade, tick.last_price, config.max_position_size), Side::Long),
            3 => (compute_size(self.risk.status().equity, config.risk_per_trade, tick.last_price, config.max_position_size), Side::Short),
            2 => (current_position.as_ref().map(|p| p.size).unwrap_or(0.0), Side::Long),
            4 => (current_position.as_ref().map(|p| p.size).unwrap_or(0.0), Side::Short),
            _ => unreachable!("side_code table only ever yields 1..=4"),
        };

        if size <= 0.0 {
            return;
        }

        // Step 7.
        if !self.risk.can_trade(side_for_risk, size, tick.last_price) {
            return;
        }

        // Step 8.
        match self.exchange.place_order(&self.symbol, side_code, size).await {
            Ok(_) => {
                self.last_order_at = Some(now);
                self.apply_optimistic_fill(side_code, size, tick.last_price);
            }
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, side_code, size, "order placement failed");
            }
        }
    }

    fn apply_optimistic_fill(&mut self, side_code: u8, size: f64, price: f64) {
        let signed_delta = match side_code {
            1 | 2 => size,
            3 | 4 => -size,
            _ => 0.0,
        };
        let projected_position_size = self.risk.status().position_size + signed_delta;
        self.risk.update_state(RiskStateUpdate {
            position_size: Some(projected_position_size),
            ..Default::default()
        });

        match side_code {
            1 => self.positions.set(Position { symbol: self.symbol.clone(), side: Side::Long, size, entry_price: price }, true),
            3 => self.positions.set(Position { symbol: self.symbol.clone(), side: Side::Short, size, entry_price: price }, true),
            2 | 4 => {
                if let Some(pnl) = self.positions.close(&self.symbol, price, "signal") {
                    self.risk.record_trade_result(pnl);
                }
            }
            _ => {}
        }
    }

    /// §4.1: when `latest()` is stale (the WS link has gone quiet, possibly
    /// degraded), fetch a single tick via the REST client on demand rather
    /// than leaving the loop idle indefinitely.
    async fn fetch_fallback_tick(&self) -> Option<Tick> {
        if !self.feed.is_stale() {
            return None;
        }

        match self.exchange.get_ticker(&self.symbol).await {
            Ok(snapshot) => {
                let tick = Tick {
                    last_price: snapshot.last,
                    bid: snapshot.bid.unwrap_or(0.0),
                    ask: snapshot.ask.unwrap_or(0.0),
                    volume_24h: snapshot.vol.unwrap_or(0.0),
                    timestamp: Utc::now(),
                };
                if tick.is_valid() {
                    Some(tick)
                } else {
                    None
                }
            }
            Err(err) => {
                warn!(symbol = %self.symbol, error = %err, "REST fallback tick fetch failed");
                None
            }
        }
    }

    async fn reconcile(&self) {
        match self.exchange.get_positions().await {
            Ok(remote) => {
                let mine = remote.into_iter().find(|p| p.symbol == self.symbol);
                match mine {
                    Some(p) => self.positions.set(
                        Position { symbol: self.symbol.clone(), side: p.hold_side, size: p.total, entry_price: p.average_open_price },
                        true,
                    ),
                    None => {
                        if let Some(local) = self.positions.get(&self.symbol) {
                            self.positions.close(&self.symbol, local.entry_price, "reconciled-flat");
                        }
                    }
                }
            }
            Err(err) => warn!(symbol = %self.symbol, error = %err, "position reconciliation failed"),
        }

        match self.exchange.get_assets().await {
            Ok(assets) => {
                let equity: f64 = assets.iter().map(|a| a.equity).sum();
                let position_size = self
                    .positions
                    .get(&self.symbol)
                    .map(|p| match p.side {
                        Side::Long => p.size,
                        Side::Short => -p.size,
                    })
                    .unwrap_or(0.0);
                self.risk.update_state(RiskStateUpdate { equity: Some(equity), position_size: Some(position_size), open_orders: None });
            }
            Err(err) => warn!(symbol = %self.symbol, error = %err, "equity reconciliation failed"),
        }
    }
}

async fn wait_for_stop(flag: &AtomicBool) {
    loop {
        if flag.load(Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Step 4: for `long`, require `effective > 0.7` OR local RSI below 70;
/// mirrored for `short` (RSI above 30). `close` is always confirmed;
/// `hold` never dispatches regardless.
fn local_confirmation(action: Action, effective_confidence: f64, price_window: &PriceWindow) -> bool {
    let rsi = calculate_rsi(&price_window.as_vec(), RSI_PERIOD).last().copied();
    match action {
        Action::Long => effective_confidence > 0.7 || rsi.is_some_and(|r| r < 70.0),
        Action::Short => effective_confidence > 0.7 || rsi.is_some_and(|r| r > 30.0),
        Action::Close => true,
        Action::Hold => false,
    }
}

/// `true` once `cooldown_seconds` have passed since `last_order_at` (or if
/// no order has ever been placed). The comparison is strict `<`, so a gap
/// exactly equal to the cooldown already passes.
fn cooldown_elapsed(last_order_at: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown_seconds: i64) -> bool {
    match last_order_at {
        Some(last) => now.signed_duration_since(last) >= chrono::Duration::seconds(cooldown_seconds),
        None => true,
    }
}

/// `equity * riskPerTrade / price`, clamped to `maxPositionSize`, rounded to
/// 5 decimal places.
fn compute_size(equity: f64, risk_per_trade: f64, price: f64, max_position_size: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    let raw = (equity * risk_per_trade / price).min(max_position_size).max(0.0);
    let factor = 10f64.powi(SIZE_PRECISION_DECIMALS);
    (raw * factor).round() / factor
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_size_is_price_scaled_and_clamped() {
        let size = compute_size(1000.0, 0.02, 88000.0, 0.05);
        assert!((size - 0.00023).abs() < 1e-5);
        assert!(size <= 0.05);
    }

    #[test]
    fn compute_size_clamps_to_max_position_size() {
        let size = compute_size(1_000_000.0, 0.5, 1.0, 0.05);
        assert!((size - 0.05).abs() < 1e-9);
    }

    #[test]
    fn local_confirmation_long_passes_on_high_confidence_alone() {
        let mut window = PriceWindow::new(30);
        for p in [100.0; 5] {
            window.push(p);
        }
        assert!(local_confirmation(Action::Long, 0.9, &window));
    }

    #[test]
    fn local_confirmation_hold_never_confirms() {
        let window = PriceWindow::new(30);
        assert!(!local_confirmation(Action::Hold, 0.9, &window));
    }

    #[test]
    fn local_confirmation_close_always_confirms() {
        let window = PriceWindow::new(30);
        assert!(local_confirmation(Action::Close, 0.0, &window));
    }

    #[test]
    fn side_code_derives_order_direction_and_risk_side() {
        assert_eq!(crate::types::side_code(Direction::Long, None), Some(1));
        assert_eq!(crate::types::side_code(Direction::Short, Some(Side::Long)), Some(4));
    }

    #[test]
    fn cooldown_boundary_matches_contract() {
        let last = Utc::now();
        let just_under = last + chrono::Duration::milliseconds(4999);
        let just_over = last + chrono::Duration::milliseconds(5001);
        assert!(!cooldown_elapsed(Some(last), just_under, 5));
        assert!(cooldown_elapsed(Some(last), just_over, 5));
        assert!(cooldown_elapsed(None, last, 5));
    }

    /// Bullish consensus, flat position, breaker armed (spec scenario 1):
    /// a 50-tick rising window plus a 100/50 bid/ask book nets a positive
    /// local signal, the side table opens sideCode=1, and position sizing
    /// scales with equity and clamps to `maxPositionSize`.
    #[test]
    fn scenario_bullish_consensus_flat_position_opens_long() {
        let mut window = PriceWindow::new(50);
        for i in 0..50 {
            window.push(87000.0 + 1000.0 * (i as f64) / 49.0);
        }
        let depth = crate::market_data::Depth { bids: vec![(88000.0, 100.0)], asks: vec![(88001.0, 50.0)] };
        let config = crate::runtime_config::TradingConfig::default();

        let signal = combine(&window, Some(&depth), &config);
        assert!(signal > 0.0, "rising window with bid-heavy book should net a bullish signal");

        let side_code = crate::types::side_code(Direction::Long, None).unwrap();
        assert_eq!(side_code, 1);

        let size = compute_size(1000.0, 0.02, 88000.0, 0.05);
        assert!((size - 0.00023).abs() < 1e-5);
    }

    /// Opposing position reversal (spec scenario 4): a long position facing
    /// a short advisory first closes (sideCode=4, sized to the existing
    /// position) and, once flat, the next qualifying tick opens short
    /// (sideCode=3).
    #[test]
    fn scenario_opposing_position_reversal_closes_then_opens() {
        let closing_side = crate::types::side_code(Direction::Short, Some(Side::Long)).unwrap();
        assert_eq!(closing_side, 4);

        let now_flat: Option<Side> = None;
        let opening_side = crate::types::side_code(Direction::Short, now_flat).unwrap();
        assert_eq!(opening_side, 3);
    }

    /// Cooldown gate on two bullish ticks (spec scenario 6): a 3s gap with a
    /// 5s cooldown blocks the second tick; a 6s gap clears it.
    #[test]
    fn scenario_cooldown_blocks_3s_gap_allows_6s_gap() {
        let first = Utc::now();
        let three_seconds_later = first + chrono::Duration::seconds(3);
        let six_seconds_later = first + chrono::Duration::seconds(6);

        assert!(!cooldown_elapsed(Some(first), three_seconds_later, 5));
        assert!(cooldown_elapsed(Some(first), six_seconds_later, 5));
    }
}
