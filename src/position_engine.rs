// =============================================================================
// Position Engine — tracks at most one open position per symbol
// =============================================================================
//
// Position model is intentionally minimal: `{symbol, side, size,
// entryPrice}`. There is no partial-close or trailing-stop lifecycle here —
// the `HotLoop`'s algorithm only ever opens, flips, or fully
// closes a position in a single exchange order, dispatched via the
// side-code table in `types::side_code`.
//
// A bounded journal of closed positions is kept for the dashboard and for
// `RiskEngine::record_trade_result` diagnostics; it is not part of the
// spec's data model but has no behavioural effect on trading decisions.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Position, Side};

/// Maximum number of closed positions retained in the in-memory journal.
const CLOSED_JOURNAL_CAPACITY: usize = 200;

/// A completed trade, recorded purely for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub closed_at: DateTime<Utc>,
    pub reason: String,
}

/// Thread-safe manager enforcing "at most one open position per symbol".
pub struct PositionEngine {
    open: RwLock<HashMap<String, Position>>,
    closed: RwLock<VecDeque<ClosedPosition>>,
}

impl PositionEngine {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(VecDeque::new()),
        }
    }

    /// Current position for `symbol`, if any.
    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.open.read().get(symbol).cloned()
    }

    /// Replace (or create) the open position for `symbol`. Used both to
    /// open a fresh position and to record a flip (close-then-open dispatched
    /// as a single exchange order via `side_code`).
    ///
    /// Panics if a position already exists for `symbol` and `allow_replace`
    /// is `false` — the one-position-per-symbol invariant is a programming
    /// error to violate, not a recoverable condition.
    pub fn set(&self, position: Position, allow_replace: bool) {
        let mut open = self.open.write();
        if !allow_replace && open.contains_key(&position.symbol) {
            panic!(
                "PositionEngine invariant violated: attempted to open a second \
                 position for symbol {} without closing the first",
                position.symbol
            );
        }
        info!(
            symbol = %position.symbol,
            side = ?position.side,
            size = position.size,
            entry_price = position.entry_price,
            "position set"
        );
        open.insert(position.symbol.clone(), position);
    }

    /// Fully close the open position for `symbol` at `exit_price`, moving it
    /// into the bounded closed-position journal. Returns the realized PnL,
    /// or `None` if no position was open for `symbol`.
    pub fn close(&self, symbol: &str, exit_price: f64, reason: &str) -> Option<f64> {
        let position = self.open.write().remove(symbol)?;

        let direction = match position.side {
            Side::Long => 1.0,
            Side::Short => -1.0,
        };
        let realized_pnl = direction * (exit_price - position.entry_price) * position.size;

        info!(
            symbol,
            side = ?position.side,
            size = position.size,
            entry_price = position.entry_price,
            exit_price,
            realized_pnl,
            reason,
            "position closed"
        );

        let mut closed = self.closed.write();
        if closed.len() >= CLOSED_JOURNAL_CAPACITY {
            closed.pop_front();
        }
        closed.push_back(ClosedPosition {
            symbol: symbol.to_string(),
            side: position.side,
            size: position.size,
            entry_price: position.entry_price,
            exit_price,
            realized_pnl,
            closed_at: Utc::now(),
            reason: reason.to_string(),
        });

        Some(realized_pnl)
    }

    /// Unrealized PnL of the open position for `symbol` at `current_price`,
    /// or `0.0` if flat.
    pub fn unrealized_pnl(&self, symbol: &str, current_price: f64) -> f64 {
        match self.open.read().get(symbol) {
            Some(pos) => {
                let direction = match pos.side {
                    Side::Long => 1.0,
                    Side::Short => -1.0,
                };
                direction * (current_price - pos.entry_price) * pos.size
            }
            None => 0.0,
        }
    }

    /// Snapshot of every currently open position, across all symbols.
    pub fn open_positions(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    /// Most recent `count` closed positions (newest first).
    pub fn closed_positions(&self, count: usize) -> Vec<ClosedPosition> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }
}

impl Default for PositionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionEngine")
            .field("open_positions", &self.open.read().len())
            .field("closed_positions", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn long_position(symbol: &str, entry: f64, size: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: Side::Long,
            size,
            entry_price: entry,
        }
    }

    #[test]
    fn open_then_query() {
        let engine = PositionEngine::new();
        engine.set(long_position("BTC-USDT-PERP", 88000.0, 0.01), false);
        let pos = engine.get("BTC-USDT-PERP").unwrap();
        assert_eq!(pos.side, Side::Long);
        assert!((pos.entry_price - 88000.0).abs() < 1e-9);
    }

    #[test]
    #[should_panic(expected = "invariant violated")]
    fn opening_twice_without_close_panics() {
        let engine = PositionEngine::new();
        engine.set(long_position("BTC-USDT-PERP", 88000.0, 0.01), false);
        engine.set(long_position("BTC-USDT-PERP", 89000.0, 0.01), false);
    }

    #[test]
    fn flip_replaces_existing_position() {
        let engine = PositionEngine::new();
        engine.set(long_position("BTC-USDT-PERP", 88000.0, 0.01), false);
        let flipped = Position {
            symbol: "BTC-USDT-PERP".to_string(),
            side: Side::Short,
            size: 0.01,
            entry_price: 89000.0,
        };
        engine.set(flipped, true);
        let pos = engine.get("BTC-USDT-PERP").unwrap();
        assert_eq!(pos.side, Side::Short);
    }

    #[test]
    fn close_realizes_pnl_and_clears_open_slot() {
        let engine = PositionEngine::new();
        engine.set(long_position("BTC-USDT-PERP", 88000.0, 0.02), false);
        let pnl = engine.close("BTC-USDT-PERP", 89000.0, "TakeProfit").unwrap();
        assert!((pnl - 20.0).abs() < 1e-9);
        assert!(engine.get("BTC-USDT-PERP").is_none());
        assert_eq!(engine.closed_positions(10).len(), 1);
    }

    #[test]
    fn close_on_flat_symbol_returns_none() {
        let engine = PositionEngine::new();
        assert!(engine.close("BTC-USDT-PERP", 89000.0, "noop").is_none());
    }

    #[test]
    fn unrealized_pnl_short_direction() {
        let engine = PositionEngine::new();
        engine.set(
            Position {
                symbol: "BTC-USDT-PERP".to_string(),
                side: Side::Short,
                size: 0.01,
                entry_price: 89000.0,
            },
            false,
        );
        // Price fell; short position profits.
        let pnl = engine.unrealized_pnl("BTC-USDT-PERP", 88000.0);
        assert!((pnl - 10.0).abs() < 1e-9);
    }

    #[test]
    fn closed_journal_is_bounded() {
        let engine = PositionEngine::new();
        for i in 0..(CLOSED_JOURNAL_CAPACITY + 10) {
            engine.set(long_position("BTC-USDT-PERP", 100.0, 0.01), false);
            engine.close("BTC-USDT-PERP", 100.0 + i as f64, "cycle");
        }
        assert_eq!(engine.closed_positions(10_000).len(), CLOSED_JOURNAL_CAPACITY);
    }
}
