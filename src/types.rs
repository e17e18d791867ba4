// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

// =============================================================================
// Tick — immutable market-data snapshot
// =============================================================================

/// An immutable snapshot of a public ticker push. Never mutated after
/// construction; consumed by exactly one `HotLoop` per symbol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Tick {
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// `lastPrice > 0`, `bid <= ask` when both are present (> 0).
    pub fn is_valid(&self) -> bool {
        if !(self.last_price > 0.0) {
            return false;
        }
        if self.bid > 0.0 && self.ask > 0.0 && self.bid > self.ask {
            return false;
        }
        true
    }
}

// =============================================================================
// PriceWindow — bounded ring buffer of recent prices
// =============================================================================

/// Holds the most recent `N` prices for one symbol. Owned exclusively by the
/// `HotLoop` that maintains it — never shared.
#[derive(Debug, Clone)]
pub struct PriceWindow {
    prices: VecDeque<f64>,
    capacity: usize,
}

impl PriceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            prices: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Push a new price, evicting the oldest entry on overflow.
    pub fn push(&mut self, price: f64) {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    /// Prices oldest-first, as a contiguous slice-friendly `Vec`.
    pub fn as_vec(&self) -> Vec<f64> {
        self.prices.iter().copied().collect()
    }

    pub fn last(&self) -> Option<f64> {
        self.prices.back().copied()
    }

    /// The price `n` steps back from the most recent, if it exists
    /// (`nth_from_end(0)` is the latest price).
    pub fn nth_from_end(&self, n: usize) -> Option<f64> {
        let len = self.prices.len();
        if n >= len {
            return None;
        }
        self.prices.get(len - 1 - n).copied()
    }
}

// =============================================================================
// Agent reports and roles
// =============================================================================

/// Closed enumeration of agent specializations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Technical,
    Structure,
    Market,
    Sentiment,
    Risk,
    Momentum,
    Bull,
    Bear,
    Fundamentals,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Technical => "technical",
            Self::Structure => "structure",
            Self::Market => "market",
            Self::Sentiment => "sentiment",
            Self::Risk => "risk",
            Self::Momentum => "momentum",
            Self::Bull => "bull",
            Self::Bear => "bear",
            Self::Fundamentals => "fundamentals",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directional read produced by an agent or carried by an advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Bullish,
    Bearish,
    Neutral,
}

/// `{agentName, role, timestamp, signal, confidence, reasoning, payload}`.
/// Exactly one "latest" is retained per agent by the
/// `LeadCoordinator`; prior reports are discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_name: String,
    pub role: AgentRole,
    pub timestamp: DateTime<Utc>,
    pub signal: Signal,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AgentReport {
    /// The fallback report used whenever an agent cycle fails for any
    /// reason.
    pub fn neutral_error(agent_name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            agent_name: agent_name.into(),
            role,
            timestamp: Utc::now(),
            signal: Signal::Neutral,
            confidence: 0.5,
            reasoning: "error".to_string(),
            payload: serde_json::Value::Null,
        }
    }
}

// =============================================================================
// Advisory
// =============================================================================

/// Action recommended by the most recent `Advisory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Long,
    Short,
    Hold,
    Close,
}

/// One vote contributed by an agent toward the synthesized advisory;
/// embedded in `Advisory.agentVotes` for audit/dashboard purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVote {
    pub agent_name: String,
    pub signal: Signal,
    pub confidence: f64,
}

/// `{action, confidence, positionSizeHint, stopLossPct, takeProfitPct,
/// reasoning, generatedAt, agentVotes}`. Produced by the
/// `LeadCoordinator` once per decision cycle; the `HotLoop` only ever sees
/// the most recent one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advisory {
    pub action: Action,
    pub confidence: f64,
    pub position_size_hint: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub reasoning: String,
    pub generated_at: DateTime<Utc>,
    pub agent_votes: Vec<AgentVote>,
}

impl Advisory {
    /// Fallback advisory used when the coordinator cycle fails to parse a
    /// structured response.
    pub fn hold_error() -> Self {
        Self {
            action: Action::Hold,
            confidence: 0.5,
            position_size_hint: 0.005,
            stop_loss_pct: 0.0,
            take_profit_pct: 0.0,
            reasoning: "error".to_string(),
            generated_at: Utc::now(),
            agent_votes: Vec::new(),
        }
    }

    /// `now - generatedAt > decayWindow`.
    pub fn is_stale(&self, now: DateTime<Utc>, decay_window: chrono::Duration) -> bool {
        now.signed_duration_since(self.generated_at) > decay_window
    }
}

// =============================================================================
// Position
// =============================================================================

/// Long or short side of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

/// `{symbol, side, size, entryPrice}` or absent. Mutated by the
/// `HotLoop` after a successful fill (optimistic) and overwritten
/// authoritatively by `reconcile()`. At most one per symbol per `HotLoop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
}

// =============================================================================
// Side-code table
// =============================================================================

/// Intended trading direction a `HotLoop` wants to act on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Long,
    Short,
    Close,
}

/// Current position side as seen by the side-code table: `None` means flat.
pub type CurrentSide = Option<Side>;

/// Venue-specific integer code: `1=open-long, 2=close-short, 3=open-short,
/// 4=close-long`. `None` denotes a no-op (e.g. `close` while already flat).
///
/// Declared mapping, exhaustively covering all 8 `(direction, position)`
/// cases — replaces the source's ad-hoc `if/else` chain.
pub fn side_code(direction: Direction, position: CurrentSide) -> Option<u8> {
    match (direction, position) {
        (Direction::Long, None) => Some(1),
        (Direction::Long, Some(Side::Short)) => Some(2),
        (Direction::Long, Some(Side::Long)) => None, // already long, no-op
        (Direction::Short, None) => Some(3),
        (Direction::Short, Some(Side::Long)) => Some(4),
        (Direction::Short, Some(Side::Short)) => None, // already short, no-op
        (Direction::Close, Some(Side::Long)) => Some(4),
        (Direction::Close, Some(Side::Short)) => Some(2),
        (Direction::Close, None) => None, // close from flat is a no-op
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_validity() {
        let t = Tick {
            last_price: 100.0,
            bid: 99.0,
            ask: 101.0,
            volume_24h: 1.0,
            timestamp: Utc::now(),
        };
        assert!(t.is_valid());

        let bad_price = Tick {
            last_price: 0.0,
            ..t
        };
        assert!(!bad_price.is_valid());

        let bad_spread = Tick {
            bid: 101.0,
            ask: 99.0,
            ..t
        };
        assert!(!bad_spread.is_valid());
    }

    #[test]
    fn price_window_bounded_eviction() {
        let mut w = PriceWindow::new(3);
        for p in [1.0, 2.0, 3.0, 4.0, 5.0] {
            w.push(p);
        }
        assert_eq!(w.len(), 3);
        assert_eq!(w.as_vec(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn price_window_len_equals_min_ticks_seen_and_capacity() {
        let mut w = PriceWindow::new(100);
        for i in 0..10 {
            w.push(i as f64);
        }
        assert_eq!(w.len(), 10);
        for i in 10..150 {
            w.push(i as f64);
        }
        assert_eq!(w.len(), 100);
    }

    #[test]
    fn price_window_nth_from_end() {
        let mut w = PriceWindow::new(5);
        for p in [10.0, 20.0, 30.0] {
            w.push(p);
        }
        assert_eq!(w.nth_from_end(0), Some(30.0));
        assert_eq!(w.nth_from_end(2), Some(10.0));
        assert_eq!(w.nth_from_end(3), None);
    }

    #[test]
    fn advisory_staleness() {
        let now = Utc::now();
        let mut adv = Advisory::hold_error();
        adv.generated_at = now - chrono::Duration::seconds(120);
        assert!(adv.is_stale(now, chrono::Duration::seconds(60)));

        adv.generated_at = now - chrono::Duration::seconds(10);
        assert!(!adv.is_stale(now, chrono::Duration::seconds(60)));
    }

    #[test]
    fn side_code_table_exhaustive() {
        assert_eq!(side_code(Direction::Long, None), Some(1));
        assert_eq!(side_code(Direction::Long, Some(Side::Short)), Some(2));
        assert_eq!(side_code(Direction::Long, Some(Side::Long)), None);
        assert_eq!(side_code(Direction::Short, None), Some(3));
        assert_eq!(side_code(Direction::Short, Some(Side::Long)), Some(4));
        assert_eq!(side_code(Direction::Short, Some(Side::Short)), None);
        assert_eq!(side_code(Direction::Close, Some(Side::Long)), Some(4));
        assert_eq!(side_code(Direction::Close, Some(Side::Short)), Some(2));
        assert_eq!(side_code(Direction::Close, None), None);
    }

    #[test]
    fn side_code_round_trip_examples() {
        // Round-trip / idempotence examples.
        assert_eq!(side_code(Direction::Long, None), Some(1));
        assert_eq!(side_code(Direction::Long, Some(Side::Short)), Some(2));
        assert_eq!(side_code(Direction::Short, None), Some(3));
        assert_eq!(side_code(Direction::Short, Some(Side::Long)), Some(4));
        assert_eq!(side_code(Direction::Close, Some(Side::Long)), Some(4));
        assert_eq!(side_code(Direction::Close, Some(Side::Short)), Some(2));
    }
}
