// =============================================================================
// Central Application State — dashboard-facing snapshot of the engine
// =============================================================================
//
// The single source of truth the dashboard API reads from. `AppState` does
// not drive trading decisions itself — it only holds `Arc`/handle references
// to the components the `Supervisor` already spawned (one `SymbolHandles`
// per symbol) plus the few purely observational fields (balances, recent
// errors, WebSocket bookkeeping) that have no other natural home.
//
// Thread safety: atomic counters for lock-free version tracking,
// `parking_lot::RwLock` for the handful of mutable collections, `Arc`
// wrappers for subsystem engines that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::exchange::client::{AssetBalance, ExchangeClient};
use crate::position_engine::{ClosedPosition, PositionEngine};
use crate::risk::RiskDiagnostics;
use crate::runtime_config::{ConfigHandle, TradingModeHandle};
use crate::supervisor::SymbolHandles;
use crate::types::{AccountMode, Action, AgentVote, Position};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Human-readable error message.
    pub message: String,
    /// Optional machine-readable error code (e.g. an exchange error code).
    pub code: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

// =============================================================================
// AppState
// =============================================================================

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Number of closed positions pulled from `PositionEngine` for journal stats.
const JOURNAL_WINDOW: usize = 500;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Monotonically increasing version counter. Incremented on every
    /// meaningful state mutation. The WebSocket feed uses this to detect
    /// changes and push updates.
    pub state_version: AtomicU64,
    /// WebSocket message sequence number (incremented per message sent).
    pub ws_sequence_number: AtomicU64,

    // ── Configuration / mode ────────────────────────────────────────────
    pub account_mode: RwLock<AccountMode>,
    pub symbols: Vec<String>,
    pub max_concurrent_positions: u32,
    pub trading_config: ConfigHandle,
    pub trading_mode: TradingModeHandle,

    // ── Core engine handles ─────────────────────────────────────────────
    pub exchange: Arc<ExchangeClient>,
    pub positions: Arc<PositionEngine>,
    /// Populated once by `Supervisor::run`'s return value; empty until then.
    pub symbol_handles: RwLock<Vec<SymbolHandles>>,

    // ── Account ──────────────────────────────────────────────────────────
    pub balances: RwLock<Vec<AssetBalance>>,

    // ── Error Log ────────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    // ── WebSocket bookkeeping ────────────────────────────────────────────
    pub ws_user_connected: RwLock<bool>,
    pub last_ws_user_event: RwLock<Instant>,

    // ── Timing ───────────────────────────────────────────────────────────
    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        account_mode: AccountMode,
        symbols: Vec<String>,
        max_concurrent_positions: u32,
        trading_config: ConfigHandle,
        trading_mode: TradingModeHandle,
        exchange: Arc<ExchangeClient>,
        positions: Arc<PositionEngine>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            ws_sequence_number: AtomicU64::new(0),

            account_mode: RwLock::new(account_mode),
            symbols,
            max_concurrent_positions,
            trading_config,
            trading_mode,

            exchange,
            positions,
            symbol_handles: RwLock::new(Vec::new()),

            balances: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),

            ws_user_connected: RwLock::new(false),
            last_ws_user_event: RwLock::new(Instant::now()),

            start_time: Instant::now(),
        }
    }

    /// Record the live `SymbolHandles` once `Supervisor::run` has wired and
    /// spawned every symbol's graph.
    pub fn set_symbol_handles(&self, handles: Vec<SymbolHandles>) {
        *self.symbol_handles.write() = handles;
        self.increment_version();
    }

    // ── Version Management ──────────────────────────────────────────────

    /// Atomically increment the state version. Call this after every
    /// meaningful mutation to signal WebSocket clients that fresh data is
    /// available.
    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Read the current state version without modifying it.
    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ────────────────────────────────────────────────────

    /// Record an error message. The ring buffer is capped at
    /// [`MAX_RECENT_ERRORS`]; oldest entries are evicted when the limit is
    /// reached.
    pub fn push_error(&self, msg: String) {
        self.push_error_with_code(msg, None);
    }

    /// Record an error with an optional machine-readable code.
    pub fn push_error_with_code(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord { message: msg, code, at: Utc::now().to_rfc3339() };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }

        self.increment_version();
    }

    // ── Account ──────────────────────────────────────────────────────────

    pub fn set_balances(&self, balances: Vec<AssetBalance>) {
        *self.balances.write() = balances;
        self.increment_version();
    }

    // ── Snapshot Builder ─────────────────────────────────────────────────

    /// Build a complete, serialisable snapshot of the entire engine state.
    /// This is the payload sent to the dashboard via the REST
    /// `GET /api/v1/state` endpoint and the WebSocket push feed.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let now = Utc::now();
        let version = self.current_state_version();

        let truth = TruthHeader {
            ws_mode: "combined".to_string(),
            ws_user_connected: *self.ws_user_connected.read(),
            last_ws_user_event_age_ms: self.last_ws_user_event.read().elapsed().as_millis() as u64,
            state_version: version,
            ws_sequence_number: self.ws_sequence_number.load(Ordering::Relaxed),
            trading_mode: self.trading_mode.read().to_string(),
            account_mode: self.account_mode.read().to_string(),
            server_time: now.timestamp_millis(),
        };

        let symbols = self
            .symbol_handles
            .read()
            .iter()
            .map(|h| symbol_snapshot(h, now))
            .collect();

        let positions = self.positions.open_positions();
        let closed_positions = self.positions.closed_positions(JOURNAL_WINDOW);
        let journal_stats = journal_stats(&closed_positions);

        let balances = self.balances.read().clone();
        let recent_errors = self.recent_errors.read().clone();

        StateSnapshot {
            state_version: version,
            server_time: now.timestamp_millis(),
            truth,
            symbols,
            positions,
            closed_positions,
            balances,
            recent_errors,
            journal_stats,
        }
    }
}

fn symbol_snapshot(handles: &SymbolHandles, now: DateTime<Utc>) -> SymbolSnapshot {
    let tick = handles.feed.latest();
    let risk_state = handles.risk.status();
    let advisory = handles.coordinator.latest_advisory().map(|a| AdvisorySnapshot {
        action: action_str(a.action).to_string(),
        confidence: a.confidence,
        position_size_hint: a.position_size_hint,
        stop_loss_pct: a.stop_loss_pct,
        take_profit_pct: a.take_profit_pct,
        reasoning: a.reasoning,
        generated_at: a.generated_at,
        agent_votes: a.agent_votes,
        stale: now.signed_duration_since(a.generated_at) > chrono::Duration::minutes(5),
    });

    let spread_bps = handles.feed.orderbook().get(&handles.symbol).and_then(|d| d.spread_bps());

    SymbolSnapshot {
        symbol: handles.symbol.clone(),
        last_price: tick.map(|t| t.last_price),
        feed_degraded: handles.feed.is_degraded(),
        feed_stale: handles.feed.is_stale(),
        spread_bps,
        risk: RiskSnapshot {
            tripped: risk_state.tripped,
            trip_reason: risk_state.trip_reason,
            equity: risk_state.equity,
            peak_equity: risk_state.peak_equity,
            daily_pnl: risk_state.daily_pnl,
            position_size: risk_state.position_size,
            open_orders: risk_state.open_orders,
            diagnostics: risk_state.diagnostics,
        },
        advisory,
    }
}

fn action_str(action: Action) -> &'static str {
    match action {
        Action::Long => "long",
        Action::Short => "short",
        Action::Hold => "hold",
        Action::Close => "close",
    }
}

fn journal_stats(closed: &[ClosedPosition]) -> Option<JournalStats> {
    if closed.is_empty() {
        return None;
    }

    let total_trades = closed.len();
    let wins = closed.iter().filter(|p| p.realized_pnl > 0.0).count();
    let win_rate = wins as f64 / total_trades as f64;
    let total_net_pnl: f64 = closed.iter().map(|p| p.realized_pnl).sum();
    let gross_profit: f64 = closed.iter().map(|p| p.realized_pnl).filter(|&pnl| pnl > 0.0).sum();
    let gross_loss: f64 = closed.iter().map(|p| p.realized_pnl).filter(|&pnl| pnl < 0.0).map(f64::abs).sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    Some(JournalStats { total_trades, win_rate, total_net_pnl, profit_factor })
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Full engine state snapshot sent to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub truth: TruthHeader,
    pub symbols: Vec<SymbolSnapshot>,
    pub positions: Vec<Position>,
    pub closed_positions: Vec<ClosedPosition>,
    pub balances: Vec<AssetBalance>,
    pub recent_errors: Vec<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_stats: Option<JournalStats>,
}

/// Operational truth header — the dashboard's primary status banner.
#[derive(Debug, Clone, Serialize)]
pub struct TruthHeader {
    pub ws_mode: String,
    pub ws_user_connected: bool,
    pub last_ws_user_event_age_ms: u64,
    pub state_version: u64,
    pub ws_sequence_number: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub server_time: i64,
}

/// Per-symbol view: latest tick, feed health, risk status, latest advisory.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolSnapshot {
    pub symbol: String,
    pub last_price: Option<f64>,
    pub feed_degraded: bool,
    pub feed_stale: bool,
    pub spread_bps: Option<f64>,
    pub risk: RiskSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisory: Option<AdvisorySnapshot>,
}

/// Risk engine snapshot for one symbol's `HotLoop`.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub tripped: bool,
    pub trip_reason: Option<String>,
    pub equity: f64,
    pub peak_equity: f64,
    pub daily_pnl: f64,
    pub position_size: f64,
    pub open_orders: u32,
    pub diagnostics: RiskDiagnostics,
}

/// The most recent advisory synthesized by a symbol's `LeadCoordinator`.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisorySnapshot {
    pub action: String,
    pub confidence: f64,
    pub position_size_hint: f64,
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub reasoning: String,
    pub generated_at: DateTime<Utc>,
    pub agent_votes: Vec<AgentVote>,
    /// True once the advisory has exceeded the dashboard's own staleness
    /// threshold, which is deliberately coarser than `decay_window_seconds`
    /// (that one already demotes the `HotLoop` to hold; this one is purely
    /// "is anyone home").
    pub stale: bool,
}

/// Trade journal aggregate statistics.
#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub total_net_pnl: f64,
    pub profit_factor: f64,
}
