// =============================================================================
// Risk Engine — synchronous pre-trade circuit breaker
// =============================================================================
//
// A two-state machine: `Armed` <-> `Tripped`.
//
//   Armed -> Tripped   on any of: dailyPnL < -maxDailyLoss
//                                 equity < minEquity
//                                 (peak - equity) / peak > maxDrawdown
//   Tripped -> Armed   only via an explicit reset() (operator action).
//
// `peakEquity = max(peakEquity, equity)` and `dailyPnL = equity -
// initialEquity` are maintained atomically inside `update_state`.
//
// Richer per-cause breaker bookkeeping (consecutive losses, daily trade
// count) is retained below as a `status()` diagnostic only — it never
// flips `tripped` on its own; see DESIGN.md.
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Side;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Fields the caller wants to update; unspecified fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct RiskStateUpdate {
    pub equity: Option<f64>,
    /// Signed position size: positive = net long exposure, negative = net
    /// short exposure, in the venue's base asset units.
    pub position_size: Option<f64>,
    pub open_orders: Option<u32>,
}

/// Non-authoritative breakdown of *why* the engine might be near tripping,
/// kept for dashboard/diagnostic purposes only. Never drives a state
/// transition by itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDiagnostics {
    pub consecutive_losses: u32,
    pub daily_trades_count: u32,
    pub daily_wins: u32,
    pub daily_losses: u32,
}

/// `{equity, initialEquity, peakEquity, dailyPnL, positionSize, openOrders,
/// tripped, tripReason}`, plus the non-authoritative
/// diagnostics above.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub equity: f64,
    pub initial_equity: f64,
    pub peak_equity: f64,
    pub daily_pnl: f64,
    pub position_size: f64,
    pub open_orders: u32,
    pub tripped: bool,
    pub trip_reason: Option<String>,
    pub diagnostics: RiskDiagnostics,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    equity: f64,
    peak_equity: f64,
    position_size: f64,
    open_orders: u32,
    tripped: bool,
    trip_reason: Option<String>,
    consecutive_losses: u32,
    daily_trades_count: u32,
    daily_wins: u32,
    daily_losses: u32,
}

// ---------------------------------------------------------------------------
// Risk Engine
// ---------------------------------------------------------------------------

/// Synchronous risk gate. Owned by exactly one `HotLoop`; all access is
/// serialized by that `HotLoop`, so the
/// inner `RwLock` exists purely to let the dashboard take a read-only
/// snapshot concurrently, not to coordinate multiple writers.
pub struct RiskEngine {
    state: RwLock<Inner>,
    initial_equity: f64,
    max_daily_loss_pct: f64,
    max_drawdown_pct: f64,
    min_equity: f64,
    max_position_size: f64,
}

impl RiskEngine {
    /// Create a new risk engine, `Armed`, starting from `initial_equity`.
    pub fn new(
        initial_equity: f64,
        max_daily_loss_pct: f64,
        max_drawdown_pct: f64,
        min_equity: f64,
        max_position_size: f64,
    ) -> Self {
        info!(
            initial_equity,
            max_daily_loss_pct, max_drawdown_pct, min_equity, max_position_size,
            "RiskEngine initialised (Armed)"
        );

        Self {
            state: RwLock::new(Inner {
                equity: initial_equity,
                peak_equity: initial_equity,
                position_size: 0.0,
                open_orders: 0,
                tripped: false,
                trip_reason: None,
                consecutive_losses: 0,
                daily_trades_count: 0,
                daily_wins: 0,
                daily_losses: 0,
            }),
            initial_equity,
            max_daily_loss_pct,
            max_drawdown_pct,
            min_equity,
            max_position_size,
        }
    }

    // -------------------------------------------------------------------------
    // State updates
    // -------------------------------------------------------------------------

    /// Apply a partial update to equity / position size / open-order count.
    /// Maintains `peakEquity = max(peakEquity, equity)` atomically.
    pub fn update_state(&self, partial: RiskStateUpdate) {
        let mut s = self.state.write();

        if let Some(equity) = partial.equity {
            assert!(equity.is_finite(), "RiskEngine invariant violated: equity is not finite");
            s.equity = equity;
            if s.equity > s.peak_equity {
                s.peak_equity = s.equity;
            }
        }
        if let Some(position_size) = partial.position_size {
            assert!(
                position_size.is_finite(),
                "RiskEngine invariant violated: position_size is not finite"
            );
            s.position_size = position_size;
        }
        if let Some(open_orders) = partial.open_orders {
            s.open_orders = open_orders;
        }
    }

    /// Record the realized PnL of a closed trade for the diagnostic
    /// win/loss-streak counters only. Does not itself call `trip()`.
    pub fn record_trade_result(&self, pnl: f64) {
        let mut s = self.state.write();
        s.daily_trades_count += 1;
        if pnl >= 0.0 {
            s.daily_wins += 1;
            s.consecutive_losses = 0;
        } else {
            s.daily_losses += 1;
            s.consecutive_losses += 1;
        }
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Returns `false` if already tripped. Otherwise rejects if the
    /// projected post-trade absolute position size exceeds
    /// `maxPositionSize`. Otherwise evaluates each trip condition; any true
    /// condition trips the engine and returns `false`. Otherwise `true`.
    pub fn can_trade(&self, side: Side, size: f64, price: f64) -> bool {
        assert!(price.is_finite() && price > 0.0, "RiskEngine invariant violated: non-positive price");
        assert!(size.is_finite() && size >= 0.0, "RiskEngine invariant violated: negative or NaN size");

        let mut s = self.state.write();

        if s.tripped {
            return false;
        }

        let signed_delta = match side {
            Side::Long => size,
            Side::Short => -size,
        };
        let projected = s.position_size + signed_delta;
        if projected.abs() > self.max_position_size {
            return false;
        }

        if let Some(reason) = self.evaluate_trip_conditions(&s) {
            warn!(reason = %reason, "RiskEngine tripped");
            s.tripped = true;
            s.trip_reason = Some(reason);
            return false;
        }

        true
    }

    /// Manually trip the breaker with an explicit reason (e.g. an operator
    /// kill command, or an upstream component detecting an unrecoverable
    /// condition).
    pub fn trip(&self, reason: impl Into<String>) {
        let mut s = self.state.write();
        let reason = reason.into();
        warn!(reason = %reason, "RiskEngine tripped (explicit)");
        s.tripped = true;
        s.trip_reason = Some(reason);
    }

    /// `Tripped -> Armed`. Only path back to trading; must be called
    /// out-of-band by an operator.
    pub fn reset(&self) {
        let mut s = self.state.write();
        s.tripped = false;
        s.trip_reason = None;
        info!("RiskEngine reset (Tripped -> Armed)");
    }

    /// Full state snapshot.
    pub fn status(&self) -> RiskState {
        let s = self.state.read();
        RiskState {
            equity: s.equity,
            initial_equity: self.initial_equity,
            peak_equity: s.peak_equity,
            daily_pnl: s.equity - self.initial_equity,
            position_size: s.position_size,
            open_orders: s.open_orders,
            tripped: s.tripped,
            trip_reason: s.trip_reason.clone(),
            diagnostics: RiskDiagnostics {
                consecutive_losses: s.consecutive_losses,
                daily_trades_count: s.daily_trades_count,
                daily_wins: s.daily_wins,
                daily_losses: s.daily_losses,
            },
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn evaluate_trip_conditions(&self, s: &Inner) -> Option<String> {
        let daily_pnl = s.equity - self.initial_equity;
        let max_daily_loss = self.max_daily_loss_pct * self.initial_equity;
        if daily_pnl < -max_daily_loss {
            return Some(format!(
                "daily loss {:.2} exceeds limit {:.2}",
                -daily_pnl, max_daily_loss
            ));
        }

        if s.equity < self.min_equity {
            return Some(format!(
                "equity {:.2} fell below minEquity {:.2}",
                s.equity, self.min_equity
            ));
        }

        if s.peak_equity > 0.0 {
            let drawdown = (s.peak_equity - s.equity) / s.peak_equity;
            if drawdown > self.max_drawdown_pct {
                return Some(format!(
                    "drawdown {:.2}% exceeds limit {:.2}%",
                    drawdown * 100.0,
                    self.max_drawdown_pct * 100.0
                ));
            }
        }

        None
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("initial_equity", &self.initial_equity)
            .field("max_daily_loss_pct", &self.max_daily_loss_pct)
            .field("max_drawdown_pct", &self.max_drawdown_pct)
            .field("min_equity", &self.min_equity)
            .field("max_position_size", &self.max_position_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::new(1000.0, 0.03, 0.05, 100.0, 0.05)
    }

    #[test]
    fn starts_armed() {
        let e = engine();
        assert!(!e.status().tripped);
        assert!(e.can_trade(Side::Long, 0.01, 88000.0));
    }

    #[test]
    fn peak_equity_tracks_max() {
        let e = engine();
        e.update_state(RiskStateUpdate {
            equity: Some(1100.0),
            ..Default::default()
        });
        e.update_state(RiskStateUpdate {
            equity: Some(1050.0),
            ..Default::default()
        });
        let s = e.status();
        assert!((s.peak_equity - 1100.0).abs() < 1e-9);
        assert!((s.daily_pnl - 50.0).abs() < 1e-9);
    }

    #[test]
    fn trips_on_drawdown_and_stays_tripped_until_reset() {
        // equity 1000 -> 940, peak stays at 1000.
        let e = RiskEngine::new(1000.0, 0.03, 0.05, 100.0, 0.05);
        e.update_state(RiskStateUpdate {
            equity: Some(940.0),
            ..Default::default()
        });
        assert!(!e.can_trade(Side::Long, 0.001, 1000.0));
        let status = e.status();
        assert!(status.tripped);
        assert!(status.trip_reason.unwrap().contains("drawdown"));

        // Remains tripped on subsequent calls, regardless of equity moving
        // back up, until reset() is called.
        e.update_state(RiskStateUpdate {
            equity: Some(1000.0),
            ..Default::default()
        });
        assert!(!e.can_trade(Side::Long, 0.001, 1000.0));

        e.reset();
        assert!(e.can_trade(Side::Long, 0.001, 1000.0));
    }

    #[test]
    fn trips_on_daily_loss() {
        let e = RiskEngine::new(1000.0, 0.03, 0.5, 0.0, 1.0);
        e.update_state(RiskStateUpdate {
            equity: Some(960.0), // -4% > -3% limit
            ..Default::default()
        });
        assert!(!e.can_trade(Side::Long, 0.001, 100.0));
        assert!(e.status().trip_reason.unwrap().contains("daily loss"));
    }

    #[test]
    fn trips_on_min_equity() {
        let e = RiskEngine::new(1000.0, 1.0, 1.0, 500.0, 10.0);
        e.update_state(RiskStateUpdate {
            equity: Some(400.0),
            ..Default::default()
        });
        assert!(!e.can_trade(Side::Long, 0.001, 100.0));
        assert!(e.status().trip_reason.unwrap().contains("minEquity"));
    }

    #[test]
    fn rejects_oversized_position_without_tripping() {
        let e = engine();
        // max_position_size = 0.05; requesting 0.06 alone exceeds it.
        assert!(!e.can_trade(Side::Long, 0.06, 88000.0));
        // Rejection on size alone must not trip the breaker.
        assert!(!e.status().tripped);
        assert!(e.can_trade(Side::Long, 0.04, 88000.0));
    }

    #[test]
    fn projected_size_accounts_for_existing_position() {
        let e = engine();
        e.update_state(RiskStateUpdate {
            position_size: Some(0.04),
            ..Default::default()
        });
        // Existing 0.04 long + 0.02 more long = 0.06 > 0.05 limit.
        assert!(!e.can_trade(Side::Long, 0.02, 88000.0));
        // Existing 0.04 long - 0.02 short (reducing) = 0.02, within limit.
        assert!(e.can_trade(Side::Short, 0.02, 88000.0));
    }

    #[test]
    #[should_panic(expected = "non-positive price")]
    fn invariant_violation_on_negative_price_panics() {
        let e = engine();
        e.can_trade(Side::Long, 0.01, -1.0);
    }

    #[test]
    fn diagnostics_track_consecutive_losses_without_tripping() {
        let e = engine();
        e.record_trade_result(-10.0);
        e.record_trade_result(-10.0);
        let status = e.status();
        assert_eq!(status.diagnostics.consecutive_losses, 2);
        assert!(!status.tripped);
    }
}
