// =============================================================================
// Supervisor — wires the per-symbol graph
// =============================================================================
//
// Single-symbol mode is just multi-symbol mode with one element. For every
// symbol this constructs one `MarketDataFeed`, one `LeadCoordinator` (with
// one `IndependentAgent` per role), and one `HotLoop`, then spawns each as
// its own task: one task per agent, one per `LeadCoordinator`, one per
// `MarketDataFeed`, one `HotLoop` per symbol. Startup is staggered by at
// least `STAGGER_GAP` between symbols to avoid bursting the exchange's
// REST quota during the first agent cycles.
// =============================================================================

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::agents::IndependentAgent;
use crate::coordinator::LeadCoordinator;
use crate::exchange::client::ExchangeClient;
use crate::hot_loop::HotLoop;
use crate::llm::client::LlmClient;
use crate::market_data::{CandleBuffer, MarketDataFeed, OrderBookManager};
use crate::position_engine::PositionEngine;
use crate::risk::RiskEngine;
use crate::runtime_config::{ConfigHandle, TradingModeHandle};
use crate::types::AgentRole;

/// Minimum gap between consecutive symbols' startup in multi-symbol mode.
const STAGGER_GAP: Duration = Duration::from_secs(5);
const CANDLE_BUFFER_CAPACITY: usize = 500;

const AGENT_ROLES: [AgentRole; 9] = [
    AgentRole::Technical,
    AgentRole::Structure,
    AgentRole::Market,
    AgentRole::Sentiment,
    AgentRole::Risk,
    AgentRole::Momentum,
    AgentRole::Bull,
    AgentRole::Bear,
    AgentRole::Fundamentals,
];

/// Live handles for one symbol's graph, kept by the caller for shutdown and
/// for the dashboard's state snapshot.
pub struct SymbolHandles {
    pub symbol: String,
    pub feed: Arc<MarketDataFeed>,
    pub coordinator: Arc<LeadCoordinator>,
    pub risk: Arc<RiskEngine>,
    pub hot_loop_stop: Arc<AtomicBool>,
}

pub struct Supervisor {
    symbols: Vec<String>,
    exchange: Arc<ExchangeClient>,
    llm: LlmClient,
    ws_url: String,
    config: ConfigHandle,
    trading_mode: TradingModeHandle,
    positions: Arc<PositionEngine>,
}

impl Supervisor {
    pub fn new(
        symbols: Vec<String>,
        exchange: Arc<ExchangeClient>,
        llm: LlmClient,
        ws_url: impl Into<String>,
        config: ConfigHandle,
        trading_mode: TradingModeHandle,
        positions: Arc<PositionEngine>,
    ) -> Self {
        Self { symbols, exchange, llm, ws_url: ws_url.into(), config, trading_mode, positions }
    }

    /// Single-symbol convenience constructor.
    pub fn single(
        symbol: impl Into<String>,
        exchange: Arc<ExchangeClient>,
        llm: LlmClient,
        ws_url: impl Into<String>,
        config: ConfigHandle,
        trading_mode: TradingModeHandle,
        positions: Arc<PositionEngine>,
    ) -> Self {
        Self::new(vec![symbol.into()], exchange, llm, ws_url, config, trading_mode, positions)
    }

    /// Wire and spawn every symbol's graph, staggering startup. Returns the
    /// live handles so the caller (the dashboard, or a later graceful
    /// shutdown) can reach each symbol's components.
    pub async fn run(self) -> Vec<SymbolHandles> {
        let initial_equity = match self.exchange.get_assets().await {
            Ok(assets) => assets.iter().map(|a| a.equity).sum(),
            Err(err) => {
                warn!(error = %err, "could not fetch initial account equity, starting RiskEngine at 0");
                0.0
            }
        };

        let mut handles = Vec::with_capacity(self.symbols.len());

        for (index, symbol) in self.symbols.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(STAGGER_GAP).await;
            }

            info!(symbol = %symbol, "starting symbol graph");
            handles.push(self.spawn_symbol(symbol, initial_equity));
        }

        handles
    }

    fn spawn_symbol(&self, symbol: &str, initial_equity: f64) -> SymbolHandles {
        let cfg = self.config.read().clone();

        let candles = Arc::new(CandleBuffer::new(CANDLE_BUFFER_CAPACITY));
        let orderbook = Arc::new(OrderBookManager::new());
        let feed = MarketDataFeed::new(symbol.to_string(), self.ws_url.clone(), candles, orderbook);
        tokio::spawn(feed.clone().start());

        let agent_interval = Duration::from_secs(cfg.agent_interval_seconds);
        let agents: Vec<Arc<IndependentAgent>> = AGENT_ROLES
            .iter()
            .map(|role| {
                IndependentAgent::new(
                    format!("{symbol}-{role}"),
                    *role,
                    symbol.to_string(),
                    agent_interval,
                    self.exchange.clone(),
                    self.llm.clone(),
                )
            })
            .collect();

        let coordinator = LeadCoordinator::new(
            symbol.to_string(),
            Duration::from_secs(cfg.coordinator_warmup_seconds),
            Duration::from_secs(cfg.coordinator_interval_seconds),
            self.llm.clone(),
        )
        .with_agents(agents);
        tokio::spawn(coordinator.clone().start());

        let risk = Arc::new(RiskEngine::new(
            initial_equity,
            cfg.max_daily_loss_pct,
            cfg.max_drawdown_pct,
            cfg.min_equity,
            cfg.max_position_size,
        ));

        let hot_loop = HotLoop::new(
            symbol.to_string(),
            feed.clone(),
            coordinator.clone(),
            self.exchange.clone(),
            risk.clone(),
            self.positions.clone(),
            self.config.clone(),
            self.trading_mode.clone(),
        );
        let hot_loop_stop = hot_loop.stop_handle();
        tokio::spawn(hot_loop.run());

        SymbolHandles { symbol: symbol.to_string(), feed, coordinator, risk, hot_loop_stop }
    }
}

/// Cooperative shutdown across every symbol's graph: stop accepting new
/// work and let in-flight ticks finish or drop.
pub fn shutdown(handles: &[SymbolHandles]) {
    for handle in handles {
        handle.feed.stop();
        handle.coordinator.stop();
        handle.hot_loop_stop.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}
