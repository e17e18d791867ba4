// =============================================================================
// Meridian Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode via the dashboard or API. Missing exchange/language-
// model credentials or an empty symbol list are configuration errors:
// `main` returns `Err` before any task is spawned.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod agents;
mod api;
mod app_state;
mod coordinator;
mod exchange;
mod hot_loop;
mod indicators;
mod llm;
mod market_data;
mod position_engine;
mod risk;
mod runtime_config;
mod signals;
mod supervisor;
mod types;

use std::sync::Arc;

use anyhow::{ensure, Context};
use parking_lot::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::exchange::client::ExchangeClient;
use crate::llm::client::LlmClient;
use crate::position_engine::PositionEngine;
use crate::runtime_config::RuntimeConfig;
use crate::supervisor::Supervisor;

const RUNTIME_CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Nexus — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Load and harden runtime config ────────────────────────────────
    let mut config = RuntimeConfig::load_or_default(RUNTIME_CONFIG_PATH);

    // SAFETY: force Demo + Paused on startup. Live trading requires an
    // explicit operator action via the dashboard.
    config.trading_mode = types::TradingMode::Paused;
    config.account_mode = types::AccountMode::Demo;

    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    ensure!(!config.symbols.is_empty(), "configuration error: no symbols configured");

    info!(symbols = ?config.symbols, "configured trading pairs");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 3. Credentials ─
    let exchange_api_key = std::env::var("EXCHANGE_API_KEY").context("EXCHANGE_API_KEY is not set")?;
    let exchange_secret = std::env::var("EXCHANGE_API_SECRET").context("EXCHANGE_API_SECRET is not set")?;
    let exchange_passphrase = std::env::var("EXCHANGE_PASSPHRASE").context("EXCHANGE_PASSPHRASE is not set")?;
    let exchange_base_url =
        std::env::var("EXCHANGE_BASE_URL").unwrap_or_else(|_| "https://api.exchange.invalid".to_string());

    let llm_api_key = std::env::var("LLM_API_KEY").context("LLM_API_KEY is not set")?;
    let llm_base_url = std::env::var("LLM_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
    let llm_model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

    let market_ws_url =
        std::env::var("MARKET_WS_URL").unwrap_or_else(|_| "wss://stream.exchange.invalid/public".to_string());

    // ── 4. Build core engine components ──────────────────────────────────
    let exchange =
        Arc::new(ExchangeClient::new(exchange_api_key, exchange_secret, exchange_passphrase, exchange_base_url));
    let llm = LlmClient::new(llm_api_key, llm_base_url, llm_model);
    let positions = Arc::new(PositionEngine::new());

    let trading_config = Arc::new(RwLock::new(config.trading.clone()));
    let trading_mode = Arc::new(RwLock::new(config.trading_mode));

    let state = Arc::new(AppState::new(
        config.account_mode,
        config.symbols.clone(),
        config.max_concurrent_positions,
        trading_config.clone(),
        trading_mode.clone(),
        exchange.clone(),
        positions.clone(),
    ));

    // ── 5. API server ─────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 5a. Account balance refresh ───────────────────────────────────────
    let balance_exchange = exchange.clone();
    let balance_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            match balance_exchange.get_assets().await {
                Ok(assets) => balance_state.set_balances(assets),
                Err(err) => balance_state.push_error(format!("balance refresh failed: {err}")),
            }
        }
    });

    // ── 5b. Rate-limit counter maintenance ───────────────────────────────
    let rate_limit_exchange = exchange.clone();
    tokio::spawn(async move {
        let mut ten_second_tick = tokio::time::interval(tokio::time::Duration::from_secs(10));
        let mut minute_tick = tokio::time::interval(tokio::time::Duration::from_secs(60));
        let mut day_tick = tokio::time::interval(tokio::time::Duration::from_secs(86_400));
        loop {
            tokio::select! {
                _ = ten_second_tick.tick() => rate_limit_exchange.reset_order_window(),
                _ = minute_tick.tick() => rate_limit_exchange.reset_weight_window(),
                _ = day_tick.tick() => rate_limit_exchange.reset_daily_order_count(),
            }
        }
    });

    // ── 6. Supervisor — wires and spawns every symbol's graph ────────────
    let supervisor = Supervisor::new(
        config.symbols.clone(),
        exchange.clone(),
        llm.clone(),
        market_ws_url,
        trading_config.clone(),
        trading_mode.clone(),
        positions.clone(),
    );
    let handles = supervisor.run().await;
    state.set_symbol_handles(handles);

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 7. Graceful shutdown ───────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    supervisor::shutdown(&state.symbol_handles.read());

    let final_config = RuntimeConfig {
        trading_mode: *trading_mode.read(),
        account_mode: *state.account_mode.read(),
        symbols: config.symbols,
        max_concurrent_positions: config.max_concurrent_positions,
        trading: trading_config.read().clone(),
    };
    if let Err(err) = final_config.save(RUNTIME_CONFIG_PATH) {
        warn!(error = %err, "failed to save runtime config on shutdown");
    }

    info!("Meridian Nexus shut down complete");
    Ok(())
}
