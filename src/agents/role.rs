// =============================================================================
// Per-role input gathering and system prompts
// =============================================================================
//
// `gather_predigest` implements the per-role input table: each role pulls a
// fixed subset of exchange data and folds it through a cheap local
// indicator pass so the prompt handed to the language model carries numbers,
// not raw arrays. The indicator math itself (RSI/EMA/ATR) is the textbook
// formula, reused here from `indicators::{rsi, ema, atr}`, the same
// functions `signals::combiner` uses on the hot path.
// =============================================================================

use anyhow::Result;
use serde_json::{json, Value};

use crate::exchange::client::ExchangeClient;
use crate::indicators::atr::calculate_atr;
use crate::indicators::ema::calculate_ema;
use crate::indicators::rsi::calculate_rsi;
use crate::types::AgentRole;

const CANDLE_GRANULARITY: &str = "1m";
const CANDLE_LIMIT: u32 = 100;

/// Fixed coordinator-facing system prompt requesting a strict structured
/// response, per role.
pub fn system_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Technical => {
            "You are a technical-analysis agent for a perpetual-futures trading desk. \
             You are given RSI, EMA9/21, MACD, Bollinger width, and ATR for one symbol. \
             Respond with a strict JSON object: {\"signal\":\"bullish\"|\"bearish\"|\"neutral\", \
             \"confidence\":0..1,\"reasoning\":string,\"data\":object}. No prose outside the JSON."
        }
        AgentRole::Structure => {
            "You are a market-microstructure agent. You are given order-book imbalance, \
             spread, funding rate, open positions, and account assets for one symbol. \
             Respond with strict JSON: {\"signal\":\"bullish\"|\"bearish\"|\"neutral\", \
             \"confidence\":0..1,\"reasoning\":string,\"data\":object}."
        }
        AgentRole::Market => {
            "You are a market-conditions agent. You are given top-of-book depth and the \
             current ticker for one symbol. Respond with strict JSON: \
             {\"signal\":\"bullish\"|\"bearish\"|\"neutral\",\"confidence\":0..1, \
             \"reasoning\":string,\"data\":object}."
        }
        AgentRole::Sentiment => {
            "You are a sentiment agent inferring crowd positioning from funding rate and \
             24h ticker change. Respond with strict JSON: {\"signal\":\"bullish\"|\"bearish\"| \
             \"neutral\",\"confidence\":0..1,\"reasoning\":string,\"data\":object}."
        }
        AgentRole::Risk => {
            "You are a risk-posture agent. You are given account assets and open positions. \
             Respond with strict JSON: {\"signal\":\"bullish\"|\"bearish\"|\"neutral\", \
             \"confidence\":0..1,\"reasoning\":string,\"data\":object}. Favor \"neutral\" when \
             exposure is already large."
        }
        AgentRole::Momentum => {
            "You are a momentum agent. You are given RSI, EMA20/50, and a trend label for one \
             symbol. Respond with strict JSON: {\"signal\":\"bullish\"|\"bearish\"|\"neutral\", \
             \"confidence\":0..1,\"reasoning\":string,\"data\":object}."
        }
        AgentRole::Bull => {
            "You are the bull-case agent on a two-sided debate desk. Build the strongest \
             bullish case from the ticker, funding rate, and indicators you are given, noting \
             the bear case only as context. Respond with strict JSON: {\"signal\":\"bullish\"| \
             \"bearish\"|\"neutral\",\"confidence\":0..1,\"reasoning\":string,\"data\":object}."
        }
        AgentRole::Bear => {
            "You are the bear-case agent on a two-sided debate desk. Build the strongest \
             bearish case from the ticker, funding rate, and indicators you are given, noting \
             the bull case only as context. Respond with strict JSON: {\"signal\":\"bullish\"| \
             \"bearish\"|\"neutral\",\"confidence\":0..1,\"reasoning\":string,\"data\":object}."
        }
        AgentRole::Fundamentals => {
            "You are a funding/fundamentals agent classifying whether the current funding \
             rate and price imply an arbitrage or carry opportunity. Respond with strict JSON: \
             {\"signal\":\"bullish\"|\"bearish\"|\"neutral\",\"confidence\":0..1, \
             \"reasoning\":string,\"data\":object}."
        }
    }
}

/// Gather this role's fixed input subset via the exchange client and fold
/// it through a cheap local pre-digest.
pub async fn gather_predigest(role: AgentRole, symbol: &str, exchange: &ExchangeClient) -> Result<Value> {
    match role {
        AgentRole::Technical => technical_predigest(symbol, exchange).await,
        AgentRole::Structure => structure_predigest(symbol, exchange).await,
        AgentRole::Market => market_predigest(symbol, exchange).await,
        AgentRole::Sentiment => sentiment_predigest(symbol, exchange).await,
        AgentRole::Risk => risk_predigest(symbol, exchange).await,
        AgentRole::Momentum => momentum_predigest(symbol, exchange).await,
        AgentRole::Bull | AgentRole::Bear => debate_predigest(symbol, exchange).await,
        AgentRole::Fundamentals => fundamentals_predigest(symbol, exchange).await,
    }
}

async fn technical_predigest(symbol: &str, exchange: &ExchangeClient) -> Result<Value> {
    let candles = exchange.get_candles(symbol, CANDLE_GRANULARITY, CANDLE_LIMIT).await?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let rsi = calculate_rsi(&closes, 14).last().copied();
    let ema9 = calculate_ema(&closes, 9).last().copied();
    let ema21 = calculate_ema(&closes, 21).last().copied();
    let macd = macd_histogram(&closes);
    let bollinger_width = bollinger_width(&closes, 20);
    let atr = calculate_atr(&candles, 14);

    Ok(json!({
        "rsi_14": rsi,
        "ema_9": ema9,
        "ema_21": ema21,
        "macd_histogram": macd,
        "bollinger_width": bollinger_width,
        "atr_14": atr,
        "last_close": closes.last(),
    }))
}

async fn structure_predigest(symbol: &str, exchange: &ExchangeClient) -> Result<Value> {
    let (bids, asks) = exchange.get_depth(symbol).await?;
    let bid_sum: f64 = bids.iter().map(|(_, q)| q).sum();
    let ask_sum: f64 = asks.iter().map(|(_, q)| q).sum();
    let obi = if bid_sum + ask_sum > 0.0 {
        Some((bid_sum - ask_sum) / (bid_sum + ask_sum))
    } else {
        None
    };
    let spread = match (bids.first(), asks.first()) {
        (Some((bid, _)), Some((ask, _))) if *bid > 0.0 => Some((ask - bid) / bid),
        _ => None,
    };
    let funding = exchange.get_funding_rate(symbol).await.ok();
    let positions = exchange.get_positions().await.unwrap_or_default();
    let assets = exchange.get_assets().await.unwrap_or_default();

    Ok(json!({
        "order_book_imbalance": obi,
        "spread_pct": spread,
        "funding_rate": funding.as_ref().map(|f| f.funding_rate),
        "open_position_count": positions.len(),
        "total_equity": assets.iter().map(|a| a.equity).sum::<f64>(),
    }))
}

async fn market_predigest(symbol: &str, exchange: &ExchangeClient) -> Result<Value> {
    let (bids, asks) = exchange.get_depth(symbol).await?;
    let ticker = exchange.get_ticker(symbol).await?;

    Ok(json!({
        "last": ticker.last,
        "bid": ticker.bid,
        "ask": ticker.ask,
        "vol_24h": ticker.vol,
        "top_bid_qty": bids.first().map(|(_, q)| *q),
        "top_ask_qty": asks.first().map(|(_, q)| *q),
    }))
}

async fn sentiment_predigest(symbol: &str, exchange: &ExchangeClient) -> Result<Value> {
    let funding = exchange.get_funding_rate(symbol).await?;
    let ticker = exchange.get_ticker(symbol).await?;

    Ok(json!({
        "funding_rate": funding.funding_rate,
        "next_funding_time": funding.next_funding_time,
        "change_24h": ticker.change_24h,
    }))
}

async fn risk_predigest(_symbol: &str, exchange: &ExchangeClient) -> Result<Value> {
    let assets = exchange.get_assets().await?;
    let positions = exchange.get_positions().await?;

    Ok(json!({
        "total_equity": assets.iter().map(|a| a.equity).sum::<f64>(),
        "available": assets.iter().map(|a| a.available).sum::<f64>(),
        "open_positions": positions.len(),
        "unrealized_pl": positions.iter().map(|p| p.unrealized_pl).sum::<f64>(),
    }))
}

async fn momentum_predigest(symbol: &str, exchange: &ExchangeClient) -> Result<Value> {
    let candles = exchange.get_candles(symbol, CANDLE_GRANULARITY, CANDLE_LIMIT).await?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let rsi = calculate_rsi(&closes, 14).last().copied();
    let ema20 = calculate_ema(&closes, 20).last().copied();
    let ema50 = calculate_ema(&closes, 50).last().copied();
    let trend = match (ema20, ema50) {
        (Some(fast), Some(slow)) if fast > slow => "up",
        (Some(fast), Some(slow)) if fast < slow => "down",
        _ => "flat",
    };

    Ok(json!({
        "rsi_14": rsi,
        "ema_20": ema20,
        "ema_50": ema50,
        "trend": trend,
    }))
}

async fn debate_predigest(symbol: &str, exchange: &ExchangeClient) -> Result<Value> {
    let ticker = exchange.get_ticker(symbol).await?;
    let funding = exchange.get_funding_rate(symbol).await.ok();
    let candles = exchange.get_candles(symbol, CANDLE_GRANULARITY, CANDLE_LIMIT).await?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let rsi = calculate_rsi(&closes, 14).last().copied();

    Ok(json!({
        "last": ticker.last,
        "change_24h": ticker.change_24h,
        "funding_rate": funding.as_ref().map(|f| f.funding_rate),
        "rsi_14": rsi,
    }))
}

async fn fundamentals_predigest(symbol: &str, exchange: &ExchangeClient) -> Result<Value> {
    let ticker = exchange.get_ticker(symbol).await?;
    let funding = exchange.get_funding_rate(symbol).await?;

    Ok(json!({
        "last": ticker.last,
        "funding_rate": funding.funding_rate,
        "next_funding_time": funding.next_funding_time,
    }))
}

/// `EMA12 - EMA26`, the MACD line without its signal-line smoothing. A
/// minimal stand-in for the full MACD indicator; good enough to give the
/// prompt a directional number.
fn macd_histogram(closes: &[f64]) -> Option<f64> {
    let ema12 = calculate_ema(closes, 12).last().copied()?;
    let ema26 = calculate_ema(closes, 26).last().copied()?;
    Some(ema12 - ema26)
}

/// Bollinger band width as a fraction of the mean: `(upper - lower) / mean`
/// over the trailing `period` closes, `upper/lower = mean +/- 2*stddev`.
fn bollinger_width(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period || period == 0 {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    if mean == 0.0 {
        return None;
    }
    let variance = window.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / period as f64;
    let stddev = variance.sqrt();
    Some((4.0 * stddev) / mean)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_has_a_system_prompt() {
        for role in [
            AgentRole::Technical,
            AgentRole::Structure,
            AgentRole::Market,
            AgentRole::Sentiment,
            AgentRole::Risk,
            AgentRole::Momentum,
            AgentRole::Bull,
            AgentRole::Bear,
            AgentRole::Fundamentals,
        ] {
            assert!(!system_prompt(role).is_empty());
        }
    }

    #[test]
    fn macd_histogram_requires_26_closes() {
        let closes: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        assert_eq!(macd_histogram(&closes), None);
    }

    #[test]
    fn bollinger_width_is_zero_for_constant_series() {
        let closes = vec![100.0; 20];
        let width = bollinger_width(&closes, 20).unwrap();
        assert!((width - 0.0).abs() < 1e-9);
    }

    #[test]
    fn bollinger_width_positive_for_varying_series() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + (i as f64 % 3.0)).collect();
        let width = bollinger_width(&closes, 20).unwrap();
        assert!(width > 0.0);
    }
}
