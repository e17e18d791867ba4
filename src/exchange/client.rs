// =============================================================================
// ExchangeClient — perpetual-futures REST client
// =============================================================================
//
// SECURITY: the secret and passphrase are never logged or serialized. Every
// signed request carries `ACCESS-KEY`, `ACCESS-TIMESTAMP`, `ACCESS-PASSPHRASE`
// and `ACCESS-SIGN` headers; the signature is HMAC-SHA256 over
// `timestamp|method|path|body`, base64-encoded, using the shared secret —
// the venue's published scheme, copied verbatim.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use anyhow::{Context, Result};

use crate::exchange::rate_limit::RateLimitTracker;
use crate::market_data::Candle;
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub last: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub vol: Option<f64>,
    pub change_24h: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub funding_rate: f64,
    pub next_funding_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub coin_name: String,
    pub equity: f64,
    pub available: f64,
    pub frozen: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub hold_side: Side,
    pub total: f64,
    pub average_open_price: f64,
    pub unrealized_pl: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AiLogEntry<'a> {
    pub stage: &'a str,
    pub model: &'a str,
    pub input: &'a serde_json::Value,
    pub output: &'a serde_json::Value,
    pub explanation: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadAck {
    pub code: String,
    pub msg: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Perpetual-futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct ExchangeClient {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl ExchangeClient {
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        passphrase: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: base_url.into(),
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        }
    }

    /// Roll the 10-second order-count window. Call from a periodic timer.
    pub fn reset_order_window(&self) {
        self.rate_limit.reset_10s_counter();
    }

    /// Roll the 1-minute request-weight window. Call from a periodic timer.
    pub fn reset_weight_window(&self) {
        self.rate_limit.reset_1m_weight();
    }

    /// Roll the daily order-count window. Call at UTC midnight.
    pub fn reset_daily_order_count(&self) {
        self.rate_limit.reset_daily_counter();
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn sign(&self, timestamp: u64, method: &str, path: &str, body: &str) -> String {
        let prehash = format!("{timestamp}{method}{path}{body}");
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Request weight charged against the 1-minute quota per call. The venue
    /// doesn't document a per-endpoint table, so every call is charged 1.
    const REQUEST_WEIGHT: u32 = 1;

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &str,
    ) -> Result<serde_json::Value> {
        anyhow::ensure!(self.rate_limit.can_send_request(Self::REQUEST_WEIGHT), "local rate-limit budget exhausted for {path}");

        let ts = Self::timestamp_ms();
        let signature = self.sign(ts, method.as_str(), path, body);
        let url = format!("{}{}", self.base_url, path);

        let mut req = self
            .client
            .request(method, &url)
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", ts.to_string())
            .header("ACCESS-PASSPHRASE", &self.passphrase);

        if !body.is_empty() {
            req = req.header("Content-Type", "application/json").body(body.to_string());
        }

        let resp = req.send().await.with_context(|| format!("request to {path} failed"))?;
        self.rate_limit.update_from_headers(resp.headers());
        let status = resp.status();
        let value: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {path}"))?;

        if !status.is_success() {
            anyhow::bail!("exchange returned {} for {}: {}", status, path, value);
        }

        Ok(value)
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::get_ticker")]
    pub async fn get_ticker(&self, symbol: &str) -> Result<TickerSnapshot> {
        let path = format!("/api/v1/market/ticker?symbol={symbol}");
        let body = self.signed_request(reqwest::Method::GET, &path, "").await?;

        let last = body["data"]["last"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .or_else(|| body["data"]["last"].as_f64())
            .context("ticker response missing last price")?;

        Ok(TickerSnapshot {
            last,
            bid: parse_opt_f64(&body["data"]["bidPx"]),
            ask: parse_opt_f64(&body["data"]["askPx"]),
            vol: parse_opt_f64(&body["data"]["vol24h"]),
            change_24h: parse_opt_f64(&body["data"]["change24h"]),
        })
    }

    #[instrument(skip(self), name = "exchange::get_depth")]
    pub async fn get_depth(&self, symbol: &str) -> Result<(Vec<(f64, f64)>, Vec<(f64, f64)>)> {
        let path = format!("/api/v1/market/depth?symbol={symbol}&size=10");
        let body = self.signed_request(reqwest::Method::GET, &path, "").await?;

        let bids = parse_levels(&body["data"]["bids"]);
        let asks = parse_levels(&body["data"]["asks"]);
        Ok((bids, asks))
    }

    #[instrument(skip(self), name = "exchange::get_candles")]
    pub async fn get_candles(&self, symbol: &str, granularity: &str, limit: u32) -> Result<Vec<Candle>> {
        let path = format!("/api/v1/market/candles?symbol={symbol}&granularity={granularity}&limit={limit}");
        let body = self.signed_request(reqwest::Method::GET, &path, "").await?;

        let raw = body["data"].as_array().context("candles response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("candle entry is not an array")?;
            if arr.len() < 6 {
                warn!("skipping malformed candle entry with {} elements", arr.len());
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            candles.push(Candle {
                open_time,
                close_time: open_time,
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
                is_closed: true,
            });
        }
        // Newest last.
        Ok(candles)
    }

    #[instrument(skip(self), name = "exchange::get_funding_rate")]
    pub async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate> {
        let path = format!("/api/v1/market/funding-rate?symbol={symbol}");
        let body = self.signed_request(reqwest::Method::GET, &path, "").await?;
        Ok(FundingRate {
            funding_rate: parse_opt_f64(&body["data"]["fundingRate"]).unwrap_or(0.0),
            next_funding_time: body["data"]["nextFundingTime"].as_i64(),
        })
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::get_assets")]
    pub async fn get_assets(&self) -> Result<Vec<AssetBalance>> {
        let path = "/api/v1/account/assets";
        let body = self.signed_request(reqwest::Method::GET, path, "").await?;
        let raw = body["data"].as_array().context("assets response is not an array")?;

        Ok(raw
            .iter()
            .filter_map(|a| {
                Some(AssetBalance {
                    coin_name: a["coinName"].as_str()?.to_string(),
                    equity: parse_opt_f64(&a["equity"])?,
                    available: parse_opt_f64(&a["available"]).unwrap_or(0.0),
                    frozen: parse_opt_f64(&a["frozen"]),
                })
            })
            .collect())
    }

    #[instrument(skip(self), name = "exchange::get_positions")]
    pub async fn get_positions(&self) -> Result<Vec<PositionSnapshot>> {
        let path = "/api/v1/account/positions";
        let body = self.signed_request(reqwest::Method::GET, path, "").await?;
        let raw = body["data"].as_array().context("positions response is not an array")?;

        Ok(raw
            .iter()
            .filter_map(|p| {
                let hold_side = match p["holdSide"].as_str()? {
                    "long" => Side::Long,
                    "short" => Side::Short,
                    _ => return None,
                };
                Some(PositionSnapshot {
                    symbol: p["symbol"].as_str()?.to_string(),
                    hold_side,
                    total: parse_opt_f64(&p["total"])?,
                    average_open_price: parse_opt_f64(&p["averageOpenPrice"])?,
                    unrealized_pl: parse_opt_f64(&p["unrealizedPL"]).unwrap_or(0.0),
                })
            })
            .collect())
    }

    #[instrument(skip(self), name = "exchange::get_order_history")]
    pub async fn get_order_history(&self, symbol: &str) -> Result<Vec<serde_json::Value>> {
        let path = format!("/api/v1/trade/orders-history?symbol={symbol}");
        let body = self.signed_request(reqwest::Method::GET, &path, "").await?;
        Ok(body["data"].as_array().cloned().unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Trading
    // -------------------------------------------------------------------------

    /// Place a market order. `side_code` is one of the four venue codes
    /// (`1=open-long, 2=close-short, 3=open-short, 4=close-long`) produced by
    /// `types::side_code`.
    #[instrument(skip(self), name = "exchange::place_order")]
    pub async fn place_order(&self, symbol: &str, side_code: u8, size: f64) -> Result<serde_json::Value> {
        anyhow::ensure!((1..=4).contains(&side_code), "invalid side_code {side_code}");
        anyhow::ensure!(self.rate_limit.can_place_order(), "local order rate-limit exceeded for {symbol}");

        let payload = serde_json::json!({
            "symbol": symbol,
            "side": side_code,
            "size": format!("{size}"),
            "orderType": "market",
        });
        let body_str = payload.to_string();

        debug!(symbol, side_code, size, "placing order");
        let result = self.signed_request(reqwest::Method::POST, "/api/v1/trade/order", &body_str).await;
        if result.is_ok() {
            self.rate_limit.record_order_sent();
        }
        result
    }

    /// Fire-and-forget audit sink. Failures must not block trading; callers
    /// should log the error and continue rather than propagate it.
    #[instrument(skip(self, entry), name = "exchange::upload_ai_log")]
    pub async fn upload_ai_log(&self, entry: AiLogEntry<'_>) -> Result<UploadAck> {
        let body_str = serde_json::to_string(&entry).context("failed to serialise AI log entry")?;
        let value = self
            .signed_request(reqwest::Method::POST, "/api/v1/ai/log", &body_str)
            .await?;
        serde_json::from_value(value).context("failed to parse upload_ai_log response")
    }
}

// -------------------------------------------------------------------------
// Parsing helpers
// -------------------------------------------------------------------------

fn parse_opt_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    parse_opt_f64(val).with_context(|| format!("expected numeric value, got: {val}"))
}

fn parse_levels(val: &serde_json::Value) -> Vec<(f64, f64)> {
    val.as_array()
        .map(|levels| {
            levels
                .iter()
                .filter_map(|lvl| {
                    let arr = lvl.as_array()?;
                    let price = parse_opt_f64(arr.first()?)?;
                    let qty = parse_opt_f64(arr.get(1)?)?;
                    Some((price, qty))
                })
                .collect()
        })
        .unwrap_or_default()
}

impl std::fmt::Debug for ExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ExchangeClient {
        ExchangeClient::new("key", "secret", "pass", "https://example.invalid")
    }

    #[test]
    fn signature_is_deterministic_for_same_inputs() {
        let c = client();
        let sig1 = c.sign(1_700_000_000_000, "GET", "/api/v1/market/ticker", "");
        let sig2 = c.sign(1_700_000_000_000, "GET", "/api/v1/market/ticker", "");
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn signature_changes_with_path() {
        let c = client();
        let sig1 = c.sign(1_700_000_000_000, "GET", "/api/v1/market/ticker", "");
        let sig2 = c.sign(1_700_000_000_000, "GET", "/api/v1/market/depth", "");
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn debug_redacts_secrets() {
        let c = ExchangeClient::new("key", "TOPSECRET123", "pass", "https://example.invalid");
        let s = format!("{c:?}");
        assert!(!s.contains("TOPSECRET123"));
        assert!(s.contains("<redacted>"));
    }

    #[test]
    fn parse_levels_handles_string_pairs() {
        let json = serde_json::json!([["88000.0", "1.5"], ["87999.0", "2.0"]]);
        let levels = parse_levels(&json);
        assert_eq!(levels.len(), 2);
        assert!((levels[0].0 - 88000.0).abs() < 1e-9);
    }

    #[test]
    fn place_order_rejects_invalid_side_code() {
        // Validated synchronously before any network call is attempted.
        let c = client();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let result = rt.block_on(c.place_order("BTC-USDT-PERP", 9, 0.01));
        assert!(result.is_err());
    }
}
