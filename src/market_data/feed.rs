// =============================================================================
// MarketDataFeed — live ticker + candle1m WebSocket ingest
// =============================================================================
//
// One feed per symbol, one live connection. Subscribes `ticker` and
// `candle1m`; responds to `ping` with `pong` and emits its own keepalive
// every 20 s; deduplicates ticks by last price; reconnects with exponential
// backoff (2 s -> 30 s, doubling per attempt); after 6 consecutive failures
// transitions to a degraded state and stops emitting.
//
// A single combined ticker+candle1m connection per symbol, rather than one
// socket per stream.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::candle_buffer::{Candle, CandleBuffer, CandleKey};
use crate::market_data::orderbook::OrderBookManager;
use crate::types::Tick;

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const DEGRADED_AFTER_FAILURES: u32 = 6;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// `latest()` older than this is considered stale; `HotLoop` falls back to
/// the REST client when it observes this.
const STALE_THRESHOLD: chrono::Duration = chrono::Duration::seconds(10);

pub struct MarketDataFeed {
    symbol: String,
    ws_url: String,
    latest: RwLock<Option<Tick>>,
    tick_tx: broadcast::Sender<Tick>,
    candles: Arc<CandleBuffer>,
    orderbook: Arc<OrderBookManager>,
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
    stop_flag: Arc<AtomicBool>,
}

impl MarketDataFeed {
    pub fn new(
        symbol: impl Into<String>,
        ws_url: impl Into<String>,
        candles: Arc<CandleBuffer>,
        orderbook: Arc<OrderBookManager>,
    ) -> Arc<Self> {
        let (tick_tx, _rx) = broadcast::channel(256);
        Arc::new(Self {
            symbol: symbol.into(),
            ws_url: ws_url.into(),
            latest: RwLock::new(None),
            tick_tx,
            candles,
            orderbook,
            degraded: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            stop_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Most recent tick snapshot, if any has been received.
    pub fn latest(&self) -> Option<Tick> {
        self.latest.read().clone()
    }

    /// `true` if `latest()` is stale (or absent) and the caller should fall
    /// back to a REST `getTicker` call for this cycle.
    pub fn is_stale(&self) -> bool {
        match self.latest() {
            Some(tick) => Utc::now().signed_duration_since(tick.timestamp) > STALE_THRESHOLD,
            None => true,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Subscribe to the tick event stream. A cold-start subscriber observes
    /// only ticks emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Tick> {
        self.tick_tx.subscribe()
    }

    /// Request cooperative shutdown; the reconnect loop checks this flag at
    /// every suspension point and returns within roughly one backoff sleep.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Run the reconnect loop until `stop()` is called. Intended to be
    /// spawned as its own task by the `Supervisor`.
    pub async fn start(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;

        while !self.stop_flag.load(Ordering::Relaxed) {
            match self.run_connection().await {
                Ok(()) => {
                    // Clean disconnect (remote closed); treat like any other
                    // failure and reconnect with backoff.
                    self.note_failure();
                }
                Err(err) => {
                    warn!(symbol = %self.symbol, error = %err, "market data connection error");
                    self.note_failure();
                }
            }

            if self.stop_flag.load(Ordering::Relaxed) {
                break;
            }

            info!(symbol = %self.symbol, backoff_secs = backoff.as_secs(), "reconnecting after backoff");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        info!(symbol = %self.symbol, "market data feed stopped");
    }

    fn note_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= DEGRADED_AFTER_FAILURES && !self.degraded.swap(true, Ordering::Relaxed) {
            error!(
                symbol = %self.symbol,
                failures,
                "LINK SEVERED: market data feed degraded after consecutive failures"
            );
        }
    }

    fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.degraded.store(false, Ordering::Relaxed);
    }

    async fn run_connection(&self) -> Result<()> {
        info!(symbol = %self.symbol, url = %self.ws_url, "connecting to market data feed");

        let (ws_stream, _response) = connect_async(&self.ws_url)
            .await
            .context("failed to connect to market data WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        let inst_id = normalize_symbol(&self.symbol);
        let subscribe = serde_json::json!({
            "op": "subscribe",
            "args": [
                {"channel": "ticker", "instId": inst_id},
                {"channel": "candle1m", "instId": inst_id},
            ]
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("failed to send subscription")?;

        info!(symbol = %self.symbol, "market data feed connected and subscribed");
        self.note_success();

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await; // first tick fires immediately; discard it

        let mut in_progress_candle: Option<Candle> = None;

        loop {
            if self.stop_flag.load(Ordering::Relaxed) {
                return Ok(());
            }

            tokio::select! {
                _ = keepalive.tick() => {
                    if write.send(Message::Text("ping".to_string())).await.is_err() {
                        anyhow::bail!("failed to send keepalive ping");
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if text == "ping" {
                                let _ = write.send(Message::Text("pong".to_string())).await;
                                continue;
                            }
                            if text == "pong" {
                                continue;
                            }
                            self.handle_frame(&text, &mut in_progress_candle);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(symbol = %self.symbol, "market data stream closed");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            return Err(err.into());
                        }
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str, in_progress_candle: &mut Option<Candle>) {
        let root: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, "dropped unparseable market data frame");
                return;
            }
        };

        let channel = root["arg"]["channel"].as_str().unwrap_or_default();
        match channel {
            "ticker" => self.handle_ticker(&root),
            "candle1m" => self.handle_candle(&root, in_progress_candle),
            _ => {}
        }
    }

    fn handle_ticker(&self, root: &serde_json::Value) {
        let Some(data) = root["data"].get(0) else { return };

        let last = match parse_f64(&data["last"]) {
            Some(v) => v,
            None => return,
        };
        let bid = parse_f64(&data["bidPx"]).unwrap_or(0.0);
        let ask = parse_f64(&data["askPx"]).unwrap_or(0.0);
        let volume_24h = parse_f64(&data["vol24h"]).unwrap_or(0.0);
        let timestamp = data["ts"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
            .unwrap_or_else(Utc::now);

        let tick = Tick {
            last_price: last,
            bid,
            ask,
            volume_24h,
            timestamp,
        };

        if !tick.is_valid() {
            debug!(symbol = %self.symbol, "dropped invalid tick");
            return;
        }

        // Dedup-by-last-price: a frame whose last price matches the cached
        // value produces no new Tick.
        let unchanged = self
            .latest
            .read()
            .as_ref()
            .map(|cached| (cached.last_price - tick.last_price).abs() < f64::EPSILON)
            .unwrap_or(false);
        if unchanged {
            return;
        }

        *self.latest.write() = Some(tick);
        let _ = self.tick_tx.send(tick);
    }

    fn handle_candle(&self, root: &serde_json::Value, in_progress: &mut Option<Candle>) {
        let Some(row) = root["data"].get(0).and_then(|d| d.as_array()) else { return };
        if row.len() < 6 {
            return;
        }

        let open_time = match row[0].as_str().and_then(|s| s.parse::<i64>().ok()) {
            Some(v) => v,
            None => return,
        };
        let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
            parse_f64(&row[1]),
            parse_f64(&row[2]),
            parse_f64(&row[3]),
            parse_f64(&row[4]),
            parse_f64(&row[5]),
        ) else {
            return;
        };

        if let Some(prev) = in_progress.take() {
            if prev.open_time != open_time {
                // The bucket advanced; the previous in-progress candle is
                // now final.
                let mut closed = prev;
                closed.is_closed = true;
                let key = CandleKey {
                    symbol: self.symbol.clone(),
                    interval: "1m".to_string(),
                };
                self.candles.update(key, closed);
            }
        }

        let candle = Candle {
            open_time,
            close_time: open_time + 59_999,
            open,
            high,
            low,
            close,
            volume,
            is_closed: false,
        };
        let key = CandleKey {
            symbol: self.symbol.clone(),
            interval: "1m".to_string(),
        };
        self.candles.update(key, candle.clone());
        *in_progress = Some(candle);
    }

    /// Update the depth snapshot for this symbol's orderbook. Exposed for
    /// callers that maintain a separate depth channel (e.g. REST polling
    /// fallback); the combined WebSocket protocol does not push depth
    /// frames, only `ticker`/`candle1m`.
    pub fn orderbook(&self) -> Arc<OrderBookManager> {
        self.orderbook.clone()
    }
}

fn parse_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Normalize an internal `BTC-USDT-PERP`-style symbol into the venue's
/// `instId` form. The exact normalization rule is a collaborator concern;
/// this feed passes the configured symbol through unchanged.
fn normalize_symbol(symbol: &str) -> String {
    symbol.to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> Arc<MarketDataFeed> {
        MarketDataFeed::new(
            "BTC-USDT-PERP",
            "wss://example.invalid/ws",
            Arc::new(CandleBuffer::new(100)),
            Arc::new(OrderBookManager::new()),
        )
    }

    #[test]
    fn starts_with_no_latest_tick_and_is_stale() {
        let f = feed();
        assert!(f.latest().is_none());
        assert!(f.is_stale());
        assert!(!f.is_degraded());
    }

    #[test]
    fn ticker_frame_updates_latest_and_dedups() {
        let f = feed();
        let mut in_progress = None;
        let frame = serde_json::json!({
            "action": "push",
            "arg": {"channel": "ticker", "instId": "BTC-USDT-PERP"},
            "data": [{"last": "88000.5", "bidPx": "88000.0", "askPx": "88001.0", "vol24h": "123.0", "ts": "1700000000000"}]
        })
        .to_string();

        f.handle_frame(&frame, &mut in_progress);
        let tick = f.latest().unwrap();
        assert!((tick.last_price - 88000.5).abs() < 1e-9);

        // Same last price again: no-op, but must not panic or replace with
        // a different timestamp in a way a subscriber would observe twice.
        f.handle_frame(&frame, &mut in_progress);
        assert_eq!(f.latest().unwrap().timestamp, tick.timestamp);
    }

    #[test]
    fn candle_frame_finalizes_previous_bucket_on_rollover() {
        let f = feed();
        let mut in_progress = None;

        let first = serde_json::json!({
            "action": "push",
            "arg": {"channel": "candle1m", "instId": "BTC-USDT-PERP"},
            "data": [["0", "100.0", "101.0", "99.0", "100.5", "10.0"]]
        })
        .to_string();
        f.handle_frame(&first, &mut in_progress);

        let second = serde_json::json!({
            "action": "push",
            "arg": {"channel": "candle1m", "instId": "BTC-USDT-PERP"},
            "data": [["60000", "100.5", "102.0", "100.0", "101.5", "8.0"]]
        })
        .to_string();
        f.handle_frame(&second, &mut in_progress);

        let key = CandleKey {
            symbol: "BTC-USDT-PERP".to_string(),
            interval: "1m".to_string(),
        };
        let closed = f.candles.get_closed(&key, 10);
        assert_eq!(closed.len(), 1);
        assert!((closed[0].close - 100.5).abs() < 1e-9);
    }

    #[test]
    fn invalid_ticker_frame_is_dropped() {
        let f = feed();
        let mut in_progress = None;
        let frame = serde_json::json!({
            "action": "push",
            "arg": {"channel": "ticker", "instId": "BTC-USDT-PERP"},
            "data": [{"last": "-1.0", "bidPx": "0", "askPx": "0", "vol24h": "0", "ts": "1700000000000"}]
        })
        .to_string();
        f.handle_frame(&frame, &mut in_progress);
        assert!(f.latest().is_none());
    }
}
