// =============================================================================
// Order Book Manager — top-of-book depth feeding the OBI signal channel
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Top-10-levels depth snapshot, as consumed by `signals::combiner::combine`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Depth {
    /// `(price, qty)` pairs, best bid first.
    pub bids: Vec<(f64, f64)>,
    /// `(price, qty)` pairs, best ask first.
    pub asks: Vec<(f64, f64)>,
}

/// Number of top-of-book levels retained per side.
const DEPTH_LEVELS: usize = 10;

impl Depth {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|(p, _)| *p)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|(p, _)| *p)
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let mid = (bid + ask) / 2.0;
        if mid <= 0.0 {
            return None;
        }
        Some(((ask - bid) / mid) * 10_000.0)
    }

    /// Order-book imbalance: `(Σbid − Σask) / (Σbid + Σask)` over whatever
    /// levels are stored (callers already pass at most `DEPTH_LEVELS`).
    pub fn imbalance(&self) -> Option<f64> {
        let bid_sum: f64 = self.bids.iter().map(|(_, q)| q).sum();
        let ask_sum: f64 = self.asks.iter().map(|(_, q)| q).sum();
        let total = bid_sum + ask_sum;
        if total <= 0.0 {
            return None;
        }
        Some((bid_sum - ask_sum) / total)
    }
}

/// Manages the latest depth snapshot per symbol.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, Depth>>,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the depth snapshot for `symbol`, trimming to the top
    /// `DEPTH_LEVELS` on each side.
    pub fn update(&self, symbol: &str, mut bids: Vec<(f64, f64)>, mut asks: Vec<(f64, f64)>) {
        bids.truncate(DEPTH_LEVELS);
        asks.truncate(DEPTH_LEVELS);
        self.books
            .write()
            .insert(symbol.to_string(), Depth { bids, asks });
    }

    pub fn get(&self, symbol: &str) -> Option<Depth> {
        self.books.read().get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.books.read().keys().cloned().collect()
    }
}

impl Default for OrderBookManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imbalance_matches_known_ratio() {
        // bids sum 100, asks sum 50 -> OBI = +0.33.
        let depth = Depth {
            bids: vec![(88000.0, 100.0)],
            asks: vec![(88001.0, 50.0)],
        };
        let obi = depth.imbalance().unwrap();
        assert!((obi - 0.3333333).abs() < 1e-4);
    }

    #[test]
    fn truncates_to_top_ten_levels() {
        let manager = OrderBookManager::new();
        let bids: Vec<(f64, f64)> = (0..20).map(|i| (88000.0 - i as f64, 1.0)).collect();
        let asks: Vec<(f64, f64)> = (0..20).map(|i| (88001.0 + i as f64, 1.0)).collect();
        manager.update("BTC-USDT-PERP", bids, asks);
        let depth = manager.get("BTC-USDT-PERP").unwrap();
        assert_eq!(depth.bids.len(), DEPTH_LEVELS);
        assert_eq!(depth.asks.len(), DEPTH_LEVELS);
    }

    #[test]
    fn empty_book_yields_none() {
        let manager = OrderBookManager::new();
        assert!(manager.get("BTC-USDT-PERP").is_none());
    }
}
