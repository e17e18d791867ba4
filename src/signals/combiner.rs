// =============================================================================
// SignalCombiner — pure four-channel weighted signal
// =============================================================================
//
// `combine` is deterministic and side-effect free: no I/O, no locks, no
// clock reads. Each channel maps its raw indicator into a bounded per-channel
// contribution before weighting; the sum is returned unnormalized
// (`Σ weight × contribution` across OBI/RSI/EMA/Momentum).
// =============================================================================

use crate::indicators::{ema::calculate_ema, rsi::calculate_rsi};
use crate::market_data::Depth;
use crate::runtime_config::TradingConfig;
use crate::types::PriceWindow;

const RSI_PERIOD: usize = 14;
const EMA_PERIOD: usize = 20;
const MOMENTUM_LOOKBACK: usize = 10;

/// Weighted sum of the OBI / RSI / EMA / Momentum channels. Any channel
/// whose required history is absent contributes zero. The result is
/// unnormalized and may exceed `[-1,1]`, bounded only to `[-2,2]` via the
/// individual channel clamps.
pub fn combine(price_window: &PriceWindow, depth: Option<&Depth>, config: &TradingConfig) -> f64 {
    let obi = obi_contribution(depth, config);
    let rsi = rsi_contribution(price_window, config);
    let ema = ema_contribution(price_window, config);
    let momentum = momentum_contribution(price_window, config);

    obi + rsi + ema + momentum
}

fn obi_contribution(depth: Option<&Depth>, config: &TradingConfig) -> f64 {
    match depth.and_then(Depth::imbalance) {
        Some(obi) => obi * config.weight_obi,
        None => 0.0,
    }
}

fn rsi_contribution(price_window: &PriceWindow, config: &TradingConfig) -> f64 {
    let closes = price_window.as_vec();
    let series = calculate_rsi(&closes, RSI_PERIOD);
    let Some(&rsi) = series.last() else {
        return 0.0;
    };

    let raw = if rsi < 30.0 {
        0.5
    } else if rsi > 70.0 {
        -0.5
    } else {
        0.0
    };
    raw * config.weight_rsi
}

fn ema_contribution(price_window: &PriceWindow, config: &TradingConfig) -> f64 {
    let closes = price_window.as_vec();
    let series = calculate_ema(&closes, EMA_PERIOD);
    let (Some(&ema20), Some(&price)) = (series.last(), closes.last()) else {
        return 0.0;
    };
    if ema20 == 0.0 {
        return 0.0;
    }

    let deviation = (price - ema20) / ema20;
    let magnified = (deviation * 10.0).clamp(-0.5, 0.5);
    magnified * config.weight_ema
}

fn momentum_contribution(price_window: &PriceWindow, config: &TradingConfig) -> f64 {
    let price = match price_window.last() {
        Some(p) => p,
        None => return 0.0,
    };
    let reference = match price_window.nth_from_end(MOMENTUM_LOOKBACK) {
        Some(p) => p,
        None => return 0.0,
    };
    if reference == 0.0 {
        return 0.0;
    }

    let raw = (price - reference) / reference;
    let magnified = (raw * 20.0).clamp(-0.5, 0.5);
    magnified * config.weight_momentum
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn window_from(prices: &[f64]) -> PriceWindow {
        let mut w = PriceWindow::new(prices.len().max(1));
        for &p in prices {
            w.push(p);
        }
        w
    }

    #[test]
    fn empty_window_contributes_zero() {
        let window = PriceWindow::new(100);
        let config = TradingConfig::default();
        let result = combine(&window, None, &config);
        assert_eq!(result, 0.0);
    }

    #[test]
    fn obi_matches_known_ratio() {
        // bids 100, asks 50 -> OBI +0.33, weight 0.30.
        let window = PriceWindow::new(100);
        let depth = Depth {
            bids: vec![(88000.0, 100.0)],
            asks: vec![(88001.0, 50.0)],
        };
        let config = TradingConfig::default();
        let result = combine(&window, Some(&depth), &config);
        let expected_obi = (100.0 - 50.0) / 150.0 * config.weight_obi;
        assert!((result - expected_obi).abs() < 1e-6);
    }

    #[test]
    fn result_is_always_finite_and_bounded() {
        let prices: Vec<f64> = (0..50).map(|i| 87000.0 + i as f64 * 20.0).collect();
        let window = window_from(&prices);
        let depth = Depth {
            bids: vec![(88000.0, 100.0)],
            asks: vec![(88001.0, 50.0)],
        };
        let config = TradingConfig::default();
        let result = combine(&window, Some(&depth), &config);
        assert!(result.is_finite());
        assert!((-2.0..=2.0).contains(&result));
    }

    #[test]
    fn rsi_overbought_contributes_negative() {
        let prices: Vec<f64> = (1..=30).map(|x| x as f64).collect(); // strictly ascending -> RSI 100
        let window = window_from(&prices);
        let config = TradingConfig::default();
        let result = rsi_contribution(&window, &config);
        assert!(result < 0.0);
    }

    #[test]
    fn momentum_requires_full_lookback() {
        let window = window_from(&[100.0, 101.0, 102.0]);
        let config = TradingConfig::default();
        assert_eq!(momentum_contribution(&window, &config), 0.0);
    }
}
