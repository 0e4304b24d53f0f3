// strategy.rs — C6 Strategy Engine.
//
// A regime classifier and two signal builders. The classifier computes a
// label from an ordered threshold ladder (turbulent / trending / ranging /
// no_trade), same shape used for cooldown/eligibility gating elsewhere in
// the crate.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::ReasonCode;
use crate::market_data::{self, Candle, MarketDataBuffer, Regime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn is_buy(&self) -> bool {
        matches!(self, Side::Long)
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionPlan {
    pub tp_price: f64,
    pub sl_price: f64,
    pub time_stop_ms: i64,
}

#[derive(Debug, Clone)]
pub struct Signal {
    pub coin: String,
    pub side: Side,
    pub entry_price: f64,
    pub size: f64,
    pub maker_only: bool,
    pub protection: ProtectionPlan,
    pub regime: Regime,
    pub arm: String,
}

/// Ordered rule evaluation per spec: turbulence → trend → range → no-trade.
/// The first matching rule wins.
pub fn classify_regime(coin: &str, md: &MarketDataBuffer, candles: &[Candle], cfg: &EngineConfig) -> Regime {
    if let Some(ret1m) = recent_return_abs(md, coin) {
        if ret1m > cfg.turbulence_ret_1m_pct / 100.0 {
            return Regime::Turbulent;
        }
    }

    if candles.len() >= 50 {
        let adx_val = market_data::adx(candles, 14);
        let gap_bps = market_data::trend_strength(candles, 20, 50);
        if let (Some(adx_val), Some(gap_bps)) = (adx_val, gap_bps) {
            if adx_val >= cfg.trend_adx_min && gap_bps.abs() >= cfg.trend_ema_gap_min_bps {
                return Regime::Trending;
            }
            if adx_val <= cfg.range_adx_max && gap_bps.abs() <= cfg.range_ema_gap_max_bps {
                return Regime::Ranging;
            }
        }
    }

    Regime::NoTrade
}

fn recent_return_abs(md: &MarketDataBuffer, coin: &str) -> Option<f64> {
    let history = md.price_histories.get(coin)?;
    if history.len() < 2 {
        return None;
    }
    let (_, first) = history.front()?;
    let (_, last) = history.back()?;
    if *first <= 0.0 {
        return None;
    }
    Some(((last - first) / first).abs())
}

/// No-trade guards run before any signal is built. Order matters: the
/// cheapest/most-decisive checks run first.
pub fn no_trade_guards(coin: &str, md: &MarketDataBuffer, cfg: &EngineConfig, whitelisted: bool) -> Result<(), ReasonCode> {
    if !whitelisted {
        return Err(ReasonCode::NoTradeUnsupportedSymbol);
    }
    md.quality_gate(coin, cfg)?;
    Ok(())
}

pub fn build_trend_signal(coin: &str, md: &MarketDataBuffer, candles: &[Candle], cfg: &EngineConfig, arm: &str) -> Option<Signal> {
    let mid = md.mid(coin)?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let ema20 = market_data::ema(&closes, 20)?;
    let atr_pct = market_data::atr_percent(candles, 14)?;

    let side = if mid > ema20 { Side::Long } else { Side::Short };
    let aggressive_ratio = md.recent_aggressive_volume_ratio(coin, 50)?;
    let imbalance = md.top5_imbalance(coin)?;

    let aligned = match side {
        Side::Long => aggressive_ratio >= cfg.trend_aggressor_ratio_min && imbalance >= cfg.trend_imbalance_min,
        Side::Short => (1.0 - aggressive_ratio) >= cfg.trend_aggressor_ratio_min && imbalance <= -cfg.trend_imbalance_min,
    };
    if !aligned {
        return None;
    }

    // Pullback-to-EMA entry: enter at the EMA itself (a resting maker level)
    // rather than chasing the current mid.
    let entry_price = ema20;

    let sl_pct = (cfg.trend_sl_atr_mult * atr_pct / 100.0)
        .max(cfg.trend_sl_min_pct / 100.0)
        .clamp(cfg.trend_sl_min_clamp_pct / 100.0, cfg.trend_sl_max_clamp_pct / 100.0);
    let tp_pct = sl_pct * cfg.trend_tp_mult;

    let (tp_price, sl_price) = match side {
        Side::Long => (entry_price * (1.0 + tp_pct), entry_price * (1.0 - sl_pct)),
        Side::Short => (entry_price * (1.0 - tp_pct), entry_price * (1.0 + sl_pct)),
    };

    Some(Signal {
        coin: coin.to_string(),
        side,
        entry_price,
        size: 0.0, // sized by execution.rs against risk/notional limits
        maker_only: true,
        protection: ProtectionPlan { tp_price, sl_price, time_stop_ms: cfg.time_stop_ms },
        regime: Regime::Trending,
        arm: arm.to_string(),
    })
}

pub fn build_range_signal(coin: &str, md: &MarketDataBuffer, candles: &[Candle], cfg: &EngineConfig, arm: &str) -> Option<Signal> {
    if candles.len() < cfg.range_vwap_bars {
        return None;
    }
    let window = &candles[candles.len() - cfg.range_vwap_bars..];
    let vwap_px = market_data::vwap(window)?;
    let z = market_data::z_score_from_vwap(window)?;

    if z.abs() < cfg.range_z_entry {
        return None;
    }

    // Mean-reversion: buy when price is far below VWAP, sell when far above.
    let side = if z < 0.0 { Side::Long } else { Side::Short };
    let entry_price = md.mid(coin)?;

    let sl_pct = cfg.default_sl_bps / 10_000.0;
    let tp_distance = (entry_price - vwap_px).abs().max(entry_price * cfg.default_tp_bps / 10_000.0);

    let (tp_price, sl_price) = match side {
        Side::Long => (entry_price + tp_distance, entry_price * (1.0 - sl_pct)),
        Side::Short => (entry_price - tp_distance, entry_price * (1.0 + sl_pct)),
    };

    Some(Signal {
        coin: coin.to_string(),
        side,
        entry_price,
        size: 0.0,
        maker_only: true,
        protection: ProtectionPlan { tp_price, sl_price, time_stop_ms: cfg.time_stop_ms },
        regime: Regime::Ranging,
        arm: arm.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_candles(n: usize, price: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle { open: price, high: price + 1.0, low: price - 1.0, close: price, volume: 10.0, start_ms: i as u64 * 60_000 })
            .collect()
    }

    #[test]
    fn classify_regime_flat_series_is_no_trade() {
        let md = MarketDataBuffer::new(4000);
        let candles = flat_candles(60, 100.0);
        let cfg = EngineConfig::default();
        let regime = classify_regime("BTC", &md, &candles, &cfg);
        assert_eq!(regime, Regime::NoTrade);
    }

    #[test]
    fn no_trade_guard_rejects_unwhitelisted_symbol() {
        let md = MarketDataBuffer::new(4000);
        let cfg = EngineConfig::default();
        assert_eq!(no_trade_guards("DOGE", &md, &cfg, false), Err(ReasonCode::NoTradeUnsupportedSymbol));
    }
}
