// market_data.rs — C3 Market Data Buffer + derived indicators.
//
// Bounded per-coin L2/trade/candle/price-history rings (`l2_books`,
// `trade_buffers`, `price_histories`, `contexts`), stall detection, and the
// technical-indicator/quality-gate functions the strategy and coin-selector
// layers consume.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::ReasonCode;

const STALL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2Level {
    pub px: f64,
    pub sz: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2BookSnapshot {
    pub coin: String,
    pub bids: Vec<L2Level>,
    pub asks: Vec<L2Level>,
    pub received_at_ms: u64,
}

impl L2BookSnapshot {
    pub fn mid_price(&self) -> Option<f64> {
        Some((self.bids.first()?.px + self.asks.first()?.px) / 2.0)
    }

    pub fn spread_bps(&self) -> Option<f64> {
        let bid = self.bids.first()?.px;
        let ask = self.asks.first()?.px;
        let mid = (bid + ask) / 2.0;
        if mid <= 0.0 {
            return None;
        }
        Some(((ask - bid) / mid) * 10_000.0)
    }

    pub fn depth_usd(&self, levels: usize) -> f64 {
        let bid_depth: f64 = self.bids.iter().take(levels).map(|l| l.px * l.sz).sum();
        let ask_depth: f64 = self.asks.iter().take(levels).map(|l| l.px * l.sz).sum();
        bid_depth + ask_depth
    }

    /// (sum bid sz − sum ask sz) / (sum bid sz + sum ask sz) over the top N levels.
    pub fn top_n_imbalance(&self, n: usize) -> Option<f64> {
        let bid_sz: f64 = self.bids.iter().take(n).map(|l| l.sz).sum();
        let ask_sz: f64 = self.asks.iter().take(n).map(|l| l.sz).sum();
        let total = bid_sz + ask_sz;
        if total <= 0.0 {
            return None;
        }
        Some((bid_sz - ask_sz) / total)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub coin: String,
    pub is_buyer_aggressor: bool,
    pub px: f64,
    pub sz: f64,
    pub time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub start_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarketContext {
    pub funding_rate: f64,
    pub open_interest: f64,
    pub oracle_px: f64,
    pub day_ntl_vlm: f64,
    pub last_update_ms: u64,
}

pub struct MarketDataBuffer {
    pub ring_capacity: usize,
    pub l2_books: HashMap<String, L2BookSnapshot>,
    pub trade_buffers: HashMap<String, VecDeque<Trade>>,
    pub candles: HashMap<String, VecDeque<Candle>>,
    pub contexts: HashMap<String, MarketContext>,
    pub price_histories: HashMap<String, VecDeque<(u64, f64)>>,
    pub last_ws_message_ms: u64,
}

impl MarketDataBuffer {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring_capacity,
            l2_books: HashMap::new(),
            trade_buffers: HashMap::new(),
            candles: HashMap::new(),
            contexts: HashMap::new(),
            price_histories: HashMap::new(),
            last_ws_message_ms: now_ms(),
        }
    }

    pub fn touch(&mut self) {
        self.last_ws_message_ms = now_ms();
    }

    pub fn is_stalled(&self) -> bool {
        now_ms().saturating_sub(self.last_ws_message_ms) > STALL_TIMEOUT_SECS * 1_000
    }

    pub fn update_l2(&mut self, snap: L2BookSnapshot) {
        self.touch();
        if let Some(mid) = snap.mid_price() {
            let history = self.price_histories.entry(snap.coin.clone()).or_insert_with(VecDeque::new);
            history.push_back((now_ms(), mid));
            while history.len() > self.ring_capacity {
                history.pop_front();
            }
        }
        self.l2_books.insert(snap.coin.clone(), snap);
    }

    pub fn add_trade(&mut self, trade: Trade) {
        self.touch();
        let buf = self.trade_buffers.entry(trade.coin.clone()).or_insert_with(VecDeque::new);
        buf.push_back(trade);
        while buf.len() > self.ring_capacity {
            buf.pop_front();
        }
    }

    pub fn add_candle(&mut self, coin: &str, candle: Candle) {
        let ring = self.candles.entry(coin.to_string()).or_insert_with(VecDeque::new);
        ring.push_back(candle);
        while ring.len() > self.ring_capacity {
            ring.pop_front();
        }
    }

    pub fn update_context(&mut self, coin: String, ctx: MarketContext) {
        self.contexts.insert(coin, ctx);
    }

    pub fn mid(&self, coin: &str) -> Option<f64> {
        self.l2_books.get(coin).and_then(|b| b.mid_price())
    }

    /// Log-returns over the rolling price history.
    pub fn returns(&self, coin: &str) -> Vec<f64> {
        let history = match self.price_histories.get(coin) {
            Some(h) if h.len() > 1 => h,
            _ => return Vec::new(),
        };
        history
            .iter()
            .zip(history.iter().skip(1))
            .map(|((_, p0), (_, p1))| (p1 / p0).ln())
            .collect()
    }

    /// Standard deviation of returns, in basis points — reused as the
    /// z-score volatility input.
    pub fn volatility_bps(&self, coin: &str) -> f64 {
        let returns = self.returns(coin);
        if returns.len() < 10 {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        variance.sqrt() * 10_000.0
    }

    pub fn z_score(&self, coin: &str) -> Option<f64> {
        let history = self.price_histories.get(coin)?;
        if history.len() < 10 {
            return None;
        }
        let mids: Vec<f64> = history.iter().map(|(_, p)| *p).collect();
        let mean = mids.iter().sum::<f64>() / mids.len() as f64;
        let variance = mids.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / mids.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev <= 0.0 {
            return Some(0.0);
        }
        let last = *mids.last()?;
        Some((last - mean) / std_dev)
    }

    pub fn has_stale_data(&self, coin: &str, cfg: &EngineConfig) -> bool {
        let book_age_ok = self
            .l2_books
            .get(coin)
            .map(|b| now_ms().saturating_sub(b.received_at_ms) <= cfg.stale_book_age.as_millis() as u64)
            .unwrap_or(false);
        !book_age_ok || self.is_stalled()
    }

    pub fn recent_aggressive_volume_ratio(&self, coin: &str, window_n: usize) -> Option<f64> {
        let buf = self.trade_buffers.get(coin)?;
        if buf.is_empty() {
            return None;
        }
        let recent: Vec<&Trade> = buf.iter().rev().take(window_n).collect();
        let buy_vol: f64 = recent.iter().filter(|t| t.is_buyer_aggressor).map(|t| t.sz).sum();
        let total_vol: f64 = recent.iter().map(|t| t.sz).sum();
        if total_vol <= 0.0 {
            return None;
        }
        Some(buy_vol / total_vol)
    }

    pub fn top5_imbalance(&self, coin: &str) -> Option<f64> {
        self.l2_books.get(coin).and_then(|b| b.top_n_imbalance(5))
    }

    pub fn quality_gate(&self, coin: &str, cfg: &EngineConfig) -> Result<(), ReasonCode> {
        let book = self.l2_books.get(coin).ok_or(ReasonCode::NoTradeBookMissing)?;
        if book.bids.is_empty() || book.asks.is_empty() {
            return Err(ReasonCode::NoTradeBookMissing);
        }
        let spread_bps = book.spread_bps().ok_or(ReasonCode::NoTradeBookMissing)?;
        if spread_bps > cfg.quality_gate_max_spread_bps {
            return Err(ReasonCode::NoTradeSpread);
        }
        if book.depth_usd(5) < cfg.quality_gate_min_book_depth_usd {
            return Err(ReasonCode::NoTradeQualityGate);
        }
        if self.has_stale_data(coin, cfg) {
            return Err(ReasonCode::NoTradeStaleData);
        }
        Ok(())
    }

    /// Fill-probability proxy combining same-side depth against spread and
    /// realized volatility: wide spreads and choppy conditions both lower the
    /// odds a resting maker order gets filled before it needs requoting.
    /// `order_sz` is accepted for API symmetry with the venue's per-order
    /// sizing but the depth/spread/vol normalization dominates in practice.
    pub fn expected_fill_prob(&self, coin: &str, is_buy: bool, order_sz: f64, cfg: &EngineConfig) -> Option<f64> {
        let _ = order_sz;
        let book = self.l2_books.get(coin)?;
        let levels = if is_buy { &book.bids } else { &book.asks };
        let depth_usd: f64 = levels.iter().take(5).map(|l| l.px * l.sz).sum();
        let depth_norm = depth_usd / cfg.quality_gate_min_book_depth_usd.max(1.0);
        let spread_bps = book.spread_bps()?;
        let spread_norm = spread_bps / cfg.quality_gate_max_spread_bps.max(1.0);
        let vol_penalty = self.volatility_bps(coin) / 100.0;
        Some(((depth_norm / (spread_norm + vol_penalty + 0.25)) / 2.0).clamp(0.0, 1.0))
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ─── Indicator functions over candle series ────────────────────────────

pub fn ema_series(closes: &[f64], period: usize) -> Vec<f64> {
    if closes.is_empty() || period == 0 {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(closes.len());
    let mut prev = closes[0];
    out.push(prev);
    for &c in &closes[1..] {
        prev = c * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

pub fn ema(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied()
}

/// Average Directional Index over the given candle window (standard
/// Wilder smoothing with `period` lookback).
pub fn adx(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }
    let mut plus_dm = Vec::new();
    let mut minus_dm = Vec::new();
    let mut tr = Vec::new();

    for w in candles.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);
        let up_move = cur.high - prev.high;
        let down_move = prev.low - cur.low;
        plus_dm.push(if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 });
        minus_dm.push(if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 });
        tr.push((cur.high - cur.low).max((cur.high - prev.close).abs()).max((cur.low - prev.close).abs()));
    }

    let smooth = |series: &[f64]| -> Vec<f64> {
        if series.len() < period {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut sum: f64 = series[..period].iter().sum();
        out.push(sum);
        for &v in &series[period..] {
            sum = sum - (sum / period as f64) + v;
            out.push(sum);
        }
        out
    };

    let tr_s = smooth(&tr);
    let plus_s = smooth(&plus_dm);
    let minus_s = smooth(&minus_dm);
    if tr_s.is_empty() {
        return None;
    }

    let dx: Vec<f64> = tr_s
        .iter()
        .zip(plus_s.iter())
        .zip(minus_s.iter())
        .map(|((&tr, &p), &m)| {
            if tr <= 0.0 {
                return 0.0;
            }
            let plus_di = 100.0 * p / tr;
            let minus_di = 100.0 * m / tr;
            let sum = plus_di + minus_di;
            if sum <= 0.0 {
                0.0
            } else {
                100.0 * (plus_di - minus_di).abs() / sum
            }
        })
        .collect();

    if dx.len() < period {
        return dx.last().copied();
    }
    Some(dx[dx.len() - period..].iter().sum::<f64>() / period as f64)
}

/// Average True Range as a percentage of the last close.
pub fn atr_percent(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period + 1 {
        return None;
    }
    let mut trs = Vec::new();
    for w in candles.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);
        trs.push((cur.high - cur.low).max((cur.high - prev.close).abs()).max((cur.low - prev.close).abs()));
    }
    let recent = &trs[trs.len() - period..];
    let atr = recent.iter().sum::<f64>() / period as f64;
    let last_close = candles.last()?.close;
    if last_close <= 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}

pub fn vwap(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    let (num, den) = candles.iter().fold((0.0, 0.0), |(num, den), c| {
        let typical = (c.high + c.low + c.close) / 3.0;
        (num + typical * c.volume, den + c.volume)
    });
    if den <= 0.0 {
        return None;
    }
    Some(num / den)
}

pub fn z_score_from_vwap(candles: &[Candle]) -> Option<f64> {
    let vwap_px = vwap(candles)?;
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let mean = closes.iter().sum::<f64>() / closes.len() as f64;
    let variance = closes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / closes.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev <= 0.0 {
        return Some(0.0);
    }
    let last = *closes.last()?;
    Some((last - vwap_px) / std_dev)
}

pub fn trend_strength(candles: &[Candle], ema_fast: usize, ema_slow: usize) -> Option<f64> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let fast = ema(&closes, ema_fast)?;
    let slow = ema(&closes, ema_slow)?;
    if slow <= 0.0 {
        return None;
    }
    Some(((fast - slow) / slow) * 10_000.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    Turbulent,
    Trending,
    Ranging,
    NoTrade,
}

impl Regime {
    pub fn label(&self) -> &'static str {
        match self {
            Regime::Turbulent => "turbulent",
            Regime::Trending => "trending",
            Regime::Ranging => "ranging",
            Regime::NoTrade => "no_trade",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(o: f64, h: f64, l: f64, c: f64, v: f64, t: u64) -> Candle {
        Candle { open: o, high: h, low: l, close: c, volume: v, start_ms: t }
    }

    #[test]
    fn ema_converges_toward_constant_series() {
        let closes = vec![100.0; 50];
        let e = ema(&closes, 20).unwrap();
        assert!((e - 100.0).abs() < 1e-6);
    }

    #[test]
    fn atr_percent_is_positive_for_moving_series() {
        let candles: Vec<Candle> = (0..20)
            .map(|i| candle(100.0 + i as f64, 101.0 + i as f64, 99.0 + i as f64, 100.5 + i as f64, 10.0, i))
            .collect();
        let atr = atr_percent(&candles, 14).unwrap();
        assert!(atr > 0.0);
    }

    #[test]
    fn vwap_matches_volume_weighted_typical_price() {
        let candles = vec![candle(10.0, 12.0, 8.0, 10.0, 1.0, 0), candle(10.0, 12.0, 8.0, 10.0, 3.0, 1)];
        assert_eq!(vwap(&candles), Some(10.0));
    }

    #[test]
    fn quality_gate_rejects_missing_book() {
        let buf = MarketDataBuffer::new(4000);
        let cfg = EngineConfig::default();
        assert_eq!(buf.quality_gate("BTC", &cfg), Err(ReasonCode::NoTradeBookMissing));
    }

    #[test]
    fn expected_fill_prob_drops_with_wider_spread() {
        let cfg = EngineConfig::default();
        let mut tight = MarketDataBuffer::new(4000);
        tight.update_l2(L2BookSnapshot {
            coin: "BTC".to_string(),
            bids: vec![L2Level { px: 29_995.0, sz: 10.0 }],
            asks: vec![L2Level { px: 30_005.0, sz: 10.0 }],
            received_at_ms: now_ms(),
        });
        let mut wide = MarketDataBuffer::new(4000);
        wide.update_l2(L2BookSnapshot {
            coin: "BTC".to_string(),
            bids: vec![L2Level { px: 29_800.0, sz: 10.0 }],
            asks: vec![L2Level { px: 30_200.0, sz: 10.0 }],
            received_at_ms: now_ms(),
        });
        let tight_prob = tight.expected_fill_prob("BTC", true, 0.01, &cfg).unwrap();
        let wide_prob = wide.expected_fill_prob("BTC", true, 0.01, &cfg).unwrap();
        assert!(tight_prob > wide_prob);
    }

    #[test]
    fn quality_gate_rejects_wide_spread() {
        let mut buf = MarketDataBuffer::new(4000);
        buf.update_l2(L2BookSnapshot {
            coin: "BTC".to_string(),
            bids: vec![L2Level { px: 29_900.0, sz: 10.0 }],
            asks: vec![L2Level { px: 30_100.0, sz: 10.0 }],
            received_at_ms: now_ms(),
        });
        let cfg = EngineConfig { quality_gate_max_spread_bps: 10.0, ..EngineConfig::default() };
        assert_eq!(buf.quality_gate("BTC", &cfg), Err(ReasonCode::NoTradeSpread));
    }
}
