// coin_selector.rs — C5 Coin Selector.
//
// A per-coin UCB score over liquidity/reject-adjusted reward, gated by
// cooldowns and the market-data quality gate. Per-coin stat buckets use the
// same windowed-stats shape as `bandit.rs`; eligibility gating follows the
// same ordered-threshold-ladder shape as `strategy.rs`'s regime classifier.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::market_data::MarketDataBuffer;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoinStats {
    pub pulls: f64,
    pub reward_sum: f64,
    pub reject_streak: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub orders: u64,
    pub rejects: u64,
    pub fills: u64,
    pub spread_bps: f64,
    pub depth_usd: f64,
    pub expected_fill_prob: f64,
    pub vol_bps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoinSelector {
    stats: HashMap<String, CoinStats>,
}

impl CoinSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_order_submitted(&mut self, coin: &str) {
        self.stats.entry(coin.to_string()).or_default().orders += 1;
    }

    pub fn note_reject(&mut self, coin: &str, cfg: &EngineConfig, now: DateTime<Utc>) {
        let entry = self.stats.entry(coin.to_string()).or_default();
        entry.rejects += 1;
        entry.reject_streak += 1;
        if entry.reject_streak >= cfg.coin_selector_reject_streak_limit {
            entry.cooldown_until = Some(now + chrono::Duration::milliseconds(cfg.coin_selector_cooldown_ms));
            entry.reject_streak = 0;
        }
    }

    pub fn note_result(&mut self, coin: &str, reward: f64) {
        let entry = self.stats.entry(coin.to_string()).or_default();
        entry.pulls += 1.0;
        entry.reward_sum += reward;
        entry.reject_streak = 0;
        entry.fills += 1;
    }

    /// Refreshes the liquidity/volatility stats the score penalty and
    /// exploration terms read, from the current book. Call once per coin on
    /// the coin-selection refresh timer.
    pub fn refresh_market_stats(&mut self, coin: &str, md: &MarketDataBuffer, cfg: &EngineConfig) {
        let Some(book) = md.l2_books.get(coin) else { return };
        let entry = self.stats.entry(coin.to_string()).or_default();
        if let Some(spread) = book.spread_bps() {
            entry.spread_bps = spread;
        }
        entry.depth_usd = book.depth_usd(5);
        entry.vol_bps = md.volatility_bps(coin);
        if let Some(mid) = book.mid_price().filter(|m| *m > 0.0) {
            let hint_sz = cfg.min_order_notional / mid;
            if let Some(prob) = md.expected_fill_prob(coin, true, hint_sz, cfg) {
                entry.expected_fill_prob = prob;
            }
        }
    }

    fn is_eligible(&self, coin: &str, md: &MarketDataBuffer, cfg: &EngineConfig, now: DateTime<Utc>) -> bool {
        if let Some(stats) = self.stats.get(coin) {
            if let Some(until) = stats.cooldown_until {
                if now < until {
                    return false;
                }
            }
        }
        if md.quality_gate(coin, cfg).is_err() {
            return false;
        }
        let Some(book) = md.l2_books.get(coin) else { return false };
        let Some(spread_bps) = book.spread_bps() else { return false };
        if spread_bps > cfg.coin_selector_max_spread_bps {
            return false;
        }
        book.depth_usd(5) >= cfg.coin_selector_min_depth_usd
    }

    /// Public UCB score for a single coin, for callers (e.g. the engine's
    /// signal-ranking step) that need it outside of `select_coins`.
    pub fn score_for(&self, coin: &str, cfg: &EngineConfig) -> f64 {
        let total_pulls: f64 = self.stats.values().map(|s| s.pulls).sum();
        self.score(coin, total_pulls, cfg)
    }

    /// UCB mean-reward term, penalized by reject rate and spread overshoot,
    /// with an exploration bonus widened for coins whose expected fill
    /// probability is still low (i.e. whose estimate is least trustworthy).
    fn score(&self, coin: &str, total_pulls: f64, cfg: &EngineConfig) -> f64 {
        match self.stats.get(coin) {
            None => f64::INFINITY,
            Some(s) if s.pulls <= 0.0 => f64::INFINITY,
            Some(s) => {
                let mean = s.reward_sum / s.pulls;
                let reject_rate = if s.orders > 0 { s.rejects as f64 / s.orders as f64 } else { 0.0 };
                let spread_excess = (s.spread_bps - cfg.coin_selector_max_spread_bps).max(0.0);
                let exploration_boost = 1.0 + (1.0 - s.expected_fill_prob).clamp(0.0, 1.0);
                let exploration = cfg.bandit_exploration_c * exploration_boost * ((total_pulls.max(1.0)).ln() / s.pulls).sqrt();
                mean - cfg.coin_selector_reject_penalty * reject_rate - spread_excess * cfg.coin_selector_spread_penalty_weight + exploration
            }
        }
    }

    /// Top-K coins by UCB score among eligible ones. If fewer than K are
    /// eligible, falls back to coins with the earliest-expiring cooldown so
    /// the engine always has a non-empty candidate list when the universe
    /// allows it.
    pub fn select_coins(&self, universe: &[String], md: &MarketDataBuffer, cfg: &EngineConfig, now: DateTime<Utc>) -> Vec<String> {
        let eligible: Vec<&String> = universe.iter().filter(|c| self.is_eligible(c, md, cfg, now)).collect();
        let total_pulls: f64 = universe.iter().map(|c| self.stats.get(c).map(|s| s.pulls).unwrap_or(0.0)).sum();

        if !eligible.is_empty() {
            let mut scored: Vec<(&String, f64)> = eligible.iter().map(|c| (*c, self.score(c, total_pulls, cfg))).collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            return scored.into_iter().take(cfg.coin_selector_top_k).map(|(c, _)| c.clone()).collect();
        }

        let mut fallback: Vec<&String> = universe.iter().collect();
        fallback.sort_by_key(|c| {
            self.stats
                .get(*c)
                .and_then(|s| s.cooldown_until)
                .map(|t| t.timestamp_millis())
                .unwrap_or(i64::MIN)
        });
        fallback.into_iter().take(cfg.coin_selector_top_k).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig { coin_selector_top_k: 1, coin_selector_reject_streak_limit: 2, ..EngineConfig::default() }
    }

    fn md_with_good_book(coin: &str) -> MarketDataBuffer {
        let mut md = MarketDataBuffer::new(4000);
        md.update_l2(crate::market_data::L2BookSnapshot {
            coin: coin.to_string(),
            bids: vec![crate::market_data::L2Level { px: 29_990.0, sz: 10.0 }],
            asks: vec![crate::market_data::L2Level { px: 30_010.0, sz: 10.0 }],
            received_at_ms: crate::market_data::now_ms(),
        });
        md
    }

    #[test]
    fn reject_streak_triggers_cooldown() {
        let mut sel = CoinSelector::new();
        let cfg = cfg();
        let now = Utc::now();
        sel.note_reject("BTC", &cfg, now);
        sel.note_reject("BTC", &cfg, now);
        let md = md_with_good_book("BTC");
        assert!(!sel.is_eligible("BTC", &md, &cfg, now));
    }

    #[test]
    fn high_reject_rate_lowers_score_below_clean_coin() {
        let cfg = cfg();
        let mut sel = CoinSelector::new();
        for _ in 0..10 {
            sel.note_order_submitted("BTC");
            sel.note_result("BTC", 2.0);
        }
        for _ in 0..10 {
            sel.note_order_submitted("ETH");
        }
        for _ in 0..8 {
            sel.note_reject("ETH", &cfg, Utc::now());
        }
        for _ in 0..2 {
            sel.note_result("ETH", 2.0);
        }
        let total_pulls = 20.0;
        assert!(sel.score("BTC", total_pulls, &cfg) > sel.score("ETH", total_pulls, &cfg));
    }

    #[test]
    fn select_coins_prefers_untried_coin() {
        let sel = CoinSelector::new();
        let cfg = cfg();
        let md = md_with_good_book("BTC");
        let universe = vec!["BTC".to_string()];
        let selected = sel.select_coins(&universe, &md, &cfg, Utc::now());
        assert_eq!(selected, vec!["BTC".to_string()]);
    }
}
