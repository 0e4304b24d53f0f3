// feedback.rs — C7 Feedback Loop.
//
// Bucketed rolling stats per (arm, coin, regime) instead of one global
// window, folding in the same dedup-by-hash fill ingestion idiom
// `execution.rs`'s `InternalInventory::reconcile` uses for dark fills.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub hash: String,
    pub coin: String,
    pub is_buy: bool,
    pub px: f64,
    pub sz: f64,
    pub fee: f64,
    pub is_maker: bool,
    pub closed_pnl: f64,
    pub time_ms: u64,
    pub expected_px: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub arm: String,
    pub coin: String,
    pub regime: String,
    pub reward: f64,
    pub time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RewardBucket {
    pub count: u64,
    pub reward_sum: f64,
    pub realized_sum: f64,
    pub fees_sum: f64,
    pub slippage_sum: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeedbackState {
    seen_fill_hashes: VecDeque<String>,
    seen_fill_set: HashSet<String>,
    execution_records: VecDeque<ExecutionRecord>,
    buckets: HashMap<String, RewardBucket>,
    pub peak_equity: f64,
}

fn bucket_key(arm: &str, coin: &str, regime: &str) -> String {
    format!("{arm}:{coin}:{regime}")
}

pub struct FeedbackLoop {
    state: FeedbackState,
}

impl FeedbackLoop {
    pub fn new() -> Self {
        Self { state: FeedbackState::default() }
    }

    pub fn restore(state: FeedbackState) -> Self {
        Self { state }
    }

    pub fn snapshot(&self) -> FeedbackState {
        self.state.clone()
    }

    /// Ingests a batch of fills, deduping by hash against the bounded
    /// (FIFO-capped) set of already-seen hashes: detect what's new, ignore
    /// what was already accounted for.
    pub fn ingest_fills(&mut self, fills: Vec<Fill>, cfg: &EngineConfig) -> Vec<Fill> {
        let mut fresh = Vec::new();
        for fill in fills {
            if self.state.seen_fill_set.contains(&fill.hash) {
                continue;
            }
            self.state.seen_fill_set.insert(fill.hash.clone());
            self.state.seen_fill_hashes.push_back(fill.hash.clone());
            while self.state.seen_fill_hashes.len() > cfg.feedback_fill_cap {
                if let Some(old) = self.state.seen_fill_hashes.pop_front() {
                    self.state.seen_fill_set.remove(&old);
                }
            }
            fresh.push(fill);
        }
        fresh
    }

    pub fn update_equity(&mut self, equity: f64) -> f64 {
        if equity > self.state.peak_equity {
            self.state.peak_equity = equity;
        }
        if self.state.peak_equity <= 0.0 {
            0.0
        } else {
            ((self.state.peak_equity - equity) / self.state.peak_equity) * 10_000.0
        }
    }

    /// reward = realized − fees − slippage − inventoryPenalty − ddPenalty + unrealizedDelta*weight
    pub fn compute_reward(
        &mut self,
        arm: &str,
        coin: &str,
        regime: &str,
        realized: f64,
        fees: f64,
        slippage: f64,
        inventory_notional: f64,
        drawdown_bps: f64,
        unrealized_delta: f64,
        cfg: &EngineConfig,
        now_ms: u64,
    ) -> f64 {
        let inventory_penalty = inventory_notional.abs() * cfg.feedback_inventory_penalty_bps / 10_000.0;
        let dd_penalty = drawdown_bps.max(0.0) * cfg.feedback_drawdown_penalty_bps / 10_000.0;
        let reward = realized - fees - slippage - inventory_penalty - dd_penalty + unrealized_delta * cfg.feedback_unrealized_weight;

        let bucket = self.state.buckets.entry(bucket_key(arm, coin, regime)).or_default();
        bucket.count += 1;
        bucket.reward_sum += reward;
        bucket.realized_sum += realized;
        bucket.fees_sum += fees;
        bucket.slippage_sum += slippage;

        self.state.execution_records.push_back(ExecutionRecord {
            arm: arm.to_string(),
            coin: coin.to_string(),
            regime: regime.to_string(),
            reward,
            time_ms: now_ms,
        });
        while self.state.execution_records.len() > cfg.feedback_execution_record_cap {
            self.state.execution_records.pop_front();
        }

        reward
    }

    pub fn bucket(&self, arm: &str, coin: &str, regime: &str) -> Option<&RewardBucket> {
        self.state.buckets.get(&bucket_key(arm, coin, regime))
    }

    /// Sum of all bucket reward_sum values, used by the cross-check invariant
    /// that bucketed sums equal the sum of individual execution records.
    pub fn total_bucketed_reward(&self) -> f64 {
        self.state.buckets.values().map(|b| b.reward_sum).sum()
    }

    pub fn total_execution_reward(&self) -> f64 {
        self.state.execution_records.iter().map(|r| r.reward).sum()
    }
}

impl Default for FeedbackLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(hash: &str) -> Fill {
        Fill { hash: hash.to_string(), coin: "BTC".to_string(), is_buy: true, px: 30_000.0, sz: 0.01, fee: 0.1, is_maker: true, closed_pnl: 0.0, time_ms: 0, expected_px: Some(30_000.0) }
    }

    #[test]
    fn duplicate_fill_hash_is_dropped() {
        let mut fl = FeedbackLoop::new();
        let cfg = EngineConfig::default();
        let fresh1 = fl.ingest_fills(vec![fill("h1")], &cfg);
        assert_eq!(fresh1.len(), 1);
        let fresh2 = fl.ingest_fills(vec![fill("h1")], &cfg);
        assert_eq!(fresh2.len(), 0);
    }

    #[test]
    fn bucket_sum_equals_execution_record_sum() {
        let mut fl = FeedbackLoop::new();
        let cfg = EngineConfig::default();
        fl.compute_reward("trend", "BTC", "trending", 10.0, 0.1, 0.05, 100.0, 0.0, 0.0, &cfg, 1);
        fl.compute_reward("trend", "BTC", "trending", -2.0, 0.1, 0.05, 100.0, 10.0, 1.0, &cfg, 2);
        assert!((fl.total_bucketed_reward() - fl.total_execution_reward()).abs() < 1e-9);
    }

    #[test]
    fn drawdown_tracks_peak_equity() {
        let mut fl = FeedbackLoop::new();
        fl.update_equity(10_000.0);
        fl.update_equity(12_000.0);
        let dd = fl.update_equity(11_000.0);
        assert!(dd > 0.0);
        assert_eq!(fl.state.peak_equity, 12_000.0);
    }
}
