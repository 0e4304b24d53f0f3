// bandit.rs — C4 Contextual Bandit.
//
// A UCB1-style bandit keyed by (coin, regime). Stats decay multiplicatively
// on each update so the bandit keeps adapting to a drifting regime rather
// than averaging over its entire history. The per-bucket rolling-stats
// shape generalises to one bucket per arm instead of one global window.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

pub type ArmId = String;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArmStats {
    pub pulls: f64,
    pub reward_sum: f64,
    pub errors: u64,
}

impl ArmStats {
    pub fn mean_reward(&self) -> f64 {
        if self.pulls <= 0.0 {
            0.0
        } else {
            self.reward_sum / self.pulls
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContextualBandit {
    // key: "{coin}:{regime}" -> arm_id -> stats
    stats: HashMap<String, HashMap<ArmId, ArmStats>>,
}

fn context_key(coin: &str, regime: &str) -> String {
    format!("{coin}:{regime}")
}

impl ContextualBandit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Round-robins through arms that have fewer than one pull before
    /// falling back to argmax UCB1. `arms` must be non-empty.
    pub fn select_arm(&self, coin: &str, regime: &str, arms: &[ArmId], cfg: &EngineConfig) -> Option<ArmId> {
        if arms.is_empty() {
            return None;
        }
        let ctx = self.stats.get(&context_key(coin, regime));

        for arm in arms {
            let pulls = ctx.and_then(|m| m.get(arm)).map(|s| s.pulls).unwrap_or(0.0);
            if pulls < 1.0 {
                return Some(arm.clone());
            }
        }

        let total_pulls: f64 = arms
            .iter()
            .map(|a| ctx.and_then(|m| m.get(a)).map(|s| s.pulls).unwrap_or(0.0))
            .sum();

        arms.iter()
            .max_by(|a, b| {
                let score_a = ucb_score(ctx.and_then(|m| m.get(*a)), total_pulls, cfg.bandit_exploration_c);
                let score_b = ucb_score(ctx.and_then(|m| m.get(*b)), total_pulls, cfg.bandit_exploration_c);
                score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    pub fn update(&mut self, coin: &str, regime: &str, arm: &ArmId, reward: f64, is_error: bool, cfg: &EngineConfig) {
        let bucket = self.stats.entry(context_key(coin, regime)).or_default();
        let entry = bucket.entry(arm.clone()).or_default();
        entry.pulls *= cfg.bandit_decay;
        entry.reward_sum *= cfg.bandit_decay;
        entry.pulls += 1.0;
        if is_error {
            entry.errors += 1;
        } else {
            entry.reward_sum += reward;
        }
    }

    pub fn arm_stats(&self, coin: &str, regime: &str, arm: &ArmId) -> Option<ArmStats> {
        self.stats.get(&context_key(coin, regime))?.get(arm).cloned()
    }

    pub fn contexts_seen(&self) -> usize {
        self.stats.len()
    }
}

fn ucb_score(stats: Option<&ArmStats>, total_pulls: f64, c: f64) -> f64 {
    match stats {
        None => f64::INFINITY,
        Some(s) if s.pulls <= 0.0 => f64::INFINITY,
        Some(s) => s.mean_reward() + c * ((total_pulls.max(1.0)).ln() / s.pulls).sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn untried_arms_are_explored_first() {
        let bandit = ContextualBandit::new();
        let arms = vec!["trend".to_string(), "range".to_string()];
        let chosen = bandit.select_arm("BTC", "trending", &arms, &cfg()).unwrap();
        assert!(arms.contains(&chosen));
    }

    #[test]
    fn eventually_covers_all_arms_given_enough_selections() {
        let mut bandit = ContextualBandit::new();
        let arms = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let arm = bandit.select_arm("ETH", "ranging", &arms, &cfg()).unwrap();
            seen.insert(arm.clone());
            bandit.update("ETH", "ranging", &arm, 0.1, false, &cfg());
        }
        assert_eq!(seen.len(), arms.len());
    }

    #[test]
    fn error_update_increments_error_counter_not_reward() {
        let mut bandit = ContextualBandit::new();
        let arm = "trend".to_string();
        bandit.update("BTC", "trending", &arm, 5.0, true, &cfg());
        let stats = bandit.arm_stats("BTC", "trending", &arm).unwrap();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.reward_sum, 0.0);
    }

    #[test]
    fn decay_shrinks_old_pulls_relative_to_new() {
        let mut bandit = ContextualBandit::new();
        let arm = "trend".to_string();
        let cfg = EngineConfig { bandit_decay: 0.5, ..EngineConfig::default() };
        bandit.update("BTC", "trending", &arm, 1.0, false, &cfg);
        bandit.update("BTC", "trending", &arm, 1.0, false, &cfg);
        let stats = bandit.arm_stats("BTC", "trending", &arm).unwrap();
        // pulls: (1*0.5+1)=1.5 not 2.0 — decay visible
        assert!(stats.pulls < 2.0);
    }
}
