// improvement.rs — C8 Improvement Loop.
//
// A canary state machine over parameter overrides: approved overrides are
// the accepted baseline, a canary trials a candidate override set for a
// fixed number of cycles and is accepted or rolled back against that
// baseline, with repeated rollbacks pushing the candidate into quarantine.
// Grounded on `monitor.rs`'s threshold-ladder `evaluate_action` shape
// (compare a rolling metric against warning/critical bands) reused here for
// the accept/rollback decision.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

pub type Overrides = HashMap<String, f64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryState {
    pub candidate: Overrides,
    pub baseline: Overrides,
    pub remaining_cycles: u32,
    pub reward_delta_sum_bps: f64,
    pub cycles_observed: u32,
    pub peak_drawdown_bps: f64,
    pub error_count: u32,
    pub cycle_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImprovementState {
    pub approved_overrides: Overrides,
    pub canary: Option<CanaryState>,
    pub quarantined: HashSet<String>,
    pub quarantine_remaining: HashMap<String, u32>,
    pub rollback_counts: HashMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanaryOutcome {
    StillRunning,
    Accepted,
    Quarantined,
}

fn candidate_fingerprint(candidate: &Overrides) -> String {
    let mut keys: Vec<&String> = candidate.keys().collect();
    keys.sort();
    keys.into_iter().map(|k| format!("{k}={}", candidate[k])).collect::<Vec<_>>().join(",")
}

pub struct ImprovementLoop {
    state: ImprovementState,
}

impl ImprovementLoop {
    pub fn new() -> Self {
        Self { state: ImprovementState::default() }
    }

    pub fn restore(state: ImprovementState) -> Self {
        Self { state }
    }

    pub fn snapshot(&self) -> ImprovementState {
        self.state.clone()
    }

    /// Overrides currently in effect: the canary's candidate if one is
    /// running, else the approved baseline.
    pub fn current_overrides(&self) -> &Overrides {
        match &self.state.canary {
            Some(c) => &c.candidate,
            None => &self.state.approved_overrides,
        }
    }

    /// Starts a canary trial. Refuses if one is already running or the
    /// candidate is quarantined. The baseline is snapshotted by value from
    /// `approved_overrides` at this moment — later approvals don't
    /// retroactively change what this canary rolls back to.
    pub fn start_canary(&mut self, candidate: Overrides, cfg: &EngineConfig) -> Result<(), String> {
        if self.state.canary.is_some() {
            return Err("canary already running".to_string());
        }
        if self.state.quarantined.contains(&candidate_fingerprint(&candidate)) {
            return Err("candidate is quarantined".to_string());
        }
        self.state.canary = Some(CanaryState {
            candidate,
            baseline: self.state.approved_overrides.clone(),
            remaining_cycles: cfg.gpt_canary_cycles,
            reward_delta_sum_bps: 0.0,
            cycles_observed: 0,
            peak_drawdown_bps: 0.0,
            error_count: 0,
            cycle_count: 0,
        });
        Ok(())
    }

    /// Feeds one cycle's worth of observed results into the active canary.
    /// `reward_delta_bps` is the candidate's reward minus the baseline arm's
    /// reward for the same context, in bps of notional.
    pub fn on_cycle_result(&mut self, reward_delta_bps: f64, drawdown_bps: f64, was_error: bool, cfg: &EngineConfig) -> CanaryOutcome {
        let Some(canary) = self.state.canary.as_mut() else {
            return CanaryOutcome::StillRunning;
        };

        canary.reward_delta_sum_bps += reward_delta_bps;
        canary.cycles_observed += 1;
        canary.cycle_count += 1;
        canary.peak_drawdown_bps = canary.peak_drawdown_bps.max(drawdown_bps);
        if was_error {
            canary.error_count += 1;
        }
        canary.remaining_cycles = canary.remaining_cycles.saturating_sub(1);

        let error_rate = canary.error_count as f64 / canary.cycle_count.max(1) as f64;

        // Hard rollback triggers can fire before the window completes.
        if canary.peak_drawdown_bps >= cfg.rollback_drawdown_bps || error_rate >= cfg.rollback_error_rate {
            return self.rollback(cfg);
        }

        if canary.remaining_cycles > 0 {
            return CanaryOutcome::StillRunning;
        }

        let mean_delta = canary.reward_delta_sum_bps / canary.cycles_observed.max(1) as f64;
        if mean_delta >= cfg.min_reward_delta_bps {
            self.accept()
        } else {
            self.rollback(cfg)
        }
    }

    fn accept(&mut self) -> CanaryOutcome {
        if let Some(canary) = self.state.canary.take() {
            self.state.approved_overrides = canary.candidate;
        }
        CanaryOutcome::Accepted
    }

    /// A rolled-back candidate is quarantined immediately, not on repeat.
    fn rollback(&mut self, cfg: &EngineConfig) -> CanaryOutcome {
        let Some(canary) = self.state.canary.take() else {
            return CanaryOutcome::StillRunning;
        };
        let fp = candidate_fingerprint(&canary.candidate);
        *self.state.rollback_counts.entry(fp.clone()).or_insert(0) += 1;
        self.state.quarantined.insert(fp.clone());
        self.state.quarantine_remaining.insert(fp, cfg.quarantine_cycles);
        CanaryOutcome::Quarantined
    }

    /// Decrements quarantine counters; releases entries whose quarantine has
    /// expired. Call once per cycle regardless of whether a canary is active.
    pub fn tick_quarantine(&mut self) {
        let mut expired = Vec::new();
        for (fp, remaining) in self.state.quarantine_remaining.iter_mut() {
            if *remaining > 0 {
                *remaining -= 1;
            }
            if *remaining == 0 {
                expired.push(fp.clone());
            }
        }
        for fp in expired {
            self.state.quarantine_remaining.remove(&fp);
            self.state.quarantined.remove(&fp);
        }
    }

    pub fn is_canary_active(&self) -> bool {
        self.state.canary.is_some()
    }
}

impl Default for ImprovementLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig { gpt_canary_cycles: 3, min_reward_delta_bps: 1.0, rollback_drawdown_bps: 100.0, rollback_error_rate: 0.5, quarantine_cycles: 10, ..EngineConfig::default() }
    }

    fn candidate() -> Overrides {
        let mut m = HashMap::new();
        m.insert("trend_sl_atr_mult".to_string(), 1.5);
        m
    }

    #[test]
    fn canary_accepts_after_window_with_positive_delta() {
        let mut il = ImprovementLoop::new();
        let cfg = cfg();
        il.start_canary(candidate(), &cfg).unwrap();
        il.on_cycle_result(5.0, 0.0, false, &cfg);
        il.on_cycle_result(5.0, 0.0, false, &cfg);
        let outcome = il.on_cycle_result(5.0, 0.0, false, &cfg);
        assert_eq!(outcome, CanaryOutcome::Accepted);
        assert!(!il.is_canary_active());
        assert_eq!(il.snapshot().approved_overrides.get("trend_sl_atr_mult"), Some(&1.5));
    }

    #[test]
    fn canary_rolls_back_and_quarantines_on_first_negative_delta() {
        let mut il = ImprovementLoop::new();
        let cfg = cfg();
        il.start_canary(candidate(), &cfg).unwrap();
        il.on_cycle_result(-5.0, 0.0, false, &cfg);
        il.on_cycle_result(-5.0, 0.0, false, &cfg);
        let outcome = il.on_cycle_result(-5.0, 0.0, false, &cfg);
        assert_eq!(outcome, CanaryOutcome::Quarantined);
        assert!(il.snapshot().quarantined.contains(&candidate_fingerprint(&candidate())));
        assert!(il.start_canary(candidate(), &cfg).is_err());
    }

    #[test]
    fn drawdown_breach_triggers_immediate_rollback_and_quarantine() {
        let mut il = ImprovementLoop::new();
        let cfg = cfg();
        il.start_canary(candidate(), &cfg).unwrap();
        let outcome = il.on_cycle_result(5.0, 150.0, false, &cfg);
        assert_eq!(outcome, CanaryOutcome::Quarantined);
    }

    #[test]
    fn quarantined_candidate_cannot_be_restarted() {
        let mut il = ImprovementLoop::new();
        let cfg = cfg();
        il.start_canary(candidate(), &cfg).unwrap();
        il.on_cycle_result(-5.0, 0.0, false, &cfg);
        il.on_cycle_result(-5.0, 0.0, false, &cfg);
        il.on_cycle_result(-5.0, 0.0, false, &cfg);
        assert!(il.start_canary(candidate(), &cfg).is_err());
    }
}
