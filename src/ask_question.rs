// ask_question.rs — C12 Ask-Question Dispatcher Gate.
//
// Gates when the engine is allowed to surface a question to the operator:
// a daily cap, per-coin/per-reason cooldowns, fingerprint dedup so the same
// question isn't asked twice in a window, and a pending-question TTL that
// resolves to a safe default action if the operator never answers. Grounded
// on `monitor.rs`'s cooldown/threshold-ladder gating shape, applied here to
// a notification gate instead of a trading-halt decision.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Ignore,
    Pause,
    Flatten,
    Resume,
    Hold,
    CancelOrders,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub fingerprint: String,
    pub coin: Option<String>,
    pub reason: String,
    pub prompt: String,
    pub asked_at: DateTime<Utc>,
    pub ttl_sec: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl PendingQuestion {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.asked_at).num_seconds() >= self.ttl_sec
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AskQuestionState {
    pub daily_count: u32,
    pub day_start: Option<DateTime<Utc>>,
    pub last_asked_per_coin: HashMap<String, DateTime<Utc>>,
    pub last_asked_per_reason: HashMap<String, DateTime<Utc>>,
    pub recent_fingerprints: HashMap<String, DateTime<Utc>>,
    pub pending: Option<PendingQuestion>,
}

#[derive(Debug, PartialEq)]
pub enum GateDecision {
    Allow,
    Suppressed(&'static str),
}

pub struct AskQuestionGate {
    state: AskQuestionState,
}

impl AskQuestionGate {
    pub fn new() -> Self {
        Self { state: AskQuestionState::default() }
    }

    pub fn restore(state: AskQuestionState) -> Self {
        Self { state }
    }

    pub fn snapshot(&self) -> AskQuestionState {
        self.state.clone()
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let is_new_day = match self.state.day_start {
            Some(start) => now.date_naive() != start.date_naive(),
            None => true,
        };
        if is_new_day {
            self.state.daily_count = 0;
            self.state.day_start = Some(now);
        }
    }

    /// Decides whether a candidate question may be surfaced. Does not mark
    /// it as asked — call `record_asked` once the decision is `Allow` and
    /// the operator has actually been notified.
    pub fn gate(&mut self, coin: Option<&str>, reason: &str, fingerprint: &str, now: DateTime<Utc>, cfg: &EngineConfig) -> GateDecision {
        self.roll_day(now);

        if self.state.pending.is_some() {
            return GateDecision::Suppressed("question already pending");
        }
        if self.state.daily_count >= cfg.ask_question_daily_cap {
            return GateDecision::Suppressed("daily cap reached");
        }
        if let Some(coin) = coin {
            if let Some(last) = self.state.last_asked_per_coin.get(coin) {
                if (now - *last).num_milliseconds() < cfg.ask_question_per_coin_cooldown_ms {
                    return GateDecision::Suppressed("coin cooldown active");
                }
            }
        }
        if let Some(last) = self.state.last_asked_per_reason.get(reason) {
            if (now - *last).num_milliseconds() < cfg.ask_question_per_reason_cooldown_ms {
                return GateDecision::Suppressed("reason cooldown active");
            }
        }
        if let Some(last) = self.state.recent_fingerprints.get(fingerprint) {
            if (now - *last).num_milliseconds() < cfg.ask_question_dedup_window_ms {
                return GateDecision::Suppressed("duplicate question fingerprint");
            }
        }

        GateDecision::Allow
    }

    pub fn record_asked(&mut self, question: PendingQuestion, now: DateTime<Utc>) {
        self.state.daily_count += 1;
        if let Some(coin) = &question.coin {
            self.state.last_asked_per_coin.insert(coin.clone(), now);
        }
        self.state.last_asked_per_reason.insert(question.reason.clone(), now);
        self.state.recent_fingerprints.insert(question.fingerprint.clone(), now);
        self.state.pending = Some(question);
    }

    pub fn answer(&mut self, answer: impl Into<String>) -> Option<PendingQuestion> {
        let mut q = self.state.pending.take()?;
        q.answer = Some(answer.into());
        Some(q)
    }

    /// Resolves an expired pending question to its safe default action,
    /// clearing it so a new question can be asked.
    pub fn resolve_expired(&mut self, now: DateTime<Utc>, cfg: &EngineConfig) -> Option<(PendingQuestion, DefaultAction)> {
        let expired = self.state.pending.as_ref().map(|q| q.is_expired(now)).unwrap_or(false);
        if !expired {
            return None;
        }
        let q = self.state.pending.take()?;
        let age_ms = (now - q.asked_at).num_milliseconds();
        let action = if age_ms >= cfg.ask_question_blocked_age_threshold_ms {
            DefaultAction::Flatten
        } else {
            DefaultAction::Pause
        };
        Some((q, action))
    }

    pub fn has_pending(&self) -> bool {
        self.state.pending.is_some()
    }
}

impl Default for AskQuestionGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an operator reply string to the command the engine actually runs.
/// Unrecognised input defaults to `Hold` (keep the pause/blocked state as-is)
/// rather than `Ignore`, since silently resuming on a malformed reply is the
/// wrong failure mode for a halt-adjacent gate.
pub fn map_operator_command(reply: &str) -> DefaultAction {
    match reply.trim().to_lowercase().as_str() {
        "pause" | "halt" => DefaultAction::Pause,
        "flatten" | "close" => DefaultAction::Flatten,
        "resume" | "continue" => DefaultAction::Resume,
        "cancel" | "cancel_orders" => DefaultAction::CancelOrders,
        _ => DefaultAction::Hold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig {
            ask_question_daily_cap: 2,
            ask_question_per_coin_cooldown_ms: 60_000,
            ask_question_per_reason_cooldown_ms: 10_000,
            ask_question_dedup_window_ms: 30_000,
            ask_question_default_ttl_sec: 300,
            ask_question_blocked_age_threshold_ms: 600_000,
            ..EngineConfig::default()
        }
    }

    fn question(now: DateTime<Utc>) -> PendingQuestion {
        PendingQuestion { fingerprint: "fp1".to_string(), coin: Some("BTC".to_string()), reason: "no_protection".to_string(), prompt: "?".to_string(), asked_at: now, ttl_sec: 300, answer: None }
    }

    #[test]
    fn daily_cap_suppresses_after_limit() {
        let mut gate = AskQuestionGate::new();
        let cfg = cfg();
        let now = Utc::now();
        assert_eq!(gate.gate(Some("BTC"), "r1", "fp1", now, &cfg), GateDecision::Allow);
        gate.record_asked(question(now), now);
        assert!(gate.answer("ack").is_some());

        assert_eq!(gate.gate(Some("ETH"), "r2", "fp2", now, &cfg), GateDecision::Allow);
        gate.record_asked(PendingQuestion { fingerprint: "fp2".to_string(), coin: Some("ETH".to_string()), reason: "r2".to_string(), prompt: "?".to_string(), asked_at: now, ttl_sec: 300, answer: None }, now);
        gate.answer("ack");

        assert_eq!(gate.gate(Some("SOL"), "r3", "fp3", now, &cfg), GateDecision::Suppressed("daily cap reached"));
    }

    #[test]
    fn pending_question_blocks_new_gate_checks() {
        let mut gate = AskQuestionGate::new();
        let cfg = cfg();
        let now = Utc::now();
        gate.record_asked(question(now), now);
        assert_eq!(gate.gate(Some("ETH"), "other", "fp-other", now, &cfg), GateDecision::Suppressed("question already pending"));
    }

    #[test]
    fn expired_question_resolves_to_pause_before_block_threshold() {
        let mut gate = AskQuestionGate::new();
        let cfg = cfg();
        let now = Utc::now();
        gate.record_asked(question(now), now);
        let later = now + chrono::Duration::seconds(301);
        let (_, action) = gate.resolve_expired(later, &cfg).unwrap();
        assert_eq!(action, DefaultAction::Pause);
        assert!(!gate.has_pending());
    }

    #[test]
    fn map_operator_command_recognises_flatten() {
        assert_eq!(map_operator_command("Flatten"), DefaultAction::Flatten);
        assert_eq!(map_operator_command("banana"), DefaultAction::Hold);
    }

    #[test]
    fn map_operator_command_recognises_resume_and_cancel() {
        assert_eq!(map_operator_command("Resume"), DefaultAction::Resume);
        assert_eq!(map_operator_command("cancel"), DefaultAction::CancelOrders);
    }
}
