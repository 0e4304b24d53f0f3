// report.rs — thin persisted-state summary for the `report` subcommand.
//
// Loads every subsystem's snapshot file the same way `Engine::new` does and
// dumps it as pretty JSON. No aggregation or formatting beyond that.

use crate::ask_question::AskQuestionState;
use crate::bandit::ContextualBandit;
use crate::budget::BudgetState;
use crate::coin_selector::CoinSelector;
use crate::config::EngineConfig;
use crate::engine::RuntimeState;
use crate::feedback::FeedbackState;
use crate::idempotency::IdempotencyLedger;
use crate::improvement::ImprovementState;
use crate::persistence;

fn dump<T: serde::Serialize>(label: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("=== {label} ===\n{s}\n"),
        Err(e) => log::error!("report: failed to serialize {label}: {e}"),
    }
}

pub fn run(cfg: &EngineConfig) -> i32 {
    let budget: BudgetState = persistence::load_json(&cfg.budget_state_path);
    let idempotency: IdempotencyLedger = persistence::load_json(&cfg.idempotency_state_path);
    let bandit: ContextualBandit = persistence::load_json(&cfg.bandit_state_path);
    let coin_selector: CoinSelector = persistence::load_json(&cfg.coin_selector_state_path);
    let feedback: FeedbackState = persistence::load_json(&cfg.feedback_state_path);
    let improvement: ImprovementState = persistence::load_json(&cfg.improvement_state_path);
    let (runtime, ask_question): (RuntimeState, AskQuestionState) = persistence::load_json(&cfg.runtime_state_path);

    dump("budget", &budget);
    dump("idempotency", &idempotency);
    dump("bandit", &bandit);
    dump("coin_selector", &coin_selector);
    dump("feedback", &feedback);
    dump("improvement", &improvement);
    dump("runtime", &runtime);
    dump("ask_question", &ask_question);

    println!(
        "cycle={} paused={} peak_equity={:.2} blocked_coins={}",
        runtime.cycle_counter,
        runtime.manual_pause,
        runtime.peak_equity,
        runtime.blocked_coins.len()
    );

    0
}
