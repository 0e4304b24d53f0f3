// engine.rs — C11 Trading Engine Core.
//
// Owns every piece of mutable engine state and runs the strategy cycle plus
// every independent periodic task. One `tokio::spawn` per background
// concern, shared state behind a single `Arc<tokio::sync::Mutex<Engine>>`
// with the same "lock, check, act" prologue repeated at the top of every
// timer loop, so mutation always happens on one logical thread even though
// the tasks run concurrently.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::ask_question::{AskQuestionGate, AskQuestionState, DefaultAction, GateDecision, PendingQuestion};
use crate::bandit::ContextualBandit;
use crate::budget::BudgetManager;
use crate::coin_selector::CoinSelector;
use crate::config::EngineConfig;
use crate::errors::{EngineError, LocalError, RiskLimit};
use crate::exchange::{AssetMeta, ExchangeClient, OrderStatus};
use crate::execution::{EntryDecision, OrderExecutor};
use crate::feedback::{Fill, FeedbackLoop};
use crate::idempotency::IdempotencyLedger;
use crate::improvement::{CanaryOutcome, ImprovementLoop};
use crate::market_data::{Candle, MarketDataBuffer, Regime};
use crate::persistence::{self, EventStreamWriter};
use crate::protection::{self, TpSlState};
use crate::risk::{self, RiskSnapshot, RiskTracker};
use crate::strategy::{self, ProtectionPlan, Signal};
use crate::ws::{self, PrivateEvent, StallFlag};

/// Engine state that must survive a restart: cycle counter, PnL-day anchors,
/// per-coin day-blocks, manual pause, and the open-reward-attribution context
/// for the cycle currently awaiting its own scoring pass.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeState {
    pub cycle_counter: u64,
    pub day_start: Option<DateTime<Utc>>,
    pub start_of_day_equity: f64,
    pub peak_equity: f64,
    pub manual_pause: bool,
    pub blocked_coins: HashMap<String, DateTime<Utc>>,
    pub pending_reward_context: Option<PendingRewardContext>,
    pub reconcile_failure_streak: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRewardContext {
    pub cycle: u64,
    pub coin: String,
    pub regime: String,
    pub arm: String,
    pub baseline_realized: f64,
    pub baseline_fees: f64,
    pub baseline_slippage: f64,
    pub baseline_notional: f64,
    pub baseline_unrealized: f64,
    pub protection: ProtectionPlan,
}

/// Append-only event stream fan-out, one `EventStreamWriter` per stream name
/// created lazily on first use (`metrics`, `execution`, `orders`, `fills`,
/// `errors`, `improvements`, `reports`, `candles`, `funding`, plus any
/// `market_*`/`user_*` diagnostics) so new streams can be emitted without
/// declaring a field per stream.
pub struct Streams {
    dir: String,
    writers: HashMap<String, EventStreamWriter>,
}

impl Streams {
    pub fn new(dir: String) -> Self {
        Self { dir, writers: HashMap::new() }
    }

    pub fn emit(&mut self, stream: &str, now: DateTime<Utc>, event: serde_json::Value) {
        let writer = self.writers.entry(stream.to_string()).or_insert_with(|| EventStreamWriter::new(&self.dir, stream));
        if let Err(e) = writer.append(now, &event) {
            log::error!("streams: failed to append to {stream}: {e}");
        }
    }
}

fn kill_switch_present(cfg: &EngineConfig) -> bool {
    Path::new(&cfg.kill_switch_path).exists()
}

fn write_kill_switch(cfg: &EngineConfig, reason: &str) {
    if let Some(parent) = Path::new(&cfg.kill_switch_path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = std::fs::write(&cfg.kill_switch_path, reason) {
        log::error!("engine: failed to write kill-switch file: {e}");
    } else {
        log::error!("engine: runtime kill-switch written: {reason}");
    }
}

/// The engine owns all mutable trading state exclusively. Collaborators
/// (exchange client, market data buffer) are reached through typed handles;
/// nothing outside this struct mutates bandit/feedback/ledger/inventory
/// state directly.
pub struct Engine {
    pub cfg: EngineConfig,
    pub exchange: Box<dyn ExchangeClient>,
    pub md: Arc<Mutex<MarketDataBuffer>>,
    pub stall_flag: StallFlag,

    pub budget: BudgetManager,
    pub idempotency: IdempotencyLedger,
    pub risk: RiskTracker,
    pub bandit: ContextualBandit,
    pub coin_selector: CoinSelector,
    pub feedback: FeedbackLoop,
    pub improvement: ImprovementLoop,
    pub executor: OrderExecutor,
    pub ask_question: AskQuestionGate,

    pub universe: Vec<String>,
    pub selected_coins: Vec<String>,
    pub cycle_counter: u64,
    pub manual_pause: bool,
    pub stopping: bool,
    pub blocked_coins: HashMap<String, DateTime<Utc>>,
    pub pending_reward_context: Option<PendingRewardContext>,
    pub reconcile_failure_streak: u32,
    pub open_orders_authoritative: Option<usize>,
    pub open_orders: HashMap<String, OpenOrderRecord>,
    pub streams: Streams,
    pub blocked_cycle_timestamps: VecDeque<u64>,
    pub tpsl_state: HashMap<String, TpSlState>,
    pub ws_stall_timestamps: VecDeque<u64>,

    last_fill_poll_ms: u64,
}

/// Local record of a resting order as last seen on the venue, used only to
/// diff against the next `fetch_open_orders` poll for added/removed counts.
#[derive(Debug, Clone)]
pub struct OpenOrderRecord {
    pub coin: String,
    pub oid: Option<u64>,
    pub cloid: Option<String>,
}

impl Engine {
    pub async fn new(cfg: EngineConfig, mut exchange: Box<dyn ExchangeClient>, md: Arc<Mutex<MarketDataBuffer>>, stall_flag: StallFlag) -> Result<Self, LocalError> {
        exchange.load_universe().await?;

        let budget = BudgetManager::restore(persistence::load_json(&cfg.budget_state_path));
        let idempotency: IdempotencyLedger = persistence::load_json(&cfg.idempotency_state_path);
        let bandit: ContextualBandit = persistence::load_json(&cfg.bandit_state_path);
        let coin_selector: CoinSelector = persistence::load_json(&cfg.coin_selector_state_path);
        let feedback = FeedbackLoop::restore(persistence::load_json(&cfg.feedback_state_path));
        let improvement = ImprovementLoop::restore(persistence::load_json(&cfg.improvement_state_path));

        // Runtime state and the ask-question pending record share one file
        // (see `persist_all`), so they're loaded together as a pair.
        let (runtime, aq_state): (RuntimeState, AskQuestionState) = persistence::load_json(&cfg.runtime_state_path);
        let ask_question = AskQuestionGate::restore(aq_state);
        let starting_equity = runtime.start_of_day_equity.max(0.0);
        let risk = match runtime.day_start {
            Some(day_start) => RiskTracker::restore(day_start, starting_equity, runtime.peak_equity.max(starting_equity)),
            None => RiskTracker::new(starting_equity),
        };

        let universe = cfg.symbol_whitelist.clone();
        let streams = Streams::new(cfg.streams_dir.clone());

        // Re-hydrate protection-manager state from the venue's own open
        // orders rather than trusting any local snapshot: the venue is
        // always the authoritative source for what's actually resting.
        let boot_orders = exchange.fetch_open_orders().await.unwrap_or_default();
        let tpsl_state = protection::recover_from_open_orders(&boot_orders, crate::market_data::now_ms() as i64);
        let open_orders = open_order_map(&boot_orders);

        Ok(Self {
            cfg,
            exchange,
            md,
            stall_flag,
            budget,
            idempotency,
            risk,
            bandit,
            coin_selector,
            feedback,
            improvement,
            executor: OrderExecutor::new(),
            ask_question,
            universe,
            selected_coins: Vec::new(),
            cycle_counter: runtime.cycle_counter,
            manual_pause: runtime.manual_pause,
            stopping: false,
            blocked_coins: runtime.blocked_coins,
            pending_reward_context: runtime.pending_reward_context,
            reconcile_failure_streak: runtime.reconcile_failure_streak,
            open_orders_authoritative: Some(open_orders.len()),
            open_orders,
            streams,
            blocked_cycle_timestamps: VecDeque::new(),
            tpsl_state,
            ws_stall_timestamps: VecDeque::new(),
            last_fill_poll_ms: crate::market_data::now_ms(),
        })
    }

    fn runtime_state(&self) -> RuntimeState {
        RuntimeState {
            cycle_counter: self.cycle_counter,
            day_start: Some(self.risk.day_start()),
            start_of_day_equity: self.risk.start_of_day_equity(),
            peak_equity: self.risk.peak_equity(),
            manual_pause: self.manual_pause,
            blocked_coins: self.blocked_coins.clone(),
            pending_reward_context: self.pending_reward_context.clone(),
            reconcile_failure_streak: self.reconcile_failure_streak,
        }
    }

    /// Whole-state snapshot persistence: one JSON file per subsystem,
    /// written atomically. Called from the dedicated persistence timer.
    pub fn persist_all(&self) {
        persistence::save_json(&self.cfg.budget_state_path, &self.budget.snapshot());
        persistence::save_json(&self.cfg.idempotency_state_path, &self.idempotency);
        persistence::save_json(&self.cfg.bandit_state_path, &self.bandit);
        persistence::save_json(&self.cfg.coin_selector_state_path, &self.coin_selector);
        persistence::save_json(&self.cfg.feedback_state_path, &self.feedback.snapshot());
        persistence::save_json(&self.cfg.improvement_state_path, &self.improvement.snapshot());
        // Runtime state and the ask-question pending record share one file:
        // the ask-question TTL must survive a restart too.
        let mut runtime = self.runtime_state();
        let aq_state = self.ask_question.snapshot();
        runtime.pending_reward_context = self.pending_reward_context.clone();
        persistence::save_json(&self.cfg.runtime_state_path, &(runtime, aq_state));
    }

    async fn fetch_equity(&mut self) -> Result<f64, LocalError> {
        let state = self.exchange.fetch_clearinghouse_state().await?;
        self.budget.note_http_call(&self.cfg).map_err(|e| LocalError::Other(e.to_string()))?;
        let equity = state["marginSummary"]["accountValue"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| state["marginSummary"]["accountValue"].as_f64())
            .unwrap_or(self.risk.start_of_day_equity());
        Ok(equity)
    }

    // ── Strategy cycle ───────────────────────────────────────────────────

    pub async fn run_strategy_cycle(&mut self) -> Result<(), EngineError> {
        self.cycle_counter += 1;
        let now = Utc::now();

        self.score_previous_cycle(now).await?;

        let snapshot = self.refresh_risk_snapshot(now).await?;
        self.evaluate_risk_triggers(&snapshot, now).await;
        if let Some(risk_limit) = risk::assert_hard_limits(&snapshot, &self.cfg) {
            self.streams.emit("errors", now, json!({"event": "risk_limit_breach", "reason": risk_limit.to_string()}));
            return Err(EngineError::Risk(risk_limit));
        }

        self.sync_protection().await;

        if self.manual_pause {
            self.streams.emit("metrics", now, json!({"event": "cycle_no_signal", "reason": "manual_pause"}));
            return Ok(());
        }

        self.improvement.tick_quarantine();

        match self.select_best_signal().await {
            Some((signal, score)) => {
                self.blocked_cycle_timestamps.clear();
                self.execute_signal(signal, score, now).await?;
            }
            None => {
                self.streams.emit("metrics", now, json!({"event": "cycle_no_signal"}));
                self.maybe_dispatch_blocked_ask_question(now).await;
            }
        }

        Ok(())
    }

    /// Step 2: score the previous cycle's execution against the baseline
    /// captured when it was submitted, feeding bandit + coin-selector +
    /// improvement loop before anything else mutates this cycle.
    async fn score_previous_cycle(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        let Some(ctx) = self.pending_reward_context.take() else { return Ok(()) };

        let fills = self.exchange.fetch_user_fills_by_time(self.last_fill_poll_ms).await.map_err(EngineError::Local)?;
        self.budget.note_http_call(&self.cfg)?;
        let parsed = parse_fills(&fills);
        let fresh = self.feedback.ingest_fills(parsed, &self.cfg);

        let mut realized = ctx.baseline_realized;
        let mut fees = ctx.baseline_fees;
        let mut slippage = ctx.baseline_slippage;
        for fill in &fresh {
            if fill.coin != ctx.coin {
                continue;
            }
            realized += fill.closed_pnl;
            fees += fill.fee;
            if let Some(expected) = fill.expected_px {
                slippage += (fill.px - expected).abs() * fill.sz;
            }
            self.executor.note_fill(&fill.coin, fill.is_buy, fill.sz, fill.px, !fill.is_maker, fill.time_ms, Some(ctx.protection.clone()));
        }

        let mids = self.exchange.fetch_all_mids().await.map_err(EngineError::Local)?;
        self.budget.note_http_call(&self.cfg)?;
        let notional = self.executor.inventory.gross_notional(&mids);
        let unrealized_delta = notional - ctx.baseline_notional - ctx.baseline_unrealized;
        // feedback.rs is the single authoritative drawdown source — the
        // risk hard-limit check (refresh_risk_snapshot, below) reads the
        // same peak-equity tracker, never a second independent one.
        let equity = self.fetch_equity().await.map_err(EngineError::Local)?;
        let drawdown_bps = self.feedback.update_equity(equity);

        let reward = self.feedback.compute_reward(
            &ctx.arm,
            &ctx.coin,
            &ctx.regime,
            realized - ctx.baseline_realized,
            fees - ctx.baseline_fees,
            slippage - ctx.baseline_slippage,
            notional,
            drawdown_bps,
            unrealized_delta,
            &self.cfg,
            crate::market_data::now_ms(),
        );

        self.bandit.update(&ctx.coin, &ctx.regime, &ctx.arm, reward, false, &self.cfg);
        self.coin_selector.note_result(&ctx.coin, reward);

        if self.improvement.is_canary_active() {
            let baseline_reward = self.feedback.bucket(&ctx.arm, &ctx.coin, &ctx.regime).map(|b| b.reward_sum / b.count.max(1) as f64).unwrap_or(0.0);
            let reward_delta_bps = (reward - baseline_reward) * 10_000.0 / notional.max(1.0);
            let outcome = self.improvement.on_cycle_result(reward_delta_bps, drawdown_bps, false, &self.cfg);
            if outcome != CanaryOutcome::StillRunning {
                self.streams.emit("improvements", now, json!({"outcome": format!("{outcome:?}")}));
            }
        }

        self.last_fill_poll_ms = crate::market_data::now_ms();
        Ok(())
    }

    /// Step 3: daily PnL over the configured window, drawdown from C7,
    /// authoritative-if-reconciled open-order count, gross position notional.
    async fn refresh_risk_snapshot(&mut self, now: DateTime<Utc>) -> Result<RiskSnapshot, EngineError> {
        let equity = self.fetch_equity().await.map_err(EngineError::Local)?;
        self.risk.maybe_roll_day(now, equity, self.cfg.daily_pnl_window);
        self.risk.observe_equity(equity);

        let mids = self.exchange.fetch_all_mids().await.map_err(EngineError::Local)?;
        self.budget.note_http_call(&self.cfg)?;
        let position_notional = self.executor.inventory.gross_notional(&mids);
        let open_positions = self.executor.inventory.open_position_count();
        let open_orders = self.open_orders_authoritative.unwrap_or(open_positions);

        self.blocked_coins.retain(|_, until| *until > now);

        // Drawdown comes from feedback.rs's peak-equity tracker, the single
        // authoritative source shared with the canary reward calc.
        let drawdown_bps = self.feedback.update_equity(equity);
        Ok(self.risk.snapshot(equity, open_orders, open_positions, position_notional, drawdown_bps))
    }

    /// Step 5: attach missing TP/SL for every open position, debounced by
    /// `tpsl_state` so a steady position doesn't resubmit every cycle,
    /// enforcing the strategy's time-stop, and dropping state for any coin
    /// that's no longer open. Emergency-flattens and day-blocks any coin
    /// whose SL attachment fails.
    async fn sync_protection(&mut self) {
        let now = Utc::now();
        let now_ms = crate::market_data::now_ms() as i64;
        let coins: Vec<(String, f64, bool, f64, u64, Option<ProtectionPlan>)> = self
            .executor
            .inventory
            .positions
            .values()
            .filter_map(|p| p.side.map(|s| (p.coin.clone(), p.size, s.is_buy(), p.entry_price, p.opened_at_ms, p.protection.clone())))
            .collect();
        let open_coins: HashSet<String> = coins.iter().map(|(c, ..)| c.clone()).collect();
        self.tpsl_state.retain(|coin, _| open_coins.contains(coin));

        for (coin, size, is_buy, entry_price, opened_at_ms, carried) in coins {
            let Some(meta) = self.exchange.asset_meta(&coin) else { continue };

            if self.time_stop_hit(&coin, is_buy, entry_price, opened_at_ms, now_ms, carried.as_ref()).await {
                self.streams.emit("errors", now, json!({"event": "TIME_STOP", "coin": coin}));
                if let Err(e) = self.executor.flatten_all(self.exchange.as_mut()).await {
                    log::error!("sync_protection: time-stop flatten failed for {coin}: {e}");
                }
                self.tpsl_state.remove(&coin);
                continue;
            }

            if !protection::should_refresh_tpsl_state(self.tpsl_state.get(&coin), entry_price, now_ms, &self.cfg) {
                continue;
            }

            let plan = self.executor.protection.desired_plan(entry_price, is_buy, carried.as_ref(), &self.cfg);
            let result = self
                .executor
                .protection
                .ensure_protection_for_coin(self.exchange.as_mut(), &coin, size, is_buy, entry_price, &plan, &meta)
                .await;

            match result {
                Ok((sl_outcome, tp_outcome)) => {
                    self.tpsl_state.insert(
                        coin.clone(),
                        TpSlState {
                            reference_px: entry_price,
                            tp_cloid: tp_outcome.and_then(|o| o.cloid).unwrap_or_default(),
                            sl_cloid: sl_outcome.cloid.unwrap_or_default(),
                            extra_cloids: Vec::new(),
                            last_synced_ms: now_ms,
                        },
                    );
                }
                Err(failure) => {
                    log::error!("sync_protection: {coin} failed: {failure:?}");
                    self.streams.emit("errors", now, json!({"event": "NO_PROTECTION", "coin": coin}));
                    if let Err(e) = self.executor.flatten_all(self.exchange.as_mut()).await {
                        log::error!("sync_protection: emergency flatten failed for {coin}: {e}");
                    }
                    let day_end = now.date_naive().succ_opt().unwrap_or(now.date_naive()).and_hms_opt(0, 0, 0).unwrap().and_utc();
                    self.blocked_coins.insert(coin.clone(), day_end);
                    self.tpsl_state.remove(&coin);
                    self.dispatch_ask_question(Some(&coin), "no_protection", DefaultAction::Flatten, now).await;
                }
            }
        }
    }

    /// True once a position has been open past its plan's `time_stop_ms`
    /// without reaching `time_stop_progress_r` of the distance to its TP —
    /// the position is going nowhere and ties up notional better spent
    /// elsewhere.
    async fn time_stop_hit(&self, coin: &str, is_buy: bool, entry_price: f64, opened_at_ms: u64, now_ms: i64, carried: Option<&ProtectionPlan>) -> bool {
        let time_stop_ms = carried.map(|p| p.time_stop_ms).unwrap_or(self.cfg.time_stop_ms);
        let age_ms = now_ms.saturating_sub(opened_at_ms as i64);
        if age_ms < time_stop_ms {
            return false;
        }
        let Some(mid) = self.md.lock().await.mid(coin) else { return false };
        let plan = self.executor.protection.desired_plan(entry_price, is_buy, carried, &self.cfg);
        let tp_distance = (plan.tp_price - entry_price).abs();
        if tp_distance <= 0.0 {
            return false;
        }
        let signed_progress = if is_buy { mid - entry_price } else { entry_price - mid };
        let progress_r = (signed_progress / tp_distance).max(0.0);
        progress_r < self.cfg.time_stop_progress_r
    }

    /// Step 7: select the best executable signal across eligible coins,
    /// `score = strategyScore + 0.5 * coinScore`. Prefers executable
    /// candidates over blocked ones; returns `None` if nothing is
    /// executable, whether because no signal fired or every candidate was
    /// guard-blocked.
    async fn select_best_signal(&mut self) -> Option<(Signal, f64)> {
        let now = Utc::now();
        let md = self.md.lock().await;
        if self.selected_coins.is_empty() {
            self.selected_coins = self.coin_selector.select_coins(&self.universe, &md, &self.cfg, now);
        }

        let mut best: Option<(Signal, f64)> = None;
        let mut any_blocked = false;

        for coin in self.selected_coins.clone() {
            let whitelisted = self.universe.iter().any(|c| c == &coin);
            if strategy::no_trade_guards(&coin, &md, &self.cfg, whitelisted).is_err() {
                continue;
            }
            let candles: Vec<Candle> = md.candles.get(&coin).map(|c| c.iter().cloned().collect()).unwrap_or_default();
            let regime = strategy::classify_regime(&coin, &md, &candles, &self.cfg);
            if matches!(regime, Regime::Turbulent | Regime::NoTrade) {
                continue;
            }

            let arms = ["trend".to_string(), "range".to_string()];
            let Some(arm) = self.bandit.select_arm(&coin, regime.label(), &arms, &self.cfg) else { continue };
            let signal = match (regime, arm.as_str()) {
                (Regime::Trending, "trend") => strategy::build_trend_signal(&coin, &md, &candles, &self.cfg, &arm),
                (Regime::Ranging, "range") => strategy::build_range_signal(&coin, &md, &candles, &self.cfg, &arm),
                _ => None,
            };
            let Some(signal) = signal else { continue };

            if self.executor.entry_guards(&signal, &self.cfg, &blocked_coin_set(&self.blocked_coins)).is_err() {
                any_blocked = true;
                continue;
            }

            let coin_score = self.coin_selector.score_for(&coin, &self.cfg);
            let strategy_score = self.bandit.arm_stats(&coin, regime.label(), &arm).map(|s| s.mean_reward()).unwrap_or(0.0);
            let total_score = strategy_score + 0.5 * coin_score;

            if best.as_ref().map(|(_, s)| total_score > *s).unwrap_or(true) {
                best = Some((signal, total_score));
            }
        }
        drop(md);

        if best.is_none() && any_blocked {
            self.blocked_cycle_timestamps.push_back(crate::market_data::now_ms());
        }
        best
    }

    async fn execute_signal(&mut self, mut signal: Signal, _score: f64, now: DateTime<Utc>) -> Result<(), EngineError> {
        let equity = self.risk.peak_equity().max(self.risk.start_of_day_equity());
        let mids = self.exchange.fetch_all_mids().await.map_err(EngineError::Local)?;
        self.budget.note_http_call(&self.cfg)?;
        let Some(meta) = self.exchange.asset_meta(&signal.coin) else {
            return Ok(());
        };

        let Some(size) = self.executor.size_entry(&signal, equity, &mids, &meta, &self.cfg) else {
            return Ok(());
        };
        signal.size = size;

        if self.executor.preflight(signal.entry_price, size, &meta).is_err() {
            return Ok(());
        }

        let key_material = format!("{}:{}:{}", signal.coin, self.cycle_counter, now.timestamp_millis());
        let hash_hex = crate::idempotency::IdempotencyLedger::make_key(&key_material);
        let cloid = format!("0x{}", &hash_hex[..32.min(hash_hex.len())]);

        self.coin_selector.note_order_submitted(&signal.coin);
        let decision = self
            .executor
            .submit_entry(self.exchange.as_mut(), &mut self.budget, &mut self.idempotency, &signal, size, cloid, now, &self.cfg)
            .await?;

        match decision {
            EntryDecision::Submitted(outcome) => {
                self.streams.emit("orders", now, json!({"coin": signal.coin, "side": format!("{:?}", signal.side), "size": size, "status": format!("{:?}", outcome.status)}));
                self.pending_reward_context = Some(PendingRewardContext {
                    cycle: self.cycle_counter,
                    coin: signal.coin.clone(),
                    regime: signal.regime.label().to_string(),
                    arm: signal.arm.clone(),
                    baseline_realized: 0.0,
                    baseline_fees: 0.0,
                    baseline_slippage: 0.0,
                    baseline_notional: self.executor.inventory.gross_notional(&mids),
                    baseline_unrealized: 0.0,
                    protection: signal.protection.clone(),
                });
                if matches!(outcome.status, OrderStatus::Filled) {
                    self.executor.note_fill(&signal.coin, signal.side.is_buy(), size, signal.entry_price, !signal.maker_only, crate::market_data::now_ms(), Some(signal.protection.clone()));
                }
            }
            EntryDecision::Rejected(reason) => {
                self.coin_selector.note_reject(&signal.coin, &self.cfg, now);
                self.streams.emit("metrics", now, json!({"event": "strategy_decision", "action": "skip", "reason": reason.as_str(), "coin": signal.coin}));
            }
        }
        Ok(())
    }

    async fn maybe_dispatch_blocked_ask_question(&mut self, now: DateTime<Utc>) {
        let Some(&oldest) = self.blocked_cycle_timestamps.front() else { return };
        let blocked_age_ms = crate::market_data::now_ms().saturating_sub(oldest) as i64;
        if blocked_age_ms < self.cfg.ask_question_blocked_age_threshold_ms {
            return;
        }
        let window_start = crate::market_data::now_ms().saturating_sub(15 * 60_000);
        let recent_count = self.blocked_cycle_timestamps.iter().filter(|&&t| t >= window_start).count();
        // Growth-within-15m threshold has no dedicated config knob; three
        // occurrences inside the window is the Open Question decision
        // recorded in DESIGN.md.
        if recent_count < 3 {
            return;
        }
        self.dispatch_ask_question(None, "blocked_signal_persistence", DefaultAction::Pause, now).await;
    }

    async fn dispatch_ask_question(&mut self, coin: Option<&str>, reason: &str, default_action: DefaultAction, now: DateTime<Utc>) {
        let fingerprint = format!("{}:{reason}", coin.unwrap_or("ALL"));
        if self.ask_question.gate(coin, reason, &fingerprint, now, &self.cfg) != GateDecision::Allow {
            return;
        }
        let prompt = format!("{reason} on {}: confirm action ({default_action:?})", coin.unwrap_or("ALL"));
        let question = PendingQuestion {
            fingerprint: fingerprint.clone(),
            coin: coin.map(String::from),
            reason: reason.to_string(),
            prompt,
            asked_at: now,
            ttl_sec: self.cfg.ask_question_default_ttl_sec,
            answer: None,
        };
        self.ask_question.record_asked(question, now);
        self.streams.emit("reports", now, json!({"event": "ask_question_dispatched", "coin": coin, "reason": reason}));
    }

    /// Resolves an expired pending question to its safe default, applying it
    /// directly (pause sets the manual flag, flatten triggers an immediate
    /// emergency close).
    pub async fn resolve_expired_ask_question(&mut self) {
        let now = Utc::now();
        let Some((question, action)) = self.ask_question.resolve_expired(now, &self.cfg) else { return };
        self.streams.emit("reports", now, json!({"event": "ask_question_expired", "fingerprint": question.fingerprint, "action": format!("{action:?}")}));
        match action {
            DefaultAction::Pause => self.manual_pause = true,
            DefaultAction::Flatten => {
                if let Err(e) = self.executor.flatten_all(self.exchange.as_mut()).await {
                    log::error!("ask-question expiry flatten failed: {e}");
                }
            }
            DefaultAction::Resume => self.manual_pause = false,
            DefaultAction::CancelOrders => {
                if let Err(e) = self.exchange.cancel_all_orders().await {
                    log::error!("ask-question expiry cancel-orders failed: {e}");
                }
            }
            DefaultAction::Ignore | DefaultAction::Hold => {}
        }
    }

    /// Step 4: surfaces a question whenever a hard trigger condition is met
    /// (drawdown, daily loss, position-notional ratio, reconcile-failure
    /// streak, or a choppy WS watchdog), independent of the blocked-signal
    /// path in `maybe_dispatch_blocked_ask_question`.
    async fn evaluate_risk_triggers(&mut self, snap: &RiskSnapshot, now: DateTime<Utc>) {
        if snap.drawdown_bps >= self.cfg.ask_question_drawdown_trigger_bps {
            self.dispatch_ask_question(None, "drawdown_trigger", DefaultAction::Pause, now).await;
            return;
        }
        if -snap.daily_pnl >= self.cfg.ask_question_daily_pnl_trigger_usd {
            self.dispatch_ask_question(None, "daily_pnl_trigger", DefaultAction::Pause, now).await;
            return;
        }
        if snap.position_notional >= self.cfg.ask_question_position_notional_ratio * self.cfg.position_notional_limit_usd {
            self.dispatch_ask_question(None, "position_notional_trigger", DefaultAction::Hold, now).await;
            return;
        }
        if self.reconcile_failure_streak >= self.cfg.ask_question_reconcile_failure_threshold {
            self.dispatch_ask_question(None, "reconcile_failure_trigger", DefaultAction::Pause, now).await;
            return;
        }
        if self.md.lock().await.is_stalled() {
            self.ws_stall_timestamps.push_back(crate::market_data::now_ms());
        }
        let window_start = crate::market_data::now_ms().saturating_sub(15 * 60_000);
        self.ws_stall_timestamps.retain(|&t| t >= window_start);
        if self.ws_stall_timestamps.len() as u32 >= self.cfg.ask_question_ws_watchdog_threshold {
            self.dispatch_ask_question(None, "ws_watchdog_trigger", DefaultAction::Pause, now).await;
        }
    }

    // ── Periodic tasks ───────────────────────────────────────────────────

    pub async fn poll_fills(&mut self) -> Result<(), EngineError> {
        let fills = self.exchange.fetch_user_fills_by_time(self.last_fill_poll_ms).await.map_err(EngineError::Local)?;
        self.budget.note_http_call(&self.cfg)?;
        let parsed = parse_fills(&fills);
        let fresh = self.feedback.ingest_fills(parsed, &self.cfg);
        for fill in fresh {
            let protection = self.pending_reward_context.as_ref().filter(|ctx| ctx.coin == fill.coin).map(|ctx| ctx.protection.clone());
            self.executor.note_fill(&fill.coin, fill.is_buy, fill.sz, fill.px, !fill.is_maker, fill.time_ms, protection);
            self.streams.emit("fills", Utc::now(), json!({"coin": fill.coin, "px": fill.px, "sz": fill.sz, "is_buy": fill.is_buy}));
        }
        self.last_fill_poll_ms = crate::market_data::now_ms();
        Ok(())
    }

    pub async fn poll_quota(&mut self) -> Result<(), EngineError> {
        let quota_json = self.exchange.fetch_user_rate_limit().await.map_err(EngineError::Local)?;
        let remaining = quota_json["nRequestsUsed"].as_u64().unwrap_or(0);
        let cap = quota_json["nRequestsCap"].as_u64().unwrap_or(u64::MAX);
        let snapshot = crate::errors::QuotaSnapshot {
            remaining: cap.saturating_sub(remaining),
            cap,
            remaining_ratio: if cap == 0 { 1.0 } else { (cap.saturating_sub(remaining)) as f64 / cap as f64 },
            source: "userRateLimit".to_string(),
        };
        self.budget.apply_quota_status(&self.cfg, snapshot)?;
        Ok(())
    }

    pub fn report_and_improve(&mut self) {
        let now = Utc::now();
        self.streams.emit(
            "reports",
            now,
            json!({
                "cycle": self.cycle_counter,
                "bucketed_reward": self.feedback.total_bucketed_reward(),
                "approved_overrides": self.improvement.current_overrides(),
                "bandit_contexts": self.bandit.contexts_seen(),
            }),
        );
    }

    pub async fn refresh_coin_selection(&mut self) {
        let md = self.md.lock().await;
        for coin in &self.universe {
            self.coin_selector.refresh_market_stats(coin, &md, &self.cfg);
        }
        self.selected_coins = self.coin_selector.select_coins(&self.universe, &md, &self.cfg, Utc::now());
    }

    pub fn rollup_and_gc(&mut self) {
        let now = Utc::now();
        persistence::rotate_streams(&self.cfg.streams_dir, now);
        persistence::enforce_retention(&self.cfg.streams_dir, self.cfg.raw_keep_days, self.cfg.compressed_keep_days, now);
        self.idempotency.gc(now, self.cfg.idempotency_gc_age);
    }

    /// Open-orders reconciliation: pulls the authoritative order set and
    /// signed position set from the venue, replaces the local open-order map
    /// atomically (logging added/removed/unmapped counts), and reconciles
    /// dark fills against the real signed positions. Three consecutive
    /// failures escalate to a `RiskLimit`.
    pub async fn reconcile_open_orders(&mut self) -> Result<(), EngineError> {
        match self.exchange.fetch_open_orders().await {
            Ok(orders) => {
                self.budget.note_http_call(&self.cfg)?;
                self.open_orders_authoritative = Some(orders.len());
                self.reconcile_failure_streak = 0;

                let fresh = open_order_map(&orders);
                let unmapped = orders.len().saturating_sub(fresh.len());
                let added = fresh.keys().filter(|k| !self.open_orders.contains_key(*k)).count();
                let removed = self.open_orders.keys().filter(|k| !fresh.contains_key(*k)).count();
                self.open_orders = fresh;
                self.streams.emit(
                    "reports",
                    Utc::now(),
                    json!({"event": "open_orders_reconciled", "added": added, "removed": removed, "unmapped": unmapped, "total": self.open_orders.len()}),
                );

                let state = self.exchange.fetch_clearinghouse_state().await.map_err(EngineError::Local)?;
                self.budget.note_http_call(&self.cfg)?;
                let live = parse_live_positions(&state);
                let diffs = self.executor.inventory.reconcile(&live);
                for (coin, internal, live_signed) in diffs {
                    self.streams.emit("errors", Utc::now(), json!({"event": "dark_fill_reconciled", "coin": coin, "internal": internal, "live": live_signed}));
                }
                Ok(())
            }
            Err(e) => {
                self.reconcile_failure_streak += 1;
                self.streams.emit("errors", Utc::now(), json!({"event": "reconcile_failed", "streak": self.reconcile_failure_streak, "error": e.to_string()}));
                if self.reconcile_failure_streak >= 3 {
                    return Err(EngineError::Risk(RiskLimit::ReconcileFailures { consecutive: self.reconcile_failure_streak }));
                }
                Ok(())
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Idempotent shutdown: cancels all open orders then flattens all
    /// positions, each retried up to 3 times with base 500ms × 2^(n−1)
    /// backoff. Any exhausted retry writes a persistent kill-switch file;
    /// both steps verify an empty post-action set and log loudly if
    /// remnants remain.
    pub async fn request_shutdown(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        log::warn!("engine: shutdown requested (cycle={})", self.cycle_counter);

        let mut cancel_ok = false;
        for attempt in 1..=3u32 {
            match self.exchange.cancel_all_orders().await {
                Ok(_) => {
                    cancel_ok = true;
                    break;
                }
                Err(e) => {
                    log::error!("request_shutdown: cancel_all_orders attempt {attempt}/3 failed: {e}");
                    if attempt < 3 {
                        tokio::time::sleep(StdDuration::from_millis(500u64 * 2u64.pow(attempt - 1))).await;
                    }
                }
            }
        }
        if !cancel_ok {
            write_kill_switch(&self.cfg, "shutdown_cleanup_failed: cancel_all_orders exhausted retries");
        } else if let Ok(remaining) = self.exchange.fetch_open_orders().await {
            if !remaining.is_empty() {
                log::error!("engine: {} order(s) still resting after strict cancel", remaining.len());
                write_kill_switch(&self.cfg, "shutdown_cleanup_failed: orders remained after cancel");
            }
        }

        let mut flatten_ok = false;
        for attempt in 1..=3u32 {
            match self.executor.flatten_all(self.exchange.as_mut()).await {
                Ok(_) => {
                    flatten_ok = true;
                    break;
                }
                Err(e) => {
                    log::error!("request_shutdown: flatten_all attempt {attempt}/3 failed: {e}");
                    if attempt < 3 {
                        tokio::time::sleep(StdDuration::from_millis(500u64 * 2u64.pow(attempt - 1))).await;
                    }
                }
            }
        }
        if !flatten_ok {
            write_kill_switch(&self.cfg, "shutdown_cleanup_failed: flatten_all exhausted retries");
        } else if self.executor.inventory.open_position_count() > 0 {
            log::error!("engine: positions still open after strict flatten");
            write_kill_switch(&self.cfg, "shutdown_cleanup_failed: positions remained after flatten");
        }

        self.persist_all();
        log::warn!("engine: shutdown cleanup complete");
    }
}

fn blocked_coin_set(blocked: &HashMap<String, DateTime<Utc>>) -> HashSet<String> {
    blocked.keys().cloned().collect()
}

/// Builds the local open-order map keyed by cloid, falling back to the oid
/// as a string when an order carries no client id. Orders with neither are
/// left out of the map and counted as `unmapped` by the caller.
fn open_order_map(orders: &[serde_json::Value]) -> HashMap<String, OpenOrderRecord> {
    let mut map = HashMap::new();
    for order in orders {
        let coin = match order["coin"].as_str() {
            Some(c) => c.to_string(),
            None => continue,
        };
        let oid = order["oid"].as_u64();
        let cloid = order["cloid"].as_str().map(str::to_string);
        let Some(key) = cloid.clone().or_else(|| oid.map(|o| o.to_string())) else { continue };
        map.insert(key, OpenOrderRecord { coin, oid, cloid });
    }
    map
}

/// Reads signed per-coin position size off a `clearinghouseState` response's
/// `assetPositions[].position.{coin,szi}`.
fn parse_live_positions(state: &serde_json::Value) -> HashMap<String, f64> {
    state["assetPositions"]
        .as_array()
        .map(|positions| {
            positions
                .iter()
                .filter_map(|p| {
                    let coin = p["position"]["coin"].as_str()?.to_string();
                    let szi: f64 = p["position"]["szi"].as_str()?.parse().ok()?;
                    Some((coin, szi))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_fills(raw: &[serde_json::Value]) -> Vec<Fill> {
    raw.iter()
        .filter_map(|f| {
            Some(Fill {
                hash: f["hash"].as_str()?.to_string(),
                coin: f["coin"].as_str()?.to_string(),
                is_buy: f["side"].as_str().map(|s| s == "B").unwrap_or(false),
                px: f["px"].as_str()?.parse().ok()?,
                sz: f["sz"].as_str()?.parse().ok()?,
                fee: f["fee"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                is_maker: f["crossed"].as_bool().map(|c| !c).unwrap_or(true),
                closed_pnl: f["closedPnl"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                time_ms: f["time"].as_u64().unwrap_or(crate::market_data::now_ms()),
                expected_px: None,
            })
        })
        .collect()
}

/// One guarded tick of a periodic task: locks the engine, refuses to run if
/// `stopping` or the runtime kill-switch file is present, otherwise holds the
/// lock for the duration of `action`. Each periodic task below is its own
/// inline loop built around this rather than a generic combinator — a
/// closure returning a future that borrows a `MutexGuard` can't be expressed
/// as a plain `Fn` bound without higher-ranked lifetimes on the future type
/// itself, so every timer repeats the prologue directly.
async fn guarded_tick(engine: &Arc<Mutex<Engine>>) -> Option<tokio::sync::MutexGuard<'_, Engine>> {
    let guard = engine.lock().await;
    if guard.stopping {
        return None;
    }
    if kill_switch_present(&guard.cfg) {
        let mut guard = guard;
        guard.request_shutdown().await;
        return None;
    }
    Some(guard)
}

async fn handle_guarded_error(engine: &mut Engine, err: EngineError) {
    engine.streams.emit("errors", Utc::now(), json!({"event": "guarded_error", "detail": err.to_string()}));
    if err.is_fatal() {
        let was_clean_budget_shutdown = matches!(err, EngineError::Budget(_));
        engine.request_shutdown().await;
        if was_clean_budget_shutdown {
            log::info!("engine: clean shutdown on budget exhaustion, no kill-switch written for this trigger");
        }
    }
}

/// Drives the full engine lifecycle: connects WS, spawns every independent
/// periodic task, and blocks until shutdown.
pub async fn run(engine: Engine) {
    let cfg = engine.cfg.clone();
    let md = engine.md.clone();
    let stall_flag = engine.stall_flag.clone();
    let engine = Arc::new(Mutex::new(engine));

    let (private_tx, mut private_rx) = mpsc::unbounded_channel::<PrivateEvent>();
    {
        let universe = engine.lock().await.universe.clone();
        let ws_url = cfg.ws_url.clone();
        let user_address = Some(cfg.account_address.clone());
        tokio::spawn(ws::connect_and_listen(ws_url, universe, "1m".to_string(), user_address, md.clone(), stall_flag, private_tx));
    }

    // Private WS events (fills, order updates) just touch the market data
    // buffer's liveness marker here; authoritative processing happens in
    // the fill-poll / reconcile timers, which are idempotent by hash/oid.
    {
        let md = md.clone();
        tokio::spawn(async move {
            while let Some(event) = private_rx.recv().await {
                match event {
                    PrivateEvent::Fill(_) | PrivateEvent::OrderUpdate(_) => md.lock().await.touch(),
                }
            }
        });
    }

    {
        let engine = engine.clone();
        let interval_ms = cfg.strategy_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(interval_ms.max(50)));
            loop {
                ticker.tick().await;
                let Some(mut guard) = guarded_tick(&engine).await else { break };
                if let Err(err) = guard.run_strategy_cycle().await {
                    handle_guarded_error(&mut guard, err).await;
                }
            }
        });
    }

    {
        let engine = engine.clone();
        let interval_ms = cfg.fill_poll_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(interval_ms.max(50)));
            loop {
                ticker.tick().await;
                let Some(mut guard) = guarded_tick(&engine).await else { break };
                if let Err(err) = guard.poll_fills().await {
                    handle_guarded_error(&mut guard, err).await;
                }
            }
        });
    }

    {
        let engine = engine.clone();
        let interval_ms = cfg.quota_poll_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(interval_ms.max(50)));
            loop {
                ticker.tick().await;
                let Some(mut guard) = guarded_tick(&engine).await else { break };
                if let Err(err) = guard.poll_quota().await {
                    handle_guarded_error(&mut guard, err).await;
                }
            }
        });
    }

    {
        let engine = engine.clone();
        let interval_ms = cfg.reporting_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(interval_ms.max(50)));
            loop {
                ticker.tick().await;
                let Some(mut guard) = guarded_tick(&engine).await else { break };
                guard.report_and_improve();
            }
        });
    }

    {
        let engine = engine.clone();
        let interval_ms = cfg.persistence_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(interval_ms.max(50)));
            loop {
                ticker.tick().await;
                let Some(guard) = guarded_tick(&engine).await else { break };
                guard.persist_all();
            }
        });
    }

    {
        let engine = engine.clone();
        let interval_ms = cfg.rollup_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(interval_ms.max(50)));
            loop {
                ticker.tick().await;
                let Some(mut guard) = guarded_tick(&engine).await else { break };
                guard.rollup_and_gc();
            }
        });
    }

    {
        let engine = engine.clone();
        let interval_ms = cfg.coin_selection_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(interval_ms.max(50)));
            loop {
                ticker.tick().await;
                let Some(mut guard) = guarded_tick(&engine).await else { break };
                guard.refresh_coin_selection().await;
            }
        });
    }

    {
        let engine = engine.clone();
        let interval_ms = cfg.reconcile_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(interval_ms.max(50)));
            loop {
                ticker.tick().await;
                let Some(mut guard) = guarded_tick(&engine).await else { break };
                if let Err(err) = guard.reconcile_open_orders().await {
                    handle_guarded_error(&mut guard, err).await;
                }
            }
        });
    }

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(StdDuration::from_millis(5_000));
            loop {
                ticker.tick().await;
                let Some(mut guard) = guarded_tick(&engine).await else { break };
                guard.resolve_expired_ask_question().await;
            }
        });
    }

    // Block forever; the process exits when a guarded task sets `stopping`.
    loop {
        tokio::time::sleep(StdDuration::from_secs(3600)).await;
        if engine.lock().await.stopping {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_coin_set_collects_keys() {
        let mut m = HashMap::new();
        m.insert("BTC".to_string(), Utc::now());
        let set = blocked_coin_set(&m);
        assert!(set.contains("BTC"));
    }
}
