// config.rs — environment-driven configuration (AMBIENT).
//
// Reads `std::env::var`, falls back to a documented default, and logs the
// resolved value. Every configurable knob lives here as one flat struct so
// every component takes `&EngineConfig` rather than re-deriving its own env
// lookups.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    // ── venue ──────────────────────────────────────────────────────────
    pub base_url: String,
    pub ws_url: String,
    pub account_address: String,
    pub private_key: String,
    pub vault_address: Option<String>,

    // ── C1 Budget ──────────────────────────────────────────────────────
    pub budget_hourly_max_http_calls: u64,
    pub budget_daily_max_http_calls: u64,
    pub budget_daily_max_orders: u64,
    pub budget_daily_max_cancels: u64,
    pub budget_daily_max_ws_reconnects: u64,
    pub budget_daily_max_gpt_tokens: u64,
    pub budget_daily_max_gpt_cost_usd: f64,
    pub budget_quota_shutdown_threshold: f64,
    pub budget_state_path: String,

    // ── C2 Idempotency ─────────────────────────────────────────────────
    pub idempotency_state_path: String,
    pub idempotency_suppress_window: Duration,
    pub idempotency_gc_age: Duration,

    // ── C3 Market data ─────────────────────────────────────────────────
    pub market_ring_capacity: usize,
    pub stale_mid_age: Duration,
    pub stale_book_age: Duration,
    pub quality_gate_max_spread_bps: f64,
    pub quality_gate_min_book_depth_usd: f64,

    // ── C4 Bandit ──────────────────────────────────────────────────────
    pub bandit_exploration_c: f64,
    pub bandit_decay: f64,
    pub bandit_state_path: String,

    // ── C5 Coin selector ───────────────────────────────────────────────
    pub coin_selector_top_k: usize,
    pub coin_selector_reject_streak_limit: u32,
    pub coin_selector_cooldown_ms: i64,
    pub coin_selector_min_depth_usd: f64,
    pub coin_selector_max_spread_bps: f64,
    pub coin_selector_reject_penalty: f64,
    pub coin_selector_spread_penalty_weight: f64,
    pub coin_selector_state_path: String,

    // ── C6 Strategy ─────────────────────────────────────────────────────
    pub symbol_whitelist: Vec<String>,
    pub turbulence_ret_1m_pct: f64,
    pub trend_adx_min: f64,
    pub trend_ema_gap_min_bps: f64,
    pub range_adx_max: f64,
    pub range_ema_gap_max_bps: f64,
    pub trend_sl_min_pct: f64,
    pub trend_sl_atr_mult: f64,
    pub trend_sl_min_clamp_pct: f64,
    pub trend_sl_max_clamp_pct: f64,
    pub trend_tp_mult: f64,
    pub trend_aggressor_ratio_min: f64,
    pub trend_imbalance_min: f64,
    pub trend_taker_trigger_pct: f64,
    pub range_z_entry: f64,
    pub range_vwap_bars: usize,

    // ── C7 Feedback ─────────────────────────────────────────────────────
    pub feedback_fill_cap: usize,
    pub feedback_execution_record_cap: usize,
    pub feedback_inventory_penalty_bps: f64,
    pub feedback_drawdown_penalty_bps: f64,
    pub feedback_unrealized_weight: f64,
    pub feedback_state_path: String,

    // ── C8 Improvement loop ──────────────────────────────────────────────
    pub gpt_canary_cycles: u32,
    pub min_reward_delta_bps: f64,
    pub rollback_drawdown_bps: f64,
    pub rollback_error_rate: f64,
    pub quarantine_cycles: u32,
    pub improvement_state_path: String,

    // ── C9 Protection ────────────────────────────────────────────────────
    pub default_tp_bps: f64,
    pub default_sl_bps: f64,
    pub time_stop_ms: i64,
    pub time_stop_progress_r: f64,
    pub tpsl_refresh_cooldown_ms: i64,
    pub quarantine_minutes_on_no_protection: i64,

    // ── C10 Execution ────────────────────────────────────────────────────
    pub maker_only: bool,
    pub max_concurrent_positions: usize,
    pub per_coin_notional_frac: f64,
    pub total_gross_notional_frac: f64,
    pub per_order_notional_limit: f64,
    pub min_order_notional: f64,
    pub max_order_notional: f64,
    pub max_slippage_bps: f64,
    pub max_spread_bps_entry: f64,
    pub daily_fill_cap: u32,
    pub daily_taker_fill_cap: u32,
    pub taker_streak_lockout: u32,
    pub allow_alo_auto_retry: bool,
    pub allow_taker_after_ttl: bool,
    pub order_ttl_ms: i64,

    // ── C11 Engine ───────────────────────────────────────────────────────
    pub strategy_interval_ms: u64,
    pub fill_poll_interval_ms: u64,
    pub quota_poll_interval_ms: u64,
    pub reporting_interval_ms: u64,
    pub persistence_interval_ms: u64,
    pub rollup_interval_ms: u64,
    pub coin_selection_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub daily_loss_limit_usd: f64,
    pub drawdown_limit_bps: f64,
    pub position_notional_limit_usd: f64,
    pub open_orders_limit: usize,
    pub open_positions_limit: usize,
    pub daily_pnl_window: DailyWindow,
    pub kill_switch_path: String,
    pub runtime_state_path: String,

    // ── C12 Ask-question ──────────────────────────────────────────────────
    pub ask_question_daily_cap: u32,
    pub ask_question_per_coin_cooldown_ms: i64,
    pub ask_question_per_reason_cooldown_ms: i64,
    pub ask_question_dedup_window_ms: i64,
    pub ask_question_default_ttl_sec: i64,
    pub ask_question_blocked_age_threshold_ms: i64,
    pub ask_question_drawdown_trigger_bps: f64,
    pub ask_question_daily_pnl_trigger_usd: f64,
    pub ask_question_position_notional_ratio: f64,
    pub ask_question_reconcile_failure_threshold: u32,
    pub ask_question_ws_watchdog_threshold: u32,

    // ── streams / lifecycle ────────────────────────────────────────────
    pub streams_dir: String,
    pub raw_keep_days: u32,
    pub compressed_keep_days: u32,
    pub rollup_keep_days: u32,

    pub http_timeout: Duration,
    pub quota_http_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DailyWindow {
    UtcDay,
    Rolling24h,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: env_string("HL_BASE_URL", "https://api.hyperliquid.xyz"),
            ws_url: env_string("HL_WS_URL", "wss://api.hyperliquid.xyz/ws"),
            account_address: env_string("HL_ADDRESS", ""),
            private_key: env_string("HL_PRIVATE_KEY", ""),
            vault_address: std::env::var("HL_VAULT_ADDRESS").ok(),

            budget_hourly_max_http_calls: env_or("BUDGET_HOURLY_MAX_HTTP", 1000),
            budget_daily_max_http_calls: env_or("BUDGET_DAILY_MAX_HTTP", 15_000),
            budget_daily_max_orders: env_or("BUDGET_DAILY_MAX_ORDERS", 1500),
            budget_daily_max_cancels: env_or("BUDGET_DAILY_MAX_CANCELS", 3000),
            budget_daily_max_ws_reconnects: env_or("BUDGET_DAILY_MAX_WS_RECONNECTS", 200),
            budget_daily_max_gpt_tokens: env_or("BUDGET_DAILY_MAX_GPT_TOKENS", 2_000_000),
            budget_daily_max_gpt_cost_usd: env_or("BUDGET_DAILY_MAX_GPT_COST_USD", 25.0),
            budget_quota_shutdown_threshold: env_or("BUDGET_QUOTA_SHUTDOWN_THRESHOLD", 0.05),
            budget_state_path: env_string("STATE_BUDGET_PATH", "state/budget-state.json"),

            idempotency_state_path: env_string("STATE_IDEMPOTENCY_PATH", "state/idempotency-state.json"),
            idempotency_suppress_window: Duration::from_secs(env_or("IDEMPOTENCY_SUPPRESS_WINDOW_SEC", 10)),
            idempotency_gc_age: Duration::from_secs(env_or("IDEMPOTENCY_GC_AGE_SEC", 6 * 3600)),

            market_ring_capacity: env_or("MARKET_RING_CAPACITY", 4000),
            stale_mid_age: Duration::from_millis(env_or("STALE_MID_AGE_MS", 15_000)),
            stale_book_age: Duration::from_millis(env_or("STALE_BOOK_AGE_MS", 15_000)),
            quality_gate_max_spread_bps: env_or("QUALITY_GATE_MAX_SPREAD_BPS", 12.0),
            quality_gate_min_book_depth_usd: env_or("QUALITY_GATE_MIN_BOOK_DEPTH_USD", 5_000.0),

            bandit_exploration_c: env_or("BANDIT_EXPLORATION_C", 1.4),
            bandit_decay: env_or("BANDIT_DECAY", 0.995),
            bandit_state_path: env_string("STATE_BANDIT_PATH", "state/bandit-state.json"),

            coin_selector_top_k: env_or("COIN_SELECTOR_TOP_K", 2),
            coin_selector_reject_streak_limit: env_or("COIN_SELECTOR_REJECT_STREAK_LIMIT", 5),
            coin_selector_cooldown_ms: env_or("COIN_SELECTOR_COOLDOWN_MS", 15 * 60_000),
            coin_selector_min_depth_usd: env_or("COIN_SELECTOR_MIN_DEPTH_USD", 2_500.0),
            coin_selector_max_spread_bps: env_or("COIN_SELECTOR_MAX_SPREAD_BPS", 10.0),
            coin_selector_reject_penalty: env_or("COIN_SELECTOR_REJECT_PENALTY", 8.0),
            coin_selector_spread_penalty_weight: env_or("COIN_SELECTOR_SPREAD_PENALTY_WEIGHT", 0.12),
            coin_selector_state_path: env_string("STATE_COIN_SELECTOR_PATH", "state/coin-selector-state.json"),

            symbol_whitelist: env_string("SYMBOL_WHITELIST", "BTC,ETH")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            turbulence_ret_1m_pct: env_or("TURBULENCE_RET_1M_PCT", 0.012),
            trend_adx_min: env_or("TREND_ADX_MIN", 22.0),
            trend_ema_gap_min_bps: env_or("TREND_EMA_GAP_MIN_BPS", 8.0),
            range_adx_max: env_or("RANGE_ADX_MAX", 16.0),
            range_ema_gap_max_bps: env_or("RANGE_EMA_GAP_MAX_BPS", 5.0),
            trend_sl_min_pct: env_or("TREND_SL_MIN_PCT", 0.45),
            trend_sl_atr_mult: env_or("TREND_SL_ATR_MULT", 1.2),
            trend_sl_min_clamp_pct: env_or("TREND_SL_MIN_CLAMP_PCT", 0.3),
            trend_sl_max_clamp_pct: env_or("TREND_SL_MAX_CLAMP_PCT", 1.5),
            trend_tp_mult: env_or("TREND_TP_MULT", 1.8),
            trend_aggressor_ratio_min: env_or("TREND_AGGRESSOR_RATIO_MIN", 0.55),
            trend_imbalance_min: env_or("TREND_IMBALANCE_MIN", 0.12),
            trend_taker_trigger_pct: env_or("TREND_TAKER_TRIGGER_PCT", 0.15),
            range_z_entry: env_or("RANGE_Z_ENTRY", 1.8),
            range_vwap_bars: env_or("RANGE_VWAP_BARS", 60),

            feedback_fill_cap: env_or("FEEDBACK_FILL_CAP", 20_000),
            feedback_execution_record_cap: env_or("FEEDBACK_EXECUTION_RECORD_CAP", 1000),
            feedback_inventory_penalty_bps: env_or("FEEDBACK_INVENTORY_PENALTY_BPS", 0.5),
            feedback_drawdown_penalty_bps: env_or("FEEDBACK_DRAWDOWN_PENALTY_BPS", 1.0),
            feedback_unrealized_weight: env_or("FEEDBACK_UNREALIZED_WEIGHT", 0.2),
            feedback_state_path: env_string("STATE_FEEDBACK_PATH", "state/feedback-state.json"),

            gpt_canary_cycles: env_or("GPT_CANARY_CYCLES", 20),
            min_reward_delta_bps: env_or("MIN_REWARD_DELTA_BPS", 1.0),
            rollback_drawdown_bps: env_or("ROLLBACK_DRAWDOWN_BPS", 150.0),
            rollback_error_rate: env_or("ROLLBACK_ERROR_RATE", 0.1),
            quarantine_cycles: env_or("QUARANTINE_CYCLES", 200),
            improvement_state_path: env_string("STATE_IMPROVEMENT_PATH", "state/improvement-state.json"),

            default_tp_bps: env_or("DEFAULT_TP_BPS", 80.0),
            default_sl_bps: env_or("DEFAULT_SL_BPS", 50.0),
            time_stop_ms: env_or("TIME_STOP_MS", 30 * 60_000),
            time_stop_progress_r: env_or("TIME_STOP_PROGRESS_R", 0.3),
            tpsl_refresh_cooldown_ms: env_or("TPSL_REFRESH_COOLDOWN_MS", 5_000),
            quarantine_minutes_on_no_protection: env_or("QUARANTINE_MINUTES_ON_NO_PROTECTION", 10),

            maker_only: env_or("MAKER_ONLY", false),
            max_concurrent_positions: env_or("MAX_CONCURRENT_POSITIONS", 4),
            per_coin_notional_frac: env_or("PER_COIN_NOTIONAL_FRAC", 0.25),
            total_gross_notional_frac: env_or("TOTAL_GROSS_NOTIONAL_FRAC", 0.50),
            per_order_notional_limit: env_or("PER_ORDER_NOTIONAL_LIMIT", 5_000.0),
            min_order_notional: env_or("MIN_ORDER_NOTIONAL", 11.0),
            max_order_notional: env_or("MAX_ORDER_NOTIONAL", 20_000.0),
            max_slippage_bps: env_or("MAX_SLIPPAGE_BPS", 8.0),
            max_spread_bps_entry: env_or("MAX_SPREAD_BPS_ENTRY", 10.0),
            daily_fill_cap: env_or("DAILY_FILL_CAP", 40),
            daily_taker_fill_cap: env_or("DAILY_TAKER_FILL_CAP", 10),
            taker_streak_lockout: env_or("TAKER_STREAK_LOCKOUT", 4),
            allow_alo_auto_retry: env_or("ALLOW_ALO_AUTO_RETRY", true),
            allow_taker_after_ttl: env_or("ALLOW_TAKER_AFTER_TTL", true),
            order_ttl_ms: env_or("ORDER_TTL_MS", 20_000),

            strategy_interval_ms: env_or("STRATEGY_INTERVAL_MS", 5_000),
            fill_poll_interval_ms: env_or("FILL_POLL_INTERVAL_MS", 3_000),
            quota_poll_interval_ms: env_or("QUOTA_POLL_INTERVAL_MS", 30_000),
            reporting_interval_ms: env_or("REPORTING_INTERVAL_MS", 60_000),
            persistence_interval_ms: env_or("PERSISTENCE_INTERVAL_MS", 10_000),
            rollup_interval_ms: env_or("ROLLUP_INTERVAL_MS", 3_600_000),
            coin_selection_interval_ms: env_or("COIN_SELECTION_INTERVAL_MS", 30_000),
            reconcile_interval_ms: env_or("RECONCILE_INTERVAL_MS", 10_000),
            daily_loss_limit_usd: env_or("DAILY_LOSS_LIMIT_USD", 500.0),
            drawdown_limit_bps: env_or("DRAWDOWN_LIMIT_BPS", 800.0),
            position_notional_limit_usd: env_or("POSITION_NOTIONAL_LIMIT_USD", 25_000.0),
            open_orders_limit: env_or("OPEN_ORDERS_LIMIT", 40),
            open_positions_limit: env_or("OPEN_POSITIONS_LIMIT", 6),
            daily_pnl_window: if env_string("DAILY_PNL_WINDOW", "utc_day") == "rolling_24h" {
                DailyWindow::Rolling24h
            } else {
                DailyWindow::UtcDay
            },
            kill_switch_path: env_string("KILL_SWITCH_PATH", "state/KILL_SWITCH"),
            runtime_state_path: env_string("STATE_RUNTIME_PATH", "state/runtime-state.json"),

            ask_question_daily_cap: env_or("ASK_QUESTION_DAILY_CAP", 8),
            ask_question_per_coin_cooldown_ms: env_or("ASK_QUESTION_PER_COIN_COOLDOWN_MS", 30 * 60_000),
            ask_question_per_reason_cooldown_ms: env_or("ASK_QUESTION_PER_REASON_COOLDOWN_MS", 2 * 3_600_000),
            ask_question_dedup_window_ms: env_or("ASK_QUESTION_DEDUP_WINDOW_MS", 2 * 60_000),
            ask_question_default_ttl_sec: env_or("ASK_QUESTION_DEFAULT_TTL_SEC", 300),
            ask_question_blocked_age_threshold_ms: env_or("ASK_QUESTION_BLOCKED_AGE_THRESHOLD_MS", 30 * 60_000),
            ask_question_drawdown_trigger_bps: env_or("ASK_QUESTION_DRAWDOWN_TRIGGER_BPS", 600.0),
            ask_question_daily_pnl_trigger_usd: env_or("ASK_QUESTION_DAILY_PNL_TRIGGER_USD", 400.0),
            ask_question_position_notional_ratio: env_or("ASK_QUESTION_POSITION_NOTIONAL_RATIO", 0.85),
            ask_question_reconcile_failure_threshold: env_or("ASK_QUESTION_RECONCILE_FAILURE_THRESHOLD", 2),
            ask_question_ws_watchdog_threshold: env_or("ASK_QUESTION_WS_WATCHDOG_THRESHOLD", 3),

            streams_dir: env_string("STREAMS_DIR", "streams"),
            raw_keep_days: env_or("RAW_KEEP_DAYS", 7),
            compressed_keep_days: env_or("COMPRESSED_KEEP_DAYS", 30),
            rollup_keep_days: env_or("ROLLUP_KEEP_DAYS", 90),

            http_timeout: Duration::from_secs(15),
            quota_http_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        let cfg = Self::default();
        log::info!(
            "config loaded: strategy_interval_ms={} symbol_whitelist={:?} daily_loss_limit_usd={}",
            cfg.strategy_interval_ms, cfg.symbol_whitelist, cfg.daily_loss_limit_usd
        );
        cfg
    }
}
