// budget.rs — C1 Budget Manager.
//
// Rolling UTC-hour/day counters for HTTP calls, WS reconnects, order/cancel
// submissions, and LLM token/cost usage. Grounded on `risk.rs`'s day-rollover
// idiom (`last_day_reset`, `date_naive()` comparison) applied to usage
// counters instead of PnL.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::errors::{BudgetExceeded, QuotaSnapshot};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BudgetState {
    pub hour_start: DateTime<Utc>,
    pub day_start: DateTime<Utc>,
    pub hourly_http_calls: u64,
    pub daily_http_calls: u64,
    pub daily_orders: u64,
    pub daily_cancels: u64,
    pub daily_ws_reconnects: u64,
    pub daily_gpt_tokens: u64,
    pub daily_gpt_cost_usd: f64,
    pub last_quota: Option<QuotaSnapshot>,
}

impl BudgetState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            hour_start: truncate_to_hour(now),
            day_start: truncate_to_day(now),
            hourly_http_calls: 0,
            daily_http_calls: 0,
            daily_orders: 0,
            daily_cancels: 0,
            daily_ws_reconnects: 0,
            daily_gpt_tokens: 0,
            daily_gpt_cost_usd: 0.0,
            last_quota: None,
        }
    }
}

fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_hms_opt(ts.hour(), 0, 0).unwrap().and_utc()
}

fn truncate_to_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc()
}

pub struct BudgetManager {
    state: BudgetState,
}

impl BudgetManager {
    pub fn new() -> Self {
        Self { state: BudgetState::new(Utc::now()) }
    }

    pub fn restore(state: BudgetState) -> Self {
        Self { state }
    }

    pub fn snapshot(&self) -> BudgetState {
        self.state.clone()
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if truncate_to_hour(now) > self.state.hour_start {
            self.state.hour_start = truncate_to_hour(now);
            self.state.hourly_http_calls = 0;
        }
        if truncate_to_day(now) > self.state.day_start {
            self.state.day_start = truncate_to_day(now);
            self.state.daily_http_calls = 0;
            self.state.daily_orders = 0;
            self.state.daily_cancels = 0;
            self.state.daily_ws_reconnects = 0;
            self.state.daily_gpt_tokens = 0;
            self.state.daily_gpt_cost_usd = 0.0;
        }
    }

    pub fn note_http_call(&mut self, cfg: &EngineConfig) -> Result<(), BudgetExceeded> {
        self.roll(Utc::now());
        self.state.hourly_http_calls += 1;
        self.state.daily_http_calls += 1;
        if self.state.hourly_http_calls > cfg.budget_hourly_max_http_calls {
            return Err(BudgetExceeded::HourlyHttp { count: self.state.hourly_http_calls, limit: cfg.budget_hourly_max_http_calls });
        }
        if self.state.daily_http_calls > cfg.budget_daily_max_http_calls {
            return Err(BudgetExceeded::DailyHttp { count: self.state.daily_http_calls, limit: cfg.budget_daily_max_http_calls });
        }
        Ok(())
    }

    pub fn note_ws_reconnect(&mut self, cfg: &EngineConfig) -> Result<(), BudgetExceeded> {
        self.roll(Utc::now());
        self.state.daily_ws_reconnects += 1;
        if self.state.daily_ws_reconnects > cfg.budget_daily_max_ws_reconnects {
            return Err(BudgetExceeded::WsReconnects { count: self.state.daily_ws_reconnects, limit: cfg.budget_daily_max_ws_reconnects });
        }
        Ok(())
    }

    pub fn note_order_submitted(&mut self, cfg: &EngineConfig) -> Result<(), BudgetExceeded> {
        self.roll(Utc::now());
        self.state.daily_orders += 1;
        if self.state.daily_orders > cfg.budget_daily_max_orders {
            return Err(BudgetExceeded::DailyOrders { count: self.state.daily_orders, limit: cfg.budget_daily_max_orders });
        }
        Ok(())
    }

    pub fn note_cancel_submitted(&mut self, cfg: &EngineConfig) -> Result<(), BudgetExceeded> {
        self.roll(Utc::now());
        self.state.daily_cancels += 1;
        if self.state.daily_cancels > cfg.budget_daily_max_cancels {
            return Err(BudgetExceeded::DailyCancels { count: self.state.daily_cancels, limit: cfg.budget_daily_max_cancels });
        }
        Ok(())
    }

    pub fn note_gpt_usage(&mut self, cfg: &EngineConfig, tokens: u64, cost_usd: f64) -> Result<(), BudgetExceeded> {
        self.roll(Utc::now());
        self.state.daily_gpt_tokens += tokens;
        self.state.daily_gpt_cost_usd += cost_usd;
        if self.state.daily_gpt_tokens > cfg.budget_daily_max_gpt_tokens {
            return Err(BudgetExceeded::GptTokens { count: self.state.daily_gpt_tokens, limit: cfg.budget_daily_max_gpt_tokens });
        }
        if self.state.daily_gpt_cost_usd > cfg.budget_daily_max_gpt_cost_usd {
            return Err(BudgetExceeded::GptCost { cost_usd: self.state.daily_gpt_cost_usd, limit_usd: cfg.budget_daily_max_gpt_cost_usd });
        }
        Ok(())
    }

    /// Applies a venue-reported rate-limit quota (e.g. `userRateLimit`). If
    /// the remaining ratio crosses below the configured shutdown threshold,
    /// the engine should stop submitting new orders.
    pub fn apply_quota_status(&mut self, cfg: &EngineConfig, quota: QuotaSnapshot) -> Result<(), BudgetExceeded> {
        self.state.last_quota = Some(quota.clone());
        if quota.remaining_ratio < cfg.budget_quota_shutdown_threshold {
            return Err(BudgetExceeded::Quota(quota));
        }
        Ok(())
    }
}

impl Default for BudgetManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig { budget_hourly_max_http_calls: 3, budget_daily_max_orders: 2, ..EngineConfig::default() }
    }

    #[test]
    fn hourly_http_limit_trips() {
        let mut bm = BudgetManager::new();
        let cfg = cfg();
        assert!(bm.note_http_call(&cfg).is_ok());
        assert!(bm.note_http_call(&cfg).is_ok());
        assert!(bm.note_http_call(&cfg).is_ok());
        assert!(matches!(bm.note_http_call(&cfg), Err(BudgetExceeded::HourlyHttp { .. })));
    }

    #[test]
    fn daily_order_limit_trips() {
        let mut bm = BudgetManager::new();
        let cfg = cfg();
        assert!(bm.note_order_submitted(&cfg).is_ok());
        assert!(bm.note_order_submitted(&cfg).is_ok());
        assert!(matches!(bm.note_order_submitted(&cfg), Err(BudgetExceeded::DailyOrders { .. })));
    }

    #[test]
    fn quota_below_threshold_is_fatal() {
        let mut bm = BudgetManager::new();
        let cfg = cfg();
        let quota = QuotaSnapshot { remaining: 1, cap: 1000, remaining_ratio: 0.001, source: "userRateLimit".to_string() };
        assert!(matches!(bm.apply_quota_status(&cfg, quota), Err(BudgetExceeded::Quota(_))));
    }

    #[test]
    fn hour_rollover_resets_hourly_not_daily() {
        let mut bm = BudgetManager::new();
        let cfg = cfg();
        bm.state.hour_start = truncate_to_hour(Utc::now()) - chrono::Duration::hours(2);
        bm.state.hourly_http_calls = 10;
        bm.state.daily_http_calls = 10;
        bm.roll(Utc::now());
        assert_eq!(bm.state.hourly_http_calls, 0);
        assert_eq!(bm.state.daily_http_calls, 10);
    }
}
