// risk.rs — shared risk snapshot and hard-limit assertion, used by both
// engine.rs (cycle gate) and protection.rs (emergency-flatten decisions).
//
// Day rollover is tracked with the usual `last_day_reset`/`date_naive()`
// comparison; the halt condition itself is a set of hard numeric limits
// (daily loss, drawdown, position notional, open-order/position counts)
// rather than a consecutive-loss circuit breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DailyWindow, EngineConfig};
use crate::errors::RiskLimit;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub daily_pnl: f64,
    pub drawdown_bps: f64,
    pub open_orders: usize,
    pub open_positions: usize,
    pub position_notional: f64,
    pub checked_at: DateTime<Utc>,
    pub day_start: DateTime<Utc>,
}

pub struct RiskTracker {
    day_start: DateTime<Utc>,
    start_of_day_equity: f64,
    peak_equity: f64,
}

impl RiskTracker {
    pub fn new(starting_equity: f64) -> Self {
        let now = Utc::now();
        Self {
            day_start: now,
            start_of_day_equity: starting_equity,
            peak_equity: starting_equity,
        }
    }

    pub fn restore(day_start: DateTime<Utc>, start_of_day_equity: f64, peak_equity: f64) -> Self {
        Self { day_start, start_of_day_equity, peak_equity }
    }

    pub fn day_start(&self) -> DateTime<Utc> {
        self.day_start
    }

    pub fn start_of_day_equity(&self) -> f64 {
        self.start_of_day_equity
    }

    pub fn peak_equity(&self) -> f64 {
        self.peak_equity
    }

    /// Rolls the UTC-day counters over if `now` has crossed midnight since
    /// the last reset. For `DailyWindow::Rolling24h` the window never rolls
    /// here; the caller is expected to compute over a trailing 24h slice
    /// instead of relying on this reset.
    pub fn maybe_roll_day(&mut self, now: DateTime<Utc>, equity: f64, window: DailyWindow) {
        if window == DailyWindow::UtcDay && now.date_naive() > self.day_start.date_naive() {
            self.day_start = now;
            self.start_of_day_equity = equity;
        }
    }

    pub fn observe_equity(&mut self, equity: f64) {
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    /// `drawdown_bps` comes from feedback.rs's peak-equity tracker (C7), the
    /// single authoritative drawdown source shared with the canary reward
    /// calc — this tracker's own `peak_equity` is only an equity proxy for
    /// entry sizing, not a second drawdown computation.
    pub fn snapshot(
        &self,
        equity: f64,
        open_orders: usize,
        open_positions: usize,
        position_notional: f64,
        drawdown_bps: f64,
    ) -> RiskSnapshot {
        let daily_pnl = equity - self.start_of_day_equity;
        RiskSnapshot {
            daily_pnl,
            drawdown_bps,
            open_orders,
            open_positions,
            position_notional,
            checked_at: Utc::now(),
            day_start: self.day_start,
        }
    }
}

/// Hard-limit gate run once per strategy cycle. The first violated limit is
/// returned; callers shut down on `Some`.
pub fn assert_hard_limits(snap: &RiskSnapshot, cfg: &EngineConfig) -> Option<RiskLimit> {
    if -snap.daily_pnl > cfg.daily_loss_limit_usd {
        return Some(RiskLimit::DailyLoss {
            daily_pnl: snap.daily_pnl,
            limit: cfg.daily_loss_limit_usd,
        });
    }
    if snap.drawdown_bps > cfg.drawdown_limit_bps {
        return Some(RiskLimit::Drawdown {
            drawdown_bps: snap.drawdown_bps,
            limit_bps: cfg.drawdown_limit_bps,
        });
    }
    if snap.position_notional > cfg.position_notional_limit_usd {
        return Some(RiskLimit::PositionNotional {
            notional: snap.position_notional,
            limit: cfg.position_notional_limit_usd,
        });
    }
    if snap.open_orders > cfg.open_orders_limit {
        return Some(RiskLimit::OpenOrders {
            count: snap.open_orders,
            limit: cfg.open_orders_limit,
        });
    }
    if snap.open_positions > cfg.open_positions_limit {
        return Some(RiskLimit::OpenPositions {
            count: snap.open_positions,
            limit: cfg.open_positions_limit,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> EngineConfig {
        EngineConfig {
            daily_loss_limit_usd: 500.0,
            drawdown_limit_bps: 800.0,
            position_notional_limit_usd: 25_000.0,
            open_orders_limit: 40,
            open_positions_limit: 6,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn daily_loss_breach_detected() {
        let t = RiskTracker::new(10_000.0);
        let snap = t.snapshot(10_000.0 - 501.0, 0, 0, 0.0, 0.0);
        assert!(matches!(assert_hard_limits(&snap, &cfg()), Some(RiskLimit::DailyLoss { .. })));
    }

    #[test]
    fn drawdown_breach_detected_after_peak() {
        let t = RiskTracker::new(10_000.0);
        let snap = t.snapshot(12_000.0 * 0.91, 0, 0, 0.0, 900.0);
        assert!(matches!(assert_hard_limits(&snap, &cfg()), Some(RiskLimit::Drawdown { .. })));
    }

    #[test]
    fn within_limits_is_none() {
        let t = RiskTracker::new(10_000.0);
        let snap = t.snapshot(10_050.0, 2, 1, 500.0, 5.0);
        assert!(assert_hard_limits(&snap, &cfg()).is_none());
    }
}
