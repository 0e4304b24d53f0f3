// execution.rs — C10 Order Executor.
//
// Turns a strategy `Signal` into a submitted order: entry guards (coin
// block, flip-wait-flat, pyramiding, daily/taker limits), risk-based
// notional sizing, lot/tick normalization, preflight validation,
// idempotency-keyed submission with one retry on a retryable reject, and
// protection attachment. The `cancel_all`/`reconcile_after_reconnect` pair
// and the emergency cancel-all-then-halt shape carry over from a
// fixed-grid quoting loop into this signal-driven entry path.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::budget::BudgetManager;
use crate::config::EngineConfig;
use crate::errors::{EngineError, LocalError, ReasonCode};
use crate::exchange::{round_to_5_sig_figs, AssetMeta, ExchangeClient, OrderIntent, OrderOutcome, OrderStatus};
use crate::idempotency::{IdempotencyLedger, SeenStatus};
use crate::protection::ProtectionManager;
use crate::strategy::{ProtectionPlan, Side, Signal};

#[derive(Debug, Clone, Default)]
pub struct PositionState {
    pub coin: String,
    pub side: Option<Side>,
    pub size: f64,
    pub entry_price: f64,
    pub opened_at_ms: u64,
    /// The entry signal's own ATR-scaled TP/SL/time-stop plan, carried
    /// forward from `Signal.protection` so the protection manager doesn't
    /// have to fall back to a generic flat-bps plan for a position that was
    /// opened with a strategy-specific one.
    pub protection: Option<ProtectionPlan>,
}

#[derive(Debug, Default)]
pub struct DailyCounters {
    pub fills: u32,
    pub taker_fills: u32,
    pub taker_streak: u32,
}

/// The engine's internal snapshot of what it believes it holds, reconciled
/// against REST state after a WS reconnect to catch dark fills.
#[derive(Debug, Clone, Default)]
pub struct InternalInventory {
    pub positions: HashMap<String, PositionState>,
}

impl InternalInventory {
    pub fn apply_fill(&mut self, coin: &str, is_buy: bool, size: f64, price: f64, now_ms: u64, protection: Option<ProtectionPlan>) {
        let entry = self.positions.entry(coin.to_string()).or_insert_with(|| PositionState { coin: coin.to_string(), ..Default::default() });
        let signed_delta = if is_buy { size } else { -size };
        let prior_signed = match entry.side {
            Some(Side::Long) => entry.size,
            Some(Side::Short) => -entry.size,
            None => 0.0,
        };
        let new_signed = prior_signed + signed_delta;
        if new_signed.abs() < 1e-9 {
            entry.side = None;
            entry.size = 0.0;
            entry.protection = None;
        } else {
            entry.side = Some(if new_signed > 0.0 { Side::Long } else { Side::Short });
            entry.size = new_signed.abs();
            if entry.opened_at_ms == 0 {
                entry.opened_at_ms = now_ms;
                entry.entry_price = price;
                entry.protection = protection;
            }
        }
    }

    /// Diffs internal positions against a live REST snapshot (coin -> signed
    /// size). Any mismatch (a dark fill) is logged and the internal state is
    /// corrected to match the venue.
    pub fn reconcile(&mut self, live: &HashMap<String, f64>) -> Vec<(String, f64, f64)> {
        let mut diffs = Vec::new();
        for (coin, &signed_live) in live {
            let internal_signed = match self.positions.get(coin).and_then(|p| p.side) {
                Some(Side::Long) => self.positions[coin].size,
                Some(Side::Short) => -self.positions[coin].size,
                None => 0.0,
            };
            if (signed_live - internal_signed).abs() > 1e-8 {
                log::warn!("reconcile: {coin} internal={internal_signed:.6} live={signed_live:.6} (dark fill)");
                diffs.push((coin.clone(), internal_signed, signed_live));
                let entry = self.positions.entry(coin.clone()).or_insert_with(|| PositionState { coin: coin.clone(), ..Default::default() });
                if signed_live.abs() < 1e-9 {
                    entry.side = None;
                    entry.size = 0.0;
                } else {
                    entry.side = Some(if signed_live > 0.0 { Side::Long } else { Side::Short });
                    entry.size = signed_live.abs();
                }
            }
        }
        diffs
    }

    pub fn position(&self, coin: &str) -> Option<&PositionState> {
        self.positions.get(coin).filter(|p| p.side.is_some())
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.values().filter(|p| p.side.is_some()).count()
    }

    pub fn gross_notional(&self, mids: &HashMap<String, f64>) -> f64 {
        self.positions
            .values()
            .filter(|p| p.side.is_some())
            .map(|p| p.size * mids.get(&p.coin).copied().unwrap_or(p.entry_price))
            .sum()
    }
}

/// Price must satisfy two independent rules: no more than `6 - szDecimals`
/// decimal places, and no more than 5 significant figures. Shared by entry
/// preflight (above) and trigger-price preflight in the protection manager.
pub fn validate_price(price: f64, sz_decimals: u32) -> Result<(), ReasonCode> {
    let max_decimals = (6i32 - sz_decimals as i32).max(0);
    let px_str = format!("{:.*}", max_decimals as usize, price);
    if px_str.parse::<f64>().map(|v| (v - price).abs() > 1e-9).unwrap_or(true) {
        return Err(ReasonCode::PreflightPriceTooManyDecimals);
    }
    if (round_to_5_sig_figs(price) - price).abs() > 1e-9 {
        return Err(ReasonCode::PreflightPriceTooManySigfigs);
    }
    Ok(())
}

pub enum EntryDecision {
    Submitted(OrderOutcome),
    Rejected(ReasonCode),
}

pub struct OrderExecutor {
    pub inventory: InternalInventory,
    pub daily: HashMap<String, DailyCounters>,
    pub protection: ProtectionManager,
}

impl OrderExecutor {
    pub fn new() -> Self {
        Self { inventory: InternalInventory::default(), daily: HashMap::new(), protection: ProtectionManager::new() }
    }

    fn daily_counters(&mut self, coin: &str) -> &mut DailyCounters {
        self.daily.entry(coin.to_string()).or_default()
    }

    /// Entry guard ladder: blocked coin, flip-wait-flat, pyramiding, daily
    /// trade/taker limits, taker-streak lockout, maker-only-signal mismatch.
    /// Order matters — cheapest/most decisive checks run first.
    pub fn entry_guards(&self, signal: &Signal, cfg: &EngineConfig, blocked_coins: &HashSet<String>) -> Result<(), ReasonCode> {
        if blocked_coins.contains(&signal.coin) {
            return Err(ReasonCode::CoinBlocked);
        }
        if let Some(pos) = self.inventory.position(&signal.coin) {
            if pos.side != Some(signal.side) {
                return Err(ReasonCode::FlipWaitFlat);
            }
            return Err(ReasonCode::PyramidingBlocked);
        }
        if let Some(counters) = self.daily.get(&signal.coin) {
            if counters.fills >= cfg.daily_fill_cap {
                return Err(ReasonCode::DailyTradeLimit);
            }
            if counters.taker_fills >= cfg.daily_taker_fill_cap {
                return Err(ReasonCode::TakerLimit);
            }
            if counters.taker_streak >= cfg.taker_streak_lockout {
                return Err(ReasonCode::TakerStreakLimit);
            }
        }
        if cfg.maker_only && !signal.maker_only {
            return Err(ReasonCode::MakerOnlySignal);
        }
        Ok(())
    }

    /// Sizes the entry against per-coin/gross notional caps and the
    /// per-order notional band, then normalizes to the asset's lot size.
    pub fn size_entry(&self, signal: &Signal, equity: f64, mids: &HashMap<String, f64>, meta: &AssetMeta, cfg: &EngineConfig) -> Option<f64> {
        let per_coin_cap = equity * cfg.per_coin_notional_frac;
        let gross_used = self.inventory.gross_notional(mids);
        let gross_cap = equity * cfg.total_gross_notional_frac;
        let gross_headroom = (gross_cap - gross_used).max(0.0);

        let mut notional = per_coin_cap.min(gross_headroom).min(cfg.per_order_notional_limit);
        notional = notional.min(cfg.max_order_notional);
        if notional < cfg.min_order_notional {
            return None;
        }

        let raw_size = notional / signal.entry_price;
        let lot = 10f64.powi(-(meta.sz_decimals as i32));
        let size = (raw_size / lot).floor() * lot;
        if size <= 0.0 {
            None
        } else {
            Some(size)
        }
    }

    /// Preflight validation of price/size formatting before the order is
    /// ever sent to the venue — rejecting here is free, an exchange reject
    /// costs a round trip. Price must satisfy two independent rules: no more
    /// than `6 - szDecimals` decimal places, and no more than 5 significant
    /// figures, both checked regardless of the other.
    pub fn preflight(&self, price: f64, size: f64, meta: &AssetMeta) -> Result<(), ReasonCode> {
        if size <= 0.0 {
            return Err(ReasonCode::PreflightSizeNonPositive);
        }
        let size_str = format!("{:.*}", meta.sz_decimals as usize, size);
        if size_str.parse::<f64>().map(|v| (v - size).abs() > 1e-9).unwrap_or(true) {
            return Err(ReasonCode::PreflightSizeTooManyDecimals);
        }
        validate_price(price, meta.sz_decimals)
    }

    /// Submits an entry with at most one retry on a retryable exchange
    /// reject (bad ALO price, tick/lot mismatch, invalid price/size) per
    /// spec's single-retry rule; any other reject is returned as-is.
    pub async fn submit_entry(
        &mut self,
        exchange: &mut dyn ExchangeClient,
        budget: &mut BudgetManager,
        idempotency: &mut IdempotencyLedger,
        signal: &Signal,
        size: f64,
        cloid: String,
        now: DateTime<Utc>,
        cfg: &EngineConfig,
    ) -> Result<EntryDecision, EngineError> {
        let key = IdempotencyLedger::make_key(&format!("{}:{}:{:.8}:{:.8}", signal.coin, signal.side.is_buy(), signal.entry_price, size));
        if matches!(idempotency.seen(&key, now, std::time::Duration::from_secs(10)), SeenStatus::DuplicateWithinWindow) {
            return Ok(EntryDecision::Rejected(ReasonCode::ExchangeOther));
        }

        budget.note_order_submitted(cfg)?;
        let intent = OrderIntent {
            coin: signal.coin.clone(),
            is_buy: signal.side.is_buy(),
            size,
            price: signal.entry_price,
            reduce_only: false,
            maker_only: signal.maker_only,
            cloid: Some(cloid.clone()),
        };

        let outcome = exchange.place_order(intent.clone()).await.map_err(EngineError::Local)?;
        idempotency.mark_submitted(&key);

        match &outcome.status {
            OrderStatus::Rejected(reason, _msg) if reason.is_retryable_exchange_reject() => {
                budget.note_order_submitted(cfg)?;
                let retry = exchange.place_order(intent).await.map_err(EngineError::Local)?;
                idempotency.mark_result(&key, format!("{:?}", retry.status));
                match retry.status {
                    OrderStatus::Rejected(r, _) => Ok(EntryDecision::Rejected(r)),
                    _ => Ok(EntryDecision::Submitted(retry)),
                }
            }
            OrderStatus::Rejected(reason, _) => {
                idempotency.mark_result(&key, format!("{:?}", outcome.status));
                Ok(EntryDecision::Rejected(*reason))
            }
            _ => {
                idempotency.mark_result(&key, format!("{:?}", outcome.status));
                Ok(EntryDecision::Submitted(outcome))
            }
        }
    }

    /// Emergency flatten-all: cancels every resting order then closes every
    /// open position with a taker order. First action on budget/risk breach
    /// or an unprotected position that failed SL attachment.
    pub async fn flatten_all(&mut self, exchange: &mut dyn ExchangeClient) -> Result<(), LocalError> {
        log::warn!("flatten_all triggered");
        exchange.cancel_all_orders().await?;
        let coins: Vec<String> = self.inventory.positions.iter().filter(|(_, p)| p.side.is_some()).map(|(c, _)| c.clone()).collect();
        for coin in coins {
            let pos = self.inventory.positions.get(&coin).cloned().unwrap_or_default();
            let Some(side) = pos.side else { continue };
            let intent = OrderIntent {
                coin: coin.clone(),
                is_buy: side.opposite().is_buy(),
                size: pos.size,
                price: pos.entry_price,
                reduce_only: true,
                maker_only: false,
                cloid: None,
            };
            if let Err(e) = exchange.place_order(intent).await {
                log::error!("flatten_all: failed to close {coin}: {e}");
            }
        }
        Ok(())
    }

    pub fn note_fill(&mut self, coin: &str, is_buy: bool, size: f64, price: f64, is_taker: bool, now_ms: u64, protection: Option<ProtectionPlan>) {
        self.inventory.apply_fill(coin, is_buy, size, price, now_ms, protection);
        let counters = self.daily_counters(coin);
        counters.fills += 1;
        if is_taker {
            counters.taker_fills += 1;
            counters.taker_streak += 1;
        } else {
            counters.taker_streak = 0;
        }
    }

    pub fn reset_daily_counters(&mut self) {
        self.daily.clear();
    }
}

impl Default for OrderExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Regime;
    use crate::strategy::ProtectionPlan;

    fn signal() -> Signal {
        Signal {
            coin: "BTC".to_string(),
            side: Side::Long,
            entry_price: 30_000.0,
            size: 0.0,
            maker_only: true,
            protection: ProtectionPlan { tp_price: 30_500.0, sl_price: 29_700.0, time_stop_ms: 60_000 },
            regime: Regime::Trending,
            arm: "trend".to_string(),
        }
    }

    #[test]
    fn pyramiding_blocked_when_position_already_open_same_side() {
        let mut ex = OrderExecutor::new();
        ex.inventory.apply_fill("BTC", true, 0.01, 30_000.0, 1, None);
        let cfg = EngineConfig::default();
        let blocked = HashSet::new();
        assert_eq!(ex.entry_guards(&signal(), &cfg, &blocked), Err(ReasonCode::PyramidingBlocked));
    }

    #[test]
    fn flip_blocked_until_flat() {
        let mut ex = OrderExecutor::new();
        ex.inventory.apply_fill("BTC", false, 0.01, 30_000.0, 1, None);
        let cfg = EngineConfig::default();
        let blocked = HashSet::new();
        assert_eq!(ex.entry_guards(&signal(), &cfg, &blocked), Err(ReasonCode::FlipWaitFlat));
    }

    #[test]
    fn blocked_coin_is_rejected_first() {
        let ex = OrderExecutor::new();
        let cfg = EngineConfig::default();
        let mut blocked = HashSet::new();
        blocked.insert("BTC".to_string());
        assert_eq!(ex.entry_guards(&signal(), &cfg, &blocked), Err(ReasonCode::CoinBlocked));
    }

    #[test]
    fn sizing_respects_min_order_notional() {
        let ex = OrderExecutor::new();
        let cfg = EngineConfig { min_order_notional: 1_000_000.0, ..EngineConfig::default() };
        let meta = AssetMeta { asset_idx: 0, sz_decimals: 3, max_leverage: 20 };
        let mids = HashMap::new();
        assert_eq!(ex.size_entry(&signal(), 10_000.0, &mids, &meta, &cfg), None);
    }

    #[test]
    fn reconcile_detects_dark_fill_and_corrects_internal_state() {
        let mut ex = OrderExecutor::new();
        let mut live = HashMap::new();
        live.insert("BTC".to_string(), 0.05);
        let diffs = ex.inventory.reconcile(&live);
        assert_eq!(diffs.len(), 1);
        assert_eq!(ex.inventory.position("BTC").unwrap().size, 0.05);
    }
}
