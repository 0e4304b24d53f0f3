// protection.rs — C9 Protection Manager.
//
// Computes the desired TP/SL plan for an open position from the strategy's
// own per-trade plan, quantizes trigger prices to the asset's tick grid,
// derives deterministic managed-order client ids so a restart can
// re-recognise its own resting triggers, and enforces the strict
// SL-then-TP submission order with an emergency-flatten fallback on
// failure. The round-then-submit shape mirrors `exchange.rs`'s
// order-placement path; the failure branch reuses the same emergency
// cancel-all-then-halt shape as `execution.rs`.

use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::errors::{LocalError, ReasonCode};
use crate::exchange::{round_to_5_sig_figs, AssetMeta, ExchangeClient, OrderOutcome, OrderStatus, TriggerIntent, TriggerKind};
use crate::execution::validate_price;
use crate::strategy::ProtectionPlan;

#[derive(Debug, Clone, PartialEq)]
pub struct DesiredPlan {
    pub tp_price: f64,
    pub sl_price: f64,
}

/// Per-coin record of the protection manager's own resting triggers, kept
/// only in memory — a restart re-derives it from `recover_from_open_orders`
/// rather than persisting it, since the venue's open orders are already the
/// source of truth.
#[derive(Debug, Clone)]
pub struct TpSlState {
    pub reference_px: f64,
    pub tp_cloid: String,
    pub sl_cloid: String,
    pub extra_cloids: Vec<String>,
    pub last_synced_ms: i64,
}

/// Fixed prefix (ascii "tpsl" in hex) marking a cloid as protection-manager-owned.
const MANAGED_CLOID_PREFIX: &str = "0x7470736c";

/// Deterministic managed-cloid: a fixed prefix, a kind nibble, and a
/// truncated hash of `coin`+`kind` only — no entry price — so a restart can
/// recompute the exact same cloid for a still-open position and recognise
/// its own resting trigger instead of creating a duplicate.
pub fn managed_cloid(coin: &str, kind: TriggerKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"tpsl:");
    hasher.update(coin.as_bytes());
    hasher.update(b":");
    hasher.update(kind.as_wire().as_bytes());
    let digest = hasher.finalize();
    let kind_nibble = match kind {
        TriggerKind::TakeProfit => "1",
        TriggerKind::StopLoss => "2",
    };
    format!("{MANAGED_CLOID_PREFIX}{kind_nibble}{}", hex::encode(&digest[..15]))
}

/// Scans authoritative open orders for managed cloids and re-hydrates a
/// `TpSlState` per coin, so a restart re-attaches rather than resubmits.
/// Orders are matched back to `coin` purely by the venue's own `coin` field
/// on the order; the cloid only needs to match what `managed_cloid` would
/// produce for that coin to be trusted as ours.
pub fn recover_from_open_orders(orders: &[serde_json::Value], now_ms: i64) -> std::collections::HashMap<String, TpSlState> {
    let mut recovered: std::collections::HashMap<String, TpSlState> = std::collections::HashMap::new();
    for order in orders {
        let (Some(coin), Some(cloid)) = (order["coin"].as_str(), order["cloid"].as_str()) else { continue };
        if !cloid.starts_with(MANAGED_CLOID_PREFIX) {
            continue;
        }
        let px = order["limitPx"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
        let tp_cloid = managed_cloid(coin, TriggerKind::TakeProfit);
        let sl_cloid = managed_cloid(coin, TriggerKind::StopLoss);
        if cloid != tp_cloid && cloid != sl_cloid {
            continue;
        }
        let state = recovered.entry(coin.to_string()).or_insert_with(|| TpSlState {
            reference_px: px,
            tp_cloid: String::new(),
            sl_cloid: String::new(),
            extra_cloids: Vec::new(),
            last_synced_ms: now_ms,
        });
        if cloid == tp_cloid {
            state.tp_cloid = tp_cloid;
        } else if cloid == sl_cloid {
            state.sl_cloid = sl_cloid;
        }
    }
    recovered
}

fn quantize_trigger_price(price: f64, meta: &AssetMeta) -> f64 {
    let rounded = round_to_5_sig_figs(price);
    let decimals = 6usize.saturating_sub(meta.sz_decimals as usize);
    let scale = 10f64.powi(decimals as i32);
    (rounded * scale).round() / scale
}

/// Validates the plan's internal ordering before anything is sent to the
/// venue: TP beyond entry in the trade's favour, SL beyond entry against it,
/// TP strictly above SL for a long (below for a short).
pub fn validate_plan(plan: &DesiredPlan, entry_price: f64, is_buy: bool) -> Result<(), ReasonCode> {
    if is_buy {
        if plan.tp_price <= entry_price {
            return Err(ReasonCode::TpslTpNotBeyondEntry);
        }
        if plan.sl_price >= entry_price {
            return Err(ReasonCode::TpslSlNotBeyondEntry);
        }
    } else {
        if plan.tp_price >= entry_price {
            return Err(ReasonCode::TpslTpNotBeyondEntry);
        }
        if plan.sl_price <= entry_price {
            return Err(ReasonCode::TpslSlNotBeyondEntry);
        }
    }
    let tp_above_sl = if is_buy { plan.tp_price > plan.sl_price } else { plan.tp_price < plan.sl_price };
    if !tp_above_sl {
        return Err(ReasonCode::TpslTpNotAboveSl);
    }
    Ok(())
}

/// Debounce for `sync_protection`: only resubmit when there's no existing
/// state, the position's entry price has moved (a re-open after a flat
/// crossing), or the refresh cooldown has elapsed — never unconditionally
/// every cycle.
pub fn should_refresh_tpsl_state(existing: Option<&TpSlState>, entry_price: f64, now_ms: i64, cfg: &EngineConfig) -> bool {
    match existing {
        None => true,
        Some(state) => {
            if (entry_price - state.reference_px).abs() > 1e-9 {
                return true;
            }
            if state.tp_cloid.is_empty() || state.sl_cloid.is_empty() {
                return true;
            }
            now_ms.saturating_sub(state.last_synced_ms) >= cfg.tpsl_refresh_cooldown_ms
        }
    }
}

pub struct ProtectionManager;

impl ProtectionManager {
    pub fn new() -> Self {
        Self
    }

    /// Uses the strategy's own per-trade plan when the caller carried one
    /// forward from the entry signal; falls back to a flat-bps plan off
    /// `cfg.default_tp_bps`/`default_sl_bps` for positions with no known
    /// carried plan (e.g. recovered from a dark fill).
    pub fn desired_plan(&self, entry_price: f64, is_buy: bool, carried: Option<&ProtectionPlan>, cfg: &EngineConfig) -> DesiredPlan {
        if let Some(plan) = carried {
            return DesiredPlan { tp_price: plan.tp_price, sl_price: plan.sl_price };
        }
        let tp_pct = cfg.default_tp_bps / 10_000.0;
        let sl_pct = cfg.default_sl_bps / 10_000.0;
        if is_buy {
            DesiredPlan { tp_price: entry_price * (1.0 + tp_pct), sl_price: entry_price * (1.0 - sl_pct) }
        } else {
            DesiredPlan { tp_price: entry_price * (1.0 - tp_pct), sl_price: entry_price * (1.0 + sl_pct) }
        }
    }

    /// Attaches SL first, then TP. If the SL leg fails the position is left
    /// unprotected and must be emergency-flattened by the caller — a TP-only
    /// position is worse than no position at all. If the TP leg fails after
    /// SL succeeded, the position is still protected and the caller may
    /// retry TP attachment on the next cycle without flattening.
    pub async fn ensure_protection_for_coin(
        &self,
        exchange: &mut dyn ExchangeClient,
        coin: &str,
        position_size: f64,
        is_buy: bool,
        entry_price: f64,
        plan: &DesiredPlan,
        meta: &AssetMeta,
    ) -> Result<(OrderOutcome, Option<OrderOutcome>), ProtectionFailure> {
        validate_plan(plan, entry_price, is_buy).map_err(ProtectionFailure::InvalidPlan)?;

        let sl_px = quantize_trigger_price(plan.sl_price, meta);
        validate_price(sl_px, meta.sz_decimals).map_err(ProtectionFailure::TriggerPreflightFailed)?;
        let tp_px = quantize_trigger_price(plan.tp_price, meta);
        validate_price(tp_px, meta.sz_decimals).map_err(ProtectionFailure::TriggerPreflightFailed)?;

        let sl_trigger = TriggerIntent {
            coin: coin.to_string(),
            is_buy: !is_buy,
            size: position_size.abs(),
            trigger_price: sl_px,
            is_market: true,
            kind: TriggerKind::StopLoss,
            cloid: managed_cloid(coin, TriggerKind::StopLoss),
        };

        let sl_outcome = exchange
            .place_trigger(sl_trigger)
            .await
            .map_err(ProtectionFailure::SlSubmitFailed)?;
        if let OrderStatus::Rejected(reason, msg) = &sl_outcome.status {
            return Err(ProtectionFailure::SlRejected(*reason, msg.clone()));
        }

        let tp_trigger = TriggerIntent {
            coin: coin.to_string(),
            is_buy: !is_buy,
            size: position_size.abs(),
            trigger_price: tp_px,
            is_market: false,
            kind: TriggerKind::TakeProfit,
            cloid: managed_cloid(coin, TriggerKind::TakeProfit),
        };

        match exchange.place_trigger(tp_trigger).await {
            Ok(outcome) => Ok((sl_outcome, Some(outcome))),
            Err(_) => Ok((sl_outcome, None)),
        }
    }
}

impl Default for ProtectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum ProtectionFailure {
    InvalidPlan(ReasonCode),
    TriggerPreflightFailed(ReasonCode),
    SlSubmitFailed(LocalError),
    SlRejected(ReasonCode, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> AssetMeta {
        AssetMeta { asset_idx: 0, sz_decimals: 3, max_leverage: 20 }
    }

    #[test]
    fn managed_cloid_is_deterministic_and_kind_specific() {
        let tp = managed_cloid("BTC", TriggerKind::TakeProfit);
        let sl = managed_cloid("BTC", TriggerKind::StopLoss);
        assert_ne!(tp, sl);
        assert_eq!(tp, managed_cloid("BTC", TriggerKind::TakeProfit));
    }

    #[test]
    fn managed_cloid_is_independent_of_entry_price() {
        // Regression: a prior version hashed entry_price in, so the cloid
        // for the same coin+kind drifted across restarts whenever the
        // remembered entry price drifted even slightly.
        let a = managed_cloid("BTC", TriggerKind::StopLoss);
        let b = managed_cloid("BTC", TriggerKind::StopLoss);
        assert_eq!(a, b);
    }

    #[test]
    fn validate_plan_rejects_tp_not_beyond_entry_for_long() {
        let plan = DesiredPlan { tp_price: 99.0, sl_price: 95.0 };
        assert_eq!(validate_plan(&plan, 100.0, true), Err(ReasonCode::TpslTpNotBeyondEntry));
    }

    #[test]
    fn validate_plan_accepts_well_formed_long_plan() {
        let plan = DesiredPlan { tp_price: 105.0, sl_price: 95.0 };
        assert!(validate_plan(&plan, 100.0, true).is_ok());
    }

    #[test]
    fn quantize_trigger_price_rounds_to_asset_grid() {
        let q = quantize_trigger_price(30_123.456789, &meta());
        assert!((q - round_to_5_sig_figs(30_123.456789)).abs() < 1.0);
    }

    #[test]
    fn desired_plan_uses_carried_protection_over_flat_bps() {
        let mgr = ProtectionManager::new();
        let carried = ProtectionPlan { tp_price: 31_200.0, sl_price: 29_100.0, time_stop_ms: 60_000 };
        let cfg = EngineConfig::default();
        let plan = mgr.desired_plan(30_000.0, true, Some(&carried), &cfg);
        assert_eq!(plan, DesiredPlan { tp_price: 31_200.0, sl_price: 29_100.0 });
    }

    #[test]
    fn desired_plan_falls_back_to_flat_bps_without_carried_plan() {
        let mgr = ProtectionManager::new();
        let cfg = EngineConfig { default_tp_bps: 80.0, default_sl_bps: 50.0, ..EngineConfig::default() };
        let plan = mgr.desired_plan(30_000.0, true, None, &cfg);
        assert!((plan.tp_price - 30_240.0).abs() < 1e-6);
        assert!((plan.sl_price - 29_850.0).abs() < 1e-6);
    }

    #[test]
    fn should_refresh_tpsl_state_resubmits_when_state_absent() {
        let cfg = EngineConfig::default();
        assert!(should_refresh_tpsl_state(None, 30_000.0, 0, &cfg));
    }

    #[test]
    fn should_refresh_tpsl_state_debounces_within_cooldown() {
        let cfg = EngineConfig { tpsl_refresh_cooldown_ms: 5_000, ..EngineConfig::default() };
        let state = TpSlState {
            reference_px: 30_000.0,
            tp_cloid: "x".to_string(),
            sl_cloid: "y".to_string(),
            extra_cloids: Vec::new(),
            last_synced_ms: 1_000,
        };
        assert!(!should_refresh_tpsl_state(Some(&state), 30_000.0, 3_000, &cfg));
        assert!(should_refresh_tpsl_state(Some(&state), 30_000.0, 6_001, &cfg));
    }

    #[test]
    fn should_refresh_tpsl_state_triggers_on_entry_price_drift() {
        let cfg = EngineConfig { tpsl_refresh_cooldown_ms: 5_000, ..EngineConfig::default() };
        let state = TpSlState {
            reference_px: 30_000.0,
            tp_cloid: "x".to_string(),
            sl_cloid: "y".to_string(),
            extra_cloids: Vec::new(),
            last_synced_ms: 1_000,
        };
        assert!(should_refresh_tpsl_state(Some(&state), 30_500.0, 1_500, &cfg));
    }
}
