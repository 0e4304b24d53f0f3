// Shared mock `ExchangeClient` for integration tests: a blank venue with no
// universe assets, no resting orders, and no open positions, so shutdown
// cleanup in `engine::request_shutdown` succeeds on the first attempt.

use std::collections::HashMap;

use async_trait::async_trait;
use perp_control_plane::errors::LocalError;
use perp_control_plane::exchange::{AssetMeta, ExchangeClient, OrderIntent, OrderOutcome, OrderStatus, TriggerIntent};

pub struct MockExchange {
    pub universe: Vec<(String, AssetMeta)>,
    pub clearinghouse_state: serde_json::Value,
}

impl MockExchange {
    pub fn new(universe: Vec<&str>) -> Self {
        Self {
            universe: universe
                .into_iter()
                .enumerate()
                .map(|(i, name)| (name.to_string(), AssetMeta { asset_idx: i as u32, sz_decimals: 3, max_leverage: 20 }))
                .collect(),
            clearinghouse_state: serde_json::json!({"marginSummary": {"accountValue": "10000.0"}}),
        }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn load_universe(&mut self) -> Result<(), LocalError> {
        Ok(())
    }

    async fn fetch_clearinghouse_state(&mut self) -> Result<serde_json::Value, LocalError> {
        Ok(self.clearinghouse_state.clone())
    }

    async fn fetch_all_mids(&mut self) -> Result<HashMap<String, f64>, LocalError> {
        Ok(self.universe.iter().map(|(c, _)| (c.clone(), 100.0)).collect())
    }

    async fn fetch_open_orders(&mut self) -> Result<Vec<serde_json::Value>, LocalError> {
        Ok(Vec::new())
    }

    async fn fetch_user_fills_by_time(&mut self, _start_time_ms: u64) -> Result<Vec<serde_json::Value>, LocalError> {
        Ok(Vec::new())
    }

    async fn fetch_user_rate_limit(&mut self) -> Result<serde_json::Value, LocalError> {
        Ok(serde_json::json!({}))
    }

    async fn fetch_candle_snapshot(&mut self, _coin: &str, _interval: &str, _start_ms: u64, _end_ms: u64) -> Result<Vec<serde_json::Value>, LocalError> {
        Ok(Vec::new())
    }

    async fn fetch_funding_history(&mut self, _coin: &str, _start_ms: u64) -> Result<Vec<serde_json::Value>, LocalError> {
        Ok(Vec::new())
    }

    async fn place_order(&mut self, intent: OrderIntent) -> Result<OrderOutcome, LocalError> {
        Ok(OrderOutcome { oid: Some(1), cloid: intent.cloid, status: OrderStatus::Resting })
    }

    async fn place_tpsl_bundle(&mut self, entry: OrderIntent, _tp: TriggerIntent, _sl: TriggerIntent) -> Result<Vec<OrderOutcome>, LocalError> {
        Ok(vec![OrderOutcome { oid: Some(1), cloid: entry.cloid, status: OrderStatus::Resting }])
    }

    async fn place_trigger(&mut self, trigger: TriggerIntent) -> Result<OrderOutcome, LocalError> {
        Ok(OrderOutcome { oid: Some(2), cloid: Some(trigger.cloid), status: OrderStatus::Resting })
    }

    async fn cancel_order(&mut self, _coin: &str, _oid: u64) -> Result<(), LocalError> {
        Ok(())
    }

    async fn cancel_by_cloid(&mut self, _coin: &str, _cloid: &str) -> Result<(), LocalError> {
        Ok(())
    }

    async fn cancel_all_orders(&mut self) -> Result<u64, LocalError> {
        Ok(0)
    }

    async fn cancel_coin_orders(&mut self, _coin: &str) -> Result<u64, LocalError> {
        Ok(0)
    }

    fn asset_meta(&self, coin: &str) -> Option<AssetMeta> {
        self.universe.iter().find(|(c, _)| c == coin).map(|(_, m)| m.clone())
    }
}

/// An `EngineConfig` pointed at a scratch temp directory so state files and
/// streams never collide with a real run.
pub fn test_config(dir: &std::path::Path) -> perp_control_plane::config::EngineConfig {
    let mut cfg = perp_control_plane::config::EngineConfig::default();
    cfg.symbol_whitelist = vec!["BTC".to_string(), "ETH".to_string()];
    cfg.budget_state_path = dir.join("budget-state.json").to_string_lossy().to_string();
    cfg.idempotency_state_path = dir.join("idempotency-state.json").to_string_lossy().to_string();
    cfg.bandit_state_path = dir.join("bandit-state.json").to_string_lossy().to_string();
    cfg.coin_selector_state_path = dir.join("coin-selector-state.json").to_string_lossy().to_string();
    cfg.feedback_state_path = dir.join("feedback-state.json").to_string_lossy().to_string();
    cfg.improvement_state_path = dir.join("improvement-state.json").to_string_lossy().to_string();
    cfg.runtime_state_path = dir.join("runtime-state.json").to_string_lossy().to_string();
    cfg.kill_switch_path = dir.join("KILL_SWITCH").to_string_lossy().to_string();
    cfg.streams_dir = dir.join("streams").to_string_lossy().to_string();
    cfg
}
