// exchange.rs — HTTP venue client (/info, /exchange) and preflight rounding
// helpers. Covers the broader set of request/action types the strategy and
// protection layers need: order placement (maker or taker), TP/SL trigger
// bundles, cancellation by oid or cloid, and the /info queries used for
// universe metadata, account state, fills, and rate limits.
//
// `/info` responses are kept as `serde_json::Value` rather than fully typed
// structs — the venue's JSON shapes vary by request `type` and the caller
// already knows which fields it needs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::errors::{LocalError, ReasonCode};
use crate::signing::{self, LimitOrderWire, OrderRequest, OrderTypeWire, TriggerOrderWire};

#[derive(Debug, Clone)]
pub struct AssetMeta {
    pub asset_idx: u32,
    pub sz_decimals: u32,
    pub max_leverage: u32,
}

#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub coin: String,
    pub is_buy: bool,
    pub size: f64,
    pub price: f64,
    pub reduce_only: bool,
    pub maker_only: bool,
    pub cloid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TriggerIntent {
    pub coin: String,
    pub is_buy: bool,
    pub size: f64,
    pub trigger_price: f64,
    pub is_market: bool,
    pub kind: TriggerKind,
    pub cloid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    TakeProfit,
    StopLoss,
}

impl TriggerKind {
    pub fn as_wire(self) -> &'static str {
        match self {
            TriggerKind::TakeProfit => "tp",
            TriggerKind::StopLoss => "sl",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderOutcome {
    pub oid: Option<u64>,
    pub cloid: Option<String>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Resting,
    Filled,
    Rejected(ReasonCode, String),
}

fn classify_reject(message: &str) -> ReasonCode {
    let lower = message.to_lowercase();
    if lower.contains("vault") {
        ReasonCode::ExchangeVaultNotRegistered
    } else if lower.contains("post only") || lower.contains("alo") || lower.contains("would match") {
        ReasonCode::ExchangeBadAloPx
    } else if lower.contains("min notional") || lower.contains("minimum value") {
        ReasonCode::ExchangeMinNotional
    } else if lower.contains("tick") || lower.contains("lot size") {
        ReasonCode::ExchangeTickOrLotSize
    } else if lower.contains("margin") {
        ReasonCode::ExchangeInsufficientMargin
    } else if lower.contains("price") {
        ReasonCode::ExchangeInvalidPrice
    } else if lower.contains("size") {
        ReasonCode::ExchangeInvalidSize
    } else if lower.contains("not approved") || lower.contains("does not exist") {
        ReasonCode::ExchangeNotApproved
    } else {
        ReasonCode::ExchangeOther
    }
}

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn load_universe(&mut self) -> Result<(), LocalError>;
    async fn fetch_clearinghouse_state(&mut self) -> Result<serde_json::Value, LocalError>;
    async fn fetch_all_mids(&mut self) -> Result<HashMap<String, f64>, LocalError>;
    async fn fetch_open_orders(&mut self) -> Result<Vec<serde_json::Value>, LocalError>;
    async fn fetch_user_fills_by_time(&mut self, start_time_ms: u64) -> Result<Vec<serde_json::Value>, LocalError>;
    async fn fetch_user_rate_limit(&mut self) -> Result<serde_json::Value, LocalError>;
    async fn fetch_candle_snapshot(&mut self, coin: &str, interval: &str, start_ms: u64, end_ms: u64) -> Result<Vec<serde_json::Value>, LocalError>;
    async fn fetch_funding_history(&mut self, coin: &str, start_ms: u64) -> Result<Vec<serde_json::Value>, LocalError>;

    async fn place_order(&mut self, intent: OrderIntent) -> Result<OrderOutcome, LocalError>;
    async fn place_tpsl_bundle(&mut self, entry: OrderIntent, tp: TriggerIntent, sl: TriggerIntent) -> Result<Vec<OrderOutcome>, LocalError>;
    async fn place_trigger(&mut self, trigger: TriggerIntent) -> Result<OrderOutcome, LocalError>;

    async fn cancel_order(&mut self, coin: &str, oid: u64) -> Result<(), LocalError>;
    async fn cancel_by_cloid(&mut self, coin: &str, cloid: &str) -> Result<(), LocalError>;
    async fn cancel_all_orders(&mut self) -> Result<u64, LocalError>;
    async fn cancel_coin_orders(&mut self, coin: &str) -> Result<u64, LocalError>;

    fn asset_meta(&self, coin: &str) -> Option<AssetMeta>;
}

pub struct LiveExchange {
    pub base_url: String,
    pub ws_url: String,
    pub account_address: String,
    pub private_key: String,
    pub vault_address: Option<String>,
    pub client: reqwest::Client,
    pub coin_to_asset: HashMap<String, u32>,
    pub asset_info: HashMap<u32, (u32, u32)>, // asset_idx -> (sz_decimals, max_leverage)
    cached_mids: Option<(HashMap<String, f64>, Instant)>,
    cached_open_orders: Option<(Vec<serde_json::Value>, Instant)>,
    nonce_counter: u64,
}

const CACHE_DURATION: Duration = Duration::from_secs(2);

impl LiveExchange {
    pub fn new(account_address: String, private_key: String, vault_address: Option<String>, base_url: String, ws_url: String) -> Self {
        Self {
            base_url,
            ws_url,
            account_address,
            private_key,
            vault_address,
            client: reqwest::Client::new(),
            coin_to_asset: HashMap::new(),
            asset_info: HashMap::new(),
            cached_mids: None,
            cached_open_orders: None,
            nonce_counter: 0,
        }
    }

    fn next_nonce(&mut self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis() as u64;
        self.nonce_counter = self.nonce_counter.max(now) + 1;
        self.nonce_counter
    }

    async fn post_info(&self, payload: serde_json::Value) -> Result<serde_json::Value, LocalError> {
        let resp = self
            .client
            .post(format!("{}/info", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| LocalError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(LocalError::Network("rate limited".to_string()));
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| LocalError::Network(e.to_string()))?;
        if let Some(err) = data["error"].as_str() {
            if err.contains("rate limited") {
                return Err(LocalError::Network("rate limited".to_string()));
            }
        }
        Ok(data)
    }

    async fn post_exchange(&self, action: serde_json::Value, nonce: u64, signature: signing::Signature) -> Result<serde_json::Value, LocalError> {
        let payload = serde_json::json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
            "vaultAddress": self.vault_address,
        });

        log::debug!("exchange request: {}", serde_json::to_string(&payload).unwrap_or_default());

        let resp = self
            .client
            .post(format!("{}/exchange", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| LocalError::Network(e.to_string()))?;

        if resp.status().as_u16() == 429 {
            return Err(LocalError::Network("rate limited".to_string()));
        }

        let status = resp.status();
        let text = resp.text().await.map_err(|e| LocalError::Network(e.to_string()))?;
        log::debug!("exchange response ({status}): {text}");

        let data: serde_json::Value = serde_json::from_str(&text).map_err(|e| LocalError::Serde(e.to_string()))?;
        if data["status"].as_str() == Some("err") {
            let msg = data["response"].as_str().unwrap_or_default().to_string();
            if msg.contains("rate limited") || msg.contains("cumulative requests") {
                return Err(LocalError::Network("rate limited".to_string()));
            }
        }
        Ok(data)
    }

    fn order_statuses(&self, result: &serde_json::Value) -> Vec<Result<OrderOutcome, String>> {
        let mut out = Vec::new();
        if let Some(statuses) = result["response"]["data"]["statuses"].as_array() {
            for s in statuses {
                if let Some(err) = s["error"].as_str() {
                    out.push(Err(err.to_string()));
                } else if let Some(resting) = s["resting"].as_object() {
                    out.push(Ok(OrderOutcome {
                        oid: resting.get("oid").and_then(|v| v.as_u64()),
                        cloid: resting.get("cloid").and_then(|v| v.as_str()).map(String::from),
                        status: OrderStatus::Resting,
                    }));
                } else if let Some(filled) = s["filled"].as_object() {
                    out.push(Ok(OrderOutcome {
                        oid: filled.get("oid").and_then(|v| v.as_u64()),
                        cloid: filled.get("cloid").and_then(|v| v.as_str()).map(String::from),
                        status: OrderStatus::Filled,
                    }));
                }
            }
        }
        out
    }

    fn build_order_request(&self, intent: &OrderIntent, asset_idx: u32) -> OrderRequest {
        let sz_decimals = self.asset_info.get(&asset_idx).map(|i| i.0).unwrap_or(4);
        let size_rounded = round_f64(intent.size, sz_decimals as usize);
        let price_rounded = round_to_5_sig_figs(intent.price);
        let tif = if intent.maker_only { "Alo" } else { "Ioc" };
        OrderRequest {
            asset: asset_idx,
            is_buy: intent.is_buy,
            limit_px: float_to_wire(price_rounded),
            sz: float_to_wire(size_rounded),
            reduce_only: intent.reduce_only,
            order_type: OrderTypeWire::Limit(LimitOrderWire { tif: tif.to_string() }),
            cloid: intent.cloid.clone(),
        }
    }

    fn build_trigger_request(&self, trigger: &TriggerIntent, asset_idx: u32) -> OrderRequest {
        let sz_decimals = self.asset_info.get(&asset_idx).map(|i| i.0).unwrap_or(4);
        let size_rounded = round_f64(trigger.size, sz_decimals as usize);
        let px_rounded = round_to_5_sig_figs(trigger.trigger_price);
        OrderRequest {
            asset: asset_idx,
            is_buy: trigger.is_buy,
            limit_px: float_to_wire(px_rounded),
            sz: float_to_wire(size_rounded),
            reduce_only: true,
            order_type: OrderTypeWire::Trigger(TriggerOrderWire {
                is_market: trigger.is_market,
                trigger_px: float_to_wire(px_rounded),
                tpsl: trigger.kind.as_wire().to_string(),
            }),
            cloid: Some(trigger.cloid.clone()),
        }
    }

    fn asset_idx_for(&self, coin: &str) -> Result<u32, LocalError> {
        self.coin_to_asset
            .get(coin)
            .copied()
            .ok_or_else(|| LocalError::Other(format!("unknown coin: {coin}")))
    }
}

#[async_trait]
impl ExchangeClient for LiveExchange {
    async fn load_universe(&mut self) -> Result<(), LocalError> {
        let data = self.post_info(serde_json::json!({ "type": "meta" })).await?;
        if let Some(universe) = data["universe"].as_array() {
            for (i, asset) in universe.iter().enumerate() {
                if let Some(name) = asset["name"].as_str() {
                    let asset_idx = i as u32;
                    let sz_decimals = asset["szDecimals"].as_u64().unwrap_or(4) as u32;
                    let max_leverage = asset["maxLeverage"].as_u64().unwrap_or(20) as u32;
                    self.coin_to_asset.insert(name.to_string(), asset_idx);
                    self.asset_info.insert(asset_idx, (sz_decimals, max_leverage));
                }
            }
        }
        log::info!("loaded {} assets from universe", self.coin_to_asset.len());
        Ok(())
    }

    async fn fetch_clearinghouse_state(&mut self) -> Result<serde_json::Value, LocalError> {
        self.post_info(serde_json::json!({
            "type": "clearinghouseState",
            "user": self.account_address,
        }))
        .await
    }

    async fn fetch_all_mids(&mut self) -> Result<HashMap<String, f64>, LocalError> {
        if let Some((mids, ts)) = &self.cached_mids {
            if ts.elapsed() < CACHE_DURATION {
                return Ok(mids.clone());
            }
        }
        let data = self.post_info(serde_json::json!({ "type": "allMids" })).await?;
        let mut mids = HashMap::new();
        if let Some(obj) = data.as_object() {
            for (coin, px_val) in obj {
                if let Some(px) = px_val.as_str().and_then(|s| s.parse::<f64>().ok()) {
                    mids.insert(coin.clone(), px);
                }
            }
        }
        self.cached_mids = Some((mids.clone(), Instant::now()));
        Ok(mids)
    }

    async fn fetch_open_orders(&mut self) -> Result<Vec<serde_json::Value>, LocalError> {
        if let Some((orders, ts)) = &self.cached_open_orders {
            if ts.elapsed() < CACHE_DURATION {
                return Ok(orders.clone());
            }
        }
        let data = self
            .post_info(serde_json::json!({ "type": "openOrders", "user": self.account_address }))
            .await?;
        let orders = data.as_array().cloned().unwrap_or_default();
        self.cached_open_orders = Some((orders.clone(), Instant::now()));
        Ok(orders)
    }

    async fn fetch_user_fills_by_time(&mut self, start_time_ms: u64) -> Result<Vec<serde_json::Value>, LocalError> {
        let data = self
            .post_info(serde_json::json!({
                "type": "userFillsByTime",
                "user": self.account_address,
                "startTime": start_time_ms,
            }))
            .await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    async fn fetch_user_rate_limit(&mut self) -> Result<serde_json::Value, LocalError> {
        self.post_info(serde_json::json!({ "type": "userRateLimit", "user": self.account_address }))
            .await
    }

    async fn fetch_candle_snapshot(&mut self, coin: &str, interval: &str, start_ms: u64, end_ms: u64) -> Result<Vec<serde_json::Value>, LocalError> {
        let data = self
            .post_info(serde_json::json!({
                "type": "candleSnapshot",
                "req": { "coin": coin, "interval": interval, "startTime": start_ms, "endTime": end_ms },
            }))
            .await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    async fn fetch_funding_history(&mut self, coin: &str, start_ms: u64) -> Result<Vec<serde_json::Value>, LocalError> {
        let data = self
            .post_info(serde_json::json!({ "type": "fundingHistory", "coin": coin, "startTime": start_ms }))
            .await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    async fn place_order(&mut self, intent: OrderIntent) -> Result<OrderOutcome, LocalError> {
        let asset_idx = self.asset_idx_for(&intent.coin)?;
        let order = self.build_order_request(&intent, asset_idx);
        let nonce = self.next_nonce();
        let vault = self.vault_address.clone();
        let (sig, action_json) = signing::sign_order_action(&self.private_key, vec![order], "na", nonce, vault.as_deref())?;
        let result = self.post_exchange(action_json, nonce, sig).await?;

        match self.order_statuses(&result).into_iter().next() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(msg)) => Ok(OrderOutcome { oid: None, cloid: intent.cloid, status: OrderStatus::Rejected(classify_reject(&msg), msg) }),
            None => Ok(OrderOutcome { oid: None, cloid: intent.cloid, status: OrderStatus::Rejected(ReasonCode::ExchangeOther, "empty response".to_string()) }),
        }
    }

    async fn place_trigger(&mut self, trigger: TriggerIntent) -> Result<OrderOutcome, LocalError> {
        let asset_idx = self.asset_idx_for(&trigger.coin)?;
        let order = self.build_trigger_request(&trigger, asset_idx);
        let nonce = self.next_nonce();
        let vault = self.vault_address.clone();
        let (sig, action_json) = signing::sign_order_action(&self.private_key, vec![order], "na", nonce, vault.as_deref())?;
        let result = self.post_exchange(action_json, nonce, sig).await?;

        match self.order_statuses(&result).into_iter().next() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(msg)) => Ok(OrderOutcome { oid: None, cloid: Some(trigger.cloid), status: OrderStatus::Rejected(classify_reject(&msg), msg) }),
            None => Ok(OrderOutcome { oid: None, cloid: Some(trigger.cloid), status: OrderStatus::Rejected(ReasonCode::ExchangeOther, "empty response".to_string()) }),
        }
    }

    async fn place_tpsl_bundle(&mut self, entry: OrderIntent, tp: TriggerIntent, sl: TriggerIntent) -> Result<Vec<OrderOutcome>, LocalError> {
        let asset_idx = self.asset_idx_for(&entry.coin)?;
        let entry_req = self.build_order_request(&entry, asset_idx);
        let tp_req = self.build_trigger_request(&tp, asset_idx);
        let sl_req = self.build_trigger_request(&sl, asset_idx);

        let nonce = self.next_nonce();
        let vault = self.vault_address.clone();
        let (sig, action_json) = signing::sign_order_action(
            &self.private_key,
            vec![entry_req, tp_req, sl_req],
            "positionTpsl",
            nonce,
            vault.as_deref(),
        )?;
        let result = self.post_exchange(action_json, nonce, sig).await?;

        let cloids = [entry.cloid.clone(), Some(tp.cloid.clone()), Some(sl.cloid.clone())];
        let statuses = self.order_statuses(&result);
        let mut outcomes = Vec::with_capacity(3);
        for (i, cloid) in cloids.into_iter().enumerate() {
            match statuses.get(i) {
                Some(Ok(o)) => outcomes.push(o.clone()),
                Some(Err(msg)) => outcomes.push(OrderOutcome { oid: None, cloid, status: OrderStatus::Rejected(classify_reject(msg), msg.clone()) }),
                None => outcomes.push(OrderOutcome { oid: None, cloid, status: OrderStatus::Rejected(ReasonCode::ExchangeOther, "missing status".to_string()) }),
            }
        }
        Ok(outcomes)
    }

    async fn cancel_order(&mut self, coin: &str, oid: u64) -> Result<(), LocalError> {
        let asset_idx = self.asset_idx_for(coin)?;
        let nonce = self.next_nonce();
        let vault = self.vault_address.clone();
        let (sig, action_json) = signing::sign_cancel_action(&self.private_key, vec![(asset_idx, oid)], nonce, vault.as_deref())?;
        let result = self.post_exchange(action_json, nonce, sig).await?;
        if result["status"].as_str() == Some("err") {
            return Err(LocalError::Other(result["response"].to_string()));
        }
        Ok(())
    }

    async fn cancel_by_cloid(&mut self, coin: &str, cloid: &str) -> Result<(), LocalError> {
        let asset_idx = self.asset_idx_for(coin)?;
        let nonce = self.next_nonce();
        let vault = self.vault_address.clone();
        let (sig, action_json) = signing::sign_cancel_by_cloid_action(&self.private_key, vec![(asset_idx, cloid.to_string())], nonce, vault.as_deref())?;
        let result = self.post_exchange(action_json, nonce, sig).await?;
        if result["status"].as_str() == Some("err") {
            return Err(LocalError::Other(result["response"].to_string()));
        }
        Ok(())
    }

    async fn cancel_all_orders(&mut self) -> Result<u64, LocalError> {
        let orders = self.fetch_open_orders().await?;
        if orders.is_empty() {
            return Ok(0);
        }
        log::warn!("cancelling {} open orders", orders.len());
        let mut cancelled = 0u64;
        for order in &orders {
            let (Some(coin), Some(oid)) = (order["coin"].as_str(), order["oid"].as_u64()) else { continue };
            match self.cancel_order(coin, oid).await {
                Ok(()) => cancelled += 1,
                Err(e) => log::error!("cancel_all: {coin} oid={oid}: {e}"),
            }
        }
        Ok(cancelled)
    }

    async fn cancel_coin_orders(&mut self, coin: &str) -> Result<u64, LocalError> {
        let orders = self.fetch_open_orders().await?;
        let mut cancelled = 0u64;
        for order in orders.iter().filter(|o| o["coin"].as_str() == Some(coin)) {
            if let Some(oid) = order["oid"].as_u64() {
                if self.cancel_order(coin, oid).await.is_ok() {
                    cancelled += 1;
                }
            }
        }
        Ok(cancelled)
    }

    fn asset_meta(&self, coin: &str) -> Option<AssetMeta> {
        let asset_idx = *self.coin_to_asset.get(coin)?;
        let (sz_decimals, max_leverage) = *self.asset_info.get(&asset_idx)?;
        Some(AssetMeta { asset_idx, sz_decimals, max_leverage })
    }
}

pub fn round_to_5_sig_figs(val: f64) -> f64 {
    if val == 0.0 {
        return 0.0;
    }
    let d = 5 - 1 - (val.abs().log10().floor() as i32);
    let d = d.clamp(0, 10);
    let factor = 10_f64.powi(d);
    (val * factor).round() / factor
}

pub fn round_f64(val: f64, decimals: usize) -> f64 {
    let factor = 10_f64.powi(decimals as i32);
    (val * factor).round() / factor
}

/// Matches the venue SDK's `float_to_wire`: round to 8 decimals, then strip
/// trailing zeros (and a trailing dot) so e.g. 100.00000000 becomes "100".
pub fn float_to_wire(x: f64) -> String {
    let rounded = format!("{:.8}", x);
    if rounded.contains('.') {
        rounded.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        rounded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_wire_strips_trailing_zeros() {
        assert_eq!(float_to_wire(100.0), "100");
        assert_eq!(float_to_wire(0.012300), "0.0123");
    }

    #[test]
    fn round_to_5_sig_figs_matches_expected() {
        assert_eq!(round_to_5_sig_figs(30123.456), 30123.0);
        assert_eq!(round_to_5_sig_figs(0.00012345678), 0.00012346);
    }

    #[test]
    fn classify_reject_maps_margin_message() {
        assert_eq!(classify_reject("Insufficient margin for order"), ReasonCode::ExchangeInsufficientMargin);
    }
}
