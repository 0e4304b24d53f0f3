// signing.rs — EIP-712 + msgpack action signing for the exchange endpoint.
//
// Generalised from a single "place a Gtc/Alo limit order" flow into the
// shared action-hash/sign machinery reused by order placement, cancellation,
// and TP/SL trigger bundles. The JSON wire body is still hand-built with
// explicit `serde_json::Map` insertion order rather than the `json!` macro:
// Hyperliquid re-msgpacks the JSON request body to verify the signature, so
// the key order in the JSON must match the abbreviated msgpack field order
// byte-for-byte or the recovered signer address will not match.

use ethers_core::types::transaction::eip712::EIP712Domain;
use ethers_core::types::{Address, H256, U256};
use ethers_core::utils::keccak256;
use ethers_signers::{LocalWallet, Signer};
use rmp_serde::Serializer;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::errors::LocalError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub r: String,
    pub s: String,
    pub v: u8,
}

// ─── JSON wire types (camelCase, full field names) ─────────────────────

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub asset: u32,
    pub is_buy: bool,
    pub limit_px: String,
    pub sz: String,
    pub reduce_only: bool,
    pub order_type: OrderTypeWire,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloid: Option<String>,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum OrderTypeWire {
    Limit(LimitOrderWire),
    Trigger(TriggerOrderWire),
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LimitOrderWire {
    pub tif: String,
}

#[derive(Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TriggerOrderWire {
    pub is_market: bool,
    pub trigger_px: String,
    pub tpsl: String, // "tp" | "sl"
}

#[derive(Serialize, Clone)]
pub struct ActionWire {
    pub r#type: String, // "order"
    pub orders: Vec<OrderRequest>,
    pub grouping: String, // "na" | "positionTpsl"
}

#[derive(Serialize, Clone)]
pub struct CancelWire {
    pub a: u32,
    pub o: u64,
}

#[derive(Serialize, Clone)]
pub struct CancelActionWire {
    pub r#type: String, // "cancel"
    pub cancels: Vec<CancelWire>,
}

#[derive(Serialize, Clone)]
pub struct CancelByCloidWire {
    pub asset: u32,
    pub cloid: String,
}

#[derive(Serialize, Clone)]
pub struct CancelByCloidActionWire {
    pub r#type: String, // "cancelByCloid"
    pub cancels: Vec<CancelByCloidWire>,
}

// ─── MsgPack wire types (abbreviated keys, matching the Python SDK) ────

#[derive(Serialize)]
struct OrderWireMsgPack {
    a: u32,
    b: bool,
    p: String,
    s: String,
    r: bool,
    t: OrderTypeWireMsgPack,
    #[serde(skip_serializing_if = "Option::is_none")]
    c: Option<String>,
}

#[derive(Serialize)]
enum OrderTypeWireMsgPack {
    #[serde(rename = "limit")]
    Limit { limit: LimitOrderWireMsgPack },
    #[serde(rename = "trigger")]
    Trigger { trigger: TriggerOrderWireMsgPack },
}

#[derive(Serialize)]
struct LimitOrderWireMsgPack {
    tif: String,
}

#[derive(Serialize)]
struct TriggerOrderWireMsgPack {
    #[serde(rename = "isMarket")]
    is_market: bool,
    #[serde(rename = "triggerPx")]
    trigger_px: String,
    tpsl: String,
}

#[derive(Serialize)]
struct OrderActionMsgPack {
    r#type: String,
    orders: Vec<OrderWireMsgPack>,
    grouping: String,
}

#[derive(Serialize)]
struct CancelWireMsgPack {
    a: u32,
    o: u64,
}

#[derive(Serialize)]
struct CancelActionMsgPack {
    r#type: String,
    cancels: Vec<CancelWireMsgPack>,
}

#[derive(Serialize)]
struct CancelByCloidWireMsgPack {
    asset: u32,
    cloid: String,
}

#[derive(Serialize)]
struct CancelByCloidActionMsgPack {
    r#type: String,
    cancels: Vec<CancelByCloidWireMsgPack>,
}

fn order_msgpack(o: &OrderRequest) -> OrderWireMsgPack {
    let t = match &o.order_type {
        OrderTypeWire::Limit(l) => OrderTypeWireMsgPack::Limit {
            limit: LimitOrderWireMsgPack { tif: l.tif.clone() },
        },
        OrderTypeWire::Trigger(tr) => OrderTypeWireMsgPack::Trigger {
            trigger: TriggerOrderWireMsgPack {
                is_market: tr.is_market,
                trigger_px: tr.trigger_px.clone(),
                tpsl: tr.tpsl.clone(),
            },
        },
    };
    OrderWireMsgPack {
        a: o.asset,
        b: o.is_buy,
        p: o.limit_px.clone(),
        s: o.sz.clone(),
        r: o.reduce_only,
        t,
        c: o.cloid.clone(),
    }
}

fn order_json(o: &OrderRequest) -> serde_json::Value {
    let mut order_map = serde_json::Map::new();
    order_map.insert("a".to_string(), serde_json::Value::from(o.asset));
    order_map.insert("b".to_string(), serde_json::Value::from(o.is_buy));
    order_map.insert("p".to_string(), serde_json::Value::from(o.limit_px.clone()));
    order_map.insert("s".to_string(), serde_json::Value::from(o.sz.clone()));
    order_map.insert("r".to_string(), serde_json::Value::from(o.reduce_only));

    let t_value = match &o.order_type {
        OrderTypeWire::Limit(l) => {
            let mut tif_map = serde_json::Map::new();
            tif_map.insert("tif".to_string(), serde_json::Value::from(l.tif.clone()));
            let mut wrap = serde_json::Map::new();
            wrap.insert("limit".to_string(), serde_json::Value::Object(tif_map));
            serde_json::Value::Object(wrap)
        }
        OrderTypeWire::Trigger(tr) => {
            let mut trig_map = serde_json::Map::new();
            trig_map.insert("isMarket".to_string(), serde_json::Value::from(tr.is_market));
            trig_map.insert("triggerPx".to_string(), serde_json::Value::from(tr.trigger_px.clone()));
            trig_map.insert("tpsl".to_string(), serde_json::Value::from(tr.tpsl.clone()));
            let mut wrap = serde_json::Map::new();
            wrap.insert("trigger".to_string(), serde_json::Value::Object(trig_map));
            serde_json::Value::Object(wrap)
        }
    };
    order_map.insert("t".to_string(), t_value);
    if let Some(cloid) = &o.cloid {
        order_map.insert("c".to_string(), serde_json::Value::from(cloid.clone()));
    }
    serde_json::Value::Object(order_map)
}

/// keccak256(msgpack(action) ++ nonce.to_be_bytes(8) ++ vault_marker). Matches
/// the Python SDK's `action_hash`; `expires_after` is never set here.
fn action_hash_bytes(msgpack_bytes: &[u8], nonce: u64, vault_address: Option<&str>) -> [u8; 32] {
    let mut buf = msgpack_bytes.to_vec();
    buf.extend_from_slice(&nonce.to_be_bytes());
    match vault_address {
        None => buf.push(0x00),
        Some(addr) => {
            buf.push(0x01);
            let addr_clean = addr.strip_prefix("0x").unwrap_or(addr);
            if let Ok(bytes) = hex::decode(addr_clean) {
                buf.extend_from_slice(&bytes);
            }
        }
    }
    keccak256(&buf)
}

fn sign_action_hash(private_key: &str, action_hash: [u8; 32]) -> Result<Signature, LocalError> {
    let wallet = LocalWallet::from_str(private_key)
        .map_err(|e| LocalError::Other(format!("invalid private key: {e}")))?;

    let action_hash_h256 = H256::from(action_hash);

    let domain = EIP712Domain {
        name: Some("Exchange".to_string()),
        version: Some("1".to_string()),
        chain_id: Some(U256::from(1337)),
        verifying_contract: Some(Address::zero()),
        salt: None,
    };
    let domain_hash = domain.separator();

    let agent_type_hash = keccak256("Agent(string source,bytes32 connectionId)".as_bytes());
    let source_hash = keccak256("a".as_bytes());

    let mut encoded = Vec::new();
    encoded.extend_from_slice(&agent_type_hash);
    encoded.extend_from_slice(&source_hash);
    encoded.extend_from_slice(action_hash_h256.as_bytes());
    let struct_hash = keccak256(&encoded);

    let mut final_payload = Vec::new();
    final_payload.extend_from_slice(&[0x19, 0x01]);
    final_payload.extend_from_slice(&domain_hash);
    final_payload.extend_from_slice(&struct_hash);
    let final_digest = H256::from(keccak256(&final_payload));

    let sig = wallet
        .sign_hash(final_digest)
        .map_err(|e| LocalError::Other(format!("signing failed: {e}")))?;

    Ok(Signature {
        r: format!("0x{:0>64x}", sig.r),
        s: format!("0x{:0>64x}", sig.s),
        v: sig.v as u8,
    })
}

/// Signs an order-placement action (`grouping` = "na" for ordinary entries,
/// "positionTpsl" for a TP/SL bundle submitted alongside an entry).
pub fn sign_order_action(
    private_key: &str,
    orders: Vec<OrderRequest>,
    grouping: &str,
    nonce: u64,
    vault_address: Option<&str>,
) -> Result<(Signature, serde_json::Value), LocalError> {
    let msgpack_orders: Vec<OrderWireMsgPack> = orders.iter().map(order_msgpack).collect();
    let msgpack_action = OrderActionMsgPack {
        r#type: "order".to_string(),
        orders: msgpack_orders,
        grouping: grouping.to_string(),
    };

    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .map_err(|e| LocalError::Serde(e.to_string()))?;

    let hash = action_hash_bytes(&buf, nonce, vault_address);
    let signature = sign_action_hash(private_key, hash)?;

    let json_orders: Vec<serde_json::Value> = orders.iter().map(order_json).collect();
    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from("order"));
    action_map.insert("orders".to_string(), serde_json::Value::Array(json_orders));
    action_map.insert("grouping".to_string(), serde_json::Value::from(grouping));

    Ok((signature, serde_json::Value::Object(action_map)))
}

pub fn sign_cancel_action(
    private_key: &str,
    cancels: Vec<(u32, u64)>,
    nonce: u64,
    vault_address: Option<&str>,
) -> Result<(Signature, serde_json::Value), LocalError> {
    let msgpack_action = CancelActionMsgPack {
        r#type: "cancel".to_string(),
        cancels: cancels.iter().map(|(a, o)| CancelWireMsgPack { a: *a, o: *o }).collect(),
    };

    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .map_err(|e| LocalError::Serde(e.to_string()))?;

    let hash = action_hash_bytes(&buf, nonce, vault_address);
    let signature = sign_action_hash(private_key, hash)?;

    let json_cancels: Vec<serde_json::Value> = cancels
        .iter()
        .map(|(a, o)| {
            let mut m = serde_json::Map::new();
            m.insert("a".to_string(), serde_json::Value::from(*a));
            m.insert("o".to_string(), serde_json::Value::from(*o));
            serde_json::Value::Object(m)
        })
        .collect();
    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from("cancel"));
    action_map.insert("cancels".to_string(), serde_json::Value::Array(json_cancels));

    Ok((signature, serde_json::Value::Object(action_map)))
}

pub fn sign_cancel_by_cloid_action(
    private_key: &str,
    cancels: Vec<(u32, String)>,
    nonce: u64,
    vault_address: Option<&str>,
) -> Result<(Signature, serde_json::Value), LocalError> {
    let msgpack_action = CancelByCloidActionMsgPack {
        r#type: "cancelByCloid".to_string(),
        cancels: cancels
            .iter()
            .map(|(a, c)| CancelByCloidWireMsgPack { asset: *a, cloid: c.clone() })
            .collect(),
    };

    let mut buf = Vec::new();
    let mut serializer = Serializer::new(&mut buf).with_struct_map();
    msgpack_action
        .serialize(&mut serializer)
        .map_err(|e| LocalError::Serde(e.to_string()))?;

    let hash = action_hash_bytes(&buf, nonce, vault_address);
    let signature = sign_action_hash(private_key, hash)?;

    let json_cancels: Vec<serde_json::Value> = cancels
        .iter()
        .map(|(a, c)| {
            let mut m = serde_json::Map::new();
            m.insert("asset".to_string(), serde_json::Value::from(*a));
            m.insert("cloid".to_string(), serde_json::Value::from(c.clone()));
            serde_json::Value::Object(m)
        })
        .collect();
    let mut action_map = serde_json::Map::new();
    action_map.insert("type".to_string(), serde_json::Value::from("cancelByCloid"));
    action_map.insert("cancels".to_string(), serde_json::Value::Array(json_cancels));

    Ok((signature, serde_json::Value::Object(action_map)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "0x0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcd";

    #[test]
    fn order_action_signs_and_preserves_key_order() {
        let order = OrderRequest {
            asset: 0,
            is_buy: true,
            limit_px: "30000".to_string(),
            sz: "0.01".to_string(),
            reduce_only: false,
            order_type: OrderTypeWire::Limit(LimitOrderWire { tif: "Alo".to_string() }),
            cloid: None,
        };
        let (_sig, json) = sign_order_action(TEST_KEY, vec![order], "na", 1, None).unwrap();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["type", "orders", "grouping"]);
    }

    #[test]
    fn trigger_order_serializes_tpsl_fields() {
        let order = OrderRequest {
            asset: 1,
            is_buy: false,
            limit_px: "31000".to_string(),
            sz: "0.01".to_string(),
            reduce_only: true,
            order_type: OrderTypeWire::Trigger(TriggerOrderWire {
                is_market: true,
                trigger_px: "31000".to_string(),
                tpsl: "tp".to_string(),
            }),
            cloid: Some("0x1234".to_string()),
        };
        let (_sig, json) = sign_order_action(TEST_KEY, vec![order], "positionTpsl", 2, None).unwrap();
        let orders = json["orders"].as_array().unwrap();
        assert_eq!(orders[0]["t"]["trigger"]["tpsl"], "tp");
        assert_eq!(orders[0]["c"], "0x1234");
    }

    #[test]
    fn cancel_action_round_trips_fields() {
        let (_sig, json) = sign_cancel_action(TEST_KEY, vec![(0, 42)], 3, None).unwrap();
        assert_eq!(json["cancels"][0]["o"], 42);
    }
}
