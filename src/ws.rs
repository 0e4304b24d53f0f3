// ws.rs — WebSocket transport.
//
// Connects to the venue's public WS endpoint, subscribes to all six channels
// (allMids, l2Book, trades, candle{interval}, userFills, orderUpdates), and
// drives a reconnect loop with exponential backoff. Market-data channels
// write straight into the shared `MarketDataBuffer`; private channels
// (fills, order updates) are forwarded to the engine over an mpsc channel
// since they need idempotent, budget-aware processing the transport layer
// shouldn't own.
//
// Subscribe-in-chunks, a stall watcher task, ping/pong touch, and the
// exponential backoff reconnect loop follow the same shape used for the
// public/private channel split throughout this module.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::market_data::{Candle, L2BookSnapshot, L2Level, MarketDataBuffer, Trade};

pub type StallFlag = Arc<AtomicBool>;

pub fn new_stall_flag() -> StallFlag {
    Arc::new(AtomicBool::new(false))
}

#[derive(Debug, Clone)]
pub enum PrivateEvent {
    Fill(serde_json::Value),
    OrderUpdate(serde_json::Value),
}

fn subscribe_msg(sub_type: &str, coin: Option<&str>, user: Option<&str>, interval: Option<&str>) -> serde_json::Value {
    let mut subscription = serde_json::json!({ "type": sub_type });
    if let Some(c) = coin {
        subscription["coin"] = serde_json::Value::String(c.to_string());
    }
    if let Some(u) = user {
        subscription["user"] = serde_json::Value::String(u.to_string());
    }
    if let Some(i) = interval {
        subscription["interval"] = serde_json::Value::String(i.to_string());
    }
    serde_json::json!({ "method": "subscribe", "subscription": subscription })
}

async fn subscribe_all(
    write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    coins: &[String],
    candle_interval: &str,
    user_address: Option<&str>,
) {
    let all_mids = subscribe_msg("allMids", None, None, None);
    if let Err(e) = write.send(Message::Text(all_mids.to_string())).await {
        log::error!("ws: failed to subscribe allMids: {e}");
    }

    for chunk in coins.chunks(20) {
        for coin in chunk {
            for sub in [
                subscribe_msg("l2Book", Some(coin), None, None),
                subscribe_msg("trades", Some(coin), None, None),
                subscribe_msg("candle", Some(coin), None, Some(candle_interval)),
            ] {
                if let Err(e) = write.send(Message::Text(sub.to_string())).await {
                    log::error!("ws: failed to subscribe {coin}: {e}");
                }
            }
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(150)).await;
    }

    if let Some(addr) = user_address {
        for sub in [subscribe_msg("userFills", None, Some(addr), None), subscribe_msg("orderUpdates", None, Some(addr), None)] {
            if let Err(e) = write.send(Message::Text(sub.to_string())).await {
                log::error!("ws: failed to subscribe private channel for {addr}: {e}");
            }
        }
    }
}

pub(crate) fn parse_levels(levels_arr: &serde_json::Value, idx: usize) -> Vec<L2Level> {
    levels_arr
        .as_array()
        .and_then(|a| a.get(idx))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| {
                    let px: f64 = v["px"].as_str()?.parse().ok()?;
                    let sz: f64 = v["sz"].as_str()?.parse().ok()?;
                    Some(L2Level { px, sz })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_candle(data: &serde_json::Value) -> Option<Candle> {
    Some(Candle {
        open: data["o"].as_str()?.parse().ok()?,
        high: data["h"].as_str()?.parse().ok()?,
        low: data["l"].as_str()?.parse().ok()?,
        close: data["c"].as_str()?.parse().ok()?,
        volume: data["v"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
        start_ms: data["t"].as_u64().unwrap_or(0),
    })
}

pub(crate) fn parse_trade(data: &serde_json::Value) -> Option<Trade> {
    Some(Trade {
        coin: data["coin"].as_str()?.to_string(),
        is_buyer_aggressor: data["side"].as_str().map(|s| s == "B").unwrap_or(false),
        px: data["px"].as_str()?.parse().ok()?,
        sz: data["sz"].as_str()?.parse().ok()?,
        time_ms: data["time"].as_u64().unwrap_or(crate::market_data::now_ms()),
    })
}

async fn handle_text(text: &str, buffer: &Arc<Mutex<MarketDataBuffer>>, private_tx: &mpsc::UnboundedSender<PrivateEvent>) {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) else { return };
    let channel = parsed["channel"].as_str().unwrap_or("");
    let Some(data) = parsed.get("data") else {
        if matches!(channel, "ping" | "pong") {
            buffer.lock().await.touch();
        }
        return;
    };

    match channel {
        "allMids" => {
            // allMids carries a coin->px map; folded into per-coin context by
            // the caller via `mid()` lookups elsewhere, nothing to store here.
        }
        "l2Book" => {
            let coin = data["coin"].as_str().unwrap_or("").to_string();
            if coin.is_empty() {
                return;
            }
            let bids = parse_levels(&data["levels"], 0);
            let asks = parse_levels(&data["levels"], 1);
            let snap = L2BookSnapshot { coin, bids, asks, received_at_ms: crate::market_data::now_ms() };
            buffer.lock().await.update_l2(snap);
        }
        "trades" => {
            if let Some(arr) = data.as_array() {
                let mut buf = buffer.lock().await;
                for t in arr {
                    if let Some(trade) = parse_trade(t) {
                        buf.add_trade(trade);
                    }
                }
            }
        }
        c if c.starts_with("candle") => {
            if let Some(coin) = data["s"].as_str() {
                if let Some(candle) = parse_candle(data) {
                    buffer.lock().await.add_candle(coin, candle);
                }
            }
        }
        "userFills" => {
            let is_snapshot = data["isSnapshot"].as_bool().unwrap_or(false);
            if !is_snapshot {
                let _ = private_tx.send(PrivateEvent::Fill(data.clone()));
            }
        }
        "orderUpdates" => {
            let _ = private_tx.send(PrivateEvent::OrderUpdate(data.clone()));
        }
        _ => {}
    }
}

/// Connects, subscribes to all six channels, and runs the message loop until
/// the connection drops, then retries with exponential backoff capped at 32s.
/// Never returns under normal operation; the caller runs this in its own task.
pub async fn connect_and_listen(
    ws_url: String,
    coins: Vec<String>,
    candle_interval: String,
    user_address: Option<String>,
    buffer: Arc<Mutex<MarketDataBuffer>>,
    stall_flag: StallFlag,
    private_tx: mpsc::UnboundedSender<PrivateEvent>,
) {
    let stall_watcher_buf = buffer.clone();
    let stall_watcher_flag = stall_flag.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            let stalled = stall_watcher_buf.lock().await.is_stalled();
            if stalled && !stall_watcher_flag.load(Ordering::SeqCst) {
                log::error!("ws: no message for longer than the stall timeout");
                stall_watcher_flag.store(true, Ordering::SeqCst);
            } else if !stalled && stall_watcher_flag.load(Ordering::SeqCst) {
                log::info!("ws: stream recovered, awaiting reconciliation");
            }
        }
    });

    let mut retry_delay_secs: u64 = 1;
    let max_delay_secs: u64 = 32;

    loop {
        log::info!("ws: connecting to {ws_url}");
        match connect_async(Url::parse(&ws_url).expect("valid ws url")).await {
            Ok((stream, _)) => {
                log::info!("ws: connected");
                retry_delay_secs = 1;
                stall_flag.store(false, Ordering::SeqCst);

                let (mut write, mut read) = stream.split();
                subscribe_all(&mut write, &coins, &candle_interval, user_address.as_deref()).await;

                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => handle_text(&text, &buffer, &private_tx).await,
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                            buffer.lock().await.touch();
                        }
                        Ok(Message::Close(_)) => {
                            log::warn!("ws: connection closed by server, reconnecting");
                            break;
                        }
                        Err(e) => {
                            log::error!("ws: read error: {e}, reconnecting");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                log::error!("ws: connect failed: {e}, retrying in {retry_delay_secs}s");
            }
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(retry_delay_secs)).await;
        retry_delay_secs = std::cmp::min(retry_delay_secs * 2, max_delay_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_msg_includes_requested_fields() {
        let msg = subscribe_msg("candle", Some("BTC"), None, Some("1m"));
        assert_eq!(msg["subscription"]["type"], "candle");
        assert_eq!(msg["subscription"]["coin"], "BTC");
        assert_eq!(msg["subscription"]["interval"], "1m");
    }

    #[test]
    fn parse_candle_reads_ohlcv_fields() {
        let data = serde_json::json!({"o": "100.0", "h": "101.0", "l": "99.0", "c": "100.5", "v": "10.0", "t": 123u64});
        let candle = parse_candle(&data).unwrap();
        assert_eq!(candle.close, 100.5);
        assert_eq!(candle.start_ms, 123);
    }

    #[test]
    fn parse_trade_reads_side_as_aggressor_flag() {
        let data = serde_json::json!({"coin": "BTC", "side": "B", "px": "100.0", "sz": "1.0", "time": 1u64});
        let trade = parse_trade(&data).unwrap();
        assert!(trade.is_buyer_aggressor);
    }
}
