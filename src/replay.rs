// replay.rs — offline replay harness for the `replay` subcommand.
//
// Feeds a recorded JSONL stream of market events (same `{channel, data}`
// wire shape `ws.rs` parses off the live socket) through the market-data
// buffer and strategy layer, without touching the venue or the bandit/
// coin-selector state files. Cycle spacing and coin selection follow the
// harness's own literal, intentionally-limited rule rather than the live
// engine's UCB selection: cycles advance by
// `max(1000, strategy_interval_ms / max(1, speed))` and the coin for each
// cycle is `results.len() % coins.len()`, ignoring any blocked candidates.
// This skews measured PnL against the live selector but is preserved as-is.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::market_data::{Candle, MarketDataBuffer, Regime};
use crate::persistence;
use crate::strategy::{self, Side};
use crate::ws;

#[derive(Debug, Clone, Serialize)]
struct ReplayResult {
    cycle_ts_ms: u64,
    coin: String,
    regime: String,
    signal: Option<ReplaySignal>,
}

#[derive(Debug, Clone, Serialize)]
struct ReplaySignal {
    side: String,
    entry_price: f64,
    tp_price: f64,
    sl_price: f64,
}

fn apply_event(md: &mut MarketDataBuffer, event: &Value) {
    let channel = event["channel"].as_str().unwrap_or("");
    let Some(data) = event.get("data") else { return };

    match channel {
        "l2Book" => {
            let coin = data["coin"].as_str().unwrap_or("").to_string();
            if coin.is_empty() {
                return;
            }
            let bids = ws::parse_levels(&data["levels"], 0);
            let asks = ws::parse_levels(&data["levels"], 1);
            md.update_l2(crate::market_data::L2BookSnapshot {
                coin,
                bids,
                asks,
                received_at_ms: crate::market_data::now_ms(),
            });
        }
        "trades" => {
            if let Some(arr) = data.as_array() {
                for t in arr {
                    if let Some(trade) = ws::parse_trade(t) {
                        md.add_trade(trade);
                    }
                }
            }
        }
        c if c.starts_with("candle") => {
            if let Some(coin) = data["s"].as_str() {
                if let Some(candle) = ws::parse_candle(data) {
                    md.add_candle(coin, candle);
                }
            }
        }
        _ => {}
    }
}

/// Runs the replay harness against `file` and writes one JSON line per
/// cycle to stdout. Returns the process exit code.
pub fn run(cfg: &EngineConfig, file: &Path, speed: f64) -> i32 {
    let events = persistence::read_jsonl_tolerant(file);
    if events.is_empty() {
        log::error!("replay: no events read from {}", file.display());
        return 1;
    }

    let coins = cfg.symbol_whitelist.clone();
    if coins.is_empty() {
        log::error!("replay: symbol_whitelist is empty, nothing to replay against");
        return 1;
    }

    let mut md = MarketDataBuffer::new(cfg.market_ring_capacity);
    let step_ms = ((cfg.strategy_interval_ms as f64) / speed.max(1.0)).max(1000.0) as u64;

    let first_ts = events[0]["data"]["time"].as_u64().or_else(|| events[0]["data"]["t"].as_u64()).unwrap_or(0);
    let mut cycle_ts: u64 = first_ts;
    let mut results: Vec<ReplayResult> = Vec::new();
    let mut event_idx = 0usize;

    loop {
        while event_idx < events.len() {
            let event_ts = events[event_idx]["data"]["time"].as_u64()
                .or_else(|| events[event_idx]["data"]["t"].as_u64())
                .unwrap_or(cycle_ts);
            if event_ts > cycle_ts {
                break;
            }
            apply_event(&mut md, &events[event_idx]);
            event_idx += 1;
        }

        let coin = &coins[results.len() % coins.len()];
        let candles: Vec<Candle> = md.candles.get(coin).map(|c| c.iter().cloned().collect()).unwrap_or_default();
        let regime = strategy::classify_regime(coin, &md, &candles, cfg);

        let signal = match regime {
            Regime::Trending => strategy::build_trend_signal(coin, &md, &candles, cfg, "trend"),
            Regime::Ranging => strategy::build_range_signal(coin, &md, &candles, cfg, "range"),
            _ => None,
        };

        results.push(ReplayResult {
            cycle_ts_ms: cycle_ts,
            coin: coin.clone(),
            regime: regime.label().to_string(),
            signal: signal.map(|s| ReplaySignal {
                side: match s.side {
                    Side::Long => "long".to_string(),
                    Side::Short => "short".to_string(),
                },
                entry_price: s.entry_price,
                tp_price: s.protection.tp_price,
                sl_price: s.protection.sl_price,
            }),
        });

        cycle_ts += step_ms;
        if event_idx >= events.len() {
            break;
        }
    }

    for result in &results {
        match serde_json::to_string(result) {
            Ok(line) => println!("{line}"),
            Err(e) => log::error!("replay: failed to serialize result: {e}"),
        }
    }
    log::info!("replay: {} cycles over {} events", results.len(), events.len());
    0
}
