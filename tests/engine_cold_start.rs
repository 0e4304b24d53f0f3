// Cold-start cycle: empty persisted state, a two-coin universe from the
// venue, no positions or orders. The first strategy cycle should find no
// signal (empty market-data buffer means every regime check bails out to
// `NoData`/`NoTrade`) and emit a `cycle_no_signal` metric instead of erroring.

mod common;

use std::sync::Arc;

use chrono::Utc;
use perp_control_plane::engine::Engine;
use perp_control_plane::market_data::MarketDataBuffer;
use perp_control_plane::persistence;
use perp_control_plane::ws;
use tokio::sync::Mutex;

use common::{test_config, MockExchange};

#[tokio::test]
async fn cold_start_selects_universe_and_emits_no_signal() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path());

    let exchange = Box::new(MockExchange::new(vec!["BTC", "ETH"]));
    let md = Arc::new(Mutex::new(MarketDataBuffer::new(cfg.market_ring_capacity)));
    let stall_flag = ws::new_stall_flag();

    let mut engine = Engine::new(cfg.clone(), exchange, md, stall_flag).await.expect("engine init");
    assert_eq!(engine.universe, vec!["BTC".to_string(), "ETH".to_string()]);

    engine.run_strategy_cycle().await.expect("first cycle should not error");

    let writer_path = std::path::Path::new(&cfg.streams_dir).join("metrics").join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")));
    let events = persistence::read_jsonl_tolerant(&writer_path);
    assert!(
        events.iter().any(|e| e["event"] == "cycle_no_signal"),
        "expected a cycle_no_signal metric event, got: {events:?}"
    );
}
