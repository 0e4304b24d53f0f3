// Budget exhaustion forces a cycle error that is fatal, but the resulting
// shutdown is clean: as long as cancel-all and flatten-all both succeed, the
// runtime kill-switch file is never written. That's what distinguishes a
// budget-triggered shutdown from a cleanup-failure shutdown.

mod common;

use std::sync::Arc;

use perp_control_plane::engine::Engine;
use perp_control_plane::errors::EngineError;
use perp_control_plane::market_data::MarketDataBuffer;
use perp_control_plane::ws;
use tokio::sync::Mutex;

use common::{test_config, MockExchange};

#[tokio::test]
async fn budget_exceeded_is_fatal_and_shuts_down_without_kill_switch() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.budget_hourly_max_http_calls = 0;
    cfg.budget_daily_max_http_calls = 0;

    let exchange = Box::new(MockExchange::new(vec!["BTC", "ETH"]));
    let md = Arc::new(Mutex::new(MarketDataBuffer::new(cfg.market_ring_capacity)));
    let stall_flag = ws::new_stall_flag();

    let mut engine = Engine::new(cfg.clone(), exchange, md, stall_flag).await.expect("engine init");

    let result = engine.run_strategy_cycle().await;
    let err = result.expect_err("refresh_risk_snapshot's fetch_equity HTTP call should trip the zeroed hourly budget");
    assert!(matches!(err, EngineError::Budget(_)));
    assert!(err.is_fatal());

    engine.request_shutdown().await;

    assert!(!std::path::Path::new(&cfg.kill_switch_path).exists(), "clean shutdown must not leave a kill-switch file behind");
}
