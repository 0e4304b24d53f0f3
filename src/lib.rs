// lib.rs — re-exports every module so integration tests under `tests/` can
// reach internal types (mock exchange clients, engine construction) the same
// way the binary does.

pub mod ask_question;
pub mod bandit;
pub mod budget;
pub mod coin_selector;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod execution;
pub mod feedback;
pub mod idempotency;
pub mod improvement;
pub mod market_data;
pub mod persistence;
pub mod protection;
pub mod replay;
pub mod report;
pub mod risk;
pub mod signing;
pub mod strategy;
pub mod ws;
