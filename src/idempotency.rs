// idempotency.rs — C2 Idempotency Ledger.
//
// Prevents the same logical order from being resubmitted twice: once inside
// a short duplicate-suppression window (network retries, crash-and-restart
// racing a resting order), and for a longer TTL so a replayed intent from a
// stale cycle doesn't get re-submitted once its context is gone.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub submitted: bool,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdempotencyLedger {
    entries: HashMap<String, LedgerEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenStatus {
    New,
    DuplicateWithinWindow,
    SeenOutsideWindow,
}

impl IdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// `canonical_json` must already be canonicalised (recursively
    /// key-sorted, no inserted whitespace) — see `canonicalize`.
    pub fn make_key(canonical_json: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(canonical_json.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn seen(&mut self, key: &str, now: DateTime<Utc>, suppress_window: Duration) -> SeenStatus {
        match self.entries.get_mut(key) {
            None => {
                self.entries.insert(
                    key.to_string(),
                    LedgerEntry { key: key.to_string(), first_seen: now, last_seen: now, submitted: false, result: None },
                );
                SeenStatus::New
            }
            Some(entry) => {
                let elapsed = (now - entry.last_seen).to_std().unwrap_or(Duration::MAX);
                entry.last_seen = now;
                if elapsed <= suppress_window {
                    SeenStatus::DuplicateWithinWindow
                } else {
                    SeenStatus::SeenOutsideWindow
                }
            }
        }
    }

    pub fn mark_submitted(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.submitted = true;
        }
    }

    pub fn mark_result(&mut self, key: &str, result: impl Into<String>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.result = Some(result.into());
        }
    }

    pub fn is_submitted(&self, key: &str) -> bool {
        self.entries.get(key).map(|e| e.submitted).unwrap_or(false)
    }

    pub fn gc(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            (now - e.last_seen).to_std().map(|age| age <= max_age).unwrap_or(true)
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recursively sorts object keys and re-serializes with no inserted
/// whitespace, matching the Open Question decision recorded in DESIGN.md.
pub fn canonicalize(value: &serde_json::Value) -> String {
    serde_json::to_string(&sort_value(value)).unwrap_or_default()
}

fn sort_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), sort_value(&map[k]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_sorts_nested_keys() {
        let v = serde_json::json!({"b": 1, "a": {"z": 1, "y": 2}});
        assert_eq!(canonicalize(&v), r#"{"a":{"y":2,"z":1},"b":1}"#);
    }

    #[test]
    fn duplicate_within_window_is_flagged() {
        let mut ledger = IdempotencyLedger::new();
        let key = IdempotencyLedger::make_key(&canonicalize(&serde_json::json!({"coin":"BTC","px":30000})));
        let t0 = Utc::now();
        assert_eq!(ledger.seen(&key, t0, Duration::from_secs(10)), SeenStatus::New);
        let t1 = t0 + chrono::Duration::seconds(5);
        assert_eq!(ledger.seen(&key, t1, Duration::from_secs(10)), SeenStatus::DuplicateWithinWindow);
        let t2 = t0 + chrono::Duration::seconds(20);
        assert_eq!(ledger.seen(&key, t2, Duration::from_secs(10)), SeenStatus::SeenOutsideWindow);
    }

    #[test]
    fn gc_evicts_aged_entries() {
        let mut ledger = IdempotencyLedger::new();
        let key = "k1".to_string();
        let t0 = Utc::now();
        ledger.seen(&key, t0, Duration::from_secs(10));
        let later = t0 + chrono::Duration::hours(7);
        let evicted = ledger.gc(later, Duration::from_secs(6 * 3600));
        assert_eq!(evicted, 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn same_payload_regardless_of_key_order_hashes_equal() {
        let a = canonicalize(&serde_json::json!({"coin":"BTC","side":"buy"}));
        let b = canonicalize(&serde_json::json!({"side":"buy","coin":"BTC"}));
        assert_eq!(IdempotencyLedger::make_key(&a), IdempotencyLedger::make_key(&b));
    }
}
