// persistence.rs — per-subsystem state snapshots and append-only event
// streams.
//
// Two storage shapes: (1) whole-state JSON files for each subsystem
// (budget, idempotency, bandit, coin selector, feedback, improvement, risk),
// loaded on startup and overwritten on each persistence tick via a plain
// load/save pair; (2) append-only JSONL event streams under
// `streams_dir/<stream>/YYYY-MM-DD.jsonl`, rotated to gzip after a day and
// deleted once past their retention window.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn load_json<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> T {
    let path = path.as_ref();
    if !path.exists() {
        info!("persistence: no state file at {path:?}, starting fresh");
        return T::default();
    }
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                error!("persistence: failed to parse {path:?}: {e}");
                T::default()
            }
        },
        Err(e) => {
            error!("persistence: failed to read {path:?}: {e}");
            T::default()
        }
    }
}

pub fn save_json<T: Serialize>(path: impl AsRef<Path>, state: &T) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            error!("persistence: failed to create {parent:?}: {e}");
            return;
        }
    }
    match serde_json::to_string_pretty(state) {
        Ok(content) => {
            let tmp = path.with_extension("tmp");
            if let Err(e) = fs::write(&tmp, content) {
                error!("persistence: failed to write {tmp:?}: {e}");
                return;
            }
            if let Err(e) = fs::rename(&tmp, path) {
                error!("persistence: failed to rename {tmp:?} -> {path:?}: {e}");
            }
        }
        Err(e) => error!("persistence: failed to serialize state for {path:?}: {e}"),
    }
}

pub struct EventStreamWriter {
    dir: PathBuf,
}

impl EventStreamWriter {
    pub fn new(streams_dir: &str, stream_name: &str) -> Self {
        Self { dir: Path::new(streams_dir).join(stream_name) }
    }

    fn path_for_day(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", day.format("%Y-%m-%d")))
    }

    pub fn append(&self, now: DateTime<Utc>, event: &serde_json::Value) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for_day(now.date_naive());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(event)?)
    }
}

/// Reads a JSONL file tolerating a torn last line (process killed
/// mid-write): every line up to the last is required to parse; a trailing
/// line that fails to parse is silently dropped rather than failing the
/// whole read.
pub fn read_jsonl_tolerant(path: impl AsRef<Path>) -> Vec<serde_json::Value> {
    let Ok(file) = File::open(path) else { return Vec::new() };
    let lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
    let mut events = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(v) => events.push(v),
            Err(_) if i == lines.len().saturating_sub(1) => {}
            Err(e) => error!("persistence: malformed jsonl line {i}: {e}"),
        }
    }
    events
}

fn gzip_file(path: &Path) -> io::Result<()> {
    let raw = fs::read(path)?;
    let gz_path = path.with_extension("jsonl.gz");
    let gz_file = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(gz_file, Compression::default());
    encoder.write_all(&raw)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

/// Gzips every raw `.jsonl` stream file older than one day. Called once per
/// rollup tick across every stream subdirectory under `streams_dir`.
pub fn rotate_streams(streams_dir: &str, now: DateTime<Utc>) {
    let root = Path::new(streams_dir);
    let Ok(stream_dirs) = fs::read_dir(root) else { return };
    let cutoff = now.date_naive() - chrono::Duration::days(1);

    for entry in stream_dirs.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let Ok(files) = fs::read_dir(entry.path()) else { continue };
        for file in files.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            let Ok(day) = NaiveDate::parse_from_str(stem, "%Y-%m-%d") else { continue };
            if day <= cutoff {
                if let Err(e) = gzip_file(&path) {
                    error!("persistence: failed to rotate {path:?}: {e}");
                }
            }
        }
    }
}

/// Deletes raw files older than `raw_keep_days` and compressed files older
/// than `compressed_keep_days`.
pub fn enforce_retention(streams_dir: &str, raw_keep_days: u32, compressed_keep_days: u32, now: DateTime<Utc>) {
    let root = Path::new(streams_dir);
    let Ok(stream_dirs) = fs::read_dir(root) else { return };
    let raw_cutoff = now.date_naive() - chrono::Duration::days(raw_keep_days as i64);
    let compressed_cutoff = now.date_naive() - chrono::Duration::days(compressed_keep_days as i64);

    for entry in stream_dirs.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let Ok(files) = fs::read_dir(entry.path()) else { continue };
        for file in files.flatten() {
            let path = file.path();
            let (stem, is_gz) = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if name.ends_with(".jsonl.gz") => (name.trim_end_matches(".jsonl.gz").to_string(), true),
                Some(name) if name.ends_with(".jsonl") => (name.trim_end_matches(".jsonl").to_string(), false),
                _ => continue,
            };
            let Ok(day) = NaiveDate::parse_from_str(&stem, "%Y-%m-%d") else { continue };
            let cutoff = if is_gz { compressed_cutoff } else { raw_cutoff };
            if day <= cutoff {
                if let Err(e) = fs::remove_file(&path) {
                    error!("persistence: failed to delete expired {path:?}: {e}");
                } else {
                    info!("persistence: deleted expired stream file {path:?}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
    struct Dummy {
        n: u32,
    }

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("perp_engine_persistence_test_{label}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn save_then_load_json_round_trips() {
        let dir = scratch_dir("roundtrip");
        let path = dir.join("state.json");
        save_json(&path, &Dummy { n: 7 });
        let loaded: Dummy = load_json(&path);
        assert_eq!(loaded, Dummy { n: 7 });
    }

    #[test]
    fn load_json_missing_file_returns_default() {
        let dir = scratch_dir("missing");
        let path = dir.join("missing.json");
        let loaded: Dummy = load_json(&path);
        assert_eq!(loaded, Dummy::default());
    }

    #[test]
    fn read_jsonl_tolerant_drops_torn_last_line() {
        let dir = scratch_dir("torn");
        let path = dir.join("stream.jsonl");
        fs::write(&path, "{\"a\":1}\n{\"a\":2}\n{\"a\":3").unwrap();
        let events = read_jsonl_tolerant(&path);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn event_stream_writer_appends_to_daily_file() {
        let dir = scratch_dir("streams");
        let writer = EventStreamWriter::new(dir.to_str().unwrap(), "fills");
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        writer.append(now, &serde_json::json!({"coin": "BTC"})).unwrap();
        let path = dir.join("fills").join("2026-01-01.jsonl");
        assert!(path.exists());
    }
}
