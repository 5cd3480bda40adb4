use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::stream::StreamId;

/// Persistence for per-stream counts
pub trait CountStore: Send + Sync {
    /// Overwrite the stream's latest reading
    fn record_latest_count(&self, id: StreamId, count: usize) -> Result<()>;

    /// Append one history record
    fn append_history(
        &self,
        id: StreamId,
        name: &str,
        count: usize,
        artifact: Option<&Path>,
    ) -> Result<()>;
}

/// Latest reading of a stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatestCount {
    pub count: usize,
    pub updated_at: DateTime<Local>,
}

/// One row of count history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub stream_id: StreamId,
    pub camera_name: String,
    pub count: usize,
    pub image_path: Option<PathBuf>,
    pub recorded_at: DateTime<Local>,
}

/// File-backed store.
///
/// Latest counts live in `latest.json`, rewritten through a temp file and an atomic
/// rename. History is appended to `history.jsonl`, one JSON record per line.
pub struct JsonFileStore {
    pub latest_path: PathBuf,
    pub history_path: PathBuf,
    // Serializes read-modify-write of latest.json and appends across workers
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            latest_path: data_dir.join("latest.json"),
            history_path: data_dir.join("history.jsonl"),
            write_lock: Mutex::new(()),
        }
    }

    /// Create the data directory
    pub fn init(&self) -> Result<()> {
        if let Some(dir) = self.latest_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create data directory {dir:?}"))?;
        }
        Ok(())
    }

    pub fn latest(&self) -> Result<BTreeMap<StreamId, LatestCount>> {
        if !self.latest_path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.latest_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn history(&self) -> Result<Vec<HistoryRecord>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.history_path)?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}

impl CountStore for JsonFileStore {
    fn record_latest_count(&self, id: StreamId, count: usize) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut latest: BTreeMap<StreamId, LatestCount> = if self.latest_path.exists() {
            let content = fs::read_to_string(&self.latest_path)?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(
                    "Discarding corrupt {:?}, starting a fresh one: {}",
                    self.latest_path, e
                );
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };
        latest.insert(
            id,
            LatestCount {
                count,
                updated_at: Local::now(),
            },
        );

        let tmp_path = self.latest_path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(&latest)?)?;
        fs::rename(&tmp_path, &self.latest_path)?;
        debug!("Recorded latest count {} for stream {}", count, id);
        Ok(())
    }

    fn append_history(
        &self,
        id: StreamId,
        name: &str,
        count: usize,
        artifact: Option<&Path>,
    ) -> Result<()> {
        let record = HistoryRecord {
            stream_id: id,
            camera_name: name.to_string(),
            count,
            image_path: artifact.map(Path::to_path_buf),
            recorded_at: Local::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// In-process store, useful for dry runs and tests
#[derive(Default)]
pub struct MemoryStore {
    latest: Mutex<BTreeMap<StreamId, usize>>,
    history: Mutex<Vec<HistoryRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_count(&self, id: StreamId) -> Option<usize> {
        self.latest.lock().get(&id).copied()
    }

    pub fn history_for(&self, id: StreamId) -> Vec<HistoryRecord> {
        self.history
            .lock()
            .iter()
            .filter(|r| r.stream_id == id)
            .cloned()
            .collect()
    }
}

impl CountStore for MemoryStore {
    fn record_latest_count(&self, id: StreamId, count: usize) -> Result<()> {
        self.latest.lock().insert(id, count);
        Ok(())
    }

    fn append_history(
        &self,
        id: StreamId,
        name: &str,
        count: usize,
        artifact: Option<&Path>,
    ) -> Result<()> {
        self.history.lock().push(HistoryRecord {
            stream_id: id,
            camera_name: name.to_string(),
            count,
            image_path: artifact.map(Path::to_path_buf),
            recorded_at: Local::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_latest_count_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());
        store.init().unwrap();

        store.record_latest_count(1, 4).unwrap();
        store.record_latest_count(2, 1).unwrap();
        store.record_latest_count(1, 7).unwrap();

        let latest = store.latest().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&1].count, 7);
        assert_eq!(latest[&2].count, 1);
        assert!(!store.latest_path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_latest_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());
        store.init().unwrap();
        fs::write(&store.latest_path, "{\"1\": {\"count\": ").unwrap();
        assert!(store.latest().is_err());

        store.record_latest_count(2, 5).unwrap();
        store.record_latest_count(3, 1).unwrap();

        let latest = store.latest().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[&2].count, 5);
    }

    #[test]
    fn test_history_appends() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(&temp_dir.path().join("data"));
        store.init().unwrap();

        store
            .append_history(1, "lobby", 3, Some(Path::new("output/lobby/a.jpg")))
            .unwrap();
        store.append_history(1, "lobby", 0, None).unwrap();

        let history = store.history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].camera_name, "lobby");
        assert_eq!(history[0].image_path, Some(PathBuf::from("output/lobby/a.jpg")));
        assert_eq!(history[1].count, 0);
    }

    #[test]
    fn test_empty_store_reads() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());
        assert!(store.latest().unwrap().is_empty());
        assert!(store.history().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.record_latest_count(5, 2).unwrap();
        store.record_latest_count(5, 3).unwrap();
        store.append_history(5, "gate", 3, None).unwrap();

        assert_eq!(store.latest_count(5), Some(3));
        assert_eq!(store.latest_count(6), None);
        assert_eq!(store.history_for(5).len(), 1);
    }
}
