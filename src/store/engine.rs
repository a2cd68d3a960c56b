//! Per-table storage engine: an in-memory sorted memtable in front of a
//! crc-framed WAL, periodically folded into a checkpoint table file.
//!
//! Startup loads the newest checkpoint, replays the WAL over it, and
//! deletes superseded checkpoint files. Deletes are tombstones in the
//! memtable and the WAL so they replicate and survive restarts; they are
//! dropped when the next checkpoint is written.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{EdgeError, EdgeResult};
use crate::store::wal::{read_frames, write_frames, Wal};

const CHECKPOINT_PREFIX: &str = "sst-";
const CHECKPOINT_SUFFIX: &str = ".sst";

/// Fold the WAL into a checkpoint after this many log entries
const DEFAULT_CHECKPOINT_EVERY: u64 = 1024;

/// A live record or tombstone plus its last-write-wins timestamp
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Option<Value>,
    pub updated_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    key: String,
    #[serde(default)]
    value: Option<Value>,
    updated_at: u64,
}

/// Single-table engine; callers serialize access through a table lock
pub struct TableEngine {
    dir: PathBuf,
    wal: Wal,
    memtable: BTreeMap<String, Entry>,
    indexes: HashMap<&'static str, HashMap<String, HashSet<String>>>,
    checkpoint_seq: u64,
    checkpoint_every: u64,
}

impl TableEngine {
    /// Open the engine at `dir`, recovering from checkpoint + WAL.
    ///
    /// `indexed_fields` are maintained as in-memory secondary indexes,
    /// rebuilt here and updated on every mutation.
    pub async fn open(dir: &Path, indexed_fields: &'static [&'static str]) -> EdgeResult<Self> {
        let wal = Wal::open(dir).await?;

        let mut memtable = BTreeMap::new();
        let mut checkpoint_seq = 0;

        let mut checkpoints = list_checkpoints(dir)?;
        checkpoints.sort();
        if let Some((seq, path)) = checkpoints.last() {
            checkpoint_seq = *seq;
            for frame in read_frames(path)? {
                let record: LogRecord = serde_json::from_slice(&frame)
                    .map_err(|e| EdgeError::storage(format!("corrupt checkpoint record: {e}")))?;
                memtable.insert(
                    record.key,
                    Entry {
                        value: record.value,
                        updated_at: record.updated_at,
                    },
                );
            }
            // Older checkpoints are fully superseded
            for (_, stale) in &checkpoints[..checkpoints.len() - 1] {
                let _ = std::fs::remove_file(stale);
            }
        }

        let wal_frames = wal.read_all()?;
        let replayed = wal_frames.len();
        for frame in wal_frames {
            let record: LogRecord = serde_json::from_slice(&frame)
                .map_err(|e| EdgeError::storage(format!("corrupt WAL record: {e}")))?;
            memtable.insert(
                record.key,
                Entry {
                    value: record.value,
                    updated_at: record.updated_at,
                },
            );
        }

        let mut engine = Self {
            dir: dir.to_path_buf(),
            wal,
            memtable,
            indexes: indexed_fields.iter().map(|f| (*f, HashMap::new())).collect(),
            checkpoint_seq,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
        };
        engine.rebuild_indexes();

        info!(
            dir = %dir.display(),
            records = engine.memtable.len(),
            replayed,
            "table engine opened"
        );
        Ok(engine)
    }

    /// Durable local write; the caller ships replication separately
    pub async fn put(&mut self, key: &str, value: Value, updated_at: u64) -> EdgeResult<()> {
        self.log_and_apply(key, Some(value), updated_at).await
    }

    /// Durable tombstone; idempotent
    pub async fn delete(&mut self, key: &str, updated_at: u64) -> EdgeResult<()> {
        self.log_and_apply(key, None, updated_at).await
    }

    /// Apply a write received from a peer under last-write-wins.
    ///
    /// Returns false when the local entry is at least as new (strictly
    /// newer incoming timestamps win).
    pub async fn apply_remote(
        &mut self,
        key: &str,
        value: Option<Value>,
        updated_at: u64,
    ) -> EdgeResult<bool> {
        if let Some(existing) = self.memtable.get(key) {
            if existing.updated_at >= updated_at {
                debug!(key, "remote write lost last-write-wins");
                return Ok(false);
            }
        }
        self.log_and_apply(key, value, updated_at).await?;
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.memtable.get(key).and_then(|e| e.value.as_ref())
    }

    pub fn updated_at(&self, key: &str) -> Option<u64> {
        self.memtable.get(key).map(|e| e.updated_at)
    }

    /// Snapshot of all live records
    pub fn list(&self) -> Vec<(String, Value)> {
        self.memtable
            .iter()
            .filter_map(|(k, e)| e.value.clone().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Keys whose `field` equals `value`, via the maintained index
    pub fn index_lookup(&self, field: &str, value: &str) -> Vec<String> {
        self.indexes
            .get(field)
            .and_then(|index| index.get(value))
            .map(|keys| {
                let mut keys: Vec<String> = keys.iter().cloned().collect();
                keys.sort();
                keys
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.memtable.values().filter(|e| e.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every live record and tombstone, for snapshotting to a joining
    /// peer
    pub fn dump(&self) -> Vec<(String, Option<Value>, u64)> {
        self.memtable
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone(), e.updated_at))
            .collect()
    }

    async fn log_and_apply(
        &mut self,
        key: &str,
        value: Option<Value>,
        updated_at: u64,
    ) -> EdgeResult<()> {
        let record = LogRecord {
            key: key.to_string(),
            value: value.clone(),
            updated_at,
        };
        let payload = serde_json::to_vec(&record)
            .map_err(|e| EdgeError::storage(format!("encode record: {e}")))?;
        self.wal.append(&payload).await?;

        self.unindex(key);
        self.memtable
            .insert(key.to_string(), Entry { value, updated_at });
        self.index(key);

        if self.wal.pending_entries() >= self.checkpoint_every {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Fold the memtable into a fresh checkpoint file and reset the WAL
    pub async fn checkpoint(&mut self) -> EdgeResult<()> {
        let seq = self.checkpoint_seq + 1;
        let path = self.dir.join(checkpoint_file_name(seq));

        let mut frames = Vec::with_capacity(self.memtable.len());
        for (key, entry) in &self.memtable {
            // Tombstones have done their job once they are folded in
            if entry.value.is_none() {
                continue;
            }
            let record = LogRecord {
                key: key.clone(),
                value: entry.value.clone(),
                updated_at: entry.updated_at,
            };
            frames.push(
                serde_json::to_vec(&record)
                    .map_err(|e| EdgeError::storage(format!("encode record: {e}")))?,
            );
        }
        write_frames(&path, frames).await?;

        let old = self.dir.join(checkpoint_file_name(self.checkpoint_seq));
        if self.checkpoint_seq > 0 {
            let _ = std::fs::remove_file(old);
        }
        self.checkpoint_seq = seq;
        self.memtable.retain(|_, e| e.value.is_some());
        self.wal.reset().await?;
        debug!(dir = %self.dir.display(), seq, "checkpoint written");
        Ok(())
    }

    fn rebuild_indexes(&mut self) {
        let keys: Vec<String> = self.memtable.keys().cloned().collect();
        for index in self.indexes.values_mut() {
            index.clear();
        }
        for key in keys {
            self.index(&key);
        }
    }

    fn index(&mut self, key: &str) {
        let Some(entry) = self.memtable.get(key) else {
            return;
        };
        let Some(value) = &entry.value else { return };
        for (field, index) in self.indexes.iter_mut() {
            if let Some(field_value) = index_value(value, field) {
                index.entry(field_value).or_default().insert(key.to_string());
            }
        }
    }

    fn unindex(&mut self, key: &str) {
        for index in self.indexes.values_mut() {
            for keys in index.values_mut() {
                keys.remove(key);
            }
        }
    }
}

fn index_value(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn checkpoint_file_name(seq: u64) -> String {
    format!("{CHECKPOINT_PREFIX}{seq:06}{CHECKPOINT_SUFFIX}")
}

fn list_checkpoints(dir: &Path) -> EdgeResult<Vec<(u64, PathBuf)>> {
    let mut checkpoints = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
        Err(e) => return Err(EdgeError::storage(format!("read {}: {e}", dir.display()))),
    };
    for entry in entries {
        let entry = entry.map_err(|e| EdgeError::storage(e.to_string()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(seq) = name
            .strip_prefix(CHECKPOINT_PREFIX)
            .and_then(|s| s.strip_suffix(CHECKPOINT_SUFFIX))
            .and_then(|s| s.parse::<u64>().ok())
        {
            checkpoints.push((seq, entry.path()));
        }
    }
    Ok(checkpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NO_INDEXES: &[&str] = &[];
    const POOL_INDEX: &[&str] = &["pool_name", "healthy"];

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = TableEngine::open(dir.path(), NO_INDEXES).await.unwrap();

        engine.put("a", json!({"x": 1}), 10).await.unwrap();
        assert_eq!(engine.get("a"), Some(&json!({"x": 1})));
        assert_eq!(engine.len(), 1);

        engine.delete("a", 11).await.unwrap();
        assert_eq!(engine.get("a"), None);
        assert!(engine.is_empty());

        // Idempotent delete
        engine.delete("a", 12).await.unwrap();
        assert_eq!(engine.get("a"), None);
    }

    #[tokio::test]
    async fn test_restart_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut engine = TableEngine::open(dir.path(), NO_INDEXES).await.unwrap();
            engine.put("a", json!({"x": 1}), 10).await.unwrap();
            engine.put("b", json!({"x": 2}), 11).await.unwrap();
            engine.delete("a", 12).await.unwrap();
        }
        let engine = TableEngine::open(dir.path(), NO_INDEXES).await.unwrap();
        assert_eq!(engine.get("a"), None);
        assert_eq!(engine.get("b"), Some(&json!({"x": 2})));
    }

    #[tokio::test]
    async fn test_restart_after_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut engine = TableEngine::open(dir.path(), NO_INDEXES).await.unwrap();
            engine.put("a", json!({"x": 1}), 10).await.unwrap();
            engine.delete("a", 11).await.unwrap();
            engine.put("b", json!({"x": 2}), 12).await.unwrap();
            engine.checkpoint().await.unwrap();
            // Post-checkpoint writes land in the fresh WAL
            engine.put("c", json!({"x": 3}), 13).await.unwrap();
        }
        let engine = TableEngine::open(dir.path(), NO_INDEXES).await.unwrap();
        assert_eq!(engine.get("a"), None);
        assert_eq!(engine.get("b"), Some(&json!({"x": 2})));
        assert_eq!(engine.get("c"), Some(&json!({"x": 3})));
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = TableEngine::open(dir.path(), NO_INDEXES).await.unwrap();

        engine.put("a", json!({"v": "local"}), 100).await.unwrap();

        // Older remote write loses
        let applied = engine
            .apply_remote("a", Some(json!({"v": "stale"})), 99)
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(engine.get("a"), Some(&json!({"v": "local"})));

        // Equal timestamp keeps the local copy
        let applied = engine
            .apply_remote("a", Some(json!({"v": "tied"})), 100)
            .await
            .unwrap();
        assert!(!applied);

        // Newer remote write wins, including remote deletes
        let applied = engine
            .apply_remote("a", Some(json!({"v": "fresh"})), 101)
            .await
            .unwrap();
        assert!(applied);
        assert_eq!(engine.get("a"), Some(&json!({"v": "fresh"})));

        let applied = engine.apply_remote("a", None, 102).await.unwrap();
        assert!(applied);
        assert_eq!(engine.get("a"), None);
    }

    #[tokio::test]
    async fn test_index_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = TableEngine::open(dir.path(), POOL_INDEX).await.unwrap();

        engine
            .put("web/b1", json!({"pool_name": "web", "healthy": true}), 1)
            .await
            .unwrap();
        engine
            .put("web/b2", json!({"pool_name": "web", "healthy": false}), 2)
            .await
            .unwrap();
        engine
            .put("api/b1", json!({"pool_name": "api", "healthy": true}), 3)
            .await
            .unwrap();

        assert_eq!(engine.index_lookup("pool_name", "web"), vec!["web/b1", "web/b2"]);
        assert_eq!(engine.index_lookup("healthy", "true"), vec!["api/b1", "web/b1"]);
        assert!(engine.index_lookup("pool_name", "missing").is_empty());

        engine.delete("web/b2", 4).await.unwrap();
        assert_eq!(engine.index_lookup("pool_name", "web"), vec!["web/b1"]);
    }

    #[tokio::test]
    async fn test_indexes_rebuilt_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut engine = TableEngine::open(dir.path(), POOL_INDEX).await.unwrap();
            engine
                .put("web/b1", json!({"pool_name": "web", "healthy": true}), 1)
                .await
                .unwrap();
        }
        let engine = TableEngine::open(dir.path(), POOL_INDEX).await.unwrap();
        assert_eq!(engine.index_lookup("pool_name", "web"), vec!["web/b1"]);
    }

    #[tokio::test]
    async fn test_dump_includes_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = TableEngine::open(dir.path(), NO_INDEXES).await.unwrap();
        engine.put("a", json!(1), 1).await.unwrap();
        engine.delete("a", 2).await.unwrap();
        engine.put("b", json!(2), 3).await.unwrap();

        let dump = engine.dump();
        assert_eq!(dump.len(), 2);
        assert!(dump.iter().any(|(k, v, t)| k == "a" && v.is_none() && *t == 2));
    }
}
