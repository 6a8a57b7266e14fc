//! # Dedup Store
//! Per-listener set of item ids already surfaced, with insertion order kept
//! so the oldest ids are the ones dropped on trim.
//!
//! Persisted as a JSON record `{ ids, last_updated, count }`. The file is
//! rewritten (never appended) after each mutation batch and reloaded at
//! listener start, keeping only the newest `max_size` ids.
//!
//! Every snapshot of a store takes a generation number. Writes of one store
//! go through its [`SaveGate`] one at a time, and a snapshot older than the
//! last one written is discarded, so the file only ever moves forward.

use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_MAX_SIZE: usize = 10_000;
pub const DEFAULT_TRIM_THRESHOLD: usize = 1_000;
pub const DEFAULT_TRIM_TARGET: usize = 800;

/// Size bounds of a dedup store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupSettings {
    /// Hard bound, also the tail length kept on load.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Working-set size that triggers a soft trim.
    #[serde(default = "default_trim_threshold")]
    pub trim_threshold: usize,
    /// Size after a soft trim.
    #[serde(default = "default_trim_target")]
    pub trim_target: usize,
}

fn default_max_size() -> usize {
    DEFAULT_MAX_SIZE
}
fn default_trim_threshold() -> usize {
    DEFAULT_TRIM_THRESHOLD
}
fn default_trim_target() -> usize {
    DEFAULT_TRIM_TARGET
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            trim_threshold: DEFAULT_TRIM_THRESHOLD,
            trim_target: DEFAULT_TRIM_TARGET,
        }
    }
}

/// On-disk shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub ids: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub count: usize,
}

/// Orders the writes of one record file.
#[derive(Debug, Default)]
pub struct SaveGate {
    issued: AtomicU64,
    last_written: Mutex<u64>,
}

impl SaveGate {
    fn ticket(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// A snapshot waiting to be written.
#[derive(Debug)]
pub struct PendingSave {
    path: PathBuf,
    record: DedupRecord,
    generation: u64,
    gate: Arc<SaveGate>,
}

impl PendingSave {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocking write. Returns `false` when a newer snapshot already landed.
    pub fn write(self) -> Result<bool> {
        let mut last = self.gate.last_written.lock().expect("dedup save gate poisoned");
        if self.generation <= *last {
            return Ok(false);
        }
        write_record_sync(&self.path, &self.record)?;
        *last = self.generation;
        Ok(true)
    }
}

#[derive(Debug)]
pub struct DedupStore {
    path: Option<PathBuf>,
    settings: DedupSettings,
    order: VecDeque<String>,
    seen: HashSet<String>,
    gate: Arc<SaveGate>,
}

impl DedupStore {
    /// Memory-only store (nothing is persisted).
    pub fn in_memory(settings: DedupSettings) -> Self {
        Self {
            path: None,
            settings,
            order: VecDeque::new(),
            seen: HashSet::new(),
            gate: Arc::default(),
        }
    }

    /// Load the record at `path`. A missing file yields an empty store;
    /// an unreadable one is an error.
    pub async fn load(path: impl Into<PathBuf>, settings: DedupSettings) -> Result<Self> {
        let path = path.into();
        let mut store = Self {
            path: Some(path.clone()),
            ..Self::in_memory(settings)
        };

        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(e.into()),
        };
        let record: DedupRecord = serde_json::from_str(&raw)?;

        let skip = record.ids.len().saturating_sub(settings.max_size);
        for id in record.ids.into_iter().skip(skip) {
            store.insert(id);
        }
        tracing::debug!(target: "dedup", path = %path.display(), size = store.len(), "dedup record loaded");
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Returns `false` when the id was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.settings.max_size {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Soft trim: once the working set exceeds the threshold keep only the
    /// newest `trim_target` ids. Returns how many were dropped.
    pub fn trim_if_oversized(&mut self) -> usize {
        if self.order.len() <= self.settings.trim_threshold {
            return 0;
        }
        let excess = self.order.len().saturating_sub(self.settings.trim_target);
        for old in self.order.drain(..excess) {
            self.seen.remove(&old);
        }
        excess
    }

    pub fn snapshot(&self) -> DedupRecord {
        DedupRecord {
            ids: self.order.iter().cloned().collect(),
            last_updated: Utc::now(),
            count: self.order.len(),
        }
    }

    /// Snapshot for a later write; `None` for a memory-only store.
    pub fn pending_save(&self) -> Option<PendingSave> {
        let path = self.path.clone()?;
        Some(PendingSave {
            path,
            record: self.snapshot(),
            generation: self.gate.ticket(),
            gate: self.gate.clone(),
        })
    }

    /// Blocking write of the current set, used on stop.
    pub fn flush(&self) -> Result<()> {
        match self.pending_save() {
            Some(save) => save.write().map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Unique per write so a background save and a flush never share a tmp file.
fn tmp_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("json.{n}.tmp"))
}

/// Atomic rewrite (tmp file + rename).
fn write_record_sync(path: &Path, record: &DedupRecord) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let tmp = tmp_path(path);
    let json = serde_json::to_vec_pretty(record)?;
    let mut f = std::fs::File::create(&tmp)?;
    f.write_all(&json)?;
    f.sync_all()?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

/// Save off the async workers. A crash before it lands can re-emit the
/// batch on restart (at-least-once).
pub fn persist_in_background(save: PendingSave) {
    tokio::task::spawn_blocking(move || {
        let path = save.path().to_path_buf();
        match save.write() {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(target: "dedup", path = %path.display(), "stale dedup snapshot skipped");
            }
            Err(e) => {
                tracing::warn!(target: "dedup", path = %path.display(), error = %e, "dedup save failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> DedupSettings {
        DedupSettings {
            max_size: 10,
            trim_threshold: 6,
            trim_target: 4,
        }
    }

    #[test]
    fn insert_reports_duplicates() {
        let mut s = DedupStore::in_memory(DedupSettings::default());
        assert!(s.insert("1001"));
        assert!(!s.insert("1001"));
        assert!(s.contains("1001"));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn soft_trim_keeps_newest() {
        let mut s = DedupStore::in_memory(small());
        for i in 0..6 {
            s.insert(i.to_string());
        }
        assert_eq!(s.trim_if_oversized(), 0, "at threshold, no trim");

        s.insert("6");
        assert_eq!(s.trim_if_oversized(), 3);
        assert_eq!(s.len(), 4);
        assert!(!s.contains("0"));
        assert!(!s.contains("2"));
        assert!(s.contains("3"));
        assert!(s.contains("6"));
    }

    #[test]
    fn hard_bound_evicts_oldest() {
        let mut s = DedupStore::in_memory(DedupSettings {
            max_size: 3,
            trim_threshold: 100,
            trim_target: 50,
        });
        for id in ["a", "b", "c", "d"] {
            s.insert(id);
        }
        assert_eq!(s.len(), 3);
        assert!(!s.contains("a"));
        assert!(s.contains("d"));
    }

    #[tokio::test]
    async fn load_truncates_to_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed_g1.json");
        let record = DedupRecord {
            ids: (0..15).map(|i| i.to_string()).collect(),
            last_updated: Utc::now(),
            count: 15,
        };
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        let s = DedupStore::load(&path, small()).await.unwrap();
        assert_eq!(s.len(), 10);
        assert!(!s.contains("4"));
        assert!(s.contains("5"));
        assert!(s.contains("14"));
    }

    #[tokio::test]
    async fn missing_file_is_empty_and_flush_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("processed_g2.json");

        let mut s = DedupStore::load(&path, DedupSettings::default()).await.unwrap();
        assert!(s.is_empty());
        s.insert("x1");
        s.insert("x2");
        s.flush().unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let rec: DedupRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(rec.ids, vec!["x1".to_string(), "x2".to_string()]);
        assert_eq!(rec.count, 2);
    }

    #[tokio::test]
    async fn older_snapshot_never_overwrites_newer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed_g3.json");
        let mut s = DedupStore::load(&path, DedupSettings::default()).await.unwrap();

        s.insert("a");
        let older = s.pending_save().unwrap();
        s.insert("b");
        let newer = s.pending_save().unwrap();

        assert!(newer.write().unwrap());
        assert!(!older.write().unwrap());

        let raw = std::fs::read_to_string(&path).unwrap();
        let rec: DedupRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(rec.ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn background_save_after_flush_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed_g4.json");
        let mut s = DedupStore::load(&path, DedupSettings::default()).await.unwrap();

        s.insert("a");
        let late = s.pending_save().unwrap();
        s.insert("b");
        s.flush().unwrap();

        persist_in_background(late);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let reloaded = DedupStore::load(&path, DedupSettings::default()).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("b"));
    }

    #[test]
    fn memory_store_has_nothing_to_save() {
        let mut s = DedupStore::in_memory(DedupSettings::default());
        s.insert("a");
        assert!(s.pending_save().is_none());
        s.flush().unwrap();
    }
}
