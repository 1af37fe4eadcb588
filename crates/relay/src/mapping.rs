//! Bounded, persisted source-message → target-location table.
//!
//! Reply threading needs to find where a source message was relayed to,
//! possibly days later, so the table is persisted as JSON in the account's
//! data directory. Memory is bounded: inserts above capacity evict the
//! least-recently-updated entry, and oversized files are trimmed at load.
//!
//! The store is lazily loaded on first use and persisted atomically
//! (write-to-temp then rename, `.bak` kept) on flush. Flushing is gated
//! on a dirty flag so the periodic persistence task is a no-op between
//! changes.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::error::Result;

/// Where a source message ended up at the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetLocation {
    pub channel_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MappingEntry {
    source_id: String,
    target: TargetLocation,
    updated_at: i64,
}

/// Bounded LRU-by-update mapping table with lazy file persistence.
pub struct MappingStore {
    path: PathBuf,
    capacity: usize,
    loaded: bool,
    dirty: bool,
    /// source id → (recency seq, entry)
    entries: HashMap<String, (u64, MappingEntry)>,
    /// recency seq → source id, oldest first
    recency: BTreeMap<u64, String>,
    next_seq: u64,
}

impl MappingStore {
    #[must_use]
    pub fn new(path: PathBuf, capacity: usize) -> Self {
        Self {
            path,
            capacity: capacity.max(1),
            loaded: false,
            dirty: false,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Look up the relayed location of a source message.
    pub fn get(&mut self, source_id: &str) -> Option<TargetLocation> {
        self.ensure_loaded();
        self.entries.get(source_id).map(|(_, e)| e.target.clone())
    }

    /// Store or refresh a mapping. A refresh of an existing key moves it
    /// to most-recent before the size check, so it can never evict itself.
    pub fn record(&mut self, source_id: &str, target: TargetLocation) {
        self.ensure_loaded();

        // Delete + reinsert so the entry lands at the most-recent slot.
        if let Some((seq, _)) = self.entries.remove(source_id) {
            self.recency.remove(&seq);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = MappingEntry {
            source_id: source_id.to_string(),
            target,
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.entries.insert(source_id.to_string(), (seq, entry));
        self.recency.insert(seq, source_id.to_string());

        while self.entries.len() > self.capacity {
            if let Some((&oldest_seq, _)) = self.recency.iter().next() {
                if let Some(id) = self.recency.remove(&oldest_seq) {
                    self.entries.remove(&id);
                }
            } else {
                break;
            }
        }

        self.dirty = true;
    }

    /// Persist if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.loaded || !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Written oldest-first so load rebuilds the same recency order.
        let ordered: Vec<&MappingEntry> = self
            .recency
            .values()
            .filter_map(|id| self.entries.get(id).map(|(_, e)| e))
            .collect();
        let json = serde_json::to_string(&ordered)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())?;
        if self.path.exists() {
            let bak = self.path.with_extension("json.bak");
            let _ = std::fs::rename(&self.path, &bak);
        }
        std::fs::rename(&tmp, &self.path)?;

        self.dirty = false;
        debug!(path = %self.path.display(), entries = ordered.len(), "flushed mapping store");
        Ok(())
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&mut self) -> usize {
        self.ensure_loaded();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;

        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read mapping store");
                return;
            },
        };
        let mut stored: Vec<MappingEntry> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "malformed mapping store, starting empty");
                return;
            },
        };

        // Oldest-updated entries are dropped when the file exceeds capacity.
        stored.sort_by_key(|e| e.updated_at);
        let excess = stored.len().saturating_sub(self.capacity);
        if excess > 0 {
            debug!(
                path = %self.path.display(),
                dropped = excess,
                "mapping store over capacity at load"
            );
            stored.drain(..excess);
        }

        for entry in stored {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.recency.insert(seq, entry.source_id.clone());
            self.entries.insert(entry.source_id.clone(), (seq, entry));
        }
    }
}

impl Drop for MappingStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = %self.path.display(), error = %e, "mapping store flush on drop failed");
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, tempfile::TempDir};

    fn target(n: u32) -> TargetLocation {
        TargetLocation {
            channel_id: "900".into(),
            message_id: format!("t{n}"),
        }
    }

    fn store(dir: &TempDir, capacity: usize) -> MappingStore {
        MappingStore::new(dir.path().join("a1.json"), capacity)
    }

    #[test]
    fn record_and_get() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp, 10);
        s.record("m1", target(1));
        assert_eq!(s.get("m1"), Some(target(1)));
        assert_eq!(s.get("m2"), None);
    }

    #[test]
    fn capacity_never_exceeded_and_oldest_evicted() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp, 5);
        for n in 0..6 {
            s.record(&format!("m{n}"), target(n));
            assert!(s.len() <= 5);
        }
        // m0 was the least-recently-updated entry.
        assert_eq!(s.get("m0"), None);
        assert!(s.get("m1").is_some());
        assert!(s.get("m5").is_some());
    }

    #[test]
    fn refresh_moves_entry_to_most_recent() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp, 3);
        s.record("m1", target(1));
        s.record("m2", target(2));
        s.record("m3", target(3));

        // Refresh m1, then overflow: m2 is now the oldest.
        s.record("m1", target(10));
        s.record("m4", target(4));

        assert_eq!(s.get("m2"), None);
        assert_eq!(s.get("m1"), Some(target(10)));
    }

    #[test]
    fn refresh_at_capacity_does_not_evict() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp, 2);
        s.record("m1", target(1));
        s.record("m2", target(2));

        // Table is full; refreshing must not push anything out.
        s.record("m2", target(20));
        assert_eq!(s.len(), 2);
        assert!(s.get("m1").is_some());
    }

    #[test]
    fn flush_and_reload() {
        let tmp = TempDir::new().unwrap();
        {
            let mut s = store(&tmp, 10);
            s.record("m1", target(1));
            s.record("m2", target(2));
            s.flush().unwrap();
        }
        let mut s = store(&tmp, 10);
        assert_eq!(s.get("m1"), Some(target(1)));
        assert_eq!(s.get("m2"), Some(target(2)));
    }

    #[test]
    fn flush_is_dirty_gated() {
        let tmp = TempDir::new().unwrap();
        let mut s = store(&tmp, 10);
        s.record("m1", target(1));
        s.flush().unwrap();
        assert!(!s.is_dirty());
        // No changes: flush again is a no-op (and must not error).
        s.flush().unwrap();
    }

    #[test]
    fn load_trims_over_capacity_file() {
        let tmp = TempDir::new().unwrap();
        {
            let mut s = store(&tmp, 10);
            for n in 0..10 {
                s.record(&format!("m{n}"), target(n));
            }
            s.flush().unwrap();
        }
        // Reopen with a smaller capacity: oldest-updated are dropped.
        let mut s = store(&tmp, 4);
        assert_eq!(s.len(), 4);
        assert_eq!(s.get("m0"), None);
        assert!(s.get("m9").is_some());
    }

    #[test]
    fn malformed_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a1.json"), "{oops").unwrap();
        let mut s = store(&tmp, 10);
        assert!(s.is_empty());
    }
}
