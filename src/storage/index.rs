use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const ENTRIES_TREE: &str = "entries";
const STATS_TREE: &str = "stats";

/// Another process may hold the index lock briefly during a restart; retry
/// opening within this window before giving up.
const OPEN_RETRY_WINDOW: Duration = Duration::from_secs(5);

/// Projection of the sidecar metadata kept in the durable index, keyed by
/// `"<repo>/<key>"`. The index drives eviction and listing; the sidecar
/// stays authoritative for per-entry serving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub repo: String,
    pub key: String,
    pub url: String,
    pub size: u64,
    pub last_access: DateTime<Utc>,
    pub hits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub total_size: u64,
    pub total_count: u64,
    pub total_hits: u64,
}

/// Durable key-value index backed by sled, with separate trees for entries
/// (JSON) and named counters (big-endian u64).
pub struct Index {
    db: sled::Db,
    entries: sled::Tree,
    stats: sled::Tree,
}

impl Index {
    pub fn open(path: &Path) -> Result<Self> {
        let deadline = Instant::now() + OPEN_RETRY_WINDOW;
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(err) if Instant::now() < deadline => {
                    log::warn!("index open failed, retrying: {err}");
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(err) => return Err(anyhow!("open index {}: {err}", path.display())),
            }
        };
        Self::with_db(db)
    }

    /// In-memory index for tests.
    pub fn temporary() -> Result<Self> {
        Self::with_db(sled::Config::new().temporary(true).open()?)
    }

    fn with_db(db: sled::Db) -> Result<Self> {
        let entries = db.open_tree(ENTRIES_TREE)?;
        let stats = db.open_tree(STATS_TREE)?;
        Ok(Self { db, entries, stats })
    }

    fn entry_key(repo: &str, key: &str) -> String {
        format!("{repo}/{key}")
    }

    pub fn put(&self, entry: &IndexEntry) -> Result<()> {
        let raw = serde_json::to_vec(entry)?;
        self.entries
            .insert(Self::entry_key(&entry.repo, &entry.key), raw)?;
        Ok(())
    }

    pub fn get(&self, repo: &str, key: &str) -> Result<Option<IndexEntry>> {
        let Some(raw) = self.entries.get(Self::entry_key(repo, key))? else {
            return Ok(None);
        };
        match serde_json::from_slice(&raw) {
            Ok(entry) => Ok(Some(entry)),
            Err(err) => {
                log::warn!("index: corrupt entry {repo}/{key}: {err}");
                Ok(None)
            }
        }
    }

    pub fn delete(&self, repo: &str, key: &str) -> Result<()> {
        self.entries.remove(Self::entry_key(repo, key))?;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// All decodable entries; corrupt records are skipped, not fatal.
    pub fn list_all(&self) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        for item in self.entries.iter() {
            let (key, raw) = item?;
            match serde_json::from_slice::<IndexEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    log::warn!(
                        "index: skipping corrupt entry {}: {err}",
                        String::from_utf8_lossy(&key)
                    );
                }
            }
        }
        Ok(entries)
    }

    /// Entries ordered by ascending `last_access`; `limit` of zero means
    /// all.
    pub fn list_by_lru(&self, limit: usize) -> Result<Vec<IndexEntry>> {
        let mut entries = self.list_all()?;
        entries.sort_by_key(|e| e.last_access);
        if limit > 0 && entries.len() > limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list_all()?.iter().map(|e| e.size).sum())
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let entries = self.list_all()?;
        Ok(IndexStats {
            total_size: entries.iter().map(|e| e.size).sum(),
            total_count: entries.len() as u64,
            total_hits: entries.iter().map(|e| e.hits).sum(),
        })
    }

    pub fn increment_stat(&self, name: &str, delta: u64) -> Result<()> {
        self.stats.update_and_fetch(name, |old| {
            let current = old.and_then(decode_counter).unwrap_or(0);
            Some(current.saturating_add(delta).to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    pub fn get_stat(&self, name: &str) -> Result<u64> {
        Ok(self
            .stats
            .get(name)?
            .as_deref()
            .and_then(decode_counter)
            .unwrap_or(0))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_counter(raw: &[u8]) -> Option<u64> {
    raw.try_into().ok().map(u64::from_be_bytes)
}
