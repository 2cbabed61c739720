use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::metrics;
use crate::storage::{BlobStore, Index};

/// Periodic cleanup: LRU eviction down to the size budget, plus eviction of
/// entries idle longer than the inactivity TTL. Per-entry failures are
/// logged and skipped; deletion order is always blob store first, index
/// second, so a crash in between leaves orphan files the rebuild recovers.
pub struct Janitor {
    store: BlobStore,
    index: Arc<Index>,
    max_size_bytes: u64,
    inactive_ttl: Duration,
    interval: Duration,
}

impl Janitor {
    pub fn new(store: BlobStore, index: Arc<Index>, cfg: &Config) -> Self {
        Self {
            store,
            index,
            max_size_bytes: cfg.cache.max_size_bytes,
            inactive_ttl: cfg.cache.inactive_ttl,
            interval: cfg.cache.janitor_interval,
        }
    }

    /// Runs until the shutdown signal flips; the first sweep happens
    /// immediately.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.run_once().await,
                    _ = shutdown.changed() => break,
                }
            }
            log::info!("janitor stopped");
        })
    }

    pub async fn run_once(&self) {
        self.evict_oversize().await;
        self.evict_inactive().await;
    }

    async fn evict_oversize(&self) {
        let total = match self.index.total_size() {
            Ok(total) => total,
            Err(err) => {
                log::warn!("janitor: failed to read total size: {err}");
                return;
            }
        };
        if total <= self.max_size_bytes {
            return;
        }
        log::info!(
            "janitor: cache size {total} exceeds budget {}, evicting",
            self.max_size_bytes
        );

        let entries = match self.index.list_by_lru(0) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("janitor: failed to list entries: {err}");
                return;
            }
        };

        let mut freed = 0u64;
        let mut evicted = 0usize;
        for entry in entries {
            if total - freed <= self.max_size_bytes {
                break;
            }
            if let Err(err) = self.store.delete(&entry.repo, &entry.key).await {
                log::warn!("janitor: failed to delete {}/{}: {err}", entry.repo, entry.key);
                continue;
            }
            if let Err(err) = self.index.delete(&entry.repo, &entry.key) {
                log::warn!(
                    "janitor: failed to delete {}/{} from index: {err}",
                    entry.repo,
                    entry.key
                );
            }
            freed += entry.size;
            evicted += 1;
            metrics::record_eviction(entry.size);
        }
        if evicted > 0 {
            log::info!("janitor: evicted {evicted} entries, freed {freed} bytes");
        }
    }

    async fn evict_inactive(&self) {
        if self.inactive_ttl.is_zero() {
            return;
        }
        let entries = match self.index.list_all() {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("janitor: failed to list entries: {err}");
                return;
            }
        };

        let now = chrono::Utc::now();
        let mut evicted = 0usize;
        for entry in entries {
            let idle = now
                .signed_duration_since(entry.last_access)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if idle <= self.inactive_ttl {
                continue;
            }
            if let Err(err) = self.store.delete(&entry.repo, &entry.key).await {
                log::warn!(
                    "janitor: failed to delete idle {}/{}: {err}",
                    entry.repo,
                    entry.key
                );
                continue;
            }
            if let Err(err) = self.index.delete(&entry.repo, &entry.key) {
                log::warn!(
                    "janitor: failed to delete idle {}/{} from index: {err}",
                    entry.repo,
                    entry.key
                );
            }
            evicted += 1;
            metrics::record_eviction(entry.size);
        }
        if evicted > 0 {
            log::info!("janitor: evicted {evicted} idle entries");
        }
    }
}
