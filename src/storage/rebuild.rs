use std::fs;
use std::path::Path;

use anyhow::Result;

use crate::constants;
use crate::storage::index::{Index, IndexEntry};
use crate::storage::meta;

impl Index {
    /// Rebuilds the index from the on-disk store by scanning
    /// `<cache_dir>/<repo>/<key>/meta.json`. Sidecars without a sibling blob
    /// are skipped, which also drops entries half-deleted by a crash.
    /// Returns the number of entries indexed.
    pub fn rebuild_from_disk(&self, cache_dir: &Path) -> Result<usize> {
        log::info!("index is empty, scanning {} for cached entries", cache_dir.display());
        let mut scanned = 0usize;
        let mut added = 0usize;

        for repo_dir in fs::read_dir(cache_dir)? {
            let repo_dir = match repo_dir {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let repo_path = repo_dir.path();
            if !repo_path.is_dir() {
                continue;
            }
            let repo = repo_dir.file_name().to_string_lossy().to_string();
            if repo == constants::BY_PATH_DIR || repo == constants::INDEX_DB_FILE {
                continue;
            }

            let key_dirs = match fs::read_dir(&repo_path) {
                Ok(iter) => iter,
                Err(err) => {
                    log::warn!("rebuild: cannot read {}: {err}", repo_path.display());
                    continue;
                }
            };
            for key_dir in key_dirs.flatten() {
                let key_path = key_dir.path();
                let sidecar = key_path.join("meta.json");
                if !sidecar.is_file() {
                    continue;
                }
                scanned += 1;

                let metadata = match meta::load(&sidecar) {
                    Ok(m) => m,
                    Err(err) => {
                        log::warn!("rebuild: unreadable sidecar {}: {err}", sidecar.display());
                        continue;
                    }
                };
                let key = key_dir.file_name().to_string_lossy().to_string();
                if !key_path.join("blob").is_file() {
                    log::warn!("rebuild: blob missing for {repo}/{key}, skipping");
                    continue;
                }

                let entry = IndexEntry {
                    repo: repo.clone(),
                    key,
                    url: metadata.url,
                    size: metadata.size,
                    last_access: metadata.last_access,
                    hits: metadata.hits,
                };
                if let Err(err) = self.put(&entry) {
                    log::warn!("rebuild: failed to index {}/{}: {err}", entry.repo, entry.key);
                    continue;
                }
                added += 1;
                if added % 100 == 0 {
                    log::info!("rebuild: indexed {added} entries...");
                }
            }
        }

        log::info!("index rebuild complete: scanned {scanned} sidecars, indexed {added} entries");
        Ok(added)
    }
}
