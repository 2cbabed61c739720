use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants;

/// Sidecar metadata stored next to each cached blob as `meta.json`.
/// `size` is authoritative: it is set from the bytes actually written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub url: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    pub policy: String,
    pub created_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub hits: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl Metadata {
    /// Whether the freshness window opened at `created_at` has elapsed.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age.to_std().map(|age| age > ttl).unwrap_or(false)
    }

    /// Bumps the access stats for a serve.
    pub fn touch(&mut self) {
        self.last_access = Utc::now();
        self.hits += 1;
    }
}

/// Hex SHA-256 of the canonical upstream URL. Stable across restarts.
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

pub fn blob_path(cache_dir: &Path, repo: &str, key: &str) -> PathBuf {
    cache_dir.join(repo).join(key).join("blob")
}

pub fn meta_path(cache_dir: &Path, repo: &str, key: &str) -> PathBuf {
    cache_dir.join(repo).join(key).join("meta.json")
}

pub fn symlink_path(cache_dir: &Path, repo: &str, rest: &str) -> PathBuf {
    cache_dir.join(constants::BY_PATH_DIR).join(repo).join(rest)
}

/// Appends `.tmp` to a path's file name.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

pub fn load(path: &Path) -> io::Result<Metadata> {
    let raw = fs::read(path)?;
    serde_json::from_slice(&raw).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Writes the sidecar atomically: temp file then rename.
pub fn save(path: &Path, meta: &Metadata) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(meta)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

/// Best-effort human-readable symlink under `by-path/`. Never consulted by
/// the serving path; failures are ignored.
pub fn create_symlink(cache_dir: &Path, repo: &str, rest: &str, key: &str) {
    #[cfg(unix)]
    {
        let link = symlink_path(cache_dir, repo, rest);
        let blob = blob_path(cache_dir, repo, key);
        let Some(parent) = link.parent() else { return };
        if fs::create_dir_all(parent).is_err() {
            return;
        }
        let _ = fs::remove_file(&link);
        let Ok(rel_parent) = parent.strip_prefix(cache_dir) else {
            return;
        };
        let mut target = PathBuf::new();
        for _ in rel_parent.components() {
            target.push("..");
        }
        target.push(repo);
        target.push(key);
        target.push("blob");
        let _ = std::os::unix::fs::symlink(target, &link);
    }
    #[cfg(not(unix))]
    {
        let _ = (cache_dir, repo, rest, key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_hex_sha256() {
        let key = cache_key("http://u/x");
        assert_eq!(key.len(), 64);
        assert_eq!(key, cache_key("http://u/x"));
        assert_ne!(key, cache_key("http://u/y"));
        // sha256 of the literal string, independently computed
        assert_eq!(
            cache_key("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn sidecar_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let meta = Metadata {
            url: "http://u/x".to_string(),
            size: 5,
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
            policy: "all".to_string(),
            created_at: Utc::now(),
            last_access: Utc::now(),
            hits: 3,
            content_type: Some("application/octet-stream".to_string()),
        };
        save(&path, &meta).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded.url, meta.url);
        assert_eq!(loaded.size, 5);
        assert_eq!(loaded.etag.as_deref(), Some("\"v1\""));
        assert_eq!(loaded.hits, 3);
        assert!(loaded.last_modified.is_none());
    }

    #[test]
    fn corrupt_sidecar_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        fs::write(&path, b"{not json").unwrap();
        let err = load(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_points_at_blob() {
        let dir = tempfile::tempdir().unwrap();
        let blob = blob_path(dir.path(), "repo", "abc");
        fs::create_dir_all(blob.parent().unwrap()).unwrap();
        fs::write(&blob, b"data").unwrap();
        create_symlink(dir.path(), "repo", "pool/a.deb", "abc");
        let link = symlink_path(dir.path(), "repo", "pool/a.deb");
        assert_eq!(fs::read(&link).unwrap(), b"data");
    }
}
