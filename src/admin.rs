use std::sync::Arc;

use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::body::{self, BoxedBody};
use crate::config::Config;
use crate::metrics;
use crate::storage::{BlobStore, Index, IndexEntry};

/// Admin endpoints: health, stats, Prometheus metrics, and the purge API.
pub struct Admin {
    config: Arc<Config>,
    store: BlobStore,
    index: Arc<Index>,
}

#[derive(Deserialize)]
struct PurgeByUrl {
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct PurgeByRegex {
    #[serde(default)]
    regex: String,
}

impl Admin {
    pub fn new(config: Arc<Config>, store: BlobStore, index: Arc<Index>) -> Self {
        Self {
            config,
            store,
            index,
        }
    }

    pub fn health(&self) -> Response<BoxedBody> {
        body::json_response(&serde_json::json!({"status": "ok"}))
    }

    pub fn stats(&self) -> Response<BoxedBody> {
        let stats = match self.index.stats() {
            Ok(stats) => stats,
            Err(err) => {
                log::warn!("stats read failed: {err}");
                return body::text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to read stats",
                );
            }
        };
        let hits = self.index.get_stat("hits").unwrap_or(0);
        let misses = self.index.get_stat("misses").unwrap_or(0);
        body::json_response(&serde_json::json!({
            "total_size_bytes": stats.total_size,
            "total_entries": stats.total_count,
            "total_hits": hits,
            "total_misses": misses,
            "hit_ratio": hit_ratio(hits, misses),
        }))
    }

    pub fn metrics(&self) -> Response<BoxedBody> {
        if let Ok(size) = self.index.total_size() {
            metrics::set_cache_usage(size, self.index.count());
        }
        body::text_response(StatusCode::OK, &metrics::render())
    }

    pub async fn purge_by_url(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        if let Some(denied) = self.authorize(&req) {
            return denied;
        }
        let Some(payload) = read_json::<PurgeByUrl>(req).await else {
            return body::text_response(StatusCode::BAD_REQUEST, "invalid request");
        };
        if payload.url.is_empty() {
            return body::text_response(StatusCode::BAD_REQUEST, "url is required");
        }
        self.purge_matching(|entry| entry.url == payload.url).await
    }

    pub async fn purge_by_regex(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        if let Some(denied) = self.authorize(&req) {
            return denied;
        }
        let Some(payload) = read_json::<PurgeByRegex>(req).await else {
            return body::text_response(StatusCode::BAD_REQUEST, "invalid request");
        };
        if payload.regex.is_empty() {
            return body::text_response(StatusCode::BAD_REQUEST, "regex is required");
        }
        let matcher = match regex::Regex::new(&payload.regex) {
            Ok(matcher) => matcher,
            Err(err) => {
                return body::text_response(
                    StatusCode::BAD_REQUEST,
                    &format!("invalid regex: {err}"),
                );
            }
        };
        self.purge_matching(|entry| matcher.is_match(&entry.url))
            .await
    }

    async fn purge_matching<F>(&self, matches: F) -> Response<BoxedBody>
    where
        F: Fn(&IndexEntry) -> bool,
    {
        let entries = match self.index.list_all() {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("purge: failed to list entries: {err}");
                return body::text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to list entries",
                );
            }
        };

        let mut purged = 0usize;
        for entry in entries.iter().filter(|e| matches(e)) {
            if let Err(err) = self.store.delete(&entry.repo, &entry.key).await {
                log::warn!("purge: failed to delete {}/{}: {err}", entry.repo, entry.key);
                continue;
            }
            if let Err(err) = self.index.delete(&entry.repo, &entry.key) {
                log::warn!(
                    "purge: failed to delete {}/{} from index: {err}",
                    entry.repo,
                    entry.key
                );
            }
            purged += 1;
        }
        body::json_response(&serde_json::json!({"purged": purged}))
    }

    /// Purge mutations need the API enabled plus the configured bearer
    /// token; the comparison is constant-time.
    fn authorize(&self, req: &Request<Incoming>) -> Option<Response<BoxedBody>> {
        if !self.config.admin.enable_purge_api {
            return Some(body::text_response(StatusCode::NOT_FOUND, "not found"));
        }
        let token = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| raw.strip_prefix("Bearer "));
        let authorized = match token {
            Some(token) => bool::from(
                token
                    .as_bytes()
                    .ct_eq(self.config.admin.token.as_bytes()),
            ),
            None => false,
        };
        if !authorized {
            return Some(body::text_response(StatusCode::UNAUTHORIZED, "unauthorized"));
        }
        None
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Option<T> {
    let bytes = req.into_body().collect().await.ok()?.to_bytes();
    serde_json::from_slice(&bytes).ok()
}

fn hit_ratio(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        return 0.0;
    }
    hits as f64 / total as f64
}
