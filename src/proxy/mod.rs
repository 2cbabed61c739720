use std::io;
use std::io::SeekFrom;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Utc;
use http::request::Parts;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::body::{self, BoxedBody};
use crate::config::Config;
use crate::constants;
use crate::error::ProxyError;
use crate::http_range;
use crate::metrics;
use crate::router::{self, RoutePolicy, RouteUpstream, Router};
use crate::storage::{meta, BlobStore, Index, IndexEntry, Metadata};
use crate::upstream::UpstreamClient;

pub mod lock;

use lock::{KeyLock, LockTable};

/// Bound on the tee channels between the upstream reader and the two
/// writers; couples client and disk write rates without unbounded buffering.
const TEE_CHANNEL_DEPTH: usize = 32;

/// Handles one proxied request end to end: route, hit/stale/miss decision,
/// coalesced fetch with streaming tee, background revalidation, range
/// serving.
pub struct ProxyEngine {
    store: BlobStore,
    index: Arc<Index>,
    router: Router,
    client: UpstreamClient,
    locks: Arc<LockTable>,
    revalidate_etag: bool,
    revalidate_last_modified: bool,
}

impl ProxyEngine {
    pub fn new(
        cfg: &Config,
        router: Router,
        store: BlobStore,
        index: Arc<Index>,
        client: UpstreamClient,
    ) -> Self {
        Self {
            store,
            index,
            router,
            client,
            locks: LockTable::new(cfg.cache.lock_timeout),
            revalidate_etag: cfg.cache.revalidate_etag,
            revalidate_last_modified: cfg.cache.revalidate_last_modified,
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxedBody> {
        let (parts, _body) = req.into_parts();

        if parts.method == Method::CONNECT {
            return body::text_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "CONNECT not supported: this is a reverse proxy",
            );
        }
        if parts.method != Method::GET && parts.method != Method::HEAD {
            return body::text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        match self.dispatch(&parts).await {
            Ok(resp) => resp,
            Err(err) => {
                let status = err.status();
                if status.is_server_error() {
                    log::error!("{} {}: {err}", parts.method, parts.uri.path());
                }
                body::text_response(status, &err.to_string())
            }
        }
    }

    async fn dispatch(&self, parts: &Parts) -> Result<Response<BoxedBody>, ProxyError> {
        let path = parts.uri.path();
        let (upstream, rest) = self
            .router
            .match_upstream(path)
            .ok_or(ProxyError::NoUpstream)?;
        if !router::rest_is_safe(rest) {
            return Err(ProxyError::BadPath);
        }
        let policy = self.router.match_policy(rest).ok_or(ProxyError::NoPolicy)?;
        let upstream_url = router::upstream_url(upstream, rest, parts.uri.query());
        let key = meta::cache_key(&upstream_url);
        let repo = upstream.name.as_str();

        if self.store.exists(repo, &key) {
            if let Some(resp) = self
                .try_serve_hit(parts, repo, &key, policy, upstream, &upstream_url)
                .await?
            {
                return Ok(resp);
            }
        }

        // Miss: coalesce concurrent fetches of the same key.
        let lock = self.locks.acquire(&key).await?;

        // The lock winner may have published while this caller waited.
        if self.store.exists(repo, &key) {
            if let Some(resp) = self
                .try_serve_hit(parts, repo, &key, policy, upstream, &upstream_url)
                .await?
            {
                return Ok(resp);
            }
        }

        self.fetch_and_cache(parts, upstream, rest, &key, policy, &upstream_url, lock)
            .await
    }

    /// Serves a cache hit, or returns `None` if the entry turns out to be
    /// unusable (vanished or corrupt sidecar) so the caller falls through to
    /// the miss path.
    async fn try_serve_hit(
        &self,
        parts: &Parts,
        repo: &str,
        key: &str,
        policy: &RoutePolicy,
        upstream: &RouteUpstream,
        upstream_url: &str,
    ) -> Result<Option<Response<BoxedBody>>, ProxyError> {
        let (file, mut metadata) = match self.store.get(repo, key).await {
            Ok(pair) => pair,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                log::warn!("corrupt sidecar for {repo}/{key}, treating as absent: {err}");
                let _ = self.store.delete(repo, key).await;
                let _ = self.index.delete(repo, key);
                return Ok(None);
            }
            Err(err) => return Err(ProxyError::StoreIo(err)),
        };

        metadata.touch();
        if let Err(err) = self.store.update_metadata(repo, key, &metadata) {
            log::warn!("failed to persist access stats for {repo}/{key}: {err}");
        }
        if let Err(err) = self.index.put(&index_entry(repo, key, &metadata)) {
            log::warn!("index mirror failed for {repo}/{key}: {err}");
        }

        let stale = metadata.is_stale(policy.cache_ttl);
        if stale && policy.allow_stale_while_revalidate {
            self.spawn_revalidate(repo, key, policy, upstream, upstream_url, metadata.clone());
        }

        let mut builder = Response::builder()
            .header(constants::X_CACHE, "HIT")
            .header(constants::X_CACHE_POLICY, policy.name.as_str())
            .header(constants::X_CACHE_STATUS, if stale { "STALE" } else { "FRESH" });
        if let Some(ct) = &metadata.content_type {
            builder = builder.header(header::CONTENT_TYPE, ct.as_str());
        }

        let range_header = parts
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let resp = if let Some(raw) = range_header {
            self.serve_range(parts, builder, file, &metadata, &raw)
                .await?
        } else {
            let builder = builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, metadata.size);
            let resp_body = if parts.method == Method::HEAD {
                body::empty()
            } else {
                body::from_reader(file)
            };
            builder.body(resp_body).unwrap()
        };

        if let Err(err) = self.index.increment_stat("hits", 1) {
            log::warn!("stat update failed: {err}");
        }
        metrics::record_hit();
        Ok(Some(resp))
    }

    async fn serve_range(
        &self,
        parts: &Parts,
        builder: http::response::Builder,
        mut file: File,
        metadata: &Metadata,
        raw: &str,
    ) -> Result<Response<BoxedBody>, ProxyError> {
        match http_range::parse_range(raw, metadata.size) {
            Ok(spec) => {
                file.seek(SeekFrom::Start(spec.start)).await?;
                let builder = builder
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(
                        header::CONTENT_RANGE,
                        http_range::build_content_range(spec, metadata.size),
                    )
                    .header(header::CONTENT_LENGTH, spec.length());
                let resp_body = if parts.method == Method::HEAD {
                    body::empty()
                } else {
                    body::from_reader(file.take(spec.length()))
                };
                Ok(builder.body(resp_body).unwrap())
            }
            Err(_) => Ok(builder
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(
                    header::CONTENT_RANGE,
                    http_range::unsatisfiable_content_range(metadata.size),
                )
                .body(body::empty())
                .unwrap()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch_and_cache(
        &self,
        parts: &Parts,
        upstream: &RouteUpstream,
        rest: &str,
        key: &str,
        policy: &RoutePolicy,
        upstream_url: &str,
        fill_lock: KeyLock,
    ) -> Result<Response<BoxedBody>, ProxyError> {
        let uri: Uri = upstream_url
            .parse()
            .map_err(|err| ProxyError::UpstreamTransport(format!("invalid upstream url: {err}")))?;

        let mut headers = upstream_base_headers(upstream);
        // Forward a narrow set of client headers; never Range on a fill.
        for name in [header::USER_AGENT, header::ACCEPT, header::ACCEPT_ENCODING] {
            if let Some(value) = parts.headers.get(&name) {
                headers.insert(name, value.clone());
            }
        }

        let resp = self
            .client
            .get(uri, headers)
            .await
            .map_err(|err| ProxyError::UpstreamTransport(err.to_string()))?;
        let status = resp.status();
        let upstream_headers = resp.headers().clone();

        if status != StatusCode::OK || !is_cacheable(&upstream_headers) {
            // Stream through without touching the disk. Cache-Control
            // forbidding storage is a BYPASS; a non-200 is a plain MISS.
            let tag = if status == StatusCode::OK { "BYPASS" } else { "MISS" };
            if tag == "BYPASS" {
                metrics::record_bypass();
            } else {
                metrics::record_miss();
            }
            if let Err(err) = self.index.increment_stat("misses", 1) {
                log::warn!("stat update failed: {err}");
            }
            let mut builder = Response::builder().status(status);
            if let Some(dst) = builder.headers_mut() {
                copy_end_to_end_headers(&upstream_headers, dst);
                dst.insert(
                    HeaderName::from_static("x-cache"),
                    HeaderValue::from_static(tag),
                );
            }
            let resp_body = if parts.method == Method::HEAD {
                body::empty()
            } else {
                body::from_incoming(resp.into_body())
            };
            return Ok(builder.body(resp_body).unwrap());
        }

        // Cacheable 200: tee the upstream body to the client and the store.
        let metadata = Metadata {
            url: upstream_url.to_string(),
            size: 0,
            etag: header_str(&upstream_headers, header::ETAG),
            last_modified: header_str(&upstream_headers, header::LAST_MODIFIED),
            policy: policy.name.clone(),
            created_at: Utc::now(),
            last_access: Utc::now(),
            hits: 1,
            content_type: header_str(&upstream_headers, header::CONTENT_TYPE),
        };

        let (disk_tx, disk_rx) = mpsc::channel::<io::Result<Bytes>>(TEE_CHANNEL_DEPTH);
        let publish = {
            let store = self.store.clone();
            let repo = upstream.name.clone();
            let key = key.to_string();
            tokio::spawn(async move { store.put(&repo, &key, disk_rx, metadata).await })
        };

        let (client_tx, resp_body) = if parts.method == Method::HEAD {
            (None, body::empty())
        } else {
            let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(TEE_CHANNEL_DEPTH);
            (Some(tx), body::from_channel(rx))
        };

        let fill = FillTask {
            store: self.store.clone(),
            index: Arc::clone(&self.index),
            repo: upstream.name.clone(),
            key: key.to_string(),
            rest: rest.to_string(),
        };
        tokio::spawn(fill.run(resp.into_body(), client_tx, disk_tx, publish, fill_lock));

        metrics::record_miss();
        let mut builder = Response::builder().status(StatusCode::OK);
        if let Some(dst) = builder.headers_mut() {
            copy_end_to_end_headers(&upstream_headers, dst);
            dst.insert(
                HeaderName::from_static("x-cache"),
                HeaderValue::from_static("MISS"),
            );
            if let Ok(value) = policy.name.parse() {
                dst.insert(HeaderName::from_static("x-cache-policy"), value);
            }
        }
        Ok(builder.body(resp_body).unwrap())
    }

    fn spawn_revalidate(
        &self,
        repo: &str,
        key: &str,
        policy: &RoutePolicy,
        upstream: &RouteUpstream,
        upstream_url: &str,
        metadata: Metadata,
    ) {
        let job = RevalidateJob {
            client: self.client.clone(),
            store: self.store.clone(),
            index: Arc::clone(&self.index),
            repo: repo.to_string(),
            key: key.to_string(),
            url: upstream_url.to_string(),
            policy_name: policy.name.clone(),
            base_headers: upstream_base_headers(upstream),
            check_etag: self.revalidate_etag,
            check_last_modified: self.revalidate_last_modified,
            metadata,
        };
        tokio::spawn(async move {
            let url = job.url.clone();
            if let Err(err) = job.run().await {
                log::warn!("revalidate {url}: {err}");
            }
        });
    }
}

/// Owns the upstream body after the response headers have been sent and
/// finishes the fill: feed both sinks, then either publish (index update,
/// symlink) or clean up partial artifacts. Holds the coalescing lock until
/// done so a second fill for the same key cannot start early.
struct FillTask {
    store: BlobStore,
    index: Arc<Index>,
    repo: String,
    key: String,
    rest: String,
}

impl FillTask {
    async fn run(
        self,
        mut upstream_body: Incoming,
        mut client_tx: Option<mpsc::Sender<io::Result<Bytes>>>,
        disk_tx: mpsc::Sender<io::Result<Bytes>>,
        publish: JoinHandle<io::Result<Metadata>>,
        fill_lock: KeyLock,
    ) {
        let mut disk_tx = Some(disk_tx);
        let mut upstream_failed = false;

        loop {
            let frame = match upstream_body.frame().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    log::warn!("upstream body error for {}/{}: {err}", self.repo, self.key);
                    if let Some(tx) = &disk_tx {
                        let _ = tx.send(Err(io::Error::other("upstream aborted"))).await;
                    }
                    if let Some(tx) = &client_tx {
                        let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
                    }
                    upstream_failed = true;
                    break;
                }
                None => break,
            };
            let Ok(data) = frame.into_data() else {
                continue;
            };

            if let Some(tx) = &client_tx {
                if tx.send(Ok(data.clone())).await.is_err() {
                    // Client went away; keep draining into the store so the
                    // entry still publishes.
                    log::debug!("client disconnected mid-fill for {}/{}", self.repo, self.key);
                    client_tx = None;
                }
            }
            if let Some(tx) = &disk_tx {
                if tx.send(Ok(data)).await.is_err() {
                    // Store task bailed; keep serving the client.
                    disk_tx = None;
                }
            }
            if client_tx.is_none() && disk_tx.is_none() {
                break;
            }
        }
        drop(client_tx);
        drop(disk_tx);

        let published = match publish.await {
            Ok(Ok(metadata)) => Some(metadata),
            Ok(Err(err)) => {
                log::warn!("cache publish failed for {}/{}: {err}", self.repo, self.key);
                None
            }
            Err(err) => {
                log::warn!("cache publish task failed for {}/{}: {err}", self.repo, self.key);
                None
            }
        };

        match published {
            Some(metadata) if !upstream_failed => {
                if let Err(err) = self
                    .index
                    .put(&index_entry(&self.repo, &self.key, &metadata))
                {
                    log::warn!("index update failed for {}/{}: {err}", self.repo, self.key);
                }
                meta::create_symlink(self.store.root(), &self.repo, &self.rest, &self.key);
            }
            _ => {
                // Partial artifacts must never become observable.
                if let Err(err) = self.store.delete(&self.repo, &self.key).await {
                    log::warn!("cleanup failed for {}/{}: {err}", self.repo, self.key);
                }
            }
        }

        if let Err(err) = self.index.increment_stat("misses", 1) {
            log::warn!("stat update failed: {err}");
        }
        drop(fill_lock);
    }
}

/// Background conditional refresh of a stale entry. Runs without the
/// coalescing lock: the atomic rename in `put` keeps concurrent readers on
/// the blob they already opened.
struct RevalidateJob {
    client: UpstreamClient,
    store: BlobStore,
    index: Arc<Index>,
    repo: String,
    key: String,
    url: String,
    policy_name: String,
    base_headers: HeaderMap,
    check_etag: bool,
    check_last_modified: bool,
    metadata: Metadata,
}

impl RevalidateJob {
    async fn run(self) -> Result<()> {
        let uri: Uri = self.url.parse().context("revalidate url")?;
        let mut headers = self.base_headers.clone();
        if self.check_etag {
            if let Some(etag) = &self.metadata.etag {
                if let Ok(value) = etag.parse() {
                    headers.insert(header::IF_NONE_MATCH, value);
                }
            }
        }
        if self.check_last_modified {
            if let Some(last_modified) = &self.metadata.last_modified {
                if let Ok(value) = last_modified.parse() {
                    headers.insert(header::IF_MODIFIED_SINCE, value);
                }
            }
        }

        let resp = self.client.get(uri, headers).await?;
        match resp.status() {
            StatusCode::NOT_MODIFIED => {
                // Freshness window restarts without refetching bytes.
                let mut metadata = self.metadata;
                metadata.created_at = Utc::now();
                self.store
                    .update_metadata(&self.repo, &self.key, &metadata)
                    .context("refresh sidecar")?;
                log::debug!("revalidate: {} still fresh", self.url);
            }
            StatusCode::OK => {
                let resp_headers = resp.headers().clone();
                let new_meta = Metadata {
                    url: self.url.clone(),
                    size: 0,
                    etag: header_str(&resp_headers, header::ETAG),
                    last_modified: header_str(&resp_headers, header::LAST_MODIFIED),
                    policy: self.policy_name.clone(),
                    created_at: Utc::now(),
                    last_access: Utc::now(),
                    hits: self.metadata.hits,
                    content_type: header_str(&resp_headers, header::CONTENT_TYPE),
                };

                let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(TEE_CHANNEL_DEPTH);
                let put = {
                    let store = self.store.clone();
                    let repo = self.repo.clone();
                    let key = self.key.clone();
                    tokio::spawn(async move { store.put(&repo, &key, rx, new_meta).await })
                };

                let mut upstream_body = resp.into_body();
                loop {
                    match upstream_body.frame().await {
                        Some(Ok(frame)) => {
                            if let Ok(data) = frame.into_data() {
                                if tx.send(Ok(data)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Err(err)) => {
                            let _ = tx.send(Err(io::Error::other(err))).await;
                            break;
                        }
                        None => break,
                    }
                }
                drop(tx);

                let metadata = put.await.context("join publish")??;
                self.index
                    .put(&index_entry(&self.repo, &self.key, &metadata))
                    .context("index update")?;
                log::info!("revalidate: {} updated", self.url);
            }
            status => {
                // Stale copy keeps serving.
                log::warn!("revalidate: {} returned {status}, keeping entry", self.url);
            }
        }
        Ok(())
    }
}

fn index_entry(repo: &str, key: &str, metadata: &Metadata) -> IndexEntry {
    IndexEntry {
        repo: repo.to_string(),
        key: key.to_string(),
        url: metadata.url.clone(),
        size: metadata.size,
        last_access: metadata.last_access,
        hits: metadata.hits,
    }
}

/// Host header from the upstream base URL plus the configured extra headers
/// (typically Authorization).
fn upstream_base_headers(upstream: &RouteUpstream) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(host) = upstream.base_url.host_str() {
        let host = match upstream.base_url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        if let Ok(value) = host.parse() {
            headers.insert(header::HOST, value);
        }
    }
    for (name, value) in &upstream.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => log::warn!("upstream {}: skipping invalid header {name}", upstream.name),
        }
    }
    headers
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Only `no-store` and `private` suppress caching; per-policy TTLs replace
/// max-age and friends.
fn is_cacheable(headers: &HeaderMap) -> bool {
    match headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    {
        Some(cc) => !(cc.contains("no-store") || cc.contains("private")),
        None => true,
    }
}

/// Copies upstream headers onto a response, dropping hop-by-hop headers.
fn copy_end_to_end_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src.iter() {
        if name == header::CONNECTION
            || name == header::TRANSFER_ENCODING
            || name.as_str() == "keep-alive"
        {
            continue;
        }
        dst.append(name, value.clone());
    }
}
