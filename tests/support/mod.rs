use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use rand::RngCore;
use tokio::net::TcpListener;
use tokio::sync::watch;

use silo::config::{Config, Policy};
use silo::server;

/// Mock upstream origin. The handler runs per request; block in it to
/// simulate a slow origin.
pub struct MockServer {
    addr: SocketAddr,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[derive(Clone)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }
}

/// A full proxy instance on an ephemeral port, backed by a temp cache
/// directory and a mock upstream reachable as the `u` repo under `/u/`.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub upstream: MockServer,
    cache_dir: Arc<tempfile::TempDir>,
    _shutdown: watch::Sender<bool>,
}

impl TestProxy {
    pub async fn start<F>(policies: Vec<Policy>, handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        Self::start_with(policies, handler, |_| {}).await
    }

    pub async fn start_with<F, T>(policies: Vec<Policy>, handler: F, tune: T) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
        T: FnOnce(&mut Config),
    {
        let upstream = MockServer::start(handler).await;
        let cache_dir = Arc::new(tempfile::tempdir().expect("tempdir"));

        let mut cfg = base_config(cache_dir.path(), upstream.addr(), policies);
        tune(&mut cfg);
        cfg.validate().expect("config");

        let (state, _janitor) = server::build(Arc::new(cfg)).expect("build server");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("proxy addr");
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _ = server::serve(listener, state, shutdown_rx).await;
        });

        Self {
            addr,
            upstream,
            cache_dir,
            _shutdown: shutdown,
        }
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        self.cache_dir.path()
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.request(Method::GET, path, HeaderMap::new(), Bytes::new())
            .await
    }

    pub async fn get_with(&self, path: &str, headers: HeaderMap) -> TestResponse {
        self.request(Method::GET, path, headers, Bytes::new()).await
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        req_body: Bytes,
    ) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .expect("connect proxy");
        let io = TokioIo::new(stream);
        let (mut sender, conn) = http1::handshake(io).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::HOST, self.addr.to_string());
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let req = builder.body(Full::new(req_body)).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();

        TestResponse {
            status,
            headers,
            body,
        }
    }
}

pub fn base_config(
    cache_dir: &std::path::Path,
    upstream_addr: SocketAddr,
    policies: Vec<Policy>,
) -> Config {
    let raw = format!(
        r#"
cache:
  dir: {}
  max_size_bytes: 1GB
  lock_timeout: 5s
upstreams:
  u:
    base_url: "http://{}"
admin:
  enable_purge_api: true
  token: test-token
policies: []
"#,
        cache_dir.display(),
        upstream_addr
    );
    let (mut cfg, _) = silo::config::from_str(&raw).expect("base config");
    cfg.policies = policies;
    cfg
}

pub fn catch_all_policy(ttl: Duration) -> Policy {
    policy("all", ".*", ttl, false)
}

pub fn policy(name: &str, regex: &str, ttl: Duration, swr: bool) -> Policy {
    let raw = format!(
        r#"{{name: {name}, regex: '{regex}', cache_ttl: {}s, allow_stale_while_revalidate: {swr}}}"#,
        ttl.as_secs()
    );
    serde_yaml::from_str(&raw).expect("policy")
}

/// Random fixture bytes for cache bodies.
pub fn gen_bytes(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// A 200 response with the given body and extra headers.
pub fn ok_response(body: &[u8], extra: &[(&str, &str)]) -> Response<Full<Bytes>> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("Content-Length", body.len().to_string());
    for (name, value) in extra {
        builder = builder.header(*name, *value);
    }
    builder
        .body(Full::new(Bytes::copy_from_slice(body)))
        .unwrap()
}

/// Waits until the proxy's background publish finished for at least `n`
/// entries under the cache dir, or panics after two seconds.
pub async fn wait_for_entries(proxy: &TestProxy, repo: &str, n: usize) {
    let repo_dir = proxy.cache_dir().join(repo);
    for _ in 0..100 {
        let count = std::fs::read_dir(&repo_dir)
            .map(|iter| {
                iter.flatten()
                    .filter(|e| e.path().join("meta.json").is_file())
                    .count()
            })
            .unwrap_or(0);
        if count >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("cache never reached {n} published entries");
}
