use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;

use crate::admin::Admin;
use crate::auth;
use crate::body::{self, BoxedBody};
use crate::config::Config;
use crate::constants;
use crate::janitor::Janitor;
use crate::metrics;
use crate::proxy::ProxyEngine;
use crate::router::Router;
use crate::storage::{BlobStore, Index};
use crate::upstream::UpstreamClient;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

pub struct AppState {
    pub config: Arc<Config>,
    pub engine: ProxyEngine,
    pub admin: Admin,
    pub index: Arc<Index>,
}

/// Wires up store, index (rebuilding it when empty), router, upstream
/// client, engine, admin surface and janitor from a validated config.
pub fn build(config: Arc<Config>) -> Result<(Arc<AppState>, Janitor)> {
    let store = BlobStore::open(&config.cache.dir).context("open cache directory")?;
    let index_path = config.cache.dir.join(constants::INDEX_DB_FILE);
    let index = Arc::new(Index::open(&index_path)?);

    let count = index.count();
    if count == 0 {
        if let Err(err) = index.rebuild_from_disk(&config.cache.dir) {
            log::warn!("index rebuild failed: {err}");
        }
    } else {
        log::info!("index loaded: {count} entries");
    }

    let router = Router::new(&config)?;
    let client = UpstreamClient::new()?;
    let engine = ProxyEngine::new(&config, router, store.clone(), Arc::clone(&index), client);
    let admin = Admin::new(Arc::clone(&config), store.clone(), Arc::clone(&index));
    let janitor = Janitor::new(store, Arc::clone(&index), &config);

    let state = Arc::new(AppState {
        config,
        engine,
        admin,
        index,
    });
    Ok((state, janitor))
}

pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let (state, janitor) = build(Arc::clone(&config))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);
    let janitor_task = janitor.spawn(shutdown_rx.clone());

    log::info!("cache directory: {}", config.cache.dir.display());
    log::info!("max cache size: {} bytes", config.cache.max_size_bytes);
    log::info!(
        "{} upstreams, {} policies configured",
        config.upstreams.len(),
        config.policies.len()
    );

    let mut servers = Vec::new();
    for listener_cfg in &config.server.listeners {
        let addr = parse_listen_addr(&listener_cfg.addr)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        log::info!("listening on {addr}");
        servers.push(tokio::spawn(serve(
            listener,
            Arc::clone(&state),
            shutdown_rx.clone(),
        )));
    }

    for server in servers {
        if let Err(err) = server.await.context("join listener task")? {
            log::error!("listener failed: {err}");
        }
    }

    log::info!("stopping janitor");
    let _ = janitor_task.await;
    log::info!("closing index");
    if let Err(err) = state.index.flush() {
        log::warn!("index flush failed: {err}");
    }
    log::info!("server stopped");
    Ok(())
}

/// Accept loop for one listener. On shutdown, stops accepting and drains
/// in-flight connections for up to 30 seconds.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, _) = res.context("accept")?;
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                tracker.spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("connection error: {err}");
                    }
                });
            }
        }
    }
    tracker.close();
    if tokio::time::timeout(SHUTDOWN_DRAIN, tracker.wait())
        .await
        .is_err()
    {
        log::warn!("shutdown drain timed out with connections still open");
    }
    Ok(())
}

async fn handle(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxedBody> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if state.config.auth.enabled && !auth::exempt(&path) {
        if !auth::check(&state.config.auth, req.headers()) {
            let resp = Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("WWW-Authenticate", "Basic realm=\"silo\"")
                .body(body::full(bytes::Bytes::from_static(b"unauthorized")))
                .unwrap();
            metrics::record_response(resp.status());
            return resp;
        }
    }

    let resp = match (path.as_str(), &method) {
        ("/_healthz", &Method::GET) => state.admin.health(),
        ("/_stats", &Method::GET) => state.admin.stats(),
        ("/_metrics", &Method::GET) => state.admin.metrics(),
        ("/_purge/by-url", &Method::POST) => state.admin.purge_by_url(req).await,
        ("/_purge/by-regex", &Method::POST) => state.admin.purge_by_regex(req).await,
        _ => state.engine.handle(req).await,
    };

    metrics::record_response(resp.status());
    let cache_status = resp
        .headers()
        .get(constants::X_CACHE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    log::info!(
        "{method} {path} {} {cache_status} {}ms",
        resp.status().as_u16(),
        started.elapsed().as_millis()
    );
    resp
}

fn spawn_signal_handler(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                if let Some(sig) = sigterm.as_mut() {
                    let _ = sig.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {}
        }
        log::info!("shutdown signal received, draining");
        let _ = shutdown.send(true);
    });
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("parse listener addr {addr}"))
}
