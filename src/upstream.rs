use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::time;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Pooled HTTP(S) client for upstream fetches. Does not follow redirects;
/// a `Location` from the upstream is surfaced to the client as-is.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl UpstreamClient {
    pub fn new() -> Result<Self> {
        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));
        http.enforce_http(false);
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("load system tls roots")?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(https);
        Ok(Self { client })
    }

    /// Issues a GET and resolves once response headers arrive; the body is
    /// consumed by the caller as it streams.
    pub async fn get(&self, uri: Uri, headers: HeaderMap) -> Result<Response<Incoming>> {
        let mut req = Request::builder().method(Method::GET).uri(uri);
        for (name, value) in headers.iter() {
            req = req.header(name, value);
        }
        let req = req.body(Empty::new()).context("build upstream request")?;
        let resp = time::timeout(RESPONSE_HEADER_TIMEOUT, self.client.request(req))
            .await
            .context("upstream response header timeout")?
            .context("upstream request")?;
        Ok(resp)
    }
}
