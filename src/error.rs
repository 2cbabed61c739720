use http::StatusCode;
use thiserror::Error;

/// Error kinds raised by the proxy engine, each mapped to a client-visible
/// status code. Background tasks log these instead of surfacing them.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no upstream matched")]
    NoUpstream,

    #[error("no policy matched")]
    NoPolicy,

    #[error("invalid request path")]
    BadPath,

    #[error("timed out waiting for the cache fill lock")]
    LockTimeout,

    #[error("upstream error: {0}")]
    UpstreamTransport(String),

    #[error("store io: {0}")]
    StoreIo(#[from] std::io::Error),

    #[error("index io: {0}")]
    IndexIo(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoUpstream => StatusCode::NOT_FOUND,
            ProxyError::NoPolicy => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::BadPath => StatusCode::BAD_REQUEST,
            ProxyError::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::StoreIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::IndexIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
