pub mod admin;
pub mod auth;
pub mod body;
pub mod config;
pub mod constants;
pub mod error;
pub mod http_range;
pub mod janitor;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod router;
pub mod server;
pub mod storage;
pub mod upstream;
