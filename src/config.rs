use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: Server,
    pub cache: Cache,
    pub policies: Vec<Policy>,
    pub upstreams: IndexMap<String, Upstream>,
    pub admin: Admin,
    pub auth: Auth,
    pub logging: Logging,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Server {
    pub listeners: Vec<Listener>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Listener {
    pub addr: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Cache {
    pub dir: PathBuf,
    #[serde(deserialize_with = "de_size")]
    pub max_size_bytes: u64,
    #[serde(with = "humantime_serde")]
    pub inactive_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub janitor_interval: Duration,
    pub revalidate_etag: bool,
    pub revalidate_last_modified: bool,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            max_size_bytes: 0,
            inactive_ttl: Duration::ZERO,
            lock_timeout: Duration::from_secs(10),
            janitor_interval: Duration::from_secs(300),
            revalidate_etag: true,
            revalidate_last_modified: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    pub name: String,
    pub regex: String,
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    #[serde(default)]
    pub allow_stale_while_revalidate: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Upstream {
    pub base_url: String,
    pub path_prefix: Option<String>,
    /// Extra headers sent on every upstream request, typically Authorization.
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Admin {
    pub enable_purge_api: bool,
    pub token: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Auth {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub auth_type: String,
    pub users: HashMap<String, String>,
    pub tokens: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
}

pub fn load(path: &Path) -> Result<(Config, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    from_str(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn from_str(raw: &str) -> Result<(Config, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Config = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    Ok((cfg, ignored))
}

impl Config {
    pub fn validate(&mut self) -> Result<()> {
        if self.server.listeners.is_empty() {
            self.server.listeners.push(Listener {
                addr: ":8080".to_string(),
            });
        }
        if self.cache.dir.as_os_str().is_empty() {
            return Err(anyhow!("cache.dir is required"));
        }
        if self.cache.max_size_bytes == 0 {
            return Err(anyhow!("cache.max_size_bytes must be positive"));
        }
        if self.policies.is_empty() {
            return Err(anyhow!("at least one policy is required"));
        }
        for policy in &self.policies {
            regex::Regex::new(&policy.regex)
                .with_context(|| format!("policy {}: invalid regex", policy.name))?;
        }
        if self.upstreams.is_empty() {
            return Err(anyhow!("at least one upstream is required"));
        }
        for (name, upstream) in &self.upstreams {
            let url = url::Url::parse(&upstream.base_url)
                .with_context(|| format!("upstream {name}: invalid base_url"))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!("upstream {name}: base_url must be http or https"));
            }
            if url.host_str().is_none() {
                return Err(anyhow!("upstream {name}: base_url has no host"));
            }
        }
        Ok(())
    }
}

fn de_size<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Str(String),
    }
    match Raw::deserialize(de)? {
        Raw::Int(v) => Ok(v),
        Raw::Str(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

/// Parses a byte size: a bare integer, or a number with a unit suffix
/// (B, KB, MB, GB, TB, PB; case-insensitive, binary multipliers).
pub fn parse_size(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty size".to_string());
    }
    if let Ok(v) = raw.parse::<u64>() {
        return Ok(v);
    }
    let upper = raw.to_ascii_uppercase();
    let split = upper
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| format!("invalid size: {raw}"))?;
    let (num, unit) = upper.split_at(split);
    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: {raw}"))?;
    if value < 0.0 {
        return Err(format!("negative size: {raw}"));
    }
    let multiplier: u64 = match unit.trim() {
        "B" => 1,
        "KB" | "K" => 1 << 10,
        "MB" | "M" => 1 << 20,
        "GB" | "G" => 1 << 30,
        "TB" | "T" => 1 << 40,
        "PB" | "P" => 1 << 50,
        other => return Err(format!("unknown size unit: {other}")),
    };
    Ok((value * multiplier as f64) as u64)
}
