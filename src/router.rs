use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use url::Url;

use crate::config::Config;

/// One configured upstream, with its prefix normalized and base URL parsed.
#[derive(Debug, Clone)]
pub struct RouteUpstream {
    pub name: String,
    pub prefix: String,
    pub base_url: Url,
    pub headers: Vec<(String, String)>,
}

/// One configured policy with its compiled matcher.
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    pub name: String,
    pub regex: Regex,
    pub cache_ttl: Duration,
    pub allow_stale_while_revalidate: bool,
}

/// Resolves inbound request paths to an upstream and a caching policy.
/// Upstreams are tried in declaration order; the first whose normalized
/// prefix matches wins. Policies are tried in declaration order against the
/// path remainder.
pub struct Router {
    upstreams: Vec<RouteUpstream>,
    policies: Vec<RoutePolicy>,
}

impl Router {
    pub fn new(cfg: &Config) -> Result<Self> {
        let mut upstreams = Vec::with_capacity(cfg.upstreams.len());
        for (name, upstream) in &cfg.upstreams {
            let base_url = Url::parse(&upstream.base_url)
                .with_context(|| format!("upstream {name}: invalid base_url"))?;
            let prefix = normalize_prefix(upstream.path_prefix.as_deref(), name);
            let headers = upstream
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            upstreams.push(RouteUpstream {
                name: name.clone(),
                prefix,
                base_url,
                headers,
            });
        }

        let mut policies = Vec::with_capacity(cfg.policies.len());
        for policy in &cfg.policies {
            let regex = Regex::new(&policy.regex)
                .with_context(|| format!("policy {}: invalid regex", policy.name))?;
            policies.push(RoutePolicy {
                name: policy.name.clone(),
                regex,
                cache_ttl: policy.cache_ttl,
                allow_stale_while_revalidate: policy.allow_stale_while_revalidate,
            });
        }

        Ok(Self {
            upstreams,
            policies,
        })
    }

    /// First upstream whose prefix matches, plus the path remainder.
    pub fn match_upstream<'p>(&self, path: &'p str) -> Option<(&RouteUpstream, &'p str)> {
        for upstream in &self.upstreams {
            if let Some(rest) = path.strip_prefix(&upstream.prefix) {
                return Some((upstream, rest));
            }
        }
        None
    }

    /// First policy whose regex matches the path remainder.
    pub fn match_policy(&self, rest: &str) -> Option<&RoutePolicy> {
        self.policies.iter().find(|p| p.regex.is_match(rest))
    }
}

fn normalize_prefix(prefix: Option<&str>, name: &str) -> String {
    let mut prefix = match prefix {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => format!("/{name}/"),
    };
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

/// Whether a path remainder is safe to join onto an upstream base URL:
/// no NUL bytes, no `.`/`..` segments that could escape the base path.
/// An empty remainder is fine; it resolves to the base URL itself.
pub fn rest_is_safe(rest: &str) -> bool {
    if rest.contains('\0') {
        return false;
    }
    rest.split('/').all(|seg| seg != ".." && seg != ".")
}

/// Joins the upstream base URL path with the remainder, preserving the
/// inbound query string verbatim.
pub fn upstream_url(upstream: &RouteUpstream, rest: &str, query: Option<&str>) -> String {
    let mut url = upstream.base_url.clone();
    let base_path = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{base_path}/{rest}"));
    url.set_query(query);
    url.to_string()
}
