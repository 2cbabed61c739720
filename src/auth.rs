use std::collections::HashMap;

use base64::Engine;
use http::HeaderMap;
use subtle::ConstantTimeEq;

use crate::config::Auth;

/// Paths that stay reachable without credentials so probes and scrapers
/// keep working.
pub fn exempt(path: &str) -> bool {
    path == "/_healthz" || path == "/_metrics"
}

pub fn check(cfg: &Auth, headers: &HeaderMap) -> bool {
    match cfg.auth_type.to_ascii_lowercase().as_str() {
        "basic" => check_basic(headers, &cfg.users),
        "bearer" | "token" => check_bearer(headers, &cfg.tokens),
        other => {
            log::warn!("unknown auth type: {other}");
            false
        }
    }
}

fn check_basic(headers: &HeaderMap, users: &HashMap<String, String>) -> bool {
    let Some(raw) = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some(encoded) = raw.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(creds) = std::str::from_utf8(&decoded) else {
        return false;
    };
    let Some((user, password)) = creds.split_once(':') else {
        return false;
    };
    match users.get(user) {
        Some(expected) => expected.as_bytes().ct_eq(password.as_bytes()).into(),
        None => false,
    }
}

fn check_bearer(headers: &HeaderMap, tokens: &[String]) -> bool {
    let Some(raw) = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some((scheme, token)) = raw.split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return false;
    }
    tokens
        .iter()
        .any(|valid| bool::from(valid.as_bytes().ct_eq(token.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bearer_cfg(tokens: &[&str]) -> Auth {
        Auth {
            enabled: true,
            auth_type: "bearer".to_string(),
            users: HashMap::new(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn bearer_accepts_listed_token() {
        let cfg = bearer_cfg(&["s3cret", "other"]);
        assert!(check(&cfg, &headers_with_auth("Bearer s3cret")));
        assert!(check(&cfg, &headers_with_auth("bearer other")));
        assert!(!check(&cfg, &headers_with_auth("Bearer wrong")));
        assert!(!check(&cfg, &headers_with_auth("Basic s3cret")));
        assert!(!check(&cfg, &HeaderMap::new()));
    }

    #[test]
    fn basic_checks_user_and_password() {
        let mut users = HashMap::new();
        users.insert("alice".to_string(), "pw".to_string());
        let cfg = Auth {
            enabled: true,
            auth_type: "basic".to_string(),
            users,
            tokens: Vec::new(),
        };
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:pw");
        assert!(check(&cfg, &headers_with_auth(&format!("Basic {encoded}"))));
        let bad = base64::engine::general_purpose::STANDARD.encode("alice:nope");
        assert!(!check(&cfg, &headers_with_auth(&format!("Basic {bad}"))));
    }

    #[test]
    fn health_and_metrics_are_exempt() {
        assert!(exempt("/_healthz"));
        assert!(exempt("/_metrics"));
        assert!(!exempt("/_stats"));
        assert!(!exempt("/debian/x"));
    }
}
