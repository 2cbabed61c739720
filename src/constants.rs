/// Response header carrying the cache outcome: HIT, MISS or BYPASS.
pub const X_CACHE: &str = "X-Cache";

/// Response header carrying the freshness of a hit: FRESH or STALE.
pub const X_CACHE_STATUS: &str = "X-Cache-Status";

/// Response header naming the policy that matched the request.
pub const X_CACHE_POLICY: &str = "X-Cache-Policy";

/// File name of the durable index inside the cache directory.
pub const INDEX_DB_FILE: &str = "index.db";

/// Directory of human-readable symlinks inside the cache directory.
pub const BY_PATH_DIR: &str = "by-path";
