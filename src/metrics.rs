use std::sync::OnceLock;

use http::StatusCode;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn cache_hits_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("silo_cache_hits_total", "Requests served from the cache").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_misses_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("silo_cache_misses_total", "Requests fetched from upstream").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_bypasses_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new(
            "silo_cache_bypasses_total",
            "Responses streamed through without caching",
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn evicted_entries_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("silo_evicted_entries_total", "Entries removed by the janitor")
                .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn evicted_bytes_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("silo_evicted_bytes_total", "Bytes freed by the janitor").unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

fn cache_size_bytes() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGauge::new("silo_cache_size_bytes", "Current cache size").unwrap();
        registry().register(Box::new(gauge.clone())).unwrap();
        gauge
    })
}

fn cache_entries() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGauge::new("silo_cache_entries", "Current cache entry count").unwrap();
        registry().register(Box::new(gauge.clone())).unwrap();
        gauge
    })
}

fn responses_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("silo_responses_total", "Responses by status code"),
            &["code"],
        )
        .unwrap();
        registry().register(Box::new(counter.clone())).unwrap();
        counter
    })
}

pub fn record_hit() {
    cache_hits_total().inc();
}

pub fn record_miss() {
    cache_misses_total().inc();
}

pub fn record_bypass() {
    cache_bypasses_total().inc();
}

pub fn record_eviction(bytes: u64) {
    evicted_entries_total().inc();
    evicted_bytes_total().inc_by(bytes);
}

pub fn record_response(status: StatusCode) {
    responses_total()
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn set_cache_usage(size_bytes: u64, entries: u64) {
    cache_size_bytes().set(size_bytes as i64);
    cache_entries().set(entries as i64);
}

pub fn render() -> String {
    // touch every metric so an idle instance still exports the full set
    let _ = cache_hits_total();
    let _ = cache_misses_total();
    let _ = cache_bypasses_total();
    let _ = evicted_entries_total();
    let _ = evicted_bytes_total();
    let _ = cache_size_bytes();
    let _ = cache_entries();
    let _ = responses_total();

    let families = registry().gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&families, &mut buf).unwrap_or(());
    String::from_utf8(buf).unwrap_or_default()
}
