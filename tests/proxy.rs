mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use support::*;

#[tokio::test]
async fn cold_miss_then_hot_hit() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let proxy = TestProxy::start(
        vec![catch_all_policy(Duration::from_secs(3600))],
        move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            ok_response(b"HELLO", &[("ETag", "\"v1\""), ("Content-Type", "text/plain")])
        },
    )
    .await;

    let resp = proxy.get("/u/x").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.header("X-Cache"), "MISS");
    assert_eq!(resp.header("X-Cache-Policy"), "all");
    assert_eq!(&resp.body[..], b"HELLO");

    wait_for_entries(&proxy, "u", 1).await;

    let resp = proxy.get("/u/x").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.header("X-Cache"), "HIT");
    assert_eq!(resp.header("X-Cache-Status"), "FRESH");
    assert_eq!(resp.header("Content-Type"), "text/plain");
    assert_eq!(resp.header("Content-Length"), "5");
    assert_eq!(&resp.body[..], b"HELLO");

    assert_eq!(hits.load(Ordering::SeqCst), 1, "upstream fetched once");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_coalesce_into_one_fetch() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);
    let payload = vec![b'Z'; 1024];
    let body = payload.clone();
    let proxy = Arc::new(
        TestProxy::start(
            vec![catch_all_policy(Duration::from_secs(3600))],
            move |_req| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
                ok_response(&body, &[])
            },
        )
        .await,
    );

    let mut clients = Vec::new();
    for _ in 0..10 {
        let proxy = Arc::clone(&proxy);
        clients.push(tokio::spawn(async move { proxy.get("/u/big").await }));
    }

    for client in clients {
        let resp = client.await.expect("client task");
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], &payload[..]);
    }

    assert_eq!(fetches.load(Ordering::SeqCst), 1, "exactly one upstream fetch");
    wait_for_entries(&proxy, "u", 1).await;
}

#[tokio::test]
async fn large_body_streams_intact_through_miss_and_hit() {
    let payload = gen_bytes(1 << 20);
    let body = payload.clone();
    let proxy = TestProxy::start(
        vec![catch_all_policy(Duration::from_secs(3600))],
        move |_req| ok_response(&body, &[]),
    )
    .await;

    let resp = proxy.get("/u/pool/large.deb").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.header("X-Cache"), "MISS");
    assert_eq!(&resp.body[..], &payload[..]);

    wait_for_entries(&proxy, "u", 1).await;

    let resp = proxy.get("/u/pool/large.deb").await;
    assert_eq!(resp.header("X-Cache"), "HIT");
    assert_eq!(resp.header("Content-Length"), (1 << 20).to_string());
    assert_eq!(&resp.body[..], &payload[..]);
}

#[tokio::test]
async fn no_store_bypasses_the_cache() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);
    let proxy = TestProxy::start(
        vec![catch_all_policy(Duration::from_secs(3600))],
        move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            ok_response(b"SECRET", &[("Cache-Control", "no-store")])
        },
    )
    .await;

    let resp = proxy.get("/u/token").await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.header("X-Cache"), "BYPASS");
    assert_eq!(&resp.body[..], b"SECRET");

    // nothing may land on disk, and the next request goes upstream again
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!proxy.cache_dir().join("u").exists());

    let resp = proxy.get("/u/token").await;
    assert_eq!(resp.header("X-Cache"), "BYPASS");
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn private_responses_are_not_cached() {
    let proxy = TestProxy::start(
        vec![catch_all_policy(Duration::from_secs(3600))],
        |_req| ok_response(b"MINE", &[("Cache-Control", "private, max-age=60")]),
    )
    .await;

    let resp = proxy.get("/u/private").await;
    assert_eq!(resp.header("X-Cache"), "BYPASS");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!proxy.cache_dir().join("u").exists());
}

#[tokio::test]
async fn non_200_passes_through_uncached() {
    let proxy = TestProxy::start(vec![catch_all_policy(Duration::from_secs(3600))], |_req| {
        http::Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(http_body_util::Full::new(bytes::Bytes::from_static(
                b"no such package",
            )))
            .unwrap()
    })
    .await;

    let resp = proxy.get("/u/missing.deb").await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
    assert_eq!(resp.header("X-Cache"), "MISS");
    assert_eq!(&resp.body[..], b"no such package");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!proxy.cache_dir().join("u").exists());
}

#[tokio::test]
async fn hop_by_hop_headers_are_not_forwarded() {
    let proxy = TestProxy::start(vec![catch_all_policy(Duration::from_secs(3600))], |_req| {
        ok_response(b"X", &[("Keep-Alive", "timeout=5"), ("X-Origin", "mock")])
    })
    .await;

    let resp = proxy.get("/u/h").await;
    assert_eq!(resp.header("X-Origin"), "mock");
    assert!(resp.headers.get("Keep-Alive").is_none());
}

#[tokio::test]
async fn unknown_prefix_is_404() {
    let proxy = TestProxy::start(vec![catch_all_policy(Duration::from_secs(3600))], |_req| {
        ok_response(b"X", &[])
    })
    .await;

    let resp = proxy.get("/fedora/pkg.rpm").await;
    assert_eq!(resp.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unmatched_policy_is_a_config_error() {
    let proxy = TestProxy::start(
        vec![policy("debs", r"\.deb$", Duration::from_secs(3600), false)],
        |_req| ok_response(b"X", &[]),
    )
    .await;

    let resp = proxy.get("/u/README.txt").await;
    assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn path_traversal_is_rejected() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);
    let proxy = TestProxy::start(
        vec![catch_all_policy(Duration::from_secs(3600))],
        move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            ok_response(b"X", &[])
        },
    )
    .await;

    let resp = proxy.get("/u/../secrets").await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert_eq!(fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connect_method_is_rejected() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let proxy = TestProxy::start(vec![catch_all_policy(Duration::from_secs(3600))], |_req| {
        ok_response(b"X", &[])
    })
    .await;

    let mut stream = tokio::net::TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();
    let mut buf = vec![0u8; 1024];
    let n = stream.read(&mut buf).await.unwrap();
    let head = String::from_utf8_lossy(&buf[..n]);
    assert!(head.starts_with("HTTP/1.1 405"), "got: {head}");
}

#[tokio::test]
async fn post_to_proxy_surface_is_rejected() {
    let proxy = TestProxy::start(vec![catch_all_policy(Duration::from_secs(3600))], |_req| {
        ok_response(b"X", &[])
    })
    .await;

    let resp = proxy
        .request(
            Method::POST,
            "/u/upload",
            http::HeaderMap::new(),
            bytes::Bytes::new(),
        )
        .await;
    assert_eq!(resp.status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn head_serves_headers_without_body() {
    let proxy = TestProxy::start(vec![catch_all_policy(Duration::from_secs(3600))], |_req| {
        ok_response(b"HELLO", &[("Content-Type", "text/plain")])
    })
    .await;

    let resp = proxy
        .request(
            Method::HEAD,
            "/u/head",
            http::HeaderMap::new(),
            bytes::Bytes::new(),
        )
        .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert!(resp.body.is_empty());

    // the HEAD fill still published the entry
    wait_for_entries(&proxy, "u", 1).await;
    let resp = proxy.get("/u/head").await;
    assert_eq!(resp.header("X-Cache"), "HIT");
    assert_eq!(&resp.body[..], b"HELLO");
}

#[tokio::test]
async fn query_string_distinguishes_cache_entries() {
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);
    let proxy = TestProxy::start(
        vec![catch_all_policy(Duration::from_secs(3600))],
        move |req| {
            counter.fetch_add(1, Ordering::SeqCst);
            let body = req.uri().query().unwrap_or("none").to_string();
            ok_response(body.as_bytes(), &[])
        },
    )
    .await;

    let resp = proxy.get("/u/pkg?arch=amd64").await;
    assert_eq!(&resp.body[..], b"arch=amd64");
    wait_for_entries(&proxy, "u", 1).await;

    let resp = proxy.get("/u/pkg?arch=arm64").await;
    assert_eq!(&resp.body[..], b"arch=arm64");
    assert_eq!(fetches.load(Ordering::SeqCst), 2);

    wait_for_entries(&proxy, "u", 2).await;
    let resp = proxy.get("/u/pkg?arch=amd64").await;
    assert_eq!(resp.header("X-Cache"), "HIT");
    assert_eq!(&resp.body[..], b"arch=amd64");
}
