// Copyright 2025 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End to end request flows through the caching handler against a mock
//! origin and the in-memory store.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use httpdate::fmt_http_date;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sidecache::error::Result;
use sidecache::{
    CacheHandler, CacheOptions, ManualClock, MemCache, ReqHeader, ResponseWriter, Upstream,
};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_time() -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

/// A downstream writer capturing everything for assertions.
#[derive(Default)]
struct TestWriter {
    headers: HeaderMap,
    status: Option<StatusCode>,
    body: BytesMut,
}

impl TestWriter {
    fn new() -> Self {
        Self::default()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn body_str(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    fn warnings(&self) -> Vec<String> {
        self.headers
            .get_all("warning")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .collect()
    }
}

#[async_trait]
impl ResponseWriter for TestWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write_header(&mut self, status: StatusCode) -> Result<()> {
        self.status = Some(status);
        Ok(())
    }

    async fn write_body(&mut self, data: Bytes) -> Result<()> {
        self.body.extend_from_slice(&data);
        Ok(())
    }
}

struct OriginResponse {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Bytes,
}

fn origin_response(status: u16, headers: &[(&str, &str)], body: &str) -> OriginResponse {
    OriginResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: headers
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect(),
        body: Bytes::from(body.to_string()),
    }
}

type Responder = Box<dyn Fn(&ReqHeader) -> OriginResponse + Send + Sync>;

/// A mock origin counting how often it is contacted.
struct Origin {
    hits: AtomicUsize,
    last_request_headers: Mutex<Option<HeaderMap>>,
    responder: Responder,
}

impl Origin {
    fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&ReqHeader) -> OriginResponse + Send + Sync + 'static,
    {
        Arc::new(Origin {
            hits: AtomicUsize::new(0),
            last_request_headers: Mutex::new(None),
            responder: Box::new(responder),
        })
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for Origin {
    async fn serve_http(&self, rw: &mut (dyn ResponseWriter + Send), req: &ReqHeader) -> Result<()> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        *self.last_request_headers.lock() = Some(req.headers.clone());
        let reply = (self.responder)(req);
        for (name, value) in &reply.headers {
            rw.headers_mut().insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                http::HeaderValue::from_str(value).unwrap(),
            );
        }
        rw.write_header(reply.status).await?;
        if !reply.body.is_empty() {
            rw.write_body(reply.body.clone()).await?;
        }
        Ok(())
    }
}

fn build_request(method: &str, uri: &str, headers: &[(&str, &str)]) -> ReqHeader {
    let mut builder = http::request::Builder::new().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(()).unwrap().into_parts().0
}

fn build_handler(origin: Arc<Origin>, clock: &ManualClock, shared: bool) -> CacheHandler {
    let mut options = CacheOptions::default();
    options.shared = shared;
    CacheHandler::with_clock(Arc::new(MemCache::new()), origin, options, clock.clock())
}

async fn do_request(
    handler: &CacheHandler,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
) -> TestWriter {
    let mut rw = TestWriter::new();
    handler
        .serve_http(&mut rw, build_request(method, uri, headers))
        .await
        .unwrap();
    // let the scheduled background writes land before the next request
    handler.drain_writes().await;
    rw
}

#[tokio::test]
async fn test_miss_then_hit() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("Cache-Control", "max-age=60"),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "x",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    let reply = do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("MISS"));
    assert_eq!(reply.body_str(), "x");
    assert_eq!(origin.hits(), 1);

    clock.advance(Duration::from_secs(30));

    let reply = do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("HIT"));
    assert_eq!(reply.header("age"), Some("30"));
    assert_eq!(reply.body_str(), "x");
    // served without contacting the origin again
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_revalidation_merges_headers() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |req| {
            let revalidation = req
                .headers
                .get("if-none-match")
                .map(|v| v == "\"v1\"")
                .unwrap_or(false);
            if revalidation {
                origin_response(304, &[("ETag", "\"v1\""), ("X-Fresh", "yes")], "")
            } else {
                origin_response(
                    200,
                    &[
                        ("ETag", "\"v1\""),
                        ("Cache-Control", "max-age=0"),
                        ("Date", &fmt_http_date(clock.now())),
                    ],
                    "hello",
                )
            }
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    let reply = do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("MISS"));
    assert_eq!(origin.hits(), 1);

    // max-age=0 means every later read revalidates
    let reply = do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(reply.status, Some(StatusCode::OK));
    assert_eq!(reply.header("x-cache"), Some("HIT"));
    assert_eq!(reply.body_str(), "hello");
    // the 304's headers were merged into the served entry
    assert_eq!(reply.header("x-fresh"), Some("yes"));
    assert_eq!(origin.hits(), 2);

    let seen = origin.last_request_headers.lock().clone().unwrap();
    assert_eq!(seen.get("if-none-match").unwrap(), "\"v1\"");
}

#[tokio::test]
async fn test_only_if_cached_misses_with_504() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = Origin::new(|_req| origin_response(200, &[], "never"));
    let handler = build_handler(origin.clone(), &clock, false);

    let reply = do_request(
        &handler,
        "GET",
        "http://example.com/a",
        &[("Cache-Control", "only-if-cached")],
    )
    .await;
    assert_eq!(reply.status, Some(StatusCode::GATEWAY_TIMEOUT));
    assert_eq!(reply.body_str(), "key not in cache\n");
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn test_only_if_cached_requiring_validation_is_504() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("ETag", "\"v1\""),
                    ("Cache-Control", "max-age=0"),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "hello",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(origin.hits(), 1);

    let reply = do_request(
        &handler,
        "GET",
        "http://example.com/a",
        &[("Cache-Control", "only-if-cached")],
    )
    .await;
    assert_eq!(reply.status, Some(StatusCode::GATEWAY_TIMEOUT));
    assert_eq!(reply.body_str(), "key was in cache, but required validation\n");
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_vary_round_trip() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |req| {
            let encoding = req
                .headers
                .get("accept-encoding")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            origin_response(
                200,
                &[
                    ("Cache-Control", "max-age=60"),
                    ("Vary", "Accept-Encoding"),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                &encoding,
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    let reply = do_request(
        &handler,
        "GET",
        "http://example.com/a",
        &[("Accept-Encoding", "gzip")],
    )
    .await;
    assert_eq!(reply.header("x-cache"), Some("MISS"));
    assert_eq!(origin.hits(), 1);

    // a different value for the varied header misses
    let reply = do_request(
        &handler,
        "GET",
        "http://example.com/a",
        &[("Accept-Encoding", "identity")],
    )
    .await;
    assert_eq!(reply.header("x-cache"), Some("MISS"));
    assert_eq!(origin.hits(), 2);

    // the original value hits its variant
    let reply = do_request(
        &handler,
        "GET",
        "http://example.com/a",
        &[("Accept-Encoding", "gzip")],
    )
    .await;
    assert_eq!(reply.header("x-cache"), Some("HIT"));
    assert_eq!(reply.body_str(), "gzip");
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn test_state_changing_request_invalidates() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |req| {
            if req.method == http::Method::POST {
                origin_response(200, &[("Location", "/items/9")], "created")
            } else {
                origin_response(
                    200,
                    &[
                        ("Cache-Control", "max-age=60"),
                        ("Date", &fmt_http_date(clock.now())),
                    ],
                    "listing",
                )
            }
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    do_request(&handler, "GET", "http://example.com/items", &[]).await;
    do_request(&handler, "GET", "http://example.com/items/9", &[]).await;
    assert_eq!(origin.hits(), 2);

    // both cached now
    let reply = do_request(&handler, "GET", "http://example.com/items", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("HIT"));
    assert_eq!(origin.hits(), 2);

    let reply = do_request(&handler, "POST", "http://example.com/items", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("SKIP"));
    assert_eq!(origin.hits(), 3);

    // the request URL and the Location target both became misses
    let reply = do_request(&handler, "GET", "http://example.com/items", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("MISS"));
    let reply = do_request(&handler, "GET", "http://example.com/items/9", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("MISS"));
    assert_eq!(origin.hits(), 5);
}

#[tokio::test]
async fn test_heuristic_freshness_serves_with_warning() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let thirty_days = Duration::from_secs(30 * 24 * 60 * 60);
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("Last-Modified", &fmt_http_date(clock.now() - thirty_days)),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "old but gold",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(origin.hits(), 1);

    clock.advance(Duration::from_secs(2 * 24 * 60 * 60));

    let reply = do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("HIT"));
    assert_eq!(reply.body_str(), "old but gold");
    assert!(reply
        .warnings()
        .iter()
        .any(|w| w.starts_with("113")), "missing heuristic expiration warning: {:?}", reply.warnings());
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_head_served_from_cached_get() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("Cache-Control", "max-age=60"),
                    ("Content-Type", "text/plain"),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "body",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(origin.hits(), 1);

    let reply = do_request(&handler, "HEAD", "http://example.com/a", &[]).await;
    assert_eq!(reply.status, Some(StatusCode::OK));
    assert_eq!(reply.header("x-cache"), Some("HIT"));
    assert_eq!(reply.header("content-type"), Some("text/plain"));
    // headers only, no body, no origin contact
    assert_eq!(reply.body_str(), "");
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_shared_cache_never_stores_private() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("Cache-Control", "private, max-age=60"),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "secret",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, true);

    let reply = do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("SKIP"));
    assert_eq!(origin.hits(), 1);

    // still a miss: nothing was stored
    do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn test_shared_cache_never_stores_authorized_requests() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("Cache-Control", "max-age=60"),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "per-user",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, true);

    let auth = [("Authorization", "Bearer token")];
    let reply = do_request(&handler, "GET", "http://example.com/a", &auth).await;
    assert_eq!(reply.header("x-cache"), Some("SKIP"));

    do_request(&handler, "GET", "http://example.com/a", &auth).await;
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn test_shared_cache_strips_private_headers() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("Cache-Control", "private=\"X-Account\", max-age=60"),
                    ("Set-Cookie", "session=1"),
                    ("X-Account", "42"),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "page",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, true);

    do_request(&handler, "GET", "http://example.com/a", &[]).await;

    let reply = do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("HIT"));
    assert_eq!(origin.hits(), 1);
    assert!(reply.header("set-cookie").is_none());
    assert!(reply.header("x-account").is_none());
}

#[tokio::test]
async fn test_max_stale_serves_stale_with_warning() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("Cache-Control", "max-age=5"),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "aged",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    do_request(&handler, "GET", "http://example.com/a", &[]).await;
    clock.advance(Duration::from_secs(100));

    let reply = do_request(
        &handler,
        "GET",
        "http://example.com/a",
        &[("Cache-Control", "max-stale")],
    )
    .await;
    assert_eq!(reply.header("x-cache"), Some("HIT"));
    assert!(reply.warnings().iter().any(|w| w.starts_with("110")));
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_missing_host_is_bad_request() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = Origin::new(|_req| origin_response(200, &[], "x"));
    let handler = build_handler(origin.clone(), &clock, false);

    let mut rw = TestWriter::new();
    let (parts, _) = http::request::Builder::new()
        .method("GET")
        .uri("/a")
        .version(http::Version::HTTP_11)
        .body(())
        .unwrap()
        .into_parts();
    handler.serve_http(&mut rw, parts).await.unwrap();

    assert_eq!(rw.status, Some(StatusCode::BAD_REQUEST));
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn test_head_pipe_freshens_get_entry() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |req| {
            let headers = [
                ("Cache-Control", "max-age=60".to_string()),
                ("Date", fmt_http_date(clock.now())),
                (
                    "X-Generation",
                    if req.method == http::Method::HEAD {
                        "2".to_string()
                    } else {
                        "1".to_string()
                    },
                ),
            ];
            let headers: Vec<(&str, &str)> = headers
                .iter()
                .map(|(n, v)| (*n, v.as_str()))
                .collect();
            origin_response(200, &headers, if req.method == http::Method::HEAD { "" } else { "body" })
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(origin.hits(), 1);

    // an uncacheable HEAD pipes through and refreshes the stored headers
    let reply = do_request(
        &handler,
        "HEAD",
        "http://example.com/a",
        &[("Cache-Control", "no-cache")],
    )
    .await;
    assert_eq!(reply.header("x-cache"), Some("SKIP"));
    assert_eq!(origin.hits(), 2);

    let reply = do_request(&handler, "GET", "http://example.com/a", &[]).await;
    assert_eq!(reply.header("x-cache"), Some("HIT"));
    assert_eq!(reply.header("x-generation"), Some("2"));
    // freshen replaced headers only, the body survives
    assert_eq!(reply.body_str(), "body");
    assert_eq!(origin.hits(), 2);
}

#[tokio::test]
async fn test_range_request_served_from_cache() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("Cache-Control", "max-age=60"),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "hello world",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    do_request(&handler, "GET", "http://example.com/a", &[]).await;

    let reply = do_request(
        &handler,
        "GET",
        "http://example.com/a",
        &[("Range", "bytes=6-")],
    )
    .await;
    assert_eq!(reply.status, Some(StatusCode::PARTIAL_CONTENT));
    assert_eq!(reply.header("content-range"), Some("bytes 6-10/11"));
    assert_eq!(reply.body_str(), "world");
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_conditional_request_served_304_from_cache() {
    init_log();
    let clock = ManualClock::start_at(start_time());
    let origin = {
        let clock = clock.clone();
        Origin::new(move |_req| {
            origin_response(
                200,
                &[
                    ("Cache-Control", "max-age=60"),
                    ("ETag", "\"v1\""),
                    ("Date", &fmt_http_date(clock.now())),
                ],
                "hello",
            )
        })
    };
    let handler = build_handler(origin.clone(), &clock, false);

    do_request(&handler, "GET", "http://example.com/a", &[]).await;

    let reply = do_request(
        &handler,
        "GET",
        "http://example.com/a",
        &[("If-None-Match", "\"v1\"")],
    )
    .await;
    assert_eq!(reply.status, Some(StatusCode::NOT_MODIFIED));
    assert_eq!(reply.body_str(), "");
    assert_eq!(origin.hits(), 1);
}
