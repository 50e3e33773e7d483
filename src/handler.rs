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

//! The decision engine: the caching lifecycle of one request
//!
//! Each request is classified, looked up, freshness-checked and then served
//! from cache, revalidated, passed upstream with capture, or piped through
//! untouched. Writes back into the cache always happen off the request path.

use bytes::Bytes;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use httpdate::fmt_http_date;
use log::{debug, error};
use std::cmp;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::buffer::{ResponseBuffer, ResponseWriter};
use crate::cache_control::CacheControl;
use crate::clock::Clock;
use crate::config::CacheOptions;
use crate::error::{Error, ErrorType, Result};
use crate::key::{CacheKey, RewriteRule};
use crate::resource::{int_header, time_header, Resource};
use crate::serve;
use crate::storage::{Lookup, Storage};
use crate::validator::{Validation, Validator};
use crate::writers::{WritePool, WriteTask};
use crate::{ReqHeader, Upstream, CACHE_HEADER, PROXY_DATE_HEADER};

// Statuses that may be written to the cache at all.
// https://datatracker.ietf.org/doc/html/rfc7234#section-3
fn storeable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 203 | 300 | 301 | 302 | 404 | 410)
}

// Statuses that may be cached without explicit freshness or `public`.
fn cacheable_by_default_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 200 | 203 | 206 | 300 | 301 | 302 | 304 | 410)
}

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// The per-request view the engine works from: the request itself, its
/// primary cache key, the parsed request directives and the arrival time.
#[derive(Debug)]
pub(crate) struct CacheRequest {
    pub(crate) req: ReqHeader,
    pub(crate) key: CacheKey,
    pub(crate) time: SystemTime,
    pub(crate) cache_control: CacheControl,
}

impl CacheRequest {
    fn new(req: ReqHeader, rules: &[RewriteRule], now: SystemTime) -> Result<Self> {
        if req.version == Version::HTTP_11
            && req.uri.authority().is_none()
            && !req.headers.contains_key(header::HOST)
        {
            return Error::e_explain(ErrorType::MalformedRequest, "Host header can't be empty");
        }
        let key = CacheKey::from_request(&req, rules);
        let cache_control = CacheControl::from_headers(&req.headers);
        Ok(CacheRequest {
            req,
            key,
            time: now,
            cache_control,
        })
    }

    // Only a GET or HEAD free of update preconditions may read the cache.
    fn is_cacheable(&self) -> bool {
        if !matches!(self.req.method, Method::GET | Method::HEAD) {
            return false;
        }
        if self.req.headers.contains_key(header::IF_MATCH)
            || self.req.headers.contains_key(header::IF_UNMODIFIED_SINCE)
            || self.req.headers.contains_key(header::IF_RANGE)
        {
            return false;
        }
        if let Some(max_age) = self.cache_control.get("max-age") {
            if max_age.parse_as_bytes() == b"0" {
                return false;
            }
        }
        if self.cache_control.no_store() || self.cache_control.no_cache() {
            return false;
        }
        true
    }

    fn is_state_changing(&self) -> bool {
        matches!(self.req.method, Method::POST | Method::PUT | Method::DELETE)
    }
}

/// The caching intermediary.
///
/// Sits between a downstream [ResponseWriter] and an upstream origin
/// handler, serving from the given [Storage] whenever HTTP caching
/// semantics allow it.
pub struct CacheHandler {
    shared: bool,
    storage: Arc<dyn Storage>,
    upstream: Arc<dyn Upstream>,
    validator: Validator,
    rewrites: Vec<RewriteRule>,
    store_id_url: Option<Uri>,
    clock: Clock,
    writes: WritePool,
}

impl CacheHandler {
    /// Create a handler over the given storage and upstream.
    ///
    /// Must be called within a tokio runtime: the background write pool
    /// spawns its workers here.
    pub fn new(
        storage: Arc<dyn Storage>,
        upstream: Arc<dyn Upstream>,
        options: CacheOptions,
    ) -> Self {
        Self::with_clock(storage, upstream, options, Clock::system())
    }

    /// Like [CacheHandler::new] with a caller-provided [Clock].
    pub fn with_clock(
        storage: Arc<dyn Storage>,
        upstream: Arc<dyn Upstream>,
        options: CacheOptions,
        clock: Clock,
    ) -> Self {
        let writes = WritePool::new(
            storage.clone(),
            options.write_workers,
            options.write_queue_depth,
        );
        let store_id_url = options.store_id_endpoint();
        CacheHandler {
            shared: options.shared,
            validator: Validator::new(upstream.clone()),
            storage,
            upstream,
            rewrites: options.rewrites,
            store_id_url,
            clock,
            writes,
        }
    }

    /// Whether this handler runs with shared cache semantics.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// The configured key-rewrite service endpoint.
    ///
    /// Reserved hook: retained for a future external store-id integration,
    /// key building currently does not consult it.
    pub fn store_id_url(&self) -> Option<&Uri> {
        self.store_id_url.as_ref()
    }

    /// Wait for all scheduled background cache writes to land.
    ///
    /// Call before process shutdown so no store or invalidation is lost.
    pub async fn drain_writes(&self) {
        self.writes.drain().await
    }

    /// Handle one request.
    ///
    /// Safe to call concurrently from many connections; all shared state is
    /// behind the storage backend and the write pool.
    pub async fn serve_http(
        &self,
        rw: &mut (dyn ResponseWriter + Send),
        req: ReqHeader,
    ) -> Result<()> {
        let creq = match CacheRequest::new(req, &self.rewrites, self.clock.now()) {
            Ok(creq) => creq,
            Err(e) => {
                return respond_error(
                    rw,
                    StatusCode::BAD_REQUEST,
                    &format!("invalid request: {e}"),
                )
                .await;
            }
        };

        if !creq.is_cacheable() {
            debug!("request not cacheable");
            rw.headers_mut().insert(
                HeaderName::from_static(CACHE_HEADER),
                HeaderValue::from_static("SKIP"),
            );
            return self.pipe_upstream(rw, &creq).await;
        }

        let found = match self.lookup(&creq).await {
            Ok(found) => found,
            Err(e) => {
                error!("cache lookup for {} failed: {}", creq.key.encode(), e);
                return respond_error(
                    rw,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("lookup error: {e}"),
                )
                .await;
            }
        };

        let cache_type = if self.shared { "shared" } else { "private" };

        let Some(mut res) = found else {
            if creq.cache_control.only_if_cached() {
                return respond_error(rw, StatusCode::GATEWAY_TIMEOUT, "key not in cache").await;
            }
            debug!(
                "{} {} not in {} cache",
                creq.req.method, creq.req.uri, cache_type
            );
            return self.pass_upstream(rw, &creq).await;
        };
        debug!(
            "{} {} found in {} cache",
            creq.req.method, creq.req.uri, cache_type
        );

        if self.needs_validation(&res, &creq, self.clock.now()) {
            if creq.cache_control.only_if_cached() {
                return respond_error(
                    rw,
                    StatusCode::GATEWAY_TIMEOUT,
                    "key was in cache, but required validation",
                )
                .await;
            }

            debug!("validating cached response");
            match self.validator.validate(&creq.req, &res).await {
                Validation::Fresh(headers) => {
                    debug!("response is valid");
                    res.merge_headers(&headers);
                    self.writes
                        .submit(WriteTask::Freshen {
                            res: res.clone(),
                            key: creq.key.encode(),
                        })
                        .await;
                }
                Validation::Modified => {
                    debug!("response is changed");
                    return self.pass_upstream(rw, &creq).await;
                }
            }
        }

        debug!("serving from cache");
        self.serve_resource(rw, &res, &creq).await
    }

    // Find the best stored response for the request: primary key first, a
    // HEAD falling back to the GET entry, and a secondary lookup when the
    // stored response varies.
    async fn lookup(&self, creq: &CacheRequest) -> Result<Option<Resource>> {
        let primary = match self.storage.lookup(&creq.key.encode()).await? {
            Lookup::Hit(res) => Some(res),
            Lookup::Empty => {
                debug!("zero length entry under {}, treating as a miss", creq.key.encode());
                None
            }
            Lookup::Miss => None,
        };

        let res = match primary {
            Some(res) => res,
            None => {
                if creq.req.method != Method::HEAD {
                    return Ok(None);
                }
                // a HEAD may reuse the GET entry if the entry names its own
                // lifetime and the HEAD itself could be cached
                return match self
                    .storage
                    .lookup(&creq.key.for_method(Method::GET).encode())
                    .await?
                {
                    Lookup::Hit(res)
                        if res.has_explicit_expiration(self.shared) && creq.is_cacheable() =>
                    {
                        debug!("using cached GET response for serving HEAD");
                        Ok(Some(res))
                    }
                    _ => Ok(None),
                };
            }
        };

        let vary = res
            .headers()
            .get(header::VARY)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        if let Some(vary) = vary {
            let vary_key = creq.key.vary(&vary, &creq.req).encode();
            debug!("secondary lookup with vary key {}", vary_key);
            return match self.storage.lookup(&vary_key).await? {
                Lookup::Hit(res) => Ok(Some(res)),
                Lookup::Empty | Lookup::Miss => Ok(None),
            };
        }

        Ok(Some(res))
    }

    // The remaining freshness lifetime in whole seconds, negative once the
    // age exceeds the lifetime. None when no lifetime can be established
    // (an unparseable directive, or no date to compute the age from).
    fn freshness(&self, res: &Resource, creq: &CacheRequest, now: SystemTime) -> Option<i64> {
        let mut max_age = match res.max_age(self.shared) {
            Ok(Some(d)) => d.as_secs() as i64,
            // no explicit lifetime; heuristic freshness below may still apply
            Ok(None) => 0,
            Err(e) => {
                debug!("error calculating max-age: {}", e);
                return None;
            }
        };

        if creq.cache_control.has("max-age") {
            match creq.cache_control.duration("max-age") {
                Ok(Some(req_max_age)) => {
                    let req_max_age = req_max_age.as_secs() as i64;
                    if req_max_age < max_age {
                        debug!("using request max-age of {}s", req_max_age);
                        max_age = req_max_age;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("error parsing request max-age: {}", e);
                    return None;
                }
            }
        }

        let age = match res.age(now) {
            Ok(age) => age.as_secs() as i64,
            Err(e) => {
                debug!("error calculating age: {}", e);
                return None;
            }
        };

        if res.is_stale(now) {
            return Some(0);
        }

        let heuristic = res.heuristic_freshness(now).as_secs() as i64;
        if heuristic > max_age {
            debug!("using heuristic freshness of {}s", heuristic);
            max_age = heuristic;
        }

        Some(max_age - age)
    }

    fn needs_validation(&self, res: &Resource, creq: &CacheRequest, now: SystemTime) -> bool {
        if res.must_validate(self.shared) {
            return true;
        }

        let Some(freshness) = self.freshness(res, creq, now) else {
            debug!("freshness unknown, validation required");
            return true;
        };

        if creq.cache_control.has("min-fresh") {
            match creq.cache_control.duration("min-fresh") {
                Ok(Some(min_fresh)) => {
                    if freshness < min_fresh.as_secs() as i64 {
                        debug!(
                            "fresh, but won't satisfy min-fresh of {}s",
                            min_fresh.as_secs()
                        );
                        return true;
                    }
                }
                _ => {
                    debug!("error parsing request min-fresh");
                    return true;
                }
            }
        }

        debug!("resource has a freshness of {}s", freshness);

        if freshness <= 0 && creq.cache_control.has("max-stale") {
            if !creq.cache_control.has_value_for("max-stale") {
                debug!("stale, but client sent max-stale");
                return false;
            }
            if let Ok(Some(max_stale)) = creq.cache_control.duration("max-stale") {
                if max_stale.as_secs() as i64 >= -freshness {
                    debug!(
                        "stale, but within allowed max-stale period of {}s",
                        max_stale.as_secs()
                    );
                    return false;
                }
            }
        }

        freshness <= 0
    }

    // Whether the captured upstream response may be written to the cache
    // for this request.
    fn is_response_cacheable(&self, res: &Resource, creq: &CacheRequest, now: SystemTime) -> bool {
        let cc = res.cache_control();

        if cc.no_cache() || cc.no_store() {
            return false;
        }

        // the blanket `private`; the field-name form stores with the named
        // headers stripped instead
        if self.shared && cc.private() {
            return false;
        }

        if !storeable_status(res.status()) {
            return false;
        }

        if self.shared && creq.req.headers.contains_key(header::AUTHORIZATION) {
            return false;
        }

        if self.shared
            && res.headers().contains_key(header::AUTHORIZATION)
            && !cc.must_revalidate()
            && !cc.has("s-maxage")
        {
            return false;
        }

        if res.has_explicit_expiration(self.shared) {
            return true;
        }

        if !cacheable_by_default_status(res.status()) && !cc.public() {
            return false;
        }

        res.has_validators() || res.heuristic_freshness(now) > Duration::ZERO
    }

    // Forward the request and capture the reply for possible admission.
    async fn pass_upstream(
        &self,
        rw: &mut (dyn ResponseWriter + Send),
        creq: &CacheRequest,
    ) -> Result<()> {
        let mut buffer = ResponseBuffer::new(rw);
        let request_time = creq.time;
        debug!("passing request upstream");
        buffer.headers_mut().insert(
            HeaderName::from_static(CACHE_HEADER),
            HeaderValue::from_static("MISS"),
        );
        self.upstream.serve_http(&mut buffer, &creq.req).await?;
        let response_time = self.clock.now();
        let mut res = buffer.resource();
        debug!(
            "upstream responded in {:?}",
            response_time.duration_since(request_time).unwrap_or_default()
        );

        if !self.is_response_cacheable(&res, creq, response_time) {
            debug!("resource is uncacheable");
            buffer.headers_mut().insert(
                HeaderName::from_static(CACHE_HEADER),
                HeaderValue::from_static("SKIP"),
            );
            return Ok(());
        }

        let now = self.clock.now();
        match corrected_age(res.headers(), request_time, response_time, now) {
            Some(age) => {
                res.headers_mut()
                    .insert(header::AGE, HeaderValue::from(ceil_secs(age)));
            }
            None => debug!("cannot compute corrected age without a valid Date"),
        }
        if let Ok(proxy_date) = HeaderValue::from_str(&fmt_http_date(now)) {
            res.headers_mut()
                .insert(HeaderName::from_static(PROXY_DATE_HEADER), proxy_date);
        }

        let mut keys = vec![creq.key.encode()];
        if let Some(vary) = res
            .headers()
            .get(header::VARY)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            let vary_key = creq.key.vary(vary, &creq.req).encode();
            debug!("also storing under vary key {}", vary_key);
            keys.push(vary_key);
        }

        if self.shared {
            res.remove_private_headers();
        }
        self.writes.submit(WriteTask::Store { res, keys }).await;
        Ok(())
    }

    // Forward the request without admission; the reply can still refresh or
    // invalidate what is stored.
    async fn pipe_upstream(
        &self,
        rw: &mut (dyn ResponseWriter + Send),
        creq: &CacheRequest,
    ) -> Result<()> {
        let mut buffer = ResponseBuffer::new(rw);
        debug!("piping request upstream");
        self.upstream.serve_http(&mut buffer, &creq.req).await?;

        if creq.req.method == Method::HEAD {
            // a HEAD reply carries current headers for the GET entry
            let res = buffer.resource();
            self.writes
                .submit(WriteTask::Freshen {
                    res,
                    key: creq.key.for_method(Method::GET).encode(),
                })
                .await;
        } else if creq.is_state_changing() {
            let res = buffer.resource();
            if res.is_non_error_status() {
                self.invalidate(&res, creq).await;
            }
        }
        Ok(())
    }

    // A successful state-changing request invalidates the entries for its
    // own URL and for any Location / Content-Location target it names on
    // the same host.
    async fn invalidate(&self, res: &Resource, creq: &CacheRequest) {
        let mut keys = Vec::new();
        keys.extend(read_side_keys(&creq.key));
        for name in [header::LOCATION, header::CONTENT_LOCATION] {
            if let Some(target) = res.headers().get(name).and_then(|v| v.to_str().ok()) {
                match creq.key.for_url(target) {
                    Some(key) => keys.extend(read_side_keys(&key)),
                    None => debug!("not invalidating foreign target {:?}", target),
                }
            }
        }
        debug!("invalidating {:?}", keys);
        self.writes.submit(WriteTask::Purge { keys }).await;
    }

    // Emit the stored response downstream with age accounting and warnings.
    async fn serve_resource(
        &self,
        rw: &mut (dyn ResponseWriter + Send),
        res: &Resource,
        creq: &CacheRequest,
    ) -> Result<()> {
        let now = self.clock.now();

        for (name, value) in res.headers() {
            rw.headers_mut().append(name.clone(), value.clone());
        }

        let age = match res.age(now) {
            Ok(age) => age,
            Err(e) => {
                return respond_error(
                    rw,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("error calculating age: {e}"),
                )
                .await;
            }
        };

        // https://httpwg.github.io/specs/rfc7234.html#warn.113
        if age > ONE_DAY && res.heuristic_freshness(now) > ONE_DAY {
            rw.headers_mut().append(
                header::WARNING,
                HeaderValue::from_static(r#"113 - "Heuristic Expiration""#),
            );
        }

        // https://httpwg.github.io/specs/rfc7234.html#warn.110
        if self.freshness(res, creq, now).map_or(true, |f| f <= 0) {
            rw.headers_mut().append(
                header::WARNING,
                HeaderValue::from_static(r#"110 - "Response is Stale""#),
            );
        }

        debug!("serving a {}s old response", age.as_secs());
        rw.headers_mut()
            .insert(header::AGE, HeaderValue::from(age.as_secs()));
        if let Ok(via) = HeaderValue::from_str(&res.via()) {
            rw.headers_mut().insert(header::VIA, via);
        }
        rw.headers_mut().insert(
            HeaderName::from_static(CACHE_HEADER),
            HeaderValue::from_static("HIT"),
        );

        if res.status() == StatusCode::OK {
            serve::serve_content(rw, &creq.req, res).await
        } else {
            rw.write_header(res.status()).await?;
            if creq.req.method != Method::HEAD {
                rw.write_body(res.body().clone()).await?;
            }
            Ok(())
        }
    }
}

fn read_side_keys(key: &CacheKey) -> [String; 2] {
    [
        key.for_method(Method::GET).encode(),
        key.for_method(Method::HEAD).encode(),
    ]
}

async fn respond_error(
    rw: &mut (dyn ResponseWriter + Send),
    status: StatusCode,
    msg: &str,
) -> Result<()> {
    let headers = rw.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(msg.len() + 1));
    rw.write_header(status).await?;
    rw.write_body(Bytes::from(format!("{msg}\n"))).await
}

// RFC 7234 §4.2.3: the age of a captured response corrected for upstream
// clock skew and the round-trip delay. None when the reply has no usable
// Date header.
fn corrected_age(
    headers: &HeaderMap,
    request_time: SystemTime,
    response_time: SystemTime,
    now: SystemTime,
) -> Option<Duration> {
    let date = time_header(headers, header::DATE)?;
    let apparent_age = response_time.duration_since(date).unwrap_or_default();
    let response_delay = response_time
        .duration_since(request_time)
        .unwrap_or_default();
    let stated_age = int_header(headers, header::AGE)
        .map(Duration::from_secs)
        .unwrap_or_default();
    let corrected = cmp::max(apparent_age, stated_age + response_delay);
    let resident = now.duration_since(response_time).unwrap_or_default();
    Some(corrected + resident)
}

fn ceil_secs(d: Duration) -> u64 {
    if d.subsec_nanos() > 0 {
        d.as_secs() + 1
    } else {
        d.as_secs()
    }
}
