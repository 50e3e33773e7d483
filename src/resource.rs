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

//! The stored response and its derived cache metadata

use bytes::Bytes;
use http::header::{self, AsHeaderName, HeaderMap, HeaderName};
use http::StatusCode;
use std::time::{Duration, SystemTime};

use crate::cache_control::CacheControl;
use crate::error::{Error, ErrorType, Result};
use crate::PROXY_DATE_HEADER;

/// The Via pseudonym this layer adds when serving from cache.
pub const VIA_PSEUDONYM: &str = "1.1 sidecache";

/// Parse the named header as an HTTP date.
pub(crate) fn time_header(headers: &HeaderMap, name: impl AsHeaderName) -> Option<SystemTime> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| httpdate::parse_http_date(s).ok())
}

/// Parse the named header as a non-negative integer.
pub(crate) fn int_header(headers: &HeaderMap, name: impl AsHeaderName) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// A response held by (or on its way into) the cache: status, the full
/// header map and the complete body.
///
/// All cache metadata (age, freshness lifetime, validators) is derived from
/// the headers on demand; nothing about the entry is stored out of band, so
/// a [Resource] round-trips through any [crate::storage::Storage] untouched.
#[derive(Debug, Clone)]
pub struct Resource {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Resource {
    /// Create a [Resource] from the response pieces.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Resource {
            status,
            headers,
            body,
        }
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The stored header map.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The stored header map, mutable.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Replace the stored header map, keeping status and body.
    pub fn set_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    /// The stored body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Parse the stored `Cache-Control` header.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::from_headers(&self.headers)
    }

    /// How old this response is at `now`.
    ///
    /// The stated `Age` plus residence time since `Proxy-Date` when this
    /// layer stamped one, otherwise the time since the origin `Date`.
    /// A response with neither date has no computable age.
    pub fn age(&self, now: SystemTime) -> Result<Duration> {
        let stated = int_header(&self.headers, header::AGE)
            .map(Duration::from_secs)
            .unwrap_or_default();
        if let Some(proxy_date) = time_header(&self.headers, PROXY_DATE_HEADER) {
            let resident = now.duration_since(proxy_date).unwrap_or_default();
            return Ok(stated + resident);
        }
        if let Some(date) = time_header(&self.headers, header::DATE) {
            return Ok(now.duration_since(date).unwrap_or_default());
        }
        Error::e_explain(
            ErrorType::InvalidHTTPHeader,
            "unable to calculate age without Date or Proxy-Date",
        )
    }

    /// The explicit freshness lifetime, `s-maxage` taking precedence over
    /// `max-age` for a shared cache.
    ///
    /// `Ok(None)` means no explicit max-age exists.
    pub fn max_age(&self, shared: bool) -> Result<Option<Duration>> {
        let cc = self.cache_control();
        if shared {
            if let Some(d) = cc.duration("s-maxage")? {
                return Ok(Some(d));
            }
        }
        cc.duration("max-age")
    }

    /// Freshness lifetime derived from `Last-Modified` alone: a tenth of the
    /// interval between the last modification and `now`.
    pub fn heuristic_freshness(&self, now: SystemTime) -> Duration {
        match self.last_modified() {
            Some(last_modified) => now.duration_since(last_modified).unwrap_or_default() / 10,
            None => Duration::ZERO,
        }
    }

    /// Whether the response names its own freshness lifetime, via
    /// `Cache-Control` or an `Expires` header.
    pub fn has_explicit_expiration(&self, shared: bool) -> bool {
        let cc = self.cache_control();
        if cc.has("max-age") || (shared && cc.has("s-maxage")) {
            return true;
        }
        self.headers.contains_key(header::EXPIRES)
    }

    /// Whether the response carries an `ETag` or `Last-Modified` validator.
    pub fn has_validators(&self) -> bool {
        self.headers.contains_key(header::ETAG) || self.headers.contains_key(header::LAST_MODIFIED)
    }

    /// Whether the response directives forbid serving without revalidation.
    pub fn must_validate(&self, shared: bool) -> bool {
        let cc = self.cache_control();
        cc.no_cache() || cc.must_revalidate() || (shared && cc.proxy_revalidate())
    }

    /// Whether an `Expires` header in the past marks this response stale.
    /// A `max-age` directive overrides `Expires`.
    pub fn is_stale(&self, now: SystemTime) -> bool {
        if self.cache_control().has("max-age") {
            return false;
        }
        match time_header(&self.headers, header::EXPIRES) {
            Some(expires) => expires < now,
            None => false,
        }
    }

    /// The parsed `Last-Modified` header.
    pub fn last_modified(&self) -> Option<SystemTime> {
        time_header(&self.headers, header::LAST_MODIFIED)
    }

    /// The parsed origin `Date` header.
    pub fn date(&self) -> Option<SystemTime> {
        time_header(&self.headers, header::DATE)
    }

    /// The `Via` value to emit when serving this response: the stored chain
    /// with this layer's pseudonym appended.
    pub fn via(&self) -> String {
        match self.headers.get(header::VIA).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}, {VIA_PSEUDONYM}"),
            _ => VIA_PSEUDONYM.to_string(),
        }
    }

    /// Whether this status permits treating a state-changing request as
    /// having taken effect (2xx or 3xx).
    pub fn is_non_error_status(&self) -> bool {
        self.status.is_success() || self.status.is_redirection()
    }

    /// Strip `Set-Cookie` and every header named by a `private=` directive,
    /// prior to storing in a shared cache.
    pub fn remove_private_headers(&mut self) {
        self.headers.remove(header::SET_COOKIE);
        for name in self.cache_control().private_field_names() {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                self.headers.remove(name);
            }
        }
    }

    /// Fold the headers of a `304 Not Modified` into the stored header map.
    ///
    /// Each header name present in `newer` replaces the stored values
    /// wholesale; connection-level headers and `Content-Length` never
    /// overwrite what was stored with the body.
    pub fn merge_headers(&mut self, newer: &HeaderMap) {
        for name in newer.keys() {
            if skip_on_merge(name) {
                continue;
            }
            self.headers.remove(name);
        }
        for (name, value) in newer.iter() {
            if skip_on_merge(name) {
                continue;
            }
            self.headers.append(name.clone(), value.clone());
        }
    }
}

fn skip_on_merge(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::TRANSFER_ENCODING
        || name == header::TRAILER
        || name == header::TE
        || name == header::UPGRADE
        || name == header::PROXY_AUTHENTICATE
        || name == header::PROXY_AUTHORIZATION
        || name == header::CONTENT_LENGTH
        || name.as_str() == "keep-alive"
}
