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

//! Cache key

use http::header::{CONTENT_LOCATION, HOST};
use http::Method;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::ReqHeader;

/// A URL canonicalisation rule consulted by the key builder.
///
/// Some origins sign their URLs with per-client query tokens while the
/// response bytes are identical for everyone. Left alone those tokens
/// fragment the cache into single-use entries. A rule collapses such URLs
/// onto one synthetic host, optionally dropping the query string.
///
/// Rules are consulted in order and the first match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    /// The suffix the request host must end with.
    pub host_suffix: String,
    /// Path suffixes (usually file extensions), any of which must match.
    pub path_suffixes: Vec<String>,
    /// The host substituted into the cache key.
    pub replacement_host: String,
    /// Whether to drop the query string from the key.
    #[serde(default)]
    pub strip_query: bool,
}

impl RewriteRule {
    fn matches(&self, host: &str, path: &str) -> bool {
        host.ends_with(&self.host_suffix)
            && self
                .path_suffixes
                .iter()
                .any(|suffix| path.ends_with(suffix.as_str()))
    }
}

/// A unique identifier for a resource in the cache.
///
/// Two requests produce byte-identical encodings iff they agree on method,
/// canonical URL and the values of every header on the variance axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    method: Method,
    scheme: String,
    host: String,
    path: String,
    query: Option<String>,
    variance: Vec<(String, String)>,
}

impl CacheKey {
    /// Build the primary key for a request.
    ///
    /// The effective URL is cloned out of the request so later mutations
    /// never alias the caller's URI. The URL then goes through the rewrite
    /// rule table and, last, a `Content-Location` header naming the same
    /// host substitutes its resolved target.
    pub fn from_request(req: &ReqHeader, rules: &[RewriteRule]) -> Self {
        let scheme = req.uri.scheme_str().unwrap_or("http").to_string();
        let req_host = req
            .uri
            .authority()
            .map(|a| a.as_str())
            .or_else(|| req.headers.get(HOST).and_then(|v| v.to_str().ok()))
            .unwrap_or("")
            .to_string();
        let req_path = if req.uri.path().is_empty() {
            "/"
        } else {
            req.uri.path()
        };

        let mut host = req_host.clone();
        let mut path = req_path.to_string();
        let mut query = req.uri.query().map(|q| q.to_string());

        for rule in rules {
            if rule.matches(&host, &path) {
                debug!(
                    "rewriting key host {} -> {} for {}",
                    host, rule.replacement_host, path
                );
                host = rule.replacement_host.clone();
                if rule.strip_query {
                    query = None;
                }
                break;
            }
        }

        if let Some(location) = req
            .headers
            .get(CONTENT_LOCATION)
            .and_then(|v| v.to_str().ok())
        {
            match resolve_reference(&req_host, req_path, location) {
                Some((l_host, l_path, l_query)) => {
                    if l_host.eq_ignore_ascii_case(&req_host) {
                        debug!("using Content-Location {:?} for key", location);
                        host = l_host;
                        path = l_path;
                        query = l_query;
                    } else {
                        debug!("ignoring foreign host {:?} in Content-Location", l_host);
                    }
                }
                None => debug!("failed to parse Content-Location {:?}", location),
            }
        }

        CacheKey {
            method: req.method.clone(),
            scheme,
            host,
            path,
            query,
            variance: Vec::new(),
        }
    }

    /// A copy of this key with the method replaced.
    pub fn for_method(&self, method: Method) -> Self {
        let mut key = self.clone();
        key.method = method;
        key
    }

    /// A copy of this key for another URL on the same host.
    ///
    /// `reference` is resolved against this key's URL. Returns `None` when
    /// the reference cannot be parsed or names a different host.
    pub fn for_url(&self, reference: &str) -> Option<Self> {
        let (host, path, query) = resolve_reference(&self.host, &self.path, reference)?;
        if !host.eq_ignore_ascii_case(&self.host) {
            return None;
        }
        Some(CacheKey {
            method: self.method.clone(),
            scheme: self.scheme.clone(),
            host,
            path,
            query,
            variance: Vec::new(),
        })
    }

    /// A copy of this key varied on the headers listed in `vary_header`.
    ///
    /// Each listed header contributes a `name=value` pair in list order,
    /// with an empty value when the request does not carry the header.
    pub fn vary(&self, vary_header: &str, req: &ReqHeader) -> Self {
        let mut key = self.clone();
        for name in vary_header.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let value = req
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            key.variance.push((name.to_string(), value.to_string()));
        }
        key
    }

    /// Whether this key carries a variance axis.
    pub fn has_variance(&self) -> bool {
        !self.variance.is_empty()
    }

    fn url_string(&self) -> String {
        let mut url = format!("{}://{}{}", self.scheme, self.host, self.path);
        if let Some(q) = self.query.as_ref() {
            url.push('?');
            url.push_str(q);
        }
        url
    }

    /// The string form of this key, used to address the storage backend.
    ///
    /// `<METHOD>:<lowercased-url>` followed, when a variance axis exists, by
    /// `::name=value:` for each pair in order.
    pub fn encode(&self) -> String {
        let mut out = format!("{}:{}", self.method, self.url_string().to_lowercase());
        if !self.variance.is_empty() {
            out.push_str("::");
            for (name, value) in &self.variance {
                out.push_str(name);
                out.push('=');
                out.push_str(value);
                out.push(':');
            }
        }
        out
    }
}

// Resolve `reference` against a base URL per the merge rules of RFC 3986
// (without dot-segment normalization). Returns (host, path, query).
fn resolve_reference(
    base_host: &str,
    base_path: &str,
    reference: &str,
) -> Option<(String, String, Option<String>)> {
    let reference = reference.split('#').next().unwrap_or("");
    if reference.is_empty() {
        return None;
    }

    let authority_form = if let Some((_scheme, rest)) = reference.split_once("://") {
        Some(rest)
    } else {
        reference.strip_prefix("//")
    };
    if let Some(rest) = authority_form {
        let split = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, path_query) = rest.split_at(split);
        if authority.is_empty() {
            return None;
        }
        let (path, query) = split_path_query(path_query);
        let path = if path.is_empty() { "/" } else { path };
        return Some((authority.to_string(), path.to_string(), query));
    }

    let (ref_path, query) = split_path_query(reference);
    if ref_path.is_empty() {
        // query-only reference
        return Some((base_host.to_string(), base_path.to_string(), query));
    }
    let path = if ref_path.starts_with('/') {
        ref_path.to_string()
    } else {
        // relative path: replace everything after the last segment of the base
        match base_path.rfind('/') {
            Some(idx) => format!("{}{}", &base_path[..=idx], ref_path),
            None => format!("/{}", ref_path),
        }
    };
    Some((base_host.to_string(), path, query))
}

fn split_path_query(s: &str) -> (&str, Option<String>) {
    match s.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (s, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_request(method: &str, uri: &str, headers: &[(&str, &str)]) -> ReqHeader {
        let mut builder = http::request::Builder::new().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        parts
    }

    fn video_rules() -> Vec<RewriteRule> {
        vec![
            RewriteRule {
                host_suffix: ".sdarot.pm".to_string(),
                path_suffixes: vec![".mp4".to_string()],
                replacement_host: "sdarot.pm.media.ngtech.internal".to_string(),
                strip_query: true,
            },
            RewriteRule {
                host_suffix: ".download.windowsupdate.com".to_string(),
                path_suffixes: vec![".exe".to_string(), ".cab".to_string(), ".esd".to_string()],
                replacement_host: "windows.update.ngtech.internal".to_string(),
                strip_query: true,
            },
        ]
    }

    #[test]
    fn test_primary_key_encoding() {
        let req = build_request("GET", "http://Example.COM/Some/Path?B=2", &[]);
        let key = CacheKey::from_request(&req, &[]);
        assert_eq!(key.encode(), "GET:http://example.com/some/path?b=2");
    }

    #[test]
    fn test_host_header_fallback() {
        let req = build_request("GET", "/a", &[("Host", "example.com")]);
        let key = CacheKey::from_request(&req, &[]);
        assert_eq!(key.encode(), "GET:http://example.com/a");
    }

    #[test]
    fn test_key_ignores_unrelated_headers() {
        let req1 = build_request("GET", "http://example.com/a", &[("User-Agent", "one")]);
        let req2 = build_request("GET", "http://example.com/a", &[("User-Agent", "two")]);
        assert_eq!(
            CacheKey::from_request(&req1, &[]).encode(),
            CacheKey::from_request(&req2, &[]).encode()
        );
    }

    #[test]
    fn test_for_method() {
        let req = build_request("HEAD", "http://example.com/a", &[]);
        let key = CacheKey::from_request(&req, &[]);
        assert_eq!(key.encode(), "HEAD:http://example.com/a");
        assert_eq!(
            key.for_method(Method::GET).encode(),
            "GET:http://example.com/a"
        );
    }

    #[test]
    fn test_vary_encoding() {
        let req = build_request(
            "GET",
            "http://example.com/a",
            &[("Accept-Encoding", "gzip"), ("Accept-Language", "en")],
        );
        let key = CacheKey::from_request(&req, &[]);
        let varied = key.vary("Accept-Encoding, Accept-Language", &req);
        assert_eq!(
            varied.encode(),
            "GET:http://example.com/a::Accept-Encoding=gzip:Accept-Language=en:"
        );

        // a header the request does not carry contributes an empty value
        let varied = key.vary("Accept-Encoding, X-Missing", &req);
        assert_eq!(
            varied.encode(),
            "GET:http://example.com/a::Accept-Encoding=gzip:X-Missing=:"
        );
    }

    #[test]
    fn test_vary_order_is_significant() {
        let req = build_request(
            "GET",
            "http://example.com/a",
            &[("A", "1"), ("B", "2")],
        );
        let key = CacheKey::from_request(&req, &[]);
        assert_ne!(
            key.vary("A, B", &req).encode(),
            key.vary("B, A", &req).encode()
        );
    }

    #[test]
    fn test_rewrite_rule_strips_signed_query() {
        let req = build_request(
            "GET",
            "http://media7.sdarot.pm/watch/episode.mp4?token=abc123&time=999",
            &[],
        );
        let key = CacheKey::from_request(&req, &video_rules());
        assert_eq!(
            key.encode(),
            "GET:http://sdarot.pm.media.ngtech.internal/watch/episode.mp4"
        );

        // a second signature for the same file lands on the same key
        let req = build_request(
            "GET",
            "http://media9.sdarot.pm/watch/episode.mp4?token=zzz&time=111",
            &[],
        );
        assert_eq!(
            CacheKey::from_request(&req, &video_rules()).encode(),
            key.encode()
        );
    }

    #[test]
    fn test_rewrite_rule_requires_both_suffixes() {
        // wrong extension: untouched
        let req = build_request("GET", "http://media7.sdarot.pm/watch/episode.srt?x=1", &[]);
        let key = CacheKey::from_request(&req, &video_rules());
        assert_eq!(key.encode(), "GET:http://media7.sdarot.pm/watch/episode.srt?x=1");

        // wrong host: untouched
        let req = build_request("GET", "http://cdn.example.com/file.cab", &[]);
        let key = CacheKey::from_request(&req, &video_rules());
        assert_eq!(key.encode(), "GET:http://cdn.example.com/file.cab");
    }

    #[test]
    fn test_rewrite_rule_windows_update() {
        let req = build_request(
            "GET",
            "http://au.download.windowsupdate.com/d/updt.esd?cdn=sig",
            &[],
        );
        let key = CacheKey::from_request(&req, &video_rules());
        assert_eq!(
            key.encode(),
            "GET:http://windows.update.ngtech.internal/d/updt.esd"
        );
    }

    #[test]
    fn test_content_location_same_host() {
        let req = build_request(
            "GET",
            "http://example.com/dir/resource",
            &[("Content-Location", "canonical")],
        );
        let key = CacheKey::from_request(&req, &[]);
        assert_eq!(key.encode(), "GET:http://example.com/dir/canonical");

        let req = build_request(
            "GET",
            "http://example.com/dir/resource",
            &[("Content-Location", "/other?x=1")],
        );
        let key = CacheKey::from_request(&req, &[]);
        assert_eq!(key.encode(), "GET:http://example.com/other?x=1");

        let req = build_request(
            "GET",
            "http://example.com/dir/resource",
            &[("Content-Location", "http://example.com/absolute")],
        );
        let key = CacheKey::from_request(&req, &[]);
        assert_eq!(key.encode(), "GET:http://example.com/absolute");
    }

    #[test]
    fn test_content_location_foreign_host_ignored() {
        let req = build_request(
            "GET",
            "http://example.com/a",
            &[("Content-Location", "http://evil.example.net/a")],
        );
        let key = CacheKey::from_request(&req, &[]);
        assert_eq!(key.encode(), "GET:http://example.com/a");
    }

    #[test]
    fn test_for_url() {
        let req = build_request("POST", "http://example.com/items", &[]);
        let key = CacheKey::from_request(&req, &[]);

        let same = key.for_url("/items/7").unwrap();
        assert_eq!(same.encode(), "POST:http://example.com/items/7");

        let same = key.for_url("http://example.com/items/8").unwrap();
        assert_eq!(same.encode(), "POST:http://example.com/items/8");

        assert!(key.for_url("http://other.example.org/items/7").is_none());
        assert!(key.for_url("").is_none());
    }
}
