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

//! Functions and utilities to help parse Cache-Control headers

use http::header::CACHE_CONTROL;
use http::HeaderMap;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::num::IntErrorKind;
use std::str;
use std::time::Duration;

use crate::error::{Error, ErrorType, Result};

/// The max delta-second per [RFC 9111](https://datatracker.ietf.org/doc/html/rfc9111#section-1.2.2)
// "If a cache receives a delta-seconds
// value greater than the greatest integer it can represent, or if any
// of its subsequent calculations overflows, the cache MUST consider the
// value to be either 2147483648 (2^31) or the greatest positive integer
// it can conveniently represent."
pub const DELTA_SECONDS_OVERFLOW_VALUE: u64 = 2147483648;

/// Cache control directive key type
pub type DirectiveKey = String;

/// Cache control directive value type
#[derive(Debug)]
pub struct DirectiveValue(pub Vec<u8>);

impl AsRef<[u8]> for DirectiveValue {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl DirectiveValue {
    /// A [DirectiveValue] without quotes (`"`).
    pub fn parse_as_bytes(&self) -> &[u8] {
        self.0
            .strip_prefix(&[b'"'])
            .and_then(|bytes| bytes.strip_suffix(&[b'"']))
            .unwrap_or(&self.0[..])
    }

    /// A [DirectiveValue] without quotes (`"`) as `str`.
    pub fn parse_as_str(&self) -> Result<&str> {
        str::from_utf8(self.parse_as_bytes()).or_else(|e| {
            Error::e_because(
                ErrorType::InvalidHTTPHeader,
                "could not parse value as utf8",
                e,
            )
        })
    }

    /// Parse the [DirectiveValue] as delta seconds
    ///
    /// `"`s are ignored. The value is capped to [DELTA_SECONDS_OVERFLOW_VALUE].
    pub fn parse_as_delta_seconds(&self) -> Result<u64> {
        match self.parse_as_str()?.parse::<u64>() {
            Ok(value) => Ok(value.min(DELTA_SECONDS_OVERFLOW_VALUE)),
            Err(e) => {
                // delta-seconds expect to handle positive overflow gracefully
                if e.kind() == &IntErrorKind::PosOverflow {
                    Ok(DELTA_SECONDS_OVERFLOW_VALUE)
                } else {
                    Error::e_because(
                        ErrorType::InvalidHTTPHeader,
                        "could not parse value as delta-seconds",
                        e,
                    )
                }
            }
        }
    }
}

/// An ordered multimap of cache control directives.
///
/// A directive that appears multiple times, or with a list value, keeps every
/// value in the order the header lines carried them.
pub type DirectiveMap = IndexMap<DirectiveKey, Vec<DirectiveValue>>;

/// Parsed Cache-Control directives
#[derive(Debug, Default)]
pub struct CacheControl {
    /// The parsed directives
    pub directives: DirectiveMap,
}

// https://datatracker.ietf.org/doc/html/rfc9110#name-whitespace
// optional whitespace OWS = *(SP / HTAB); SP = 0x20, HTAB = 0x09
fn trim_ows(bytes: &[u8]) -> &[u8] {
    fn not_ows(b: &u8) -> bool {
        b != &b'\x20' && b != &b'\x09'
    }
    let head = bytes.iter().position(not_ows).unwrap_or(0);
    let tail = bytes
        .iter()
        .rposition(not_ows)
        .map(|rpos| rpos + 1)
        .unwrap_or(head);
    &bytes[head..tail]
}

// Cache-Control   = 1#cache-directive
// cache-directive = token [ "=" ( token / quoted-string ) ]
// token           = [^\x00-\x20\(\)<>@\,;\:\\"\/\[\]\?\=\{\}\x7F]+
// quoted-string   = "(?:[^"\\]|\\.)*"
//
// The token class excludes the delimiters disallowed by
// https://datatracker.ietf.org/doc/html/rfc9110#section-5.6.2 but permits
// obs-text (%x80-FF). Commas split directives outside quoted strings only.
static RE_CACHE_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?-u)(?:^|(?:\s*[,;]\s*))([^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+)(?:=((?:[^\x00-\x20\(\)<>@,;:\\"/\[\]\?=\{\}\x7F]+|(?:"(?:[^"\\]|\\.)*"))))?"#).unwrap()
});

impl CacheControl {
    /// Parse the given header name from `headers`.
    ///
    /// Parsing is deliberately permissive: unknown directives are kept, bad
    /// octets in a single directive only drop that directive, and repeated
    /// header lines accumulate in insertion order. An absent header yields an
    /// empty directive map.
    pub fn from_headers_named(header_name: &str, headers: &HeaderMap) -> Self {
        let mut directives: DirectiveMap = IndexMap::new();
        // iterates in header line insertion order
        for line in headers.get_all(header_name) {
            for captures in RE_CACHE_DIRECTIVE.captures_iter(line.as_bytes()) {
                // header values don't have to be utf-8, but keys are stored as
                // strings for case-insensitive lookups
                let Some(key) = captures
                    .get(1)
                    .and_then(|cap| str::from_utf8(cap.as_bytes()).ok())
                    .map(|token| token.to_lowercase())
                else {
                    continue;
                };
                let entry = directives.entry(key).or_default();
                if let Some(value) = captures.get(2) {
                    entry.push(DirectiveValue(value.as_bytes().to_vec()));
                }
            }
        }
        CacheControl { directives }
    }

    /// Parse the `Cache-Control` header from `headers`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_headers_named(CACHE_CONTROL.as_str(), headers)
    }

    /// Whether the given directive is present, regardless of value count.
    pub fn has(&self, key: &str) -> bool {
        self.directives.contains_key(key)
    }

    /// The first value of the given directive, if any.
    pub fn get(&self, key: &str) -> Option<&DirectiveValue> {
        self.directives.get(key).and_then(|values| values.first())
    }

    /// Whether the given directive exists and carries at least one value.
    pub fn has_value_for(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Parse the first value of the given directive as a non-negative number
    /// of seconds.
    ///
    /// `Ok(None)` means the directive is absent. A directive that is present
    /// without a value, or with a non-numeric value, is an error.
    pub fn duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.directives.get(key) {
            None => Ok(None),
            Some(values) => match values.first() {
                Some(value) => Ok(Some(Duration::from_secs(value.parse_as_delta_seconds()?))),
                None => Error::e_explain(
                    ErrorType::InvalidHTTPHeader,
                    format!("directive {key} has no value"),
                ),
            },
        }
    }

    /// Whether `no-cache` exists.
    pub fn no_cache(&self) -> bool {
        self.has("no-cache")
    }

    /// Whether `no-store` exists.
    pub fn no_store(&self) -> bool {
        self.has("no-store")
    }

    /// Whether `only-if-cached` exists.
    pub fn only_if_cached(&self) -> bool {
        self.has("only-if-cached")
    }

    /// Whether `must-revalidate` exists.
    pub fn must_revalidate(&self) -> bool {
        self.has("must-revalidate")
    }

    /// Whether `proxy-revalidate` exists.
    pub fn proxy_revalidate(&self) -> bool {
        self.has("proxy-revalidate")
    }

    /// Whether `public` exists.
    pub fn public(&self) -> bool {
        self.has("public")
    }

    /// Whether the blanket (valueless) `private` exists.
    // RFC 7234: the #field-name form of `private` only forbids storing the
    // named fields, "whereas it MAY store the remainder of the response."
    // Only the boolean form applies to the whole response.
    // https://datatracker.ietf.org/doc/html/rfc7234#section-5.2.2.6
    pub fn private(&self) -> bool {
        self.has("private") && !self.has_value_for("private")
    }

    /// The header names listed by the `private=` field-name form, lowercased.
    pub fn private_field_names(&self) -> Vec<String> {
        self.field_names("private")
    }

    fn field_names(&self, key: &str) -> Vec<String> {
        let Some(values) = self.directives.get(key) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        for value in values {
            for name in value.parse_as_bytes().split(|byte| byte == &b',') {
                let name = trim_ows(name);
                if name.is_empty() {
                    continue;
                }
                if let Ok(name) = str::from_utf8(name) {
                    names.push(name.to_lowercase());
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn build_headers(values: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for v in values {
            headers.append(CACHE_CONTROL, HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    fn parse(value: &str) -> CacheControl {
        CacheControl::from_headers(&build_headers(&[value]))
    }

    #[test]
    fn test_simple_cache_control() {
        let cc = parse("public, max-age=10000");
        assert!(cc.public());
        assert_eq!(cc.duration("max-age").unwrap().unwrap().as_secs(), 10000);
    }

    #[test]
    fn test_empty_header() {
        let cc = CacheControl::from_headers(&HeaderMap::new());
        assert!(cc.directives.is_empty());
        assert!(!cc.has("max-age"));
        assert!(cc.duration("max-age").unwrap().is_none());
    }

    #[test]
    fn test_directives_across_header_lines() {
        let cc = CacheControl::from_headers(&build_headers(&["public,", "max-age=10000"]));
        assert!(cc.public());
        assert_eq!(cc.duration("max-age").unwrap().unwrap().as_secs(), 10000);
    }

    #[test]
    fn test_quoted_value() {
        let cc = parse("max-age=\"10\"");
        assert_eq!(cc.duration("max-age").unwrap().unwrap().as_secs(), 10);
    }

    #[test]
    fn test_case_insensitive_directive_keys() {
        let cc = parse("Public, mAx-AGe=60");
        assert!(cc.public());
        assert_eq!(cc.duration("max-age").unwrap().unwrap().as_secs(), 60);
    }

    #[test]
    fn test_multi_valued_directive() {
        let cc = parse("private=\"set-cookie\", private=\"x-user\"");
        assert!(cc.has("private"));
        // field-name form, not the blanket form
        assert!(!cc.private());
        assert_eq!(cc.private_field_names(), vec!["set-cookie", "x-user"]);
    }

    #[test]
    fn test_private_field_name_list() {
        let cc = parse("private=\"Set-Cookie , X-Accel-Meta,,\"");
        assert_eq!(cc.private_field_names(), vec!["set-cookie", "x-accel-meta"]);
    }

    #[test]
    fn test_blanket_private() {
        let cc = parse("private, max-age=100");
        assert!(cc.private());
    }

    #[test]
    fn test_bare_directive_has_no_duration() {
        let cc = parse("max-stale");
        assert!(cc.has("max-stale"));
        assert!(!cc.has_value_for("max-stale"));
        assert!(cc.duration("max-stale").is_err());
    }

    #[test]
    fn test_non_numeric_duration() {
        let cc = parse("max-age=forever");
        assert!(cc.duration("max-age").is_err());

        // negative ages still result in errors even with overflow handling
        let cc = parse("max-age=-10");
        assert!(cc.duration("max-age").is_err());
    }

    #[test]
    fn test_delta_seconds_overflow() {
        let cc = parse("s-maxage=99999999999999999999999999");
        assert_eq!(
            cc.duration("s-maxage").unwrap().unwrap().as_secs(),
            DELTA_SECONDS_OVERFLOW_VALUE
        );
    }

    #[test]
    fn test_unknown_directives_kept() {
        let cc = parse("public,random1=random2, rand3=\"\"");
        let mut iter = cc.directives.iter();
        assert_eq!(iter.next().unwrap().0, "public");
        let (key, values) = iter.next().unwrap();
        assert_eq!(key, "random1");
        assert_eq!(values[0].0, b"random2");
        let (key, values) = iter.next().unwrap();
        assert_eq!(key, "rand3");
        assert_eq!(values[0].0, b"\"\"");
        assert!(iter.next().is_none());
    }
}
