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

//! Conditional (not modified) and range serving of complete cached bodies

use http::header::{
    ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, IF_RANGE,
    RANGE, TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use std::ops::Range;

use crate::buffer::ResponseWriter;
use crate::error::{ErrorType, OrErr, Result};
use crate::resource::Resource;
use crate::ReqHeader;

/// Evaluate the conditional headers of `req` against the cached response.
///
/// Returns true if the request should receive 304 Not Modified.
pub fn not_modified_filter(req: &ReqHeader, res: &Resource) -> bool {
    // https://datatracker.ietf.org/doc/html/rfc9110#name-304-not-modified
    // 304 can only validate 200
    if res.status() != StatusCode::OK {
        return false;
    }

    // Precedence per https://datatracker.ietf.org/doc/html/rfc9110#name-precedence-of-preconditions
    // If-None-Match is handled before If-Modified-Since, and its presence
    // means If-Modified-Since must be ignored.
    if req.headers.contains_key(http::header::IF_NONE_MATCH) {
        if let Some(etag) = res.headers().get(ETAG) {
            for inm in req.headers.get_all(http::header::IF_NONE_MATCH) {
                if weak_validate_etag(inm.as_bytes(), etag.as_bytes()) {
                    return true;
                }
            }
        }
        return false;
    }

    // GET/HEAD only https://datatracker.ietf.org/doc/html/rfc9110#field.if-modified-since
    if matches!(req.method, Method::GET | Method::HEAD) {
        if let Some(if_modified_since) =
            crate::resource::time_header(&req.headers, http::header::IF_MODIFIED_SINCE)
        {
            if let Some(last_modified) = res.last_modified() {
                if if_modified_since >= last_modified {
                    return true;
                }
            }
        }
    }
    false
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

/// Search the comma-separated `input_etag_header` for an ETag matching
/// `target_etag`, using [weak comparison](https://datatracker.ietf.org/doc/html/rfc9110#section-8.8.3.2).
// ETags containing commas would need quoted-string aware splitting; the RFC
// mandates quoting, and a miss here only costs a full response.
pub fn weak_validate_etag(input_etag_header: &[u8], target_etag: &[u8]) -> bool {
    fn strip_weak_prefix(etag: &[u8]) -> &[u8] {
        etag.strip_prefix(b"W/").unwrap_or(etag)
    }
    // https://datatracker.ietf.org/doc/html/rfc9110#section-13.1.2
    if input_etag_header == b"*" {
        return true;
    }
    let target = strip_weak_prefix(target_etag);
    input_etag_header
        .split(|byte| *byte == b',')
        .any(|candidate| strip_weak_prefix(trim_ascii(candidate)) == target)
}

/// Reduce the staged headers to what a 304 Not Modified may carry.
pub fn to_304(headers: &mut HeaderMap) {
    // "A server may send content-length in 304", but no common web server
    // does, so both content-length and content-type are dropped.
    headers.remove(CONTENT_LENGTH);
    headers.remove(CONTENT_TYPE);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONTENT_ENCODING);
    headers.remove(ACCEPT_RANGES);
}

/// The byte range a request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeType {
    /// No (usable) range, serve the full body.
    None,
    /// A single satisfiable range.
    Single(Range<usize>),
    /// A syntactically present but unsatisfiable range: respond 416.
    Invalid,
}

/// Parse a `Range` header value against a body of `content_length` bytes.
///
/// Only single ranges are evaluated; multipart ranges fall back to the full
/// body. Assembling responses from partial entries is out of scope.
pub fn parse_range_header(value: &str, content_length: usize) -> RangeType {
    let Some(spec) = value.strip_prefix("bytes=") else {
        return RangeType::None;
    };
    if spec.contains(',') {
        return RangeType::None;
    }
    let spec = spec.trim();
    let Some((start, end)) = spec.split_once('-') else {
        return RangeType::Invalid;
    };
    if start.is_empty() {
        // suffix form: the last N bytes
        let Ok(suffix) = end.parse::<usize>() else {
            return RangeType::Invalid;
        };
        if suffix == 0 || content_length == 0 {
            return RangeType::Invalid;
        }
        return RangeType::Single(content_length.saturating_sub(suffix)..content_length);
    }
    let Ok(start) = start.parse::<usize>() else {
        return RangeType::Invalid;
    };
    if start >= content_length {
        return RangeType::Invalid;
    }
    if end.is_empty() {
        return RangeType::Single(start..content_length);
    }
    let Ok(end) = end.parse::<usize>() else {
        return RangeType::Invalid;
    };
    if end < start {
        return RangeType::Invalid;
    }
    // an end past the last byte just means "to the end"
    RangeType::Single(start..content_length.min(end + 1))
}

// Whether the `If-Range` precondition allows serving the requested range.
// An entity tag must match the stored ETag strongly; a date must equal
// Last-Modified exactly. No If-Range means the range always applies.
fn if_range_matches(req: &ReqHeader, res: &Resource) -> bool {
    let Some(if_range) = req.headers.get(IF_RANGE) else {
        return true;
    };
    let Ok(if_range) = if_range.to_str() else {
        return false;
    };
    if if_range.starts_with("W/") {
        // weak validators cannot guard range reassembly
        return false;
    }
    if if_range.starts_with('"') {
        return res
            .headers()
            .get(ETAG)
            .map_or(false, |etag| etag.as_bytes() == if_range.as_bytes());
    }
    match (httpdate::parse_http_date(if_range).ok(), res.last_modified()) {
        (Some(at), Some(last_modified)) => at == last_modified,
        _ => false,
    }
}

/// Write a cached 200 response honoring conditional and range headers.
pub(crate) async fn serve_content(
    rw: &mut (dyn ResponseWriter + Send),
    req: &ReqHeader,
    res: &Resource,
) -> Result<()> {
    if not_modified_filter(req, res) {
        to_304(rw.headers_mut());
        rw.write_header(StatusCode::NOT_MODIFIED).await?;
        return Ok(());
    }

    let header_only = req.method == Method::HEAD;
    let content_length = res.body().len();

    let range = match req.headers.get(RANGE).and_then(|v| v.to_str().ok()) {
        Some(value) if if_range_matches(req, res) => parse_range_header(value, content_length),
        _ => RangeType::None,
    };

    match range {
        RangeType::Invalid => {
            let content_range = format!("bytes */{content_length}");
            rw.headers_mut().insert(
                CONTENT_RANGE,
                HeaderValue::from_str(&content_range)
                    .or_err(ErrorType::InternalError, "invalid Content-Range value")?,
            );
            rw.headers_mut().remove(CONTENT_LENGTH);
            rw.write_header(StatusCode::RANGE_NOT_SATISFIABLE).await?;
        }
        RangeType::Single(range) => {
            let content_range = format!("bytes {}-{}/{}", range.start, range.end - 1, content_length);
            rw.headers_mut().insert(
                CONTENT_RANGE,
                HeaderValue::from_str(&content_range)
                    .or_err(ErrorType::InternalError, "invalid Content-Range value")?,
            );
            rw.headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(range.len()));
            rw.write_header(StatusCode::PARTIAL_CONTENT).await?;
            if !header_only {
                rw.write_body(res.body().slice(range)).await?;
            }
        }
        RangeType::None => {
            rw.headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(content_length));
            rw.write_header(StatusCode::OK).await?;
            if !header_only {
                rw.write_body(res.body().clone()).await?;
            }
        }
    }
    Ok(())
}
