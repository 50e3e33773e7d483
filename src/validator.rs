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

//! Conditional revalidation of stored responses against the upstream

use http::{header, HeaderMap, StatusCode};
use log::debug;
use std::sync::Arc;

use crate::buffer::{ResponseBuffer, SinkWriter};
use crate::resource::Resource;
use crate::{clone_req_parts, ReqHeader, Upstream};

/// The outcome of a revalidation round-trip.
#[derive(Debug)]
pub enum Validation {
    /// The stored response is still authoritative. Carries the 304's headers
    /// for merging into the stored entry.
    Fresh(HeaderMap),
    /// The upstream response supersedes the stored one (a full reply, an
    /// error, or an unreachable upstream).
    Modified,
}

impl Validation {
    /// Whether the stored response survived validation.
    pub fn is_fresh(&self) -> bool {
        matches!(self, Validation::Fresh(_))
    }
}

/// Issues conditional requests upstream to check whether a stored response
/// can continue to be served.
pub struct Validator {
    upstream: Arc<dyn Upstream>,
}

impl Validator {
    /// Create a [Validator] fronting the given upstream.
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Validator { upstream }
    }

    /// Ask the upstream whether `res` is still authoritative for `req`.
    ///
    /// The client request is copied and the downstream precondition headers
    /// are replaced with ones derived from the stored validators, so the
    /// origin validates our copy rather than the client's.
    pub async fn validate(&self, req: &ReqHeader, res: &Resource) -> Validation {
        let mut conditional = clone_req_parts(req);
        // remove downstream preconditions https://datatracker.ietf.org/doc/html/rfc7232#section-3
        conditional.headers.remove(header::IF_MATCH);
        conditional.headers.remove(header::IF_NONE_MATCH);
        conditional.headers.remove(header::IF_MODIFIED_SINCE);
        conditional.headers.remove(header::IF_UNMODIFIED_SINCE);
        conditional.headers.remove(header::IF_RANGE);
        conditional.headers.remove(header::RANGE);

        // rfc7232: "SHOULD send both validators in cache validation"
        if let Some(since) = res.headers().get(header::LAST_MODIFIED) {
            conditional
                .headers
                .insert(header::IF_MODIFIED_SINCE, since.clone());
        }
        if let Some(etag) = res.headers().get(header::ETAG) {
            conditional
                .headers
                .insert(header::IF_NONE_MATCH, etag.clone());
        }

        let mut sink = SinkWriter::new();
        let mut buffer = ResponseBuffer::new(&mut sink);
        if let Err(e) = self.upstream.serve_http(&mut buffer, &conditional).await {
            debug!("validation round-trip failed: {}", e);
            return Validation::Modified;
        }
        let reply = buffer.resource();
        if reply.status() == StatusCode::NOT_MODIFIED {
            Validation::Fresh(reply.headers().clone())
        } else {
            debug!("validation got {}, stored response superseded", reply.status());
            Validation::Modified
        }
    }
}
