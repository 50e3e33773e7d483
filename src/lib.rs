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

//! An RFC 7234 HTTP caching layer between clients and an upstream origin.
//!
//! [CacheHandler] intercepts each request, decides whether a stored
//! response may satisfy it, and otherwise forwards the request upstream,
//! optionally admitting the reply into the cache for reuse. Freshness,
//! conditional revalidation, `Vary` handling and invalidation follow
//! [RFC 7234](https://datatracker.ietf.org/doc/html/rfc7234).
//!
//! The storage backend, the upstream transport and HTTP parsing are all
//! external: they reach the engine only through the [Storage], [Upstream]
//! and [ResponseWriter] traits.

#![warn(clippy::all)]

use async_trait::async_trait;
use http::request::Parts as ReqParts;

pub mod buffer;
pub mod cache_control;
pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod key;
mod memory;
pub mod resource;
pub mod serve;
pub mod storage;
pub mod validator;
pub mod writers;

pub use buffer::{ResponseBuffer, ResponseWriter, SinkWriter};
pub use clock::{Clock, ManualClock};
pub use config::CacheOptions;
pub use error::{Error, ErrorType, Result};
pub use handler::CacheHandler;
pub use key::{CacheKey, RewriteRule};
pub use memory::MemCache;
pub use resource::Resource;
pub use storage::{Lookup, Storage};
pub use writers::WritePool;

/// The request header type the engine operates on.
pub type ReqHeader = ReqParts;
/// The response header type the engine operates on.
pub type RespHeader = http::response::Parts;

/// The header reporting how this layer handled the request:
/// `HIT`, `MISS` or `SKIP`.
pub const CACHE_HEADER: &str = "x-cache";

/// The header stamped on admission, recording when this layer received the
/// response. Age accounting on later hits is measured from it.
pub const PROXY_DATE_HEADER: &str = "proxy-date";

/// The upstream origin handler fronted by the cache.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Produce the response for `req` on the given writer.
    async fn serve_http(
        &self,
        rw: &mut (dyn ResponseWriter + Send),
        req: &ReqHeader,
    ) -> Result<()>;
}

// [ReqParts] holds non-cloneable extensions, so an owned copy is rebuilt
// from its pieces.
pub(crate) fn clone_req_parts(me: &ReqParts) -> ReqParts {
    let mut parts = http::request::Builder::new()
        .method(me.method.clone())
        .uri(me.uri.clone())
        .version(me.version)
        .body(())
        .unwrap()
        .into_parts()
        .0;
    parts.headers = me.headers.clone();
    parts
}
