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

//! The downstream write surface and the tee used to capture upstream replies

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};

use crate::error::Result;
use crate::resource::Resource;

/// The surface the engine writes responses to.
///
/// Headers accumulate in [ResponseWriter::headers_mut] until
/// [ResponseWriter::write_header] flushes them with the status; header
/// mutations after that point stay local to the map and are not seen by the
/// client. Body bytes follow through [ResponseWriter::write_body].
#[async_trait]
pub trait ResponseWriter: Send {
    /// The response headers staged so far.
    fn headers(&self) -> &HeaderMap;

    /// The response headers, mutable.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Send the status line and the staged headers.
    async fn write_header(&mut self, status: StatusCode) -> Result<()>;

    /// Send a chunk of body.
    async fn write_body(&mut self, data: Bytes) -> Result<()>;
}

/// A write-through tee: forwards everything to the wrapped writer while
/// capturing status and body, so the finished response can be turned into a
/// [Resource] for admission into the cache.
pub struct ResponseBuffer<'a> {
    inner: &'a mut (dyn ResponseWriter + Send),
    status: StatusCode,
    body: BytesMut,
}

impl<'a> ResponseBuffer<'a> {
    /// Wrap the given writer.
    pub fn new(inner: &'a mut (dyn ResponseWriter + Send)) -> Self {
        ResponseBuffer {
            inner,
            status: StatusCode::OK,
            body: BytesMut::new(),
        }
    }

    /// The status written so far (200 until a header is written).
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// A [Resource] snapshot of the captured response.
    pub fn resource(&self) -> Resource {
        Resource::new(
            self.status,
            self.inner.headers().clone(),
            self.body.clone().freeze(),
        )
    }
}

#[async_trait]
impl ResponseWriter for ResponseBuffer<'_> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    async fn write_header(&mut self, status: StatusCode) -> Result<()> {
        self.status = status;
        self.inner.write_header(status).await
    }

    async fn write_body(&mut self, data: Bytes) -> Result<()> {
        self.body.extend_from_slice(&data);
        self.inner.write_body(data).await
    }
}

/// A writer that records the header and status but discards the body.
///
/// Used where a response is needed only for classification, e.g. the
/// validator's conditional round-trip.
#[derive(Debug, Default)]
pub struct SinkWriter {
    headers: HeaderMap,
    status: Option<StatusCode>,
}

impl SinkWriter {
    /// Create an empty [SinkWriter].
    pub fn new() -> Self {
        Self::default()
    }

    /// The status written, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

#[async_trait]
impl ResponseWriter for SinkWriter {
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

    async fn write_body(&mut self, _data: Bytes) -> Result<()> {
        Ok(())
    }
}
