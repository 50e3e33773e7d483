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

//! Cache backend storage abstraction

use async_trait::async_trait;

use crate::error::Result;
use crate::resource::Resource;

/// The outcome of a [Storage::lookup].
#[derive(Debug)]
pub enum Lookup {
    /// A complete entry exists under the key.
    Hit(Resource),
    /// An entry exists under the key but its body is empty.
    ///
    /// Serving treats this like [Lookup::Miss]; backends that coalesce
    /// writes may use the distinction.
    Empty,
    /// No entry exists under the key.
    Miss,
}

/// Cache storage interface.
///
/// A backend must provide read-your-writes per key and atomic replacement of
/// a key's value: a concurrent reader sees either the previous entry or the
/// new one, never a mix.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Look up the entry stored under `key`.
    async fn lookup(&self, key: &str) -> Result<Lookup>;

    /// Store `res` under every key in `keys`.
    async fn store(&self, res: &Resource, keys: &[String]) -> Result<()>;

    /// Replace only the headers of the entry under `key` with those of
    /// `res`, keeping the stored status and body.
    ///
    /// Returns `false` when no entry exists under `key`.
    async fn freshen(&self, res: &Resource, key: &str) -> Result<bool>;

    /// Remove the entry stored under `key`.
    ///
    /// Returns `false` when no entry existed.
    async fn purge(&self, key: &str) -> Result<bool>;
}
