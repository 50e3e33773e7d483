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

//! Hash map based in memory cache
//!
//! For testing only, not for production use

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Result;
use crate::resource::Resource;
use crate::storage::{Lookup, Storage};

/// Hash map based in memory cache
///
/// For testing only, not for production use.
pub struct MemCache {
    cached: RwLock<HashMap<String, Resource>>,
}

impl MemCache {
    /// Create a new [MemCache]
    pub fn new() -> Self {
        MemCache {
            cached: RwLock::new(HashMap::new()),
        }
    }

    /// The number of entries currently stored.
    pub fn len(&self) -> usize {
        self.cached.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.cached.read().is_empty()
    }
}

impl Default for MemCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemCache {
    async fn lookup(&self, key: &str) -> Result<Lookup> {
        match self.cached.read().get(key) {
            Some(res) if res.body().is_empty() => Ok(Lookup::Empty),
            Some(res) => Ok(Lookup::Hit(res.clone())),
            None => Ok(Lookup::Miss),
        }
    }

    async fn store(&self, res: &Resource, keys: &[String]) -> Result<()> {
        let mut cached = self.cached.write();
        for key in keys {
            cached.insert(key.clone(), res.clone());
        }
        Ok(())
    }

    async fn freshen(&self, res: &Resource, key: &str) -> Result<bool> {
        match self.cached.write().get_mut(key) {
            Some(existing) => {
                existing.set_headers(res.headers().clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge(&self, key: &str) -> Result<bool> {
        Ok(self.cached.write().remove(key).is_some())
    }
}
