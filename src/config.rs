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

//! Engine configuration
//!
//! Configuration files are by default YAML files, but any key value format
//! can potentially be used.

use http::Uri;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{ErrorType::*, OrErr, Result};
use crate::key::RewriteRule;

/// The tunables of the caching engine.
///
/// # Extension
/// New keys can be added to the configuration files which this configuration
/// object will ignore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Whether this cache serves multiple users.
    ///
    /// A shared cache obeys `private`, `s-maxage` and the `Authorization`
    /// restrictions; a private cache may ignore them.
    pub shared: bool,
    /// Endpoint of an external key-rewrite (store id) service.
    ///
    /// Parsed and retained for future integration; an empty or invalid URL
    /// means no rewrite service.
    pub store_id_url: Option<String>,
    /// URL canonicalisation rules consulted by the key builder, in order.
    pub rewrites: Vec<RewriteRule>,
    /// The number of background cache writers.
    pub write_workers: usize,
    /// How many writes may queue before submission applies backpressure.
    pub write_queue_depth: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            shared: false,
            store_id_url: None,
            rewrites: vec![],
            write_workers: 2,
            write_queue_depth: 128,
        }
    }
}

impl CacheOptions {
    /// Create the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the options from the YAML file at `path`.
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .or_err_with(FileReadError, || format!("Unable to read conf file from {path}"))?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    /// Parse the options from a YAML document.
    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace_conf(conf_str);
        serde_yaml::from_str(conf_str).or_err_with(FileReadError, || "Unable to parse yaml conf")
    }

    /// Dump the options as a YAML document.
    pub fn to_yaml(&self) -> String {
        // serialization of a plain config struct does not fail
        serde_yaml::to_string(self).unwrap_or_default()
    }

    /// The parsed store id endpoint, `None` when unset or unparseable.
    pub fn store_id_endpoint(&self) -> Option<Uri> {
        let raw = self.store_id_url.as_deref()?;
        match raw.parse::<Uri>() {
            Ok(uri) => Some(uri),
            Err(e) => {
                warn!("ignoring invalid store_id_url {:?}: {}", raw, e);
                None
            }
        }
    }
}

fn trace_conf(conf: &str) {
    debug!("Read conf file: {conf}");
}
