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

//! The wall-clock source used by all freshness and age math.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A shareable source of wall-clock time.
///
/// Every freshness, age and staleness computation in the engine reads time
/// through a [Clock] so that tests can substitute a controllable source.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> SystemTime + Send + Sync>);

impl Clock {
    /// The real system clock.
    pub fn system() -> Self {
        Clock(Arc::new(SystemTime::now))
    }

    /// A clock frozen at the given time.
    pub fn fixed(at: SystemTime) -> Self {
        Clock(Arc::new(move || at))
    }

    /// A clock backed by an arbitrary closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> SystemTime + Send + Sync + 'static,
    {
        Clock(Arc::new(f))
    }

    /// The current time according to this clock.
    pub fn now(&self) -> SystemTime {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::system()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Clock")
    }
}

/// A manually advanced clock for tests.
///
/// Cloning shares the underlying time, so a test can hold on to the
/// [ManualClock] while the engine reads the [Clock] handed out by
/// [ManualClock::clock].
#[derive(Clone)]
pub struct ManualClock {
    at: Arc<RwLock<SystemTime>>,
}

impl ManualClock {
    /// Create a clock starting at the given time.
    pub fn start_at(at: SystemTime) -> Self {
        ManualClock {
            at: Arc::new(RwLock::new(at)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut at = self.at.write();
        *at += by;
    }

    /// Jump the clock to the given time.
    pub fn set(&self, to: SystemTime) {
        *self.at.write() = to;
    }

    /// The current time.
    pub fn now(&self) -> SystemTime {
        *self.at.read()
    }

    /// A [Clock] view onto this manual clock.
    pub fn clock(&self) -> Clock {
        let at = self.at.clone();
        Clock::from_fn(move || *at.read())
    }
}
