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

//! The background write pool
//!
//! Stores, freshens and invalidations run off the request path so client
//! latency is never charged for storage I/O. A bounded queue feeds a small
//! set of workers, which also bounds memory held by captured bodies during
//! burst traffic. [WritePool::drain] blocks until the queue is empty and all
//! workers are idle, so no cache write is lost at shutdown.

use log::{debug, error};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::resource::Resource;
use crate::storage::Storage;

/// A unit of background write work.
#[derive(Debug)]
pub(crate) enum WriteTask {
    /// Store the resource under every key.
    Store {
        res: Resource,
        keys: Vec<String>,
    },
    /// Replace the headers of the entry under `key`.
    Freshen {
        res: Resource,
        key: String,
    },
    /// Remove the entries under the keys.
    Purge {
        keys: Vec<String>,
    },
}

struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn complete(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// A bounded pool of background cache writers.
pub struct WritePool {
    tx: mpsc::Sender<WriteTask>,
    pending: Arc<Pending>,
}

impl WritePool {
    /// Spawn `workers` background workers over a queue of `queue_depth`
    /// outstanding tasks. Must be called within a tokio runtime.
    pub fn new(storage: Arc<dyn Storage>, workers: usize, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new(Pending {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        for _ in 0..workers.max(1) {
            tokio::spawn(worker_loop(storage.clone(), rx.clone(), pending.clone()));
        }
        WritePool { tx, pending }
    }

    /// Enqueue a write. Applies backpressure when the queue is full.
    ///
    /// The pending count is raised before the task is handed over so a
    /// concurrent [WritePool::drain] cannot miss it.
    pub(crate) async fn submit(&self, task: WriteTask) {
        self.pending.begin();
        if self.tx.send(task).await.is_err() {
            // workers are gone; only reachable after the runtime shut down
            self.pending.complete();
            error!("write queue closed, dropping cache write");
        }
    }

    /// Wait until the queue is drained and every worker is idle.
    pub async fn drain(&self) {
        loop {
            if self.pending.count.load(Ordering::Acquire) == 0 {
                return;
            }
            let idle = self.pending.idle.notified();
            tokio::pin!(idle);
            // register for the wakeup before the final count check, so a
            // completion between check and await cannot be missed
            idle.as_mut().enable();
            if self.pending.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// The number of writes queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }
}

async fn worker_loop(
    storage: Arc<dyn Storage>,
    rx: Arc<Mutex<mpsc::Receiver<WriteTask>>>,
    pending: Arc<Pending>,
) {
    loop {
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            // queue closed, pool dropped
            return;
        };
        run_task(storage.as_ref(), task).await;
        pending.complete();
    }
}

// Failures are logged and swallowed: nothing downstream can act on them.
async fn run_task(storage: &dyn Storage, task: WriteTask) {
    match task {
        WriteTask::Store { res, keys } => {
            if let Err(e) = storage.store(&res, &keys).await {
                error!("storing resource under {:?} failed: {}", keys, e);
            } else {
                debug!("stored resource under {:?}", keys);
            }
        }
        WriteTask::Freshen { res, key } => match storage.freshen(&res, &key).await {
            Ok(true) => debug!("freshened headers of {}", key),
            Ok(false) => debug!("nothing to freshen under {}", key),
            Err(e) => error!("freshening {} failed: {}", key, e),
        },
        WriteTask::Purge { keys } => {
            for key in keys {
                if let Err(e) = storage.purge(&key).await {
                    error!("invalidating {} failed: {}", key, e);
                }
            }
        }
    }
}
