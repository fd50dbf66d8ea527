// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap as Map;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::handle::ProcessId;
use crate::sync::Mutex;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Called when a producer is asked to exit, so a producer blocked somewhere other than its
/// request poll notices.
pub type ExitWaker = Box<dyn Fn() + Send + Sync>;

/// Per-producer state visible to the rest of the host.
#[derive(Default)]
pub struct ThreadInfo {
    pid: AtomicU64,
    should_exit: AtomicBool,
    exit_waker: Mutex<Option<ExitWaker>>,
}

impl fmt::Debug for ThreadInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadInfo")
            .field("pid", &self.pid)
            .field("should_exit", &self.should_exit)
            .finish()
    }
}

impl ThreadInfo {
    /// The guest process this producer serves, or 0 before the guest said.
    pub fn pid(&self) -> ProcessId {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn set_pid(&self, pid: ProcessId) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    /// Advisory: the producer checks this between requests and exits at the next opportunity.
    pub fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::SeqCst)
    }

    pub fn request_exit(&self) {
        self.should_exit.store(true, Ordering::SeqCst);
        if let Some(waker) = self.exit_waker.lock().as_ref() {
            waker();
        }
    }

    pub fn set_exit_waker(&self, waker: ExitWaker) {
        *self.exit_waker.lock() = Some(waker);
    }
}

/// All live producers.
#[derive(Debug, Default)]
pub struct ThreadInfoTable {
    next_id: AtomicU64,
    infos: Mutex<Map<u64, Arc<ThreadInfo>>>,
}

/// Keeps a producer listed in its table until dropped.
#[derive(Debug)]
pub struct ThreadInfoRegistration {
    table: Arc<ThreadInfoTable>,
    id: u64,
    info: Arc<ThreadInfo>,
}

impl ThreadInfoRegistration {
    pub fn info(&self) -> &Arc<ThreadInfo> {
        &self.info
    }
}

impl Drop for ThreadInfoRegistration {
    fn drop(&mut self) {
        self.table.infos.lock().remove(&self.id);
    }
}

impl ThreadInfoTable {
    pub fn new() -> Arc<ThreadInfoTable> {
        Arc::new(Default::default())
    }

    pub fn register(self: &Arc<Self>) -> ThreadInfoRegistration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info: Arc<ThreadInfo> = Arc::new(Default::default());
        self.infos.lock().insert(id, info.clone());
        ThreadInfoRegistration {
            table: self.clone(),
            id,
            info,
        }
    }

    pub fn len(&self) -> usize {
        self.infos.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Asks every producer of `pid` to exit. Returns whether any is still listed.
    pub fn signal_exit(&self, pid: ProcessId) -> bool {
        let infos = self.infos.lock();
        let mut found = false;
        for info in infos.values().filter(|info| info.pid() == pid) {
            info.request_exit();
            found = true;
        }
        found
    }

    /// Signals and then polls until no producer of `pid` remains. A producer stuck inside a
    /// driver call keeps this waiting.
    pub fn wait_for_process_exit(&self, pid: ProcessId) {
        while self.signal_exit(pid) {
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}
