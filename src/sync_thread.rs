// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The thread that runs completion work off the GPU submission threads.

use log::debug;

use crate::worker::Completion;
use crate::worker::WorkerProcessingResult;
use crate::worker::WorkerThread;

pub type SyncTask = Box<dyn FnOnce() + Send>;

enum SyncCommand {
    General {
        task: SyncTask,
        description: String,
    },
    Exit,
}

/// Runs general-purpose tasks one at a time in submission order.
pub struct SyncThread {
    worker: WorkerThread<SyncCommand>,
}

impl SyncThread {
    pub fn new() -> SyncThread {
        SyncThread {
            worker: WorkerThread::new("gfxstream_sync", |command| match command {
                SyncCommand::General { task, description } => {
                    debug!("sync thread running {}", description);
                    task();
                    WorkerProcessingResult::Continue
                }
                SyncCommand::Exit => WorkerProcessingResult::Stop,
            }),
        }
    }

    /// Queues `task`. The returned completion fires after it ran, or right away if the thread
    /// already stopped, in which case `task` is dropped unrun.
    pub fn trigger_general<F>(&self, task: F, description: &str) -> Completion
    where
        F: FnOnce() + Send + 'static,
    {
        self.worker.enqueue(SyncCommand::General {
            task: Box::new(task),
            description: description.to_string(),
        })
    }

    pub fn wait_queued_items(&self) {
        let _ = self.worker.wait_queued_items();
    }

    pub fn stop(&self) {
        let _ = self.worker.enqueue(SyncCommand::Exit);
        self.worker.join();
    }
}

impl Default for SyncThread {
    fn default() -> SyncThread {
        SyncThread::new()
    }
}

impl Drop for SyncThread {
    fn drop(&mut self) {
        self.stop();
    }
}
