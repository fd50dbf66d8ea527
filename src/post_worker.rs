// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Presentation commands, serialized onto the one thread that owns the display.

use std::sync::Arc;

use futures::channel::oneshot;
use log::debug;
use log::error;

use crate::backend::BackendResource;
use crate::backend::ScreenshotParams;
use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;
use crate::handle::ResourceHandle;
use crate::registry::ResourceRegistry;
use crate::resource::ResourceKind;
use crate::sync_thread::SyncThread;
use crate::worker::Completion;
use crate::worker::WorkerProcessingResult;
use crate::worker::WorkerState;
use crate::worker::WorkerThread;

/// Runs on the sync thread once the frame or composition it was attached to has been handed to
/// the display.
pub type PostCallback = Box<dyn FnOnce() + Send>;

/// The reference a queued post holds on its color buffer. Dropping it gives the reference back,
/// whether or not the frame was presented.
pub struct PostReference {
    registry: Arc<ResourceRegistry>,
    handle: ResourceHandle,
    color_buffer: Arc<dyn BackendResource>,
}

impl PostReference {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }

    pub fn color_buffer(&self) -> &dyn BackendResource {
        self.color_buffer.as_ref()
    }
}

impl Drop for PostReference {
    fn drop(&mut self) {
        self.registry.dec_ref_no_destroy(self.handle);
    }
}

pub enum PostCommand {
    Post {
        reference: PostReference,
        callback: Option<PostCallback>,
    },
    Compose {
        request: Vec<u8>,
        callback: Option<PostCallback>,
    },
    Screenshot {
        params: ScreenshotParams,
        color_buffer: Arc<dyn BackendResource>,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Viewport {
        width: u32,
        height: u32,
    },
    Clear,
    /// Fires `scheduled` as soon as it is dequeued, then holds the worker until
    /// `continue_signal` fires or is dropped.
    Block {
        scheduled: oneshot::Sender<()>,
        continue_signal: Completion,
    },
    Exit,
}

pub struct PostWorker {
    registry: Arc<ResourceRegistry>,
    worker: WorkerThread<PostCommand>,
}

impl PostWorker {
    pub fn new(registry: Arc<ResourceRegistry>, sync_thread: Arc<SyncThread>) -> PostWorker {
        let worker_registry = registry.clone();
        let worker = WorkerThread::new("gfxstream_post", move |command| {
            process_post_command(&worker_registry, &sync_thread, command)
        });
        PostWorker { registry, worker }
    }

    /// Presents `handle`. The color buffer holds an extra reference until the frame is out, so a
    /// guest close in the meantime cannot destroy it under the worker. A post that never runs
    /// because the worker stopped first still returns its reference.
    pub fn post(
        &self,
        handle: ResourceHandle,
        callback: Option<PostCallback>,
    ) -> GfxstreamResult<Completion> {
        if self.worker.state() == WorkerState::Stopped {
            return Err(GfxstreamError::WorkerStopped(self.worker.name()));
        }
        let color_buffer = self
            .registry
            .prepare_post(handle)
            .ok_or(GfxstreamError::InvalidResourceHandle(handle))?;
        let reference = PostReference {
            registry: self.registry.clone(),
            handle,
            color_buffer,
        };
        Ok(self.worker.enqueue(PostCommand::Post {
            reference,
            callback,
        }))
    }

    pub fn compose(&self, request: Vec<u8>, callback: Option<PostCallback>) -> Completion {
        self.worker.enqueue(PostCommand::Compose { request, callback })
    }

    /// Queues a screenshot of `params.color_buffer`. Dropping the returned receiver before the
    /// worker gets to it skips the readback.
    pub fn screenshot(
        &self,
        params: ScreenshotParams,
    ) -> GfxstreamResult<oneshot::Receiver<Option<Vec<u8>>>> {
        let color_buffer = self
            .registry
            .resource(params.color_buffer, ResourceKind::ColorBuffer)?;
        let (reply, receiver) = oneshot::channel();
        let _ = self.worker.enqueue(PostCommand::Screenshot {
            params,
            color_buffer,
            reply,
        });
        Ok(receiver)
    }

    pub fn viewport(&self, width: u32, height: u32) -> Completion {
        self.worker.enqueue(PostCommand::Viewport { width, height })
    }

    pub fn clear(&self) -> Completion {
        self.worker.enqueue(PostCommand::Clear)
    }

    /// Parks the worker after everything queued so far. The returned completion fires once the
    /// worker is parked; it stays parked until `continue_signal` fires.
    pub fn block(&self, continue_signal: Completion) -> Completion {
        let (scheduled, scheduled_completion) = oneshot::channel();
        let _ = self.worker.enqueue(PostCommand::Block {
            scheduled,
            continue_signal,
        });
        Completion::from(scheduled_completion)
    }

    pub fn wait_queued_items(&self) -> GfxstreamResult<()> {
        self.worker.wait_queued_items()
    }

    pub fn stop(&self) {
        let _ = self.worker.enqueue(PostCommand::Exit);
        self.worker.join();
    }
}

impl Drop for PostWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn process_post_command(
    registry: &ResourceRegistry,
    sync_thread: &SyncThread,
    command: PostCommand,
) -> WorkerProcessingResult {
    let backend = registry.backend();
    match command {
        PostCommand::Post {
            reference,
            callback,
        } => {
            backend.post(reference.handle(), reference.color_buffer());
            drop(reference);
            if let Some(callback) = callback {
                let _ = sync_thread.trigger_general(callback, "post completion");
            }
        }
        PostCommand::Compose { request, callback } => {
            backend.compose(&request);
            if let Some(callback) = callback {
                let _ = sync_thread.trigger_general(callback, "compose completion");
            }
        }
        PostCommand::Screenshot {
            params,
            color_buffer,
            reply,
        } => {
            if reply.is_canceled() {
                debug!("screenshot of {} abandoned", params.color_buffer);
            } else {
                let pixels = backend.screenshot(color_buffer.as_ref(), &params);
                if pixels.is_none() {
                    error!("screenshot of {} failed", params.color_buffer);
                }
                let _ = reply.send(pixels);
            }
        }
        PostCommand::Viewport { width, height } => backend.viewport(width, height),
        PostCommand::Clear => backend.clear(),
        PostCommand::Block {
            scheduled,
            continue_signal,
        } => {
            let _ = scheduled.send(());
            let _ = continue_signal.wait();
        }
        PostCommand::Exit => return WorkerProcessingResult::Stop,
    }
    WorkerProcessingResult::Continue
}
