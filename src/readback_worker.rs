// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pixel export for displays that are being recorded.

use std::collections::BTreeMap as Map;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::channel::oneshot;
use log::debug;
use log::error;
use log::warn;

use crate::backend::BackendResource;
use crate::error::GfxstreamResult;
use crate::handle::DisplayId;
use crate::handle::ResourceHandle;
use crate::registry::ResourceRegistry;
use crate::resource::ResourceKind;
use crate::worker::Completion;
use crate::worker::WorkerProcessingResult;
use crate::worker::WorkerThread;

const BYTES_PER_PIXEL: usize = 4;

pub enum ReadbackCommand {
    Init,
    AddRecordDisplay {
        display: DisplayId,
        width: u32,
        height: u32,
    },
    DelRecordDisplay(DisplayId),
    ReadColorBuffer {
        display: DisplayId,
        handle: ResourceHandle,
        color_buffer: Arc<dyn BackendResource>,
    },
    GetPixels {
        display: DisplayId,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    Exit,
}

struct DisplayReadback {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    ready: bool,
}

/// Per-display readback buffers. Only touched from the readback thread.
#[derive(Default)]
struct ReadbackState {
    initialized: bool,
    displays: Map<DisplayId, DisplayReadback>,
}

impl ReadbackState {
    fn process(&mut self, command: ReadbackCommand) -> WorkerProcessingResult {
        match command {
            ReadbackCommand::Init => {
                self.initialized = true;
                debug!("readback worker initialized");
            }
            ReadbackCommand::AddRecordDisplay {
                display,
                width,
                height,
            } => {
                if !self.initialized {
                    error!("readback worker used before init");
                }
                let len = (width as usize)
                    .saturating_mul(height as usize)
                    .saturating_mul(BYTES_PER_PIXEL);
                self.displays.insert(
                    display,
                    DisplayReadback {
                        width,
                        height,
                        pixels: vec![0u8; len],
                        ready: false,
                    },
                );
            }
            ReadbackCommand::DelRecordDisplay(display) => {
                if self.displays.remove(&display).is_none() {
                    warn!("display {} was not being recorded", display);
                }
            }
            ReadbackCommand::ReadColorBuffer {
                display,
                handle,
                color_buffer,
            } => self.read_color_buffer(display, handle, color_buffer.as_ref()),
            ReadbackCommand::GetPixels { display, reply } => {
                if reply.is_canceled() {
                    debug!("pixel request for display {} abandoned", display);
                } else {
                    let pixels = match self.displays.get(&display) {
                        Some(readback) if readback.ready => Some(readback.pixels.clone()),
                        Some(_) => None,
                        None => {
                            error!("display {} not configured for recording", display);
                            None
                        }
                    };
                    let _ = reply.send(pixels);
                }
            }
            ReadbackCommand::Exit => return WorkerProcessingResult::Stop,
        }
        WorkerProcessingResult::Continue
    }

    fn read_color_buffer(
        &mut self,
        display: DisplayId,
        handle: ResourceHandle,
        color_buffer: &dyn BackendResource,
    ) {
        let readback = match self.displays.get_mut(&display) {
            Some(readback) => readback,
            None => {
                error!("display {} not configured for recording", display);
                return;
            }
        };

        let pixels = match color_buffer.read_pixels() {
            Some(pixels) => pixels,
            None => {
                error!("failed to read back color buffer {}", handle);
                return;
            }
        };

        if pixels.len() != readback.pixels.len() {
            error!(
                "color buffer {} does not match the {}x{} display {}",
                handle, readback.width, readback.height, display
            );
            return;
        }
        readback.pixels.copy_from_slice(&pixels);
        readback.ready = true;
    }
}

pub struct ReadbackWorker {
    registry: Arc<ResourceRegistry>,
    initialized: AtomicBool,
    worker: WorkerThread<ReadbackCommand>,
}

impl ReadbackWorker {
    pub fn new(registry: Arc<ResourceRegistry>) -> ReadbackWorker {
        let mut state = ReadbackState::default();
        ReadbackWorker {
            registry,
            initialized: AtomicBool::new(false),
            worker: WorkerThread::new("gfxstream_readback", move |command| {
                state.process(command)
            }),
        }
    }

    /// Starts recording `display`. The first recorded display also initializes the worker.
    pub fn add_record_display(&self, display: DisplayId, width: u32, height: u32) -> Completion {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.worker.enqueue(ReadbackCommand::Init);
        }
        self.worker.enqueue(ReadbackCommand::AddRecordDisplay {
            display,
            width,
            height,
        })
    }

    pub fn del_record_display(&self, display: DisplayId) -> Completion {
        self.worker
            .enqueue(ReadbackCommand::DelRecordDisplay(display))
    }

    /// Copies the contents of color buffer `handle` into the buffer of `display`.
    pub fn read_color_buffer(
        &self,
        display: DisplayId,
        handle: ResourceHandle,
    ) -> GfxstreamResult<Completion> {
        let color_buffer = self.registry.resource(handle, ResourceKind::ColorBuffer)?;
        Ok(self.worker.enqueue(ReadbackCommand::ReadColorBuffer {
            display,
            handle,
            color_buffer,
        }))
    }

    /// The most recent pixels read back for `display`, or `None` before the first readback.
    pub fn get_pixels(&self, display: DisplayId) -> oneshot::Receiver<Option<Vec<u8>>> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .worker
            .enqueue(ReadbackCommand::GetPixels { display, reply });
        receiver
    }

    pub fn stop(&self) {
        let _ = self.worker.enqueue(ReadbackCommand::Exit);
        self.worker.join();
    }
}

impl Drop for ReadbackWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;
    use crate::backend::ColorBufferParams;
    use crate::backend::HostMemoryBackend;
    use crate::clock::ManualClock;
    use crate::config::RegistryConfig;
    use crate::thread_info::ThreadInfoTable;

    fn registry() -> Arc<ResourceRegistry> {
        Arc::new(ResourceRegistry::new(
            Arc::new(HostMemoryBackend::new()),
            Arc::new(ManualClock::new(0)),
            RegistryConfig::default(),
            ThreadInfoTable::new(),
        ))
    }

    #[test]
    fn reads_back_into_display_buffer() {
        let registry = registry();
        let worker = ReadbackWorker::new(registry.clone());
        let handle = registry.create_color_buffer(
            1,
            ColorBufferParams {
                width: 2,
                height: 1,
                ..Default::default()
            },
        );
        assert!(registry.update_color_buffer(handle, &[1, 2, 3, 4, 5, 6, 7, 8]));

        worker.add_record_display(0, 2, 1).wait().unwrap();
        assert_eq!(block_on(worker.get_pixels(0)).unwrap(), None);

        worker.read_color_buffer(0, handle).unwrap().wait().unwrap();
        assert_eq!(
            block_on(worker.get_pixels(0)).unwrap(),
            Some(vec![1, 2, 3, 4, 5, 6, 7, 8])
        );

        worker.del_record_display(0).wait().unwrap();
        assert_eq!(block_on(worker.get_pixels(0)).unwrap(), None);
    }

    #[test]
    fn mismatched_size_is_ignored() {
        let registry = registry();
        let worker = ReadbackWorker::new(registry.clone());
        let handle = registry.create_color_buffer(
            1,
            ColorBufferParams {
                width: 4,
                height: 4,
                ..Default::default()
            },
        );
        worker.add_record_display(0, 2, 2).wait().unwrap();
        worker.read_color_buffer(0, handle).unwrap().wait().unwrap();
        assert_eq!(block_on(worker.get_pixels(0)).unwrap(), None);
        assert!(worker.read_color_buffer(0, 99).is_err());
    }
}
