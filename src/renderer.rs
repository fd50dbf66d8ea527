// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The host-side renderer: the registry, its workers and the producers of every connection.

use std::io::Read;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;

use crate::backend::GraphicsBackend;
use crate::clock::Clock;
use crate::clock::SystemClock;
use crate::config::DisplayConfig;
use crate::config::RegistryConfig;
use crate::config::RendererFeatures;
use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;
use crate::handle::ProcessId;
use crate::handle::ResourceHandle;
use crate::handle::INVALID_HANDLE;
use crate::post_worker::PostWorker;
use crate::process::ProcessResources;
use crate::readback_worker::ReadbackWorker;
use crate::registry::ResourceRegistry;
use crate::render_thread::RenderChannel;
use crate::render_thread::RenderThread;
use crate::snapshot;
use crate::snapshot::ReadBeExt;
use crate::snapshot::SnapshotProducer;
use crate::snapshot::WriteBeExt;
use crate::sync::Mutex;
use crate::sync_thread::SyncThread;
use crate::thread_info::ThreadInfoTable;
use crate::worker::Completion;
use crate::worker::WorkerProcessingResult;
use crate::worker::WorkerThread;

enum CleanupCommand {
    Cleanup {
        pid: ProcessId,
        resources: Option<ProcessResources>,
    },
    Exit,
}

/// Reclaims departed processes off the connection threads. Cleanup waits for producers to exit,
/// which can take a while.
struct ProcessCleanupThread {
    worker: WorkerThread<CleanupCommand>,
}

impl ProcessCleanupThread {
    fn new(registry: Arc<ResourceRegistry>) -> ProcessCleanupThread {
        let worker = WorkerThread::new("gfxstream_cleanup", move |command| match command {
            CleanupCommand::Cleanup { pid, resources } => {
                let released = registry.cleanup_process(pid);
                debug!("process {} released {} resources", pid, released.len());
                drop(resources);
                WorkerProcessingResult::Continue
            }
            CleanupCommand::Exit => WorkerProcessingResult::Stop,
        });
        worker.start();
        ProcessCleanupThread { worker }
    }

    fn cleanup(&self, pid: ProcessId, resources: Option<ProcessResources>) -> Completion {
        self.worker
            .enqueue(CleanupCommand::Cleanup { pid, resources })
    }

    fn wait_for_cleanup(&self) {
        let _ = self.worker.wait_queued_items();
    }

    fn stop(&self) {
        let _ = self.worker.enqueue(CleanupCommand::Exit);
        self.worker.join();
    }
}

/// Builds a `Renderer`.
pub struct RendererBuilder {
    backend: Option<Arc<dyn GraphicsBackend>>,
    clock: Option<Arc<dyn Clock>>,
    features: RendererFeatures,
    renderer_features: Option<String>,
    close_grace_period_us: u64,
    display: DisplayConfig,
}

impl RendererBuilder {
    pub fn new() -> RendererBuilder {
        let defaults = RegistryConfig::default();
        RendererBuilder {
            backend: None,
            clock: None,
            features: defaults.features,
            renderer_features: None,
            close_grace_period_us: defaults.close_grace_period_us,
            display: defaults.display,
        }
    }

    pub fn set_backend(mut self, backend: Arc<dyn GraphicsBackend>) -> RendererBuilder {
        self.backend = Some(backend);
        self
    }

    pub fn set_clock(mut self, clock: Arc<dyn Clock>) -> RendererBuilder {
        self.clock = Some(clock);
        self
    }

    pub fn set_features(mut self, features: RendererFeatures) -> RendererBuilder {
        self.features = features;
        self
    }

    /// A `Name:enabled,Name:disabled` list applied over `set_features` at build time.
    pub fn set_renderer_features(mut self, renderer_features: Option<String>) -> RendererBuilder {
        self.renderer_features = renderer_features;
        self
    }

    pub fn set_close_grace_period_us(mut self, close_grace_period_us: u64) -> RendererBuilder {
        self.close_grace_period_us = close_grace_period_us;
        self
    }

    pub fn set_display(mut self, display: DisplayConfig) -> RendererBuilder {
        self.display = display;
        self
    }

    pub fn build(self) -> GfxstreamResult<Renderer> {
        let backend = self
            .backend
            .ok_or(GfxstreamError::Unsupported("renderer needs a graphics backend"))?;
        if self.display.width == 0 || self.display.height == 0 {
            return Err(GfxstreamError::Unsupported("empty display"));
        }

        let mut features = self.features;
        if let Some(renderer_features) = self.renderer_features {
            features = features.apply(&renderer_features)?;
        }

        let config = RegistryConfig {
            features,
            close_grace_period_us: self.close_grace_period_us,
            display: self.display,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let registry = Arc::new(ResourceRegistry::new(
            backend,
            clock,
            config,
            ThreadInfoTable::new(),
        ));
        info!("renderer built with {:?}", features);
        Ok(Renderer::new(registry))
    }
}

impl Default for RendererBuilder {
    fn default() -> RendererBuilder {
        RendererBuilder::new()
    }
}

#[derive(Default)]
struct Producers {
    threads: Vec<Arc<RenderThread>>,
    /// From `pause_all_pre_save` or `load` until `resume_all`. New producers start paused.
    snapshot_pending: bool,
}

impl Producers {
    fn snapshot_producers(&self) -> Vec<Arc<dyn SnapshotProducer>> {
        self.threads
            .iter()
            .map(|t| t.clone() as Arc<dyn SnapshotProducer>)
            .collect()
    }
}

/// Owns the registry and every thread that works on it.
pub struct Renderer {
    registry: Arc<ResourceRegistry>,
    sync_thread: Arc<SyncThread>,
    post_worker: Arc<PostWorker>,
    readback_worker: ReadbackWorker,
    cleanup_thread: ProcessCleanupThread,
    producers: Mutex<Producers>,
    stopped: AtomicBool,
}

impl Renderer {
    fn new(registry: Arc<ResourceRegistry>) -> Renderer {
        let sync_thread = Arc::new(SyncThread::new());
        let post_worker = Arc::new(PostWorker::new(registry.clone(), sync_thread.clone()));
        Renderer {
            readback_worker: ReadbackWorker::new(registry.clone()),
            cleanup_thread: ProcessCleanupThread::new(registry.clone()),
            registry,
            sync_thread,
            post_worker,
            producers: Default::default(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn post_worker(&self) -> &Arc<PostWorker> {
        &self.post_worker
    }

    pub fn readback_worker(&self) -> &ReadbackWorker {
        &self.readback_worker
    }

    pub fn sync_thread(&self) -> &Arc<SyncThread> {
        &self.sync_thread
    }

    /// Opens a connection and starts its producer. The caller holds the guest end. While a
    /// snapshot is pending the producer starts paused and is saved with the others.
    pub fn create_render_channel(&self) -> GfxstreamResult<Arc<RenderChannel>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(GfxstreamError::WorkerStopped("renderer"));
        }

        let channel = Arc::new(RenderChannel::new());
        let mut producers = self.producers.lock();
        let render_thread = RenderThread::start(
            channel.clone(),
            self.registry.clone(),
            self.post_worker.clone(),
        )?;
        if producers.snapshot_pending {
            render_thread.pause_pre_snapshot();
        }

        producers.threads.retain(|t| !t.is_finished());
        producers.threads.push(render_thread);
        Ok(channel)
    }

    pub fn on_guest_graphics_process_create(&self, pid: ProcessId) {
        let _ = self.registry.create_process_resources(pid);
    }

    /// The virtio-gpu ring sequence number of `pid`.
    pub fn process_sequence_number(&self, pid: ProcessId) -> GfxstreamResult<Arc<AtomicU32>> {
        self.registry
            .process_sequence_number(pid)
            .ok_or(GfxstreamError::InvalidProcessId(pid))
    }

    /// Schedules reclamation of everything `pid` owns. The returned completion fires once it is
    /// done.
    pub fn cleanup_process(&self, pid: ProcessId) -> Completion {
        let resources = self.registry.remove_process_resources(pid);
        self.cleanup_thread.cleanup(pid, resources)
    }

    pub fn wait_for_process_cleanup(&self) {
        self.cleanup_thread.wait_for_cleanup();
    }

    /// Presents the last posted color buffer again, e.g. after the display was recreated.
    pub fn repost(&self) -> GfxstreamResult<Option<Completion>> {
        let handle: ResourceHandle = self.registry.last_posted_color_buffer();
        if handle == INVALID_HANDLE {
            return Ok(None);
        }
        self.post_worker.post(handle, None).map(Some)
    }

    /// Asks every producer to stop at its next request boundary and waits for pending process
    /// cleanups. A producer whose process is being cleaned up exits instead of pausing.
    pub fn pause_all_pre_save(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let producers = {
            let mut producers = self.producers.lock();
            producers.snapshot_pending = true;
            producers.snapshot_producers()
        };
        snapshot::pause_all(&producers);
        self.wait_for_process_cleanup();
    }

    pub fn resume_all(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let producers = {
            let mut producers = self.producers.lock();
            producers.snapshot_pending = false;
            producers.snapshot_producers()
        };
        snapshot::resume_all(&producers);
        if let Err(e) = self.repost() {
            debug!("nothing to repost after resume: {}", e);
        }
    }

    /// Writes a snapshot. Call `pause_all_pre_save` first and `resume_all` afterwards.
    pub fn save(&self, writer: &mut dyn Write) -> GfxstreamResult<()> {
        let stopped = self.stopped.load(Ordering::SeqCst);
        writer.put_bool(stopped)?;
        if stopped {
            return Ok(());
        }

        // In-flight posts hold references that must be returned before the refcounts are saved.
        self.post_worker.wait_queued_items()?;
        self.sync_thread.wait_queued_items();
        let producers = self.producers.lock().snapshot_producers();
        snapshot::save(&self.registry, &producers, writer)
    }

    /// Replaces the current state with a snapshot and returns one channel per restored producer,
    /// in save order, for the transport to reattach. Producers stay paused until `resume_all`.
    pub fn load(&self, reader: &mut dyn Read) -> GfxstreamResult<Vec<Arc<RenderChannel>>> {
        self.wait_for_process_cleanup();
        if reader.get_bool()? {
            warn!("snapshot was taken from a stopped renderer");
            return Ok(Vec::new());
        }

        let old_threads: Vec<_> = self.producers.lock().threads.drain(..).collect();
        for render_thread in old_threads {
            render_thread.shutdown();
        }
        self.post_worker.wait_queued_items()?;

        let saved = snapshot::load(&self.registry, reader)?;
        let mut channels = Vec::new();
        let mut restored = Vec::new();
        for state in saved {
            let channel = Arc::new(RenderChannel::new());
            restored.push(RenderThread::restore(
                channel.clone(),
                self.registry.clone(),
                self.post_worker.clone(),
                state,
            )?);
            channels.push(channel);
        }
        *self.producers.lock() = Producers {
            threads: restored,
            snapshot_pending: true,
        };
        Ok(channels)
    }

    /// Stops every producer and worker. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let render_threads: Vec<_> = self.producers.lock().threads.drain(..).collect();
        for render_thread in render_threads {
            render_thread.shutdown();
        }
        self.cleanup_thread.stop();
        self.readback_worker.stop();
        self.post_worker.stop();
        self.sync_thread.stop();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.stop();
    }
}
