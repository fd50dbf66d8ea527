// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The handle registry: the single source of truth for which GPU resources exist.
//!
//! Three locks guard the registry and are always taken in this order:
//!
//! 1. `state`, the structural lock. Every insertion or removal of a handle, and every change to
//!    the delayed close queue or process ownership, happens under it.
//! 2. `context_structure`, held for writing while contexts are created or destroyed. External
//!    decoders take the read side around calls into the driver that must not race with that.
//!    Nobody holding the read side may call back into the registry, since every registry
//!    operation takes `state` first.
//! 3. `records`, the handle map itself. Lookups take only this lock so they never wait on a slow
//!    structural operation that has not reached the map yet.

mod snapshot;

use std::collections::BTreeMap as Map;
use std::sync::atomic::AtomicU32;
use std::sync::mpsc::sync_channel;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::sync::mpsc::TrySendError;
use std::sync::Arc;
use std::sync::RwLockReadGuard;

use log::debug;
use log::error;

use crate::backend::BackendResource;
use crate::backend::ColorBufferParams;
use crate::backend::ContextParams;
use crate::backend::DataBufferParams;
use crate::backend::GraphicsBackend;
use crate::backend::ResourceParams;
use crate::backend::WindowSurfaceParams;
use crate::clock::Clock;
use crate::config::DisplayConfig;
use crate::config::RegistryConfig;
use crate::config::RendererFeatures;
use crate::delayed_close::DelayedCloseEntry;
use crate::delayed_close::DelayedCloseQueue;
use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;
use crate::handle::HandleAllocator;
use crate::handle::ProcessId;
use crate::handle::ResourceHandle;
use crate::handle::INVALID_HANDLE;
use crate::process::CleanupCallback;
use crate::process::CleanupKey;
use crate::process::ProcessOwnership;
use crate::process::ProcessResources;
use crate::process::ProcessTracker;
use crate::resource::RecordInfo;
use crate::resource::ResourceKind;
use crate::resource::ResourceRecord;
use crate::sync::Mutex;
use crate::sync::RwLock;
use crate::thread_info::ThreadInfoTable;

/// Color buffer destroys the guest kernel may have in flight before the host falls behind.
pub const MAX_OUTSTANDING_DESTROYS: usize = 1024;

type Records = Map<ResourceHandle, ResourceRecord>;

/// What a close did to its resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    NotFound,
    /// The refcount is still above zero, or the close did not count.
    Retained,
    /// The refcount reached zero and the resource waits in the delayed close queue.
    Scheduled,
    Destroyed,
}

impl CloseOutcome {
    pub fn released(self) -> bool {
        matches!(self, CloseOutcome::Scheduled | CloseOutcome::Destroyed)
    }
}

struct RegistryState {
    allocator: HandleAllocator,
    delayed_closes: DelayedCloseQueue,
    processes: ProcessTracker,
    last_posted_color_buffer: ResourceHandle,
    display: DisplayConfig,
    guest_managed_color_buffer_lifetime: bool,
    outstanding_destroys: Receiver<ResourceHandle>,
}

fn protocol_violation(message: String) -> ! {
    error!("{}", message);
    panic!("{}", message);
}

pub struct ResourceRegistry {
    backend: Arc<dyn GraphicsBackend>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    threads: Arc<ThreadInfoTable>,
    state: Mutex<RegistryState>,
    context_structure: RwLock<()>,
    records: Mutex<Records>,
    outstanding_destroys: SyncSender<ResourceHandle>,
}

impl ResourceRegistry {
    pub fn new(
        backend: Arc<dyn GraphicsBackend>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
        threads: Arc<ThreadInfoTable>,
    ) -> ResourceRegistry {
        let (sender, receiver) = sync_channel(MAX_OUTSTANDING_DESTROYS);
        ResourceRegistry {
            backend,
            clock,
            config,
            threads,
            state: Mutex::new(RegistryState {
                allocator: HandleAllocator::new(),
                delayed_closes: DelayedCloseQueue::new(),
                processes: ProcessTracker::new(),
                last_posted_color_buffer: INVALID_HANDLE,
                display: config.display,
                guest_managed_color_buffer_lifetime: config
                    .features
                    .guest_managed_color_buffer_lifetime,
                outstanding_destroys: receiver,
            }),
            context_structure: RwLock::new(()),
            records: Mutex::new(Default::default()),
            outstanding_destroys: sender,
        }
    }

    /// Replaces the handle allocator. Tests use this to start near the end of the handle space.
    pub fn set_handle_allocator(&self, allocator: HandleAllocator) {
        self.state.lock().allocator = allocator;
    }

    pub fn features(&self) -> RendererFeatures {
        self.config.features
    }

    pub fn backend(&self) -> &Arc<dyn GraphicsBackend> {
        &self.backend
    }

    pub fn threads(&self) -> &Arc<ThreadInfoTable> {
        &self.threads
    }

    pub fn display_config(&self) -> DisplayConfig {
        self.state.lock().display
    }

    pub fn guest_managed_color_buffer_lifetime(&self) -> bool {
        self.state.lock().guest_managed_color_buffer_lifetime
    }

    /// Registers a resource under a fresh handle. Returns `INVALID_HANDLE` if the backend is out
    /// of resources or a context names an unknown share context.
    pub fn create(&self, pid: ProcessId, params: ResourceParams) -> ResourceHandle {
        self.create_impl(pid, params, None)
    }

    /// Registers a resource under a guest-chosen handle.
    ///
    /// # Panics
    ///
    /// The guest validates handles before asking for them, so a collision means guest and host
    /// disagree about the resource graph. That is not recoverable and takes the host down.
    pub fn create_with_handle(
        &self,
        pid: ProcessId,
        params: ResourceParams,
        handle: ResourceHandle,
    ) -> ResourceHandle {
        self.create_impl(pid, params, Some(handle))
    }

    pub fn create_color_buffer(&self, pid: ProcessId, params: ColorBufferParams) -> ResourceHandle {
        self.create(pid, ResourceParams::ColorBuffer(params))
    }

    pub fn create_color_buffer_with_handle(
        &self,
        pid: ProcessId,
        params: ColorBufferParams,
        handle: ResourceHandle,
    ) -> ResourceHandle {
        self.create_with_handle(pid, ResourceParams::ColorBuffer(params), handle)
    }

    pub fn create_buffer(&self, params: DataBufferParams) -> ResourceHandle {
        self.create(0, ResourceParams::DataBuffer(params))
    }

    pub fn create_buffer_with_handle(
        &self,
        params: DataBufferParams,
        handle: ResourceHandle,
    ) -> ResourceHandle {
        self.create_with_handle(0, ResourceParams::DataBuffer(params), handle)
    }

    pub fn create_context(&self, pid: ProcessId, params: ContextParams) -> ResourceHandle {
        self.create(pid, ResourceParams::Context(params))
    }

    pub fn create_window_surface(
        &self,
        pid: ProcessId,
        params: WindowSurfaceParams,
    ) -> ResourceHandle {
        self.create(pid, ResourceParams::WindowSurface(params))
    }

    fn create_impl(
        &self,
        pid: ProcessId,
        params: ResourceParams,
        requested: Option<ResourceHandle>,
    ) -> ResourceHandle {
        let kind = params.kind();
        let mut state = self.state.lock();
        let _context_guard = (kind == ResourceKind::Context).then(|| self.context_structure.write());
        let mut records = self.records.lock();

        if kind == ResourceKind::ColorBuffer {
            self.sweep_color_buffers_locked(&mut state, &mut records);
        }
        self.sweep_delayed_locked(&mut state, &mut records, false);

        if let ResourceParams::Context(context) = params {
            let share = context.share_context;
            if share != INVALID_HANDLE
                && records.get(&share).map(|r| r.kind()) != Some(ResourceKind::Context)
            {
                error!("failed to find share context {}", share);
                return INVALID_HANDLE;
            }
        }

        let handle = match requested {
            Some(handle) => {
                if handle == INVALID_HANDLE || records.contains_key(&handle) {
                    protocol_violation(format!("{:?} {} already exists", kind, handle));
                }
                handle
            }
            None => state.allocator.allocate(|h| records.contains_key(&h)),
        };

        let backend = match self.backend.create_resource(handle, &params) {
            Some(backend) => backend,
            None => {
                error!("{}", GfxstreamError::BackendAllocation(kind));
                return INVALID_HANDLE;
            }
        };

        let mut record = ResourceRecord::new(handle, params, backend);
        match kind {
            ResourceKind::ColorBuffer => {
                // With the refcount pipe the guest kernel owns the count; one reference keeps the
                // buffer off the delayed close queue across snapshot load.
                if self.config.features.refcount_pipe {
                    record.refcount = 1;
                } else if self.config.features.legacy_refcount_init {
                    record.refcount = 1;
                    if pid != 0 {
                        state.processes.add_color_buffer(pid, handle);
                    }
                }
            }
            ResourceKind::DataBuffer => record.refcount = 1,
            ResourceKind::Context => {
                record.refcount = 1;
                if pid != 0 {
                    state.processes.add_context(pid, handle);
                }
            }
            ResourceKind::WindowSurface => {
                record.refcount = 1;
                if pid != 0 {
                    state.processes.add_window_surface(pid, handle);
                }
            }
        }

        records.insert(handle, record);
        handle
    }

    /// Takes a reference on `handle`, cancelling any pending delayed close.
    pub fn open(&self, handle: ResourceHandle) -> GfxstreamResult<()> {
        self.open_owned(0, handle)
    }

    /// Like `open`, and records that `pid` holds the reference so process cleanup can drop it.
    pub fn open_owned(&self, pid: ProcessId, handle: ResourceHandle) -> GfxstreamResult<()> {
        let mut state = self.state.lock();
        let mut records = self.records.lock();

        let record = match records.get_mut(&handle) {
            Some(record) => record,
            None => {
                error!("open: handle {} not found", handle);
                return Err(GfxstreamError::InvalidResourceHandle(handle));
            }
        };

        let is_color_buffer = record.kind() == ResourceKind::ColorBuffer;
        if is_color_buffer && self.config.features.refcount_pipe {
            return Ok(());
        }

        record.refcount = record.refcount.saturating_add(1);
        mark_opened(&mut state.delayed_closes, record);
        if is_color_buffer && pid != 0 {
            state.processes.add_color_buffer(pid, handle);
        }
        Ok(())
    }

    /// Drops a reference on `handle`. Returns whether the resource was destroyed.
    pub fn close(&self, handle: ResourceHandle, forced: bool) -> bool {
        self.close_with_outcome(handle, forced) == CloseOutcome::Destroyed
    }

    pub fn close_with_outcome(&self, handle: ResourceHandle, forced: bool) -> CloseOutcome {
        let mut state = self.state.lock();
        self.close_in(&mut state, handle, forced)
    }

    /// Drops a reference `pid` holds. A process that does not hold `handle` cannot close it.
    pub fn close_owned(&self, pid: ProcessId, handle: ResourceHandle) -> bool {
        let mut state = self.state.lock();
        if pid != 0 && self.kind_of(handle) == Some(ResourceKind::ColorBuffer) {
            if self.config.features.refcount_pipe {
                return false;
            }
            if !state.processes.remove_color_buffer(pid, handle) {
                debug!("process {} does not hold color buffer {}", pid, handle);
                return false;
            }
        }
        self.close_in(&mut state, handle, false) == CloseOutcome::Destroyed
    }

    fn close_in(
        &self,
        state: &mut RegistryState,
        handle: ResourceHandle,
        forced: bool,
    ) -> CloseOutcome {
        let kind = match self.kind_of(handle) {
            Some(kind) => kind,
            None => {
                // Normal when the guest closes after the host already collected the resource.
                debug!("close: handle {} already gone", handle);
                return CloseOutcome::NotFound;
            }
        };

        let _context_guard = (kind == ResourceKind::Context).then(|| self.context_structure.write());
        let mut records = self.records.lock();
        let outcome = self.close_locked(state, &mut records, handle, forced);
        self.sweep_delayed_locked(state, &mut records, false);
        outcome
    }

    fn close_locked(
        &self,
        state: &mut RegistryState,
        records: &mut Records,
        handle: ResourceHandle,
        forced: bool,
    ) -> CloseOutcome {
        let record = match records.get_mut(&handle) {
            Some(record) => record,
            None => return CloseOutcome::NotFound,
        };

        let kind = record.kind();
        if kind == ResourceKind::ColorBuffer && self.config.features.refcount_pipe {
            return CloseOutcome::Retained;
        }
        if record.refcount == 0 {
            return CloseOutcome::Retained;
        }

        record.refcount -= 1;
        if record.refcount > 0 {
            return CloseOutcome::Retained;
        }

        let delay = kind == ResourceKind::ColorBuffer
            && !forced
            && !self.config.features.no_delay_close_color_buffer;
        if delay {
            let now = self.clock.now_us();
            record.closed_at_us = Some(now);
            state.delayed_closes.schedule(handle, now);
            return CloseOutcome::Scheduled;
        }

        self.destroy_locked(state, records, handle, forced);
        CloseOutcome::Destroyed
    }

    /// Removes `handle` outright. If it was a window surface with a bound color buffer, that
    /// buffer loses the surface's reference and the outcome is returned.
    fn destroy_locked(
        &self,
        state: &mut RegistryState,
        records: &mut Records,
        handle: ResourceHandle,
        forced: bool,
    ) -> Option<(ResourceHandle, CloseOutcome)> {
        let record = records.remove(&handle)?;
        state.processes.forget(handle);
        if state.last_posted_color_buffer == handle {
            state.last_posted_color_buffer = INVALID_HANDLE;
        }
        if let Some(ts) = record.closed_at_us {
            state.delayed_closes.cancel(handle, ts);
        }

        match record.bound_color_buffer {
            Some(color_buffer) if !state.guest_managed_color_buffer_lifetime => Some((
                color_buffer,
                self.release_color_buffer_locked(state, records, color_buffer, forced),
            )),
            _ => None,
        }
    }

    /// Drops the reference a window surface binding held.
    fn release_color_buffer_locked(
        &self,
        state: &mut RegistryState,
        records: &mut Records,
        handle: ResourceHandle,
        forced: bool,
    ) -> CloseOutcome {
        if self.config.features.refcount_pipe {
            if self.dec_ref_locked(state, records, handle) {
                CloseOutcome::Destroyed
            } else {
                CloseOutcome::Retained
            }
        } else {
            self.close_locked(state, records, handle, forced)
        }
    }

    /// Decrements without any delay; zero destroys. Returns whether it destroyed.
    fn dec_ref_locked(
        &self,
        state: &mut RegistryState,
        records: &mut Records,
        handle: ResourceHandle,
    ) -> bool {
        let record = match records.get_mut(&handle) {
            Some(record) => record,
            None => return false,
        };

        record.refcount = record.refcount.saturating_sub(1);
        if record.refcount == 0 {
            self.destroy_locked(state, records, handle, false);
            return true;
        }
        false
    }

    /// Drops a reference but never destroys: a zero refcount schedules a delayed close instead.
    pub fn dec_ref_no_destroy(&self, handle: ResourceHandle) {
        let mut state = self.state.lock();
        let mut records = self.records.lock();

        let record = match records.get_mut(&handle) {
            Some(record) => record,
            None => return,
        };
        if record.refcount == 0 {
            return;
        }

        record.refcount -= 1;
        if record.refcount == 0 && record.kind() == ResourceKind::ColorBuffer {
            let now = self.clock.now_us();
            record.closed_at_us = Some(now);
            state.delayed_closes.schedule(handle, now);
        }
    }

    /// Called when the guest kernel drops its last reference to a color buffer. Never blocks; the
    /// destroy happens the next time the registry sweeps.
    pub fn on_last_color_buffer_ref(&self, handle: ResourceHandle) {
        match self.outstanding_destroys.try_send(handle) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => error!(
                "too many outstanding color buffer destroys, leaking handle {:#x}",
                handle
            ),
            Err(TrySendError::Disconnected(_)) => {
                error!("destroy channel closed, leaking handle {:#x}", handle)
            }
        }
    }

    /// Applies every pending `on_last_color_buffer_ref`.
    pub fn sweep_color_buffers(&self) {
        let mut state = self.state.lock();
        let mut records = self.records.lock();
        self.sweep_color_buffers_locked(&mut state, &mut records);
    }

    fn sweep_color_buffers_locked(&self, state: &mut RegistryState, records: &mut Records) {
        loop {
            let handle = match state.outstanding_destroys.try_recv() {
                Ok(handle) => handle,
                Err(_) => break,
            };
            self.dec_ref_locked(state, records, handle);
        }
    }

    /// Destroys color buffers whose grace period has run out, or every pending one if `forced`.
    /// Returns the destroyed handles.
    pub fn sweep_delayed_closes(&self, forced: bool) -> Vec<ResourceHandle> {
        let mut state = self.state.lock();
        let mut records = self.records.lock();
        self.sweep_delayed_locked(&mut state, &mut records, forced)
    }

    fn sweep_delayed_locked(
        &self,
        state: &mut RegistryState,
        records: &mut Records,
        forced: bool,
    ) -> Vec<ResourceHandle> {
        let now = self.clock.now_us();
        let expired = state
            .delayed_closes
            .sweep(now, self.config.close_grace_period_us, forced);

        let mut destroyed = Vec::new();
        for handle in expired {
            match records.get_mut(&handle) {
                Some(record) if record.refcount == 0 => record.closed_at_us = None,
                _ => continue,
            }
            self.destroy_locked(state, records, handle, forced);
            destroyed.push(handle);
        }
        destroyed
    }

    pub fn pending_delayed_closes(&self) -> Vec<DelayedCloseEntry> {
        self.state.lock().delayed_closes.pending()
    }

    fn kind_of(&self, handle: ResourceHandle) -> Option<ResourceKind> {
        self.records.lock().get(&handle).map(|r| r.kind())
    }

    /// Looks `handle` up without touching its refcount.
    pub fn find(&self, handle: ResourceHandle) -> Option<RecordInfo> {
        self.records.lock().get(&handle).map(|r| r.info())
    }

    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.records.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The backend state of `handle`, checked to be of `kind`.
    pub fn resource(
        &self,
        handle: ResourceHandle,
        kind: ResourceKind,
    ) -> GfxstreamResult<Arc<dyn BackendResource>> {
        let records = self.records.lock();
        let record = records
            .get(&handle)
            .ok_or(GfxstreamError::InvalidResourceHandle(handle))?;
        if record.kind() != kind {
            return Err(GfxstreamError::InvalidKind {
                handle,
                expected: kind,
                found: record.kind(),
            });
        }
        Ok(record.backend.clone())
    }

    pub fn read_buffer(&self, handle: ResourceHandle, offset: u64, size: u64) -> Option<Vec<u8>> {
        match self.resource(handle, ResourceKind::DataBuffer) {
            Ok(resource) => resource.read_bytes(offset, size),
            Err(e) => {
                error!("failed to read buffer: {}", e);
                None
            }
        }
    }

    pub fn update_buffer(&self, handle: ResourceHandle, offset: u64, bytes: &[u8]) -> bool {
        match self.resource(handle, ResourceKind::DataBuffer) {
            Ok(resource) => resource.write_bytes(offset, bytes),
            Err(e) => {
                error!("failed to update buffer: {}", e);
                false
            }
        }
    }

    pub fn read_color_buffer(&self, handle: ResourceHandle) -> Option<Vec<u8>> {
        match self.resource(handle, ResourceKind::ColorBuffer) {
            Ok(resource) => resource.read_pixels(),
            Err(e) => {
                error!("failed to read color buffer: {}", e);
                None
            }
        }
    }

    pub fn update_color_buffer(&self, handle: ResourceHandle, pixels: &[u8]) -> bool {
        match self.resource(handle, ResourceKind::ColorBuffer) {
            Ok(resource) => resource.write_bytes(0, pixels),
            Err(e) => {
                error!("failed to update color buffer: {}", e);
                false
            }
        }
    }

    /// Destroys a data buffer regardless of its refcount.
    pub fn close_buffer(&self, handle: ResourceHandle) -> bool {
        let mut state = self.state.lock();
        let mut records = self.records.lock();
        if records.get(&handle).map(|r| r.kind()) != Some(ResourceKind::DataBuffer) {
            error!("failed to find buffer {}", handle);
            return false;
        }
        self.destroy_locked(&mut state, &mut records, handle, false);
        true
    }

    pub fn destroy_context(&self, handle: ResourceHandle) -> bool {
        let mut state = self.state.lock();
        let _context_guard = self.context_structure.write();
        let mut records = self.records.lock();
        self.sweep_color_buffers_locked(&mut state, &mut records);

        if records.get(&handle).map(|r| r.kind()) != Some(ResourceKind::Context) {
            error!("failed to find context {}", handle);
            return false;
        }
        self.destroy_locked(&mut state, &mut records, handle, false);
        true
    }

    /// Destroys a window surface. Returns whether that also destroyed its bound color buffer.
    pub fn destroy_window_surface(&self, handle: ResourceHandle) -> bool {
        let mut state = self.state.lock();
        let mut records = self.records.lock();
        if records.get(&handle).map(|r| r.kind()) != Some(ResourceKind::WindowSurface) {
            error!("bad window surface handle {:#x}", handle);
            return false;
        }
        matches!(
            self.destroy_locked(&mut state, &mut records, handle, false),
            Some((_, CloseOutcome::Destroyed))
        )
    }

    /// Makes `color_buffer` the draw target of `surface`. The binding holds a reference unless
    /// the guest manages color buffer lifetime, and the previous target loses its reference.
    pub fn set_window_surface_color_buffer(
        &self,
        surface: ResourceHandle,
        color_buffer: ResourceHandle,
    ) -> bool {
        let mut state = self.state.lock();
        let mut records = self.records.lock();

        if records.get(&surface).map(|r| r.kind()) != Some(ResourceKind::WindowSurface) {
            error!("bad window surface handle {:#x}", surface);
            return false;
        }

        let guest_managed = state.guest_managed_color_buffer_lifetime;
        match records.get_mut(&color_buffer) {
            Some(record) if record.kind() == ResourceKind::ColorBuffer => {
                mark_opened(&mut state.delayed_closes, record);
                if !guest_managed {
                    record.refcount = record.refcount.saturating_add(1);
                }
            }
            _ => {
                error!("bad color buffer handle {}", color_buffer);
                return false;
            }
        }

        let previous = records
            .get_mut(&surface)
            .and_then(|r| r.bound_color_buffer.replace(color_buffer));
        if let Some(previous) = previous {
            if !guest_managed {
                self.release_color_buffer_locked(&mut state, &mut records, previous, false);
            }
        }
        true
    }

    /// Takes the post reference on a color buffer and hands its backend state to the post worker.
    /// The worker gives the reference back with `dec_ref_no_destroy` once the frame is out.
    pub fn prepare_post(&self, handle: ResourceHandle) -> Option<Arc<dyn BackendResource>> {
        let mut state = self.state.lock();
        let mut records = self.records.lock();

        let record = match records.get_mut(&handle) {
            Some(record) if record.kind() == ResourceKind::ColorBuffer => record,
            _ => {
                error!("cannot post color buffer {}", handle);
                return None;
            }
        };

        record.refcount = record.refcount.saturating_add(1);
        mark_opened(&mut state.delayed_closes, record);
        let backend = record.backend.clone();
        state.last_posted_color_buffer = handle;
        Some(backend)
    }

    pub fn last_posted_color_buffer(&self) -> ResourceHandle {
        self.state.lock().last_posted_color_buffer
    }

    /// Held by external decoders around driver calls that must not overlap context creation or
    /// destruction. Producer threads never take it: every request they run goes through registry
    /// methods, and calling those with the guard held inverts the lock order.
    pub fn lock_context_structure_read(&self) -> RwLockReadGuard<'_, ()> {
        self.context_structure.read()
    }

    pub fn create_process_resources(&self, pid: ProcessId) -> Option<Arc<AtomicU32>> {
        self.state.lock().processes.create_resources(pid)
    }

    pub fn remove_process_resources(&self, pid: ProcessId) -> Option<ProcessResources> {
        self.state.lock().processes.remove_resources(pid)
    }

    pub fn process_sequence_number(&self, pid: ProcessId) -> Option<Arc<AtomicU32>> {
        self.state.lock().processes.sequence_number(pid)
    }

    /// Runs `cb` when `pid` is cleaned up. Keys are unique per process; a second registration
    /// under the same key is dropped.
    pub fn register_cleanup_callback<F>(&self, pid: ProcessId, key: CleanupKey, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.state
            .lock()
            .processes
            .register_callback(pid, key, Box::new(cb));
    }

    pub fn unregister_cleanup_callback(&self, pid: ProcessId, key: CleanupKey) -> bool {
        self.state.lock().processes.unregister_callback(pid, key)
    }

    /// Every handle `pid` currently owns, of any kind.
    pub fn owned_handles(&self, pid: ProcessId) -> Vec<ResourceHandle> {
        let state = self.state.lock();
        let ownership = match state.processes.get(pid) {
            Some(ownership) => ownership,
            None => return Vec::new(),
        };

        let mut handles: Vec<ResourceHandle> = ownership
            .color_buffers
            .keys()
            .chain(ownership.window_surfaces.iter())
            .chain(ownership.contexts.iter())
            .copied()
            .collect();
        handles.sort_unstable();
        handles
    }

    /// Reclaims everything a departed guest process held.
    ///
    /// Producers serving `pid` are asked to exit and this waits until they have, so nothing is
    /// torn down under a live decoder. Returns the handles whose refcount reached zero. Cleanup
    /// callbacks run after the registry locks are released since they may call back in.
    pub fn cleanup_process(&self, pid: ProcessId) -> Vec<ResourceHandle> {
        self.threads.wait_for_process_exit(pid);

        let (released, callbacks) = {
            let mut state = self.state.lock();
            let mut ownership = match state.processes.take(pid) {
                Some(ownership) => ownership,
                None => {
                    debug!("process {} has nothing to clean up", pid);
                    return Vec::new();
                }
            };
            let callbacks = std::mem::take(&mut ownership.callbacks);

            let _context_guard =
                (!ownership.contexts.is_empty()).then(|| self.context_structure.write());
            let mut records = self.records.lock();
            let released = self.reclaim_locked(&mut state, &mut records, ownership, false);
            self.sweep_delayed_locked(&mut state, &mut records, false);
            (released, callbacks)
        };

        for (_, cb) in callbacks {
            cb();
        }
        released
    }

    fn reclaim_locked(
        &self,
        state: &mut RegistryState,
        records: &mut Records,
        ownership: ProcessOwnership,
        forced: bool,
    ) -> Vec<ResourceHandle> {
        let mut released = Vec::new();

        for surface in ownership.window_surfaces {
            if records.get(&surface).map(|r| r.kind()) != Some(ResourceKind::WindowSurface) {
                continue;
            }
            if let Some((color_buffer, outcome)) =
                self.destroy_locked(state, records, surface, forced)
            {
                if outcome.released() {
                    released.push(color_buffer);
                }
            }
            released.push(surface);
        }

        // A color buffer shared across processes is closed once per open by this process.
        if !state.guest_managed_color_buffer_lifetime {
            for (color_buffer, count) in ownership.color_buffers {
                for _ in 0..count {
                    if self
                        .close_locked(state, records, color_buffer, forced)
                        .released()
                    {
                        released.push(color_buffer);
                    }
                }
            }
        }

        for context in ownership.contexts {
            if records.get(&context).map(|r| r.kind()) != Some(ResourceKind::Context) {
                continue;
            }
            self.destroy_locked(state, records, context, forced);
            released.push(context);
        }

        released
    }

    /// Force-cleans every process. Returns their cleanup callbacks for the caller to run once it
    /// has released the registry locks.
    fn reclaim_all_locked(
        &self,
        state: &mut RegistryState,
        records: &mut Records,
    ) -> Vec<CleanupCallback> {
        let mut callbacks = Vec::new();
        for pid in state.processes.pids() {
            if let Some(mut ownership) = state.processes.take(pid) {
                callbacks.extend(std::mem::take(&mut ownership.callbacks).into_values());
                self.reclaim_locked(state, records, ownership, true);
            }
        }
        callbacks
    }
}

fn mark_opened(delayed_closes: &mut DelayedCloseQueue, record: &mut ResourceRecord) {
    record.opened = true;
    if let Some(ts) = record.closed_at_us.take() {
        delayed_closes.cancel(record.handle, ts);
    }
}
