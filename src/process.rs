// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap as Map;
use std::collections::BTreeSet as Set;
use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use log::error;
use log::warn;

use crate::handle::ProcessId;
use crate::handle::ResourceHandle;

/// Opaque key naming a cleanup callback, chosen by whoever registers it.
pub type CleanupKey = u64;

/// Runs once when the owning process is cleaned up.
pub type CleanupCallback = Box<dyn FnOnce() + Send>;

/// Everything a single guest process holds.
#[derive(Default)]
pub struct ProcessOwnership {
    /// Multiset: a color buffer opened N times by the process is listed with count N.
    pub color_buffers: Map<ResourceHandle, u32>,
    pub window_surfaces: Set<ResourceHandle>,
    pub contexts: Set<ResourceHandle>,
    pub callbacks: Map<CleanupKey, CleanupCallback>,
}

impl ProcessOwnership {
    fn is_empty(&self) -> bool {
        self.color_buffers.is_empty()
            && self.window_surfaces.is_empty()
            && self.contexts.is_empty()
            && self.callbacks.is_empty()
    }
}

impl fmt::Debug for ProcessOwnership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOwnership")
            .field("color_buffers", &self.color_buffers)
            .field("window_surfaces", &self.window_surfaces)
            .field("contexts", &self.contexts)
            .field("callbacks", &self.callbacks.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Per-process state handed to the transport, which uses the sequence number to order ring
/// submissions from the process.
#[derive(Debug, Default)]
pub struct ProcessResources {
    sequence_number: Arc<AtomicU32>,
}

impl ProcessResources {
    pub fn with_sequence_number(value: u32) -> ProcessResources {
        ProcessResources {
            sequence_number: Arc::new(AtomicU32::new(value)),
        }
    }

    pub fn sequence_number(&self) -> Arc<AtomicU32> {
        self.sequence_number.clone()
    }
}

/// Maps a guest process to the handles and callbacks it owns.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    owned: Map<ProcessId, ProcessOwnership>,
    resources: Map<ProcessId, ProcessResources>,
}

impl ProcessTracker {
    pub fn new() -> ProcessTracker {
        Default::default()
    }

    pub fn add_color_buffer(&mut self, pid: ProcessId, handle: ResourceHandle) {
        *self
            .owned
            .entry(pid)
            .or_default()
            .color_buffers
            .entry(handle)
            .or_insert(0) += 1;
    }

    /// Drops one reference `pid` holds on `handle`. Returns false if it held none.
    pub fn remove_color_buffer(&mut self, pid: ProcessId, handle: ResourceHandle) -> bool {
        let ownership = match self.owned.get_mut(&pid) {
            Some(ownership) => ownership,
            None => return false,
        };

        match ownership.color_buffers.entry(handle) {
            Entry::Occupied(mut o) => {
                *o.get_mut() -= 1;
                if *o.get() == 0 {
                    o.remove();
                }
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn add_window_surface(&mut self, pid: ProcessId, handle: ResourceHandle) {
        self.owned
            .entry(pid)
            .or_default()
            .window_surfaces
            .insert(handle);
    }

    pub fn add_context(&mut self, pid: ProcessId, handle: ResourceHandle) {
        self.owned.entry(pid).or_default().contexts.insert(handle);
    }

    /// Removes every mention of a destroyed handle, whichever process holds it.
    pub fn forget(&mut self, handle: ResourceHandle) {
        for ownership in self.owned.values_mut() {
            ownership.color_buffers.remove(&handle);
            ownership.window_surfaces.remove(&handle);
            ownership.contexts.remove(&handle);
        }
    }

    pub fn register_callback(&mut self, pid: ProcessId, key: CleanupKey, cb: CleanupCallback) {
        match self.owned.entry(pid).or_default().callbacks.entry(key) {
            Entry::Occupied(_) => {
                error!("tried to override existing cleanup callback {} of process {}", key, pid)
            }
            Entry::Vacant(v) => {
                v.insert(cb);
            }
        }
    }

    pub fn unregister_callback(&mut self, pid: ProcessId, key: CleanupKey) -> bool {
        let removed = self
            .owned
            .get_mut(&pid)
            .and_then(|ownership| ownership.callbacks.remove(&key))
            .is_some();
        if !removed {
            error!("tried to erase nonexistent cleanup callback {} of process {}", key, pid);
        }
        removed
    }

    /// Takes everything `pid` owns out of the tracker.
    pub fn take(&mut self, pid: ProcessId) -> Option<ProcessOwnership> {
        self.owned.remove(&pid)
    }

    pub fn get(&self, pid: ProcessId) -> Option<&ProcessOwnership> {
        self.owned.get(&pid)
    }

    pub fn pids(&self) -> Vec<ProcessId> {
        self.owned.keys().copied().collect()
    }

    /// Whether any process has handles or callbacks recorded. Old guests never report a process
    /// id, so their snapshots carry none.
    pub fn has_ownership(&self) -> bool {
        self.owned.values().any(|ownership| !ownership.is_empty())
    }

    pub fn create_resources(&mut self, pid: ProcessId) -> Option<Arc<AtomicU32>> {
        match self.resources.entry(pid) {
            Entry::Occupied(_) => {
                warn!("process resources for {} already exist", pid);
                None
            }
            Entry::Vacant(v) => Some(v.insert(Default::default()).sequence_number()),
        }
    }

    pub fn insert_resources(&mut self, pid: ProcessId, resources: ProcessResources) {
        self.resources.insert(pid, resources);
    }

    pub fn remove_resources(&mut self, pid: ProcessId) -> Option<ProcessResources> {
        let removed = self.resources.remove(&pid);
        if removed.is_none() {
            warn!("no process resources to remove for {}", pid);
        }
        removed
    }

    pub fn resources(&self) -> impl Iterator<Item = (&ProcessId, &ProcessResources)> {
        self.resources.iter()
    }

    pub fn sequence_number(&self, pid: ProcessId) -> Option<Arc<AtomicU32>> {
        self.resources.get(&pid).map(|r| r.sequence_number())
    }
}
