// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap as Map;
use std::collections::BTreeSet as Set;
use std::io::Read;
use std::io::Write;
use std::sync::atomic::Ordering;

use log::error;
use log::info;
use log::warn;

use crate::backend::ColorBufferParams;
use crate::backend::ContextParams;
use crate::backend::DataBufferParams;
use crate::backend::ResourceParams;
use crate::backend::WindowSurfaceParams;
use crate::config::DisplayConfig;
use crate::delayed_close::DelayedCloseQueue;
use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;
use crate::handle::ProcessId;
use crate::handle::ResourceHandle;
use crate::handle::INVALID_HANDLE;
use crate::process::CleanupCallback;
use crate::process::ProcessResources;
use crate::process::ProcessTracker;
use crate::registry::Records;
use crate::registry::RegistryState;
use crate::registry::ResourceRegistry;
use crate::resource::ResourceKind;
use crate::resource::ResourceRecord;
use crate::snapshot::ReadBeExt;
use crate::snapshot::WriteBeExt;

fn put_params(writer: &mut dyn Write, params: &ResourceParams) -> GfxstreamResult<()> {
    match params {
        ResourceParams::ColorBuffer(p) => {
            writer.put_be32(p.width)?;
            writer.put_be32(p.height)?;
            writer.put_be32(p.internal_format)?;
            writer.put_be32(p.framework_format)?;
        }
        ResourceParams::DataBuffer(p) => {
            writer.put_be64(p.size)?;
            writer.put_be32(p.memory_property)?;
        }
        ResourceParams::Context(p) => {
            writer.put_be32(p.config)?;
            writer.put_be32(p.share_context)?;
            writer.put_be32(p.version)?;
        }
        ResourceParams::WindowSurface(p) => {
            writer.put_be32(p.config)?;
            writer.put_be32(p.width)?;
            writer.put_be32(p.height)?;
        }
    }
    Ok(())
}

fn get_params(reader: &mut dyn Read, kind: ResourceKind) -> GfxstreamResult<ResourceParams> {
    Ok(match kind {
        ResourceKind::ColorBuffer => ResourceParams::ColorBuffer(ColorBufferParams {
            width: reader.get_be32()?,
            height: reader.get_be32()?,
            internal_format: reader.get_be32()?,
            framework_format: reader.get_be32()?,
        }),
        ResourceKind::DataBuffer => ResourceParams::DataBuffer(DataBufferParams {
            size: reader.get_be64()?,
            memory_property: reader.get_be32()?,
        }),
        ResourceKind::Context => ResourceParams::Context(ContextParams {
            config: reader.get_be32()?,
            share_context: reader.get_be32()?,
            version: reader.get_be32()?,
        }),
        ResourceKind::WindowSurface => ResourceParams::WindowSurface(WindowSurfaceParams {
            config: reader.get_be32()?,
            width: reader.get_be32()?,
            height: reader.get_be32()?,
        }),
    })
}

/// `handle, params, backend blob, refcount, opened`
fn put_record(writer: &mut dyn Write, record: &ResourceRecord) -> GfxstreamResult<()> {
    writer.put_be32(record.handle)?;
    put_params(writer, &record.params)?;
    let mut blob = Vec::new();
    record.backend.save(&mut blob)?;
    writer.put_blob(&blob)?;
    writer.put_be32(record.refcount)?;
    writer.put_bool(record.opened)?;
    Ok(())
}

/// Handles grouped per process, written as `count, {pid, n, handle × n}`. Processes with no
/// handles are left out.
fn put_process_collection(
    writer: &mut dyn Write,
    collection: &[(ProcessId, Vec<ResourceHandle>)],
) -> GfxstreamResult<()> {
    let non_empty: Vec<_> = collection.iter().filter(|(_, h)| !h.is_empty()).collect();
    writer.put_count(non_empty.len())?;
    for (pid, handles) in non_empty {
        writer.put_be64(*pid)?;
        writer.put_count(handles.len())?;
        for handle in handles {
            writer.put_be32(*handle)?;
        }
    }
    Ok(())
}

fn get_process_collection(
    reader: &mut dyn Read,
) -> GfxstreamResult<Vec<(ProcessId, Vec<ResourceHandle>)>> {
    let count = reader.get_be32()?;
    let mut collection = Vec::new();
    for _ in 0..count {
        let pid = reader.get_be64()?;
        let len = reader.get_be32()?;
        let mut handles = Vec::new();
        for _ in 0..len {
            handles.push(reader.get_be32()?);
        }
        collection.push((pid, handles));
    }
    Ok(collection)
}

/// Everything read from a stream, committed to the registry only once the stream parsed.
#[derive(Default)]
struct LoadedState {
    records: Records,
    delayed_closes: DelayedCloseQueue,
    processes: ProcessTracker,
}

impl ResourceRegistry {
    /// Writes the resource graph to `writer`. Producers must be quiesced first.
    pub fn save(&self, writer: &mut dyn Write) -> GfxstreamResult<()> {
        let state = self.state.lock();
        let records = self.records.lock();
        let now = self.clock.now_us();

        writer.put_be32(state.display.width)?;
        writer.put_be32(state.display.height)?;
        writer.put_be32(state.display.dpi_x)?;
        writer.put_be32(state.display.dpi_y)?;

        let of_kind = |kind: ResourceKind| -> Vec<&ResourceRecord> {
            records.values().filter(|r| r.kind() == kind).collect()
        };

        let contexts = of_kind(ResourceKind::Context);
        writer.put_count(contexts.len())?;
        for record in contexts {
            put_record(writer, record)?;
        }

        writer.put_bool(state.guest_managed_color_buffer_lifetime)?;

        let color_buffers = of_kind(ResourceKind::ColorBuffer);
        writer.put_count(color_buffers.len())?;
        for record in color_buffers {
            put_record(writer, record)?;
            let closed_at = record.closed_at_us.unwrap_or(now);
            let age = now.saturating_sub(closed_at).min(u32::MAX as u64) as u32;
            writer.put_be32(age)?;
        }

        writer.put_be32(state.last_posted_color_buffer)?;

        let window_surfaces = of_kind(ResourceKind::WindowSurface);
        writer.put_count(window_surfaces.len())?;
        for record in window_surfaces {
            put_record(writer, record)?;
            writer.put_be32(record.bound_color_buffer.unwrap_or(INVALID_HANDLE))?;
        }

        let mut owned_surfaces: Vec<(ProcessId, Vec<ResourceHandle>)> = Vec::new();
        let mut owned_color_buffers: Vec<(ProcessId, Vec<ResourceHandle>)> = Vec::new();
        let mut owned_contexts: Vec<(ProcessId, Vec<ResourceHandle>)> = Vec::new();
        for pid in state.processes.pids() {
            if let Some(ownership) = state.processes.get(pid) {
                owned_surfaces.push((pid, ownership.window_surfaces.iter().copied().collect()));
                owned_color_buffers.push((
                    pid,
                    ownership
                        .color_buffers
                        .iter()
                        .flat_map(|(&h, &n)| std::iter::repeat(h).take(n as usize))
                        .collect(),
                ));
                owned_contexts.push((pid, ownership.contexts.iter().copied().collect()));
            }
        }
        put_process_collection(writer, &owned_surfaces)?;
        put_process_collection(writer, &owned_color_buffers)?;
        put_process_collection(writer, &owned_contexts)?;

        let buffers = of_kind(ResourceKind::DataBuffer);
        writer.put_count(buffers.len())?;
        for record in buffers {
            put_record(writer, record)?;
        }

        let resources: Vec<_> = state.processes.resources().collect();
        writer.put_count(resources.len())?;
        for (pid, resources) in resources {
            writer.put_be64(*pid)?;
            writer.put_be32(resources.sequence_number().load(Ordering::SeqCst))?;
        }

        Ok(())
    }

    /// Replaces the resource graph with the one in `reader`.
    ///
    /// Whatever the registry held before is reclaimed first. A registry with live resources but
    /// no process ownership comes from a guest that never reports process ids and is simply
    /// cleared; otherwise every process is force-cleaned and its callbacks run.
    pub fn load(&self, reader: &mut dyn Read) -> GfxstreamResult<()> {
        let callbacks = {
            let mut state = self.state.lock();
            let _context_guard = self.context_structure.write();
            let mut records = self.records.lock();
            self.sweep_color_buffers_locked(&mut state, &mut records);
            self.reclaim_before_load_locked(&mut state, &mut records)
        };

        for cb in callbacks {
            cb();
        }

        let mut state = self.state.lock();
        let _context_guard = self.context_structure.write();
        let mut records = self.records.lock();

        state.delayed_closes.clear();
        if !records.is_empty() {
            error!("on load, stale resources: {}", records.len());
            records.clear();
        }
        state.processes = ProcessTracker::new();

        let loaded = self.read_stream(&mut state, reader)?;
        *records = loaded.records;
        state.delayed_closes = loaded.delayed_closes;
        state.processes = loaded.processes;
        info!("loaded {} resources from snapshot", records.len());
        Ok(())
    }

    fn reclaim_before_load_locked(
        &self,
        state: &mut RegistryState,
        records: &mut Records,
    ) -> Vec<CleanupCallback> {
        let has_surfaces_or_contexts = records
            .values()
            .any(|r| matches!(r.kind(), ResourceKind::Context | ResourceKind::WindowSurface));
        let color_buffers = records
            .values()
            .filter(|r| r.kind() == ResourceKind::ColorBuffer)
            .count();
        let legacy = !state.processes.has_ownership()
            && (has_surfaces_or_contexts || color_buffers > state.delayed_closes.pending().len());

        if legacy {
            warn!("no process ownership recorded, clearing all resources before load");
            records.clear();
            return Vec::new();
        }

        let callbacks = self.reclaim_all_locked(state, records);
        self.sweep_delayed_locked(state, records, true);
        callbacks
    }

    fn read_stream(
        &self,
        state: &mut RegistryState,
        reader: &mut dyn Read,
    ) -> GfxstreamResult<LoadedState> {
        let now = self.clock.now_us();
        let mut loaded: LoadedState = Default::default();

        let display = DisplayConfig {
            width: reader.get_be32()?,
            height: reader.get_be32()?,
            dpi_x: reader.get_be32()?,
            dpi_y: reader.get_be32()?,
        };

        let count = reader.get_be32()?;
        for _ in 0..count {
            let record = self.get_record(reader, ResourceKind::Context)?;
            insert_loaded(&mut loaded.records, record)?;
        }

        let guest_managed = reader.get_bool()?;

        let count = reader.get_be32()?;
        for _ in 0..count {
            let mut record = self.get_record(reader, ResourceKind::ColorBuffer)?;
            let age = reader.get_be32()? as u64;
            if record.refcount == 0 {
                let closed_at = now.saturating_sub(age);
                record.closed_at_us = Some(closed_at);
                loaded.delayed_closes.schedule(record.handle, closed_at);
            }
            insert_loaded(&mut loaded.records, record)?;
        }

        let last_posted = reader.get_be32()?;

        let count = reader.get_be32()?;
        for _ in 0..count {
            let mut record = self.get_record(reader, ResourceKind::WindowSurface)?;
            let bound = reader.get_be32()?;
            if bound != INVALID_HANDLE {
                match loaded.records.get(&bound).map(|r| r.kind()) {
                    Some(ResourceKind::ColorBuffer) => record.bound_color_buffer = Some(bound),
                    _ => warn!(
                        "window surface {} bound to missing color buffer {}",
                        record.handle, bound
                    ),
                }
            }
            insert_loaded(&mut loaded.records, record)?;
        }

        for (pid, handles) in get_process_collection(reader)? {
            for handle in handles {
                loaded.processes.add_window_surface(pid, handle);
            }
        }
        for (pid, handles) in get_process_collection(reader)? {
            for handle in handles {
                loaded.processes.add_color_buffer(pid, handle);
            }
        }
        for (pid, handles) in get_process_collection(reader)? {
            for handle in handles {
                loaded.processes.add_context(pid, handle);
            }
        }

        let count = reader.get_be32()?;
        for _ in 0..count {
            let record = self.get_record(reader, ResourceKind::DataBuffer)?;
            insert_loaded(&mut loaded.records, record)?;
        }

        let count = reader.get_be32()?;
        let mut seen = Set::new();
        for _ in 0..count {
            let pid = reader.get_be64()?;
            let sequence_number = reader.get_be32()?;
            if !seen.insert(pid) {
                return Err(GfxstreamError::Corrupt("duplicate process resources"));
            }
            loaded
                .processes
                .insert_resources(pid, ProcessResources::with_sequence_number(sequence_number));
        }

        state.display = display;
        state.guest_managed_color_buffer_lifetime = guest_managed;
        state.last_posted_color_buffer = last_posted;
        Ok(loaded)
    }

    fn get_record(
        &self,
        reader: &mut dyn Read,
        kind: ResourceKind,
    ) -> GfxstreamResult<ResourceRecord> {
        let handle = reader.get_be32()?;
        if handle == INVALID_HANDLE {
            return Err(GfxstreamError::Corrupt("resource with handle 0"));
        }
        let params = get_params(reader, kind)?;
        let blob = reader.get_blob()?;
        let backend = self.backend.load_resource(handle, &params, &blob)?;

        let mut record = ResourceRecord::new(handle, params, backend);
        record.refcount = reader.get_be32()?;
        record.opened = reader.get_bool()?;
        Ok(record)
    }
}

fn insert_loaded(
    records: &mut Map<ResourceHandle, ResourceRecord>,
    record: ResourceRecord,
) -> GfxstreamResult<()> {
    if records.contains_key(&record.handle) {
        return Err(GfxstreamError::Corrupt("duplicate resource handle"));
    }
    records.insert(record.handle, record);
    Ok(())
}
