// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The boundary between the resource registry and whatever actually talks to the GPU.
//!
//! The registry never issues GPU calls. It asks a `GraphicsBackend` for per-resource state when a
//! handle is created or restored, owns that state for as long as the handle lives, and drops it
//! when the handle is destroyed. Presentation and readback entry points are only ever invoked from
//! the single consumer thread of the post or readback worker.

mod host_memory;

use std::fmt::Debug;
use std::io::Write;

pub use host_memory::BackendEvent;
pub use host_memory::HostMemoryBackend;
pub use host_memory::HostMemoryResource;

use crate::error::GfxstreamResult;
use crate::handle::ResourceHandle;
use crate::resource::ResourceKind;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColorBufferParams {
    pub width: u32,
    pub height: u32,
    pub internal_format: u32,
    pub framework_format: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataBufferParams {
    pub size: u64,
    pub memory_property: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextParams {
    pub config: u32,
    pub share_context: ResourceHandle,
    pub version: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowSurfaceParams {
    pub config: u32,
    pub width: u32,
    pub height: u32,
}

/// Creation parameters, one variant per resource kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceParams {
    ColorBuffer(ColorBufferParams),
    DataBuffer(DataBufferParams),
    Context(ContextParams),
    WindowSurface(WindowSurfaceParams),
}

impl ResourceParams {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceParams::ColorBuffer(_) => ResourceKind::ColorBuffer,
            ResourceParams::DataBuffer(_) => ResourceKind::DataBuffer,
            ResourceParams::Context(_) => ResourceKind::Context,
            ResourceParams::WindowSurface(_) => ResourceKind::WindowSurface,
        }
    }
}

/// A rectangle in color buffer coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScreenshotParams {
    pub color_buffer: ResourceHandle,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub rotation: u32,
    pub rect: Rect,
}

/// GPU state owned by one registry record. Dropping it releases the GPU objects.
pub trait BackendResource: Debug + Send + Sync {
    /// Serializes the backend-specific state of this resource.
    fn save(&self, writer: &mut dyn Write) -> GfxstreamResult<()>;

    /// Copies `bytes` in at `offset`. Returns false if the range is out of bounds.
    fn write_bytes(&self, offset: u64, bytes: &[u8]) -> bool;

    /// Copies `size` bytes out from `offset`, or returns `None` if the range is out of bounds.
    fn read_bytes(&self, offset: u64, size: u64) -> Option<Vec<u8>>;

    /// Reads the whole resource as tightly packed RGBA pixels. Non-image resources return `None`.
    fn read_pixels(&self) -> Option<Vec<u8>>;
}

pub trait GraphicsBackend: Send + Sync {
    /// Allocates GPU state for a new resource. `None` means the backend is out of resources.
    fn create_resource(
        &self,
        handle: ResourceHandle,
        params: &ResourceParams,
    ) -> Option<Box<dyn BackendResource>>;

    /// Rebuilds GPU state from bytes written by `BackendResource::save`.
    fn load_resource(
        &self,
        handle: ResourceHandle,
        params: &ResourceParams,
        state: &[u8],
    ) -> GfxstreamResult<Box<dyn BackendResource>>;

    /// Presents a color buffer to the host display.
    fn post(&self, handle: ResourceHandle, color_buffer: &dyn BackendResource);

    /// Runs a host composition request in the guest's wire format.
    fn compose(&self, request: &[u8]);

    fn viewport(&self, width: u32, height: u32);

    fn clear(&self);

    /// Renders a color buffer into host memory for a screenshot.
    fn screenshot(
        &self,
        color_buffer: &dyn BackendResource,
        params: &ScreenshotParams,
    ) -> Option<Vec<u8>>;
}
