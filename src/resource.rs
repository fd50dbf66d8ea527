// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use crate::backend::BackendResource;
use crate::backend::ResourceParams;
use crate::handle::ResourceHandle;

/// The kinds of object that share the registry's handle space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    ColorBuffer,
    DataBuffer,
    Context,
    WindowSurface,
}

impl ResourceKind {
    pub fn to_u8(self) -> u8 {
        match self {
            ResourceKind::ColorBuffer => 0,
            ResourceKind::DataBuffer => 1,
            ResourceKind::Context => 2,
            ResourceKind::WindowSurface => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<ResourceKind> {
        match value {
            0 => Some(ResourceKind::ColorBuffer),
            1 => Some(ResourceKind::DataBuffer),
            2 => Some(ResourceKind::Context),
            3 => Some(ResourceKind::WindowSurface),
            _ => None,
        }
    }
}

/// One registry entry. The registry owns the record; everyone else refers to it by handle and
/// resolves it again on every use.
#[derive(Debug)]
pub struct ResourceRecord {
    pub handle: ResourceHandle,
    pub params: ResourceParams,
    /// Workers clone this for the duration of one command so they never hold registry locks
    /// while the GPU works.
    pub backend: Arc<dyn BackendResource>,
    pub refcount: u32,
    pub opened: bool,
    /// Set when the refcount dropped to zero and a delayed close was scheduled.
    pub closed_at_us: Option<u64>,
    /// Window surfaces only: the color buffer currently bound as the draw target.
    pub bound_color_buffer: Option<ResourceHandle>,
}

impl ResourceRecord {
    pub fn new(
        handle: ResourceHandle,
        params: ResourceParams,
        backend: Box<dyn BackendResource>,
    ) -> ResourceRecord {
        ResourceRecord {
            handle,
            params,
            backend: Arc::from(backend),
            refcount: 0,
            opened: false,
            closed_at_us: None,
            bound_color_buffer: None,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.params.kind()
    }

    pub fn info(&self) -> RecordInfo {
        RecordInfo {
            handle: self.handle,
            kind: self.kind(),
            params: self.params,
            refcount: self.refcount,
            opened: self.opened,
            closed_at_us: self.closed_at_us,
            bound_color_buffer: self.bound_color_buffer,
        }
    }
}

/// A point-in-time copy of a record's bookkeeping, returned by lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordInfo {
    pub handle: ResourceHandle,
    pub kind: ResourceKind,
    pub params: ResourceParams,
    pub refcount: u32,
    pub opened: bool,
    pub closed_at_us: Option<u64>,
    pub bound_color_buffer: Option<ResourceHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        for kind in [
            ResourceKind::ColorBuffer,
            ResourceKind::DataBuffer,
            ResourceKind::Context,
            ResourceKind::WindowSurface,
        ] {
            assert_eq!(ResourceKind::from_u8(kind.to_u8()), Some(kind));
        }
        assert_eq!(ResourceKind::from_u8(4), None);
    }
}
