// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::error;

use crate::backend::BackendResource;
use crate::backend::GraphicsBackend;
use crate::backend::ResourceParams;
use crate::backend::ScreenshotParams;
use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;
use crate::handle::ResourceHandle;
use crate::sync::Mutex;

const BYTES_PER_PIXEL: u64 = 4;
const MAX_ALLOCATION: u64 = 1 << 28;

/// Something the backend was asked to do on a worker thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    Post(ResourceHandle),
    Compose(Vec<u8>),
    Viewport(u32, u32),
    Clear,
    Screenshot(ResourceHandle),
}

fn allocation_size(params: &ResourceParams) -> Option<u64> {
    let size = match params {
        ResourceParams::ColorBuffer(p) => (p.width as u64)
            .checked_mul(p.height as u64)?
            .checked_mul(BYTES_PER_PIXEL)?,
        ResourceParams::DataBuffer(p) => p.size,
        ResourceParams::Context(_) | ResourceParams::WindowSurface(_) => 0,
    };

    if size > MAX_ALLOCATION {
        return None;
    }
    Some(size)
}

/// A resource whose contents live in a plain host allocation.
#[derive(Debug)]
pub struct HostMemoryResource {
    handle: ResourceHandle,
    is_image: bool,
    bytes: Mutex<Vec<u8>>,
    live: Arc<AtomicUsize>,
}

impl HostMemoryResource {
    pub fn handle(&self) -> ResourceHandle {
        self.handle
    }
}

impl Drop for HostMemoryResource {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BackendResource for HostMemoryResource {
    fn save(&self, writer: &mut dyn Write) -> GfxstreamResult<()> {
        writer.write_all(&self.bytes.lock())?;
        Ok(())
    }

    fn write_bytes(&self, offset: u64, bytes: &[u8]) -> bool {
        let mut contents = self.bytes.lock();
        let start = match usize::try_from(offset) {
            Ok(start) => start,
            Err(_) => return false,
        };
        match start.checked_add(bytes.len()) {
            Some(end) if end <= contents.len() => {
                contents[start..end].copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    fn read_bytes(&self, offset: u64, size: u64) -> Option<Vec<u8>> {
        let contents = self.bytes.lock();
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;
        contents.get(start..end).map(|slice| slice.to_vec())
    }

    fn read_pixels(&self) -> Option<Vec<u8>> {
        if !self.is_image {
            return None;
        }
        Some(self.bytes.lock().clone())
    }
}

/// A `GraphicsBackend` with no GPU behind it. Resources are byte vectors and every worker-side
/// call is recorded so callers can observe ordering.
#[derive(Debug, Default)]
pub struct HostMemoryBackend {
    live: Arc<AtomicUsize>,
    fail_allocations: AtomicBool,
    events: Mutex<Vec<BackendEvent>>,
}

impl HostMemoryBackend {
    pub fn new() -> HostMemoryBackend {
        Default::default()
    }

    /// Number of resources currently holding backend state.
    pub fn live_resources(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Makes every following allocation fail, as an exhausted GPU would.
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: BackendEvent) {
        self.events.lock().push(event);
    }

    fn make_resource(
        &self,
        handle: ResourceHandle,
        params: &ResourceParams,
        bytes: Vec<u8>,
    ) -> Box<dyn BackendResource> {
        self.live.fetch_add(1, Ordering::SeqCst);
        Box::new(HostMemoryResource {
            handle,
            is_image: matches!(params, ResourceParams::ColorBuffer(_)),
            bytes: Mutex::new(bytes),
            live: self.live.clone(),
        })
    }
}

impl GraphicsBackend for HostMemoryBackend {
    fn create_resource(
        &self,
        handle: ResourceHandle,
        params: &ResourceParams,
    ) -> Option<Box<dyn BackendResource>> {
        if self.fail_allocations.load(Ordering::SeqCst) {
            return None;
        }

        let size = match allocation_size(params) {
            Some(size) => size as usize,
            None => {
                error!("refusing oversized allocation for {:?}", params);
                return None;
            }
        };

        Some(self.make_resource(handle, params, vec![0u8; size]))
    }

    fn load_resource(
        &self,
        handle: ResourceHandle,
        params: &ResourceParams,
        state: &[u8],
    ) -> GfxstreamResult<Box<dyn BackendResource>> {
        let size = allocation_size(params)
            .ok_or(GfxstreamError::Corrupt("resource too large to restore"))?;
        if size != state.len() as u64 {
            return Err(GfxstreamError::Corrupt("resource contents size mismatch"));
        }

        Ok(self.make_resource(handle, params, state.to_vec()))
    }

    fn post(&self, handle: ResourceHandle, _color_buffer: &dyn BackendResource) {
        self.record(BackendEvent::Post(handle));
    }

    fn compose(&self, request: &[u8]) {
        self.record(BackendEvent::Compose(request.to_vec()));
    }

    fn viewport(&self, width: u32, height: u32) {
        self.record(BackendEvent::Viewport(width, height));
    }

    fn clear(&self) {
        self.record(BackendEvent::Clear);
    }

    fn screenshot(
        &self,
        color_buffer: &dyn BackendResource,
        params: &ScreenshotParams,
    ) -> Option<Vec<u8>> {
        self.record(BackendEvent::Screenshot(params.color_buffer));
        color_buffer.read_pixels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ColorBufferParams;
    use crate::backend::DataBufferParams;

    #[test]
    fn dropping_a_resource_releases_it() {
        let backend = HostMemoryBackend::new();
        let params = ResourceParams::ColorBuffer(ColorBufferParams {
            width: 2,
            height: 2,
            ..Default::default()
        });
        let resource = backend.create_resource(1, &params).unwrap();
        assert_eq!(backend.live_resources(), 1);
        assert_eq!(resource.read_pixels().unwrap().len(), 16);
        drop(resource);
        assert_eq!(backend.live_resources(), 0);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let backend = HostMemoryBackend::new();
        let params = ResourceParams::DataBuffer(DataBufferParams {
            size: 8,
            ..Default::default()
        });
        let resource = backend.create_resource(1, &params).unwrap();
        assert!(resource.write_bytes(4, &[1, 2, 3, 4]));
        assert!(!resource.write_bytes(6, &[1, 2, 3]));
        assert_eq!(resource.read_bytes(4, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(resource.read_bytes(u64::MAX, 1).is_none());
        assert!(resource.read_pixels().is_none());
    }

    #[test]
    fn restore_checks_size() {
        let backend = HostMemoryBackend::new();
        let params = ResourceParams::DataBuffer(DataBufferParams {
            size: 4,
            ..Default::default()
        });
        assert!(backend.load_resource(1, &params, &[0; 3]).is_err());
        assert!(backend.load_resource(1, &params, &[0; 4]).is_ok());
    }
}
