// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

/// Opaque name of a registry resource. Color buffers, data buffers, contexts and window surfaces
/// share one handle space, and 0 is never a valid handle.
pub type ResourceHandle = u32;

/// Guest-assigned identifier of a guest process (one or more connections).
pub type ProcessId = u64;

/// Identifier of a host display.
pub type DisplayId = u32;

pub const INVALID_HANDLE: ResourceHandle = 0;

/// Hands out process-wide unique handles.
///
/// The allocator does not know which handles are live; the caller supplies that through
/// `in_use`. It must be called with the registry's structural lock held so that the returned
/// handle is inserted before anyone else can observe it as free.
#[derive(Debug, Default)]
pub struct HandleAllocator {
    next: ResourceHandle,
}

impl HandleAllocator {
    pub fn new() -> HandleAllocator {
        Default::default()
    }

    /// Starts allocation after `last`. Used by tests to exercise counter wraparound.
    pub fn starting_after(last: ResourceHandle) -> HandleAllocator {
        HandleAllocator { next: last }
    }

    pub fn allocate<F>(&mut self, in_use: F) -> ResourceHandle
    where
        F: Fn(ResourceHandle) -> bool,
    {
        loop {
            self.next = self.next.wrapping_add(1);
            let candidate = self.next;
            if candidate != INVALID_HANDLE && !in_use(candidate) {
                return candidate;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn skips_live_handles() {
        let live: BTreeSet<ResourceHandle> = [1, 2, 4].into_iter().collect();
        let mut allocator = HandleAllocator::new();
        assert_eq!(allocator.allocate(|h| live.contains(&h)), 3);
        assert_eq!(allocator.allocate(|h| live.contains(&h)), 5);
    }

    #[test]
    fn never_returns_zero_on_wrap() {
        let mut allocator = HandleAllocator::starting_after(u32::MAX - 1);
        assert_eq!(allocator.allocate(|_| false), u32::MAX);
        assert_eq!(allocator.allocate(|_| false), 1);
    }
}
