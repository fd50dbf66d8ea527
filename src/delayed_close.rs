// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::handle::ResourceHandle;
use crate::handle::INVALID_HANDLE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DelayedCloseEntry {
    pub ts: u64,
    /// `INVALID_HANDLE` once the entry was cancelled.
    pub handle: ResourceHandle,
}

/// Color buffers whose refcount reached zero, ordered by the time that happened.
///
/// Entries are appended with the current time so the queue stays sorted in the common case.
/// Snapshot load may append in a different order, so `schedule` falls back to a sorted insert.
#[derive(Debug, Default)]
pub struct DelayedCloseQueue {
    entries: Vec<DelayedCloseEntry>,
}

impl DelayedCloseQueue {
    pub fn new() -> DelayedCloseQueue {
        Default::default()
    }

    pub fn schedule(&mut self, handle: ResourceHandle, ts: u64) {
        let entry = DelayedCloseEntry { ts, handle };
        match self.entries.last() {
            Some(last) if last.ts > ts => {
                let index = self.entries.partition_point(|e| e.ts <= ts);
                self.entries.insert(index, entry);
            }
            _ => self.entries.push(entry),
        }
    }

    /// Marks the entry for `handle` scheduled at `ts` as cancelled. Returns whether one was found.
    ///
    /// Buffers are not always closed in timestamp order, so this searches for the first entry at
    /// `ts` and then walks every entry that shares it.
    pub fn cancel(&mut self, handle: ResourceHandle, ts: u64) -> bool {
        let start = self.entries.partition_point(|e| e.ts < ts);
        for entry in self.entries[start..].iter_mut() {
            if entry.ts != ts {
                break;
            }
            if entry.handle == handle {
                entry.handle = INVALID_HANDLE;
                return true;
            }
        }
        false
    }

    /// Removes every entry that has been waiting for at least `grace_period_us`, or every entry
    /// if `forced`, and returns the live handles among them in timestamp order.
    pub fn sweep(&mut self, now_us: u64, grace_period_us: u64, forced: bool) -> Vec<ResourceHandle> {
        let expired = if forced {
            self.entries.len()
        } else {
            self.entries
                .partition_point(|e| e.ts.saturating_add(grace_period_us) <= now_us)
        };

        self.entries
            .drain(..expired)
            .map(|e| e.handle)
            .filter(|&h| h != INVALID_HANDLE)
            .collect()
    }

    /// Live entries, oldest first.
    pub fn pending(&self) -> Vec<DelayedCloseEntry> {
        self.entries
            .iter()
            .filter(|e| e.handle != INVALID_HANDLE)
            .copied()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.handle == INVALID_HANDLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_respects_grace_period() {
        let mut queue = DelayedCloseQueue::new();
        queue.schedule(5, 100);
        assert!(queue.sweep(100 + 49, 50, false).is_empty());
        assert_eq!(queue.sweep(100 + 50, 50, false), vec![5]);
        assert!(queue.is_empty());
    }

    #[test]
    fn cancel_scans_equal_timestamps() {
        let mut queue = DelayedCloseQueue::new();
        queue.schedule(1, 10);
        queue.schedule(2, 10);
        queue.schedule(3, 10);
        queue.schedule(4, 20);
        assert!(queue.cancel(3, 10));
        assert!(!queue.cancel(3, 10));
        assert!(!queue.cancel(4, 10));
        assert_eq!(queue.sweep(0, 0, true), vec![1, 2, 4]);
    }

    #[test]
    fn out_of_order_schedule_stays_sorted() {
        let mut queue = DelayedCloseQueue::new();
        queue.schedule(1, 30);
        queue.schedule(2, 10);
        queue.schedule(3, 20);
        let order: Vec<_> = queue.pending().iter().map(|e| e.handle).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert_eq!(queue.sweep(25, 0, false), vec![2, 3]);
    }
}
