// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use proptest::prelude::*;

use gfxstream_host::ColorBufferParams;
use gfxstream_host::HandleAllocator;
use gfxstream_host::HostMemoryBackend;
use gfxstream_host::ManualClock;
use gfxstream_host::RegistryConfig;
use gfxstream_host::ResourceRegistry;
use gfxstream_host::ThreadInfoTable;
use gfxstream_host::DEFAULT_CLOSE_GRACE_PERIOD_US;
use gfxstream_host::INVALID_HANDLE;

#[derive(Clone, Debug)]
enum Op {
    Create,
    Open(usize),
    Close(usize),
    Advance(u64),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        3 => Just(Op::Create),
        3 => any::<usize>().prop_map(Op::Open),
        4 => any::<usize>().prop_map(Op::Close),
        1 => (0..2 * DEFAULT_CLOSE_GRACE_PERIOD_US).prop_map(Op::Advance),
    ];
    proptest::collection::vec(op, 1..200)
}

fn registry(clock: Arc<ManualClock>) -> ResourceRegistry {
    ResourceRegistry::new(
        Arc::new(HostMemoryBackend::new()),
        clock,
        RegistryConfig::default(),
        ThreadInfoTable::new(),
    )
}

const PARAMS: ColorBufferParams = ColorBufferParams {
    width: 1,
    height: 1,
    internal_format: 0x1908,
    framework_format: 0,
};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn refcounts_track_opens_and_closes(ops in ops(), start in prop_oneof![Just(0u32), Just(u32::MAX - 8)]) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = registry(clock.clone());
        registry.set_handle_allocator(HandleAllocator::starting_after(start));

        // Expected refcount of every handle the registry should still hold.
        let mut model: BTreeMap<u32, u32> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Create => {
                    let handle = registry.create_color_buffer(1, PARAMS);
                    prop_assert_ne!(handle, INVALID_HANDLE);
                    prop_assert!(!model.contains_key(&handle), "handle {} reused while live", handle);
                    model.insert(handle, 0);
                }
                Op::Open(index) if !model.is_empty() => {
                    let handle = *model.keys().nth(index % model.len()).unwrap();
                    registry.open(handle).unwrap();
                    *model.get_mut(&handle).unwrap() += 1;
                }
                Op::Close(index) if !model.is_empty() => {
                    let handle = *model.keys().nth(index % model.len()).unwrap();
                    registry.close(handle, false);
                    let refcount = model.get_mut(&handle).unwrap();
                    *refcount = refcount.saturating_sub(1);
                }
                Op::Advance(delta) => clock.advance(delta),
                _ => (),
            }

            // Only zero-refcount buffers ever leave, and only through the delayed close queue.
            let live: Vec<u32> = registry.handles();
            for (handle, refcount) in model.clone() {
                match registry.find(handle) {
                    Some(info) => prop_assert_eq!(info.refcount, refcount),
                    None => {
                        prop_assert_eq!(refcount, 0);
                        model.remove(&handle);
                    }
                }
            }
            prop_assert_eq!(live.len(), model.len());
        }
    }

    #[test]
    fn arbitrary_snapshots_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let registry = registry(Arc::new(ManualClock::new(1_000_000)));
        let _ = registry.load(&mut Cursor::new(bytes));
    }
}
