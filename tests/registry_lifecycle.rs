// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use gfxstream_host::CloseOutcome;
use gfxstream_host::ColorBufferParams;
use gfxstream_host::DataBufferParams;
use gfxstream_host::HostMemoryBackend;
use gfxstream_host::ManualClock;
use gfxstream_host::RegistryConfig;
use gfxstream_host::RendererFeatures;
use gfxstream_host::ResourceRegistry;
use gfxstream_host::ThreadInfoTable;
use gfxstream_host::WindowSurfaceParams;
use gfxstream_host::DEFAULT_CLOSE_GRACE_PERIOD_US;
use gfxstream_host::INVALID_HANDLE;

const START_US: u64 = 5_000_000;

const SMALL: ColorBufferParams = ColorBufferParams {
    width: 4,
    height: 4,
    internal_format: 0x1908,
    framework_format: 0,
};

struct Fixture {
    backend: Arc<HostMemoryBackend>,
    clock: Arc<ManualClock>,
    registry: ResourceRegistry,
}

fn fixture_with(features: RendererFeatures) -> Fixture {
    let backend = Arc::new(HostMemoryBackend::new());
    let clock = Arc::new(ManualClock::new(START_US));
    let config = RegistryConfig {
        features,
        ..Default::default()
    };
    let registry = ResourceRegistry::new(
        backend.clone(),
        clock.clone(),
        config,
        ThreadInfoTable::new(),
    );
    Fixture {
        backend,
        clock,
        registry,
    }
}

fn fixture() -> Fixture {
    fixture_with(Default::default())
}

#[test]
fn delayed_close_after_grace_period() {
    let f = fixture();
    let h = f.registry.create_color_buffer(1, SMALL);
    assert_ne!(h, INVALID_HANDLE);
    f.registry.open(h).unwrap();

    assert_eq!(f.registry.close_with_outcome(h, false), CloseOutcome::Scheduled);
    let info = f.registry.find(h).unwrap();
    assert_eq!(info.refcount, 0);
    assert_eq!(info.closed_at_us, Some(START_US));
    assert_eq!(f.registry.pending_delayed_closes().len(), 1);

    f.clock.set(START_US + DEFAULT_CLOSE_GRACE_PERIOD_US - 1);
    assert!(f.registry.sweep_delayed_closes(false).is_empty());
    assert!(f.registry.find(h).is_some());

    f.clock.set(START_US + DEFAULT_CLOSE_GRACE_PERIOD_US + 1);
    assert_eq!(f.registry.sweep_delayed_closes(false), vec![h]);
    assert!(f.registry.find(h).is_none());
    assert!(f.registry.pending_delayed_closes().is_empty());
    assert_eq!(f.backend.live_resources(), 0);
}

#[test]
fn creation_sweeps_expired_closes() {
    let f = fixture();
    let old = f.registry.create_color_buffer(1, SMALL);
    f.registry.open(old).unwrap();
    f.registry.close(old, false);

    f.clock.advance(DEFAULT_CLOSE_GRACE_PERIOD_US);
    let new = f.registry.create_color_buffer(1, SMALL);
    assert_ne!(new, old);
    assert!(f.registry.find(old).is_none());
    assert!(f.registry.find(new).is_some());
}

#[test]
fn legacy_refcount_init_owns_new_buffers() {
    let f = fixture_with(RendererFeatures {
        legacy_refcount_init: true,
        ..Default::default()
    });
    let h = f.registry.create_color_buffer(7, SMALL);
    assert_eq!(f.registry.find(h).unwrap().refcount, 1);
    assert_eq!(f.registry.owned_handles(7), vec![h]);

    assert!(!f.registry.close_owned(7, h));
    assert_eq!(f.registry.pending_delayed_closes().len(), 1);
    assert!(f.registry.owned_handles(7).is_empty());
}

#[test]
fn last_ref_applied_by_next_create() {
    let f = fixture_with(RendererFeatures {
        refcount_pipe: true,
        ..Default::default()
    });
    let h = f.registry.create_color_buffer(1, SMALL);
    f.registry.on_last_color_buffer_ref(h);
    let other = f.registry.create_color_buffer(1, SMALL);
    assert!(f.registry.find(h).is_none());
    assert!(f.registry.find(other).is_some());
}

#[test]
fn allocation_recovers_after_exhaustion() {
    let f = fixture();
    f.backend.set_fail_allocations(true);
    assert_eq!(f.registry.create_color_buffer(1, SMALL), INVALID_HANDLE);
    assert!(f.registry.is_empty());

    f.backend.set_fail_allocations(false);
    assert_ne!(f.registry.create_color_buffer(1, SMALL), INVALID_HANDLE);
}

#[test]
fn window_surface_binding_holds_a_reference() {
    let f = fixture();
    let surface = f.registry.create_window_surface(1, WindowSurfaceParams::default());
    let first = f.registry.create_color_buffer(1, SMALL);
    let second = f.registry.create_color_buffer(1, SMALL);

    assert!(f.registry.set_window_surface_color_buffer(surface, first));
    assert_eq!(f.registry.find(first).unwrap().refcount, 1);

    // Rebinding drops the reference on the previous target.
    assert!(f.registry.set_window_surface_color_buffer(surface, second));
    assert_eq!(f.registry.find(first).unwrap().refcount, 0);
    assert_eq!(f.registry.pending_delayed_closes().len(), 1);

    f.registry.destroy_window_surface(surface);
    assert!(f.registry.find(surface).is_none());
    assert_eq!(f.registry.find(second).unwrap().refcount, 0);
    assert_eq!(f.registry.pending_delayed_closes().len(), 2);
}

#[test]
fn data_buffer_contents() {
    let f = fixture();
    let h = f.registry.create_buffer(DataBufferParams {
        size: 16,
        memory_property: 0,
    });
    assert!(f.registry.update_buffer(h, 4, &[1, 2, 3, 4]));
    assert_eq!(f.registry.read_buffer(h, 4, 4), Some(vec![1, 2, 3, 4]));
    assert!(!f.registry.update_buffer(h, 14, &[0; 4]));
    assert_eq!(f.registry.read_buffer(h, 12, 8), None);

    // Buffers go away regardless of their refcount.
    f.registry.open(h).unwrap();
    assert!(f.registry.close_buffer(h));
    assert!(f.registry.find(h).is_none());
    assert!(!f.registry.close_buffer(h));
}

#[test]
fn posting_tracks_the_last_color_buffer() {
    let f = fixture();
    let h = f.registry.create_color_buffer(1, SMALL);
    f.registry.open(h).unwrap();

    assert!(f.registry.prepare_post(h).is_some());
    assert_eq!(f.registry.last_posted_color_buffer(), h);
    assert_eq!(f.registry.find(h).unwrap().refcount, 2);
    f.registry.dec_ref_no_destroy(h);
    assert_eq!(f.registry.find(h).unwrap().refcount, 1);

    assert!(f.registry.close(h, true));
    assert_eq!(f.registry.last_posted_color_buffer(), INVALID_HANDLE);
    assert!(f.registry.prepare_post(h).is_none());
}

#[test]
fn color_buffer_pixels() {
    let f = fixture();
    let h = f.registry.create_color_buffer(1, SMALL);
    let pixels: Vec<u8> = (0..64).collect();
    assert!(f.registry.update_color_buffer(h, &pixels));
    assert_eq!(f.registry.read_color_buffer(h), Some(pixels));

    let buf = f.registry.create_buffer(DataBufferParams {
        size: 8,
        memory_property: 0,
    });
    assert_eq!(f.registry.read_color_buffer(buf), None);
}
