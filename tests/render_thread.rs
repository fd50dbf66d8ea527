// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::executor::block_on;

use gfxstream_host::ColorBufferParams;
use gfxstream_host::ContextParams;
use gfxstream_host::GuestRequest;
use gfxstream_host::GuestResponse;
use gfxstream_host::HostMemoryBackend;
use gfxstream_host::ManualClock;
use gfxstream_host::RenderChannel;
use gfxstream_host::Renderer;
use gfxstream_host::RendererBuilder;
use gfxstream_host::WindowSurfaceParams;
use gfxstream_host::INVALID_HANDLE;

const PARAMS: ColorBufferParams = ColorBufferParams {
    width: 2,
    height: 2,
    internal_format: 0x1908,
    framework_format: 0,
};

fn renderer() -> Renderer {
    RendererBuilder::new()
        .set_backend(Arc::new(HostMemoryBackend::new()))
        .set_clock(Arc::new(ManualClock::new(1_000_000)))
        .build()
        .unwrap()
}

/// Runs `f` on a thread of its own and fails if it does not return within five seconds.
fn finishes_in_time<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        let _ = sender.send(f());
    });
    receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("did not finish within five seconds")
}

fn call(channel: &RenderChannel, request: GuestRequest) -> GuestResponse {
    channel.send(request).unwrap();
    channel.recv().unwrap()
}

fn create_color_buffer(channel: &RenderChannel) -> u32 {
    match call(
        channel,
        GuestRequest::CreateColorBuffer {
            params: PARAMS,
            handle: INVALID_HANDLE,
        },
    ) {
        GuestResponse::Handle(handle) => handle,
        other => panic!("unexpected response {:?}", other),
    }
}

#[test]
fn builder_rejects_missing_backend() {
    assert!(RendererBuilder::new().build().is_err());
}

#[test]
fn builder_applies_feature_string() {
    let renderer = RendererBuilder::new()
        .set_backend(Arc::new(HostMemoryBackend::new()))
        .set_renderer_features(Some("RefCountPipe:enabled,Unknown:disabled".to_string()))
        .build()
        .unwrap();
    assert!(renderer.registry().features().refcount_pipe);
}

#[test]
fn requests_are_answered_in_order() {
    let renderer = renderer();
    let channel = renderer.create_render_channel().unwrap();
    channel.send(GuestRequest::SetProcessId(3)).unwrap();
    channel
        .send(GuestRequest::CreateContext(ContextParams::default()))
        .unwrap();
    channel
        .send(GuestRequest::CreateWindowSurface(WindowSurfaceParams::default()))
        .unwrap();
    channel.send(GuestRequest::DestroyContext(0x7777)).unwrap();

    assert_eq!(channel.recv(), Some(GuestResponse::Ok));
    let context = match channel.recv() {
        Some(GuestResponse::Handle(handle)) => handle,
        other => panic!("unexpected response {:?}", other),
    };
    let surface = match channel.recv() {
        Some(GuestResponse::Handle(handle)) => handle,
        other => panic!("unexpected response {:?}", other),
    };
    assert_eq!(channel.recv(), Some(GuestResponse::Status(false)));

    let mut owned = renderer.registry().owned_handles(3);
    owned.sort_unstable();
    let mut expected = vec![context, surface];
    expected.sort_unstable();
    assert_eq!(owned, expected);
}

#[test]
fn paused_producer_does_not_touch_the_registry() {
    let renderer = renderer();
    let channel = renderer.create_render_channel().unwrap();
    assert_eq!(call(&channel, GuestRequest::SetProcessId(1)), GuestResponse::Ok);

    renderer.pause_all_pre_save();
    channel
        .send(GuestRequest::CreateColorBuffer {
            params: PARAMS,
            handle: INVALID_HANDLE,
        })
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(channel.try_recv(), None);
    assert!(renderer.registry().is_empty());

    let mut bytes = Vec::new();
    renderer.save(&mut bytes).unwrap();
    assert!(renderer.registry().is_empty());

    renderer.resume_all();
    match channel.recv() {
        Some(GuestResponse::Handle(handle)) => {
            assert!(renderer.registry().find(handle).is_some())
        }
        other => panic!("unexpected response {:?}", other),
    }
}

#[test]
fn process_cleanup_stops_its_producers() {
    let renderer = renderer();
    let channel = renderer.create_render_channel().unwrap();
    let bystander = renderer.create_render_channel().unwrap();
    renderer.on_guest_graphics_process_create(8);
    assert_eq!(call(&channel, GuestRequest::SetProcessId(8)), GuestResponse::Ok);
    assert_eq!(call(&bystander, GuestRequest::SetProcessId(9)), GuestResponse::Ok);
    assert!(renderer.process_sequence_number(8).is_ok());

    let handle = create_color_buffer(&channel);
    assert_eq!(
        call(&channel, GuestRequest::OpenColorBuffer(handle)),
        GuestResponse::Status(true)
    );

    renderer.cleanup_process(8).wait().unwrap();
    assert_eq!(channel.recv(), None);
    assert!(channel.send(GuestRequest::Finish).is_err());
    assert!(renderer.process_sequence_number(8).is_err());
    assert_eq!(renderer.registry().find(handle).unwrap().refcount, 0);
    assert_eq!(renderer.registry().pending_delayed_closes().len(), 1);

    // Other processes keep going.
    assert_eq!(call(&bystander, GuestRequest::Finish), GuestResponse::Ok);
}

#[test]
fn readback_follows_the_color_buffer() {
    let renderer = renderer();
    let registry = renderer.registry();
    let handle = registry.create_color_buffer(1, PARAMS);
    let pixels: Vec<u8> = (0..16).collect();
    assert!(registry.update_color_buffer(handle, &pixels));

    let readback = renderer.readback_worker();
    readback.add_record_display(0, 2, 2).wait().unwrap();
    assert_eq!(block_on(readback.get_pixels(0)).unwrap(), None);

    readback.read_color_buffer(0, handle).unwrap().wait().unwrap();
    assert_eq!(block_on(readback.get_pixels(0)).unwrap(), Some(pixels));

    // A buffer that does not fit the display leaves the last frame in place.
    let large = registry.create_color_buffer(
        1,
        ColorBufferParams {
            width: 4,
            height: 4,
            ..PARAMS
        },
    );
    readback.read_color_buffer(0, large).unwrap().wait().unwrap();
    assert_eq!(
        block_on(readback.get_pixels(0)).unwrap(),
        Some((0..16).collect())
    );

    readback.del_record_display(0).wait().unwrap();
    assert_eq!(block_on(readback.get_pixels(0)).unwrap(), None);
    assert!(readback.read_color_buffer(0, 0x5555).is_err());
}

#[test]
fn stopped_renderer_refuses_new_connections() {
    let renderer = renderer();
    let channel = renderer.create_render_channel().unwrap();
    renderer.stop();
    assert_eq!(channel.recv(), None);
    assert!(renderer.create_render_channel().is_err());
    renderer.stop();
}

#[test]
fn process_cleanup_during_snapshot_pause() {
    let source = Arc::new(renderer());
    let exiting = source.create_render_channel().unwrap();
    let bystander = source.create_render_channel().unwrap();
    assert_eq!(call(&exiting, GuestRequest::SetProcessId(7)), GuestResponse::Ok);
    assert_eq!(call(&bystander, GuestRequest::SetProcessId(8)), GuestResponse::Ok);

    let coordinator = source.clone();
    let bytes = finishes_in_time(move || {
        let cleanup = coordinator.cleanup_process(7);
        coordinator.pause_all_pre_save();
        cleanup.wait().unwrap();
        let mut bytes = Vec::new();
        coordinator.save(&mut bytes).unwrap();
        coordinator.resume_all();
        bytes
    });
    assert_eq!(exiting.recv(), None);
    assert_eq!(call(&bystander, GuestRequest::Finish), GuestResponse::Ok);

    // The exiting producer is saved as already gone.
    let target = renderer();
    let channels = target.load(&mut Cursor::new(bytes)).unwrap();
    assert_eq!(channels.len(), 2);
    assert!(channels[0].is_closed());
    target.resume_all();
    assert_eq!(call(&channels[1], GuestRequest::Finish), GuestResponse::Ok);
}

#[test]
fn process_cleanup_of_a_paused_producer() {
    let source = Arc::new(renderer());
    let channel = source.create_render_channel().unwrap();
    assert_eq!(call(&channel, GuestRequest::SetProcessId(7)), GuestResponse::Ok);
    source.pause_all_pre_save();
    let mut bytes = Vec::new();
    source.save(&mut bytes).unwrap();

    // Both the cleanup itself and a load queued behind it get through.
    let coordinator = source.clone();
    let channels = finishes_in_time(move || {
        coordinator.cleanup_process(7).wait().unwrap();
        let _ = coordinator.cleanup_process(7);
        coordinator.load(&mut Cursor::new(bytes)).unwrap()
    });
    assert_eq!(channel.recv(), None);
    assert_eq!(channels.len(), 1);

    source.resume_all();
    assert_eq!(call(&channels[0], GuestRequest::Finish), GuestResponse::Ok);
}

#[test]
fn connection_opened_during_snapshot_starts_paused() {
    let source = Arc::new(renderer());
    source.pause_all_pre_save();
    let channel = source.create_render_channel().unwrap();
    channel.send(GuestRequest::SetProcessId(4)).unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(channel.try_recv(), None);

    let coordinator = source.clone();
    let bytes = finishes_in_time(move || {
        let mut bytes = Vec::new();
        coordinator.save(&mut bytes).unwrap();
        bytes
    });
    source.resume_all();
    assert_eq!(channel.recv(), Some(GuestResponse::Ok));

    // The request it had not read yet was saved with it.
    let target = renderer();
    let channels = target.load(&mut Cursor::new(bytes)).unwrap();
    assert_eq!(channels.len(), 1);
    target.resume_all();
    assert_eq!(channels[0].recv(), Some(GuestResponse::Ok));
    assert!(target.process_sequence_number(4).is_ok());
}

#[test]
fn decoder_holds_off_context_creation() {
    let renderer = renderer();
    let channel = renderer.create_render_channel().unwrap();
    let decoder = renderer.registry().lock_context_structure_read();
    channel
        .send(GuestRequest::CreateContext(ContextParams::default()))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(channel.try_recv(), None);

    drop(decoder);
    match channel.recv() {
        Some(GuestResponse::Handle(handle)) => assert_ne!(handle, INVALID_HANDLE),
        other => panic!("unexpected response {:?}", other),
    }
}

#[test]
fn repost_after_stop_takes_no_reference() {
    let renderer = renderer();
    let registry = renderer.registry().clone();
    let handle = registry.create_color_buffer(1, PARAMS);
    registry.open(handle).unwrap();
    renderer.post_worker().post(handle, None).unwrap().wait().unwrap();
    assert_eq!(registry.last_posted_color_buffer(), handle);
    assert_eq!(registry.find(handle).unwrap().refcount, 1);

    renderer.stop();
    assert!(renderer.repost().is_err());
    assert_eq!(registry.find(handle).unwrap().refcount, 1);
}
