// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side resource registry and command serialization for a virtio-gpu graphics backend.

pub mod backend;
mod clock;
mod config;
mod delayed_close;
mod error;
mod handle;
mod post_worker;
mod process;
mod readback_worker;
mod registry;
pub mod render_thread;
mod renderer;
mod resource;
pub mod snapshot;
mod sync;
mod sync_thread;
mod thread_info;
mod worker;

pub use crate::backend::BackendEvent;
pub use crate::backend::BackendResource;
pub use crate::backend::ColorBufferParams;
pub use crate::backend::ContextParams;
pub use crate::backend::DataBufferParams;
pub use crate::backend::GraphicsBackend;
pub use crate::backend::HostMemoryBackend;
pub use crate::backend::Rect;
pub use crate::backend::ResourceParams;
pub use crate::backend::ScreenshotParams;
pub use crate::backend::WindowSurfaceParams;
pub use crate::clock::Clock;
pub use crate::clock::ManualClock;
pub use crate::clock::SystemClock;
pub use crate::config::DisplayConfig;
pub use crate::config::RegistryConfig;
pub use crate::config::RendererFeatures;
pub use crate::config::DEFAULT_CLOSE_GRACE_PERIOD_US;
pub use crate::delayed_close::DelayedCloseEntry;
pub use crate::delayed_close::DelayedCloseQueue;
pub use crate::error::GfxstreamError;
pub use crate::error::GfxstreamResult;
pub use crate::handle::DisplayId;
pub use crate::handle::HandleAllocator;
pub use crate::handle::ProcessId;
pub use crate::handle::ResourceHandle;
pub use crate::handle::INVALID_HANDLE;
pub use crate::post_worker::PostCallback;
pub use crate::post_worker::PostCommand;
pub use crate::post_worker::PostReference;
pub use crate::post_worker::PostWorker;
pub use crate::process::CleanupKey;
pub use crate::process::ProcessResources;
pub use crate::readback_worker::ReadbackCommand;
pub use crate::readback_worker::ReadbackWorker;
pub use crate::registry::CloseOutcome;
pub use crate::registry::ResourceRegistry;
pub use crate::registry::MAX_OUTSTANDING_DESTROYS;
pub use crate::render_thread::GuestRequest;
pub use crate::render_thread::GuestResponse;
pub use crate::render_thread::RenderChannel;
pub use crate::render_thread::RenderThread;
pub use crate::render_thread::SnapshotState;
pub use crate::renderer::Renderer;
pub use crate::renderer::RendererBuilder;
pub use crate::resource::RecordInfo;
pub use crate::resource::ResourceKind;
pub use crate::resource::ResourceRecord;
pub use crate::snapshot::SnapshotProducer;
pub use crate::sync_thread::SyncThread;
pub use crate::thread_info::ThreadInfo;
pub use crate::thread_info::ThreadInfoRegistration;
pub use crate::thread_info::ThreadInfoTable;
pub use crate::worker::completion;
pub use crate::worker::Completion;
pub use crate::worker::WorkerProcessingResult;
pub use crate::worker::WorkerState;
pub use crate::worker::WorkerThread;
