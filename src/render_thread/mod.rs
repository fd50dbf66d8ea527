// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Producer threads: one per guest connection, executing that connection's requests against the
//! registry and pausing at request boundaries when a snapshot is taken.

mod channel;
mod protocol;

use std::io::Cursor;
use std::io::Write;
use std::sync::Arc;
use std::sync::MutexGuard;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use log::error;
use log::info;
use log::warn;

pub use channel::ChannelRead;
pub use channel::RenderChannel;
pub use protocol::read_request;
pub use protocol::write_request;
pub use protocol::GuestRequest;
pub use protocol::GuestRequestRecord;
pub use protocol::GuestResponse;
pub use protocol::GUEST_REQUEST_RECORD_SIZE;

use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;
use crate::handle::ProcessId;
use crate::post_worker::PostWorker;
use crate::registry::ResourceRegistry;
use crate::snapshot::ReadBeExt;
use crate::snapshot::SnapshotProducer;
use crate::snapshot::WriteBeExt;
use crate::sync::Condvar;
use crate::sync::Mutex;
use crate::thread_info::ThreadInfo;

/// How long an idle producer sleeps before looking at its exit flag again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotState {
    Empty,
    StartSaving,
    StartLoading,
    InProgress,
    Finished,
}

struct SnapshotControl {
    state: SnapshotState,
    /// Saved or to-be-restored producer state.
    stream: Option<Vec<u8>>,
    /// The producer loop has returned.
    finished: bool,
}

struct Shared {
    channel: Arc<RenderChannel>,
    control: Mutex<SnapshotControl>,
    snapshot_signal: Condvar,
    finished_signal: Condvar,
}

impl Shared {
    fn wait_for_snapshot_completion<'a>(
        &self,
        control: MutexGuard<'a, SnapshotControl>,
    ) -> MutexGuard<'a, SnapshotControl> {
        self.snapshot_signal.wait_while(control, |c| {
            c.state != SnapshotState::Finished && !c.finished
        })
    }

    /// Runs `op` if the producer is in `expected`, then parks until the coordinator resumes or
    /// the producer is asked to exit. An exiting producer never starts the op.
    fn do_snapshot_op<F>(&self, info: &ThreadInfo, expected: SnapshotState, op: F) -> bool
    where
        F: FnOnce(&mut Option<Vec<u8>>),
    {
        let mut stream = {
            let mut control = self.control.lock();
            if control.state != expected || info.should_exit() {
                return false;
            }
            control.state = SnapshotState::InProgress;
            self.snapshot_signal.notify_all();
            control.stream.take()
        };

        op(&mut stream);

        let mut control = self.control.lock();
        control.stream = stream;
        control.state = SnapshotState::Finished;
        self.snapshot_signal.notify_all();
        let _control = self.snapshot_signal.wait_while(control, |c| {
            c.state != SnapshotState::Empty && !info.should_exit()
        });
        true
    }

    /// Wakes a producer parked in `do_snapshot_op` so it sees its exit flag.
    fn wake_for_exit(&self) {
        let _control = self.control.lock();
        self.snapshot_signal.notify_all();
    }

    fn set_finished(&self) {
        let mut control = self.control.lock();
        control.finished = true;
        self.snapshot_signal.notify_all();
        self.finished_signal.notify_all();
    }
}

/// What a producer persists: the process it serves and the requests it had not read yet.
fn save_producer_state(
    pid: ProcessId,
    channel: &RenderChannel,
    writer: &mut dyn Write,
) -> GfxstreamResult<()> {
    let requests = channel.pending_requests();
    writer.put_be64(pid)?;
    writer.put_count(requests.len())?;
    for request in &requests {
        write_request(writer, request)?;
    }
    Ok(())
}

fn load_producer_state(bytes: &[u8]) -> GfxstreamResult<(ProcessId, Vec<GuestRequest>)> {
    let mut reader = Cursor::new(bytes);
    let pid = reader.get_be64()?;
    let count = reader.get_be32()?;
    let mut requests = Vec::new();
    for _ in 0..count {
        requests.push(read_request(&mut reader)?);
    }
    if reader.position() != bytes.len() as u64 {
        return Err(GfxstreamError::Corrupt("trailing bytes in producer state"));
    }
    Ok((pid, requests))
}

/// Executes requests for one connection.
struct Producer {
    registry: Arc<ResourceRegistry>,
    post_worker: Arc<PostWorker>,
    info: Arc<ThreadInfo>,
    pid: ProcessId,
}

impl Producer {
    fn set_pid(&mut self, pid: ProcessId) {
        self.pid = pid;
        self.info.set_pid(pid);
    }

    fn execute(&mut self, request: GuestRequest) -> GuestResponse {
        let registry = &self.registry;
        match request {
            GuestRequest::SetProcessId(pid) => {
                self.set_pid(pid);
                let _ = self.registry.create_process_resources(pid);
                GuestResponse::Ok
            }
            GuestRequest::CreateColorBuffer { params, .. } => {
                GuestResponse::Handle(match request.requested_handle() {
                    Some(handle) => {
                        registry.create_color_buffer_with_handle(self.pid, params, handle)
                    }
                    None => registry.create_color_buffer(self.pid, params),
                })
            }
            GuestRequest::OpenColorBuffer(handle) => {
                GuestResponse::Status(registry.open_owned(self.pid, handle).is_ok())
            }
            GuestRequest::CloseColorBuffer(handle) => {
                GuestResponse::Status(registry.close_owned(self.pid, handle))
            }
            GuestRequest::CreateBuffer { params, .. } => {
                GuestResponse::Handle(match request.requested_handle() {
                    Some(handle) => registry.create_buffer_with_handle(params, handle),
                    None => registry.create_buffer(params),
                })
            }
            GuestRequest::CloseBuffer(handle) => GuestResponse::Status(registry.close_buffer(handle)),
            GuestRequest::CreateContext(params) => {
                GuestResponse::Handle(registry.create_context(self.pid, params))
            }
            GuestRequest::DestroyContext(handle) => {
                GuestResponse::Status(registry.destroy_context(handle))
            }
            GuestRequest::CreateWindowSurface(params) => {
                GuestResponse::Handle(registry.create_window_surface(self.pid, params))
            }
            GuestRequest::DestroyWindowSurface(handle) => {
                GuestResponse::Status(registry.destroy_window_surface(handle))
            }
            GuestRequest::SetWindowSurfaceColorBuffer {
                surface,
                color_buffer,
            } => GuestResponse::Status(
                registry.set_window_surface_color_buffer(surface, color_buffer),
            ),
            GuestRequest::Post(handle) => match self.post_worker.post(handle, None) {
                Ok(_) => GuestResponse::Status(true),
                Err(e) => {
                    error!("failed to post {}: {}", handle, e);
                    GuestResponse::Status(false)
                }
            },
            GuestRequest::LastColorBufferRef(handle) => {
                registry.on_last_color_buffer_ref(handle);
                GuestResponse::Ok
            }
            GuestRequest::Finish => {
                if let Err(e) = self.post_worker.wait_queued_items() {
                    warn!("post worker gone while finishing: {}", e);
                }
                GuestResponse::Ok
            }
        }
    }
}

/// One producer thread and its snapshot rendezvous.
pub struct RenderThread {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RenderThread {
    /// Starts a producer for a new connection.
    pub fn start(
        channel: Arc<RenderChannel>,
        registry: Arc<ResourceRegistry>,
        post_worker: Arc<PostWorker>,
    ) -> GfxstreamResult<Arc<RenderThread>> {
        RenderThread::spawn(channel, registry, post_worker, SnapshotState::Empty, None)
    }

    /// Starts a producer from state written by `save`. `None` means the saved producer had
    /// already exited; the new one finishes immediately. Restored producers wait for `resume`
    /// before touching their channel.
    pub fn restore(
        channel: Arc<RenderChannel>,
        registry: Arc<ResourceRegistry>,
        post_worker: Arc<PostWorker>,
        saved: Option<Vec<u8>>,
    ) -> GfxstreamResult<Arc<RenderThread>> {
        match saved {
            Some(stream) => RenderThread::spawn(
                channel,
                registry,
                post_worker,
                SnapshotState::StartLoading,
                Some(stream),
            ),
            None => {
                let render_thread = RenderThread::new(channel, SnapshotState::Empty, None);
                render_thread.shared.channel.close_host();
                render_thread.shared.set_finished();
                Ok(Arc::new(render_thread))
            }
        }
    }

    fn new(
        channel: Arc<RenderChannel>,
        state: SnapshotState,
        stream: Option<Vec<u8>>,
    ) -> RenderThread {
        RenderThread {
            shared: Arc::new(Shared {
                channel,
                control: Mutex::new(SnapshotControl {
                    state,
                    stream,
                    finished: false,
                }),
                snapshot_signal: Condvar::new(),
                finished_signal: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    fn spawn(
        channel: Arc<RenderChannel>,
        registry: Arc<ResourceRegistry>,
        post_worker: Arc<PostWorker>,
        state: SnapshotState,
        stream: Option<Vec<u8>>,
    ) -> GfxstreamResult<Arc<RenderThread>> {
        let render_thread = Arc::new(RenderThread::new(channel, state, stream));
        let shared = render_thread.shared.clone();
        let handle = thread::Builder::new()
            .name("gfxstream_render".to_string())
            .spawn(move || run(shared, registry, post_worker))?;
        *render_thread.thread.lock() = Some(handle);
        Ok(render_thread)
    }

    pub fn channel(&self) -> &Arc<RenderChannel> {
        &self.shared.channel
    }

    pub fn snapshot_state(&self) -> SnapshotState {
        self.shared.control.lock().state
    }

    pub fn is_finished(&self) -> bool {
        self.shared.control.lock().finished
    }

    pub fn wait_for_finished(&self) {
        let control = self.shared.control.lock();
        let _control = self
            .shared
            .finished_signal
            .wait_while(control, |c| !c.finished);
    }

    /// Closes the channel from the host side, releases any snapshot pause and joins the thread.
    pub fn shutdown(&self) {
        self.shared.channel.close_host();
        self.resume();
        self.wait_for_finished();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("render thread panicked");
            }
        }
    }
}

impl SnapshotProducer for RenderThread {
    fn pause_pre_snapshot(&self) {
        let mut control = self.shared.control.lock();
        if control.state != SnapshotState::Empty {
            warn!("render thread already in snapshot state {:?}", control.state);
            return;
        }
        control.stream = None;
        control.state = SnapshotState::StartSaving;
        self.shared.channel.pause_pre_snapshot();
        self.shared.snapshot_signal.notify_all();
    }

    fn save(&self, writer: &mut dyn Write) -> GfxstreamResult<()> {
        let stream = {
            let control = self.shared.control.lock();
            let control = self.shared.wait_for_snapshot_completion(control);
            if control.state == SnapshotState::Finished && !control.finished {
                control.stream.clone()
            } else {
                None
            }
        };

        match stream {
            Some(bytes) => {
                writer.put_bool(true)?;
                writer.put_blob(&bytes)
            }
            None => writer.put_bool(false),
        }
    }

    fn resume(&self) {
        let control = self.shared.control.lock();
        if control.state == SnapshotState::Empty {
            return;
        }
        let mut control = self.shared.wait_for_snapshot_completion(control);
        control.stream = None;
        control.state = SnapshotState::Empty;
        self.shared.channel.resume();
        self.shared.snapshot_signal.notify_all();
    }
}

fn run(shared: Arc<Shared>, registry: Arc<ResourceRegistry>, post_worker: Arc<PostWorker>) {
    let registration = registry.threads().register();
    let mut producer = Producer {
        registry,
        post_worker,
        info: registration.info().clone(),
        pid: 0,
    };
    let waker_shared = Arc::downgrade(&shared);
    producer.info.set_exit_waker(Box::new(move || {
        if let Some(shared) = waker_shared.upgrade() {
            shared.wake_for_exit();
        }
    }));

    let mut restored = Ok(None);
    let thread_info = producer.info.clone();
    let loaded = shared.do_snapshot_op(&thread_info, SnapshotState::StartLoading, |stream| {
        restored = match stream.as_deref() {
            Some(bytes) => load_producer_state(bytes).map(Some),
            None => Err(GfxstreamError::Corrupt("missing producer state")),
        };
    });
    if loaded {
        match restored {
            Ok(Some((pid, requests))) => {
                debug!("restored producer for process {}", pid);
                producer.set_pid(pid);
                shared.channel.restore_requests(requests);
            }
            Ok(None) => (),
            Err(e) => {
                error!("failed to restore producer: {}", e);
                shared.channel.close_host();
                shared.set_finished();
                return;
            }
        }
    }

    loop {
        if producer.info.should_exit() {
            info!("producer for process {} asked to exit", producer.pid);
            break;
        }

        match shared.channel.read_request(IDLE_POLL_INTERVAL) {
            ChannelRead::Request(request) => {
                let response = producer.execute(request);
                shared.channel.write_response(response);
            }
            ChannelRead::Paused => {
                // Exiting producers count as already quiesced.
                if producer.info.should_exit() {
                    info!("producer for process {} exiting during snapshot", producer.pid);
                    break;
                }
                let pid = producer.pid;
                let channel = shared.channel.clone();
                let saved = shared.do_snapshot_op(
                    &thread_info,
                    SnapshotState::StartSaving,
                    |stream| {
                        let mut bytes = Vec::new();
                        match save_producer_state(pid, &channel, &mut bytes) {
                            Ok(()) => *stream = Some(bytes),
                            Err(e) => error!("failed to save producer state: {}", e),
                        }
                    },
                );
                if !saved {
                    thread::sleep(IDLE_POLL_INTERVAL);
                }
            }
            ChannelRead::Idle => (),
            ChannelRead::Closed => break,
        }
    }

    // Finished before unregistering, so a process cleanup that sees this producer gone also
    // sees it finished.
    shared.channel.close_host();
    shared.set_finished();
    drop(registration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_state_layout() {
        let channel = RenderChannel::new();
        channel.send(GuestRequest::Post(3)).unwrap();
        let mut bytes = Vec::new();
        save_producer_state(9, &channel, &mut bytes).unwrap();
        assert_eq!(bytes.len(), 8 + 4 + GUEST_REQUEST_RECORD_SIZE);

        let (pid, requests) = load_producer_state(&bytes).unwrap();
        assert_eq!(pid, 9);
        assert_eq!(requests, vec![GuestRequest::Post(3)]);

        bytes.push(0);
        assert!(load_producer_state(&bytes).is_err());
    }
}
