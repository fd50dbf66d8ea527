// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;
use crate::render_thread::protocol::GuestRequest;
use crate::render_thread::protocol::GuestResponse;
use crate::sync::Condvar;
use crate::sync::Mutex;

/// What the producer gets back from `RenderChannel::read_request`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRead {
    Request(GuestRequest),
    /// A snapshot is pending; stop reading until resumed.
    Paused,
    /// Nothing arrived within the poll interval.
    Idle,
    Closed,
}

#[derive(Default)]
struct ChannelState {
    requests: VecDeque<GuestRequest>,
    responses: VecDeque<GuestResponse>,
    guest_closed: bool,
    host_closed: bool,
    paused: bool,
}

/// The two-way queue between one guest connection and its producer thread.
#[derive(Default)]
pub struct RenderChannel {
    state: Mutex<ChannelState>,
    cv: Condvar,
}

impl RenderChannel {
    pub fn new() -> RenderChannel {
        Default::default()
    }

    /// Guest side: queues a request.
    pub fn send(&self, request: GuestRequest) -> GfxstreamResult<()> {
        let mut state = self.state.lock();
        if state.host_closed || state.guest_closed {
            return Err(GfxstreamError::WorkerStopped("render channel"));
        }
        state.requests.push_back(request);
        self.cv.notify_all();
        Ok(())
    }

    /// Guest side: blocks for the next response. `None` once the host side went away and every
    /// response was consumed.
    pub fn recv(&self) -> Option<GuestResponse> {
        let mut state = self.state.lock();
        loop {
            if let Some(response) = state.responses.pop_front() {
                return Some(response);
            }
            if state.host_closed {
                return None;
            }
            state = self.cv.wait(state);
        }
    }

    pub fn try_recv(&self) -> Option<GuestResponse> {
        self.state.lock().responses.pop_front()
    }

    /// Guest side: no more requests. Whatever is queued still runs.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.guest_closed = true;
        self.cv.notify_all();
    }

    /// Producer side: waits up to `timeout` for work.
    pub fn read_request(&self, timeout: Duration) -> ChannelRead {
        let mut state = self.state.lock();
        loop {
            if state.host_closed {
                return ChannelRead::Closed;
            }
            if state.paused {
                return ChannelRead::Paused;
            }
            if let Some(request) = state.requests.pop_front() {
                return ChannelRead::Request(request);
            }
            if state.guest_closed {
                return ChannelRead::Closed;
            }
            let (guard, timed_out) = self.cv.wait_timeout(state, timeout);
            state = guard;
            if timed_out {
                return ChannelRead::Idle;
            }
        }
    }

    pub fn write_response(&self, response: GuestResponse) {
        let mut state = self.state.lock();
        state.responses.push_back(response);
        self.cv.notify_all();
    }

    /// Producer side: the producer is gone. Wakes a guest blocked in `recv`.
    pub fn close_host(&self) {
        let mut state = self.state.lock();
        state.host_closed = true;
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.host_closed || (state.guest_closed && state.requests.is_empty())
    }

    pub fn pause_pre_snapshot(&self) {
        let mut state = self.state.lock();
        state.paused = true;
        self.cv.notify_all();
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        self.cv.notify_all();
    }

    /// Requests queued but not yet picked up by the producer.
    pub fn pending_requests(&self) -> Vec<GuestRequest> {
        self.state.lock().requests.iter().copied().collect()
    }

    /// Puts restored requests ahead of anything the guest sent since.
    pub fn restore_requests(&self, requests: Vec<GuestRequest>) {
        let mut state = self.state.lock();
        for request in requests.into_iter().rev() {
            state.requests.push_front(request);
        }
        self.cv.notify_all();
    }
}
