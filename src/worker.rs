// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A single-consumer command queue drained by one dedicated thread.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::thread;
use std::thread::JoinHandle;

use futures::channel::oneshot;
use futures::executor::block_on;
use futures::FutureExt;
use log::debug;
use log::error;

use crate::error::GfxstreamError;
use crate::error::GfxstreamResult;
use crate::sync::Condvar;
use crate::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerProcessingResult {
    Continue,
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Stopped,
}

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Resolves once a command has run, or has been dropped because the worker stopped first.
#[must_use]
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<()>,
}

/// Creates a completion and the sender that fires it.
pub fn completion() -> (oneshot::Sender<()>, Completion) {
    let (sender, receiver) = oneshot::channel();
    (sender, Completion { receiver })
}

impl Completion {
    /// Blocks the calling thread until the completion fires.
    pub fn wait(self) -> GfxstreamResult<()> {
        block_on(self)
    }

    /// A completion that has already fired.
    pub fn ready() -> Completion {
        let (sender, completion) = completion();
        let _ = sender.send(());
        completion
    }
}

impl From<oneshot::Receiver<()>> for Completion {
    fn from(receiver: oneshot::Receiver<()>) -> Completion {
        Completion { receiver }
    }
}

impl Future for Completion {
    type Output = GfxstreamResult<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver
            .poll_unpin(cx)
            .map(|r| r.map_err(|_| GfxstreamError::CompletionDropped))
    }
}

struct Command<Item> {
    item: Option<Item>,
    completed: oneshot::Sender<()>,
}

struct Queue<Item> {
    commands: Vec<Command<Item>>,
    exiting: bool,
}

struct Shared<Item> {
    queue: Mutex<Queue<Item>>,
    cv: Condvar,
    state: AtomicU8,
}

type Processor<Item> = Box<dyn FnMut(Item) -> WorkerProcessingResult + Send>;

/// Runs `processor` on every enqueued item, in enqueue order, on a thread of its own.
///
/// The thread starts on the first enqueue. Once the processor returns `Stop`, everything still
/// queued or enqueued later completes without being processed. Such items are dropped before
/// their completion fires, so an item can release what it holds in `Drop`.
pub struct WorkerThread<Item: Send + 'static> {
    name: &'static str,
    shared: Arc<Shared<Item>>,
    processor: Mutex<Option<Processor<Item>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<Item: Send + 'static> WorkerThread<Item> {
    pub fn new<F>(name: &'static str, processor: F) -> WorkerThread<Item>
    where
        F: FnMut(Item) -> WorkerProcessingResult + Send + 'static,
    {
        WorkerThread {
            name,
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    commands: Vec::with_capacity(10),
                    exiting: false,
                }),
                cv: Condvar::new(),
                state: AtomicU8::new(NOT_STARTED),
            }),
            processor: Mutex::new(Some(Box::new(processor))),
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> WorkerState {
        match self.shared.state.load(Ordering::SeqCst) {
            NOT_STARTED => WorkerState::NotStarted,
            RUNNING => WorkerState::Running,
            _ => WorkerState::Stopped,
        }
    }

    /// Starts the consumer thread if nobody has yet.
    pub fn start(&self) {
        if self
            .shared
            .state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let mut processor = match self.processor.lock().take() {
            Some(processor) => processor,
            None => return,
        };
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || thread_loop(&shared, &mut processor));

        match spawned {
            Ok(handle) => {
                debug!("worker {} started", self.name);
                *self.thread.lock() = Some(handle);
            }
            Err(e) => {
                error!("failed to spawn worker {}: {}", self.name, e);
                stop_queue(&self.shared);
            }
        }
    }

    /// Queues `item` and returns a completion for it. Never blocks on the consumer.
    pub fn enqueue(&self, item: Item) -> Completion {
        self.enqueue_command(Some(item))
    }

    /// Waits until everything enqueued so far has been processed, or the worker stopped.
    pub fn wait_queued_items(&self) -> GfxstreamResult<()> {
        self.enqueue_command(None).wait()
    }

    fn enqueue_command(&self, item: Option<Item>) -> Completion {
        if self.state() == WorkerState::NotStarted {
            self.start();
        }

        let (completed, completion) = completion();
        let mut queue = self.shared.queue.lock();
        if queue.exiting {
            drop(queue);
            drop(item);
            let _ = completed.send(());
            return completion;
        }
        queue.commands.push(Command { item, completed });
        self.shared.cv.notify_one();
        completion
    }

    /// Waits for the consumer thread to exit. Something must have made the processor return
    /// `Stop` first or this blocks forever.
    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("worker {} panicked", self.name);
                stop_queue(&self.shared);
            }
            debug!("worker {} joined", self.name);
        }
    }
}

fn stop_queue<Item>(shared: &Shared<Item>) {
    let pending = {
        let mut queue = shared.queue.lock();
        queue.exiting = true;
        mem::take(&mut queue.commands)
    };
    shared.state.store(STOPPED, Ordering::SeqCst);
    for Command { item, completed } in pending {
        drop(item);
        let _ = completed.send(());
    }
}

fn thread_loop<Item>(shared: &Shared<Item>, processor: &mut Processor<Item>) {
    let mut todo: Vec<Command<Item>> = Vec::with_capacity(10);
    loop {
        {
            let queue = shared.queue.lock();
            let mut queue = shared
                .cv
                .wait_while(queue, |queue| queue.commands.is_empty());
            mem::swap(&mut todo, &mut queue.commands);
        }

        let mut should_stop = false;
        for Command { item, completed } in todo.drain(..) {
            if let Some(item) = item {
                if !should_stop {
                    should_stop = processor(item) == WorkerProcessingResult::Stop;
                }
            }
            let _ = completed.send(());
        }

        if should_stop {
            stop_queue(shared);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::channel;

    use super::*;

    #[test]
    fn starts_lazily_and_processes_in_order() {
        let (sender, receiver) = channel();
        let worker = WorkerThread::new("test", move |item: u32| {
            sender.send(item).unwrap();
            WorkerProcessingResult::Continue
        });
        assert_eq!(worker.state(), WorkerState::NotStarted);

        for i in 0..16 {
            let _ = worker.enqueue(i);
        }
        worker.wait_queued_items().unwrap();
        assert_eq!(worker.state(), WorkerState::Running);
        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn items_after_stop_complete_unprocessed() {
        let processed = Arc::new(Mutex::new(Vec::new()));
        let seen = processed.clone();
        let worker = WorkerThread::new("test", move |item: Option<u32>| match item {
            Some(value) => {
                seen.lock().push(value);
                WorkerProcessingResult::Continue
            }
            None => WorkerProcessingResult::Stop,
        });

        worker.enqueue(Some(1)).wait().unwrap();
        worker.enqueue(None).wait().unwrap();
        worker.join();
        assert_eq!(worker.state(), WorkerState::Stopped);

        worker.enqueue(Some(2)).wait().unwrap();
        worker.wait_queued_items().unwrap();
        assert_eq!(*processed.lock(), vec![1]);
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn unprocessed_items_are_dropped_before_completion() {
        let worker = WorkerThread::new("test", |_item: DropFlag| WorkerProcessingResult::Stop);
        worker.enqueue(DropFlag(Default::default())).wait().unwrap();
        worker.join();

        let dropped = Arc::new(AtomicBool::new(false));
        worker.enqueue(DropFlag(dropped.clone())).wait().unwrap();
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn ready_completion_resolves() {
        assert!(Completion::ready().wait().is_ok());
        let (sender, completion) = completion();
        drop(sender);
        assert!(matches!(
            completion.wait(),
            Err(GfxstreamError::CompletionDropped)
        ));
    }
}
