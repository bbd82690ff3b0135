// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// A single dedicated background thread per engine, communicating over a
// channel. `Worker::submit` blocks until the job it just sent completes,
// which makes "the next join waits for the previous worker" observably true
// without any extra bookkeeping on the caller's side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() -> crate::error::Result<()> + Send>;

enum Message {
    Run(Job, Sender<crate::error::Result<()>>),
    Shutdown,
}

/// Set by `Worker::drop` so `run_loop` can tell a channel disconnect
/// (program bug) apart from an orderly shutdown, for its exit log line.
#[derive(Clone, Default)]
struct ShuttingDown(Arc<AtomicBool>);

impl ShuttingDown {
    fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn is_marked(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Owns the background thread for one engine.
pub struct Worker {
    sender: Sender<Message>,
    handle: Option<JoinHandle<()>>,
    shutting_down: ShuttingDown,
}

impl Worker {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver): (Sender<Message>, Receiver<Message>) = mpsc::channel();
        let shutting_down = ShuttingDown::default();

        let handle = std::thread::Builder::new()
            .name("tdchunk-extraction".into())
            .spawn({
                let shutting_down = shutting_down.clone();
                move || run_loop(&receiver, &shutting_down)
            })
            .expect("failed to spawn background extraction thread");

        Self {
            sender,
            handle: Some(handle),
            shutting_down,
        }
    }

    /// Runs `job` on the worker thread and blocks until it finishes.
    pub fn submit(&self, job: Job) -> crate::error::Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();

        self.sender
            .send(Message::Run(job, reply_tx))
            .expect("worker thread should still be alive");

        reply_rx
            .recv()
            .expect("worker thread dropped the reply channel without answering")
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

fn run_loop(receiver: &Receiver<Message>, shutting_down: &ShuttingDown) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(job, reply) => {
                let result = job();
                if let Err(e) = &result {
                    log::error!("extraction worker job failed: {e}");
                }
                let _ = reply.send(result);
            }
            Message::Shutdown => break,
        }
    }

    if shutting_down.is_marked() {
        log::trace!("extraction worker thread exiting after engine shutdown");
    } else {
        log::trace!("extraction worker thread exiting: sender dropped without a shutdown message");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutting_down.mark();
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
