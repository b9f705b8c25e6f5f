//! Handles to running background tasks and their output queues.

use crate::pipeline::messages::TaskKind;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Result of one non-blocking poll of a task queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll<T> {
    /// The next queued item.
    Ready(T),
    /// Nothing queued right now.
    Pending,
    /// The producer is gone and the queue is drained.
    Closed,
}

/// Non-blocking poll of a single-consumer queue.
pub fn poll_queue<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> TaskPoll<T> {
    match rx.try_recv() {
        Ok(item) => TaskPoll::Ready(item),
        Err(TryRecvError::Empty) => TaskPoll::Pending,
        Err(TryRecvError::Disconnected) => TaskPoll::Closed,
    }
}

/// The consumer side of a background task's queue.
///
/// The task itself runs detached and is never aborted; it ends by publishing
/// its terminal item and dropping the sender.
#[derive(Debug)]
pub struct TaskHandle<T> {
    kind: TaskKind,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> TaskHandle<T> {
    pub fn new(kind: TaskKind, rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { kind, rx }
    }

    #[must_use]
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Take the next queued item without blocking.
    pub fn try_next(&mut self) -> TaskPoll<T> {
        poll_queue(&mut self.rx)
    }
}
