// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{types::ExecutionContext, worker::CompletedAttempt};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Unbounded multi-producer multi-consumer queue whose pop waits for a bounded time.
///
/// A `None` pop only means that nothing arrived in time. Consumers use it to re-check
/// the shutdown signal and otherwise ignore it.
pub struct BlockingQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    pop_timeout: Duration,
}

impl<T> Clone for BlockingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            pop_timeout: self.pop_timeout,
        }
    }
}

impl<T> BlockingQueue<T> {
    pub fn new(pop_timeout: Duration) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            pop_timeout,
        }
    }

    pub fn push(&self, item: T) {
        // Both ends live in self, so the channel can't be disconnected.
        if self.sender.send(item).is_err() {
            unreachable!("BlockingQueue channel disconnected");
        }
    }

    pub fn pop(&self) -> Option<T> {
        match self.receiver.recv_timeout(self.pop_timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Contexts waiting for a worker, including redos.
pub type TaskQueue = BlockingQueue<ExecutionContext>;
/// Finished attempts on their way to the sequencer.
pub type ResponseQueue = BlockingQueue<CompletedAttempt>;

/// Cooperative stop flag shared by the workers, the sequencer and admitters.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
