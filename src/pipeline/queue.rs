//! Bounded FIFO between the device monitor (producer) and the worker.
//!
//! Enqueue never blocks: a full queue rejects the job and counts the drop.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::errors::{Result, SafegateError};
use crate::platform::pal::Device;

/// One device insertion awaiting processing. Immutable once created.
#[derive(Debug, Clone)]
pub struct ProcessingJob {
    pub device: Device,
    pub enqueued_at: Instant,
}

impl ProcessingJob {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self {
            device,
            enqueued_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Cloneable multi-producer, multi-consumer handle.
#[derive(Clone)]
pub struct WorkQueue {
    tx: Sender<ProcessingJob>,
    rx: Receiver<ProcessingJob>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl WorkQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking add. Returns the queue depth after the insert.
    pub fn enqueue(&self, job: ProcessingJob) -> Result<usize> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(self.tx.len()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(SafegateError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Disconnected(_)) => Err(SafegateError::ChannelClosed {
                component: "work queue",
            }),
        }
    }

    /// Wait up to `timeout` for the next job. `None` on timeout.
    #[must_use]
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<ProcessingJob> {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => Some(job),
            // The queue owns a sender, so disconnection cannot happen while
            // `self` is alive; treat it as an idle tick either way.
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs rejected because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
