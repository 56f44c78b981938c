//! Blocking frame queue between producers and a stage worker

use super::health::QueueProbe;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Unbounded FIFO queue with an advisory high-water threshold
///
/// `enqueue` never blocks and never rejects; the threshold only drives a
/// warning when the backlog grows past it. `dequeue` blocks on a condition
/// variable until an item arrives or the queue is stopped.
#[derive(Debug)]
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    condvar: Condvar,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    stopped: bool,
    alias: String,
    threshold: usize,
    over_threshold: bool,
    peak: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(alias: impl Into<String>, threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                stopped: false,
                alias: alias.into(),
                threshold,
                over_threshold: false,
                peak: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    // A panicking producer must not wedge the worker, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an item and wake one waiting consumer
    pub fn enqueue(&self, item: T) {
        let mut inner = self.lock();
        inner.items.push_back(item);

        let len = inner.items.len();
        inner.peak = inner.peak.max(len);
        if inner.threshold > 0 && len > inner.threshold && !inner.over_threshold {
            inner.over_threshold = true;
            warn!(
                "{}: queue size {} exceeded threshold {}",
                inner.alias, len, inner.threshold
            );
        }
        drop(inner);

        self.condvar.notify_one();
    }

    /// Take the oldest item, blocking until one is available.
    ///
    /// Returns `None` once the queue is stopped and every remaining item has
    /// been handed out.
    pub fn dequeue(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                inner.rearm();
                return Some(item);
            }
            if inner.stopped {
                return None;
            }
            inner = self.condvar.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Take the oldest item without blocking
    pub fn try_dequeue(&self) -> Option<T> {
        let mut inner = self.lock();
        let item = inner.items.pop_front();
        inner.rearm();
        item
    }

    /// Mark the queue stopped and wake every blocked consumer. Idempotent.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if !inner.stopped {
            inner.stopped = true;
            debug!("{}: stopped with {} queued items", inner.alias, inner.items.len());
        }
        drop(inner);

        self.condvar.notify_all();
    }

    /// Accept consumers again after a `stop`
    pub fn restart(&self) {
        self.lock().stopped = false;
    }

    /// Drop every queued item
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.items.clear();
        inner.over_threshold = false;
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Largest backlog observed since creation
    pub fn peak_len(&self) -> usize {
        self.lock().peak
    }

    pub fn threshold(&self) -> usize {
        self.lock().threshold
    }

    pub fn set_threshold(&self, threshold: usize) {
        self.lock().threshold = threshold;
    }

    pub fn alias(&self) -> String {
        self.lock().alias.clone()
    }

    pub fn set_alias(&self, alias: impl Into<String>) {
        self.lock().alias = alias.into();
    }
}

impl<T: Send> QueueProbe for FrameQueue<T> {
    fn depth(&self) -> usize {
        self.len()
    }

    fn threshold(&self) -> usize {
        FrameQueue::threshold(self)
    }
}

impl<T> Inner<T> {
    fn rearm(&mut self) {
        if self.over_threshold && self.items.len() <= self.threshold {
            self.over_threshold = false;
        }
    }
}
