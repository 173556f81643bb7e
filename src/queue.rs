// Copyright 2020 Joyent, Inc.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::request::KvRequest;

/// Why a push was refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PushError {
    /// The queue has reached its capacity.
    Full,
    /// The queue has been closed or drained; no further work is accepted.
    Closed,
}

struct QueueState {
    items: VecDeque<Arc<KvRequest>>,
    open: bool,
}

/// A bounded FIFO of pending requests shared by the clients of one
/// pipeline.
///
/// Consumers block in [`OpConsumer::pop`] until work arrives or the handle
/// is closed. Closing a consumer is the queue's only cross-thread wake
/// signal: the owning client observes `pop() == None`, drops the handle,
/// and re-reads its parent pipeline before fetching a fresh one. Both
/// shutdown and topology reassignment ride on that single edge.
pub struct OpQueue {
    protected: Arc<(Mutex<QueueState>, Condvar)>,
    capacity: usize,
}

impl OpQueue {
    pub fn new(capacity: usize) -> Self {
        OpQueue {
            protected: Arc::new((
                Mutex::new(QueueState {
                    items: VecDeque::new(),
                    open: true,
                }),
                Condvar::new(),
            )),
            capacity,
        }
    }

    /// Append a request. Fails with `Full` at capacity and `Closed` once the
    /// queue has been shut down or drained.
    pub fn push(&self, req: Arc<KvRequest>) -> Result<(), PushError> {
        let (lock, cvar) = &*self.protected;
        let mut state = lock.lock().unwrap();
        if !state.open {
            return Err(PushError::Closed);
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full);
        }
        state.items.push_back(req);
        cvar.notify_one();
        Ok(())
    }

    /// Create a consumer handle on this queue. Handles are independent:
    /// closing one does not disturb the others, and a fresh handle may be
    /// fetched at any time while the queue is open.
    pub fn consumer(&self) -> Arc<OpConsumer> {
        Arc::new(OpConsumer {
            protected: Arc::clone(&self.protected),
            closed: AtomicBool::new(false),
        })
    }

    /// Stop accepting work and wake every blocked consumer. Queued requests
    /// are retained for a later [`drain`](Self::drain).
    pub fn close(&self) {
        let (lock, cvar) = &*self.protected;
        let mut state = lock.lock().unwrap();
        state.open = false;
        cvar.notify_all();
    }

    /// Terminally empty the queue, invoking `cb` for every queued request in
    /// FIFO order. Subsequent pushes fail with `Closed`.
    pub fn drain<F>(&self, mut cb: F)
    where
        F: FnMut(Arc<KvRequest>),
    {
        let drained: Vec<Arc<KvRequest>> = {
            let (lock, cvar) = &*self.protected;
            let mut state = lock.lock().unwrap();
            state.open = false;
            cvar.notify_all();
            state.items.drain(..).collect()
        };
        for req in drained {
            cb(req);
        }
    }

    pub fn len(&self) -> usize {
        let (lock, _) = &*self.protected;
        lock.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A blocking consumer handle on an [`OpQueue`].
pub struct OpConsumer {
    protected: Arc<(Mutex<QueueState>, Condvar)>,
    closed: AtomicBool,
}

impl OpConsumer {
    /// Block until a request is available. Returns `None` once this handle
    /// has been closed or the queue has been shut down.
    pub fn pop(&self) -> Option<Arc<KvRequest>> {
        let (lock, cvar) = &*self.protected;
        let mut state = lock.lock().unwrap();
        loop {
            if self.closed.load(Ordering::Acquire) || !state.open {
                return None;
            }
            if let Some(req) = state.items.pop_front() {
                return Some(req);
            }
            state = cvar.wait(state).unwrap();
        }
    }

    /// Close the handle, unblocking any in-progress `pop` with `None`.
    /// Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let (lock, cvar) = &*self.protected;
        // Take the lock so a parked pop cannot miss the flag between its
        // check and its wait.
        let _state = lock.lock().unwrap();
        cvar.notify_all();
    }
}
