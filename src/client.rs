// Copyright 2020 Joyent, Inc.

use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use slog::{debug, error, Logger};

use crate::breaker::{CircuitBreaker, LazyCircuitBreaker, NoopCircuitBreaker};
use crate::connection::MemdClient;
use crate::error::Error;
use crate::pipeline::Pipeline;
use crate::queue::OpConsumer;
use crate::request::{KvRequest, KvResponse};
use crate::retry::{RetryOrchestrator, RetryReason};

const DIAL_BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(5);

// A one-way boolean latch for cross-thread wakeups.
struct Latch {
    pair: (Mutex<bool>, Condvar),
}

impl Latch {
    fn new() -> Self {
        Latch {
            pair: (Mutex::new(false), Condvar::new()),
        }
    }

    fn set(&self) {
        let (lock, cvar) = &self.pair;
        let mut flag = lock.lock().unwrap();
        *flag = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (lock, cvar) = &self.pair;
        let mut flag = lock.lock().unwrap();
        while !*flag {
            flag = cvar.wait(flag).unwrap();
        }
    }

    // Wait out `timeout` unless the latch is set first. Returns the latch
    // state.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &self.pair;
        let mut flag = lock.lock().unwrap();
        while !*flag {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _result) = cvar.wait_timeout(flag, deadline - now).unwrap();
            flag = guard;
        }
        *flag
    }
}

struct ClientInner {
    // None is the sticky shutdown signal: once the parent is gone the run
    // loop may only wind down.
    parent: Option<Arc<Pipeline>>,
    client: Option<Arc<dyn MemdClient>>,
    consumer: Option<Arc<OpConsumer>>,
}

/// One slot of a pipeline's connection pool.
///
/// A pipeline client owns at most one socket at a time and runs a long-lived
/// loop that dials, pumps requests from the parent pipeline's queue onto the
/// socket, and redials whenever the socket dies. The inner mutex guards only
/// the (parent, client, consumer) triple and is never held across I/O.
pub struct PipelineClient {
    me: Weak<PipelineClient>,
    address: String,
    inner: Mutex<ClientInner>,
    breaker: Arc<dyn CircuitBreaker>,
    retry: Arc<dyn RetryOrchestrator>,
    closed_sig: Latch,
    dial_wake: Latch,
    log: Logger,
}

impl PipelineClient {
    pub(crate) fn new(parent: &Arc<Pipeline>) -> Arc<Self> {
        let address = parent.address().to_string();
        let log = parent.log().clone();
        let breaker_cfg = parent.breaker_cfg().clone();
        Arc::new_cyclic(|me: &Weak<PipelineClient>| {
            let breaker: Arc<dyn CircuitBreaker> = if breaker_cfg.enabled {
                let probe = me.clone();
                Arc::new(LazyCircuitBreaker::new(
                    &breaker_cfg,
                    Box::new(move || {
                        // Probe off-thread; the breaker transition must not
                        // block on the canary round trip.
                        let probe = probe.clone();
                        thread::spawn(move || {
                            if let Some(pipecli) = probe.upgrade() {
                                pipecli.send_canary();
                            }
                        });
                    }),
                ))
            } else {
                Arc::new(NoopCircuitBreaker)
            };
            PipelineClient {
                me: me.clone(),
                address,
                inner: Mutex::new(ClientInner {
                    parent: Some(Arc::clone(parent)),
                    client: None,
                    consumer: None,
                }),
                breaker,
                retry: Arc::clone(parent.retry()),
                closed_sig: Latch::new(),
                dial_wake: Latch::new(),
                log,
            }
        })
    }

    /// The outer loop: dial, run the socket until it dies, repeat. Exits
    /// only once the parent reference has been nilled by
    /// [`close`](Self::close).
    pub(crate) fn run(self: Arc<Self>) {
        let mut redial = ExponentialBackoff {
            initial_interval: DIAL_BACKOFF_INITIAL,
            max_interval: DIAL_BACKOFF_MAX,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        loop {
            let pipeline = { self.inner.lock().unwrap().parent.clone() };
            let pipeline = match pipeline {
                Some(pipeline) => pipeline,
                None => {
                    debug!(self.log, "pipeline client is shutting down");
                    break;
                }
            };

            self.breaker.reset();

            debug!(self.log, "retrieving new client connection");
            let client = match pipeline.dial() {
                Ok(client) => {
                    redial.reset();
                    client
                }
                Err(err) => {
                    debug!(self.log, "failed to dial {}: {}", self.address, err);
                    if let Some(delay) = redial.next_backoff() {
                        // Interruptible by close so shutdown never waits out
                        // a backoff.
                        self.dial_wake.wait_timeout(delay);
                    }
                    continue;
                }
            };

            debug!(self.log, "starting new client io loop");
            self.io_loop(client);
        }

        self.closed_sig.set();
        debug!(self.log, "pipeline client exited");
    }

    fn io_loop(&self, client: Arc<dyn MemdClient>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.parent.is_none() {
                drop(inner);
                debug!(self.log, "io loop started with no parent pipeline");
                if let Err(err) = client.close() {
                    error!(self.log, "failed to close client for shut down io loop: {}", err);
                }
                return;
            }
            inner.client = Some(Arc::clone(&client));
        }

        let watcher = match self.me.upgrade() {
            Some(watcher) => watcher,
            None => return,
        };

        // The watcher owns all socket-death cleanup, including deaths the
        // main loop provoked itself by closing the socket. Waiting on the
        // kill channel before leaving guarantees the cleanup ran exactly
        // once per socket.
        let (kill_tx, kill_rx) = mpsc::channel::<()>();
        let watched = Arc::clone(&client);
        thread::spawn(move || {
            debug!(watcher.log, "client watcher starting");
            watched.wait_closed();
            debug!(watcher.log, "client died");
            let consumer = {
                let mut inner = watcher.inner.lock().unwrap();
                inner.client = None;
                inner.consumer.take()
            };
            // Closing the consumer wakes the main loop's pop. Without an
            // active consumer the main loop is already on its way to
            // fetching one and will find the dead client there.
            if let Some(consumer) = consumer {
                consumer.close();
            }
            let _ = kill_tx.send(());
        });

        let mut local_consumer: Option<Arc<OpConsumer>> = None;
        loop {
            if local_consumer.is_none() {
                let mut inner = self.inner.lock().unwrap();
                if let Some(stale) = inner.consumer.take() {
                    stale.close();
                }
                if inner.client.is_none() {
                    // The watcher has already cleaned up the dead socket;
                    // fall out to the dial loop.
                    break;
                }
                match inner.parent.clone() {
                    None => {
                        drop(inner);
                        debug!(self.log, "found no parent pipeline, shutting down");
                        // Close our socket so the watcher performs cleanup.
                        if let Err(err) = client.close() {
                            error!(self.log, "failed to shut down client socket: {}", err);
                        }
                        break;
                    }
                    Some(parent) => {
                        let consumer = parent.queue().consumer();
                        inner.consumer = Some(Arc::clone(&consumer));
                        local_consumer = Some(consumer);
                    }
                }
            }

            let req = match local_consumer.as_ref().and_then(|consumer| consumer.pop()) {
                Some(req) => req,
                None => {
                    // Both shutdown and reassignment signal by closing the
                    // consumer; dropping it forces the acquisition logic
                    // above to re-read the parent.
                    local_consumer = None;
                    continue;
                }
            };

            if req.is_cancelled() {
                // The canceller already delivered the terminal callback.
                continue;
            }

            if !self.breaker.allows_request() {
                if self
                    .retry
                    .wait_and_retry(Arc::clone(&req), RetryReason::CircuitBreakerOpen)
                {
                    continue;
                }
                req.try_callback(Err(Error::CircuitBreakerOpen));
                // There may be more requests behind this one that will be
                // admitted, so keep consuming.
                continue;
            }

            let breaker = Arc::clone(&self.breaker);
            req.set_completion_hook(Box::new(move |err| {
                if breaker.completion_callback(err) {
                    breaker.mark_successful();
                } else {
                    breaker.mark_failure();
                }
            }));

            if let Err(err) = client.send_request(Arc::clone(&req)) {
                debug!(self.log, "socket write error: {}", err);

                if !matches!(err, Error::SocketClosed) {
                    // The socket was still up when the write failed; close
                    // it so the watcher runs the shutdown path. On
                    // SocketClosed the watcher is already cleaning up.
                    if let Err(close_err) = client.close() {
                        error!(
                            self.log,
                            "failed to shut down errored client socket: {}", close_err
                        );
                    }
                }

                match err {
                    Error::CollectionsUnsupported | Error::Cancelled => {
                        // Neither is retryable.
                        req.try_callback(Err(err));
                        break;
                    }
                    _ => {
                        if self
                            .retry
                            .wait_and_retry(Arc::clone(&req), RetryReason::SocketNotAvailable)
                        {
                            // The orchestrator owns the request now; just
                            // refresh the socket.
                            break;
                        }
                        req.try_callback(Err(Error::Network));
                        break;
                    }
                }
            }
        }

        debug!(self.log, "waiting for client shutdown");
        let _ = kill_rx.recv();
        debug!(self.log, "client shutdown complete");
    }

    /// Move this client under a new parent pipeline without touching the
    /// socket. Closing the active consumer makes the io loop fetch its next
    /// consumer from the new pipeline's queue.
    pub(crate) fn reassign_to(&self, parent: Arc<Pipeline>) {
        let consumer = {
            let mut inner = self.inner.lock().unwrap();
            inner.parent = Some(parent);
            inner.consumer.take()
        };
        if let Some(consumer) = consumer {
            consumer.close();
        }
    }

    /// Shut the client down and wait for its run loop to exit. Idempotent
    /// in effect: a nilled parent is sticky.
    pub(crate) fn close(&self) -> Result<(), Error> {
        debug!(self.log, "pipeline client received close request");
        let consumer = {
            let mut inner = self.inner.lock().unwrap();
            inner.parent = None;
            inner.consumer.take()
        };
        if let Some(consumer) = consumer {
            consumer.close();
        }
        self.dial_wake.set();
        self.closed_sig.wait();
        Ok(())
    }

    // Probe the current socket with a no-op request. Exactly one breaker
    // mark fires per probe, on every path.
    fn send_canary(&self) {
        let (tx, rx) = mpsc::channel::<Option<Error>>();
        let req = KvRequest::canary(Box::new(move |result: Result<KvResponse, Error>| {
            let _ = tx.send(result.err());
        }));

        let client = { self.inner.lock().unwrap().client.clone() };
        let client = match client {
            Some(client) => client,
            None => {
                debug!(self.log, "no active socket for canary");
                self.breaker.mark_failure();
                return;
            }
        };

        debug!(self.log, "sending canary noop");
        if let Err(err) = client.send_request(Arc::clone(&req)) {
            debug!(self.log, "canary send failed: {}", err);
            self.breaker.mark_failure();
            return;
        }

        match rx.recv_timeout(self.breaker.canary_timeout()) {
            Ok(None) => {
                debug!(self.log, "canary noop successful");
                self.breaker.mark_successful();
            }
            Ok(Some(err)) => {
                debug!(self.log, "canary noop failed: {}", err);
                self.breaker.mark_failure();
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                // Cancel the probe; whichever of the cancel and a late
                // completion wins has delivered the outcome to the channel.
                req.cancel();
                match rx.recv() {
                    Ok(None) => self.breaker.mark_successful(),
                    _ => self.breaker.mark_failure(),
                }
            }
        }
    }
}
