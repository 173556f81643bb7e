// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Mutex, Weak};
use std::thread;

use slog::{debug, error, o, Logger};

use crate::breaker::CircuitBreakerConfig;
use crate::client::PipelineClient;
use crate::connection::{GetClientFn, MemdClient};
use crate::error::Error;
use crate::queue::{OpQueue, PushError};
use crate::request::KvRequest;
use crate::retry::RetryOrchestrator;

/// The per-node half of the multiplexer: one queue of pending requests and
/// a fixed pool of [`PipelineClient`]s consuming it.
///
/// A pipeline is identified by its server address. At most one live
/// pipeline per address exists within a routing state; across state
/// generations, [`takeover`](Self::takeover) moves the clients (and their
/// connected sockets) from the predecessor of the same address instead of
/// redialing.
pub struct Pipeline {
    me: Weak<Pipeline>,
    address: String,
    queue: OpQueue,
    pool_size: usize,
    get_client_fn: GetClientFn,
    clients: Mutex<Vec<Arc<PipelineClient>>>,
    breaker_cfg: CircuitBreakerConfig,
    retry: Arc<dyn RetryOrchestrator>,
    log: Logger,
}

impl Pipeline {
    pub(crate) fn new(
        address: String,
        pool_size: usize,
        queue_size: usize,
        get_client_fn: GetClientFn,
        breaker_cfg: CircuitBreakerConfig,
        retry: Arc<dyn RetryOrchestrator>,
        log: &Logger,
    ) -> Arc<Self> {
        let log = log.new(o!("pipeline" => address.clone()));
        Arc::new_cyclic(|me| Pipeline {
            me: me.clone(),
            address,
            queue: OpQueue::new(queue_size),
            pool_size,
            get_client_fn,
            clients: Mutex::new(Vec::with_capacity(pool_size)),
            breaker_cfg,
            retry,
            log,
        })
    }

    /// The sink pipeline of a routing state. It is bound to no address and
    /// starts no clients; its queue absorbs requests that have no routable
    /// destination so they can be re-routed on the next topology update or
    /// failed consistently at shutdown.
    pub(crate) fn new_dead(
        queue_size: usize,
        retry: Arc<dyn RetryOrchestrator>,
        log: &Logger,
    ) -> Arc<Self> {
        let log = log.new(o!("pipeline" => "(dead)"));
        Arc::new_cyclic(|me| Pipeline {
            me: me.clone(),
            address: String::new(),
            queue: OpQueue::new(queue_size),
            pool_size: 0,
            get_client_fn: Arc::new(|| Err(Error::Shutdown)),
            clients: Mutex::new(Vec::new()),
            breaker_cfg: CircuitBreakerConfig {
                enabled: false,
                ..CircuitBreakerConfig::default()
            },
            retry,
            log,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_dead(&self) -> bool {
        self.address.is_empty()
    }

    pub(crate) fn queue(&self) -> &OpQueue {
        &self.queue
    }

    pub(crate) fn breaker_cfg(&self) -> &CircuitBreakerConfig {
        &self.breaker_cfg
    }

    pub(crate) fn retry(&self) -> &Arc<dyn RetryOrchestrator> {
        &self.retry
    }

    pub(crate) fn log(&self) -> &Logger {
        &self.log
    }

    pub(crate) fn dial(&self) -> Result<Arc<dyn MemdClient>, Error> {
        (self.get_client_fn)()
    }

    /// Enqueue a request for this node.
    pub fn send_request(&self, req: Arc<KvRequest>) -> Result<(), PushError> {
        self.queue.push(req)
    }

    /// Re-insert a request after a topology swap or an accepted retry. Same
    /// error semantics as [`send_request`](Self::send_request).
    pub fn requeue_request(&self, req: Arc<KvRequest>) -> Result<(), PushError> {
        debug!(self.log, "requeueing request, opaque={}", req.opaque());
        self.queue.push(req)
    }

    /// Top the client pool up to its configured size, spawning a run loop
    /// per new client. Idempotent; clients adopted through
    /// [`takeover`](Self::takeover) count toward the pool.
    pub(crate) fn start_clients(&self) {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        let mut clients = self.clients.lock().unwrap();
        while clients.len() < self.pool_size {
            let client = PipelineClient::new(&me);
            clients.push(Arc::clone(&client));
            thread::spawn(move || client.run());
        }
    }

    /// Adopt every client of a predecessor pipeline with the same address.
    /// The clients keep their sockets; only their queue binding moves. The
    /// old pipeline retains no clients and may be closed.
    pub(crate) fn takeover(&self, old: &Pipeline) {
        let me = match self.me.upgrade() {
            Some(me) => me,
            None => return,
        };
        let stolen: Vec<Arc<PipelineClient>> = {
            let mut old_clients = old.clients.lock().unwrap();
            old_clients.drain(..).collect()
        };
        debug!(
            self.log,
            "taking over {} clients from predecessor pipeline",
            stolen.len()
        );
        for client in &stolen {
            client.reassign_to(Arc::clone(&me));
        }
        self.clients.lock().unwrap().extend(stolen);
    }

    /// Terminally empty the queue through `cb`.
    pub(crate) fn drain<F>(&self, cb: F)
    where
        F: FnMut(Arc<KvRequest>),
    {
        self.queue.drain(cb)
    }

    /// Shut down every client and close the queue. Queued requests are
    /// retained for the owner to drain. Client teardown failures are
    /// aggregated.
    pub(crate) fn close(&self) -> Result<(), Error> {
        debug!(self.log, "closing pipeline");
        let clients: Vec<Arc<PipelineClient>> = {
            let mut clients = self.clients.lock().unwrap();
            clients.drain(..).collect()
        };
        let mut failures: Vec<String> = Vec::new();
        for client in clients {
            if let Err(err) = client.close() {
                error!(self.log, "failed to shut down pipeline client: {}", err);
                failures.push(err.to_string());
            }
        }
        self.queue.close();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Internal(failures.join("; ")))
        }
    }
}
