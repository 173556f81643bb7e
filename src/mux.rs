// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use slog::{debug, error, o, warn, Drain, Logger};

use crate::breaker::CircuitBreakerConfig;
use crate::config::{BucketType, RouteConfig};
use crate::connection::{GetClientFn, MemdGetClientFn};
use crate::error::Error;
use crate::pipeline::Pipeline;
use crate::queue::PushError;
use crate::request::KvRequest;
use crate::retry::RetryOrchestrator;
use crate::state::KvMuxState;

// Default bounds, applied when the options leave them unset.
const DEFAULT_QUEUE_SIZE: usize = 2048;
const DEFAULT_POOL_SIZE: usize = 1;

/// Replica index stamped on a request that was dispatched directly to an
/// address. Routing resolves it to an absolute server index far beyond any
/// real cluster, so a retried request lands in the dead pipeline instead of
/// silently re-routing to a different node.
pub const PINNED_SERVER_SENTINEL: i32 = -999_999_999;

/// Options for construction of a [`KvMux`].
pub struct KvMuxOptions {
    /// Capacity of each pipeline's operation queue. Defaults to 2048.
    pub queue_size: Option<usize>,
    /// Number of socket clients per pipeline. Defaults to 1. Cluster-level
    /// (GCCCP) configs are always clamped to one client per pipeline.
    pub pool_size: Option<usize>,
    /// Circuit breaker settings shared by every pipeline client.
    pub breaker: CircuitBreakerConfig,
    /// An optional `slog` logger instance. If none is provided the logging
    /// falls back to the [`slog-stdlog`](https://docs.rs/slog-stdlog) drain.
    pub log: Option<Logger>,
}

impl Default for KvMuxOptions {
    fn default() -> Self {
        KvMuxOptions {
            queue_size: None,
            pool_size: None,
            breaker: CircuitBreakerConfig::default(),
            log: None,
        }
    }
}

/// The routing core: an atomically-swappable table mapping keys to per-node
/// pipelines.
///
/// The mux holds the latest [`KvMuxState`] behind an atomic pointer. The
/// dispatch path loads the snapshot, resolves the target pipeline, and
/// enqueues; it never takes a lock. [`apply_routing_config`] builds a whole
/// new state from each topology snapshot and publishes it with a
/// compare-and-swap, transferring live pipelines across generations where
/// addresses match and re-routing everything else.
///
/// A mux must be shut down with [`close`](Self::close); dropping it with
/// live pipelines leaks their worker threads.
pub struct KvMux {
    state: ArcSwapOption<KvMuxState>,
    queue_size: usize,
    pool_size: usize,
    get_client_fn: MemdGetClientFn,
    breaker_cfg: CircuitBreakerConfig,
    retry: Arc<dyn RetryOrchestrator>,
    log: Logger,
}

impl KvMux {
    pub fn new(
        opts: KvMuxOptions,
        get_client_fn: MemdGetClientFn,
        retry: Arc<dyn RetryOrchestrator>,
    ) -> Self {
        let log = opts
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        KvMux {
            state: ArcSwapOption::new(None),
            queue_size: opts.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE),
            pool_size: opts.pool_size.unwrap_or(DEFAULT_POOL_SIZE),
            get_client_fn,
            breaker_cfg: opts.breaker,
            retry,
            log,
        }
    }

    fn snapshot(&self) -> Option<Arc<KvMuxState>> {
        self.state.load_full()
    }

    /// Publish a new topology. Stale and structurally invalid configs are
    /// ignored. On a successful swap the pipelines of unchanged addresses
    /// are taken over with their sockets intact, removed pipelines are
    /// closed, and every request pending in the old state is re-dispatched
    /// through the new one in opaque order.
    ///
    /// This method never blocks on I/O and is safe to call from any thread;
    /// when two updates race, the loser abandons its update.
    pub fn apply_routing_config(&self, cfg: &RouteConfig) {
        if !cfg.is_valid() {
            warn!(
                self.log,
                "ignoring invalid route config, rev={}", cfg.rev_id
            );
            return;
        }

        let old = self.state.load_full();
        if let Some(old_state) = old.as_ref() {
            if cfg.rev_id >= 0 && cfg.rev_id <= old_state.rev_id() {
                debug!(
                    self.log,
                    "ignoring stale route config, rev={} current={}",
                    cfg.rev_id,
                    old_state.rev_id()
                );
                return;
            }
        }

        let new_state = Arc::new(self.build_state(cfg));
        let prev = self
            .state
            .compare_and_swap(&old, Some(Arc::clone(&new_state)));
        if prev.as_ref().map(Arc::as_ptr) != old.as_ref().map(Arc::as_ptr) {
            error!(self.log, "a concurrent config update won, skipping update");
            return;
        }

        match old {
            None => {
                // First config; just start everything.
                for pipeline in new_state.pipelines() {
                    pipeline.start_clients();
                }
            }
            Some(old_state) => {
                self.takeover(&old_state, &new_state);

                // Everything still pending in the old generation is observed
                // exactly once here. Sorting by opaque restores an
                // approximate submission order before the requests re-enter
                // routing.
                let mut requests: Vec<Arc<KvRequest>> = Vec::new();
                Self::drain_state(&old_state, |req| requests.push(req));
                requests.sort_by_key(|req| req.opaque());
                debug!(
                    self.log,
                    "redispatching {} requests from previous state",
                    requests.len()
                );
                for req in requests {
                    self.requeue_direct(req, false);
                }
            }
        }
    }

    fn build_state(&self, cfg: &RouteConfig) -> KvMuxState {
        let pool_size = if cfg.is_gcccp() { 1 } else { self.pool_size };

        let pipelines: Vec<Arc<Pipeline>> = cfg
            .kv_server_list
            .iter()
            .map(|address| {
                let get_client_fn = Arc::clone(&self.get_client_fn);
                let dial_address = address.clone();
                let dial: GetClientFn = Arc::new(move || get_client_fn(&dial_address));
                Pipeline::new(
                    address.clone(),
                    pool_size,
                    self.queue_size,
                    dial,
                    self.breaker_cfg.clone(),
                    Arc::clone(&self.retry),
                    &self.log,
                )
            })
            .collect();

        let dead_pipe = Pipeline::new_dead(self.queue_size, Arc::clone(&self.retry), &self.log);

        KvMuxState::new(cfg, pipelines, dead_pipe)
    }

    fn takeover(&self, old_state: &KvMuxState, new_state: &KvMuxState) {
        let mut orphans: Vec<Arc<Pipeline>> = old_state.pipelines().to_vec();

        for pipeline in new_state.pipelines() {
            if let Some(pos) = orphans
                .iter()
                .position(|orphan| orphan.address() == pipeline.address())
            {
                let predecessor = orphans.swap_remove(pos);
                pipeline.takeover(&predecessor);
            }
            pipeline.start_clients();
        }

        // Pipelines whose address no longer appears shut down; their queued
        // requests stay behind for the drain pass.
        for orphan in orphans {
            if let Err(err) = orphan.close() {
                error!(self.log, "failed to close abandoned pipeline: {}", err);
            }
        }
        if let Err(err) = old_state.dead_pipe().close() {
            error!(self.log, "failed to close abandoned dead pipeline: {}", err);
        }
    }

    fn drain_state<F>(state: &KvMuxState, mut cb: F)
    where
        F: FnMut(Arc<KvRequest>),
    {
        for pipeline in state.pipelines() {
            pipeline.drain(&mut cb);
        }
        state.dead_pipe().drain(&mut cb);
    }

    /// Resolve the pipeline a request should be queued on under the current
    /// state.
    pub fn route_request(&self, req: &KvRequest) -> Result<Arc<Pipeline>, Error> {
        let state = self.snapshot().ok_or(Error::Shutdown)?;

        let replica_idx = req.replica_idx();
        let server_idx: i32 = if replica_idx < 0 {
            // Negative replica pins the request to an absolute server index.
            -replica_idx - 1
        } else {
            match state.bucket_type() {
                BucketType::Couchbase => {
                    let vb_map = state.vb_map().ok_or_else(|| {
                        Error::Internal(String::from("couchbase bucket with no vbucket map"))
                    })?;
                    if !req.key.is_empty() {
                        req.set_vbucket(vb_map.vbucket_by_key(&req.key));
                    }
                    vb_map.node_by_vbucket(req.vbucket(), replica_idx as u32)?
                }
                BucketType::Memcached => {
                    if replica_idx > 0 {
                        // Memcached buckets have no replicas.
                        return Err(Error::InvalidReplica);
                    }
                    if req.key.is_empty() {
                        return Err(Error::InvalidArgument);
                    }
                    let ketama = state.ketama_map().ok_or_else(|| {
                        Error::Internal(String::from("memcached bucket with no ketama ring"))
                    })?;
                    ketama.node_by_key(&req.key)?
                }
                BucketType::None => 0,
            }
        };

        Ok(state.get_pipeline(server_idx))
    }

    /// Route and enqueue a request. A pipeline closed by a concurrent
    /// topology swap is invisible here: routing simply runs again against
    /// the newer state.
    pub fn dispatch_direct(&self, req: Arc<KvRequest>) -> Result<(), Error> {
        loop {
            let pipeline = self.route_request(&req)?;
            match pipeline.send_request(Arc::clone(&req)) {
                Ok(()) => return Ok(()),
                Err(PushError::Closed) => continue,
                Err(PushError::Full) => return Err(Error::Overload),
            }
        }
    }

    /// Enqueue a request on the pipeline currently serving `address`,
    /// bypassing key routing. Only permitted for requests that have not
    /// selected a replica; the request is then pinned so a later retry
    /// cannot silently re-route it to a different node.
    pub fn dispatch_direct_to_address(&self, req: Arc<KvRequest>, address: &str) -> Result<(), Error> {
        if req.replica_idx() != 0 {
            return Err(Error::InvalidReplica);
        }
        req.set_replica_idx(PINNED_SERVER_SENTINEL);

        loop {
            let state = self.snapshot().ok_or(Error::Shutdown)?;
            let pipeline = state
                .pipelines()
                .iter()
                .find(|pipeline| pipeline.address() == address)
                .cloned()
                .ok_or_else(|| Error::InvalidServer(address.to_string()))?;
            match pipeline.send_request(Arc::clone(&req)) {
                Ok(()) => return Ok(()),
                Err(PushError::Closed) => continue,
                Err(PushError::Full) => return Err(Error::Overload),
            }
        }
    }

    /// Re-insert a request that is already owned by the mux, typically
    /// after a topology swap or an accepted retry. Unroutable requests are
    /// failed through their callback; a cancelled request on a retry path
    /// fails quietly.
    pub fn requeue_direct(&self, req: Arc<KvRequest>, is_retry: bool) {
        debug!(self.log, "request being requeued, opaque={}", req.opaque());

        loop {
            let pipeline = match self.route_request(&req) {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    self.fail_requeued(&req, err, is_retry);
                    return;
                }
            };
            match pipeline.requeue_request(Arc::clone(&req)) {
                Ok(()) => return,
                Err(PushError::Closed) => continue,
                Err(PushError::Full) => {
                    self.fail_requeued(&req, Error::Overload, is_retry);
                    return;
                }
            }
        }
    }

    fn fail_requeued(&self, req: &KvRequest, err: Error, is_retry: bool) {
        if !is_retry || !matches!(err, Error::Cancelled) {
            error!(self.log, "reschedule failed, failing request: {}", err);
        }
        req.try_callback(Err(err));
    }

    /// Atomically clear the state, close every pipeline, and fail all
    /// pending requests with [`Error::Shutdown`]. Returns
    /// [`Error::Shutdown`] if the mux was never configured or was already
    /// closed.
    pub fn close(&self) -> Result<(), Error> {
        let state = match self.state.swap(None) {
            Some(state) => state,
            None => return Err(Error::Shutdown),
        };

        let mut teardown_failed = false;
        for pipeline in state.pipelines() {
            if let Err(err) = pipeline.close() {
                error!(self.log, "failed to shut down pipeline: {}", err);
                teardown_failed = true;
            }
        }
        if let Err(err) = state.dead_pipe().close() {
            error!(self.log, "failed to shut down dead pipeline: {}", err);
            teardown_failed = true;
        }

        Self::drain_state(&state, |req| {
            req.try_callback(Err(Error::Shutdown));
        });

        if teardown_failed {
            Err(Error::Internal(String::from(
                "failed to shut down one or more pipelines",
            )))
        } else {
            Ok(())
        }
    }

    pub fn config_uuid(&self) -> String {
        self.snapshot()
            .map(|state| state.uuid().to_string())
            .unwrap_or_default()
    }

    pub fn config_rev(&self) -> i64 {
        self.snapshot().map(|state| state.rev_id()).unwrap_or(-1)
    }

    pub fn key_to_vbucket(&self, key: &[u8]) -> u16 {
        self.snapshot()
            .and_then(|state| state.vb_map().map(|vb_map| vb_map.vbucket_by_key(key)))
            .unwrap_or(0)
    }

    /// The server index a key routes to, or `-1` when it cannot be
    /// resolved.
    pub fn key_to_server(&self, key: &[u8], replica_idx: u32) -> i32 {
        let state = match self.snapshot() {
            Some(state) => state,
            None => return -1,
        };
        if let Some(vb_map) = state.vb_map() {
            return vb_map.node_by_key(key, replica_idx).unwrap_or(-1);
        }
        if let Some(ketama) = state.ketama_map() {
            return ketama.node_by_key(key).unwrap_or(-1);
        }
        -1
    }

    pub fn vbucket_to_server(&self, vbucket: u16, replica_idx: u32) -> i32 {
        self.snapshot()
            .and_then(|state| {
                state
                    .vb_map()
                    .map(|vb_map| vb_map.node_by_vbucket(vbucket, replica_idx).unwrap_or(-1))
            })
            .unwrap_or(-1)
    }

    pub fn num_replicas(&self) -> usize {
        self.snapshot()
            .and_then(|state| state.vb_map().map(|vb_map| vb_map.num_replicas()))
            .unwrap_or(0)
    }

    pub fn num_vbuckets(&self) -> usize {
        self.snapshot()
            .and_then(|state| state.vb_map().map(|vb_map| vb_map.num_vbuckets()))
            .unwrap_or(0)
    }

    pub fn num_pipelines(&self) -> usize {
        self.snapshot()
            .map(|state| state.num_pipelines())
            .unwrap_or(0)
    }

    /// The vbuckets whose active copy lives on the given server, or `None`
    /// when the mux has no vbucket-mapped state.
    pub fn vbuckets_on_server(&self, server_idx: usize) -> Option<Vec<u16>> {
        self.snapshot()?
            .vb_map()
            .map(|vb_map| vb_map.vbuckets_on_server(server_idx))
    }

    /// Whether the current state came from a cluster-level (bucketless)
    /// config. False when the mux holds no state at all.
    pub fn supports_gcccp(&self) -> bool {
        self.snapshot()
            .map(|state| state.bucket_type() == BucketType::None)
            .unwrap_or(false)
    }

    pub fn bucket_type(&self) -> Option<BucketType> {
        self.snapshot().map(|state| state.bucket_type())
    }

    /// An iterator over the current pipelines, for broadcast-style callers.
    /// `offset` rotates the starting point so repeated broadcasts spread
    /// their first target across the cluster.
    pub fn pipeline_iterator(&self) -> Result<PipelineIterator, Error> {
        let state = self.snapshot().ok_or(Error::Shutdown)?;
        Ok(PipelineIterator {
            pipelines: state.pipelines().to_vec(),
            idx: 0,
            iterations: 0,
        })
    }
}

/// A rotating iterator over one state generation's pipelines. Yields each
/// pipeline exactly once, starting after the configured offset and wrapping
/// modulo the pipeline count.
pub struct PipelineIterator {
    pipelines: Vec<Arc<Pipeline>>,
    idx: usize,
    iterations: usize,
}

impl PipelineIterator {
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn offset(&mut self, offset: usize) {
        self.idx = offset;
    }
}

impl Iterator for PipelineIterator {
    type Item = Arc<Pipeline>;

    fn next(&mut self) -> Option<Arc<Pipeline>> {
        if self.pipelines.is_empty() || self.iterations == self.pipelines.len() {
            return None;
        }
        self.iterations += 1;
        self.idx = (self.idx + 1) % self.pipelines.len();
        Some(Arc::clone(&self.pipelines[self.idx]))
    }
}
