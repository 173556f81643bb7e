// Copyright 2020 Joyent, Inc.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use snooker::config::{BucketType, KetamaMap, RouteConfig, VbucketMap};
use snooker::connection::{MemdClient, MemdGetClientFn};
use snooker::error::Error;
use snooker::request::{Callback, KvRequest, KvResponse, Opcode};
use snooker::retry::{FailFastRetryStrategy, RetryOrchestrator, RetryReason};

/// An in-memory socket client. Records every accepted request; completion
/// is driven by the test (or automatically, when configured) by calling
/// `KvRequest::complete` the way a real wire client would.
pub struct MockMemdClient {
    address: String,
    auto_complete: bool,
    complete_noops: bool,
    sent: Mutex<Vec<Arc<KvRequest>>>,
    scripted_errors: Mutex<VecDeque<Error>>,
    closed: (Mutex<bool>, Condvar),
}

impl MockMemdClient {
    pub fn new(address: &str, auto_complete: bool, complete_noops: bool) -> Arc<Self> {
        Arc::new(MockMemdClient {
            address: address.to_string(),
            auto_complete,
            complete_noops,
            sent: Mutex::new(Vec::new()),
            scripted_errors: Mutex::new(VecDeque::new()),
            closed: (Mutex::new(false), Condvar::new()),
        })
    }

    pub fn sent(&self) -> Vec<Arc<KvRequest>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Queue an error for the next `send_request` call.
    pub fn fail_next_send(&self, err: Error) {
        self.scripted_errors.lock().unwrap().push_back(err);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.0.lock().unwrap()
    }
}

impl MemdClient for MockMemdClient {
    fn address(&self) -> &str {
        &self.address
    }

    fn send_request(&self, req: Arc<KvRequest>) -> Result<(), Error> {
        if let Some(err) = self.scripted_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(Arc::clone(&req));
        if self.auto_complete || (self.complete_noops && req.opcode == Opcode::Noop) {
            req.complete(Ok(KvResponse::default()));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        let (lock, cvar) = &self.closed;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
        Ok(())
    }

    fn wait_closed(&self) {
        let (lock, cvar) = &self.closed;
        let mut closed = lock.lock().unwrap();
        while !*closed {
            closed = cvar.wait(closed).unwrap();
        }
    }
}

/// A fake cluster handing out [`MockMemdClient`]s. Addresses can be set to
/// refuse dials so requests accumulate in pipeline queues.
pub struct MockCluster {
    auto_complete: bool,
    complete_noops: bool,
    refused: Mutex<HashSet<String>>,
    clients: Mutex<HashMap<String, Vec<Arc<MockMemdClient>>>>,
}

impl MockCluster {
    pub fn new(auto_complete: bool, complete_noops: bool) -> Arc<Self> {
        Arc::new(MockCluster {
            auto_complete,
            complete_noops,
            refused: Mutex::new(HashSet::new()),
            clients: Mutex::new(HashMap::new()),
        })
    }

    pub fn refuse(&self, address: &str) {
        self.refused.lock().unwrap().insert(address.to_string());
    }

    pub fn allow(&self, address: &str) {
        self.refused.lock().unwrap().remove(address);
    }

    pub fn getter(self: &Arc<Self>) -> MemdGetClientFn {
        let cluster = Arc::clone(self);
        Arc::new(move |address: &str| -> Result<Arc<dyn MemdClient>, Error> {
            if cluster.refused.lock().unwrap().contains(address) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            let client =
                MockMemdClient::new(address, cluster.auto_complete, cluster.complete_noops);
            cluster
                .clients
                .lock()
                .unwrap()
                .entry(address.to_string())
                .or_default()
                .push(Arc::clone(&client));
            let client: Arc<dyn MemdClient> = client;
            Ok(client)
        })
    }

    /// How many sockets were successfully dialed to this address.
    pub fn dial_count(&self, address: &str) -> usize {
        self.clients
            .lock()
            .unwrap()
            .get(address)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn clients_for(&self, address: &str) -> Vec<Arc<MockMemdClient>> {
        self.clients
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// Every request written to any socket of this address, in write order.
    pub fn sent_to(&self, address: &str) -> Vec<Arc<KvRequest>> {
        self.clients_for(address)
            .iter()
            .flat_map(|client| client.sent())
            .collect()
    }
}

/// A retry orchestrator that records every offer and answers with a fixed
/// verdict.
pub struct MockRetry {
    accept: AtomicBool,
    calls: Mutex<Vec<(u32, RetryReason)>>,
}

impl MockRetry {
    pub fn new(accept: bool) -> Arc<Self> {
        Arc::new(MockRetry {
            accept: AtomicBool::new(accept),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::Release);
    }

    pub fn calls(&self) -> Vec<(u32, RetryReason)> {
        self.calls.lock().unwrap().clone()
    }
}

impl RetryOrchestrator for MockRetry {
    fn wait_and_retry(&self, req: Arc<KvRequest>, reason: RetryReason) -> bool {
        self.calls.lock().unwrap().push((req.opaque(), reason));
        if self.accept.load(Ordering::Acquire) {
            req.record_retry_attempt();
            true
        } else {
            false
        }
    }
}

/// Observes a request's terminal callback: the delivered error strings in
/// order, waitable from the test thread.
pub struct CallbackProbe {
    inner: Arc<(Mutex<Vec<Option<String>>>, Condvar)>,
}

impl CallbackProbe {
    pub fn new() -> Self {
        CallbackProbe {
            inner: Arc::new((Mutex::new(Vec::new()), Condvar::new())),
        }
    }

    pub fn callback(&self) -> Callback {
        let inner = Arc::clone(&self.inner);
        Box::new(move |result: Result<KvResponse, Error>| {
            let (lock, cvar) = &*inner;
            lock.lock()
                .unwrap()
                .push(result.err().map(|err| err.to_string()));
            cvar.notify_all();
        })
    }

    pub fn count(&self) -> usize {
        self.inner.0.lock().unwrap().len()
    }

    pub fn results(&self) -> Vec<Option<String>> {
        self.inner.0.lock().unwrap().clone()
    }

    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.inner;
        let mut results = lock.lock().unwrap();
        while results.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = cvar.wait_timeout(results, deadline - now).unwrap();
            results = guard;
        }
        true
    }
}

pub fn test_request(opcode: Opcode, key: &[u8], probe: &CallbackProbe) -> Arc<KvRequest> {
    KvRequest::new(
        opcode,
        key.to_vec(),
        Vec::new(),
        Arc::new(FailFastRetryStrategy),
        probe.callback(),
    )
}

fn base_config(rev_id: i64, bkt_type: BucketType, servers: &[&str]) -> RouteConfig {
    RouteConfig {
        rev_id,
        uuid: format!("bucket-{}", rev_id),
        bkt_type,
        kv_server_list: servers.iter().map(|server| server.to_string()).collect(),
        vb_map: None,
        ketama_map: None,
        mgmt_ep_list: Vec::new(),
        capi_ep_list: Vec::new(),
        n1ql_ep_list: Vec::new(),
        fts_ep_list: Vec::new(),
    }
}

/// A couchbase config whose every vbucket has its active copy on
/// `target_server` and no replicas.
pub fn uniform_couchbase_config(
    rev_id: i64,
    servers: &[&str],
    num_vbuckets: usize,
    target_server: i32,
) -> RouteConfig {
    let entries = (0..num_vbuckets).map(|_| vec![target_server]).collect();
    let mut cfg = base_config(rev_id, BucketType::Couchbase, servers);
    cfg.vb_map = Some(VbucketMap::new(entries, 0));
    cfg
}

/// A couchbase config distributing copies round-robin:
/// `entries[vb][r] = (vb + r) % servers.len()`.
pub fn round_robin_couchbase_config(
    rev_id: i64,
    servers: &[&str],
    num_vbuckets: usize,
    num_replicas: usize,
) -> RouteConfig {
    let server_count = servers.len() as i32;
    let entries = (0..num_vbuckets)
        .map(|vbucket| {
            (0..=num_replicas)
                .map(|replica| (vbucket as i32 + replica as i32) % server_count)
                .collect()
        })
        .collect();
    let mut cfg = base_config(rev_id, BucketType::Couchbase, servers);
    cfg.vb_map = Some(VbucketMap::new(entries, num_replicas));
    cfg
}

pub fn gcccp_config(rev_id: i64, servers: &[&str]) -> RouteConfig {
    base_config(rev_id, BucketType::None, servers)
}

pub fn memcached_config(rev_id: i64, servers: &[&str]) -> RouteConfig {
    let server_list: Vec<String> = servers.iter().map(|server| server.to_string()).collect();
    let mut cfg = base_config(rev_id, BucketType::Memcached, servers);
    cfg.ketama_map = Some(KetamaMap::from_servers(&server_list));
    cfg
}

/// Poll `cond` until it holds or the timeout elapses.
pub fn wait_until<F>(cond: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
