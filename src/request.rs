// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::fmt::Result as FmtResult;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::retry::{FailFastRetryStrategy, RetryStrategy};

// Source of request opaques. Monotonic for the life of the process so that
// draining code can recover an approximate submission order by sorting.
static OPAQUE_COUNTER: AtomicU32 = AtomicU32::new(1);

/// The operation carried by a request. The wire codec owns the actual
/// framing; the core only needs the opcode for routing-neutral bookkeeping
/// such as canary probes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Delete = 0x04,
    Noop = 0x0a,
    SelectBucket = 0x89,
    GetClusterConfig = 0xb5,
}

/// The response record a socket client hands back for a completed request.
#[derive(Clone, Debug, Default)]
pub struct KvResponse {
    pub status: u16,
    pub cas: u64,
    pub value: Vec<u8>,
}

/// The terminal user callback. Fires exactly once per accepted request.
pub type Callback = Box<dyn FnOnce(Result<KvResponse, Error>) + Send + 'static>;

/// A hook installed by the pipeline client before each send attempt. It runs
/// before the user callback when the socket client completes the request,
/// feeding the circuit breaker's accounting.
pub type CompletionHook = Box<dyn FnOnce(Option<&Error>) + Send + 'static>;

/// A single key-addressed operation moving through the multiplexer.
///
/// A request is created behind an `Arc` and handed across queues and socket
/// clients by cloning the handle; whichever queue or in-flight table
/// currently holds it owns it. Terminal delivery is guarded by a
/// compare-and-swap so the callback can never fire twice, no matter how the
/// completion, cancellation, and teardown paths race.
pub struct KvRequest {
    pub opcode: Opcode,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub retry_strategy: Arc<dyn RetryStrategy>,
    opaque: u32,
    vbucket: AtomicU16,
    replica_idx: AtomicI32,
    cancelled: AtomicBool,
    completed: AtomicBool,
    retry_attempts: AtomicU32,
    callback: Mutex<Option<Callback>>,
    completion_hook: Mutex<Option<CompletionHook>>,
}

impl KvRequest {
    pub fn new(
        opcode: Opcode,
        key: Vec<u8>,
        value: Vec<u8>,
        retry_strategy: Arc<dyn RetryStrategy>,
        callback: Callback,
    ) -> Arc<Self> {
        Arc::new(KvRequest {
            opcode,
            key,
            value,
            retry_strategy,
            opaque: OPAQUE_COUNTER.fetch_add(1, Ordering::Relaxed),
            vbucket: AtomicU16::new(0),
            replica_idx: AtomicI32::new(0),
            cancelled: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            retry_attempts: AtomicU32::new(0),
            callback: Mutex::new(Some(callback)),
            completion_hook: Mutex::new(None),
        })
    }

    // A no-op probe used by circuit breakers. Fails fast so a dead socket
    // cannot park the probe in retry machinery.
    pub(crate) fn canary(callback: Callback) -> Arc<Self> {
        KvRequest::new(
            Opcode::Noop,
            Vec::new(),
            Vec::new(),
            Arc::new(FailFastRetryStrategy),
            callback,
        )
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket.load(Ordering::Acquire)
    }

    pub fn set_vbucket(&self, vbucket: u16) {
        self.vbucket.store(vbucket, Ordering::Release);
    }

    pub fn replica_idx(&self) -> i32 {
        self.replica_idx.load(Ordering::Acquire)
    }

    pub fn set_replica_idx(&self, replica_idx: i32) {
        self.replica_idx.store(replica_idx, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.load(Ordering::Acquire)
    }

    /// Bump the attempt counter. Retry orchestrators call this once per
    /// accepted reschedule so strategies can back off progressively.
    pub fn record_retry_attempt(&self) -> u32 {
        self.retry_attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Install the hook run ahead of the user callback on the next
    /// completion. Each dispatch attempt replaces the previous hook.
    pub fn set_completion_hook(&self, hook: CompletionHook) {
        *self.completion_hook.lock().unwrap() = Some(hook);
    }

    /// Deliver a completion from a socket client: the completion hook fires
    /// first, then the user callback. Loses quietly against an earlier
    /// terminal delivery or a won cancellation.
    pub fn complete(&self, result: Result<KvResponse, Error>) {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let hook = self.completion_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(result.as_ref().err());
        }
        let callback = self.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    /// Deliver a terminal result without running the completion hook. Used
    /// by dispatch paths that failed before the request reached a socket.
    /// Returns `false` if the request already completed.
    pub fn try_callback(&self, result: Result<KvResponse, Error>) -> bool {
        if self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let callback = self.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(result);
        }
        true
    }

    /// Race for the request's terminal state. If the cancel wins, the user
    /// callback fires here with [`Error::Cancelled`] and no later completion
    /// can be delivered; dispatch sites skip the request from then on.
    pub fn cancel(&self) -> bool {
        self.cancelled.store(true, Ordering::Release);
        self.try_callback(Err(Error::Cancelled))
    }
}

impl fmt::Debug for KvRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> FmtResult {
        f.debug_struct("KvRequest")
            .field("opcode", &self.opcode)
            .field("opaque", &self.opaque)
            .field("key_len", &self.key.len())
            .field("vbucket", &self.vbucket())
            .field("replica_idx", &self.replica_idx())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
