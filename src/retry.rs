// Copyright 2020 Joyent, Inc.

use std::sync::Arc;
use std::time::Duration;

use crate::request::KvRequest;

/// Why a request is being offered back for rescheduling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryReason {
    /// The connection's circuit breaker rejected the dispatch.
    CircuitBreakerOpen,
    /// The socket failed while the request was being written.
    SocketNotAvailable,
}

/// Per-request retry policy.
///
/// A strategy only decides *whether* and *after how long* a request may be
/// retried; the actual rescheduling is the retry orchestrator's job. The
/// attempt count recorded on the request is available for backoff
/// calculations.
pub trait RetryStrategy: Send + Sync {
    /// Returns the delay before the next attempt, or `None` if the request
    /// must not be retried for this reason.
    fn retry_after(&self, req: &KvRequest, reason: RetryReason) -> Option<Duration>;
}

/// A strategy that never retries. Used for canary probes and any operation
/// whose failure must surface immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn retry_after(&self, _req: &KvRequest, _reason: RetryReason) -> Option<Duration> {
        None
    }
}

/// A strategy that always retries, backing off on a fixed schedule keyed by
/// the request's attempt count.
#[derive(Clone, Copy, Debug, Default)]
pub struct BestEffortRetryStrategy;

impl BestEffortRetryStrategy {
    fn controlled_backoff(attempts: u32) -> Duration {
        let millis = match attempts {
            0 => 1,
            1 => 10,
            2 => 50,
            3 => 100,
            4 => 500,
            _ => 1000,
        };
        Duration::from_millis(millis)
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn retry_after(&self, req: &KvRequest, _reason: RetryReason) -> Option<Duration> {
        Some(Self::controlled_backoff(req.retry_attempts()))
    }
}

/// The seam to the embedding layer's retry machinery.
///
/// When a pipeline client cannot dispatch a request it offers the request to
/// the orchestrator. A `true` return means the orchestrator has accepted
/// responsibility for the request's future (typically consulting the
/// request's [`RetryStrategy`] and requeueing it after a delay); the client
/// must then not surface an error to the caller. A `false` return leaves the
/// request with the client, which fails it.
pub trait RetryOrchestrator: Send + Sync {
    fn wait_and_retry(&self, req: Arc<KvRequest>, reason: RetryReason) -> bool;
}
