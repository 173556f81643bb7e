// Copyright 2020 Joyent, Inc.

use thiserror::Error;

/// The error kinds surfaced by the multiplexer core.
///
/// Routing and dispatch errors are returned to the caller directly; errors
/// that terminate an accepted request are delivered through the request's
/// callback instead, exactly once.
#[derive(Debug, Error)]
pub enum Error {
    /// An operation was issued against a closed or uninitialized mux.
    #[error("the multiplexer is shut down or not yet configured")]
    Shutdown,
    /// The replica index is out of range for the current bucket, or replicas
    /// were requested against a bucket type that has none.
    #[error("invalid replica index")]
    InvalidReplica,
    /// A keyless request was issued against a routing mode that requires a
    /// key.
    #[error("operation requires a key under the current routing mode")]
    InvalidArgument,
    /// A direct-to-address dispatch named a server that is not part of the
    /// current routing state.
    #[error("no pipeline for server address {0}")]
    InvalidServer(String),
    /// A vbucket id fell outside the configured partition count.
    #[error("vbucket id out of range")]
    InvalidVbucket,
    /// The target pipeline's queue is full.
    #[error("pipeline queue is full")]
    Overload,
    /// The connection's circuit breaker is open and the retry orchestrator
    /// declined to reschedule.
    #[error("circuit breaker is open")]
    CircuitBreakerOpen,
    /// An unrecoverable socket failure, after the retry orchestrator
    /// declined to reschedule.
    #[error("network failure")]
    Network,
    /// The socket was already closed when a write was attempted.
    #[error("socket closed")]
    SocketClosed,
    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,
    /// The server rejected a collection-aware operation.
    #[error("server does not support collections")]
    CollectionsUnsupported,
    /// An internal invariant failed during teardown or dispatch.
    #[error("internal error: {0}")]
    Internal(String),
    /// An I/O failure reported by a client factory while dialing.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
