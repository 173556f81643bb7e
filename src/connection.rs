// Copyright 2020 Joyent, Inc.

use std::sync::Arc;

use crate::error::Error;
use crate::request::KvRequest;

/// A connected, authenticated socket client for one KV node.
///
/// The `MemdClient` trait is the seam between the multiplexer core and the
/// wire layer. An implementation owns exactly one socket, multiplexes many
/// outstanding requests over it with opaque correlation, and need not be
/// limited to a raw TCP stream: anything that behaves like a connected
/// memcached-binary endpoint can participate, which is also what makes the
/// core testable without a server.
///
/// The contract with the core:
///
/// * `send_request` either queues the request onto the socket and returns
///   `Ok`, or returns the write failure. Once accepted, the outcome must
///   eventually be delivered through [`KvRequest::complete`] unless the
///   request is cancelled first.
/// * `close` tears the socket down; it is idempotent and a double close is
///   a no-op.
/// * `wait_closed` blocks the calling thread until the socket has died,
///   whether through `close` or a failure noticed by the implementation.
///   Each pipeline client parks a watcher thread here for the lifetime of
///   the socket.
pub trait MemdClient: Send + Sync {
    fn address(&self) -> &str;

    fn send_request(&self, req: Arc<KvRequest>) -> Result<(), Error>;

    fn close(&self) -> Result<(), Error>;

    fn wait_closed(&self);
}

/// Dials, authenticates, and feature-negotiates a new socket client for the
/// given `host:port` address. Supplied by the embedding layer; must be
/// thread-safe and should enforce its own per-server dial deadline.
pub type MemdGetClientFn =
    Arc<dyn Fn(&str) -> Result<Arc<dyn MemdClient>, Error> + Send + Sync + 'static>;

// Address-bound dial function held by each pipeline.
pub(crate) type GetClientFn =
    Arc<dyn Fn() -> Result<Arc<dyn MemdClient>, Error> + Send + Sync + 'static>;
