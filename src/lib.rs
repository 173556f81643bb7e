// Copyright 2020 Joyent, Inc.

//! Connection multiplexing and request routing for a distributed
//! key-value cluster
//!
//! Snooker is the client-side core for talking to a Couchbase-family
//! cluster: it keeps a live, authenticated connection pool to every data
//! node, maps each key-addressed request to the node that owns it under the
//! cluster's current topology, and keeps the request stream flowing through
//! node failures, transient errors, and topology changes. It deliberately
//! does *not* parse connection strings, speak the memcached binary protocol,
//! or poll for cluster configuration; those live in the embedding layer and
//! meet the core at three seams described below.
//!
//! ## Route configs
//!
//! A [`config::RouteConfig`] is an immutable topology snapshot: the bucket
//! type, the ordered list of data-node addresses, and the vbucket table or
//! ketama ring that distributes keys across them. Configuration sources
//! (CCCP polling, HTTP streaming) are external; whenever one produces a new
//! snapshot the embedding layer hands it to
//! [`mux::KvMux::apply_routing_config`]. The mux builds a complete new
//! routing state from it, publishes the state with a single atomic swap,
//! carries live connections over to unchanged addresses, and re-routes every
//! request the old state still held.
//!
//! ## Socket clients
//!
//! A [`connection::MemdClient`] is one connected, authenticated socket. The
//! core never dials sockets itself: it is constructed with a
//! [`connection::MemdGetClientFn`] that performs the dial, authentication,
//! and feature negotiation for a given address. Each pipeline runs a small
//! pool of [`client::PipelineClient`]s; every client owns one socket, pumps
//! requests from its pipeline's shared queue onto it, and dials a
//! replacement whenever the socket dies. A per-connection circuit breaker
//! gates sends and probes an unhealthy connection with no-op canaries until
//! it recovers.
//!
//! ## Requests
//!
//! A [`request::KvRequest`] carries an opcode, key, payload, a retry
//! strategy, and a callback. The callback fires exactly once with either a
//! response or a terminal error, no matter how dispatch, cancellation,
//! topology swaps, and shutdown interleave. When a dispatch fails in a
//! recoverable way the core offers the request to an external
//! [`retry::RetryOrchestrator`] before surfacing an error.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use snooker::config::{BucketType, RouteConfig, VbucketMap};
//! use snooker::mux::{KvMux, KvMuxOptions};
//! use snooker::request::{KvRequest, Opcode};
//! use snooker::retry::BestEffortRetryStrategy;
//!
//! let mux = KvMux::new(
//!     KvMuxOptions::default(),
//!     Arc::new(|address| dial_and_authenticate(address)),
//!     Arc::new(my_retry_orchestrator),
//! );
//!
//! // Delivered by the configuration poller.
//! mux.apply_routing_config(&route_config);
//!
//! let req = KvRequest::new(
//!     Opcode::Get,
//!     b"user:1234".to_vec(),
//!     Vec::new(),
//!     Arc::new(BestEffortRetryStrategy),
//!     Box::new(|result| println!("{:?}", result)),
//! );
//! mux.dispatch_direct(req)?;
//!
//! // ... later ...
//! mux.close()?;
//! ```

#![allow(missing_docs)]

pub mod breaker;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod mux;
pub mod pipeline;
pub mod queue;
pub mod request;
pub mod retry;
pub mod state;
