// Copyright 2020 Joyent, Inc.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use snooker::breaker::CircuitBreakerConfig;
use snooker::error::Error;
use snooker::mux::{KvMux, KvMuxOptions};
use snooker::request::Opcode;
use snooker::retry::{RetryOrchestrator, RetryReason};

use common::*;

const A: &str = "10.0.0.1:11210";

const WAIT: Duration = Duration::from_secs(5);

fn new_mux(cluster: &Arc<MockCluster>, retry: &Arc<MockRetry>) -> KvMux {
    let opts = KvMuxOptions {
        breaker: CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::default()
        },
        ..KvMuxOptions::default()
    };
    KvMux::new(opts, cluster.getter(), Arc::clone(retry) as Arc<dyn RetryOrchestrator>)
}

#[test]
fn requests_reach_the_socket_in_enqueue_order() {
    let cluster = MockCluster::new(false, false);
    let retry = MockRetry::new(false);
    let mux = new_mux(&cluster, &retry);
    mux.apply_routing_config(&uniform_couchbase_config(1, &[A], 64, 0));

    let probe = CallbackProbe::new();
    let mut opaques = Vec::new();
    for idx in 0..5 {
        let key = format!("key-{}", idx);
        let req = test_request(Opcode::Set, key.as_bytes(), &probe);
        opaques.push(req.opaque());
        mux.dispatch_direct(req).unwrap();
    }

    assert!(wait_until(|| cluster.sent_to(A).len() == 5, WAIT));
    let arrived: Vec<u32> = cluster.sent_to(A).iter().map(|req| req.opaque()).collect();
    assert_eq!(arrived, opaques);

    mux.close().unwrap();
}

#[test]
fn transient_send_failure_consults_retry_orchestrator() {
    let cluster = MockCluster::new(false, false);
    let retry = MockRetry::new(true);
    let mux = new_mux(&cluster, &retry);
    mux.apply_routing_config(&uniform_couchbase_config(1, &[A], 64, 0));
    assert!(wait_until(|| cluster.dial_count(A) == 1, WAIT));

    cluster.clients_for(A)[0].fail_next_send(Error::Network);

    let probe = CallbackProbe::new();
    let req = test_request(Opcode::Set, b"foo", &probe);
    let opaque = req.opaque();
    mux.dispatch_direct(req).unwrap();

    // The orchestrator accepted the request; no error surfaces and the
    // client dials a replacement socket.
    assert!(wait_until(|| retry.calls().len() == 1, WAIT));
    assert_eq!(retry.calls()[0], (opaque, RetryReason::SocketNotAvailable));
    assert!(wait_until(|| cluster.dial_count(A) == 2, WAIT));
    assert_eq!(probe.count(), 0);

    mux.close().unwrap();
    assert_eq!(probe.count(), 0);
}

#[test]
fn declined_retry_surfaces_network_error() {
    let cluster = MockCluster::new(false, false);
    let retry = MockRetry::new(false);
    let mux = new_mux(&cluster, &retry);
    mux.apply_routing_config(&uniform_couchbase_config(1, &[A], 64, 0));
    assert!(wait_until(|| cluster.dial_count(A) == 1, WAIT));

    cluster.clients_for(A)[0].fail_next_send(Error::Internal(String::from("write failed")));

    let probe = CallbackProbe::new();
    mux.dispatch_direct(test_request(Opcode::Set, b"foo", &probe))
        .unwrap();

    assert!(probe.wait_for(1, WAIT));
    assert_eq!(
        probe.results(),
        vec![Some(String::from("network failure"))]
    );

    mux.close().unwrap();
}

#[test]
fn unretryable_send_failure_terminates_the_request() {
    let cluster = MockCluster::new(false, false);
    let retry = MockRetry::new(true);
    let mux = new_mux(&cluster, &retry);
    mux.apply_routing_config(&uniform_couchbase_config(1, &[A], 64, 0));
    assert!(wait_until(|| cluster.dial_count(A) == 1, WAIT));

    cluster.clients_for(A)[0].fail_next_send(Error::CollectionsUnsupported);

    let probe = CallbackProbe::new();
    mux.dispatch_direct(test_request(Opcode::Set, b"foo", &probe))
        .unwrap();

    // Even with a willing orchestrator the failure is terminal.
    assert!(probe.wait_for(1, WAIT));
    assert!(probe.results()[0]
        .as_ref()
        .unwrap()
        .contains("collections"));
    assert!(retry.calls().is_empty());

    mux.close().unwrap();
}

#[test]
fn open_breaker_gates_requests_until_canary_recovers() {
    let cluster = MockCluster::new(false, true);
    let retry = MockRetry::new(false);
    let opts = KvMuxOptions {
        breaker: CircuitBreakerConfig {
            enabled: true,
            volume_threshold: 1,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_millis(100),
            canary_timeout: Duration::from_secs(2),
            ..CircuitBreakerConfig::default()
        },
        ..KvMuxOptions::default()
    };
    let mux = KvMux::new(opts, cluster.getter(), Arc::clone(&retry) as Arc<dyn RetryOrchestrator>);
    mux.apply_routing_config(&uniform_couchbase_config(1, &[A], 64, 0));
    assert!(wait_until(|| cluster.dial_count(A) == 1, WAIT));

    // A failed completion trips the breaker.
    let probe1 = CallbackProbe::new();
    mux.dispatch_direct(test_request(Opcode::Set, b"foo", &probe1))
        .unwrap();
    assert!(wait_until(|| cluster.sent_to(A).len() == 1, WAIT));
    cluster.sent_to(A)[0].complete(Err(Error::Network));
    assert!(probe1.wait_for(1, WAIT));

    // While open and with retries declined, dispatches fail fast.
    let probe2 = CallbackProbe::new();
    mux.dispatch_direct(test_request(Opcode::Get, b"foo", &probe2))
        .unwrap();
    assert!(probe2.wait_for(1, WAIT));
    assert!(probe2.results()[0]
        .as_ref()
        .unwrap()
        .contains("circuit breaker"));

    // After the sleep window the next admission check fires a canary noop,
    // which the socket answers; traffic then flows again.
    thread::sleep(Duration::from_millis(150));
    let recovered = wait_until(
        || {
            let probe = CallbackProbe::new();
            let req = test_request(Opcode::Get, b"foo", &probe);
            mux.dispatch_direct(req).unwrap();
            thread::sleep(Duration::from_millis(20));
            cluster
                .sent_to(A)
                .iter()
                .any(|req| req.opcode == Opcode::Get)
        },
        WAIT,
    );
    assert!(recovered);

    // Exactly one probe went out.
    let noops = cluster
        .sent_to(A)
        .iter()
        .filter(|req| req.opcode == Opcode::Noop)
        .count();
    assert_eq!(noops, 1);

    mux.close().unwrap();
}

#[test]
fn cancelled_request_never_reaches_the_socket() {
    let cluster = MockCluster::new(false, false);
    let retry = MockRetry::new(false);
    let mux = new_mux(&cluster, &retry);
    cluster.refuse(A);
    mux.apply_routing_config(&uniform_couchbase_config(1, &[A], 64, 0));

    let probe = CallbackProbe::new();
    let req = test_request(Opcode::Set, b"foo", &probe);
    mux.dispatch_direct(Arc::clone(&req)).unwrap();

    assert!(req.cancel());
    assert!(probe.wait_for(1, WAIT));
    assert_eq!(
        probe.results(),
        vec![Some(String::from("request cancelled"))]
    );

    // Once the node becomes reachable the client pops the cancelled
    // request and discards it without writing it to the socket.
    cluster.allow(A);
    assert!(wait_until(|| cluster.dial_count(A) >= 1, WAIT));
    thread::sleep(Duration::from_millis(100));
    assert!(cluster.sent_to(A).is_empty());

    mux.close().unwrap();
    assert_eq!(probe.count(), 1);
}

#[test]
fn cancel_after_dispatch_still_completes_exactly_once() {
    let cluster = MockCluster::new(false, false);
    let retry = MockRetry::new(false);
    let mux = new_mux(&cluster, &retry);
    mux.apply_routing_config(&uniform_couchbase_config(1, &[A], 64, 0));

    let probe = CallbackProbe::new();
    let req = test_request(Opcode::Get, b"foo", &probe);
    mux.dispatch_direct(Arc::clone(&req)).unwrap();
    assert!(wait_until(|| cluster.sent_to(A).len() == 1, WAIT));

    assert!(req.cancel());
    assert!(probe.wait_for(1, WAIT));

    // A late completion from the socket loses the race quietly.
    cluster.sent_to(A)[0].complete(Ok(Default::default()));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(probe.count(), 1);
    assert_eq!(
        probe.results(),
        vec![Some(String::from("request cancelled"))]
    );

    mux.close().unwrap();
}
