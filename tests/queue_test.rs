// Copyright 2020 Joyent, Inc.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use snooker::queue::{OpQueue, PushError};
use snooker::request::{KvRequest, Opcode};
use snooker::retry::FailFastRetryStrategy;

fn queued_request() -> Arc<KvRequest> {
    KvRequest::new(
        Opcode::Get,
        b"key".to_vec(),
        Vec::new(),
        Arc::new(FailFastRetryStrategy),
        Box::new(|_result| {}),
    )
}

#[test]
fn push_respects_capacity() {
    let queue = OpQueue::new(2);
    queue.push(queued_request()).unwrap();
    queue.push(queued_request()).unwrap();
    assert_eq!(queue.push(queued_request()), Err(PushError::Full));
    assert_eq!(queue.len(), 2);
}

#[test]
fn pop_yields_requests_in_fifo_order() {
    let queue = OpQueue::new(8);
    let first = queued_request();
    let second = queued_request();
    let expected = vec![first.opaque(), second.opaque()];
    queue.push(first).unwrap();
    queue.push(second).unwrap();

    let consumer = queue.consumer();
    let popped = vec![
        consumer.pop().unwrap().opaque(),
        consumer.pop().unwrap().opaque(),
    ];
    assert_eq!(popped, expected);
}

#[test]
fn drain_is_terminal_and_fifo() {
    let queue = OpQueue::new(8);
    let first = queued_request();
    let second = queued_request();
    let expected = vec![first.opaque(), second.opaque()];
    queue.push(first).unwrap();
    queue.push(second).unwrap();

    let mut drained = Vec::new();
    queue.drain(|req| drained.push(req.opaque()));
    assert_eq!(drained, expected);
    assert!(queue.is_empty());

    assert_eq!(queue.push(queued_request()), Err(PushError::Closed));
}

#[test]
fn closing_a_consumer_unblocks_its_pop() {
    let queue = OpQueue::new(8);
    let consumer = queue.consumer();

    let popper = Arc::clone(&consumer);
    let handle = thread::spawn(move || popper.pop());
    thread::sleep(Duration::from_millis(50));
    consumer.close();
    assert!(handle.join().unwrap().is_none());

    // The queue itself is unaffected: a fresh handle still serves.
    queue.push(queued_request()).unwrap();
    let fresh = queue.consumer();
    assert!(fresh.pop().is_some());
}

#[test]
fn queue_close_wakes_every_consumer() {
    let queue = OpQueue::new(8);
    let first = queue.consumer();
    let second = queue.consumer();

    let first_popper = Arc::clone(&first);
    let second_popper = Arc::clone(&second);
    let first_handle = thread::spawn(move || first_popper.pop());
    let second_handle = thread::spawn(move || second_popper.pop());
    thread::sleep(Duration::from_millis(50));

    queue.close();
    assert!(first_handle.join().unwrap().is_none());
    assert!(second_handle.join().unwrap().is_none());
    assert_eq!(queue.push(queued_request()), Err(PushError::Closed));
}

#[test]
fn queued_work_is_retained_across_close_for_drain() {
    let queue = OpQueue::new(8);
    let req = queued_request();
    let opaque = req.opaque();
    queue.push(req).unwrap();

    queue.close();
    let mut drained = Vec::new();
    queue.drain(|req| drained.push(req.opaque()));
    assert_eq!(drained, vec![opaque]);
}
