// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

//! Producer/consumer roundtrips over the synchronous callback bridge.

use std::thread;
use std::time::Duration;

use callgate::boundary::ConsumerSpace;
use callgate::{Error, Removed};
use callgate_abi::{event, status, CallbackData};
use callgate_e2e::{framework, read_request, request, request_dest, stage_return};

#[test]
fn single_callback_roundtrip() {
    let fw = framework();
    let client = fw.create_client().expect("client");
    let callback = fw
        .create_callback(&client, request(event::PROCESS_CREATE, 7))
        .expect("callback");
    let expected_id = callback.id();

    let producer = {
        let fw = fw.clone();
        thread::spawn(move || {
            let result = fw.perform_callback(&callback).expect("producer completes");
            fw.destroy_callback(callback).expect("destroy callback");
            result
        })
    };

    let mut space = ConsumerSpace::new(256);
    let removed = fw
        .remove_callback(&client, Some(Duration::from_secs(5)), &mut space, request_dest(0))
        .expect("remove");
    let (id, len) = match removed {
        Removed::Callback { id, len } => (id, len),
        other => panic!("expected a callback, got {other:?}"),
    };
    assert_eq!(id, expected_id);
    assert_eq!(len, CallbackData::WIRE_SIZE);

    let seen = read_request(&space, 0);
    assert_eq!(seen.event_id, event::PROCESS_CREATE);
    assert_eq!(seen.sequence, 7);
    assert_eq!(seen.args, [7, 8, 9, 10]);

    let src = stage_return(&mut space, 64, event::PROCESS_CREATE, status::OK, 42);
    fw.return_callback(&client, id, &space, src).expect("return");

    let result = producer.join().expect("producer join");
    assert_eq!(result.event_id, event::PROCESS_CREATE);
    assert_eq!(result.status, status::OK);
    assert_eq!(result.result, 42);

    // The result was delivered exactly once; a second return is rejected.
    let src = stage_return(&mut space, 64, event::PROCESS_CREATE, status::OK, 43);
    assert_eq!(fw.return_callback(&client, id, &space, src), Err(Error::NotFound));

    fw.destroy_client(&client).expect("destroy client");
}

#[test]
fn requests_are_delivered_in_submission_order() {
    let fw = framework();
    let client = fw.create_client().expect("client");

    let mut producers = Vec::new();
    for sequence in 1..=3u64 {
        let callback = fw
            .create_callback(&client, request(event::THREAD_CREATE, sequence))
            .expect("callback");
        let fw = fw.clone();
        producers.push(thread::spawn(move || {
            let result = fw.perform_callback(&callback).expect("producer completes");
            fw.destroy_callback(callback).expect("destroy callback");
            result.result
        }));
        // Stagger so the submission order is deterministic.
        thread::sleep(Duration::from_millis(50));
    }

    let mut space = ConsumerSpace::new(256);
    let mut sequences = Vec::new();
    for _ in 0..3 {
        let removed = fw
            .remove_callback(&client, Some(Duration::from_secs(5)), &mut space, request_dest(0))
            .expect("remove");
        let id = match removed {
            Removed::Callback { id, .. } => id,
            other => panic!("expected a callback, got {other:?}"),
        };
        let seen = read_request(&space, 0);
        sequences.push(seen.sequence);
        let src =
            stage_return(&mut space, 64, event::THREAD_CREATE, status::OK, seen.sequence * 10);
        fw.return_callback(&client, id, &space, src).expect("return");
    }
    assert_eq!(sequences, vec![1, 2, 3], "handoff queue is FIFO");

    for (index, producer) in producers.into_iter().enumerate() {
        assert_eq!(producer.join().expect("join"), (index as u64 + 1) * 10);
    }
    fw.destroy_client(&client).expect("destroy client");
}

#[test]
fn short_buffer_redelivers_the_identical_request() {
    let fw = framework();
    let client = fw.create_client().expect("client");
    let callback = fw
        .create_callback(&client, request(event::IMAGE_LOAD, 21))
        .expect("callback");

    let producer = {
        let fw = fw.clone();
        thread::spawn(move || {
            let result = fw.perform_callback(&callback).expect("producer completes");
            fw.destroy_callback(callback).expect("destroy callback");
            result.result
        })
    };

    let mut space = ConsumerSpace::new(256);
    let short = callgate::boundary::UserSlice::new(0, CallbackData::WIRE_SIZE - 1);
    let err = fw
        .remove_callback(&client, Some(Duration::from_secs(5)), &mut space, short)
        .unwrap_err();
    assert_eq!(err, Error::BufferTooSmall);

    // Nothing was lost; the retry delivers the same request.
    let removed = fw
        .remove_callback(&client, Some(Duration::from_secs(5)), &mut space, request_dest(0))
        .expect("retry");
    let id = match removed {
        Removed::Callback { id, .. } => id,
        other => panic!("expected a callback, got {other:?}"),
    };
    let seen = read_request(&space, 0);
    assert_eq!(seen, request(event::IMAGE_LOAD, 21));

    let src = stage_return(&mut space, 64, event::IMAGE_LOAD, status::SKIPPED, 5);
    fw.return_callback(&client, id, &space, src).expect("return");
    assert_eq!(producer.join().expect("join"), 5);
    fw.destroy_client(&client).expect("destroy client");
}

#[test]
fn mismatched_return_leaves_the_producer_waiting() {
    let fw = framework();
    let client = fw.create_client().expect("client");
    let callback = fw
        .create_callback(&client, request(event::PROCESS_EXIT, 3))
        .expect("callback");

    let producer = {
        let fw = fw.clone();
        thread::spawn(move || {
            let result = fw.perform_callback(&callback).expect("producer completes");
            fw.destroy_callback(callback).expect("destroy callback");
            result
        })
    };

    let mut space = ConsumerSpace::new(256);
    let removed = fw
        .remove_callback(&client, Some(Duration::from_secs(5)), &mut space, request_dest(0))
        .expect("remove");
    let id = match removed {
        Removed::Callback { id, .. } => id,
        other => panic!("expected a callback, got {other:?}"),
    };

    // Answering with the wrong event id is rejected and wakes nobody.
    let wrong = stage_return(&mut space, 64, event::THREAD_EXIT, status::OK, 1);
    assert_eq!(fw.return_callback(&client, id, &space, wrong), Err(Error::EventMismatch));
    thread::sleep(Duration::from_millis(50));
    assert!(!producer.is_finished(), "producer must still be blocked");

    let src = stage_return(&mut space, 64, event::PROCESS_EXIT, status::DENIED, 9);
    fw.return_callback(&client, id, &space, src).expect("return");
    let result = producer.join().expect("join");
    assert_eq!(result.status, status::DENIED);
    assert_eq!(result.result, 9);
    fw.destroy_client(&client).expect("destroy client");
}

#[test]
fn polling_an_idle_client_times_out() {
    let fw = framework();
    let client = fw.create_client().expect("client");
    let mut space = ConsumerSpace::new(64);
    let removed = fw
        .remove_callback(&client, Some(Duration::ZERO), &mut space, request_dest(0))
        .expect("poll");
    assert_eq!(removed, Removed::Timeout);
    fw.destroy_client(&client).expect("destroy client");
}
