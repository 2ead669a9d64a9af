// Copyright 2025 Callgate Contributors
// SPDX-License-Identifier: Apache-2.0

//! Client rundown and interrupt behavior under blocked producers and
//! consumers.

use std::thread;
use std::time::Duration;

use callgate::boundary::ConsumerSpace;
use callgate::{Error, Removed};
use callgate_abi::{event, status};
use callgate_e2e::{framework, request, request_dest, stage_return};

#[test]
fn rundown_abandons_blocked_producers() {
    let fw = framework();
    let client = fw.create_client().expect("client");
    let first = fw
        .create_callback(&client, request(event::PROCESS_CREATE, 1))
        .expect("callback");
    let second = fw
        .create_callback(&client, request(event::PROCESS_CREATE, 2))
        .expect("callback");

    thread::scope(|scope| {
        let producers = [
            scope.spawn(|| fw.perform_callback(&first)),
            scope.spawn(|| fw.perform_callback(&second)),
        ];
        thread::sleep(Duration::from_millis(50));
        fw.destroy_client(&client).expect("destroy client");
        for producer in producers {
            assert_eq!(producer.join().expect("join"), Err(Error::Abandoned));
        }
    });

    // Abandoned callbacks can still be destroyed by their owners.
    fw.destroy_callback(first).expect("destroy first");
    fw.destroy_callback(second).expect("destroy second");

    // The client handle is stale now.
    assert_eq!(fw.destroy_client(&client), Err(Error::NotFound));
    assert_eq!(fw.outstanding_callbacks(&client), 0);
}

#[test]
fn rundown_wakes_a_blocked_consumer() {
    let fw = framework();
    let client = fw.create_client().expect("client");

    thread::scope(|scope| {
        let consumer = scope.spawn(|| {
            let mut space = ConsumerSpace::new(64);
            fw.remove_callback(&client, None, &mut space, request_dest(0))
        });
        thread::sleep(Duration::from_millis(50));
        fw.destroy_client(&client).expect("destroy client");
        assert_eq!(consumer.join().expect("join"), Ok(Removed::Abandoned));
    });

    // Further dequeues observe the abandonment immediately.
    let mut space = ConsumerSpace::new(64);
    let removed = fw
        .remove_callback(&client, Some(Duration::ZERO), &mut space, request_dest(0))
        .expect("poll");
    assert_eq!(removed, Removed::Abandoned);
}

#[test]
fn interrupt_wakes_a_blocked_consumer_without_teardown() {
    let fw = framework();
    let client = fw.create_client().expect("client");

    thread::scope(|scope| {
        let consumer = scope.spawn(|| {
            let mut space = ConsumerSpace::new(64);
            fw.remove_callback(&client, None, &mut space, request_dest(0))
        });
        thread::sleep(Duration::from_millis(50));
        fw.interrupt(&client);
        assert_eq!(consumer.join().expect("join"), Ok(Removed::Interrupted));
    });

    // The client remains fully usable after an interrupt.
    let callback = fw
        .create_callback(&client, request(event::THREAD_CREATE, 1))
        .expect("callback");
    thread::scope(|scope| {
        let producer = scope.spawn(|| fw.perform_callback(&callback));
        let mut space = ConsumerSpace::new(256);
        let removed = fw
            .remove_callback(&client, Some(Duration::from_secs(5)), &mut space, request_dest(0))
            .expect("remove");
        let id = match removed {
            Removed::Callback { id, .. } => id,
            other => panic!("expected a callback, got {other:?}"),
        };
        let src = stage_return(&mut space, 64, event::THREAD_CREATE, status::OK, 1);
        fw.return_callback(&client, id, &space, src).expect("return");
        assert!(producer.join().expect("join").is_ok());
    });
    fw.destroy_callback(callback).expect("destroy callback");
    fw.destroy_client(&client).expect("destroy client");
}

#[test]
fn returning_to_a_destroyed_client_is_not_found() {
    let fw = framework();
    let client = fw.create_client().expect("client");
    let callback = fw
        .create_callback(&client, request(event::PROCESS_CREATE, 1))
        .expect("callback");
    let id = callback.id();
    fw.destroy_client(&client).expect("destroy client");

    let mut space = ConsumerSpace::new(64);
    let src = stage_return(&mut space, 0, event::PROCESS_CREATE, status::OK, 0);
    assert_eq!(fw.return_callback(&client, id, &space, src), Err(Error::NotFound));
    fw.destroy_callback(callback).expect("destroy callback");
}
