// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Batching must be invisible: sending grouped then flushing has to look
//! exactly like sending each message individually, in the same order.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use jobfab::{MasterConfig, SendOpts, Session, WorkerConfig, MASTER_RANK};

const KIND_UNIT: u8 = 8;

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn grouped_and_direct_sends_arrive_in_send_order() {
    let (master, broadcaster) = Session::init_master(MasterConfig {
        listen_ports: (25400, 25402),
        downloader_ports: None,
        broadcast_ports: (25406, 25406),
        broadcast_interval: Duration::from_millis(100),
        machine_name: Some("order-master".to_string()),
        ..MasterConfig::default()
    })
    .unwrap();

    let worker = Session::init_worker(WorkerConfig {
        group_packets: true,
        machine_name: Some("order-worker".to_string()),
        ..WorkerConfig::new(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            broadcaster.listen_port(),
        )))
    })
    .unwrap();

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    master.register_handler(KIND_UNIT, move |_, msg| sink.lock().push(msg.bytes[1]));

    assert!(wait_for(Duration::from_secs(5), || {
        master.dispatch_next(Duration::from_millis(20));
        master.registry_count() == 2
    }));

    // Interleave batched and direct sends; flushes sit between direct
    // sends so the wire order equals the send order.
    let mut expected = Vec::new();
    let mut seq: u8 = 0;
    for round in 0..4 {
        for _ in 0..5 {
            assert!(worker
                .send_to_opts(MASTER_RANK, &[KIND_UNIT, seq], SendOpts::grouped())
                .unwrap());
            expected.push(seq);
            seq += 1;
        }
        worker.flush_batches(None);
        if round % 2 == 0 {
            assert!(worker.send_to(MASTER_RANK, &[KIND_UNIT, seq]).unwrap());
            expected.push(seq);
            seq += 1;
        }
    }

    assert!(
        wait_for(Duration::from_secs(5), || {
            master.dispatch_next(Duration::from_millis(20));
            seen.lock().len() >= expected.len()
        }),
        "master received {} of {} messages",
        seen.lock().len(),
        expected.len()
    );
    assert_eq!(*seen.lock(), expected);

    worker.finalize();
    drop(broadcaster);
    master.finalize();
}

#[test]
fn interleaved_peers_keep_per_connection_order() {
    let (master, broadcaster) = Session::init_master(MasterConfig {
        listen_ports: (25420, 25422),
        downloader_ports: None,
        broadcast_ports: (25426, 25426),
        broadcast_interval: Duration::from_millis(100),
        machine_name: Some("interleave-master".to_string()),
        ..MasterConfig::default()
    })
    .unwrap();

    let make_worker = |name: &str, group: bool| {
        Session::init_worker(WorkerConfig {
            group_packets: group,
            machine_name: Some(name.to_string()),
            ..WorkerConfig::new(SocketAddr::from((
                Ipv4Addr::LOCALHOST,
                broadcaster.listen_port(),
            )))
        })
        .unwrap()
    };
    let grouping_worker = make_worker("peer-a", true);
    let direct_worker = make_worker("peer-b", false);

    // (source_rank, sequence byte) in master dispatch order.
    let seen: Arc<Mutex<Vec<(usize, u8)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    master.register_handler(KIND_UNIT, move |_, msg| {
        sink.lock().push((msg.source_rank, msg.bytes[1]));
    });

    assert!(wait_for(Duration::from_secs(5), || {
        master.dispatch_next(Duration::from_millis(20));
        master.registry_count() == 3
    }));

    const PER_PEER: u8 = 40;
    let sender = |session: Arc<Session>, grouped: bool| {
        thread::spawn(move || {
            for i in 0..PER_PEER {
                if grouped && i % 4 != 3 {
                    session
                        .send_to_opts(MASTER_RANK, &[KIND_UNIT, i], SendOpts::grouped())
                        .unwrap();
                } else {
                    session.flush_batches(None);
                    session.send_to(MASTER_RANK, &[KIND_UNIT, i]).unwrap();
                }
            }
            session.flush_batches(None);
        })
    };
    let a = sender(Arc::clone(&grouping_worker), true);
    let b = sender(Arc::clone(&direct_worker), false);
    a.join().unwrap();
    b.join().unwrap();

    assert!(
        wait_for(Duration::from_secs(5), || {
            master.dispatch_next(Duration::from_millis(20));
            seen.lock().len() >= 2 * PER_PEER as usize
        }),
        "master received {} of {} messages",
        seen.lock().len(),
        2 * PER_PEER as usize
    );

    // Whatever the cross-peer interleaving, each peer's subsequence must
    // equal its send order - grouped expansion included.
    let seen = seen.lock();
    for rank in [1usize, 2] {
        let sequence: Vec<u8> = seen
            .iter()
            .filter(|(source, _)| *source == rank)
            .map(|(_, seq)| *seq)
            .collect();
        let expected: Vec<u8> = (0..PER_PEER).collect();
        assert_eq!(sequence, expected, "rank {} out of order", rank);
    }

    grouping_worker.finalize();
    direct_worker.finalize();
    drop(broadcaster);
    master.finalize();
}

#[test]
fn min_interval_flush_is_rate_limited() {
    let (master, broadcaster) = Session::init_master(MasterConfig {
        listen_ports: (25410, 25412),
        downloader_ports: None,
        broadcast_ports: (25416, 25416),
        broadcast_interval: Duration::from_millis(100),
        machine_name: Some("rate-master".to_string()),
        ..MasterConfig::default()
    })
    .unwrap();

    let worker = Session::init_worker(WorkerConfig {
        machine_name: Some("rate-worker".to_string()),
        ..WorkerConfig::new(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            broadcaster.listen_port(),
        )))
    })
    .unwrap();

    let seen: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    worker.register_handler(KIND_UNIT, move |_, msg| sink.lock().push(msg.bytes[1]));

    assert!(wait_for(Duration::from_secs(5), || {
        master.dispatch_next(Duration::from_millis(20));
        master.registry_count() == 2
    }));

    assert!(master.batch_to(1, &[KIND_UNIT, 1]).unwrap());
    // Inside the interval: nothing goes out yet.
    master.flush_batches(Some(Duration::from_secs(3600)));
    assert!(!wait_for(Duration::from_millis(300), || {
        worker.dispatch_next(Duration::from_millis(20));
        !seen.lock().is_empty()
    }));

    // An unconditional flush drains the batch.
    master.flush_batches(None);
    assert!(wait_for(Duration::from_secs(5), || {
        worker.dispatch_next(Duration::from_millis(20));
        seen.lock().len() == 1
    }));

    worker.finalize();
    drop(broadcaster);
    master.finalize();
}
