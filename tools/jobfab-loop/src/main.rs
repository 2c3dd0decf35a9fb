// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! Loopback smoke test: run a master and N in-process workers over
//! 127.0.0.1, distribute a bunch of checksum units, and print transfer
//! statistics.
//!
//! Usage: jobfab-loop [workers] [units]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use jobfab::{MasterConfig, Session, WorkerConfig, MASTER_RANK};

const KIND_WORK: u8 = 2;
const KIND_RESULT: u8 = 3;
const KIND_DONE: u8 = 4;

fn checksum(index: u32, seed: u32) -> u32 {
    // FNV-1a over a small unit derived from the assignment.
    let mut hash: u32 = 0x811c_9dc5;
    for i in 0..1024u32 {
        let byte = (index.wrapping_mul(31).wrapping_add(seed).wrapping_add(i) % 251) as u8;
        hash = (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193);
    }
    hash
}

fn run_worker(master_port: u16) -> jobfab::Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, master_port));
    let session = Session::init_worker(WorkerConfig::new(addr))?;

    session.register_handler(KIND_WORK, |session, msg| {
        let index = u32::from_le_bytes(msg.bytes[1..5].try_into().expect("unit header"));
        let seed = u32::from_le_bytes(msg.bytes[5..9].try_into().expect("unit header"));
        let mut reply = vec![KIND_RESULT];
        reply.extend_from_slice(&index.to_le_bytes());
        reply.extend_from_slice(&checksum(index, seed).to_le_bytes());
        let _ = session.send_to(MASTER_RANK, &reply);
    });

    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    session.register_handler(KIND_DONE, move |_, _| flag.store(true, Ordering::Relaxed));

    while !done.load(Ordering::Relaxed) {
        session.dispatch_next(Duration::from_millis(50));
    }
    session.finalize();
    Ok(())
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let workers: usize = args.get(1).and_then(|a| a.parse().ok()).unwrap_or(4);
    let units: u32 = args.get(2).and_then(|a| a.parse().ok()).unwrap_or(256);
    let seed: u32 = 0x5eed_0001;

    println!("jobfab-loop: {} workers, {} units", workers, units);

    let (master, broadcaster) = match Session::init_master(MasterConfig {
        max_workers: workers.max(2),
        machine_name: Some("loop-master".to_string()),
        ..MasterConfig::default()
    }) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("master setup failed: {}", e);
            std::process::exit(1);
        }
    };
    let port = broadcaster.listen_port();
    println!("master listening on {}", port);

    let results: Arc<Mutex<Vec<Option<u32>>>> =
        Arc::new(Mutex::new(vec![None; units as usize]));
    let sink = Arc::clone(&results);
    master.register_handler(KIND_RESULT, move |_, msg| {
        let index = u32::from_le_bytes(msg.bytes[1..5].try_into().expect("result header"));
        let sum = u32::from_le_bytes(msg.bytes[5..9].try_into().expect("result header"));
        sink.lock().expect("results lock")[index as usize] = Some(sum);
    });

    let worker_threads: Vec<_> = (0..workers)
        .map(|i| {
            thread::Builder::new()
                .name(format!("loop-worker-{i}"))
                .spawn(move || {
                    if let Err(e) = run_worker(port) {
                        eprintln!("worker {} failed: {}", i, e);
                    }
                })
                .expect("spawn worker")
        })
        .collect();

    // Wait for the full crew before handing out units.
    while master.active_counts().0 < workers {
        master.dispatch_next(Duration::from_millis(50));
    }
    println!("{} workers joined", workers);

    for index in 0..units {
        let rank = 1 + (index as usize % workers);
        let mut unit = vec![KIND_WORK];
        unit.extend_from_slice(&index.to_le_bytes());
        unit.extend_from_slice(&seed.to_le_bytes());
        if !master.send_to(rank, &unit).unwrap_or(false) {
            eprintln!("rank {} went away, unit {} lost", rank, index);
        }
    }

    while results.lock().expect("results lock").iter().any(Option::is_none) {
        if !master.dispatch_next(Duration::from_millis(200)) {
            master.handle_peer_errors();
        }
    }

    let mismatches = results
        .lock()
        .expect("results lock")
        .iter()
        .enumerate()
        .filter(|(i, sum)| **sum != Some(checksum(*i as u32, seed)))
        .count();

    master.send_persistent(&[KIND_DONE]);
    for handle in worker_threads {
        let _ = handle.join();
    }

    let stats = master.stats();
    println!(
        "done: {} units, {} bad checksums | sent {} msgs / {} bytes, received {} msgs / {} bytes",
        units,
        mismatches,
        stats.messages_sent,
        stats.bytes_sent,
        stats.messages_received,
        stats.bytes_received
    );

    drop(broadcaster);
    master.finalize();
    if mismatches > 0 {
        std::process::exit(1);
    }
}
