//! Concurrent-exchange tests for tether_ipc.
//!
//! These tests hammer one mapping from two endpoints to verify the seqlock
//! rendezvous: a receive that returns must never expose a region where only
//! part of it reflects the latest write, and a peer blocked mid-wait must
//! unblock when the other side tears down.

use std::thread;
use std::time::Duration;

use tether_ipc::{ArrayChannel, BufferKind, ChannelError, ForceMode, HostChannel, Quad};

fn channel_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("exchange.shm")
}

// =============================================================================
// Torn-Read Stress
// =============================================================================

#[test]
fn test_no_torn_reads_under_interleaved_sends() {
    const N: usize = 256;
    const ROUNDS: u32 = 500;

    let dir = tempfile::tempdir().unwrap();
    let path = channel_path(&dir);

    let mut host = HostChannel::<f32>::create(&path, N, 0, ForceMode::Add, None).unwrap();
    let mut peer =
        HostChannel::<f32>::attach(&path, Some(Duration::from_secs(10))).unwrap();

    // Writer: each publish fills the whole region with one pattern value.
    let writer = thread::spawn(move || {
        for round in 1..=ROUNDS {
            let records = vec![Quad::splat(round as f32); N];
            host.send(BufferKind::Positions, &records).unwrap();
        }
        host
    });

    // Reader: every returned buffer must be internally uniform, and patterns
    // must never go backwards.
    let reader = thread::spawn(move || {
        let mut out = vec![Quad::zero(); N];
        let mut last_pattern = 0.0f32;
        let mut received = 0u32;
        while last_pattern < ROUNDS as f32 {
            peer.receive_into(BufferKind::Positions, &mut out).unwrap();
            let pattern = out[0].x;
            for record in &out {
                assert_eq!(
                    record.as_array(),
                    [pattern; 4],
                    "torn read: mixed patterns in one receive"
                );
            }
            assert!(
                pattern > last_pattern,
                "pattern went backwards: {} after {}",
                pattern,
                last_pattern
            );
            last_pattern = pattern;
            received += 1;
        }
        received
    });

    let _host = writer.join().expect("writer panicked");
    let received = reader.join().expect("reader panicked");

    // Receives may skip intermediate publishes but never exceed them.
    assert!(received >= 1);
    assert!(received <= ROUNDS);
}

#[test]
fn test_interleaved_bidirectional_traffic() {
    const N: usize = 64;
    const ROUNDS: u32 = 200;

    let dir = tempfile::tempdir().unwrap();
    let path = channel_path(&dir);

    let mut host = HostChannel::<f64>::create(
        &path,
        N,
        0,
        ForceMode::Add,
        Some(Duration::from_secs(10)),
    )
    .unwrap();
    let mut peer =
        HostChannel::<f64>::attach(&path, Some(Duration::from_secs(10))).unwrap();

    // Peer thread: echo each received position pattern back as forces.
    let engine = thread::spawn(move || {
        let mut positions = vec![Quad::zero(); N];
        for _ in 0..ROUNDS {
            peer.receive_into(BufferKind::Positions, &mut positions)
                .unwrap();
            let pattern = positions[0].x;
            for record in &positions {
                assert_eq!(record.as_array(), [pattern; 4]);
            }
            let forces = vec![Quad::splat(-pattern); N];
            peer.send(BufferKind::Forces, &forces).unwrap();
        }
    });

    let mut forces = vec![Quad::zero(); N];
    for round in 1..=ROUNDS {
        let positions = vec![Quad::splat(round as f64); N];
        host.send(BufferKind::Positions, &positions).unwrap();
        host.receive_into(BufferKind::Forces, &mut forces).unwrap();
        for record in &forces {
            assert_eq!(record.as_array(), [-(round as f64); 4]);
        }
    }

    engine.join().expect("engine panicked");
}

// =============================================================================
// Teardown Mid-Wait
// =============================================================================

#[test]
fn test_teardown_unblocks_waiting_peer() {
    let dir = tempfile::tempdir().unwrap();
    let path = channel_path(&dir);

    let mut host = HostChannel::<f32>::create(&path, 8, 0, ForceMode::Add, None).unwrap();
    let mut peer = HostChannel::<f32>::attach(&path, None).unwrap();

    let waiter = thread::spawn(move || {
        let mut out = vec![Quad::zero(); 8];
        peer.receive_into(BufferKind::Forces, &mut out)
    });

    // Give the peer time to block, then tear down.
    thread::sleep(Duration::from_millis(50));
    host.close();

    let result = waiter.join().expect("waiter panicked");
    assert!(matches!(result, Err(ChannelError::ChannelClosed)));
}

#[test]
fn test_host_drop_unblocks_waiting_peer() {
    let dir = tempfile::tempdir().unwrap();
    let path = channel_path(&dir);

    let host = HostChannel::<f32>::create(&path, 8, 0, ForceMode::Add, None).unwrap();
    let mut peer = HostChannel::<f32>::attach(&path, None).unwrap();

    let waiter = thread::spawn(move || {
        let mut out = vec![Quad::zero(); 8];
        peer.receive_into(BufferKind::Forces, &mut out)
    });

    thread::sleep(Duration::from_millis(50));
    drop(host);

    let result = waiter.join().expect("waiter panicked");
    assert!(matches!(result, Err(ChannelError::ChannelClosed)));
}
