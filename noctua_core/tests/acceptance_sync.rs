//! Acceptance tests for the sync layer
//! Exercises broadcast and gather rendezvous across fabric-spawned nodes.

use noctua_core::{Fabric, NodeRuntime, SyncMode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_broadcast_releases_every_member() {
    // Given: a one-to-all sync rooted at node 0 with members 1 and 2
    // When: the root signals
    // Then: both members return from their wait

    let fabric = Fabric::with_nodes(4);
    let nodes = [0usize, 1, 2];
    let released = Arc::new(AtomicUsize::new(0));

    let mut members = Vec::new();
    for member in [1usize, 2] {
        let fabric2 = fabric.clone();
        let released2 = released.clone();
        members.push(fabric.spawn(member, move || {
            let rt = NodeRuntime::init(fabric2, member).unwrap();
            let id = rt.syncs().create(&[0, 1, 2], SyncMode::OneToAll).unwrap();
            rt.syncs().wait(id).unwrap();
            released2.fetch_add(1, Ordering::SeqCst);
            rt.syncs().unlink(id).unwrap();
        }));
    }

    let root = NodeRuntime::init(fabric, nodes[0]).unwrap();
    let id = root.syncs().open(&[0, 1, 2], SyncMode::OneToAll).unwrap();
    root.syncs().signal(id).unwrap();

    for member in members {
        member.join().unwrap();
    }
    assert_eq!(released.load(Ordering::SeqCst), 2);
    root.syncs().close(id).unwrap();
}

#[test]
fn test_gather_counts_every_leaf_once() {
    // Given: an all-to-one sync rooted at node 0 with leaves 1, 2, 3
    // When: every leaf signals
    // Then: the root's wait returns exactly once all three arrived

    let fabric = Fabric::with_nodes(4);

    let mut leaves = Vec::new();
    for leaf in [1usize, 2, 3] {
        let fabric2 = fabric.clone();
        leaves.push(fabric.spawn(leaf, move || {
            let rt = NodeRuntime::init(fabric2, leaf).unwrap();
            let id = rt.syncs().open(&[0, 1, 2, 3], SyncMode::AllToOne).unwrap();
            rt.syncs().signal(id).unwrap();
            rt.syncs().close(id).unwrap();
        }));
    }

    let root = NodeRuntime::init(fabric, 0).unwrap();
    let id = root.syncs().create(&[0, 1, 2, 3], SyncMode::AllToOne).unwrap();
    root.syncs().wait(id).unwrap();
    root.syncs().unlink(id).unwrap();

    for leaf in leaves {
        leaf.join().unwrap();
    }
}

#[test]
fn test_bootstrap_barrier_round_trip() {
    // The bootstrap pattern: a gather (everyone checked in) followed by a
    // broadcast (everyone may proceed).

    let fabric = Fabric::with_nodes(3);
    let nodes = [0usize, 1, 2];

    let mut workers = Vec::new();
    for worker in [1usize, 2] {
        let fabric2 = fabric.clone();
        workers.push(fabric.spawn(worker, move || {
            let rt = NodeRuntime::init(fabric2, worker).unwrap();
            let checkin = rt.syncs().open(&[0, 1, 2], SyncMode::AllToOne).unwrap();
            let release = rt.syncs().create(&[0, 1, 2], SyncMode::OneToAll).unwrap();
            rt.syncs().signal(checkin).unwrap();
            rt.syncs().wait(release).unwrap();
            rt.syncs().close(checkin).unwrap();
            rt.syncs().unlink(release).unwrap();
        }));
    }

    let root = NodeRuntime::init(fabric, nodes[0]).unwrap();
    let checkin = root.syncs().create(&[0, 1, 2], SyncMode::AllToOne).unwrap();
    let release = root.syncs().open(&[0, 1, 2], SyncMode::OneToAll).unwrap();
    root.syncs().wait(checkin).unwrap();
    root.syncs().signal(release).unwrap();

    for worker in workers {
        worker.join().unwrap();
    }
}
