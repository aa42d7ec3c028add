//! Acceptance tests for the mailbox layer
//! Exercises the named-endpoint lifecycle and cross-node frame delivery.

use noctua_core::{Fabric, NodeRuntime, NoctuaError, MAILBOX_MSG_SIZE};

#[test]
fn test_scenario_1_write_and_read_across_nodes() {
    // Scenario: node 1 opens an outbox to node 0 and writes a frame of ones.
    // Given: an input mailbox on node 0
    // When: node 1 writes [1; MSG]
    // Then: node 0 reads a buffer equal to [1; MSG] with the full length

    let fabric = Fabric::with_nodes(2);
    let receiver = NodeRuntime::init(fabric.clone(), 0).expect("node 0 init");

    let sender_fabric = fabric.clone();
    let writer = fabric.spawn(1, move || {
        let rt = NodeRuntime::init(sender_fabric, 1).expect("node 1 init");
        let outbox = rt.mailboxes().open(0).expect("open outbox");
        let n = rt
            .mailboxes()
            .write(outbox, &[1u8; MAILBOX_MSG_SIZE])
            .expect("write frame");
        assert_eq!(n, MAILBOX_MSG_SIZE);
        rt.mailboxes().close(outbox).expect("close outbox");
    });

    let mut buf = [0u8; MAILBOX_MSG_SIZE];
    let n = receiver
        .mailboxes()
        .read(receiver.inbox(), &mut buf)
        .expect("read frame");
    assert_eq!(n, MAILBOX_MSG_SIZE);
    assert_eq!(buf, [1u8; MAILBOX_MSG_SIZE]);

    writer.join().unwrap();
}

#[test]
fn test_frames_arrive_in_order_per_connection() {
    // Within a single connection, frames are delivered in the order sent.

    let fabric = Fabric::with_nodes(2);
    let receiver = NodeRuntime::init(fabric.clone(), 0).unwrap();

    let sender_fabric = fabric.clone();
    let writer = fabric.spawn(1, move || {
        let rt = NodeRuntime::init(sender_fabric, 1).unwrap();
        let outbox = rt.mailboxes().open(0).unwrap();
        for seq in 0..8u8 {
            let mut frame = [0u8; MAILBOX_MSG_SIZE];
            frame[0] = seq;
            rt.mailboxes().write(outbox, &frame).unwrap();
        }
        rt.mailboxes().close(outbox).unwrap();
    });

    for seq in 0..8u8 {
        let mut buf = [0u8; MAILBOX_MSG_SIZE];
        receiver.mailboxes().read(receiver.inbox(), &mut buf).unwrap();
        assert_eq!(buf[0], seq, "frame {seq} out of order");
    }

    writer.join().unwrap();
}

#[test]
fn test_lifecycle_returns_to_initial_state() {
    // create; unlink returns the endpoint to its initial state, and
    // operating on a dead descriptor fails.

    let fabric = Fabric::with_nodes(2);
    let rt = NodeRuntime::init(fabric, 0).unwrap();

    let outbox = rt.mailboxes().open(1).unwrap();
    rt.mailboxes().close(outbox).unwrap();

    // Double close.
    assert!(rt.mailboxes().close(outbox).is_err());
    // Operate after close.
    assert!(rt
        .mailboxes()
        .write(outbox, &[0u8; MAILBOX_MSG_SIZE])
        .is_err());

    // The input mailbox can be unlinked exactly once.
    rt.mailboxes().unlink(rt.inbox()).unwrap();
    assert!(rt.mailboxes().unlink(rt.inbox()).is_err());
}

#[test]
fn test_transfer_statistics_are_recorded() {
    // Each successful transfer records latency and volume on the endpoint.

    let fabric = Fabric::with_nodes(2);
    let receiver = NodeRuntime::init(fabric.clone(), 0).unwrap();

    let sender_fabric = fabric.clone();
    let writer = fabric.spawn(1, move || {
        let rt = NodeRuntime::init(sender_fabric, 1).unwrap();
        let outbox = rt.mailboxes().open(0).unwrap();
        rt.mailboxes()
            .write(outbox, &[7u8; MAILBOX_MSG_SIZE])
            .unwrap();
        let (_latency, volume) = rt.mailboxes().stats(outbox).unwrap();
        assert_eq!(volume, MAILBOX_MSG_SIZE);
        rt.mailboxes().close(outbox).unwrap();
    });

    let mut buf = [0u8; MAILBOX_MSG_SIZE];
    receiver.mailboxes().read(receiver.inbox(), &mut buf).unwrap();
    let (_latency, volume) = receiver.mailboxes().stats(receiver.inbox()).unwrap();
    assert_eq!(volume, MAILBOX_MSG_SIZE);

    writer.join().unwrap();
}

#[test]
fn test_open_to_self_is_rejected() {
    let fabric = Fabric::with_nodes(2);
    let rt = NodeRuntime::init(fabric, 0).unwrap();
    assert!(matches!(
        rt.mailboxes().open(0),
        Err(NoctuaError::Invalid(_))
    ));
}
