//! Acceptance tests for the message queue service
//! Exercises priority ordering and the portal payload exchange.

use noctua_core::{NodeRuntime, NoctuaError, SubstrateConfig};
use noctua_services::mqueue::{MqueueClient, MQUEUE_MESSAGE_MAX, MQUEUE_MESSAGE_SIZE};
use noctua_services::Substrate;
use std::sync::Arc;

fn boot() -> (Substrate, Arc<NodeRuntime>, MqueueClient) {
    let substrate = Substrate::launch(SubstrateConfig::default()).expect("substrate");
    let runtime = NodeRuntime::init(substrate.fabric().clone(), 8).expect("client runtime");
    let server = substrate.config().servers.mqueue;
    let client = MqueueClient::new(runtime.clone(), server).expect("mqueue client");
    (substrate, runtime, client)
}

#[test]
fn test_payload_round_trip_across_nodes() {
    // A message sent by one node is received intact by another.

    let (substrate, runtime, client) = boot();
    let created = client.create_excl("pipe", 0o600).expect("create");

    let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let mqueueid = client.open("pipe", false, true).expect("open for write");
    assert_eq!(mqueueid, created, "open by name resolves the created queue");
    client.send(mqueueid, &payload, 5).expect("send");

    let fabric = substrate.fabric().clone();
    let server = substrate.config().servers.mqueue;
    let receiver = substrate.fabric().spawn(9, move || {
        let rt = NodeRuntime::init(fabric, 9).expect("receiver runtime");
        let client = MqueueClient::new(rt, server).expect("mqueue client");
        let mqueueid = client.open("pipe", true, false).expect("open for read");
        let mut buf = vec![0u8; MQUEUE_MESSAGE_SIZE];
        let (len, prio) = client.receive(mqueueid, &mut buf).expect("receive");
        assert_eq!(len, expected.len());
        assert_eq!(prio, 5);
        assert_eq!(&buf[..len], &expected[..]);
        client.close(mqueueid).expect("receiver close");
    });
    receiver.join().unwrap();

    client.close(mqueueid).expect("close");
    client.unlink("pipe").expect("unlink");
    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_priority_order_with_fifo_ties() {
    // Higher priority first; equal priorities keep their send order.

    let (substrate, runtime, client) = boot();
    let mqueueid = client.create_excl("prio", 0o600).expect("create");

    client.send(mqueueid, b"low", 1).expect("send low");
    client.send(mqueueid, b"first-high", 7).expect("send high 1");
    client.send(mqueueid, b"second-high", 7).expect("send high 2");
    client.send(mqueueid, b"mid", 3).expect("send mid");

    let mut buf = vec![0u8; MQUEUE_MESSAGE_SIZE];
    let mut order = Vec::new();
    for _ in 0..4 {
        let (len, prio) = client.receive(mqueueid, &mut buf).expect("receive");
        order.push((String::from_utf8_lossy(&buf[..len]).into_owned(), prio));
    }
    assert_eq!(
        order,
        vec![
            ("first-high".to_string(), 7),
            ("second-high".to_string(), 7),
            ("mid".to_string(), 3),
            ("low".to_string(), 1),
        ]
    );

    client.close(mqueueid).expect("close");
    client.unlink("prio").expect("unlink");
    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_full_and_empty_return_again() {
    // The server never blocks: a full queue rejects sends, an empty queue
    // rejects receives, both with Again.

    let (substrate, runtime, client) = boot();
    let mqueueid = client.create_excl("bounded", 0o600).expect("create");

    let mut buf = vec![0u8; MQUEUE_MESSAGE_SIZE];
    assert!(matches!(
        client.receive(mqueueid, &mut buf),
        Err(NoctuaError::Again(_))
    ));

    for i in 0..MQUEUE_MESSAGE_MAX {
        client.send(mqueueid, &[i as u8; 8], 0).expect("send");
    }
    assert!(matches!(
        client.send(mqueueid, b"overflow", 0),
        Err(NoctuaError::Again(_))
    ));

    // Drain keeps FIFO order within the single priority.
    for i in 0..MQUEUE_MESSAGE_MAX {
        let (len, _) = client.receive(mqueueid, &mut buf).expect("drain");
        assert_eq!(&buf[..len], &[i as u8; 8]);
    }

    client.close(mqueueid).expect("close");
    client.unlink("bounded").expect("unlink");
    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_access_and_naming_rules() {
    // Access flags are per-node: the creator holds read-write, a read-only
    // opener may not send, a write-only opener may not receive.

    let (substrate, runtime, client) = boot();

    // The owner lives on node 10 so the accesses under test stay narrow.
    let fabric = substrate.fabric().clone();
    let server = substrate.config().servers.mqueue;
    let owner = substrate.fabric().spawn(10, move || {
        let rt = NodeRuntime::init(fabric, 10).expect("owner runtime");
        let client = MqueueClient::new(rt, server).expect("mqueue client");
        client.create_excl("acl", 0o600).expect("create");
        assert!(matches!(
            client.create_excl("acl", 0o600),
            Err(NoctuaError::AlreadyExists(_))
        ));
    });
    owner.join().unwrap();

    // Node 8: read-only.
    let reader = client.open("acl", true, false).expect("open reader");
    assert!(matches!(
        client.send(reader, b"nope", 0),
        Err(NoctuaError::PermissionDenied(_))
    ));
    let mut buf = vec![0u8; MQUEUE_MESSAGE_SIZE];
    assert!(matches!(
        client.receive(reader, &mut buf),
        Err(NoctuaError::Again(_))
    ));

    // Node 9: write-only.
    let fabric = substrate.fabric().clone();
    let writer = substrate.fabric().spawn(9, move || {
        let rt = NodeRuntime::init(fabric, 9).expect("writer runtime");
        let client = MqueueClient::new(rt, server).expect("mqueue client");
        let mqueueid = client.open("acl", false, true).expect("open writer");
        let mut buf = vec![0u8; 16];
        assert!(matches!(
            client.receive(mqueueid, &mut buf),
            Err(NoctuaError::PermissionDenied(_))
        ));
        client.close(mqueueid).expect("writer close");
    });
    writer.join().unwrap();

    assert!(matches!(
        client.open("missing", true, true),
        Err(NoctuaError::NotFound(_))
    ));
    // Strangers may not unlink.
    assert!(matches!(
        client.unlink("acl"),
        Err(NoctuaError::PermissionDenied(_))
    ));

    client.close(reader).expect("close reader");
    let fabric = substrate.fabric().clone();
    let cleanup = substrate.fabric().spawn(10, move || {
        let rt = NodeRuntime::init(fabric, 10).expect("owner runtime again");
        let client = MqueueClient::new(rt, server).expect("mqueue client");
        client.unlink("acl").expect("owner unlink");
    });
    cleanup.join().unwrap();

    substrate.shutdown(&runtime).expect("shutdown");
}
