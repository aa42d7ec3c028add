//! Acceptance tests for the shared memory service
//! Drives a real server over the fabric from client nodes.

use noctua_core::{NodeRuntime, NoctuaError, SubstrateConfig};
use noctua_services::shm::ShmClient;
use noctua_services::Substrate;

fn boot() -> (Substrate, std::sync::Arc<NodeRuntime>, ShmClient) {
    let substrate = Substrate::launch(SubstrateConfig::default()).expect("substrate");
    let runtime = NodeRuntime::init(substrate.fabric().clone(), 8).expect("client runtime");
    let server = substrate.config().servers.shm;
    let client = ShmClient::new(runtime.clone(), server);
    (substrate, runtime, client)
}

#[test]
fn test_scenario_create_truncate_map_from_two_nodes() {
    // S2: create exclusively, truncate, map; a second node opens read-only
    // and maps to the same address.

    let (substrate, runtime, client) = boot();

    let id = client.create_excl("r", true, 0o600).expect("create_excl");
    assert!(matches!(
        client.create_excl("r", true, 0o600),
        Err(NoctuaError::AlreadyExists(_))
    ));

    let id2 = client.open("r", true, false).expect("open");
    client.truncate(id2, 4096).expect("truncate");
    let base = client.map(id2, 4096, true, true, 0).expect("map");

    // Second node: read-only open and map resolve to the same base.
    let fabric = substrate.fabric().clone();
    let server = substrate.config().servers.shm;
    let peer = substrate.fabric().spawn(9, move || {
        let rt = NodeRuntime::init(fabric, 9).expect("peer runtime");
        let client = ShmClient::new(rt, server);
        let oshmid = client.open("r", false, false).expect("peer open");
        let peer_base = client.map(oshmid, 4096, false, false, 0).expect("peer map");
        assert_eq!(peer_base, base);
        client.unmap(oshmid).expect("peer unmap");
        client.close(oshmid).expect("peer close");
    });
    peer.join().unwrap();

    client.unmap(id2).expect("unmap");
    client.close(id2).expect("close dup");
    client.close(id).expect("close");
    client.unlink("r").expect("unlink");

    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_naming_rules() {
    // create(n); open(n) resolves; unlink(n); open(n) is NotFound.

    let (substrate, runtime, client) = boot();

    let created = client.create("region", true, 0o600).expect("create");
    let opened = client.open("region", false, false).expect("open");
    client.close(opened).expect("close opened");
    client.close(created).expect("close created");

    client.unlink("region").expect("unlink");
    assert!(matches!(
        client.open("region", false, false),
        Err(NoctuaError::NotFound(_))
    ));

    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_map_rules() {
    // writable map needs a writable open; truncate needs no live mapping;
    // the range must fit the region.

    let (substrate, runtime, client) = boot();

    let writer = client.create_excl("rules", true, 0o600).expect("create");
    client.truncate(writer, 8192).expect("truncate");

    let reader = client.open("rules", false, false).expect("open ro");
    assert!(matches!(
        client.map(reader, 4096, true, false, 0),
        Err(NoctuaError::PermissionDenied(_))
    ));

    // Out-of-range mappings are rejected.
    assert!(client.map(writer, 8192, true, false, 4096).is_err());
    assert!(client.map(writer, 16384, true, false, 0).is_err());

    // A live mapping blocks truncation.
    client.map(writer, 4096, true, false, 0).expect("map");
    assert!(matches!(
        client.truncate(writer, 4096),
        Err(NoctuaError::Busy(_))
    ));
    client.unmap(writer).expect("unmap");
    client.truncate(writer, 4096).expect("truncate after unmap");

    client.close(reader).expect("close reader");
    client.close(writer).expect("close writer");
    client.unlink("rules").expect("unlink");

    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_unlink_is_owner_only_and_deferred() {
    // A stranger's unlink is rejected; the owner's unlink with a live
    // holder defers the removal until the holder closes.

    let (substrate, runtime, client) = boot();
    let id = client.create_excl("owned", true, 0o600).expect("create");

    let fabric = substrate.fabric().clone();
    let server = substrate.config().servers.shm;
    let (oshmid_tx, oshmid_rx) = std::sync::mpsc::channel();
    let holder = substrate.fabric().spawn(10, move || {
        let rt = NodeRuntime::init(fabric, 10).expect("holder runtime");
        let client = ShmClient::new(rt, server);
        let oshmid = client.open("owned", false, false).expect("holder open");
        assert!(matches!(
            client.unlink("owned"),
            Err(NoctuaError::PermissionDenied(_))
        ));
        oshmid_tx.send(oshmid).expect("report oshmid");
    });
    holder.join().unwrap();
    let holder_id = oshmid_rx.recv().expect("holder oshmid");

    // Owner unlinks; the name is gone, but the peer's open id still works
    // until it closes.
    client.unlink("owned").expect("owner unlink");
    let _ = id;
    assert!(matches!(
        client.open("owned", false, false),
        Err(NoctuaError::NotFound(_))
    ));

    let fabric = substrate.fabric().clone();
    let closer = substrate.fabric().spawn(10, move || {
        let rt = NodeRuntime::init(fabric, 10).expect("holder runtime again");
        let client = ShmClient::new(rt, server);
        client.close(holder_id).expect("deferred close");
    });
    closer.join().unwrap();

    // The slot is free again.
    let id = client.create_excl("owned", true, 0o600).expect("recreate");
    client.close(id).expect("close");
    client.unlink("owned").expect("unlink");

    substrate.shutdown(&runtime).expect("shutdown");
}
