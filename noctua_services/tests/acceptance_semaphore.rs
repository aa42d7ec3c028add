//! Acceptance tests for the semaphore service
//! Exercises blocking waits across fabric-spawned client nodes.

use noctua_core::{NodeRuntime, NoctuaError, SubstrateConfig};
use noctua_services::semaphore::SemaphoreClient;
use noctua_services::Substrate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn boot() -> (Substrate, Arc<NodeRuntime>, SemaphoreClient) {
    let substrate = Substrate::launch(SubstrateConfig::default()).expect("substrate");
    let runtime = NodeRuntime::init(substrate.fabric().clone(), 8).expect("client runtime");
    let server = substrate.config().servers.semaphore;
    let client = SemaphoreClient::new(runtime.clone(), server);
    (substrate, runtime, client)
}

#[test]
fn test_scenario_two_clients_wait_post() {
    // S3: two clients each wait and post on a semaphore initialized to 1.
    // Both complete, and afterwards a third wait succeeds immediately
    // (count is back to 1).

    let (substrate, runtime, client) = boot();
    client.create_excl("s3", 0o600, 1).expect("create");

    let fabric = substrate.fabric().clone();
    let server = substrate.config().servers.semaphore;
    let peer = substrate.fabric().spawn(9, move || {
        let rt = NodeRuntime::init(fabric, 9).expect("peer runtime");
        let client = SemaphoreClient::new(rt, server);
        let semid = client.open("s3").expect("peer open");
        client.wait(semid).expect("peer wait");
        client.post(semid).expect("peer post");
        client.close(semid).expect("peer close");
    });

    let semid = client.open("s3").expect("open");
    client.wait(semid).expect("wait");
    client.post(semid).expect("post");
    peer.join().unwrap();

    // Count settled back to its initial value.
    client.wait(semid).expect("wait on settled count");
    client.post(semid).expect("post back");

    client.close(semid).expect("close");
    client.unlink("s3").expect("unlink");
    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_wait_blocks_until_post() {
    // One client holds the only unit; the other's wait stays blocked until
    // a post arrives.

    let (substrate, runtime, client) = boot();
    let semid = client.create_excl("gate", 0o600, 1).expect("create");
    client.wait(semid).expect("take the unit");

    let order = Arc::new(AtomicUsize::new(0));
    let fabric = substrate.fabric().clone();
    let server = substrate.config().servers.semaphore;
    let order2 = order.clone();
    let waiter = substrate.fabric().spawn(9, move || {
        let rt = NodeRuntime::init(fabric, 9).expect("waiter runtime");
        let client = SemaphoreClient::new(rt, server);
        let semid = client.open("gate").expect("waiter open");
        client.wait(semid).expect("blocked wait");
        order2.store(2, Ordering::SeqCst);
        client.post(semid).expect("waiter post");
        client.close(semid).expect("waiter close");
    });

    // The waiter must still be parked.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(order.load(Ordering::SeqCst), 0, "wait returned early");
    order.store(1, Ordering::SeqCst);

    client.post(semid).expect("releasing post");
    waiter.join().unwrap();
    assert_eq!(order.load(Ordering::SeqCst), 2);

    client.close(semid).expect("close");
    client.unlink("gate").expect("unlink");
    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_fifo_wakeup_order() {
    // Two parked waiters are released strictly in arrival order.

    let (substrate, runtime, client) = boot();
    let semid = client.create_excl("fifo", 0o600, 0).expect("create");

    let woken: Arc<parking_lot::Mutex<Vec<usize>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let server = substrate.config().servers.semaphore;

    let mut waiters = Vec::new();
    for node in [9usize, 10] {
        let fabric = substrate.fabric().clone();
        let woken2 = woken.clone();
        waiters.push(substrate.fabric().spawn(node, move || {
            let rt = NodeRuntime::init(fabric, node).expect("waiter runtime");
            let client = SemaphoreClient::new(rt, server);
            let semid = client.open("fifo").expect("waiter open");
            client.wait(semid).expect("parked wait");
            woken2.lock().push(node);
            client.close(semid).expect("waiter close");
        }));
        // Park node 9 strictly before node 10.
        std::thread::sleep(Duration::from_millis(100));
    }

    client.post(semid).expect("post 1");
    std::thread::sleep(Duration::from_millis(100));
    client.post(semid).expect("post 2");
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(*woken.lock(), vec![9, 10], "wakeups must be FIFO");

    client.close(semid).expect("close");
    client.unlink("fifo").expect("unlink");
    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_naming_and_validation() {
    let (substrate, runtime, client) = boot();

    let created = client.create_excl("named", 0o600, 1).expect("create");
    assert!(matches!(
        client.create_excl("named", 0o600, 1),
        Err(NoctuaError::AlreadyExists(_))
    ));
    // Opening by name resolves to the created descriptor.
    assert_eq!(client.open("named").expect("open"), created);
    assert!(matches!(
        client.open("missing"),
        Err(NoctuaError::NotFound(_))
    ));
    // Initial value above SEM_VALUE_MAX.
    assert!(matches!(
        client.create_excl("huge", 0o600, 40000),
        Err(NoctuaError::Invalid(_))
    ));
    // Wait on a semaphore this node never opened.
    assert!(client.wait(99).is_err());

    client.unlink("named").expect("unlink");
    assert!(matches!(
        client.unlink("named"),
        Err(NoctuaError::NotFound(_))
    ));

    substrate.shutdown(&runtime).expect("shutdown");
}
