//! Acceptance tests for the remote memory service
//! Covers allocation, ownership, fail-soft transfers, and both data paths.

use noctua_core::config::RmemDataPath;
use noctua_core::{NodeRuntime, NoctuaError, SubstrateConfig};
use noctua_services::rmem::{RPage, RmemClient, RMEM_BLOCK_SIZE};
use noctua_services::Substrate;
use std::sync::Arc;

fn boot(data_path: RmemDataPath) -> (Substrate, Arc<NodeRuntime>, RmemClient) {
    let mut config = SubstrateConfig::default();
    config.rmem_data_path = data_path;
    let substrate = Substrate::launch(config).expect("substrate");
    let runtime = NodeRuntime::init(substrate.fabric().clone(), 8).expect("client runtime");
    let client = RmemClient::new(runtime.clone(), substrate.config()).expect("client");
    (substrate, runtime, client)
}

fn write_read_round_trip(data_path: RmemDataPath) {
    let (substrate, runtime, client) = boot(data_path);

    let page = client.alloc().expect("alloc");
    let data: Vec<u8> = (0..RMEM_BLOCK_SIZE).map(|i| (i % 253) as u8).collect();
    client.write(page, &data).expect("write");

    let mut back = vec![0u8; RMEM_BLOCK_SIZE];
    client.read(page, &mut back).expect("read");
    assert_eq!(back, data);

    client.free(page).expect("free");
    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_round_trip_over_portal() {
    write_read_round_trip(RmemDataPath::Portal);
}

#[test]
fn test_round_trip_over_chunked_mailbox() {
    write_read_round_trip(RmemDataPath::Mailbox);
}

#[test]
fn test_scenario_free_middle_block_and_ownership() {
    // S4: allocate three blocks, free the middle one, allocate again: the
    // freed block number comes back. A stranger's free faults and leaves
    // the allocation intact.

    let (substrate, runtime, client) = boot(RmemDataPath::Portal);

    let first = client.alloc().expect("alloc 1");
    let middle = client.alloc().expect("alloc 2");
    let last = client.alloc().expect("alloc 3");
    client.free(middle).expect("free middle");

    let again = client.alloc().expect("alloc again");
    assert_eq!(again, middle, "first-free scan must reuse the middle block");

    // Client B on another node must not free A's blocks.
    let fabric = substrate.fabric().clone();
    let stranger = substrate.fabric().spawn(9, move || {
        let rt = NodeRuntime::init(fabric, 9).expect("stranger runtime");
        let config = SubstrateConfig::default();
        let client = RmemClient::new(rt, &config).expect("stranger client");
        for page in [first, again, last] {
            assert!(matches!(
                client.free(page),
                Err(NoctuaError::Faulted(_))
            ));
        }
    });
    stranger.join().unwrap();

    // Still owned and freeable by A.
    for page in [first, again, last] {
        client.free(page).expect("owner free");
    }

    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_fail_soft_read_of_unallocated_block() {
    // Reading an unallocated block faults but still delivers block-0 bytes.

    let (substrate, runtime, client) = boot(RmemDataPath::Portal);

    let mut buf = vec![0xAAu8; RMEM_BLOCK_SIZE];
    let bogus = RPage::new(0, 77);
    let err = client.read(bogus, &mut buf).expect_err("fault expected");
    assert!(err.is_faulted());
    // Block 0 is zero-filled, and the transfer still happened.
    assert!(buf.iter().all(|&b| b == 0));

    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_fail_soft_write_lands_in_block_zero() {
    // Writing an unallocated block faults, does not corrupt real blocks,
    // and the bytes land in the reserved block.

    let (substrate, runtime, client) = boot(RmemDataPath::Portal);

    let page = client.alloc().expect("alloc");
    let data = vec![0x5Au8; RMEM_BLOCK_SIZE];
    client.write(page, &data).expect("write");

    let bogus = RPage::new(0, 99);
    let err = client
        .write(bogus, &vec![0xFFu8; RMEM_BLOCK_SIZE])
        .expect_err("fault expected");
    assert!(err.is_faulted());

    // The real block is untouched.
    let mut back = vec![0u8; RMEM_BLOCK_SIZE];
    client.read(page, &mut back).expect("read");
    assert_eq!(back, data);

    client.free(page).expect("free");
    substrate.shutdown(&runtime).expect("shutdown");
}

#[test]
fn test_double_free_faults() {
    let (substrate, runtime, client) = boot(RmemDataPath::Portal);

    let page = client.alloc().expect("alloc");
    client.free(page).expect("free");
    assert!(matches!(client.free(page), Err(NoctuaError::Faulted(_))));

    // The null page is never freeable.
    assert!(matches!(
        client.free(RPage::NULL),
        Err(NoctuaError::Faulted(_))
    ));

    substrate.shutdown(&runtime).expect("shutdown");
}
