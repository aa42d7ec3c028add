//! # NOCTUA Services
//!
//! The stateful service substrate of NOCTUA: system servers hosted on
//! dedicated I/O nodes, driven by a request/response protocol layered on
//! mailboxes (control plane) and portals (data plane).
//!
//! - **shm**: named shared memory regions with map/unmap/truncate
//! - **semaphore**: named counting semaphores with FIFO sleep queues
//! - **mqueue**: priority-ordered bounded message queues
//! - **rmem**: remote memory block stores plus the client page cache
//! - **name**: node-name bindings
//! - **startup**: server bootstrap and the alive fence
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use noctua_core::{NodeRuntime, SubstrateConfig};
//! use noctua_services::rmem::{RemoteCache, RmemClient};
//! use noctua_services::startup::Substrate;
//!
//! let substrate = Substrate::launch(SubstrateConfig::default()).unwrap();
//! let rt = NodeRuntime::init(substrate.fabric().clone(), 8).unwrap();
//! let client = RmemClient::new(rt, substrate.config()).unwrap();
//! let mut cache = RemoteCache::new(client, Default::default());
//! let page = cache.alloc().unwrap();
//! cache.get(page).unwrap()[0] = 42;
//! cache.put(page, 0).unwrap();
//! ```

pub mod mqueue;
pub mod name;
pub mod protocol;
pub mod rmem;
pub mod semaphore;
pub mod shm;
pub mod startup;

// Re-export commonly used types for easy access
pub use protocol::RequestBuffer;
pub use rmem::{CacheConfig, RemoteCache, ReplacementPolicy, RmemClient, RPage, WritePolicy};
pub use startup::Substrate;
