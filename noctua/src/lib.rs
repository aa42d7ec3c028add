//! # NOCTUA - distributed runtime substrate for manycore NoC processors
//!
//! NOCTUA provides the runtime of a research operating system for NoC
//! processors: named-endpoint communication primitives, a stateful service
//! substrate, and a client-side remote page cache.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use noctua::prelude::*;
//!
//! let substrate = Substrate::launch(SubstrateConfig::default()).unwrap();
//! let runtime = NodeRuntime::init(substrate.fabric().clone(), 8).unwrap();
//!
//! let client = RmemClient::new(runtime.clone(), substrate.config()).unwrap();
//! let mut cache = RemoteCache::new(client, CacheConfig::default());
//! let page = cache.alloc().unwrap();
//! cache.get(page).unwrap()[0] = 42;
//! cache.put(page, 0).unwrap();
//! ```
//!
//! ## Features
//!
//! - **Mailboxes, portals, and sync points** over an in-process NoC fabric
//! - **System servers** for shared memory, semaphores, message queues,
//!   remote memory, and names
//! - **Pluggable page cache** with FIFO/LIFO/NFU/Aging/Bypass replacement

// Re-export core components
pub use noctua_core::{self, *};

// Re-export the service substrate with an alias
pub use noctua_services as services;

/// The NOCTUA prelude - everything you need to get started
pub mod prelude {
    // Node runtime
    pub use noctua_core::node::NodeRuntime;
    pub use noctua_core::topology::{NodeId, NR_NODES};

    // Communication types
    pub use noctua_core::communication::{MailboxLayer, PortalLayer, SyncLayer, SyncMode};
    pub use noctua_core::fabric::Fabric;

    // Configuration
    pub use noctua_core::config::SubstrateConfig;

    // Services
    pub use noctua_services::mqueue::MqueueClient;
    pub use noctua_services::name::NameClient;
    pub use noctua_services::rmem::{CacheConfig, RPage, RemoteCache, RmemClient};
    pub use noctua_services::semaphore::SemaphoreClient;
    pub use noctua_services::shm::ShmClient;
    pub use noctua_services::startup::Substrate;

    // Error types
    pub use noctua_core::error::{NoctuaError, NoctuaResult};
    pub type Result<T> = NoctuaResult<T>;
}
