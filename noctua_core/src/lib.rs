//! # NOCTUA Core
//!
//! The core runtime substrate for the NOCTUA manycore operating system.
//!
//! NOCTUA targets NoC processors: clusters of compute cores connected by an
//! on-chip network, backed by a small number of I/O clusters that host system
//! services. This crate provides the fundamental building blocks:
//!
//! - **Topology**: stable node numbering over I/O and compute clusters
//! - **Fabric**: the in-process interconnect and node spawning
//! - **Communication**: mailbox, portal, and sync endpoints over the fabric
//! - **Resources**: fixed-size endpoint tables with the busy/retry discipline
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use noctua_core::{Fabric, NodeRuntime, MAILBOX_MSG_SIZE};
//!
//! let fabric = Fabric::new();
//! let receiver = fabric.clone();
//! fabric.spawn(8, move || {
//!     let rt = NodeRuntime::init(receiver, 8).unwrap();
//!     let mut frame = [0u8; MAILBOX_MSG_SIZE];
//!     rt.mailboxes().read(rt.inbox(), &mut frame).unwrap();
//! });
//! ```

pub mod bitmap;
pub mod communication;
pub mod config;
pub mod error;
pub mod fabric;
pub mod node;
pub mod resource;
pub mod topology;

// Re-export commonly used types for easy access
pub use communication::mailbox::{MailboxId, MailboxLayer, MAILBOX_MSG_SIZE, NR_MAILBOX};
pub use communication::portal::{PortalId, PortalLayer, NR_PORTAL, PORTAL_BUFFER_SIZE};
pub use communication::sync::{SyncId, SyncLayer, SyncMode, NR_SYNC};
pub use config::{FabricConfig, ServerMap, SubstrateConfig};
pub use error::{NoctuaError, NoctuaResult};
pub use fabric::{Fabric, Frame};
pub use node::NodeRuntime;
pub use topology::{NodeId, NR_NODES};
