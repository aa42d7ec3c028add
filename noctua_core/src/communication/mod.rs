//! # Communication layer for NOCTUA
//!
//! Three named-endpoint abstractions over the NoC fabric:
//!
//! - **Mailbox**: fixed-size short messages; one input mailbox per node.
//!   The control plane of every system service.
//! - **Portal**: bulk streaming with allow-based flow control; one input
//!   portal per node. The data plane for transfers larger than a frame.
//! - **Sync**: barrier-like signals, one-to-all (broadcast) or all-to-one
//!   (gather). Used at bootstrap and by collective clients.
//!
//! Every layer owns a fixed-size endpoint table with POSIX-like descriptor
//! ids, a layer-wide lock, and the busy/retry blocking discipline: no
//! suspension point holds the lock.
//!
//! ## Usage Patterns
//!
//! **Short control message:**
//! ```rust,no_run
//! # use noctua_core::{Fabric, NodeRuntime, MAILBOX_MSG_SIZE};
//! # let fabric = Fabric::new();
//! # let rt = NodeRuntime::init(fabric, 9).unwrap();
//! let outbox = rt.mailboxes().open(8).unwrap();
//! rt.mailboxes().write(outbox, &[0u8; MAILBOX_MSG_SIZE]).unwrap();
//! rt.mailboxes().close(outbox).unwrap();
//! ```
//!
//! **Bulk transfer (receiver side):**
//! ```rust,no_run
//! # use noctua_core::{Fabric, NodeRuntime};
//! # let fabric = Fabric::new();
//! # let rt = NodeRuntime::init(fabric, 8).unwrap();
//! let mut page = vec![0u8; 4096];
//! rt.portals().allow(rt.inportal(), 9).unwrap();
//! rt.portals().read(rt.inportal(), &mut page).unwrap();
//! ```

pub mod mailbox;
pub mod portal;
pub mod sync;

// Re-export commonly used types for convenience
pub use mailbox::{MailboxId, MailboxLayer};
pub use portal::{PortalId, PortalLayer};
pub use sync::{SyncId, SyncLayer, SyncMode};
