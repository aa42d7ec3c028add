//! Per-node runtime state
//!
//! Every node owns one input mailbox and one input portal, initialized once
//! at startup and torn down once at shutdown. The [`NodeRuntime`] bundles
//! them with the node's endpoint tables and is shared by every worker thread
//! of the node.

use crate::communication::mailbox::{MailboxId, MailboxLayer};
use crate::communication::portal::{PortalId, PortalLayer};
use crate::communication::sync::SyncLayer;
use crate::error::NoctuaResult;
use crate::fabric::Fabric;
use crate::topology::NodeId;
use std::sync::Arc;

/// Process-wide runtime of a single node.
pub struct NodeRuntime {
    node: NodeId,
    fabric: Arc<Fabric>,
    mailboxes: MailboxLayer,
    portals: PortalLayer,
    syncs: SyncLayer,
    inbox: MailboxId,
    inportal: PortalId,
}

impl NodeRuntime {
    /// Brings the node online: builds the endpoint tables and creates the
    /// input mailbox and input portal.
    pub fn init(fabric: Arc<Fabric>, node: NodeId) -> NoctuaResult<Arc<Self>> {
        let mailboxes = MailboxLayer::new(fabric.clone(), node);
        let portals = PortalLayer::new(fabric.clone(), node);
        let syncs = SyncLayer::new(fabric.clone(), node);

        let inbox = mailboxes.create(node)?;
        let inportal = portals.create(node)?;

        log::info!("node {node}: runtime online");
        Ok(Arc::new(Self {
            node,
            fabric,
            mailboxes,
            portals,
            syncs,
            inbox,
            inportal,
        }))
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn mailboxes(&self) -> &MailboxLayer {
        &self.mailboxes
    }

    pub fn portals(&self) -> &PortalLayer {
        &self.portals
    }

    pub fn syncs(&self) -> &SyncLayer {
        &self.syncs
    }

    /// The node's standard input mailbox.
    pub fn inbox(&self) -> MailboxId {
        self.inbox
    }

    /// The node's standard input portal.
    pub fn inportal(&self) -> PortalId {
        self.inportal
    }

    /// Takes the node offline, destroying the input endpoints.
    ///
    /// Calling this twice is an error, as is using the runtime afterwards.
    pub fn shutdown(&self) -> NoctuaResult<()> {
        self.mailboxes.unlink(self.inbox)?;
        self.portals.unlink(self.inportal)?;
        log::info!("node {}: runtime offline", self.node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_claims_input_endpoints() {
        let fabric = Fabric::with_nodes(4);
        let rt = NodeRuntime::init(fabric, 2).unwrap();
        // The standard endpoints exist, so creating them again collides.
        assert!(rt.mailboxes().create(2).is_err());
        assert!(rt.portals().create(2).is_err());
    }

    #[test]
    fn test_shutdown_is_one_shot() {
        let fabric = Fabric::with_nodes(4);
        let rt = NodeRuntime::init(fabric, 1).unwrap();
        rt.shutdown().unwrap();
        assert!(rt.shutdown().is_err());
    }
}
