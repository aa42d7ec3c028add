//! In-process NoC fabric
//!
//! The communication layers are written against this fabric, which emulates
//! the on-chip interconnect inside a single process: every node is a thread,
//! and the wires are channels and shared buffer slots. The hardware-specific
//! cluster-spawning glue reduces to [`Fabric::spawn`].
//!
//! Planes:
//!
//! - **mailbox plane**: one bounded frame channel per node, in-order,
//!   blocking on both ends;
//! - **portal plane**: one buffer slot per (receiver, sender) pair with the
//!   `online/ready/busy` handshake driven by the portal layer;
//! - **sync plane**: one broadcast hub and one gather hub per node, carrying
//!   bare sender ids;
//! - **fence plane**: one "server alive" gate per node.

use crate::error::{NoctuaError, NoctuaResult};
use crate::topology::{NodeId, NR_NODES};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Size of a mailbox frame, in bytes.
pub const MAILBOX_MSG_SIZE: usize = 128;

/// Capacity of a portal buffer slot, in bytes.
pub const PORTAL_BUFFER_SIZE: usize = 65536;

/// A mailbox frame.
pub type Frame = [u8; MAILBOX_MSG_SIZE];

/// Per-(receiver, sender) portal buffer slot.
///
/// Slot state machine (driven by the portal layer):
/// `offline -> online -> allowed (ready) -> written (busy) -> online`.
#[derive(Default)]
struct PortalSlot {
    online: bool,
    ready: bool,
    busy: bool,
    nbytes: usize,
    data: Vec<u8>,
}

struct PortalCell {
    slot: Mutex<PortalSlot>,
    cond: Condvar,
}

impl Default for PortalCell {
    fn default() -> Self {
        Self {
            slot: Mutex::new(PortalSlot::default()),
            cond: Condvar::new(),
        }
    }
}

/// One-shot "server alive" gate.
struct AliveGate {
    up: Mutex<bool>,
    cond: Condvar,
}

impl Default for AliveGate {
    fn default() -> Self {
        Self {
            up: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

/// Wires attached to a single node.
struct NodeLink {
    mbox_tx: Sender<Frame>,
    mbox_rx: Receiver<Frame>,
    /// Portal buffer slots, indexed by sender node.
    portals: Vec<PortalCell>,
    /// Broadcast hub rooted at this node.
    bcast_tx: Sender<NodeId>,
    bcast_rx: Receiver<NodeId>,
    /// Gather hub rooted at this node.
    gather_tx: Sender<NodeId>,
    gather_rx: Receiver<NodeId>,
    alive: AliveGate,
}

impl NodeLink {
    fn new(nnodes: usize) -> Self {
        // A peer's queue holds at most one in-flight frame per node, like the
        // underlying NoC connectors.
        let (mbox_tx, mbox_rx) = bounded(nnodes);
        let (bcast_tx, bcast_rx) = unbounded();
        let (gather_tx, gather_rx) = unbounded();
        Self {
            mbox_tx,
            mbox_rx,
            portals: (0..nnodes).map(|_| PortalCell::default()).collect(),
            bcast_tx,
            bcast_rx,
            gather_tx,
            gather_rx,
            alive: AliveGate::default(),
        }
    }
}

/// Synchronization hub direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHub {
    Broadcast,
    Gather,
}

/// The in-process interconnect.
pub struct Fabric {
    links: Vec<NodeLink>,
}

impl Fabric {
    /// Builds a fabric wiring up the full processor topology.
    pub fn new() -> Arc<Self> {
        Self::with_nodes(NR_NODES)
    }

    /// Builds a fabric with a custom node count (testing rigs).
    pub fn with_nodes(nnodes: usize) -> Arc<Self> {
        Arc::new(Self {
            links: (0..nnodes).map(|_| NodeLink::new(nnodes)).collect(),
        })
    }

    pub fn nnodes(&self) -> usize {
        self.links.len()
    }

    fn link(&self, node: NodeId) -> NoctuaResult<&NodeLink> {
        self.links
            .get(node)
            .ok_or_else(|| NoctuaError::invalid(format!("node {node} out of range")))
    }

    // ============================================================================
    // mailbox plane
    // ============================================================================

    /// Connector for sending frames to `node`'s input queue.
    pub fn mailbox_sender(&self, node: NodeId) -> NoctuaResult<Sender<Frame>> {
        Ok(self.link(node)?.mbox_tx.clone())
    }

    /// Connector for draining `node`'s input queue.
    pub fn mailbox_receiver(&self, node: NodeId) -> NoctuaResult<Receiver<Frame>> {
        Ok(self.link(node)?.mbox_rx.clone())
    }

    // ============================================================================
    // portal plane
    // ============================================================================

    /// Brings the (receiver, sender) slot online or offline.
    pub fn portal_set_online(
        &self,
        receiver: NodeId,
        sender: NodeId,
        online: bool,
    ) -> NoctuaResult<()> {
        let cell = &self.link(receiver)?.portals[sender];
        let mut slot = cell.slot.lock();
        slot.online = online;
        if !online {
            slot.ready = false;
            slot.busy = false;
            slot.nbytes = 0;
        }
        cell.cond.notify_all();
        Ok(())
    }

    /// Arms the (receiver, sender) slot for one transfer.
    ///
    /// Only legal from `online(ready=0, busy=0)`.
    pub fn portal_allow(&self, receiver: NodeId, sender: NodeId) -> NoctuaResult<()> {
        let cell = &self.link(receiver)?.portals[sender];
        let mut slot = cell.slot.lock();
        if !slot.online {
            return Err(NoctuaError::invalid(format!(
                "portal peer {sender} is not online"
            )));
        }
        if slot.busy || slot.ready {
            return Err(NoctuaError::invalid(format!(
                "portal slot for peer {sender} is mid-transfer"
            )));
        }
        slot.ready = true;
        cell.cond.notify_all();
        Ok(())
    }

    /// Writes `data` into the (receiver, sender) slot.
    ///
    /// Blocks until the receiver has allowed a transfer from `sender`.
    pub fn portal_write(
        &self,
        receiver: NodeId,
        sender: NodeId,
        data: &[u8],
    ) -> NoctuaResult<usize> {
        if data.len() > PORTAL_BUFFER_SIZE {
            return Err(NoctuaError::invalid(format!(
                "portal transfer of {} bytes exceeds the buffer",
                data.len()
            )));
        }
        let cell = &self.link(receiver)?.portals[sender];
        let mut slot = cell.slot.lock();
        while !slot.ready {
            if !slot.online {
                return Err(NoctuaError::invalid("portal went offline"));
            }
            cell.cond.wait(&mut slot);
        }
        slot.data.clear();
        slot.data.extend_from_slice(data);
        slot.nbytes = data.len();
        slot.ready = false;
        slot.busy = true;
        cell.cond.notify_all();
        Ok(data.len())
    }

    /// Reads the pending transfer out of the (receiver, sender) slot.
    ///
    /// Blocks until the sender has completed its write.
    pub fn portal_read(
        &self,
        receiver: NodeId,
        sender: NodeId,
        buf: &mut [u8],
    ) -> NoctuaResult<usize> {
        let cell = &self.link(receiver)?.portals[sender];
        let mut slot = cell.slot.lock();
        while !slot.busy {
            cell.cond.wait(&mut slot);
        }
        let nbytes = slot.nbytes.min(buf.len());
        buf[..nbytes].copy_from_slice(&slot.data[..nbytes]);
        slot.busy = false;
        slot.nbytes = 0;
        cell.cond.notify_all();
        Ok(nbytes)
    }

    /// Clears any armed or pending transfer towards `receiver`.
    ///
    /// Used when the input portal is unlinked.
    pub fn portal_reset_receiver(&self, receiver: NodeId) -> NoctuaResult<()> {
        for cell in &self.link(receiver)?.portals {
            let mut slot = cell.slot.lock();
            slot.ready = false;
            slot.busy = false;
            slot.nbytes = 0;
            cell.cond.notify_all();
        }
        Ok(())
    }

    // ============================================================================
    // sync plane
    // ============================================================================

    /// Signal connector of the hub rooted at `root`.
    pub fn sync_sender(&self, root: NodeId, hub: SyncHub) -> NoctuaResult<Sender<NodeId>> {
        let link = self.link(root)?;
        Ok(match hub {
            SyncHub::Broadcast => link.bcast_tx.clone(),
            SyncHub::Gather => link.gather_tx.clone(),
        })
    }

    /// Wait connector of the hub rooted at `root`.
    pub fn sync_receiver(&self, root: NodeId, hub: SyncHub) -> NoctuaResult<Receiver<NodeId>> {
        let link = self.link(root)?;
        Ok(match hub {
            SyncHub::Broadcast => link.bcast_rx.clone(),
            SyncHub::Gather => link.gather_rx.clone(),
        })
    }

    // ============================================================================
    // fence plane
    // ============================================================================

    /// Marks the server hosted on `node` as alive.
    pub fn fence_signal(&self, node: NodeId) -> NoctuaResult<()> {
        let gate = &self.link(node)?.alive;
        let mut up = gate.up.lock();
        *up = true;
        gate.cond.notify_all();
        Ok(())
    }

    /// Blocks until the server hosted on `node` has signalled.
    pub fn fence_wait(&self, node: NodeId) -> NoctuaResult<()> {
        let gate = &self.link(node)?.alive;
        let mut up = gate.up.lock();
        while !*up {
            gate.cond.wait(&mut up);
        }
        Ok(())
    }

    // ============================================================================
    // spawn
    // ============================================================================

    /// Runs `f` on a thread standing in for `node`.
    pub fn spawn<F>(self: &Arc<Self>, node: NodeId, f: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        std::thread::Builder::new()
            .name(format!("noctua-node-{node}"))
            .spawn(f)
            .expect("failed to spawn node thread")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_plane_is_fifo() {
        let fabric = Fabric::with_nodes(2);
        let tx = fabric.mailbox_sender(1).unwrap();
        let rx = fabric.mailbox_receiver(1).unwrap();
        for byte in 0..3u8 {
            let mut frame = [0u8; MAILBOX_MSG_SIZE];
            frame[0] = byte;
            tx.send(frame).unwrap();
        }
        for byte in 0..3u8 {
            assert_eq!(rx.recv().unwrap()[0], byte);
        }
    }

    #[test]
    fn test_portal_handshake() {
        let fabric = Fabric::with_nodes(2);
        fabric.portal_set_online(0, 1, true).unwrap();

        // Writing is only possible once the receiver has allowed.
        assert!(fabric.portal_allow(0, 1).is_ok());
        assert_eq!(fabric.portal_write(0, 1, b"hello").unwrap(), 5);

        let mut buf = [0u8; 16];
        assert_eq!(fabric.portal_read(0, 1, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        // Slot went back to plain online: a second allow is legal again.
        assert!(fabric.portal_allow(0, 1).is_ok());
    }

    #[test]
    fn test_portal_allow_rejects_offline_and_armed() {
        let fabric = Fabric::with_nodes(2);
        assert!(fabric.portal_allow(0, 1).is_err());
        fabric.portal_set_online(0, 1, true).unwrap();
        fabric.portal_allow(0, 1).unwrap();
        assert!(fabric.portal_allow(0, 1).is_err());
    }

    #[test]
    fn test_fence_gate() {
        let fabric = Fabric::with_nodes(2);
        let peer = fabric.clone();
        let handle = fabric.spawn(1, move || {
            peer.fence_signal(1).unwrap();
        });
        fabric.fence_wait(1).unwrap();
        handle.join().unwrap();
    }
}
