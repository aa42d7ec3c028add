//! Portal endpoints - bulk transfers with allow-based flow control
//!
//! A portal moves up to [`PORTAL_BUFFER_SIZE`] bytes per transfer. Unlike
//! mailboxes, portals are receiver-driven: the reader must `allow` one
//! transfer from a specific peer before that peer's `write` can make
//! progress. Transfers larger than a mailbox frame must always use portals;
//! short control messages belong on mailboxes.

use crate::error::{NoctuaError, NoctuaResult};
use crate::fabric::Fabric;
use crate::resource::ResourcePool;
use crate::topology::NodeId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

pub use crate::fabric::PORTAL_BUFFER_SIZE;

/// Number of portal descriptors per node.
pub const NR_PORTAL: usize = 64;

/// Portal descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortalId(pub(crate) usize);

#[derive(Default)]
struct PortalSlotEntry {
    /// Output: the receiving node. Input: the local node.
    remote: NodeId,
    /// Input only: peer allowed to perform the next transfer.
    armed: Option<NodeId>,
    refcount: usize,
    volume: usize,
    latency_ns: u64,
}

struct Inner {
    pool: ResourcePool,
    slots: Vec<PortalSlotEntry>,
}

/// Table of portal endpoints owned by one node.
pub struct PortalLayer {
    node: NodeId,
    fabric: Arc<Fabric>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl PortalLayer {
    pub fn new(fabric: Arc<Fabric>, node: NodeId) -> Self {
        Self {
            node,
            fabric,
            inner: Mutex::new(Inner {
                pool: ResourcePool::new(NR_PORTAL),
                slots: (0..NR_PORTAL).map(|_| PortalSlotEntry::default()).collect(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Creates the input portal of this node.
    pub fn create(&self, local: NodeId) -> NoctuaResult<PortalId> {
        if local != self.node {
            return Err(NoctuaError::invalid(format!(
                "input portal must be local (local={local}, node={})",
                self.node
            )));
        }

        let mut inner = self.inner.lock();

        for (id, entry) in inner.pool.iter_used() {
            if entry.is_readable() && inner.slots[id].remote == local {
                return Err(NoctuaError::already_exists(format!(
                    "input portal of node {local}"
                )));
            }
        }

        let id = inner
            .pool
            .alloc()
            .ok_or_else(|| NoctuaError::again("portal table is full"))?;
        inner.slots[id] = PortalSlotEntry {
            remote: local,
            armed: None,
            refcount: 1,
            volume: 0,
            latency_ns: 0,
        };
        inner.pool.get_mut(id).set_rdonly();

        log::debug!("node {}: created input portal {id}", self.node);
        Ok(PortalId(id))
    }

    /// Opens an output portal towards `remote` and brings the peer slot
    /// online.
    pub fn open(&self, remote: NodeId) -> NoctuaResult<PortalId> {
        if remote == self.node {
            return Err(NoctuaError::invalid("cannot open a portal to self"));
        }
        if remote >= self.fabric.nnodes() {
            return Err(NoctuaError::invalid(format!("bad remote node {remote}")));
        }

        let mut inner = self.inner.lock();

        // Duplicate an existing descriptor if we can.
        loop {
            let existing = inner
                .pool
                .iter_used()
                .find(|(id, entry)| entry.is_writable() && inner.slots[*id].remote == remote)
                .map(|(id, entry)| (id, entry.is_busy()));
            match existing {
                Some((id, false)) => {
                    inner.slots[id].refcount += 1;
                    return Ok(PortalId(id));
                }
                Some((_, true)) => self.cond.wait(&mut inner),
                None => break,
            }
        }

        let id = inner
            .pool
            .alloc()
            .ok_or_else(|| NoctuaError::again("portal table is full"))?;
        self.fabric.portal_set_online(remote, self.node, true)?;

        inner.slots[id] = PortalSlotEntry {
            remote,
            armed: None,
            refcount: 1,
            volume: 0,
            latency_ns: 0,
        };
        inner.pool.get_mut(id).set_wronly();

        log::debug!("node {}: opened output portal {id} to {remote}", self.node);
        Ok(PortalId(id))
    }

    /// Arms the input portal for one transfer from `remote`.
    pub fn allow(&self, portalid: PortalId, remote: NodeId) -> NoctuaResult<()> {
        if remote == self.node || remote >= self.fabric.nnodes() {
            return Err(NoctuaError::invalid(format!("bad remote node {remote}")));
        }

        let mut inner = self.acquire_endpoint(portalid, Direction::Input)?;
        if inner.slots[portalid.0].armed.is_some() {
            return Err(NoctuaError::invalid("portal already has an allowed peer"));
        }

        self.fabric.portal_allow(self.node, remote)?;
        inner.slots[portalid.0].armed = Some(remote);
        Ok(())
    }

    /// Reads the transfer of the allowed peer. Blocks until the peer has
    /// written.
    pub fn read(&self, portalid: PortalId, buf: &mut [u8]) -> NoctuaResult<usize> {
        if buf.len() > PORTAL_BUFFER_SIZE {
            return Err(NoctuaError::invalid(format!(
                "portal reads are bounded by {PORTAL_BUFFER_SIZE} bytes"
            )));
        }

        let remote = {
            let mut inner = self.acquire_endpoint(portalid, Direction::Input)?;
            let remote = inner.slots[portalid.0]
                .armed
                .ok_or_else(|| NoctuaError::invalid("no transfer was allowed"))?;
            inner.pool.get_mut(portalid.0).set_busy();
            remote
        };

        // The lock is released here: the read may sleep until the peer
        // writes.
        let t0 = Instant::now();
        let result = self.fabric.portal_read(self.node, remote, buf);
        let elapsed = t0.elapsed().as_nanos() as u64;

        let mut inner = self.inner.lock();
        inner.pool.get_mut(portalid.0).set_notbusy();
        inner.slots[portalid.0].armed = None;
        self.cond.notify_all();

        let nbytes = result?;
        inner.slots[portalid.0].latency_ns += elapsed;
        inner.slots[portalid.0].volume += nbytes;
        Ok(nbytes)
    }

    /// Writes `buf` through an output portal. Blocks until the receiver
    /// allows the transfer.
    pub fn write(&self, portalid: PortalId, buf: &[u8]) -> NoctuaResult<usize> {
        if buf.len() > PORTAL_BUFFER_SIZE {
            return Err(NoctuaError::invalid(format!(
                "portal writes are bounded by {PORTAL_BUFFER_SIZE} bytes"
            )));
        }

        let receiver = {
            let mut inner = self.acquire_endpoint(portalid, Direction::Output)?;
            inner.pool.get_mut(portalid.0).set_busy();
            inner.slots[portalid.0].remote
        };

        // The lock is released here: the write may sleep until allowed.
        let t0 = Instant::now();
        let result = self.fabric.portal_write(receiver, self.node, buf);
        let elapsed = t0.elapsed().as_nanos() as u64;

        let mut inner = self.inner.lock();
        inner.pool.get_mut(portalid.0).set_notbusy();
        self.cond.notify_all();

        let nbytes = result?;
        inner.slots[portalid.0].latency_ns += elapsed;
        inner.slots[portalid.0].volume += nbytes;
        Ok(nbytes)
    }

    /// Closes an output portal, taking the peer slot offline when the last
    /// reference goes away.
    pub fn close(&self, portalid: PortalId) -> NoctuaResult<()> {
        let mut inner = self.acquire_endpoint(portalid, Direction::Output)?;

        inner.slots[portalid.0].refcount -= 1;
        if inner.slots[portalid.0].refcount == 0 {
            let remote = inner.slots[portalid.0].remote;
            self.fabric.portal_set_online(remote, self.node, false)?;
            inner.slots[portalid.0] = PortalSlotEntry::default();
            inner.pool.free(portalid.0);
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Destroys the input portal of this node.
    pub fn unlink(&self, portalid: PortalId) -> NoctuaResult<()> {
        let mut inner = self.acquire_endpoint(portalid, Direction::Input)?;

        self.fabric.portal_reset_receiver(self.node)?;
        inner.slots[portalid.0] = PortalSlotEntry::default();
        inner.pool.free(portalid.0);
        self.cond.notify_all();
        Ok(())
    }

    /// Latency (ns) and volume (bytes) accumulated by an endpoint.
    pub fn stats(&self, portalid: PortalId) -> NoctuaResult<(u64, usize)> {
        let inner = self.inner.lock();
        if !inner.pool.is_valid(portalid.0) || !inner.pool.get(portalid.0).is_used() {
            return Err(NoctuaError::invalid("bad portal descriptor"));
        }
        let slot = &inner.slots[portalid.0];
        Ok((slot.latency_ns, slot.volume))
    }

    fn acquire_endpoint(
        &self,
        portalid: PortalId,
        direction: Direction,
    ) -> NoctuaResult<parking_lot::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock();
        if !inner.pool.is_valid(portalid.0) {
            return Err(NoctuaError::invalid("bad portal descriptor"));
        }
        loop {
            let entry = inner.pool.get(portalid.0);
            if !entry.is_used() {
                return Err(NoctuaError::invalid("portal is not in use"));
            }
            match direction {
                Direction::Input if !entry.is_readable() => {
                    return Err(NoctuaError::NotSupported(
                        "operation needs an input portal".into(),
                    ))
                }
                Direction::Output if !entry.is_writable() => {
                    return Err(NoctuaError::NotSupported(
                        "operation needs an output portal".into(),
                    ))
                }
                _ => {}
            }
            if !entry.is_busy() {
                return Ok(inner);
            }
            self.cond.wait(&mut inner);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_create_is_rejected() {
        let portals = PortalLayer::new(Fabric::with_nodes(4), 0);
        portals.create(0).unwrap();
        assert!(matches!(
            portals.create(0),
            Err(NoctuaError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_read_requires_allow() {
        let portals = PortalLayer::new(Fabric::with_nodes(4), 0);
        let inportal = portals.create(0).unwrap();
        let mut buf = [0u8; 64];
        assert!(matches!(
            portals.read(inportal, &mut buf),
            Err(NoctuaError::Invalid(_))
        ));
    }

    #[test]
    fn test_allow_requires_online_peer() {
        let portals = PortalLayer::new(Fabric::with_nodes(4), 0);
        let inportal = portals.create(0).unwrap();
        assert!(matches!(
            portals.allow(inportal, 1),
            Err(NoctuaError::Invalid(_))
        ));
    }

    #[test]
    fn test_double_allow_is_rejected() {
        let fabric = Fabric::with_nodes(4);
        let reader = PortalLayer::new(fabric.clone(), 0);
        let writer = PortalLayer::new(fabric, 1);
        let inportal = reader.create(0).unwrap();
        writer.open(0).unwrap();
        reader.allow(inportal, 1).unwrap();
        assert!(matches!(
            reader.allow(inportal, 1),
            Err(NoctuaError::Invalid(_))
        ));
    }

    #[test]
    fn test_oversized_write_is_rejected() {
        let portals = PortalLayer::new(Fabric::with_nodes(4), 0);
        let outportal = portals.open(1).unwrap();
        let buf = vec![0u8; PORTAL_BUFFER_SIZE + 1];
        assert!(matches!(
            portals.write(outportal, &buf),
            Err(NoctuaError::Invalid(_))
        ));
    }

    #[test]
    fn test_close_takes_peer_offline() {
        let fabric = Fabric::with_nodes(4);
        let reader = PortalLayer::new(fabric.clone(), 0);
        let writer = PortalLayer::new(fabric, 1);
        let inportal = reader.create(0).unwrap();
        let outportal = writer.open(0).unwrap();
        writer.close(outportal).unwrap();
        assert!(matches!(
            reader.allow(inportal, 1),
            Err(NoctuaError::Invalid(_))
        ));
    }
}
