//! Sync endpoints - multi-party rendezvous over the NoC
//!
//! Two modes:
//!
//! - **One-to-all (broadcast)**: each non-root member `create`s and `wait`s;
//!   the root `open`s and `signal`s, releasing every member at once.
//! - **All-to-one (gather)**: the root `create`s and `wait`s until every leaf
//!   has signalled exactly once; leaves `open` and `signal`.
//!
//! A duplicate leaf signal during a gather is a protocol violation and
//! aborts.

use crate::error::{NoctuaError, NoctuaResult};
use crate::fabric::{Fabric, SyncHub};
use crate::resource::ResourcePool;
use crate::topology::NodeId;
use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Number of sync descriptors per node.
pub const NR_SYNC: usize = 64;

/// Sync descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncId(pub(crate) usize);

/// Rendezvous flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Root signals, members wait.
    OneToAll,
    /// Members signal, root waits.
    AllToOne,
}

#[derive(Default)]
struct SyncSlot {
    mode: Option<SyncMode>,
    nodes: Vec<NodeId>,
    tx: Option<Sender<NodeId>>,
    rx: Option<Receiver<NodeId>>,
}

struct Inner {
    pool: ResourcePool,
    slots: Vec<SyncSlot>,
}

/// Table of sync endpoints owned by one node.
pub struct SyncLayer {
    node: NodeId,
    fabric: Arc<Fabric>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    /// The side that waits (create).
    Wait,
    /// The side that signals (open).
    Signal,
}

impl SyncLayer {
    pub fn new(fabric: Arc<Fabric>, node: NodeId) -> Self {
        Self {
            node,
            fabric,
            inner: Mutex::new(Inner {
                pool: ResourcePool::new(NR_SYNC),
                slots: (0..NR_SYNC).map(|_| SyncSlot::default()).collect(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Creates the waiting side of a synchronization point.
    pub fn create(&self, nodes: &[NodeId], mode: SyncMode) -> NoctuaResult<SyncId> {
        self.validate(nodes, mode, Side::Wait)?;

        let mut inner = self.inner.lock();
        let id = inner
            .pool
            .alloc()
            .ok_or_else(|| NoctuaError::again("sync table is full"))?;
        let rx = self.fabric.sync_receiver(nodes[0], hub_of(mode))?;

        inner.slots[id] = SyncSlot {
            mode: Some(mode),
            nodes: nodes.to_vec(),
            tx: None,
            rx: Some(rx),
        };
        inner.pool.get_mut(id).set_rdonly();
        Ok(SyncId(id))
    }

    /// Opens the signalling side of a synchronization point.
    pub fn open(&self, nodes: &[NodeId], mode: SyncMode) -> NoctuaResult<SyncId> {
        self.validate(nodes, mode, Side::Signal)?;

        let mut inner = self.inner.lock();
        let id = inner
            .pool
            .alloc()
            .ok_or_else(|| NoctuaError::again("sync table is full"))?;
        let tx = self.fabric.sync_sender(nodes[0], hub_of(mode))?;

        inner.slots[id] = SyncSlot {
            mode: Some(mode),
            nodes: nodes.to_vec(),
            tx: Some(tx),
            rx: None,
        };
        inner.pool.get_mut(id).set_wronly();
        Ok(SyncId(id))
    }

    /// Blocks until the rendezvous completes.
    ///
    /// Broadcast members consume one root signal. The gather root consumes
    /// one signal from every distinct leaf.
    ///
    /// # Panics
    ///
    /// Panics if a leaf signals the same gather twice before the root
    /// returns: that is a protocol violation.
    pub fn wait(&self, syncid: SyncId) -> NoctuaResult<()> {
        let (mode, nodes, rx) = {
            let mut inner = self.acquire_endpoint(syncid, Side::Wait)?;
            let slot = &inner.slots[syncid.0];
            let parts = (
                slot.mode.expect("used sync slot always has a mode"),
                slot.nodes.clone(),
                slot.rx
                    .clone()
                    .ok_or_else(|| NoctuaError::Internal("sync point lost its connector".into()))?,
            );
            inner.pool.get_mut(syncid.0).set_busy();
            parts
        };

        // The lock is released here: the waits below may sleep.
        let result = match mode {
            SyncMode::OneToAll => rx
                .recv()
                .map(|_| ())
                .map_err(|_| NoctuaError::again("sync connector dropped")),
            SyncMode::AllToOne => self.gather(&nodes, &rx),
        };

        let mut inner = self.inner.lock();
        inner.pool.get_mut(syncid.0).set_notbusy();
        self.cond.notify_all();
        result
    }

    /// Releases the other side of the rendezvous.
    pub fn signal(&self, syncid: SyncId) -> NoctuaResult<()> {
        let (mode, nodes, tx) = {
            let mut inner = self.acquire_endpoint(syncid, Side::Signal)?;
            let slot = &inner.slots[syncid.0];
            let parts = (
                slot.mode.expect("used sync slot always has a mode"),
                slot.nodes.clone(),
                slot.tx
                    .clone()
                    .ok_or_else(|| NoctuaError::Internal("sync point lost its connector".into()))?,
            );
            inner.pool.get_mut(syncid.0).set_busy();
            parts
        };

        let result = match mode {
            // The root dispatches one signal per member.
            SyncMode::OneToAll => {
                let mut out = Ok(());
                for _ in 1..nodes.len() {
                    if tx.send(self.node).is_err() {
                        out = Err(NoctuaError::again("sync connector dropped"));
                        break;
                    }
                }
                out
            }
            // A leaf announces itself to the root.
            SyncMode::AllToOne => tx
                .send(self.node)
                .map_err(|_| NoctuaError::again("sync connector dropped")),
        };

        let mut inner = self.inner.lock();
        inner.pool.get_mut(syncid.0).set_notbusy();
        self.cond.notify_all();
        result
    }

    /// Releases the signalling side of a synchronization point.
    pub fn close(&self, syncid: SyncId) -> NoctuaResult<()> {
        let mut inner = self.acquire_endpoint(syncid, Side::Signal)?;
        inner.slots[syncid.0] = SyncSlot::default();
        inner.pool.free(syncid.0);
        self.cond.notify_all();
        Ok(())
    }

    /// Destroys the waiting side of a synchronization point.
    pub fn unlink(&self, syncid: SyncId) -> NoctuaResult<()> {
        let mut inner = self.acquire_endpoint(syncid, Side::Wait)?;
        inner.slots[syncid.0] = SyncSlot::default();
        inner.pool.free(syncid.0);
        self.cond.notify_all();
        Ok(())
    }

    /// Collects one signal from every distinct leaf.
    fn gather(&self, nodes: &[NodeId], rx: &Receiver<NodeId>) -> NoctuaResult<()> {
        let leaves = &nodes[1..];
        let mut seen = vec![false; leaves.len()];
        let mut missing = leaves.len();

        while missing > 0 {
            let sig = rx
                .recv()
                .map_err(|_| NoctuaError::again("sync connector dropped"))?;
            let idx = leaves.iter().position(|&leaf| leaf == sig).ok_or_else(|| {
                NoctuaError::invalid(format!("gather signal from stranger node {sig}"))
            })?;
            assert!(
                !seen[idx],
                "duplicate gather signal from node {sig}: protocol violation"
            );
            seen[idx] = true;
            missing -= 1;
        }
        Ok(())
    }

    /// Membership validation shared by create and open.
    fn validate(&self, nodes: &[NodeId], mode: SyncMode, side: Side) -> NoctuaResult<()> {
        let k = nodes.len();
        if k < 2 || k > self.fabric.nnodes() {
            return Err(NoctuaError::invalid(format!(
                "sync point over {k} nodes is out of range"
            )));
        }
        for &node in nodes {
            if node >= self.fabric.nnodes() {
                return Err(NoctuaError::invalid(format!("bad node {node} in list")));
            }
        }
        for (i, &node) in nodes.iter().enumerate() {
            if nodes[i + 1..].contains(&node) {
                return Err(NoctuaError::invalid(format!("node {node} listed twice")));
            }
        }

        // The caller must sit on the correct side of the relation: the root
        // signals a broadcast and waits on a gather.
        let is_root = nodes[0] == self.node;
        let is_member = nodes[1..].contains(&self.node);
        let ok = match (mode, side) {
            (SyncMode::OneToAll, Side::Wait) => is_member,
            (SyncMode::OneToAll, Side::Signal) => is_root,
            (SyncMode::AllToOne, Side::Wait) => is_root,
            (SyncMode::AllToOne, Side::Signal) => is_member,
        };
        if !ok {
            return Err(NoctuaError::invalid(format!(
                "node {} is on the wrong side of the sync relation",
                self.node
            )));
        }
        Ok(())
    }

    fn acquire_endpoint(
        &self,
        syncid: SyncId,
        side: Side,
    ) -> NoctuaResult<parking_lot::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock();
        if !inner.pool.is_valid(syncid.0) {
            return Err(NoctuaError::invalid("bad sync descriptor"));
        }
        loop {
            let entry = inner.pool.get(syncid.0);
            if !entry.is_used() {
                return Err(NoctuaError::invalid("sync point is not in use"));
            }
            match side {
                Side::Wait if !entry.is_readable() => {
                    return Err(NoctuaError::NotSupported(
                        "operation needs the waiting side".into(),
                    ))
                }
                Side::Signal if !entry.is_writable() => {
                    return Err(NoctuaError::NotSupported(
                        "operation needs the signalling side".into(),
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

fn hub_of(mode: SyncMode) -> SyncHub {
    match mode {
        SyncMode::OneToAll => SyncHub::Broadcast,
        SyncMode::AllToOne => SyncHub::Gather,
    }
}
