//! Mailbox endpoints - fixed-size short messages over the NoC
//!
//! A mailbox moves frames of exactly [`MAILBOX_MSG_SIZE`] bytes. Each node
//! owns at most one *input* mailbox (created with `remote == self`) and any
//! number of *output* mailboxes opened towards remote nodes. Opening the same
//! remote twice duplicates the descriptor and bumps its reference count.
//!
//! Reads block until a frame arrives; writes block while the peer's queue is
//! full. Both record per-endpoint latency and volume counters.

use crate::error::{NoctuaError, NoctuaResult};
use crate::fabric::{Fabric, Frame};
use crate::resource::ResourcePool;
use crate::topology::NodeId;
use crossbeam::channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Instant;

pub use crate::fabric::MAILBOX_MSG_SIZE;

/// Number of mailbox descriptors per node.
pub const NR_MAILBOX: usize = 64;

/// Mailbox descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxId(pub(crate) usize);

#[derive(Default)]
struct MailboxSlot {
    remote: NodeId,
    tx: Option<Sender<Frame>>,
    rx: Option<Receiver<Frame>>,
    refcount: usize,
    volume: usize,
    latency_ns: u64,
}

struct Inner {
    pool: ResourcePool,
    slots: Vec<MailboxSlot>,
}

/// Table of mailbox endpoints owned by one node.
pub struct MailboxLayer {
    node: NodeId,
    fabric: Arc<Fabric>,
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl MailboxLayer {
    pub fn new(fabric: Arc<Fabric>, node: NodeId) -> Self {
        Self {
            node,
            fabric,
            inner: Mutex::new(Inner {
                pool: ResourcePool::new(NR_MAILBOX),
                slots: (0..NR_MAILBOX).map(|_| MailboxSlot::default()).collect(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Creates the input mailbox of this node.
    ///
    /// `remote` must be the local node; a second create returns
    /// `AlreadyExists`.
    pub fn create(&self, remote: NodeId) -> NoctuaResult<MailboxId> {
        if remote != self.node {
            return Err(NoctuaError::invalid(format!(
                "input mailbox must be local (remote={remote}, node={})",
                self.node
            )));
        }

        let mut inner = self.inner.lock();

        // Check if the input mailbox was already created.
        for (id, entry) in inner.pool.iter_used() {
            if entry.is_readable() && inner.slots[id].remote == remote {
                return Err(NoctuaError::already_exists(format!(
                    "input mailbox of node {remote}"
                )));
            }
        }

        let id = inner
            .pool
            .alloc()
            .ok_or_else(|| NoctuaError::again("mailbox table is full"))?;
        let rx = self.fabric.mailbox_receiver(self.node)?;

        inner.slots[id] = MailboxSlot {
            remote,
            tx: None,
            rx: Some(rx),
            refcount: 1,
            volume: 0,
            latency_ns: 0,
        };
        inner.pool.get_mut(id).set_rdonly();

        log::debug!("node {}: created input mailbox {id}", self.node);
        Ok(MailboxId(id))
    }

    /// Opens an output mailbox towards `remote`.
    ///
    /// If this node already holds an output mailbox to `remote`, its
    /// descriptor is duplicated and the reference count incremented.
    pub fn open(&self, remote: NodeId) -> NoctuaResult<MailboxId> {
        if remote == self.node {
            return Err(NoctuaError::invalid("cannot open a mailbox to self"));
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
                    return Ok(MailboxId(id));
                }
                // Busy descriptor: wait until its transfer finishes.
                Some((_, true)) => self.cond.wait(&mut inner),
                None => break,
            }
        }

        let id = inner
            .pool
            .alloc()
            .ok_or_else(|| NoctuaError::again("mailbox table is full"))?;
        let tx = self.fabric.mailbox_sender(remote)?;

        inner.slots[id] = MailboxSlot {
            remote,
            tx: Some(tx),
            rx: None,
            refcount: 1,
            volume: 0,
            latency_ns: 0,
        };
        inner.pool.get_mut(id).set_wronly();

        log::debug!("node {}: opened output mailbox {id} to {remote}", self.node);
        Ok(MailboxId(id))
    }

    /// Reads one frame from an input mailbox. Blocks until a frame arrives.
    pub fn read(&self, mbxid: MailboxId, buf: &mut [u8]) -> NoctuaResult<usize> {
        if buf.len() != MAILBOX_MSG_SIZE {
            return Err(NoctuaError::invalid(format!(
                "mailbox reads move exactly {MAILBOX_MSG_SIZE} bytes"
            )));
        }

        let rx = {
            let mut inner = self.acquire_endpoint(mbxid, Direction::Input)?;
            inner.pool.get_mut(mbxid.0).set_busy();
            inner.slots[mbxid.0]
                .rx
                .clone()
                .ok_or_else(|| NoctuaError::Internal("input mailbox lost its connector".into()))?
        };

        // The lock is released here: the receive may sleep.
        let t0 = Instant::now();
        let result = rx.recv();
        let elapsed = t0.elapsed().as_nanos() as u64;

        let mut inner = self.inner.lock();
        inner.pool.get_mut(mbxid.0).set_notbusy();
        self.cond.notify_all();

        match result {
            Ok(frame) => {
                buf.copy_from_slice(&frame);
                inner.slots[mbxid.0].latency_ns += elapsed;
                inner.slots[mbxid.0].volume += MAILBOX_MSG_SIZE;
                Ok(MAILBOX_MSG_SIZE)
            }
            Err(_) => Err(NoctuaError::again("mailbox connector dropped")),
        }
    }

    /// Writes one frame to an output mailbox. Blocks while the peer's queue
    /// is full.
    pub fn write(&self, mbxid: MailboxId, buf: &[u8]) -> NoctuaResult<usize> {
        if buf.len() != MAILBOX_MSG_SIZE {
            return Err(NoctuaError::invalid(format!(
                "mailbox writes move exactly {MAILBOX_MSG_SIZE} bytes"
            )));
        }

        let tx = {
            let mut inner = self.acquire_endpoint(mbxid, Direction::Output)?;
            inner.pool.get_mut(mbxid.0).set_busy();
            inner.slots[mbxid.0]
                .tx
                .clone()
                .ok_or_else(|| NoctuaError::Internal("output mailbox lost its connector".into()))?
        };

        let mut frame: Frame = [0; MAILBOX_MSG_SIZE];
        frame.copy_from_slice(buf);

        // The lock is released here: the send may sleep on a full queue.
        let t0 = Instant::now();
        let result = tx.send(frame);
        let elapsed = t0.elapsed().as_nanos() as u64;

        let mut inner = self.inner.lock();
        inner.pool.get_mut(mbxid.0).set_notbusy();
        self.cond.notify_all();

        match result {
            Ok(()) => {
                inner.slots[mbxid.0].latency_ns += elapsed;
                inner.slots[mbxid.0].volume += MAILBOX_MSG_SIZE;
                Ok(MAILBOX_MSG_SIZE)
            }
            Err(_) => Err(NoctuaError::again("mailbox connector dropped")),
        }
    }

    /// Closes an output mailbox, releasing the descriptor when the last
    /// reference goes away.
    pub fn close(&self, mbxid: MailboxId) -> NoctuaResult<()> {
        let mut inner = self.acquire_endpoint(mbxid, Direction::Output)?;

        inner.slots[mbxid.0].refcount -= 1;
        if inner.slots[mbxid.0].refcount == 0 {
            inner.slots[mbxid.0] = MailboxSlot::default();
            inner.pool.free(mbxid.0);
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Destroys the input mailbox of this node.
    pub fn unlink(&self, mbxid: MailboxId) -> NoctuaResult<()> {
        let mut inner = self.acquire_endpoint(mbxid, Direction::Input)?;

        inner.slots[mbxid.0] = MailboxSlot::default();
        inner.pool.free(mbxid.0);
        self.cond.notify_all();
        Ok(())
    }

    /// Latency (ns) and volume (bytes) accumulated by an endpoint.
    pub fn stats(&self, mbxid: MailboxId) -> NoctuaResult<(u64, usize)> {
        let inner = self.inner.lock();
        if !inner.pool.is_valid(mbxid.0) || !inner.pool.get(mbxid.0).is_used() {
            return Err(NoctuaError::invalid("bad mailbox descriptor"));
        }
        let slot = &inner.slots[mbxid.0];
        Ok((slot.latency_ns, slot.volume))
    }

    /// Validates a descriptor, waits out `busy`, and checks its direction.
    fn acquire_endpoint(
        &self,
        mbxid: MailboxId,
        direction: Direction,
    ) -> NoctuaResult<parking_lot::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock();
        if !inner.pool.is_valid(mbxid.0) {
            return Err(NoctuaError::invalid("bad mailbox descriptor"));
        }
        loop {
            let entry = inner.pool.get(mbxid.0);
            if !entry.is_used() {
                return Err(NoctuaError::invalid("mailbox is not in use"));
            }
            match direction {
                Direction::Input if !entry.is_readable() => {
                    return Err(NoctuaError::NotSupported(
                        "operation needs an input mailbox".into(),
                    ))
                }
                Direction::Output if !entry.is_writable() => {
                    return Err(NoctuaError::NotSupported(
                        "operation needs an output mailbox".into(),
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

    fn layer(node: NodeId) -> MailboxLayer {
        MailboxLayer::new(Fabric::with_nodes(4), node)
    }

    #[test]
    fn test_create_rejects_remote_node() {
        let mbx = layer(0);
        assert!(matches!(mbx.create(1), Err(NoctuaError::Invalid(_))));
    }

    #[test]
    fn test_double_create_is_rejected() {
        let mbx = layer(0);
        mbx.create(0).unwrap();
        assert!(matches!(mbx.create(0), Err(NoctuaError::AlreadyExists(_))));
    }

    #[test]
    fn test_open_duplicates_descriptor() {
        let mbx = layer(0);
        let first = mbx.open(1).unwrap();
        let second = mbx.open(1).unwrap();
        assert_eq!(first, second);
        mbx.close(first).unwrap();
        mbx.close(second).unwrap();
        // Both references gone: the slot is recycled.
        assert!(matches!(mbx.close(first), Err(NoctuaError::Invalid(_))));
    }

    #[test]
    fn test_direction_checks() {
        let mbx = layer(0);
        let inbox = mbx.create(0).unwrap();
        let outbox = mbx.open(1).unwrap();
        let mut buf = [0u8; MAILBOX_MSG_SIZE];
        assert!(matches!(
            mbx.read(outbox, &mut buf),
            Err(NoctuaError::NotSupported(_))
        ));
        assert!(matches!(
            mbx.write(inbox, &buf),
            Err(NoctuaError::NotSupported(_))
        ));
        assert!(matches!(
            mbx.close(inbox),
            Err(NoctuaError::NotSupported(_))
        ));
        assert!(matches!(
            mbx.unlink(outbox),
            Err(NoctuaError::NotSupported(_))
        ));
    }

    #[test]
    fn test_short_buffers_are_rejected() {
        let mbx = layer(0);
        let outbox = mbx.open(1).unwrap();
        assert!(matches!(
            mbx.write(outbox, &[0u8; 7]),
            Err(NoctuaError::Invalid(_))
        ));
    }

    #[test]
    fn test_unlink_allows_create_again() {
        let mbx = layer(0);
        let inbox = mbx.create(0).unwrap();
        mbx.unlink(inbox).unwrap();
        mbx.create(0).unwrap();
    }
}
