//! Shared memory client stub
//!
//! Synchronous request/reply against the shared memory server. One request
//! is in flight at a time per client: the internal lock spans the send and
//! the matching reply read on the node's input mailbox.

use super::*;
use crate::protocol::{self, seq_first, seq_second, ControlHeader};
use noctua_core::error::{NoctuaError, NoctuaResult};
use noctua_core::node::NodeRuntime;
use noctua_core::topology::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;

/// Client stub for the shared memory server.
pub struct ShmClient {
    runtime: Arc<NodeRuntime>,
    server: NodeId,
    lock: Mutex<()>,
}

impl ShmClient {
    pub fn new(runtime: Arc<NodeRuntime>, server: NodeId) -> Self {
        Self {
            runtime,
            server,
            lock: Mutex::new(()),
        }
    }

    /// Creates (or opens, if it exists) a named region.
    pub fn create(&self, name: &str, rw: bool, mode: u32) -> NoctuaResult<u32> {
        self.create_request(ShmOpcode::Create, name, rw, mode)
    }

    /// Creates a named region, failing if the name is taken.
    pub fn create_excl(&self, name: &str, rw: bool, mode: u32) -> NoctuaResult<u32> {
        self.create_request(ShmOpcode::CreateExcl, name, rw, mode)
    }

    /// Opens an existing named region.
    pub fn open(&self, name: &str, rw: bool, trunc: bool) -> NoctuaResult<u32> {
        let node = self.runtime.node();
        let first = encode_name_frame(ShmOpcode::Open, node, seq_first(node), name)?;
        let second = encode_attr_frame(ShmOpcode::Open, node, seq_second(node), 0, rw, trunc);
        let (ret, _) = self.transact(&[first, second])?;
        id_of(ret)
    }

    /// Removes a region name. Owner-only; live holders defer the removal.
    pub fn unlink(&self, name: &str) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_name_frame(ShmOpcode::Unlink, node, 0, name)?;
        let (ret, _) = self.transact(&[frame])?;
        status_of(ret)
    }

    /// Maps `size` bytes of an open region, returning the mapping address.
    pub fn map(
        &self,
        oshmid: u32,
        size: u64,
        writable: bool,
        shared: bool,
        off: u64,
    ) -> NoctuaResult<u64> {
        let node = self.runtime.node();
        let frame = encode_map_frame(node, oshmid, size, off, writable, shared);
        let (ret, mapblk) = self.transact(&[frame])?;
        status_of(ret)?;
        Ok(mapblk)
    }

    /// Unmaps a mapped open region.
    pub fn unmap(&self, oshmid: u32) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_oshmid_frame(ShmOpcode::Unmap, node, oshmid);
        let (ret, _) = self.transact(&[frame])?;
        status_of(ret)
    }

    /// Resizes an open region. The region must not be mapped anywhere.
    pub fn truncate(&self, oshmid: u32, size: u64) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_truncate_frame(node, oshmid, size);
        let (ret, _) = self.transact(&[frame])?;
        status_of(ret)
    }

    /// Releases an open region.
    pub fn close(&self, oshmid: u32) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_oshmid_frame(ShmOpcode::Close, node, oshmid);
        let (ret, _) = self.transact(&[frame])?;
        status_of(ret)
    }

    fn create_request(
        &self,
        opcode: ShmOpcode,
        name: &str,
        rw: bool,
        mode: u32,
    ) -> NoctuaResult<u32> {
        let node = self.runtime.node();
        let first = encode_name_frame(opcode, node, seq_first(node), name)?;
        let second = encode_attr_frame(opcode, node, seq_second(node), mode, rw, false);
        let (ret, _) = self.transact(&[first, second])?;
        id_of(ret)
    }

    /// Sends the request frames and reads the single reply.
    fn transact(&self, frames: &[noctua_core::fabric::Frame]) -> NoctuaResult<(i32, u64)> {
        let _guard = self.lock.lock();

        let outbox = self.runtime.mailboxes().open(self.server)?;
        for frame in frames {
            self.runtime.mailboxes().write(outbox, frame)?;
        }
        self.runtime.mailboxes().close(outbox)?;

        let reply = protocol::recv_from_inbox(&self.runtime)?;
        let header = ControlHeader::decode(&reply);
        assert_eq!(
            header.opcode,
            ShmOpcode::Reply as u8,
            "unexpected frame while waiting for a shm reply"
        );
        Ok(decode_reply(&reply))
    }
}

/// Stops the shared memory server.
pub(crate) fn send_exit(runtime: &NodeRuntime, server: NodeId) -> NoctuaResult<()> {
    let mut frame = [0u8; noctua_core::fabric::MAILBOX_MSG_SIZE];
    ControlHeader::new(ShmOpcode::Exit as u8, runtime.node(), 0).encode(&mut frame);
    protocol::send_to(runtime, server, &frame)
}

fn id_of(ret: i32) -> NoctuaResult<u32> {
    if ret < 0 {
        return Err(NoctuaError::from_code(ret));
    }
    Ok(ret as u32)
}

fn status_of(ret: i32) -> NoctuaResult<()> {
    if ret < 0 {
        return Err(NoctuaError::from_code(ret));
    }
    Ok(())
}
