//! Semaphore client stub
//!
//! `wait` blocks in the natural way: the request is sent and the caller
//! simply reads its input mailbox, which stays silent until the server (or a
//! peer's post) releases it.

use super::*;
use crate::protocol::{self, seq_first, seq_second, ControlHeader};
use noctua_core::node::NodeRuntime;
use parking_lot::Mutex;
use std::sync::Arc;

/// Client stub for the semaphore server.
pub struct SemaphoreClient {
    runtime: Arc<NodeRuntime>,
    server: NodeId,
    lock: Mutex<()>,
}

impl SemaphoreClient {
    pub fn new(runtime: Arc<NodeRuntime>, server: NodeId) -> Self {
        Self {
            runtime,
            server,
            lock: Mutex::new(()),
        }
    }

    /// Creates (or opens, if it exists) a named semaphore.
    pub fn create(&self, name: &str, mode: u32, value: u32) -> NoctuaResult<u32> {
        self.create_request(SemOpcode::Create, name, mode, value)
    }

    /// Creates a named semaphore, failing if the name is taken.
    pub fn create_excl(&self, name: &str, mode: u32, value: u32) -> NoctuaResult<u32> {
        self.create_request(SemOpcode::CreateExcl, name, mode, value)
    }

    /// Opens an existing named semaphore.
    pub fn open(&self, name: &str) -> NoctuaResult<u32> {
        let node = self.runtime.node();
        let frame = encode_name_frame(SemOpcode::Open, node, 0, name)?;
        id_of(self.transact(&[frame])?)
    }

    /// Releases a semaphore.
    pub fn close(&self, semid: u32) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_semid_frame(SemOpcode::Close, node, semid);
        status_of(self.transact(&[frame])?)
    }

    /// Removes a semaphore name. Owner-only; live holders defer the removal.
    pub fn unlink(&self, name: &str) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_name_frame(SemOpcode::Unlink, node, 0, name)?;
        status_of(self.transact(&[frame])?)
    }

    /// Acquires the semaphore, blocking while its count is exhausted.
    pub fn wait(&self, semid: u32) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_semid_frame(SemOpcode::Wait, node, semid);
        status_of(self.transact(&[frame])?)
    }

    /// Releases one waiter, or banks the count.
    pub fn post(&self, semid: u32) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_semid_frame(SemOpcode::Post, node, semid);
        status_of(self.transact(&[frame])?)
    }

    fn create_request(
        &self,
        opcode: SemOpcode,
        name: &str,
        mode: u32,
        value: u32,
    ) -> NoctuaResult<u32> {
        let node = self.runtime.node();
        let first = encode_name_frame(opcode, node, seq_first(node), name)?;
        let second = encode_attr_frame(opcode, node, seq_second(node), mode, value);
        id_of(self.transact(&[first, second])?)
    }

    /// Sends the request frames and reads the single reply.
    fn transact(&self, frames: &[noctua_core::fabric::Frame]) -> NoctuaResult<i32> {
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
            SemOpcode::Reply as u8,
            "unexpected frame while waiting for a semaphore reply"
        );
        Ok(decode_reply(&reply))
    }
}

/// Stops the semaphore server.
pub(crate) fn send_exit(runtime: &NodeRuntime, server: NodeId) -> NoctuaResult<()> {
    let mut frame = [0u8; noctua_core::fabric::MAILBOX_MSG_SIZE];
    ControlHeader::new(SemOpcode::Exit as u8, runtime.node(), 0).encode(&mut frame);
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
