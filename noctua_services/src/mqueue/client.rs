//! Message queue client stub
//!
//! Payload transfers follow the control plane: a send waits for the server's
//! permission before writing the portal, a receive allows the server's
//! portal write after learning the payload size.

use super::*;
use crate::protocol::{self, seq_first, seq_second, ControlHeader};
use noctua_core::communication::portal::PortalId;
use noctua_core::node::NodeRuntime;
use parking_lot::Mutex;
use std::sync::Arc;

/// Client stub for the message queue server.
pub struct MqueueClient {
    runtime: Arc<NodeRuntime>,
    server: NodeId,
    /// Standing data-plane connection for sends.
    outportal: PortalId,
    lock: Mutex<()>,
}

impl MqueueClient {
    pub fn new(runtime: Arc<NodeRuntime>, server: NodeId) -> NoctuaResult<Self> {
        let outportal = runtime.portals().open(server)?;
        Ok(Self {
            runtime,
            server,
            outportal,
            lock: Mutex::new(()),
        })
    }

    /// Creates (or opens, if it exists) a named queue.
    pub fn create(&self, name: &str, mode: u32) -> NoctuaResult<u32> {
        self.create_request(MqueueOpcode::Create, name, mode)
    }

    /// Creates a named queue, failing if the name is taken.
    pub fn create_excl(&self, name: &str, mode: u32) -> NoctuaResult<u32> {
        self.create_request(MqueueOpcode::CreateExcl, name, mode)
    }

    /// Opens an existing named queue with the given access.
    pub fn open(&self, name: &str, read: bool, write: bool) -> NoctuaResult<u32> {
        let node = self.runtime.node();
        let frame = encode_open_frame(node, name, read, write)?;
        let (ret, _, _) = self.transact(&[frame])?;
        id_of(ret)
    }

    /// Releases a queue.
    pub fn close(&self, mqueueid: u32) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_mqueueid_frame(MqueueOpcode::Close, node, mqueueid);
        let (ret, _, _) = self.transact(&[frame])?;
        status_of(ret)
    }

    /// Removes a queue name. Owner-only; live holders defer the removal.
    pub fn unlink(&self, name: &str) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let frame = encode_name_frame(MqueueOpcode::Unlink, node, 0, name)?;
        let (ret, _, _) = self.transact(&[frame])?;
        status_of(ret)
    }

    /// Enqueues a message with the given priority.
    ///
    /// Returns `Again` when the queue is full.
    pub fn send(&self, mqueueid: u32, payload: &[u8], prio: u32) -> NoctuaResult<()> {
        if payload.is_empty() || payload.len() > MQUEUE_MESSAGE_SIZE {
            return Err(NoctuaError::invalid(format!(
                "bad message length {}",
                payload.len()
            )));
        }
        let node = self.runtime.node();
        let request = encode_send_frame(node, mqueueid, payload.len() as u32, prio);

        let _guard = self.lock.lock();

        // Phase 1: ask for permission.
        self.send_frames(&[request])?;
        let (ret, _, _) = self.read_reply()?;
        status_of(ret)?;

        // Phase 2: move the payload.
        self.runtime.portals().write(self.outportal, payload)?;

        // Phase 3: final acknowledgement.
        let (ret, _, _) = self.read_reply()?;
        status_of(ret)
    }

    /// Dequeues the highest-priority message into `buf`.
    ///
    /// Returns the payload length and priority, or `Again` when the queue is
    /// empty.
    pub fn receive(&self, mqueueid: u32, buf: &mut [u8]) -> NoctuaResult<(usize, u32)> {
        let node = self.runtime.node();
        let request = encode_mqueueid_frame(MqueueOpcode::Receive, node, mqueueid);

        let _guard = self.lock.lock();

        self.send_frames(&[request])?;
        let (ret, len, prio) = self.read_reply()?;
        status_of(ret)?;
        if buf.len() < len as usize {
            return Err(NoctuaError::invalid("receive buffer too small"));
        }

        self.runtime
            .portals()
            .allow(self.runtime.inportal(), self.server)?;
        let got = self
            .runtime
            .portals()
            .read(self.runtime.inportal(), &mut buf[..len as usize])?;
        Ok((got, prio))
    }

    fn create_request(&self, opcode: MqueueOpcode, name: &str, mode: u32) -> NoctuaResult<u32> {
        let node = self.runtime.node();
        let first = encode_name_frame(opcode, node, seq_first(node), name)?;
        let second = encode_attr_frame(opcode, node, seq_second(node), mode);
        let (ret, _, _) = self.transact(&[first, second])?;
        id_of(ret)
    }

    fn transact(&self, frames: &[noctua_core::fabric::Frame]) -> NoctuaResult<(i32, u32, u32)> {
        let _guard = self.lock.lock();
        self.send_frames(frames)?;
        self.read_reply()
    }

    fn send_frames(&self, frames: &[noctua_core::fabric::Frame]) -> NoctuaResult<()> {
        let outbox = self.runtime.mailboxes().open(self.server)?;
        for frame in frames {
            self.runtime.mailboxes().write(outbox, frame)?;
        }
        self.runtime.mailboxes().close(outbox)
    }

    fn read_reply(&self) -> NoctuaResult<(i32, u32, u32)> {
        let reply = protocol::recv_from_inbox(&self.runtime)?;
        let header = ControlHeader::decode(&reply);
        assert_eq!(
            header.opcode,
            MqueueOpcode::Reply as u8,
            "unexpected frame while waiting for a message queue reply"
        );
        Ok(decode_reply(&reply))
    }
}

/// Stops the message queue server.
pub(crate) fn send_exit(runtime: &NodeRuntime, server: NodeId) -> NoctuaResult<()> {
    let mut frame = [0u8; noctua_core::fabric::MAILBOX_MSG_SIZE];
    ControlHeader::new(MqueueOpcode::Exit as u8, runtime.node(), 0).encode(&mut frame);
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
