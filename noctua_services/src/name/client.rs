//! Name service client stub

use super::*;
use noctua_core::node::NodeRuntime;
use parking_lot::Mutex;
use std::sync::Arc;

/// Client stub for the name server.
pub struct NameClient {
    runtime: Arc<NodeRuntime>,
    server: NodeId,
    lock: Mutex<()>,
}

impl NameClient {
    pub fn new(runtime: Arc<NodeRuntime>, server: NodeId) -> Self {
        Self {
            runtime,
            server,
            lock: Mutex::new(()),
        }
    }

    /// Binds `name` to `node`.
    pub fn link(&self, node: NodeId, name: &str) -> NoctuaResult<()> {
        let frame = encode_link_frame(self.runtime.node(), node, name)?;
        let (ret, _) = self.transact(frame)?;
        status_of(ret)
    }

    /// Resolves `name` to a node id.
    pub fn lookup(&self, name: &str) -> NoctuaResult<NodeId> {
        let frame = encode_name_frame(NameOpcode::Lookup, self.runtime.node(), name)?;
        let (ret, node) = self.transact(frame)?;
        status_of(ret)?;
        Ok(node)
    }

    /// Unbinds `name`.
    pub fn unlink(&self, name: &str) -> NoctuaResult<()> {
        let frame = encode_name_frame(NameOpcode::Unlink, self.runtime.node(), name)?;
        let (ret, _) = self.transact(frame)?;
        status_of(ret)
    }

    fn transact(&self, frame: Frame) -> NoctuaResult<(i32, NodeId)> {
        let _guard = self.lock.lock();

        crate::protocol::send_to(&self.runtime, self.server, &frame)?;
        let reply = crate::protocol::recv_from_inbox(&self.runtime)?;
        let header = ControlHeader::decode(&reply);
        assert_eq!(
            header.opcode,
            NameOpcode::Reply as u8,
            "unexpected frame while waiting for a name reply"
        );
        Ok(decode_reply(&reply))
    }
}

/// Stops the name server.
pub(crate) fn send_exit(runtime: &NodeRuntime, server: NodeId) -> NoctuaResult<()> {
    let mut frame = [0u8; noctua_core::fabric::MAILBOX_MSG_SIZE];
    ControlHeader::new(NameOpcode::Exit as u8, runtime.node(), 0).encode(&mut frame);
    crate::protocol::send_to(runtime, server, &frame)
}

fn status_of(ret: i32) -> NoctuaResult<()> {
    if ret < 0 {
        return Err(NoctuaError::from_code(ret));
    }
    Ok(())
}
