//! Remote memory client stub
//!
//! Raw block transfers against the remote memory servers. Allocation is
//! spread over the configured servers round-robin; the server owning a page
//! is recovered from the page handle itself.
//!
//! Fail-soft transfers surface as `Faulted`: the data moved (through the
//! server's reserved block 0), but the requested block was not allocated.

use super::*;
use noctua_core::communication::portal::PortalId;
use noctua_core::config::{RmemDataPath, SubstrateConfig};
use noctua_core::node::NodeRuntime;
use parking_lot::Mutex;
use std::sync::Arc;

/// Client stub for the remote memory servers.
pub struct RmemClient {
    runtime: Arc<NodeRuntime>,
    servers: Vec<NodeId>,
    /// Standing data-plane connections, one per server.
    outportals: Vec<PortalId>,
    data_path: RmemDataPath,
    next_server: Mutex<usize>,
    lock: Mutex<()>,
}

impl RmemClient {
    pub fn new(runtime: Arc<NodeRuntime>, config: &SubstrateConfig) -> NoctuaResult<Self> {
        if config.servers.rmem.is_empty() {
            return Err(NoctuaError::config("no remote memory server configured"));
        }
        let outportals = config
            .servers
            .rmem
            .iter()
            .map(|&server| runtime.portals().open(server))
            .collect::<NoctuaResult<Vec<_>>>()?;
        Ok(Self {
            runtime,
            servers: config.servers.rmem.clone(),
            outportals,
            data_path: config.rmem_data_path,
            next_server: Mutex::new(0),
            lock: Mutex::new(()),
        })
    }

    pub fn runtime(&self) -> &Arc<NodeRuntime> {
        &self.runtime
    }

    /// Allocates one remote block, spreading load across servers.
    pub fn alloc(&self) -> NoctuaResult<RPage> {
        let start = {
            let mut next = self.next_server.lock();
            let cursor = *next;
            *next = (*next + 1) % self.servers.len();
            cursor
        };

        for step in 0..self.servers.len() {
            let index = (start + step) % self.servers.len();
            let node = self.runtime.node();
            let msg = RmemMessage::request(RmemOpcode::Alloc, node, RPage::NULL);
            let reply = self.transact_simple(self.servers[index], msg)?;
            let page = RPage(reply.blknum);
            if !page.is_null() {
                // Stamp the server index the page came from.
                return Ok(RPage::new(index, page.block()));
            }
        }
        Err(NoctuaError::ResourceExhausted(
            "remote memory is exhausted".into(),
        ))
    }

    /// Frees a remote block. Owner-only.
    pub fn free(&self, page: RPage) -> NoctuaResult<()> {
        let server = self.server_of(page)?;
        let node = self.runtime.node();
        let msg = RmemMessage::request(RmemOpcode::Free, node, page);
        let reply = self.transact_simple(server, msg)?;
        errcode_of(reply.errcode)
    }

    /// Reads one block into `buf`.
    ///
    /// On `Faulted` the buffer still holds the fail-soft data from the
    /// server's reserved block.
    pub fn read(&self, page: RPage, buf: &mut [u8]) -> NoctuaResult<()> {
        if buf.len() != RMEM_BLOCK_SIZE {
            return Err(NoctuaError::invalid(format!(
                "block reads move exactly {RMEM_BLOCK_SIZE} bytes"
            )));
        }
        let server = self.server_of(page)?;
        let node = self.runtime.node();
        let request = RmemMessage::request(RmemOpcode::Read, node, page);

        let _guard = self.lock.lock();
        crate::protocol::send_to(&self.runtime, server, &request.encode())?;

        match self.data_path {
            RmemDataPath::Portal => {
                self.runtime
                    .portals()
                    .allow(self.runtime.inportal(), server)?;
                self.runtime.portals().read(self.runtime.inportal(), buf)?;
            }
            RmemDataPath::Mailbox => {
                for _ in 0..RMEM_CHUNKS_PER_BLOCK {
                    let frame = crate::protocol::recv_from_inbox(&self.runtime)?;
                    let chunk = RmemMessage::decode(&frame);
                    let off = chunk.offset as usize;
                    buf[off..off + RMEM_PAYLOAD_SIZE].copy_from_slice(&chunk.payload);
                }
            }
        }

        let frame = crate::protocol::recv_from_inbox(&self.runtime)?;
        let reply = RmemMessage::decode(&frame);
        assert_eq!(
            reply.opcode().ok(),
            Some(RmemOpcode::Reply),
            "unexpected frame while waiting for a remote memory reply"
        );
        errcode_of(reply.errcode)
    }

    /// Writes one block from `buf`.
    pub fn write(&self, page: RPage, buf: &[u8]) -> NoctuaResult<()> {
        if buf.len() != RMEM_BLOCK_SIZE {
            return Err(NoctuaError::invalid(format!(
                "block writes move exactly {RMEM_BLOCK_SIZE} bytes"
            )));
        }
        let server = self.server_of(page)?;
        let node = self.runtime.node();

        let _guard = self.lock.lock();
        match self.data_path {
            RmemDataPath::Portal => {
                let request = RmemMessage::request(RmemOpcode::Write, node, page);
                crate::protocol::send_to(&self.runtime, server, &request.encode())?;

                self.runtime
                    .portals()
                    .write(self.outportals[page.server()], buf)?;

                let frame = crate::protocol::recv_from_inbox(&self.runtime)?;
                errcode_of(RmemMessage::decode(&frame).errcode)
            }
            RmemDataPath::Mailbox => {
                // One request per chunk; any faulted chunk faults the write.
                let mut fault = Ok(());
                for chunk in 0..RMEM_CHUNKS_PER_BLOCK {
                    let off = chunk * RMEM_PAYLOAD_SIZE;
                    let mut request = RmemMessage::request(RmemOpcode::Write, node, page);
                    request.offset = off as u32;
                    request
                        .payload
                        .copy_from_slice(&buf[off..off + RMEM_PAYLOAD_SIZE]);
                    crate::protocol::send_to(&self.runtime, server, &request.encode())?;

                    let frame = crate::protocol::recv_from_inbox(&self.runtime)?;
                    if let Err(err) = errcode_of(RmemMessage::decode(&frame).errcode) {
                        fault = Err(err);
                    }
                }
                fault
            }
        }
    }

    fn server_of(&self, page: RPage) -> NoctuaResult<NodeId> {
        if page.is_null() || page.block() as usize >= RMEM_NUM_BLOCKS {
            return Err(NoctuaError::faulted(format!(
                "bad page handle {:#x}",
                page.0
            )));
        }
        self.servers
            .get(page.server())
            .copied()
            .ok_or_else(|| NoctuaError::faulted(format!("bad server index {}", page.server())))
    }

    /// Single request / single reply exchange.
    fn transact_simple(&self, server: NodeId, msg: RmemMessage) -> NoctuaResult<RmemMessage> {
        let _guard = self.lock.lock();
        crate::protocol::send_to(&self.runtime, server, &msg.encode())?;
        let frame = crate::protocol::recv_from_inbox(&self.runtime)?;
        let reply = RmemMessage::decode(&frame);
        assert_eq!(
            reply.opcode().ok(),
            Some(RmemOpcode::Reply),
            "unexpected frame while waiting for a remote memory reply"
        );
        Ok(reply)
    }
}

/// Stops one remote memory server.
pub(crate) fn send_exit(runtime: &NodeRuntime, server: NodeId) -> NoctuaResult<()> {
    let msg = RmemMessage::request(RmemOpcode::Exit, runtime.node(), RPage::NULL);
    crate::protocol::send_to(runtime, server, &msg.encode())
}

fn errcode_of(errcode: i32) -> NoctuaResult<()> {
    if errcode < 0 {
        return Err(NoctuaError::from_code(errcode));
    }
    Ok(())
}
