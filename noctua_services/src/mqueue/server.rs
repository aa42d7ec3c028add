//! Message queue server
//!
//! The store of every queue is kept sorted by descending priority, FIFO
//! within a priority, so a receive always pops the head. Payloads are moved
//! over the server's portals only after the control plane has agreed on the
//! transfer.

use super::*;
use crate::protocol::{self, seq_is_second, RequestBuffer};
use noctua_core::fabric::Fabric;
use noctua_core::node::NodeRuntime;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug, Clone)]
struct StoredMessage {
    prio: u32,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    node: NodeId,
    read: bool,
    write: bool,
}

#[derive(Debug)]
struct Mqueue {
    name: String,
    owner: NodeId,
    mode: u32,
    remove: bool,
    holders: Vec<Holder>,
    messages: Vec<StoredMessage>,
}

impl Mqueue {
    fn is_full(&self) -> bool {
        self.messages.len() >= MQUEUE_MESSAGE_MAX
    }

    /// Inserts keeping descending priority, FIFO within equal priority.
    fn insert(&mut self, prio: u32, bytes: Vec<u8>) {
        let at = self
            .messages
            .iter()
            .position(|message| message.prio < prio)
            .unwrap_or(self.messages.len());
        self.messages.insert(at, StoredMessage { prio, bytes });
    }
}

/// The message queue server.
pub struct MqueueServer {
    runtime: Arc<NodeRuntime>,
    mqueues: Vec<Option<Mqueue>>,
    reqbuf: RequestBuffer,
    nrequests: u64,
}

impl MqueueServer {
    /// Boots a message queue server on `node`.
    pub fn spawn(fabric: &Arc<Fabric>, node: NodeId) -> JoinHandle<()> {
        let fabric2 = fabric.clone();
        fabric.spawn(node, move || {
            let runtime = NodeRuntime::init(fabric2, node).expect("mqueue server runtime");
            let mut server = MqueueServer::new(runtime);
            if let Err(err) = server.run() {
                log::error!("[mqueue] server died: {err}");
            }
        })
    }

    pub fn new(runtime: Arc<NodeRuntime>) -> Self {
        let nnodes = runtime.fabric().nnodes();
        Self {
            runtime,
            mqueues: (0..MQUEUE_MAX).map(|_| None).collect(),
            reqbuf: RequestBuffer::new(nnodes),
            nrequests: 0,
        }
    }

    /// Serves requests until an exit frame arrives.
    pub fn run(&mut self) -> NoctuaResult<()> {
        let node = self.runtime.node();
        log::info!("[mqueue] booting on node {node}");

        // Bring the data plane up before going alive: every client slot is
        // online once the fence opens.
        for peer in 0..self.runtime.fabric().nnodes() {
            if peer != node {
                self.runtime.portals().open(peer)?;
            }
        }
        self.runtime.fabric().fence_signal(node)?;
        log::info!("[mqueue] listening on node {node}");

        loop {
            let frame = protocol::recv_from_inbox(&self.runtime)?;
            let header = protocol::ControlHeader::decode(&frame);
            let opcode = match MqueueOpcode::try_from(header.opcode) {
                Ok(opcode) => opcode,
                Err(err) => {
                    log::warn!("[mqueue] dropping request: {err}");
                    continue;
                }
            };
            if header.source >= self.runtime.fabric().nnodes() {
                log::warn!(
                    "[mqueue] dropping request from bad source {}",
                    header.source
                );
                continue;
            }
            self.nrequests += 1;
            let source = header.source;

            match opcode {
                MqueueOpcode::Create | MqueueOpcode::CreateExcl => {
                    if !seq_is_second(header.seq) {
                        self.reqbuf.put(source, frame);
                        continue;
                    }
                    let first = self.reqbuf.take(source);
                    let first_header = protocol::ControlHeader::decode(&first);
                    assert_eq!(
                        header.seq,
                        first_header.seq | 1,
                        "two-part request desync from node {source}"
                    );

                    let name = decode_name(&first);
                    let mode = decode_attr(&frame);
                    let excl = opcode == MqueueOpcode::CreateExcl;
                    let result = self.create(source, &name, mode, excl);
                    log::debug!("[mqueue] create name={name} node={source} -> {result:?}");
                    self.reply(source, ret_of(result), 0, 0)?;
                }
                MqueueOpcode::Open => {
                    let (name, read, write) = decode_open(&frame);
                    let result = self.open(source, &name, read, write);
                    log::debug!("[mqueue] open name={name} node={source} -> {result:?}");
                    self.reply(source, ret_of(result), 0, 0)?;
                }
                MqueueOpcode::Close => {
                    let mqueueid = decode_mqueueid(&frame);
                    let result = self.close(source, mqueueid);
                    self.reply(source, status_of(result), 0, 0)?;
                }
                MqueueOpcode::Unlink => {
                    let name = decode_name(&frame);
                    let result = self.unlink(source, &name);
                    self.reply(source, status_of(result), 0, 0)?;
                }
                MqueueOpcode::Send => {
                    let (mqueueid, len, prio) = decode_send(&frame);
                    self.handle_send(source, mqueueid, len, prio)?;
                }
                MqueueOpcode::Receive => {
                    let mqueueid = decode_mqueueid(&frame);
                    self.handle_receive(source, mqueueid)?;
                }
                MqueueOpcode::Exit => break,
                MqueueOpcode::Reply => {
                    log::warn!("[mqueue] unexpected reply frame from node {source}");
                }
            }
        }

        log::info!(
            "[mqueue] shutting down on node {node} after {} requests",
            self.nrequests
        );
        Ok(())
    }

    fn reply(&self, dest: NodeId, ret: i32, len: u32, prio: u32) -> NoctuaResult<()> {
        let frame = encode_reply(self.runtime.node(), ret, len, prio);
        protocol::send_to(&self.runtime, dest, &frame)
    }

    // ========================================================================
    // Payload transfers
    // ========================================================================

    /// Send: validate, grant the transfer, pull the payload in, store it.
    fn handle_send(&mut self, source: NodeId, mqueueid: u32, len: u32, prio: u32) -> NoctuaResult<()> {
        if let Err(err) = self.validate_send(source, mqueueid, len, prio) {
            return self.reply(source, err.code(), 0, 0);
        }

        // Permission: the client may now write the payload.
        self.reply(source, 0, 0, 0)?;
        let mut bytes = vec![0u8; len as usize];
        self.runtime.portals().allow(self.runtime.inportal(), source)?;
        let got = self
            .runtime
            .portals()
            .read(self.runtime.inportal(), &mut bytes)?;
        if got != len as usize {
            self.reply(source, NoctuaError::invalid("short transfer").code(), 0, 0)?;
            return Ok(());
        }

        let mqueue = self.mqueues[mqueueid as usize]
            .as_mut()
            .expect("validated queue");
        mqueue.insert(prio, bytes);
        self.reply(source, 0, 0, 0)
    }

    /// Receive: validate, announce the head, push the payload out, pop it.
    fn handle_receive(&mut self, source: NodeId, mqueueid: u32) -> NoctuaResult<()> {
        let (len, prio) = match self.validate_receive(source, mqueueid) {
            Ok(head) => head,
            Err(err) => return self.reply(source, err.code(), 0, 0),
        };

        self.reply(source, 0, len, prio)?;

        let outportal = self.runtime.portals().open(source)?;
        let bytes = {
            let mqueue = self.mqueues[mqueueid as usize]
                .as_ref()
                .expect("validated queue");
            mqueue.messages[0].bytes.clone()
        };
        let sent = self.runtime.portals().write(outportal, &bytes);
        self.runtime.portals().close(outportal)?;
        sent?;

        let mqueue = self.mqueues[mqueueid as usize]
            .as_mut()
            .expect("validated queue");
        mqueue.messages.remove(0);
        Ok(())
    }

    fn validate_send(
        &self,
        source: NodeId,
        mqueueid: u32,
        len: u32,
        prio: u32,
    ) -> NoctuaResult<()> {
        if len as usize > MQUEUE_MESSAGE_SIZE || len == 0 {
            return Err(NoctuaError::invalid(format!("bad message length {len}")));
        }
        if prio >= MQUEUE_PRIO_MAX {
            return Err(NoctuaError::invalid(format!("bad priority {prio}")));
        }
        let (mqueue, holder) = self.holder_of(source, mqueueid)?;
        if !holder.write {
            return Err(NoctuaError::PermissionDenied(
                "queue is not open for writing".into(),
            ));
        }
        if mqueue.is_full() {
            return Err(NoctuaError::again("message queue is full"));
        }
        Ok(())
    }

    fn validate_receive(&self, source: NodeId, mqueueid: u32) -> NoctuaResult<(u32, u32)> {
        let (mqueue, holder) = self.holder_of(source, mqueueid)?;
        if !holder.read {
            return Err(NoctuaError::PermissionDenied(
                "queue is not open for reading".into(),
            ));
        }
        let head = mqueue
            .messages
            .first()
            .ok_or_else(|| NoctuaError::again("message queue is empty"))?;
        Ok((head.bytes.len() as u32, head.prio))
    }

    // ========================================================================
    // Queue operations
    // ========================================================================

    fn lookup(&self, name: &str) -> Option<usize> {
        self.mqueues.iter().position(|slot| {
            slot.as_ref()
                .map(|mqueue| mqueue.name == name)
                .unwrap_or(false)
        })
    }

    fn create(&mut self, node: NodeId, name: &str, mode: u32, excl: bool) -> NoctuaResult<u32> {
        if name.is_empty() || name.len() >= MQUEUE_NAME_MAX {
            return Err(NoctuaError::NameTooLong(name.to_string()));
        }
        if self.lookup(name).is_some() {
            if excl {
                return Err(NoctuaError::already_exists(name));
            }
            return self.open(node, name, true, true);
        }

        let mqueueid = self
            .mqueues
            .iter()
            .position(|slot| slot.is_none())
            .ok_or_else(|| NoctuaError::again("message queue table is full"))?;

        let mqueue = Mqueue {
            name: name.to_string(),
            owner: node,
            mode,
            remove: false,
            holders: vec![Holder {
                node,
                read: true,
                write: true,
            }],
            messages: Vec::new(),
        };
        log::debug!(
            "[mqueue] new queue {name} owner={node} mode={:#o}",
            mqueue.mode
        );
        self.mqueues[mqueueid] = Some(mqueue);
        Ok(mqueueid as u32)
    }

    fn open(&mut self, node: NodeId, name: &str, read: bool, write: bool) -> NoctuaResult<u32> {
        let mqueueid = self
            .lookup(name)
            .ok_or_else(|| NoctuaError::not_found(name))?;
        let mqueue = self.mqueues[mqueueid].as_mut().expect("queue exists");
        if mqueue.remove {
            return Err(NoctuaError::not_found(name));
        }
        match mqueue.holders.iter_mut().find(|holder| holder.node == node) {
            Some(holder) => {
                holder.read |= read;
                holder.write |= write;
            }
            None => mqueue.holders.push(Holder { node, read, write }),
        }
        Ok(mqueueid as u32)
    }

    fn close(&mut self, node: NodeId, mqueueid: u32) -> NoctuaResult<()> {
        let (_, _) = self.holder_of(node, mqueueid)?;
        let mqueue = self.mqueues[mqueueid as usize]
            .as_mut()
            .expect("queue exists");
        mqueue.holders.retain(|holder| holder.node != node);
        if mqueue.holders.is_empty() && mqueue.remove {
            self.mqueues[mqueueid as usize] = None;
        }
        Ok(())
    }

    fn unlink(&mut self, node: NodeId, name: &str) -> NoctuaResult<()> {
        let mqueueid = self
            .lookup(name)
            .ok_or_else(|| NoctuaError::not_found(name))?;
        let mqueue = self.mqueues[mqueueid].as_mut().expect("queue exists");
        if mqueue.owner != node {
            return Err(NoctuaError::PermissionDenied(format!(
                "node {node} does not own queue {name}"
            )));
        }
        mqueue.remove = true;
        let is_holder = mqueue.holders.iter().any(|holder| holder.node == node);
        if is_holder {
            self.close(node, mqueueid as u32)?;
        } else if self.mqueues[mqueueid]
            .as_ref()
            .map(|mqueue| mqueue.holders.is_empty())
            .unwrap_or(false)
        {
            self.mqueues[mqueueid] = None;
        }
        Ok(())
    }

    fn holder_of(&self, node: NodeId, mqueueid: u32) -> NoctuaResult<(&Mqueue, Holder)> {
        let mqueue = self
            .mqueues
            .get(mqueueid as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| NoctuaError::invalid(format!("bad message queue id {mqueueid}")))?;
        let holder = mqueue
            .holders
            .iter()
            .copied()
            .find(|holder| holder.node == node)
            .ok_or_else(|| {
                NoctuaError::invalid(format!("node {node} has not opened queue {mqueueid}"))
            })?;
        Ok((mqueue, holder))
    }
}

fn ret_of(result: NoctuaResult<u32>) -> i32 {
    match result {
        Ok(id) => id as i32,
        Err(err) => err.code(),
    }
}

fn status_of(result: NoctuaResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}
