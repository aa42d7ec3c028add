//! Semaphore server
//!
//! A blocked `wait` is represented by a parked node id on the semaphore's
//! FIFO queue; the reply that would complete the client's request is sent
//! later, from the `post` that releases it. Invariant: the count is negative
//! exactly when the queue is non-empty, and its magnitude equals the queue
//! length.

use super::*;
use crate::protocol::{self, seq_is_second, RequestBuffer};
use noctua_core::fabric::Fabric;
use noctua_core::node::NodeRuntime;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug)]
struct Semaphore {
    name: String,
    owner: NodeId,
    mode: u32,
    count: i32,
    holders: Vec<NodeId>,
    remove: bool,
    queue: VecDeque<NodeId>,
}

/// The semaphore server.
pub struct SemaphoreServer {
    runtime: Arc<NodeRuntime>,
    semaphores: Vec<Option<Semaphore>>,
    reqbuf: RequestBuffer,
    nrequests: u64,
}

impl SemaphoreServer {
    /// Boots a semaphore server on `node`.
    pub fn spawn(fabric: &Arc<Fabric>, node: NodeId) -> JoinHandle<()> {
        let fabric2 = fabric.clone();
        fabric.spawn(node, move || {
            let runtime = NodeRuntime::init(fabric2, node).expect("semaphore server runtime");
            let mut server = SemaphoreServer::new(runtime);
            if let Err(err) = server.run() {
                log::error!("[semaphore] server died: {err}");
            }
        })
    }

    pub fn new(runtime: Arc<NodeRuntime>) -> Self {
        let nnodes = runtime.fabric().nnodes();
        Self {
            runtime,
            semaphores: (0..SEM_MAX).map(|_| None).collect(),
            reqbuf: RequestBuffer::new(nnodes),
            nrequests: 0,
        }
    }

    /// Serves requests until an exit frame arrives.
    pub fn run(&mut self) -> NoctuaResult<()> {
        let node = self.runtime.node();
        log::info!("[semaphore] booting on node {node}");
        self.runtime.fabric().fence_signal(node)?;
        log::info!("[semaphore] listening on node {node}");

        loop {
            let frame = protocol::recv_from_inbox(&self.runtime)?;
            let header = protocol::ControlHeader::decode(&frame);
            let opcode = match SemOpcode::try_from(header.opcode) {
                Ok(opcode) => opcode,
                Err(err) => {
                    log::warn!("[semaphore] dropping request: {err}");
                    continue;
                }
            };
            if header.source >= self.runtime.fabric().nnodes() {
                log::warn!(
                    "[semaphore] dropping request from bad source {}",
                    header.source
                );
                continue;
            }
            self.nrequests += 1;
            let source = header.source;

            match opcode {
                SemOpcode::Create | SemOpcode::CreateExcl => {
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
                    let (mode, value) = decode_attr(&frame);
                    let excl = opcode == SemOpcode::CreateExcl;
                    let result = self.create(source, &name, mode, value, excl);
                    log::debug!("[semaphore] create name={name} node={source} -> {result:?}");
                    self.reply(source, ret_of(result))?;
                }
                SemOpcode::Open => {
                    let name = decode_name(&frame);
                    let result = self.open(source, &name);
                    log::debug!("[semaphore] open name={name} node={source} -> {result:?}");
                    self.reply(source, ret_of(result))?;
                }
                SemOpcode::Close => {
                    let semid = decode_semid(&frame);
                    let result = self.close(source, semid);
                    self.reply(source, status_of(result))?;
                }
                SemOpcode::Unlink => {
                    let name = decode_name(&frame);
                    let result = self.unlink(source, &name);
                    self.reply(source, status_of(result))?;
                }
                SemOpcode::Wait => {
                    // A parked caller gets no reply: it stays blocked until
                    // a post hands it one.
                    match self.wait(source, decode_semid(&frame)) {
                        Ok(true) => self.reply(source, 0)?,
                        Ok(false) => {}
                        Err(err) => self.reply(source, err.code())?,
                    }
                }
                SemOpcode::Post => {
                    let result = self.post(source, decode_semid(&frame));
                    self.reply(source, status_of(result))?;
                }
                SemOpcode::Exit => break,
                SemOpcode::Reply => {
                    log::warn!("[semaphore] unexpected reply frame from node {source}");
                }
            }
        }

        log::info!(
            "[semaphore] shutting down on node {node} after {} requests",
            self.nrequests
        );
        Ok(())
    }

    fn reply(&self, dest: NodeId, ret: i32) -> NoctuaResult<()> {
        let frame = encode_reply(self.runtime.node(), ret);
        protocol::send_to(&self.runtime, dest, &frame)
    }

    // ========================================================================
    // Semaphore operations
    // ========================================================================

    fn lookup(&self, name: &str) -> Option<usize> {
        self.semaphores.iter().position(|slot| {
            slot.as_ref()
                .map(|semaphore| semaphore.name == name)
                .unwrap_or(false)
        })
    }

    fn create(
        &mut self,
        node: NodeId,
        name: &str,
        mode: u32,
        value: u32,
        excl: bool,
    ) -> NoctuaResult<u32> {
        if name.is_empty() || name.len() >= SEM_NAME_MAX {
            return Err(NoctuaError::NameTooLong(name.to_string()));
        }
        if value > SEM_VALUE_MAX {
            return Err(NoctuaError::invalid(format!(
                "initial value {value} above SEM_VALUE_MAX"
            )));
        }

        if self.lookup(name).is_some() {
            if excl {
                return Err(NoctuaError::already_exists(name));
            }
            return self.open(node, name);
        }

        let semid = self
            .semaphores
            .iter()
            .position(|slot| slot.is_none())
            .ok_or_else(|| NoctuaError::again("semaphore table is full"))?;

        let semaphore = Semaphore {
            name: name.to_string(),
            owner: node,
            mode,
            count: value as i32,
            holders: vec![node],
            remove: false,
            queue: VecDeque::new(),
        };
        log::debug!(
            "[semaphore] new semaphore {name} owner={node} mode={:#o} value={value}",
            semaphore.mode
        );
        self.semaphores[semid] = Some(semaphore);
        Ok(semid as u32)
    }

    fn open(&mut self, node: NodeId, name: &str) -> NoctuaResult<u32> {
        let semid = self
            .lookup(name)
            .ok_or_else(|| NoctuaError::not_found(name))?;
        let semaphore = self.semaphores[semid].as_mut().expect("semaphore exists");
        if semaphore.remove {
            return Err(NoctuaError::not_found(name));
        }
        if !semaphore.holders.contains(&node) {
            semaphore.holders.push(node);
        }
        Ok(semid as u32)
    }

    fn close(&mut self, node: NodeId, semid: u32) -> NoctuaResult<()> {
        let semaphore = self.holder_semaphore(node, semid)?;
        semaphore.holders.retain(|&holder| holder != node);
        let gone = semaphore.holders.is_empty() && semaphore.remove;
        if gone {
            self.semaphores[semid as usize] = None;
        }
        Ok(())
    }

    fn unlink(&mut self, node: NodeId, name: &str) -> NoctuaResult<()> {
        let semid = self
            .lookup(name)
            .ok_or_else(|| NoctuaError::not_found(name))?;
        let semaphore = self.semaphores[semid].as_mut().expect("semaphore exists");
        if semaphore.owner != node {
            return Err(NoctuaError::PermissionDenied(format!(
                "node {node} does not own semaphore {name}"
            )));
        }
        semaphore.remove = true;
        if semaphore.holders.contains(&node) {
            self.close(node, semid as u32)?;
        } else if self.semaphores[semid]
            .as_ref()
            .map(|semaphore| semaphore.holders.is_empty())
            .unwrap_or(false)
        {
            self.semaphores[semid] = None;
        }
        Ok(())
    }

    /// Returns whether the caller acquired the semaphore (true) or was
    /// parked (false).
    fn wait(&mut self, node: NodeId, semid: u32) -> NoctuaResult<bool> {
        let semaphore = self.holder_semaphore(node, semid)?;
        semaphore.count -= 1;
        let acquired = if semaphore.count < 0 {
            semaphore.queue.push_back(node);
            false
        } else {
            true
        };
        debug_assert_eq!(
            semaphore.queue.len() as i32,
            (-semaphore.count).max(0),
            "sleep queue out of sync with the count"
        );
        Ok(acquired)
    }

    fn post(&mut self, node: NodeId, semid: u32) -> NoctuaResult<()> {
        let server_node = self.runtime.node();
        let semaphore = self.holder_semaphore(node, semid)?;
        semaphore.count += 1;
        let woken = if semaphore.count <= 0 {
            Some(
                semaphore
                    .queue
                    .pop_front()
                    .expect("negative count implies a non-empty queue"),
            )
        } else {
            None
        };
        debug_assert_eq!(semaphore.queue.len() as i32, (-semaphore.count).max(0));

        if let Some(waiter) = woken {
            // Complete the waiter's parked request.
            let frame = encode_reply(server_node, 0);
            protocol::send_to(&self.runtime, waiter, &frame)?;
        }
        Ok(())
    }

    fn holder_semaphore(&mut self, node: NodeId, semid: u32) -> NoctuaResult<&mut Semaphore> {
        let semaphore = self
            .semaphores
            .get_mut(semid as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| NoctuaError::invalid(format!("bad semaphore id {semid}")))?;
        if !semaphore.holders.contains(&node) {
            return Err(NoctuaError::invalid(format!(
                "node {node} has not opened semaphore {semid}"
            )));
        }
        Ok(semaphore)
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
