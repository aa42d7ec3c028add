//! Shared memory server
//!
//! Runs on a dedicated I/O node. Keeps the global region table plus one open
//! table per node, and answers the request protocol of this module. Regions
//! marked for removal linger until their last holder closes.

use super::*;
use crate::protocol::{self, seq_is_second, RequestBuffer};
use noctua_core::error::{NoctuaError, NoctuaResult};
use noctua_core::fabric::Fabric;
use noctua_core::node::NodeRuntime;
use noctua_core::topology::NodeId;
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Debug)]
struct Region {
    name: String,
    owner: NodeId,
    mode: u32,
    base: u64,
    size: u64,
    refcount: usize,
    remove: bool,
    nodes: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, Default)]
struct OpenSlot {
    used: bool,
    shmid: usize,
    write: bool,
    shared: bool,
    mapped: bool,
}

/// The shared memory server.
pub struct ShmServer {
    runtime: Arc<NodeRuntime>,
    regions: Vec<Option<Region>>,
    procs: Vec<[OpenSlot; SHM_OPEN_MAX]>,
    reqbuf: RequestBuffer,
    nrequests: u64,
}

impl ShmServer {
    /// Boots a shared memory server on `node`.
    pub fn spawn(fabric: &Arc<Fabric>, node: NodeId) -> JoinHandle<()> {
        let fabric2 = fabric.clone();
        fabric.spawn(node, move || {
            let runtime = NodeRuntime::init(fabric2, node).expect("shm server runtime");
            let mut server = ShmServer::new(runtime);
            if let Err(err) = server.run() {
                log::error!("[shm] server died: {err}");
            }
        })
    }

    pub fn new(runtime: Arc<NodeRuntime>) -> Self {
        let nnodes = runtime.fabric().nnodes();
        Self {
            runtime,
            regions: (0..SHM_MAX).map(|_| None).collect(),
            procs: vec![[OpenSlot::default(); SHM_OPEN_MAX]; nnodes],
            reqbuf: RequestBuffer::new(nnodes),
            nrequests: 0,
        }
    }

    /// Serves requests until an exit frame arrives.
    pub fn run(&mut self) -> NoctuaResult<()> {
        let node = self.runtime.node();
        log::info!("[shm] booting on node {node}");
        self.runtime.fabric().fence_signal(node)?;
        log::info!("[shm] listening on node {node}");

        loop {
            let frame = protocol::recv_from_inbox(&self.runtime)?;
            let header = protocol::ControlHeader::decode(&frame);
            let opcode = match ShmOpcode::try_from(header.opcode) {
                Ok(opcode) => opcode,
                Err(err) => {
                    log::warn!("[shm] dropping request: {err}");
                    continue;
                }
            };
            if header.source >= self.runtime.fabric().nnodes() {
                log::warn!("[shm] dropping request from bad source {}", header.source);
                continue;
            }
            self.nrequests += 1;
            let source = header.source;

            match opcode {
                ShmOpcode::Create | ShmOpcode::CreateExcl | ShmOpcode::Open => {
                    // Two-part request: persist the name half, act on the
                    // attribute half.
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
                    let (mode, rw, trunc) = decode_attr(&frame);
                    let result = match opcode {
                        ShmOpcode::Create => self.create(source, &name, mode, rw, false),
                        ShmOpcode::CreateExcl => self.create(source, &name, mode, rw, true),
                        _ => self.open(source, &name, rw, trunc),
                    };
                    log::debug!("[shm] {opcode:?} name={name} node={source} -> {result:?}");
                    self.reply(source, ret_of(result), 0)?;
                }
                ShmOpcode::Unlink => {
                    let name = decode_name(&frame);
                    let result = self.unlink(source, &name);
                    log::debug!("[shm] unlink name={name} node={source} -> {result:?}");
                    self.reply(source, status_of(result), 0)?;
                }
                ShmOpcode::Map => {
                    let (oshmid, size, off, writable, shared) = decode_map(&frame);
                    match self.map(source, oshmid, size, off, writable, shared) {
                        Ok(mapblk) => self.reply(source, 0, mapblk)?,
                        Err(err) => self.reply(source, err.code(), 0)?,
                    }
                }
                ShmOpcode::Unmap => {
                    let oshmid = decode_oshmid(&frame);
                    let result = self.unmap(source, oshmid);
                    self.reply(source, status_of(result), 0)?;
                }
                ShmOpcode::Truncate => {
                    let (oshmid, size) = decode_truncate(&frame);
                    let result = self.truncate(source, oshmid, size);
                    self.reply(source, status_of(result), 0)?;
                }
                ShmOpcode::Close => {
                    let oshmid = decode_oshmid(&frame);
                    let result = self.close(source, oshmid);
                    self.reply(source, status_of(result), 0)?;
                }
                ShmOpcode::Exit => break,
                ShmOpcode::Reply => {
                    log::warn!("[shm] unexpected reply frame from node {source}");
                }
            }
        }

        log::info!(
            "[shm] shutting down on node {node} after {} requests",
            self.nrequests
        );
        Ok(())
    }

    fn reply(&self, dest: NodeId, ret: i32, mapblk: u64) -> NoctuaResult<()> {
        let frame = encode_reply(self.runtime.node(), ret, mapblk);
        protocol::send_to(&self.runtime, dest, &frame)
    }

    // ========================================================================
    // Region operations
    // ========================================================================

    fn lookup(&self, name: &str) -> Option<usize> {
        self.regions.iter().position(|slot| {
            slot.as_ref()
                .map(|region| region.name == name)
                .unwrap_or(false)
        })
    }

    fn region_is_mapped(&self, shmid: usize) -> bool {
        self.procs
            .iter()
            .flatten()
            .any(|slot| slot.used && slot.shmid == shmid && slot.mapped)
    }

    fn alloc_open_slot(&mut self, node: NodeId, shmid: usize, write: bool) -> NoctuaResult<u32> {
        let slots = &mut self.procs[node];
        let oshmid = slots
            .iter()
            .position(|slot| !slot.used)
            .ok_or_else(|| NoctuaError::TableFull(format!("node {node} open table")))?;
        slots[oshmid] = OpenSlot {
            used: true,
            shmid,
            write,
            shared: false,
            mapped: false,
        };
        Ok(oshmid as u32)
    }

    fn create(
        &mut self,
        node: NodeId,
        name: &str,
        mode: u32,
        rw: bool,
        excl: bool,
    ) -> NoctuaResult<u32> {
        if name.is_empty() || name.len() >= SHM_NAME_MAX {
            return Err(NoctuaError::NameTooLong(name.to_string()));
        }

        if self.lookup(name).is_some() {
            if excl {
                return Err(NoctuaError::already_exists(name));
            }
            return self.open(node, name, rw, false);
        }

        let shmid = self
            .regions
            .iter()
            .position(|slot| slot.is_none())
            .ok_or_else(|| NoctuaError::TableFull("region table".into()))?;

        let region = Region {
            name: name.to_string(),
            owner: node,
            mode,
            base: SHM_BASE_ADDR + shmid as u64 * SHM_MAP_WINDOW,
            size: 0,
            refcount: 1,
            remove: false,
            nodes: vec![node],
        };
        log::debug!(
            "[shm] new region {name} owner={node} mode={:#o} base={:#x}",
            region.mode,
            region.base
        );
        self.regions[shmid] = Some(region);
        self.alloc_open_slot(node, shmid, rw)
    }

    fn open(&mut self, node: NodeId, name: &str, rw: bool, trunc: bool) -> NoctuaResult<u32> {
        let shmid = self
            .lookup(name)
            .ok_or_else(|| NoctuaError::not_found(name))?;
        if self.regions[shmid]
            .as_ref()
            .map(|region| region.remove)
            .unwrap_or(true)
        {
            return Err(NoctuaError::not_found(name));
        }
        if trunc {
            if !rw {
                return Err(NoctuaError::invalid("truncating open needs write access"));
            }
            if self.region_is_mapped(shmid) {
                return Err(NoctuaError::busy(name));
            }
        }

        let oshmid = self.alloc_open_slot(node, shmid, rw)?;
        let region = self.regions[shmid].as_mut().expect("region exists");
        region.refcount += 1;
        region.nodes.push(node);
        if trunc {
            region.size = 0;
        }
        Ok(oshmid)
    }

    fn close(&mut self, node: NodeId, oshmid: u32) -> NoctuaResult<()> {
        let slot = self.open_slot(node, oshmid)?;
        let shmid = slot.shmid;
        self.procs[node][oshmid as usize] = OpenSlot::default();

        let region = self.regions[shmid].as_mut().expect("region exists");
        if let Some(pos) = region.nodes.iter().position(|&holder| holder == node) {
            region.nodes.remove(pos);
        }
        region.refcount -= 1;
        if region.refcount == 0 && region.remove {
            self.regions[shmid] = None;
        }
        Ok(())
    }

    fn unlink(&mut self, node: NodeId, name: &str) -> NoctuaResult<()> {
        let shmid = self
            .lookup(name)
            .ok_or_else(|| NoctuaError::not_found(name))?;
        let region = self.regions[shmid].as_mut().expect("region exists");
        if region.owner != node {
            return Err(NoctuaError::PermissionDenied(format!(
                "node {node} does not own region {name}"
            )));
        }
        region.remove = true;

        // Unlink also drops the caller's own open, if any.
        let own_open = self.procs[node]
            .iter()
            .position(|slot| slot.used && slot.shmid == shmid);
        if let Some(oshmid) = own_open {
            self.close(node, oshmid as u32)?;
        } else if self.regions[shmid]
            .as_ref()
            .map(|region| region.refcount == 0)
            .unwrap_or(false)
        {
            self.regions[shmid] = None;
        }
        Ok(())
    }

    fn map(
        &mut self,
        node: NodeId,
        oshmid: u32,
        size: u64,
        off: u64,
        writable: bool,
        shared: bool,
    ) -> NoctuaResult<u64> {
        let slot = self.open_slot(node, oshmid)?;
        let shmid = slot.shmid;
        let can_write = slot.write;
        let region = self.regions[shmid].as_ref().expect("region exists");

        if size > region.size {
            return Err(NoctuaError::ResourceExhausted(format!(
                "mapping of {size} bytes exceeds region"
            )));
        }
        if off > region.size || off + size > region.size {
            return Err(NoctuaError::invalid("mapping range outside region"));
        }
        if writable && !can_write {
            return Err(NoctuaError::PermissionDenied(
                "writable mapping of a read-only open".into(),
            ));
        }

        let mapblk = region.base + off;
        let slot = &mut self.procs[node][oshmid as usize];
        if !slot.mapped {
            slot.mapped = true;
            if shared {
                slot.shared = true;
            }
        }
        Ok(mapblk)
    }

    fn unmap(&mut self, node: NodeId, oshmid: u32) -> NoctuaResult<()> {
        let slot = self.open_slot(node, oshmid)?;
        if !slot.mapped {
            return Err(NoctuaError::invalid("region is not mapped"));
        }
        log::debug!(
            "[shm] unmap node={node} oshmid={oshmid} shared={}",
            slot.shared
        );
        let slot = &mut self.procs[node][oshmid as usize];
        slot.mapped = false;
        slot.shared = false;
        Ok(())
    }

    fn truncate(&mut self, node: NodeId, oshmid: u32, size: u64) -> NoctuaResult<()> {
        let slot = self.open_slot(node, oshmid)?;
        if size > SHM_MAP_WINDOW {
            return Err(NoctuaError::ResourceExhausted(format!(
                "region of {size} bytes exceeds backing memory"
            )));
        }
        if !slot.write {
            return Err(NoctuaError::invalid("truncate needs write access"));
        }
        let shmid = slot.shmid;
        if self.region_is_mapped(shmid) {
            return Err(NoctuaError::busy("region is mapped"));
        }
        self.regions[shmid].as_mut().expect("region exists").size = size;
        Ok(())
    }

    fn open_slot(&self, node: NodeId, oshmid: u32) -> NoctuaResult<OpenSlot> {
        let slots = &self.procs[node];
        let slot = slots
            .get(oshmid as usize)
            .copied()
            .filter(|slot| slot.used)
            .ok_or_else(|| NoctuaError::invalid(format!("bad open region id {oshmid}")))?;
        Ok(slot)
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
