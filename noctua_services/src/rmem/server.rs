//! Remote memory server
//!
//! One server exports one block store. Allocation state lives in a word
//! bitmap with an owner table beside it; the data path is either one portal
//! transfer per block or a chunked mailbox exchange, chosen at boot.
//!
//! Reads and writes of unallocated blocks are fail-soft: the transfer is
//! served through reserved block 0 and the reply carries `EFAULT`.

use super::*;
use noctua_core::bitmap::Bitmap;
use noctua_core::config::RmemDataPath;
use noctua_core::fabric::Fabric;
use noctua_core::node::NodeRuntime;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// Operation counters, dumped at shutdown.
#[derive(Debug, Default, Clone)]
pub struct RmemStats {
    pub nallocs: u64,
    pub nfrees: u64,
    pub nreads: u64,
    pub nwrites: u64,
    pub nblocks: u64,
    pub talloc: u64,
    pub tfree: u64,
    pub tread: u64,
    pub twrite: u64,
    pub tstart: u64,
    pub tshutdown: u64,
}

/// One remote memory server.
pub struct RmemServer {
    runtime: Arc<NodeRuntime>,
    index: usize,
    data_path: RmemDataPath,
    blocks: Vec<u8>,
    bitmap: Bitmap,
    owners: Vec<NodeId>,
    stats: RmemStats,
    boot: Instant,
}

impl RmemServer {
    /// Boots remote memory server number `index` on `node`.
    pub fn spawn(
        fabric: &Arc<Fabric>,
        node: NodeId,
        index: usize,
        data_path: RmemDataPath,
    ) -> JoinHandle<()> {
        let fabric2 = fabric.clone();
        fabric.spawn(node, move || {
            let runtime = NodeRuntime::init(fabric2, node).expect("rmem server runtime");
            let mut server = RmemServer::new(runtime, index, data_path);
            if let Err(err) = server.run() {
                log::error!("[rmem{index}] server died: {err}");
            }
        })
    }

    pub fn new(runtime: Arc<NodeRuntime>, index: usize, data_path: RmemDataPath) -> Self {
        let mut bitmap = Bitmap::new(RMEM_NUM_BLOCKS);
        // First block is special.
        bitmap.set(0);

        let mut stats = RmemStats::default();
        stats.nblocks = 1;

        Self {
            runtime,
            index,
            data_path,
            blocks: vec![0u8; RMEM_SIZE],
            bitmap,
            owners: vec![0; RMEM_NUM_BLOCKS],
            stats,
            boot: Instant::now(),
        }
    }

    pub fn stats(&self) -> &RmemStats {
        &self.stats
    }

    /// Serves requests until an exit frame arrives.
    pub fn run(&mut self) -> NoctuaResult<()> {
        let node = self.runtime.node();
        let index = self.index;
        log::info!("[rmem{index}] booting on node {node}");
        self.stats.tstart = self.boot.elapsed().as_nanos() as u64;

        // Bring the data plane up before going alive: every client slot is
        // online once the fence opens.
        for peer in 0..self.runtime.fabric().nnodes() {
            if peer != node {
                self.runtime.portals().open(peer)?;
            }
        }
        self.runtime.fabric().fence_signal(node)?;
        log::info!(
            "[rmem{index}] listening on node {node} ({RMEM_NUM_BLOCKS} blocks of {RMEM_BLOCK_SIZE} bytes)"
        );

        loop {
            let frame = crate::protocol::recv_from_inbox(&self.runtime)?;
            let mut msg = RmemMessage::decode(&frame);
            let opcode = match msg.opcode() {
                Ok(opcode) => opcode,
                Err(err) => {
                    log::warn!("[rmem{index}] dropping request: {err}");
                    continue;
                }
            };
            if msg.source >= self.runtime.fabric().nnodes() {
                log::warn!("[rmem{index}] dropping request from bad source {}", msg.source);
                continue;
            }

            log::debug!(
                "[rmem{index}] request source={} opcode={opcode:?} blknum={:#x}",
                msg.source,
                msg.blknum
            );

            match opcode {
                RmemOpcode::Alloc => {
                    self.stats.nallocs += 1;
                    let t0 = Instant::now();
                    match self.alloc(msg.source) {
                        Some(page) => {
                            msg.blknum = page.0;
                            msg.errcode = 0;
                        }
                        None => {
                            msg.blknum = RPage::NULL.0;
                            msg.errcode = NoctuaError::ResourceExhausted("blocks".into()).code();
                        }
                    }
                    self.reply(&mut msg)?;
                    self.stats.talloc += t0.elapsed().as_nanos() as u64;
                }
                RmemOpcode::Free => {
                    self.stats.nfrees += 1;
                    let t0 = Instant::now();
                    msg.errcode = match self.free(msg.page(), msg.source) {
                        Ok(()) => 0,
                        Err(err) => err.code(),
                    };
                    self.reply(&mut msg)?;
                    self.stats.tfree += t0.elapsed().as_nanos() as u64;
                }
                RmemOpcode::Write => {
                    self.stats.nwrites += 1;
                    let t0 = Instant::now();
                    self.handle_write(&mut msg)?;
                    self.stats.twrite += t0.elapsed().as_nanos() as u64;
                }
                RmemOpcode::Read => {
                    self.stats.nreads += 1;
                    let t0 = Instant::now();
                    self.handle_read(&mut msg)?;
                    self.stats.tread += t0.elapsed().as_nanos() as u64;
                }
                RmemOpcode::Exit => {
                    self.stats.tshutdown = self.boot.elapsed().as_nanos() as u64;
                    break;
                }
                RmemOpcode::Reply => {
                    log::warn!("[rmem{index}] unexpected reply frame from node {}", msg.source);
                }
            }
        }

        log::info!(
            "[rmem{index}] nallocs={} nfrees={} nreads={} nwrites={} nblocks={}",
            self.stats.nallocs,
            self.stats.nfrees,
            self.stats.nreads,
            self.stats.nwrites,
            self.stats.nblocks
        );
        log::info!(
            "[rmem{index}] talloc={}ns tfree={}ns tread={}ns twrite={}ns uptime={}ns",
            self.stats.talloc,
            self.stats.tfree,
            self.stats.tread,
            self.stats.twrite,
            self.stats.tshutdown - self.stats.tstart
        );
        Ok(())
    }

    fn reply(&self, msg: &mut RmemMessage) -> NoctuaResult<()> {
        let dest = msg.source;
        msg.opcode = RmemOpcode::Reply as u8;
        crate::protocol::send_to(&self.runtime, dest, &msg.encode())
    }

    // ========================================================================
    // Block operations
    // ========================================================================

    fn alloc(&mut self, owner: NodeId) -> Option<RPage> {
        let bit = self.bitmap.first_free()?;
        self.bitmap.set(bit);
        self.owners[bit] = owner;
        self.stats.nblocks += 1;
        log::debug!(
            "[rmem{}] alloc blknum={bit} nblocks={}/{RMEM_NUM_BLOCKS}",
            self.index,
            self.stats.nblocks
        );
        Some(RPage::new(self.index, bit as u32))
    }

    fn free(&mut self, page: RPage, owner: NodeId) -> NoctuaResult<()> {
        let block = page.block() as usize;

        // Block 0 is never freeable.
        if page.is_null() || block == 0 || block >= RMEM_NUM_BLOCKS {
            return Err(NoctuaError::faulted(format!("bad block number {block}")));
        }
        if !self.bitmap.check(block) {
            return Err(NoctuaError::faulted(format!("double free of block {block}")));
        }
        if self.owners[block] != owner {
            return Err(NoctuaError::faulted(format!(
                "node {owner} does not own block {block}"
            )));
        }

        self.block_mut(block).fill(0);
        self.bitmap.clear(block);
        self.stats.nblocks -= 1;
        log::debug!(
            "[rmem{}] free blknum={block} nblocks={}/{RMEM_NUM_BLOCKS}",
            self.index,
            self.stats.nblocks
        );
        Ok(())
    }

    /// Resolves a data-path target block, substituting block 0 for bad ones.
    fn resolve(&self, page: RPage) -> (usize, i32) {
        let block = page.block() as usize;
        if page.is_null() || block >= RMEM_NUM_BLOCKS || !self.bitmap.check(block) {
            (0, NoctuaError::faulted("unallocated block").code())
        } else {
            (block, 0)
        }
    }

    fn handle_write(&mut self, msg: &mut RmemMessage) -> NoctuaResult<()> {
        match self.data_path {
            RmemDataPath::Portal => {
                let (block, errcode) = self.resolve(msg.page());
                let source = msg.source;

                let mut buf = vec![0u8; RMEM_BLOCK_SIZE];
                self.runtime
                    .portals()
                    .allow(self.runtime.inportal(), source)?;
                let got = self
                    .runtime
                    .portals()
                    .read(self.runtime.inportal(), &mut buf)?;
                self.block_mut(block)[..got].copy_from_slice(&buf[..got]);

                msg.errcode = errcode;
                self.reply(msg)
            }
            RmemDataPath::Mailbox => {
                // One chunk per request frame.
                let (block, errcode) = self.resolve(msg.page());
                let off = msg.offset as usize;
                if off + RMEM_PAYLOAD_SIZE > RMEM_BLOCK_SIZE {
                    msg.errcode = NoctuaError::invalid("bad chunk offset").code();
                    return self.reply(msg);
                }
                let payload = msg.payload;
                self.block_mut(block)[off..off + RMEM_PAYLOAD_SIZE].copy_from_slice(&payload);
                msg.errcode = errcode;
                self.reply(msg)
            }
        }
    }

    fn handle_read(&mut self, msg: &mut RmemMessage) -> NoctuaResult<()> {
        let (block, errcode) = self.resolve(msg.page());
        let source = msg.source;

        match self.data_path {
            RmemDataPath::Portal => {
                let outportal = self.runtime.portals().open(source)?;
                let data = self.block(block).to_vec();
                let sent = self.runtime.portals().write(outportal, &data);
                self.runtime.portals().close(outportal)?;
                sent?;
            }
            RmemDataPath::Mailbox => {
                // The whole block, one chunk frame at a time.
                for chunk in 0..RMEM_CHUNKS_PER_BLOCK {
                    let off = chunk * RMEM_PAYLOAD_SIZE;
                    let mut data = RmemMessage::request(RmemOpcode::Reply, source, msg.page());
                    data.offset = off as u32;
                    data.errcode = errcode;
                    data.payload
                        .copy_from_slice(&self.block(block)[off..off + RMEM_PAYLOAD_SIZE]);
                    crate::protocol::send_to(&self.runtime, source, &data.encode())?;
                }
            }
        }

        msg.errcode = errcode;
        self.reply(msg)
    }

    fn block(&self, block: usize) -> &[u8] {
        &self.blocks[block * RMEM_BLOCK_SIZE..(block + 1) * RMEM_BLOCK_SIZE]
    }

    fn block_mut(&mut self, block: usize) -> &mut [u8] {
        &mut self.blocks[block * RMEM_BLOCK_SIZE..(block + 1) * RMEM_BLOCK_SIZE]
    }
}
