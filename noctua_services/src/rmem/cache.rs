//! Client-side remote page cache
//!
//! Sits between application code and the remote memory servers. Lines are
//! grouped into cache blocks of consecutive pages; ages and policy metadata
//! live on the block head, reference counts on the individual lines. A line
//! whose reference count is positive is pinned and never evicted.
//!
//! The replacement policy changes only the eviction choice and the
//! age-update rules; the write policy decides when dirty data travels back
//! to the server.

use super::{RPage, RmemClient, RMEM_BLOCK_SIZE, RMEM_NUM_BLOCKS};
use noctua_core::error::{NoctuaError, NoctuaResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Default number of cache blocks.
pub const RMEM_CACHE_LENGTH: usize = 32;

/// Default number of consecutive pages per cache block.
pub const RMEM_CACHE_BLOCK_SIZE: usize = 1;

/// Page replacement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementPolicy {
    /// Evict the oldest load; random among ties.
    Fifo,
    /// Evict the newest load.
    Lifo,
    /// Not-frequently-used counters.
    Nfu,
    /// Shift-and-set aging counters.
    Aging,
    /// No caching: a single scratch line, every access goes remote.
    Bypass,
}

/// Write-back or write-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    WriteBack,
    WriteThrough,
}

/// Cache geometry and policies, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of cache blocks.
    pub length: usize,
    /// Consecutive pages per cache block.
    pub block_size: usize,
    pub replacement: ReplacementPolicy,
    pub write: WritePolicy,
    /// Hits between NFU/Aging age updates.
    pub update_freq: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            length: RMEM_CACHE_LENGTH,
            block_size: RMEM_CACHE_BLOCK_SIZE,
            replacement: ReplacementPolicy::Fifo,
            write: WritePolicy::WriteBack,
            update_freq: 1,
        }
    }
}

/// Hit/miss/allocation counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub nhits: u64,
    pub nmisses: u64,
    pub nallocs: u64,
}

/// Introspection snapshot of one line (tests and diagnostics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineInfo {
    pub pgnum: Option<RPage>,
    pub age: u32,
    pub ref_count: i32,
}

struct CacheLine {
    pgnum: RPage,
    data: Vec<u8>,
    age: u32,
    ref_count: i32,
    referenced: bool,
    dirty: bool,
}

impl CacheLine {
    fn empty() -> Self {
        Self {
            pgnum: RPage::NULL,
            data: vec![0u8; RMEM_BLOCK_SIZE],
            age: 0,
            ref_count: 0,
            referenced: false,
            dirty: false,
        }
    }
}

/// The remote page cache.
pub struct RemoteCache {
    client: RmemClient,
    config: CacheConfig,
    lines: Vec<CacheLine>,
    clock: u32,
    update_count: u32,
    stats: CacheStats,
    rng: StdRng,
}

impl RemoteCache {
    pub fn new(client: RmemClient, config: CacheConfig) -> Self {
        assert!(config.length >= 1 && config.block_size >= 1);
        assert!(config.update_freq >= 1);
        let nlines = config.length * config.block_size;
        Self {
            client,
            config,
            lines: (0..nlines).map(|_| CacheLine::empty()).collect(),
            clock: 0,
            update_count: 0,
            stats: CacheStats::default(),
            rng: StdRng::from_entropy(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn clock(&self) -> u32 {
        self.clock
    }

    /// Snapshot of every line (tests and diagnostics).
    pub fn line_info(&self) -> Vec<LineInfo> {
        self.lines
            .iter()
            .map(|line| LineInfo {
                pgnum: (!line.pgnum.is_null()).then_some(line.pgnum),
                age: line.age,
                ref_count: line.ref_count,
            })
            .collect()
    }

    /// Switches the replacement policy.
    pub fn select_replacement(&mut self, policy: ReplacementPolicy) {
        self.config.replacement = policy;
    }

    /// Switches the write policy.
    pub fn select_write(&mut self, policy: WritePolicy) {
        self.config.write = policy;
    }

    /// Allocates a remote page (no line is claimed yet).
    pub fn alloc(&mut self) -> NoctuaResult<RPage> {
        let page = self.client.alloc()?;
        self.stats.nallocs += 1;
        Ok(page)
    }

    /// Frees a remote page, dropping any cached copy.
    pub fn free(&mut self, pgnum: RPage) -> NoctuaResult<()> {
        validate(pgnum)?;

        for line in &mut self.lines {
            if line.pgnum == pgnum {
                line.pgnum = RPage::NULL;
                line.age = 0;
                line.ref_count = 0;
                line.referenced = false;
                line.dirty = false;
            }
        }
        self.stats.nallocs = self.stats.nallocs.saturating_sub(1);
        self.client.free(pgnum)
    }

    /// Drops every line without writing anything back.
    pub fn clean(&mut self) {
        for line in &mut self.lines {
            debug_assert!(line.ref_count == 0, "cleaning a pinned cache");
            line.pgnum = RPage::NULL;
            line.age = 0;
            line.ref_count = 0;
            line.referenced = false;
            line.dirty = false;
        }
    }

    /// Returns a pinned, writable view of the page, loading it on a miss.
    ///
    /// The pin lasts until the matching [`RemoteCache::put`].
    pub fn get(&mut self, pgnum: RPage) -> NoctuaResult<&mut [u8]> {
        self.clock += 1;
        validate(pgnum)?;

        // Bypass mode: the single scratch line, always remote.
        if self.config.replacement == ReplacementPolicy::Bypass {
            self.stats.nmisses += 1;
            let line = &mut self.lines[0];
            self.client.read(pgnum, &mut line.data)?;
            line.pgnum = pgnum;
            return Ok(&mut self.lines[0].data);
        }

        if let Some(idx) = self.search(pgnum) {
            self.stats.nhits += 1;
            self.age_update_hit(pgnum);
            let line = &mut self.lines[idx];
            line.ref_count += 1;
            line.dirty = true;
            return Ok(&mut line.data);
        }

        self.stats.nmisses += 1;
        let head = self.choose_victim()?;

        // Write the victim block back before it is reused.
        if !self.lines[head].pgnum.is_null() && self.block_is_dirty(head) {
            self.flush_block(head)?;
        }

        // Load the whole cache block, aligned down.
        let block_size = self.config.block_size as u32;
        let base = RPage::new(
            pgnum.server(),
            (pgnum.block() / block_size) * block_size,
        );
        for line in &mut self.lines[head..head + self.config.block_size] {
            line.pgnum = RPage::NULL;
        }
        for delta in 0..self.config.block_size {
            let page = base.offset(delta as u32);
            let line = &mut self.lines[head + delta];
            self.client.read(page, &mut line.data)?;
            line.pgnum = page;
            line.dirty = false;
        }

        self.age_update_load(pgnum);

        let idx = head + (pgnum.block() - base.block()) as usize;
        let line = &mut self.lines[idx];
        line.ref_count += 1;
        line.dirty = true;
        Ok(&mut line.data)
    }

    /// Unpins a page. `strike` biases NFU retention.
    ///
    /// Under write-through the whole cache block is flushed.
    pub fn put(&mut self, pgnum: RPage, strike: u32) -> NoctuaResult<()> {
        validate(pgnum)?;

        // Bypass mode: write the scratch line straight back.
        if self.config.replacement == ReplacementPolicy::Bypass {
            if self.lines[0].pgnum != pgnum {
                return Err(NoctuaError::faulted("page is not the scratch line"));
            }
            return self.client.write(pgnum, &self.lines[0].data);
        }

        let idx = self
            .search(pgnum)
            .ok_or_else(|| NoctuaError::faulted("page is not cached"))?;

        if self.config.replacement == ReplacementPolicy::Nfu {
            let head = self.block_head(idx);
            self.lines[head].age += strike;
        }
        if self.lines[idx].ref_count <= 0 {
            return Err(NoctuaError::faulted("page is not pinned"));
        }
        if self.config.write == WritePolicy::WriteThrough {
            self.flush(pgnum)?;
        }
        self.lines[idx].ref_count -= 1;
        Ok(())
    }

    /// Writes back the whole cache block holding `pgnum`.
    pub fn flush(&mut self, pgnum: RPage) -> NoctuaResult<()> {
        validate(pgnum)?;

        let idx = self
            .search(pgnum)
            .ok_or_else(|| NoctuaError::faulted("page is not cached"))?;
        self.flush_block(self.block_head(idx))
    }

    // ========================================================================
    // Replacement machinery
    // ========================================================================

    fn block_head(&self, idx: usize) -> usize {
        idx - idx % self.config.block_size
    }

    fn block_is_dirty(&self, head: usize) -> bool {
        self.lines[head..head + self.config.block_size]
            .iter()
            .any(|line| line.dirty)
    }

    fn block_is_pinned(&self, head: usize) -> bool {
        self.lines[head..head + self.config.block_size]
            .iter()
            .any(|line| line.ref_count > 0)
    }

    /// Writes every line of a block back to the server.
    fn flush_block(&mut self, head: usize) -> NoctuaResult<()> {
        for delta in 0..self.config.block_size {
            let line = &mut self.lines[head + delta];
            if line.pgnum.is_null() {
                continue;
            }
            self.client.write(line.pgnum, &line.data)?;
            line.dirty = false;
        }
        Ok(())
    }

    /// Finds the line holding `pgnum`, scanning block heads first.
    fn search(&self, pgnum: RPage) -> Option<usize> {
        let block_size = self.config.block_size;
        for block in 0..self.config.length {
            let head = &self.lines[block * block_size];
            if head.pgnum.is_null() || head.pgnum.server() != pgnum.server() {
                continue;
            }
            let delta = pgnum.block().wrapping_sub(head.pgnum.block()) as usize;
            if delta < block_size {
                for idx in block * block_size..(block + 1) * block_size {
                    if self.lines[idx].pgnum == pgnum {
                        return Some(idx);
                    }
                }
            }
        }
        None
    }

    /// Picks the head of the block to (re)use.
    ///
    /// Pinned blocks are never chosen; a fully pinned cache fails the miss.
    fn choose_victim(&mut self) -> NoctuaResult<usize> {
        let block_size = self.config.block_size;

        // Cache has space.
        for block in 0..self.config.length {
            let head = block * block_size;
            if self.lines[head].pgnum.is_null() && !self.block_is_pinned(head) {
                return Ok(head);
            }
        }

        let eligible: Vec<usize> = (0..self.config.length)
            .map(|block| block * block_size)
            .filter(|&head| !self.block_is_pinned(head))
            .collect();
        if eligible.is_empty() {
            return Err(NoctuaError::ResourceExhausted(
                "every cache block is pinned".into(),
            ));
        }

        match self.config.replacement {
            ReplacementPolicy::Lifo => {
                // Newest load goes first.
                let max_age = eligible
                    .iter()
                    .map(|&head| self.lines[head].age)
                    .max()
                    .expect("eligible is non-empty");
                Ok(*eligible
                    .iter()
                    .find(|&&head| self.lines[head].age == max_age)
                    .expect("a block has the max age"))
            }
            // FIFO, NFU, and Aging all evict the minimum age; ties are
            // broken at random.
            _ => {
                let min_age = eligible
                    .iter()
                    .map(|&head| self.lines[head].age)
                    .min()
                    .expect("eligible is non-empty");
                let ties: Vec<usize> = eligible
                    .into_iter()
                    .filter(|&head| self.lines[head].age == min_age)
                    .collect();
                Ok(ties[self.rng.gen_range(0..ties.len())])
            }
        }
    }

    // ========================================================================
    // Age update rules
    // ========================================================================

    /// On-hit rule of the active policy.
    fn age_update_hit(&mut self, pgnum: RPage) {
        match self.config.replacement {
            ReplacementPolicy::Nfu => {
                let Some(idx) = self.search(pgnum) else { return };
                let head = self.block_head(idx);
                self.update_count += 1;
                if self.update_count == self.config.update_freq {
                    if self.lines[head].referenced {
                        self.lines[head].age += 1;
                        self.lines[head].referenced = self.config.update_freq == 1;
                    }
                    self.update_count = 0;
                } else {
                    self.lines[head].referenced = true;
                }
            }
            ReplacementPolicy::Aging => self.aging_step(pgnum),
            // FIFO and LIFO ages change only on load.
            _ => {}
        }
    }

    /// On-load rule of the active policy.
    fn age_update_load(&mut self, pgnum: RPage) {
        let Some(idx) = self.search(pgnum) else { return };
        let head = self.block_head(idx);
        match self.config.replacement {
            ReplacementPolicy::Nfu => {
                self.lines[head].age = 1;
                self.lines[head].referenced = true;
            }
            ReplacementPolicy::Aging => {
                self.lines[head].age = 0;
                self.lines[head].referenced = true;
                self.aging_step(pgnum);
            }
            _ => self.lines[head].age = self.clock,
        }
    }

    /// Aging: every `update_freq` hits, shift every block's age right and
    /// set the high bit of the referenced block.
    fn aging_step(&mut self, pgnum: RPage) {
        let hit_head = self.search(pgnum).map(|idx| self.block_head(idx));
        self.update_count += 1;
        if self.update_count == self.config.update_freq {
            let block_size = self.config.block_size;
            for block in 0..self.config.length {
                let head = block * block_size;
                let mut age = self.lines[head].age >> 1;
                if Some(head) == hit_head && self.lines[head].referenced {
                    age |= 1 << (u32::BITS - 1);
                    self.lines[head].referenced = self.config.update_freq == 1;
                }
                self.lines[head].age = age;
            }
            self.update_count = 0;
        } else if let Some(head) = hit_head {
            self.lines[head].referenced = true;
        }
    }
}

fn validate(pgnum: RPage) -> NoctuaResult<()> {
    if pgnum.is_null() || pgnum.block() as usize >= RMEM_NUM_BLOCKS {
        return Err(NoctuaError::faulted(format!(
            "bad page handle {:#x}",
            pgnum.0
        )));
    }
    Ok(())
}
