//! Generic endpoint resource table
//!
//! Every communication layer owns a fixed-size table of endpoints. The table
//! entries share a small flag record: `used`, `busy`, a transfer direction,
//! and the `shared`/`mapped` markers used by memory endpoints. All flag
//! transitions happen under the owning layer's lock.
//!
//! The `busy` flag implements the blocking discipline: an operation that is
//! about to sleep marks its entry busy, releases the layer lock, performs the
//! blocking transfer, re-acquires the lock, and clears the flag. Any other
//! operation that finds the entry busy waits on the layer's condvar and
//! retries.

/// Flag record shared by all endpoint kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct Resource {
    used: bool,
    busy: bool,
    readable: bool,
    writable: bool,
    shared: bool,
    mapped: bool,
}

impl Resource {
    pub fn is_used(&self) -> bool {
        self.used
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    pub fn set_busy(&mut self) {
        debug_assert!(self.used);
        self.busy = true;
    }

    pub fn set_notbusy(&mut self) {
        self.busy = false;
    }

    /// Marks the endpoint read-only (an input endpoint).
    pub fn set_rdonly(&mut self) {
        self.readable = true;
        self.writable = false;
    }

    /// Marks the endpoint write-only (an output endpoint).
    pub fn set_wronly(&mut self) {
        self.readable = false;
        self.writable = true;
    }

    /// Marks the endpoint read-write (memory endpoints only).
    pub fn set_rdwr(&mut self) {
        self.readable = true;
        self.writable = true;
    }

    pub fn set_shared(&mut self) {
        self.shared = true;
    }

    pub fn set_mapped(&mut self) {
        self.mapped = true;
    }

    pub fn set_unmapped(&mut self) {
        self.mapped = false;
    }
}

/// Fixed-size pool of endpoint flag records.
///
/// The payload of each endpoint lives in a parallel table owned by the layer;
/// the pool only hands out indices and tracks the flag records.
#[derive(Debug)]
pub struct ResourcePool {
    entries: Vec<Resource>,
}

impl ResourcePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![Resource::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Allocates the first free entry, marking it used.
    pub fn alloc(&mut self) -> Option<usize> {
        for (id, entry) in self.entries.iter_mut().enumerate() {
            if !entry.used {
                *entry = Resource {
                    used: true,
                    ..Resource::default()
                };
                return Some(id);
            }
        }
        None
    }

    /// Releases an entry, clearing every flag.
    pub fn free(&mut self, id: usize) {
        debug_assert!(self.entries[id].used);
        self.entries[id] = Resource::default();
    }

    pub fn get(&self, id: usize) -> &Resource {
        &self.entries[id]
    }

    pub fn get_mut(&mut self, id: usize) -> &mut Resource {
        &mut self.entries[id]
    }

    pub fn is_valid(&self, id: usize) -> bool {
        id < self.entries.len()
    }

    /// Iterates over used entries.
    pub fn iter_used(&self) -> impl Iterator<Item = (usize, &Resource)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_scans_first_free() {
        let mut pool = ResourcePool::new(4);
        assert_eq!(pool.alloc(), Some(0));
        assert_eq!(pool.alloc(), Some(1));
        pool.free(0);
        assert_eq!(pool.alloc(), Some(0));
        assert_eq!(pool.alloc(), Some(2));
        assert_eq!(pool.alloc(), Some(3));
        assert_eq!(pool.alloc(), None);
    }

    #[test]
    fn test_free_clears_all_flags() {
        let mut pool = ResourcePool::new(1);
        let id = pool.alloc().unwrap();
        pool.get_mut(id).set_rdwr();
        pool.get_mut(id).set_shared();
        pool.get_mut(id).set_mapped();
        pool.get_mut(id).set_busy();
        pool.free(id);
        let entry = pool.get(id);
        assert!(!entry.is_used());
        assert!(!entry.is_busy());
        assert!(!entry.is_readable());
        assert!(!entry.is_writable());
        assert!(!entry.is_shared());
        assert!(!entry.is_mapped());
    }

    #[test]
    fn test_directions_are_exclusive() {
        let mut res = Resource::default();
        res.used = true;
        res.set_rdonly();
        assert!(res.is_readable() && !res.is_writable());
        res.set_wronly();
        assert!(!res.is_readable() && res.is_writable());
        res.set_rdwr();
        assert!(res.is_readable() && res.is_writable());
    }
}
