use crate::error::Result;
use crate::paging::PageFile;
use indexmap::IndexMap;

/// A page-sized unit that can live in one of the caches. The owning cache
/// passes the page file into `sync` instead of the page keeping a cache or
/// file reference of its own.
pub(crate) trait Cacheable {
    fn key(&self) -> u64;
    fn ref_count(&self) -> u32;
    fn inc_ref_count(&mut self);
    fn dec_ref_count(&mut self);
    fn set_ref_count(&mut self, count: u32);
    fn is_dirty(&self) -> bool;
    fn allow_unload(&self) -> bool;
    fn sync(&mut self, file: &PageFile) -> Result<()>;
}

/// Occupancy and hit/miss counters for one cache.
#[derive(Debug, Clone, Copy)]
pub struct BufferStats {
    pub buffers: usize,
    pub used: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Bounded cache for data pages with a clock-style eviction policy.
///
/// Entries keep their insertion order. When the map outgrows its capacity,
/// the sweep walks the entries in that order, decrementing reference counts
/// as it goes, and evicts the first page whose count dropped below one,
/// writing it back first when dirty. Pages with high reference counts can
/// starve the sweep for a while; callers bound residency by not over-pinning.
pub(crate) struct ClockCache<T: Cacheable> {
    capacity: usize,
    map: IndexMap<u64, T>,
    hits: u64,
    misses: u64,
}

impl<T: Cacheable> ClockCache<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: IndexMap::with_capacity(capacity + 1),
            hits: 0,
            misses: 0,
        }
    }

    /// Insert `item`, or bump its reference count if a page with the same
    /// key is already buffered. May evict another page, writing it back.
    pub(crate) fn add(&mut self, file: &PageFile, mut item: T, initial_ref: u32) -> Result<()> {
        let key = item.key();
        if let Some(cached) = self.map.get_mut(&key) {
            cached.inc_ref_count();
            return Ok(());
        }
        item.set_ref_count(initial_ref);
        self.map.insert(key, item);
        while self.map.len() > self.capacity {
            if !self.evict_one(file, key)? {
                break;
            }
        }
        Ok(())
    }

    /// One clock sweep: visit entries in insertion order, decrementing
    /// reference counts, and evict the first cold page that is not the one
    /// being protected. Counts strictly decrease per pass, so repeated
    /// sweeps terminate.
    fn evict_one(&mut self, file: &PageFile, protect: u64) -> Result<bool> {
        if self.map.len() <= 1 {
            return Ok(false);
        }
        loop {
            let mut victim = None;
            for i in 0..self.map.len() {
                let (&key, page) = self.map.get_index_mut(i).unwrap();
                if page.ref_count() > 0 {
                    page.dec_ref_count();
                }
                if page.ref_count() < 1 && key != protect {
                    victim = Some(i);
                    break;
                }
            }
            if let Some(i) = victim {
                let (_, page) = self.map.get_index_mut(i).unwrap();
                if page.is_dirty() {
                    page.sync(file)?;
                }
                self.map.shift_remove_index(i);
                return Ok(true);
            }
        }
    }

    pub(crate) fn get_mut(&mut self, key: u64) -> Option<&mut T> {
        let page = self.map.get_mut(&key);
        match page {
            Some(_) => self.hits += 1,
            None => self.misses += 1,
        }
        page
    }

    /// Like `get_mut`, but does not count towards the hit/miss statistics.
    pub(crate) fn peek_mut(&mut self, key: u64) -> Option<&mut T> {
        self.map.get_mut(&key)
    }

    /// Re-register a buffered page after it was touched; equivalent to
    /// adding a page that is already present.
    pub(crate) fn touch(&mut self, key: u64) {
        if let Some(page) = self.map.get_mut(&key) {
            page.inc_ref_count();
        }
    }

    /// Drop a page without writing it back.
    pub(crate) fn remove(&mut self, key: u64) -> Option<T> {
        self.map.shift_remove(&key)
    }

    /// Write back every dirty page, evicting nothing.
    pub(crate) fn flush(&mut self, file: &PageFile) -> Result<()> {
        for (_, page) in self.map.iter_mut() {
            if page.is_dirty() {
                page.sync(file)?;
            }
        }
        Ok(())
    }

    /// Write back every dirty page, then drop all of them.
    pub(crate) fn clear(&mut self, file: &PageFile) -> Result<()> {
        self.flush(file)?;
        self.map.clear();
        Ok(())
    }

    pub(crate) fn stats(&self) -> BufferStats {
        BufferStats {
            buffers: self.capacity,
            used: self.map.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

/// Bounded cache for B+-tree nodes, preserving insertion order. Eviction
/// scans from the oldest entry for the first node that allows unloading,
/// syncing it when dirty. If nothing is evictable the cache grows past its
/// capacity and logs the overflow instead of spinning on the scan.
pub(crate) struct LruCache<T: Cacheable> {
    capacity: usize,
    map: IndexMap<u64, T>,
    hits: u64,
    misses: u64,
}

impl<T: Cacheable> LruCache<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: IndexMap::with_capacity(capacity + 1),
            hits: 0,
            misses: 0,
        }
    }

    pub(crate) fn add(&mut self, file: &PageFile, item: T) -> Result<()> {
        let key = item.key();
        if !self.map.contains_key(&key) && self.map.len() >= self.capacity {
            self.remove_one(file, key)?;
        }
        self.map.insert(key, item);
        Ok(())
    }

    fn remove_one(&mut self, file: &PageFile, incoming: u64) -> Result<()> {
        let victim = self
            .map
            .iter()
            .position(|(&key, node)| node.allow_unload() && key != incoming);
        if let Some(i) = victim {
            let (_, node) = self.map.get_index_mut(i).unwrap();
            if node.is_dirty() {
                node.sync(file)?;
            }
            self.map.shift_remove_index(i);
            return Ok(());
        }
        log::warn!(
            "unable to evict any cache entry, growing past {} buffers",
            self.capacity
        );
        Ok(())
    }

    pub(crate) fn get_mut(&mut self, key: u64) -> Option<&mut T> {
        let node = self.map.get_mut(&key);
        match node {
            Some(_) => self.hits += 1,
            None => self.misses += 1,
        }
        node
    }

    /// Like `get_mut`, but does not count towards the hit/miss statistics.
    pub(crate) fn peek_mut(&mut self, key: u64) -> Option<&mut T> {
        self.map.get_mut(&key)
    }

    pub(crate) fn remove(&mut self, key: u64) -> Option<T> {
        self.map.shift_remove(&key)
    }

    pub(crate) fn flush(&mut self, file: &PageFile) -> Result<()> {
        for (_, node) in self.map.iter_mut() {
            if node.is_dirty() {
                node.sync(file)?;
            }
        }
        Ok(())
    }

    pub(crate) fn has_dirty(&self) -> bool {
        self.map.values().any(|node| node.is_dirty())
    }

    pub(crate) fn clear(&mut self, file: &PageFile) -> Result<()> {
        self.flush(file)?;
        self.map.clear();
        Ok(())
    }

    pub(crate) fn stats(&self) -> BufferStats {
        BufferStats {
            buffers: self.capacity,
            used: self.map.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}
