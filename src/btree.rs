use crate::bins::{SliceExt, SliceMutExt};
use crate::cache::{BufferStats, Cacheable, LruCache};
use crate::error::{Result, StoreError};
use crate::paging::{
    PageFile, PAGE_HEADER_RECORD_LEN, PAGE_HEADER_SIZE, PAGE_HEADER_STATUS, STATUS_BRANCH,
    STATUS_LEAF,
};
use parking_lot::Mutex;
use std::sync::Arc;

// node header after the common page header: key count as u16
const NODE_HEADER_SIZE: usize = PAGE_HEADER_SIZE + 2;
const NODE_COUNT_OFFSET: usize = PAGE_HEADER_SIZE;

/// Range and predicate selections over the key space. `Between` bounds are
/// inclusive on both ends; `Prefix` matches keys starting with the given
/// bytes. The negated kinds cannot prune the tree walk and scan every leaf.
#[derive(Clone, Debug)]
pub enum IndexQuery {
    Any,
    Eq(Vec<u8>),
    Neq(Vec<u8>),
    Gt(Vec<u8>),
    Geq(Vec<u8>),
    Lt(Vec<u8>),
    Leq(Vec<u8>),
    Between(Vec<u8>, Vec<u8>),
    NotBetween(Vec<u8>, Vec<u8>),
    Prefix(Vec<u8>),
    NotPrefix(Vec<u8>),
}

impl IndexQuery {
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            IndexQuery::Any => true,
            IndexQuery::Eq(k) => key == &k[..],
            IndexQuery::Neq(k) => key != &k[..],
            IndexQuery::Gt(k) => key > &k[..],
            IndexQuery::Geq(k) => key >= &k[..],
            IndexQuery::Lt(k) => key < &k[..],
            IndexQuery::Leq(k) => key <= &k[..],
            IndexQuery::Between(lo, hi) => key >= &lo[..] && key <= &hi[..],
            IndexQuery::NotBetween(lo, hi) => key < &lo[..] || key > &hi[..],
            IndexQuery::Prefix(p) => key.starts_with(p),
            IndexQuery::NotPrefix(p) => !key.starts_with(p),
        }
    }

    /// Inclusive lower bound below which no key can match, if one exists.
    fn lower_bound(&self) -> Option<&[u8]> {
        match self {
            IndexQuery::Eq(k)
            | IndexQuery::Gt(k)
            | IndexQuery::Geq(k)
            | IndexQuery::Between(k, _)
            | IndexQuery::Prefix(k) => Some(k),
            _ => None,
        }
    }

    /// A bound above which no key can match, if one exists. For prefix
    /// queries this is the prefix successor, which over-approximates by at
    /// most one key.
    fn upper_bound(&self) -> Option<Vec<u8>> {
        match self {
            IndexQuery::Eq(k) | IndexQuery::Lt(k) | IndexQuery::Leq(k) => Some(k.clone()),
            IndexQuery::Between(_, hi) => Some(hi.clone()),
            IndexQuery::Prefix(p) => prefix_successor(p),
            _ => None,
        }
    }
}

/// The smallest byte string greater than every string with prefix `p`, or
/// `None` when no such bound exists (all bytes 0xff).
fn prefix_successor(p: &[u8]) -> Option<Vec<u8>> {
    let mut succ = p.to_vec();
    while let Some(&last) = succ.last() {
        if last < 0xff {
            *succ.last_mut().unwrap() += 1;
            return Some(succ);
        }
        succ.pop();
    }
    None
}

/// One B+-tree node, decoded from its page. Branch nodes keep `count`
/// separator keys and `count + 1` child page numbers; leaves keep `count`
/// keys and their 64-bit record addresses. The child for a lookup key is
/// indexed by the number of separators less than or equal to it.
struct BTreeNode {
    num: u32,
    leaf: bool,
    keys: Vec<Box<[u8]>>,
    ptrs: Vec<u64>,
    dirty: bool,
    ref_count: u32,
    // page size of the backing file; a node transiently grown past it pins
    // itself in the cache until the pending split brings it back in bounds
    capacity: usize,
}

impl BTreeNode {
    fn new_leaf(num: u32, capacity: usize) -> Self {
        Self {
            num,
            leaf: true,
            keys: Vec::new(),
            ptrs: Vec::new(),
            dirty: true,
            ref_count: 0,
            capacity,
        }
    }

    fn decode(num: u32, buff: &[u8]) -> Result<Self> {
        let leaf = match buff[PAGE_HEADER_STATUS] {
            STATUS_LEAF => true,
            STATUS_BRANCH => false,
            status => {
                return Err(StoreError::BTree(format!(
                    "page {num} is not a tree node (status {status})"
                )))
            }
        };
        let count = buff[NODE_COUNT_OFFSET..].read_u16() as usize;
        let mut keys = Vec::with_capacity(count);
        let mut off = NODE_HEADER_SIZE;
        for _ in 0..count {
            if off + 2 > buff.len() {
                return Err(StoreError::BTree(format!("node {num} overruns its page")));
            }
            let klen = buff[off..].read_u16() as usize;
            off += 2;
            if off + klen > buff.len() {
                return Err(StoreError::BTree(format!("node {num} overruns its page")));
            }
            keys.push(buff[off..off + klen].to_vec().into_boxed_slice());
            off += klen;
        }
        let nptrs = if leaf { count } else { count + 1 };
        if off + nptrs * 8 > buff.len() {
            return Err(StoreError::BTree(format!("node {num} overruns its page")));
        }
        let mut ptrs = Vec::with_capacity(nptrs);
        for _ in 0..nptrs {
            ptrs.push(buff[off..].read_u64());
            off += 8;
        }
        Ok(Self {
            num,
            leaf,
            keys,
            ptrs,
            dirty: false,
            ref_count: 0,
            capacity: buff.len(),
        })
    }

    fn encode(&self, buff: &mut [u8]) {
        buff[PAGE_HEADER_STATUS] = if self.leaf { STATUS_LEAF } else { STATUS_BRANCH };
        buff[NODE_COUNT_OFFSET..].write_u16(self.keys.len() as u16);
        let mut off = NODE_HEADER_SIZE;
        for key in &self.keys {
            buff[off..].write_u16(key.len() as u16);
            off += 2;
            buff[off..off + key.len()].copy_from_slice(key);
            off += key.len();
        }
        for &ptr in &self.ptrs {
            buff[off..].write_u64(ptr);
            off += 8;
        }
        buff[PAGE_HEADER_RECORD_LEN..].write_i32((off - PAGE_HEADER_SIZE) as i32);
    }

    fn encoded_size(&self) -> usize {
        NODE_HEADER_SIZE
            + self.keys.iter().map(|k| 2 + k.len()).sum::<usize>()
            + self.ptrs.len() * 8
    }

    fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.keys.binary_search_by(|k| k.as_ref().cmp(key))
    }

    /// Index of the child subtree that may hold `key`.
    fn child_index(&self, key: &[u8]) -> usize {
        self.keys.partition_point(|sep| sep.as_ref() <= key)
    }
}

impl Cacheable for BTreeNode {
    fn key(&self) -> u64 {
        self.num as u64
    }
    fn ref_count(&self) -> u32 {
        self.ref_count
    }
    fn inc_ref_count(&mut self) {
        self.ref_count += 1;
    }
    fn dec_ref_count(&mut self) {
        self.ref_count = self.ref_count.saturating_sub(1);
    }
    fn set_ref_count(&mut self, count: u32) {
        self.ref_count = count;
    }
    fn is_dirty(&self) -> bool {
        self.dirty
    }
    fn allow_unload(&self) -> bool {
        self.encoded_size() <= self.capacity
    }
    fn sync(&mut self, file: &PageFile) -> Result<()> {
        let mut buff = vec![0u8; file.page_size()];
        self.encode(&mut buff);
        file.write_page(self.num, &buff)?;
        self.dirty = false;
        Ok(())
    }
}

/// Ordered map from opaque keys to 64-bit record addresses, stored in pages
/// of the shared file. The root page number is persisted in the file header.
pub(crate) struct BTree {
    file: Arc<PageFile>,
    cache: Mutex<LruCache<BTreeNode>>,
}

impl BTree {
    pub(crate) fn new(file: Arc<PageFile>, buffers: usize) -> Self {
        Self {
            file,
            cache: Mutex::new(LruCache::new(buffers)),
        }
    }

    /// Install an empty root leaf; called once when the file is created.
    pub(crate) fn create(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        let num = self.file.get_free_page()?;
        cache.add(&self.file, BTreeNode::new_leaf(num, self.file.page_size()))?;
        self.file.set_btree_root(num);
        Ok(())
    }

    fn root(&self) -> Result<u32> {
        self.file
            .btree_root()
            .ok_or_else(|| StoreError::BTree("tree has no root page".into()))
    }

    fn max_key_size(&self) -> usize {
        self.file.page_size() / 4
    }

    fn load<'a>(
        &self,
        cache: &'a mut LruCache<BTreeNode>,
        num: u32,
    ) -> Result<&'a mut BTreeNode> {
        if cache.get_mut(num as u64).is_none() {
            let buff = self.file.read_page(num)?;
            let node = BTreeNode::decode(num, &buff)?;
            cache.add(&self.file, node)?;
        }
        Ok(cache
            .peek_mut(num as u64)
            .expect("node was just loaded into the cache"))
    }

    /// Look up the address stored for `key`. A missing key is a normal
    /// `None`, not an error.
    pub(crate) fn find_value(&self, key: &[u8]) -> Result<Option<u64>> {
        let mut cache = self.cache.lock();
        let mut num = self.root()?;
        loop {
            let node = self.load(&mut cache, num)?;
            if node.leaf {
                return Ok(node.search(key).ok().map(|i| node.ptrs[i]));
            }
            num = node.ptrs[node.child_index(key)] as u32;
        }
    }

    /// Insert `key → addr`, overwriting any previous address.
    pub(crate) fn add_value(&self, key: &[u8], addr: u64) -> Result<()> {
        if key.is_empty() || key.len() > self.max_key_size() {
            return Err(StoreError::InvalidArgument(format!(
                "key length {} out of range",
                key.len()
            )));
        }

        let mut cache = self.cache.lock();
        let mut path = Vec::new();
        let mut num = self.root()?;
        loop {
            let node = self.load(&mut cache, num)?;
            if node.leaf {
                break;
            }
            let idx = node.child_index(key);
            path.push(num);
            num = node.ptrs[idx] as u32;
        }

        let leaf = self.load(&mut cache, num)?;
        match leaf.search(key) {
            Ok(i) => {
                leaf.ptrs[i] = addr;
                leaf.dirty = true;
                return Ok(());
            }
            Err(i) => {
                leaf.keys.insert(i, key.to_vec().into_boxed_slice());
                leaf.ptrs.insert(i, addr);
                leaf.dirty = true;
            }
        }

        // walk splits back up the recorded path; a root split grows the tree
        let page_size = self.file.page_size();
        while self
            .load(&mut cache, num)
            .map(|node| node.encoded_size() > page_size)?
        {
            let (sep, right_num) = self.split_node(&mut cache, num)?;
            if let Some(parent) = path.pop() {
                let node = self.load(&mut cache, parent)?;
                let idx = node.child_index(&sep);
                node.keys.insert(idx, sep);
                node.ptrs.insert(idx + 1, right_num as u64);
                node.dirty = true;
                num = parent;
            } else {
                let root_num = self.file.get_free_page()?;
                let root = BTreeNode {
                    num: root_num,
                    leaf: false,
                    keys: vec![sep],
                    ptrs: vec![num as u64, right_num as u64],
                    dirty: true,
                    ref_count: 0,
                    capacity: page_size,
                };
                cache.add(&self.file, root)?;
                self.file.set_btree_root(root_num);
                break;
            }
        }
        Ok(())
    }

    /// Move the upper half of node `num` to a fresh right sibling and
    /// return the separator key to route between them.
    fn split_node(
        &self,
        cache: &mut LruCache<BTreeNode>,
        num: u32,
    ) -> Result<(Box<[u8]>, u32)> {
        let right_num = self.file.get_free_page()?;
        let node = self.load(cache, num)?;
        let mid = node.keys.len() / 2;

        let (sep, right_keys, right_ptrs, leaf) = if node.leaf {
            let right_keys = node.keys.split_off(mid);
            let right_ptrs = node.ptrs.split_off(mid);
            (right_keys[0].clone(), right_keys, right_ptrs, true)
        } else {
            let right_keys = node.keys.split_off(mid + 1);
            let right_ptrs = node.ptrs.split_off(mid + 1);
            let sep = node.keys.pop().expect("branch node with no separator");
            (sep, right_keys, right_ptrs, false)
        };
        node.dirty = true;

        let right = BTreeNode {
            num: right_num,
            leaf,
            keys: right_keys,
            ptrs: right_ptrs,
            dirty: true,
            ref_count: 0,
            capacity: self.file.page_size(),
        };
        cache.add(&self.file, right)?;
        Ok((sep, right_num))
    }

    /// Remove `key`, returning the address it mapped to. Underfull leaves
    /// are left in place; the tree is not rebalanced on deletion.
    pub(crate) fn remove_value(&self, key: &[u8]) -> Result<Option<u64>> {
        let mut cache = self.cache.lock();
        let mut num = self.root()?;
        loop {
            let node = self.load(&mut cache, num)?;
            if node.leaf {
                return Ok(match node.search(key) {
                    Ok(i) => {
                        node.keys.remove(i);
                        node.dirty = true;
                        Some(node.ptrs.remove(i))
                    }
                    Err(_) => None,
                });
            }
            num = node.ptrs[node.child_index(key)] as u32;
        }
    }

    /// Walk the keys selected by `query` in ascending order, invoking the
    /// callback with each `(key, address)` pair until it returns false.
    pub(crate) fn query<F>(&self, query: &IndexQuery, callback: &mut F) -> Result<()>
    where
        F: FnMut(&[u8], u64) -> Result<bool>,
    {
        let mut cache = self.cache.lock();
        let root = self.root()?;
        let upper = query.upper_bound();
        self.scan(&mut cache, root, query, upper.as_deref(), callback)?;
        Ok(())
    }

    fn scan<F>(
        &self,
        cache: &mut LruCache<BTreeNode>,
        num: u32,
        query: &IndexQuery,
        upper: Option<&[u8]>,
        callback: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&[u8], u64) -> Result<bool>,
    {
        let node = self.load(cache, num)?;
        if node.leaf {
            let entries: Vec<(Box<[u8]>, u64)> = node
                .keys
                .iter()
                .cloned()
                .zip(node.ptrs.iter().copied())
                .collect();
            for (key, addr) in entries {
                if let Some(hi) = upper {
                    if key.as_ref() > hi {
                        return Ok(false);
                    }
                }
                if query.matches(&key) && !callback(&key, addr)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        let seps = node.keys.clone();
        let children = node.ptrs.clone();
        for (i, &child) in children.iter().enumerate() {
            // child i spans [seps[i-1], seps[i]); prune subtrees that fall
            // fully outside the query's key bounds
            if let Some(hi) = upper {
                if i > 0 && seps[i - 1].as_ref() > hi {
                    break;
                }
            }
            if let Some(lo) = query.lower_bound() {
                if i < seps.len() && seps[i].as_ref() <= lo {
                    continue;
                }
            }
            if !self.scan(cache, child as u32, query, upper, callback)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Write back every dirty node without evicting.
    pub(crate) fn flush(&self) -> Result<()> {
        self.cache.lock().flush(&self.file)
    }

    pub(crate) fn stats(&self) -> BufferStats {
        self.cache.lock().stats()
    }
}
