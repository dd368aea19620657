//! Central storage for serialized DOM nodes.
//!
//! Nodes are stored in document order so that serializing a document or
//! fragment reads pages sequentially. Data pages carry previous/next links
//! and form one chain per stored document. Each record has a virtual
//! address combining its page number with a tid, a per-page tuple
//! identifier. A record may migrate to a later page of the chain when
//! nodes are inserted before it, but its tid, and therefore its address,
//! never changes.

use crate::addr::{create_pointer, format_address, page_from_pointer, tid_from_pointer};
use crate::bins::{SliceExt, SliceMutExt};
use crate::btree::{BTree, IndexQuery};
use crate::cache::{BufferStats, Cacheable, ClockCache};
use crate::error::{Result, StoreError};
use crate::lock::{LockMode, OwnerId, TimeoutLock};
use crate::node::{node_key, Document, NodeProxy};
use crate::paging::{
    PageFile, DEFAULT_PAGE_SIZE, PAGE_HEADER_DIRTY, PAGE_HEADER_RECORD_LEN, PAGE_HEADER_SIZE,
    PAGE_HEADER_STATUS, STATUS_RECORD,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// data page header, after the common page header:
// record count i16, data length i32, next page i64, prev page i64, tid i16
const DATA_RECORD_COUNT: usize = PAGE_HEADER_SIZE;
const DATA_LENGTH: usize = PAGE_HEADER_SIZE + 2;
const DATA_NEXT_PAGE: usize = PAGE_HEADER_SIZE + 6;
const DATA_PREV_PAGE: usize = PAGE_HEADER_SIZE + 14;
const DATA_NEXT_TID: usize = PAGE_HEADER_SIZE + 22;
pub(crate) const DATA_HEADER_SIZE: usize = PAGE_HEADER_SIZE + 24;

// per record: tid u16, length u16, then the payload
const RECORD_HEADER_SIZE: usize = 4;

pub struct Settings {
    pub page_size: usize,
    pub btree_buffers: usize,
    pub data_buffers: usize,
    pub key_len: Option<u16>,
    pub lock_timeout: Duration,
    pub read_only: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            btree_buffers: 256,
            data_buffers: 256,
            key_len: None,
            lock_timeout: Duration::from_secs(60),
            read_only: false,
        }
    }
}

impl Settings {
    fn validate(&self) -> Result<()> {
        if self.btree_buffers < 16 {
            return Err(StoreError::InvalidArgument(format!(
                "btree_buffers must be at least 16, but got {}",
                self.btree_buffers
            )));
        }
        if self.data_buffers < 16 {
            return Err(StoreError::InvalidArgument(format!(
                "data_buffers must be at least 16, but got {}",
                self.data_buffers
            )));
        }
        if let Some(key_len) = self.key_len {
            if key_len == 0 {
                return Err(StoreError::InvalidArgument(
                    "key_len must be positive".into(),
                ));
            }
        }
        if self.lock_timeout.is_zero() {
            return Err(StoreError::InvalidArgument(
                "lock_timeout must not be zero".into(),
            ));
        }
        Ok(())
    }
}

struct DataPageHeader {
    records: u16,
    data_len: usize,
    next_page: i64,
    prev_page: i64,
    tid: u16,
}

impl DataPageHeader {
    fn new() -> Self {
        Self {
            records: 0,
            data_len: 0,
            next_page: -1,
            prev_page: -1,
            tid: 0,
        }
    }

    /// Hand out the next tuple identifier. Tids start at 1 and are never
    /// reused, even after the record they named was removed.
    fn alloc_tid(&mut self) -> Option<u16> {
        if self.tid == u16::MAX {
            return None;
        }
        self.tid += 1;
        Some(self.tid)
    }
}

/// One in-memory data page: its header plus the record work area.
struct DomPage {
    num: u32,
    header: DataPageHeader,
    data: Box<[u8]>,
    dirty: bool,
    ref_count: u32,
}

impl DomPage {
    fn new(num: u32, work_size: usize) -> Self {
        Self {
            num,
            header: DataPageHeader::new(),
            data: vec![0u8; work_size].into_boxed_slice(),
            dirty: true,
            ref_count: 0,
        }
    }

    fn load(num: u32, buff: &[u8], work_size: usize) -> Result<Self> {
        if buff[PAGE_HEADER_STATUS] != STATUS_RECORD {
            return Err(StoreError::Corruption(format!(
                "page {num} is not a data page (status {})",
                buff[PAGE_HEADER_STATUS]
            )));
        }
        let data_len = buff[DATA_LENGTH..].read_i32();
        if data_len < 0 || data_len as usize > work_size {
            return Err(StoreError::Corruption(format!(
                "page {num} has invalid data length {data_len}"
            )));
        }
        let mut data = vec![0u8; work_size].into_boxed_slice();
        data.copy_from_slice(&buff[DATA_HEADER_SIZE..DATA_HEADER_SIZE + work_size]);
        Ok(Self {
            num,
            header: DataPageHeader {
                records: buff[DATA_RECORD_COUNT..].read_i16() as u16,
                data_len: data_len as usize,
                next_page: buff[DATA_NEXT_PAGE..].read_i64(),
                prev_page: buff[DATA_PREV_PAGE..].read_i64(),
                tid: buff[DATA_NEXT_TID..].read_i16() as u16,
            },
            data,
            dirty: false,
            ref_count: 0,
        })
    }

    fn has_room(&self, value_len: usize) -> bool {
        self.header.data_len + value_len + RECORD_HEADER_SIZE <= self.data.len()
            && self.header.tid < u16::MAX
    }
}

impl Cacheable for DomPage {
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
        true
    }
    fn sync(&mut self, file: &PageFile) -> Result<()> {
        let mut buff = vec![0u8; file.page_size()];
        buff[PAGE_HEADER_STATUS] = STATUS_RECORD;
        buff[PAGE_HEADER_DIRTY] = 0;
        buff[PAGE_HEADER_RECORD_LEN..].write_i32(self.header.data_len as i32);
        buff[DATA_RECORD_COUNT..].write_i16(self.header.records as i16);
        buff[DATA_LENGTH..].write_i32(self.header.data_len as i32);
        buff[DATA_NEXT_PAGE..].write_i64(self.header.next_page);
        buff[DATA_PREV_PAGE..].write_i64(self.header.prev_page);
        buff[DATA_NEXT_TID..].write_i16(self.header.tid as i16);
        buff[DATA_HEADER_SIZE..DATA_HEADER_SIZE + self.data.len()].copy_from_slice(&self.data);
        file.write_page(self.num, &buff)?;
        self.dirty = false;
        Ok(())
    }
}

/// Position of one record: the page actually holding it and the offset of
/// its length field within the page's work area.
#[derive(Copy, Clone, Debug)]
struct RecordPos {
    page: u32,
    offset: usize,
}

/// A record read by an iterator, annotated with its virtual address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub address: u64,
    pub data: Vec<u8>,
}

/// Count the records in `data[..data_len]` by walking the headers; needed
/// after a split moved a variable number of records away.
fn count_records(data: &[u8], data_len: usize) -> u16 {
    let mut pos = 0;
    let mut count = 0;
    while pos < data_len {
        let len = data[pos + 2..].read_u16() as usize;
        pos += len + RECORD_HEADER_SIZE;
        count += 1;
    }
    count
}

/// The DOM storage engine: a B+-tree mapping node keys to virtual
/// addresses, backed by chains of record pages, fronted by two page caches
/// and an advisory owner-aware lock.
pub struct DomStore {
    file: Arc<PageFile>,
    btree: BTree,
    cache: Mutex<ClockCache<DomPage>>,
    current: Mutex<HashMap<OwnerId, u32>>,
    lock: TimeoutLock,
    next_owner: AtomicU64,
    read_only: bool,
}

impl DomStore {
    /// Open the store at `path`, creating the file if it does not exist.
    pub fn open(path: &Path, settings: Settings) -> Result<Self> {
        settings.validate()?;

        let (file, created) = PageFile::open(path, settings.page_size)?;
        if created && settings.read_only {
            return Err(StoreError::ReadOnly);
        }
        let file = Arc::new(file);
        if created {
            if let Some(key_len) = settings.key_len {
                file.set_key_len(key_len);
            }
        }

        let btree = BTree::new(file.clone(), settings.btree_buffers);
        if file.btree_root().is_none() {
            if settings.read_only {
                return Err(StoreError::Corruption("tree has no root page".into()));
            }
            btree.create()?;
            file.flush_header()?;
        }

        Ok(Self {
            file,
            btree,
            cache: Mutex::new(ClockCache::new(settings.data_buffers)),
            current: Mutex::new(HashMap::new()),
            lock: TimeoutLock::new(settings.lock_timeout),
            next_owner: AtomicU64::new(1),
            read_only: settings.read_only,
        })
    }

    /// Create a fresh store at `path`, discarding any previous file.
    pub fn create(path: &Path, settings: Settings) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Self::open(path, settings)
    }

    /// Flush everything and drop the store.
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    /// Issue a fresh owner handle for a session.
    pub fn new_owner(&self) -> OwnerId {
        OwnerId(self.next_owner.fetch_add(1, Ordering::SeqCst))
    }

    /// The advisory engine lock; callers acquire it around mutations.
    pub fn lock(&self) -> &TimeoutLock {
        &self.lock
    }

    fn work_size(&self) -> usize {
        self.file.page_size() - DATA_HEADER_SIZE
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Load page `num` into the cache if needed and run `f` on it. On a hit
    /// the page's reference count is bumped, like re-adding a buffered page.
    fn with_page<R>(
        &self,
        cache: &mut ClockCache<DomPage>,
        num: u32,
        initial_ref: u32,
        f: impl FnOnce(&mut DomPage) -> R,
    ) -> Result<R> {
        if cache.get_mut(num as u64).is_some() {
            cache.touch(num as u64);
        } else {
            let buff = self.file.read_page(num)?;
            let page = DomPage::load(num, &buff, self.work_size())?;
            cache.add(&self.file, page, initial_ref)?;
        }
        let page = cache
            .peek_mut(num as u64)
            .expect("page was just loaded into the cache");
        Ok(f(page))
    }

    /// Allocate and buffer an empty data page.
    fn new_data_page(&self, cache: &mut ClockCache<DomPage>) -> Result<u32> {
        let num = self.file.get_free_page()?;
        let page = DomPage::new(num, self.work_size());
        cache.add(&self.file, page, 1)?;
        Ok(num)
    }

    /// The page new records for `owner` are appended to, creating a fresh
    /// chain head on first use.
    fn current_page(&self, cache: &mut ClockCache<DomPage>, owner: OwnerId) -> Result<u32> {
        let mut current = self.current.lock();
        if let Some(&num) = current.get(&owner) {
            return Ok(num);
        }
        let num = self.new_data_page(cache)?;
        current.insert(owner, num);
        Ok(num)
    }

    fn set_current_page(&self, owner: OwnerId, num: u32) {
        self.current.lock().insert(owner, num);
    }

    /// Forget the append context of `owner`.
    pub fn close_document(&self, owner: OwnerId) {
        self.current.lock().remove(&owner);
    }

    /// Append `value` to the owner's current page, moving to a freshly
    /// linked page when it does not fit. Returns the record's address.
    pub fn add(&self, owner: OwnerId, value: &[u8]) -> Result<u64> {
        self.check_writable()?;
        if value.len() + RECORD_HEADER_SIZE > self.work_size() {
            return Err(StoreError::InvalidArgument(format!(
                "value of {} bytes exceeds the page work size",
                value.len()
            )));
        }

        let mut cache = self.cache.lock();
        let mut num = self.current_page(&mut cache, owner)?;

        let fits = self.with_page(&mut cache, num, 1, |page| page.has_room(value.len()))?;
        if !fits {
            let new_num = self.new_data_page(&mut cache)?;
            self.with_page(&mut cache, num, 1, |page| {
                page.header.next_page = new_num as i64;
                page.dirty = true;
            })?;
            self.with_page(&mut cache, new_num, 1, |page| {
                page.header.prev_page = num as i64;
                page.dirty = true;
            })?;
            self.set_current_page(owner, new_num);
            num = new_num;
        }

        self.with_page(&mut cache, num, 2, |page| {
            let tid = page
                .header
                .alloc_tid()
                .expect("a page accepting records has tids left");
            let off = page.header.data_len;
            page.data[off..].write_u16(tid);
            page.data[off + 2..].write_u16(value.len() as u16);
            page.data[off + 4..off + 4 + value.len()].copy_from_slice(value);
            page.header.data_len += value.len() + RECORD_HEADER_SIZE;
            page.header.records += 1;
            page.dirty = true;
            create_pointer(page.num, tid)
        })
    }

    /// Store `value` under `key`: append the record, then index its address.
    pub fn put(&self, owner: OwnerId, key: &[u8], value: &[u8]) -> Result<u64> {
        let pointer = self.add(owner, value)?;
        self.btree.add_value(key, pointer)?;
        Ok(pointer)
    }

    /// Insert `value` directly after the record addressed by `pointer`,
    /// keeping document order. Returns the new record's address.
    pub fn insert_after(&self, pointer: u64, value: &[u8]) -> Result<u64> {
        self.check_writable()?;
        let work = self.work_size();
        if value.len() + RECORD_HEADER_SIZE > work {
            return Err(StoreError::InvalidArgument(format!(
                "value of {} bytes exceeds the page work size",
                value.len()
            )));
        }

        let mut cache = self.cache.lock();
        let Some(rec) = self.find_value_position(&mut cache, pointer)? else {
            return Err(StoreError::BTree(format!(
                "no record at {}",
                format_address(pointer)
            )));
        };

        let (end_off, data_len) = self.with_page(&mut cache, rec.page, 1, |page| {
            let len = page.data[rec.offset..].read_u16() as usize;
            (rec.offset + 2 + len, page.header.data_len)
        })?;

        let need = value.len() + RECORD_HEADER_SIZE;
        let mut landing = rec.page;
        let write_off;

        if end_off < data_len {
            if data_len + need <= work {
                // make room in the middle of the page
                self.with_page(&mut cache, rec.page, 1, |page| {
                    page.data.copy_within(end_off..data_len, end_off + need);
                    page.dirty = true;
                })?;
                write_off = end_off;
            } else {
                // split the page: the records behind the insertion point
                // move to a fresh page spliced into the chain
                let split_num = self.new_data_page(&mut cache)?;
                let (tail, old_next, inherited_tid) =
                    self.with_page(&mut cache, rec.page, 1, |page| {
                        (
                            page.data[end_off..data_len].to_vec(),
                            page.header.next_page,
                            page.header.tid,
                        )
                    })?;
                self.with_page(&mut cache, split_num, 1, |page| {
                    page.data[..tail.len()].copy_from_slice(&tail);
                    page.header.data_len = tail.len();
                    page.header.next_page = old_next;
                    page.header.prev_page = rec.page as i64;
                    page.header.tid = inherited_tid;
                    page.header.records = count_records(&page.data, tail.len());
                    page.dirty = true;
                })?;
                if old_next > -1 {
                    self.with_page(&mut cache, old_next as u32, 1, |page| {
                        page.header.prev_page = split_num as i64;
                        page.dirty = true;
                    })?;
                }
                self.with_page(&mut cache, rec.page, 1, |page| {
                    page.header.next_page = split_num as i64;
                    page.header.data_len = end_off;
                    page.header.records = count_records(&page.data, end_off);
                    page.dirty = true;
                })?;
                write_off = end_off;
            }
        } else if data_len + need > work {
            // the record is the last one and the page is full; splice a
            // fresh page in behind it
            let new_num = self.new_data_page(&mut cache)?;
            let old_next = self.with_page(&mut cache, rec.page, 1, |page| {
                let old_next = page.header.next_page;
                page.header.next_page = new_num as i64;
                page.dirty = true;
                old_next
            })?;
            self.with_page(&mut cache, new_num, 1, |page| {
                page.header.next_page = old_next;
                page.header.prev_page = rec.page as i64;
                page.dirty = true;
            })?;
            if old_next > -1 {
                self.with_page(&mut cache, old_next as u32, 1, |page| {
                    page.header.prev_page = new_num as i64;
                    page.dirty = true;
                })?;
            }
            landing = new_num;
            write_off = 0;
        } else {
            write_off = data_len;
        }

        // the tid comes from the page the record lands on
        self.with_page(&mut cache, landing, 1, |page| {
            let Some(tid) = page.header.alloc_tid() else {
                return Err(StoreError::InvalidArgument(format!(
                    "page {} has no tuple ids left",
                    page.num
                )));
            };
            page.data[write_off..].write_u16(tid);
            page.data[write_off + 2..].write_u16(value.len() as u16);
            page.data[write_off + 4..write_off + 4 + value.len()].copy_from_slice(value);
            page.header.data_len += need;
            page.header.records += 1;
            page.dirty = true;
            Ok(create_pointer(page.num, tid))
        })?
    }

    /// Insert after the record indexed under `key`.
    pub fn insert_after_key(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        let Some(pointer) = self.btree.find_value(key)? else {
            return Err(StoreError::BTree("key not found".into()));
        };
        self.insert_after(pointer, value)
    }

    /// Overwrite the record under `key` in place. The new value must have
    /// exactly the old length; growing or shrinking a record is rejected.
    /// Returns false when the key is not indexed.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let Some(pointer) = self.btree.find_value(key)? else {
            return Ok(false);
        };
        self.update_at(pointer, value)?;
        Ok(true)
    }

    /// Overwrite the record at `pointer` in place, same length contract as
    /// `update`.
    pub fn update_at(&self, pointer: u64, value: &[u8]) -> Result<()> {
        self.check_writable()?;
        let mut cache = self.cache.lock();
        let Some(rec) = self.find_value_position(&mut cache, pointer)? else {
            return Err(StoreError::BTree(format!(
                "no record at {}",
                format_address(pointer)
            )));
        };
        self.with_page(&mut cache, rec.page, 1, |page| {
            let len = page.data[rec.offset..].read_u16() as usize;
            if value.len() > len {
                return Err(StoreError::InvalidArgument("value too long".into()));
            }
            if value.len() < len {
                return Err(StoreError::InvalidArgument("value shrunk".into()));
            }
            page.data[rec.offset + 2..rec.offset + 2 + len].copy_from_slice(value);
            page.dirty = true;
            Ok(())
        })?
    }

    /// Drop the record under `key` and its index entry.
    pub fn remove(&self, key: &[u8]) -> Result<()> {
        let Some(pointer) = self.btree.find_value(key)? else {
            return Ok(());
        };
        self.remove_entry(key, pointer)
    }

    /// Drop the record at `pointer` together with the index entry for
    /// `key`, when the address is already known.
    pub fn remove_entry(&self, key: &[u8], pointer: u64) -> Result<()> {
        self.remove_at(pointer)?;
        self.btree.remove_value(key)?;
        Ok(())
    }

    /// Drop the record at `pointer`, compacting the page. A page drained of
    /// its last record is unlinked from its chain and returned to the free
    /// list in the same step.
    pub fn remove_at(&self, pointer: u64) -> Result<()> {
        self.check_writable()?;
        let mut cache = self.cache.lock();
        let Some(rec) = self.find_value_position(&mut cache, pointer)? else {
            return Err(StoreError::BTree(format!(
                "no record at {}",
                format_address(pointer)
            )));
        };
        let (records, next, prev) = self.with_page(&mut cache, rec.page, 1, |page| {
            let len = page.data[rec.offset..].read_u16() as usize;
            let end = rec.offset + 2 + len;
            let data_len = page.header.data_len;
            page.data.copy_within(end..data_len, rec.offset - 2);
            page.header.data_len = data_len - len - RECORD_HEADER_SIZE;
            page.header.records -= 1;
            page.dirty = true;
            (
                page.header.records,
                page.header.next_page,
                page.header.prev_page,
            )
        })?;

        if records == 0 {
            self.drop_page(&mut cache, rec.page, prev, next)?;
        }
        Ok(())
    }

    /// Unlink a drained page from its chain and hand it back to the free
    /// list, forgetting any append context that still points at it.
    fn drop_page(
        &self,
        cache: &mut ClockCache<DomPage>,
        num: u32,
        prev: i64,
        next: i64,
    ) -> Result<()> {
        cache.remove(num as u64);
        if prev > -1 {
            self.with_page(cache, prev as u32, 1, |page| {
                page.header.next_page = next;
                page.dirty = true;
            })?;
        }
        if next > -1 {
            self.with_page(cache, next as u32, 1, |page| {
                page.header.prev_page = prev;
                page.dirty = true;
            })?;
        }
        self.file.unlink_page(num)?;
        self.current.lock().retain(|_, current| *current != num);
        Ok(())
    }

    /// Locate the record for `pointer`, following the chain forward from
    /// its origin page; a record moved by a split is found on a later page.
    fn find_value_position(
        &self,
        cache: &mut ClockCache<DomPage>,
        pointer: u64,
    ) -> Result<Option<RecordPos>> {
        let target = tid_from_pointer(pointer);
        let mut page_num = page_from_pointer(pointer) as i64;
        while page_num > -1 {
            let num = page_num as u32;
            let (found, next) = self.with_page(cache, num, 1, |page| {
                let mut pos = 0;
                let data_len = page.header.data_len;
                while pos < data_len {
                    let tid = page.data[pos..].read_u16();
                    if tid == target {
                        return (Some(pos + 2), page.header.next_page);
                    }
                    pos += page.data[pos + 2..].read_u16() as usize + RECORD_HEADER_SIZE;
                }
                (None, page.header.next_page)
            })?;
            if let Some(offset) = found {
                return Ok(Some(RecordPos { page: num, offset }));
            }
            page_num = next;
        }
        log::debug!("tid {target} not found");
        Ok(None)
    }

    fn read_record(&self, cache: &mut ClockCache<DomPage>, pointer: u64) -> Result<Vec<u8>> {
        let Some(rec) = self.find_value_position(cache, pointer)? else {
            return Err(StoreError::BTree(format!(
                "no record at {}",
                format_address(pointer)
            )));
        };
        self.with_page(cache, rec.page, 1, |page| {
            let len = page.data[rec.offset..].read_u16() as usize;
            page.data[rec.offset + 2..rec.offset + 2 + len].to_vec()
        })
    }

    /// The record bytes at a virtual address.
    pub fn get_at(&self, pointer: u64) -> Result<Vec<u8>> {
        let mut cache = self.cache.lock();
        self.read_record(&mut cache, pointer)
    }

    /// The record bytes indexed under `key`, or `None` when the key is
    /// absent or the read failed (failures are logged, not raised).
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let lookup = || -> Result<Option<Vec<u8>>> {
            let Some(pointer) = self.btree.find_value(key)? else {
                return Ok(None);
            };
            Ok(Some(self.get_at(pointer)?))
        };
        match lookup() {
            Ok(value) => value,
            Err(err) => {
                log::debug!("get failed: {err}");
                None
            }
        }
    }

    /// The record bytes for a node, resolving unindexed nodes through the
    /// ancestor-walk fallback.
    pub fn get_node(&self, owner: OwnerId, doc: &dyn Document, proxy: NodeProxy) -> Option<Vec<u8>> {
        match self.find_value_for(owner, doc, proxy) {
            Ok(Some(pointer)) => match self.get_at(pointer) {
                Ok(value) => Some(value),
                Err(err) => {
                    log::debug!("get failed at {}: {err}", format_address(pointer));
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                log::debug!("node lookup failed: {err}");
                None
            }
        }
    }

    /// Resolve a node to its storage address. When the index misses the
    /// node's key, walk up its ancestors until one is indexed, then scan
    /// that ancestor's subtree in document order for the target gid.
    pub fn find_value_for(
        &self,
        owner: OwnerId,
        doc: &dyn Document,
        proxy: NodeProxy,
    ) -> Result<Option<u64>> {
        let key = node_key(doc.doc_id(), proxy.gid);
        if let Some(pointer) = self.btree.find_value(&key)? {
            return Ok(Some(pointer));
        }

        let mut id = proxy.gid;
        let ancestor_pointer = loop {
            if id < 1 {
                return Err(StoreError::BTree(format!(
                    "node {} not found",
                    proxy.gid
                )));
            }
            id = doc.parent_id(id);
            if id < 1 {
                return Err(StoreError::BTree(format!(
                    "node {} not found",
                    proxy.gid
                )));
            }
            let ancestor_key = node_key(doc.doc_id(), id);
            if let Some(pointer) = self.btree.find_value(&ancestor_key)? {
                break pointer;
            }
        };

        let mut iter = self.iterator_at(owner, ancestor_pointer);
        let Some(ancestor) = iter.next() else {
            return Ok(None);
        };
        self.find_node(doc, &ancestor.data, id, proxy.gid, &mut iter)
    }

    /// Depth-first scan below one node: records arrive from the iterator in
    /// document order, so each child is read once and its subtree consumed
    /// recursively before the next sibling.
    fn find_node(
        &self,
        doc: &dyn Document,
        value: &[u8],
        gid: i64,
        target: i64,
        iter: &mut RecordIterator<'_>,
    ) -> Result<Option<u64>> {
        let child_count = doc.child_count(value);
        if child_count == 0 {
            return Ok(None);
        }
        let first_child = doc.first_child_id(gid);
        if first_child < 0 {
            return Ok(None);
        }
        for child_gid in first_child..first_child + child_count as i64 {
            let Some(child) = iter.next() else {
                return Ok(None);
            };
            if child_gid == target {
                return Ok(Some(child.address));
            }
            if let Some(found) = self.find_node(doc, &child.data, child_gid, target, iter)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// All indexed keys matched by `query`; failures degrade to an empty
    /// list with a log entry.
    pub fn find_keys(&self, query: &IndexQuery) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        let result = self.btree.query(query, &mut |key, _| {
            keys.push(key.to_vec());
            Ok(true)
        });
        if let Err(err) = result {
            log::warn!("key scan failed: {err}");
            return Vec::new();
        }
        keys
    }

    /// All record values whose keys match `query`; failures degrade to an
    /// empty list with a log entry.
    pub fn find_values(&self, query: &IndexQuery) -> Vec<Vec<u8>> {
        let mut values = Vec::new();
        let result = self.btree.query(query, &mut |_, pointer| {
            let mut cache = self.cache.lock();
            values.push(self.read_record(&mut cache, pointer)?);
            Ok(true)
        });
        if let Err(err) = result {
            log::warn!("value scan failed: {err}");
            return Vec::new();
        }
        values
    }

    /// The values of all keys between `first` and `last`, inclusive.
    pub fn find_range(&self, first: &[u8], last: &[u8]) -> Vec<Vec<u8>> {
        self.find_values(&IndexQuery::Between(first.to_vec(), last.to_vec()))
    }

    /// Forward iterator over records, starting at `address`.
    pub fn iterator_at(&self, owner: OwnerId, address: u64) -> RecordIterator<'_> {
        RecordIterator {
            store: self,
            owner,
            proxy: None,
            start_address: address as i64,
            page: -1,
            offset: 0,
            last_tid: 0,
        }
    }

    /// Forward iterator over records, starting at the position of `proxy`
    /// (resolved through the fallback lookup when unindexed).
    pub fn iterator<'s>(
        &'s self,
        owner: OwnerId,
        doc: &'s dyn Document,
        proxy: NodeProxy,
    ) -> RecordIterator<'s> {
        RecordIterator {
            store: self,
            owner,
            proxy: Some((doc, proxy)),
            start_address: -1,
            page: -1,
            offset: 0,
            last_tid: 0,
        }
    }

    /// Write back all dirty pages and the header. Nothing is evicted.
    pub fn flush(&self) -> Result<()> {
        self.btree.flush()?;
        self.cache.lock().flush(&self.file)?;
        self.file.flush_header()?;
        Ok(())
    }

    /// Write back everything and drop the data page buffers.
    pub fn sync(&self) -> Result<()> {
        self.btree.flush()?;
        self.cache.lock().clear(&self.file)?;
        self.file.flush_header()?;
        Ok(())
    }

    pub fn data_buffer_stats(&self) -> BufferStats {
        self.cache.lock().stats()
    }

    pub fn btree_buffer_stats(&self) -> BufferStats {
        self.btree.stats()
    }

    /// Report cache occupancy and hit rates through the logger.
    pub fn log_statistics(&self) {
        let data = self.data_buffer_stats();
        let btree = self.btree_buffer_stats();
        log::info!(
            "data buffers: {}/{} used, {} hits, {} misses",
            data.used,
            data.buffers,
            data.hits,
            data.misses
        );
        log::info!(
            "btree buffers: {}/{} used, {} hits, {} misses",
            btree.used,
            btree.buffers,
            btree.hits,
            btree.misses
        );
    }
}

/// Lazy forward scan over records in chain order. Every step takes the
/// engine lock in shared mode for the iterator's owner and releases it
/// before handing the record out; the iterator never holds the lock between
/// steps. Errors and lock timeouts end the iteration.
pub struct RecordIterator<'s> {
    store: &'s DomStore,
    owner: OwnerId,
    proxy: Option<(&'s dyn Document, NodeProxy)>,
    start_address: i64,
    page: i64,
    offset: usize,
    last_tid: u16,
}

impl RecordIterator<'_> {
    /// The address of the record most recently returned.
    pub fn current_address(&self) -> u64 {
        create_pointer(self.page.max(0) as u32, self.last_tid)
    }

    fn step(&mut self) -> Result<Option<Record>> {
        let lock = self.store.lock();
        lock.acquire(self.owner, LockMode::Shared)?;
        lock.enter(self.owner);
        let result = self.step_locked();
        lock.release(self.owner);
        result
    }

    fn step_locked(&mut self) -> Result<Option<Record>> {
        // resolve the starting position exactly once
        if let Some((doc, proxy)) = self.proxy.take() {
            match self.store.find_value_for(self.owner, doc, proxy)? {
                Some(pointer) => self.position_at(pointer)?,
                None => return Ok(None),
            }
        } else if self.start_address > -1 {
            let pointer = self.start_address as u64;
            self.start_address = -1;
            self.position_at(pointer)?;
        }
        if self.page < 0 {
            return Ok(None);
        }

        let mut cache = self.store.cache.lock();
        let (data_len, next) =
            self.store
                .with_page(&mut cache, self.page as u32, 1, |page| {
                    (page.header.data_len, page.header.next_page)
                })?;
        if self.offset >= data_len {
            if next < 0 {
                return Ok(None);
            }
            self.page = next;
            self.offset = 0;
        }

        let num = self.page as u32;
        let offset = self.offset;
        let Some((tid, data)) = self.store.with_page(&mut cache, num, 1, |page| {
            if offset + RECORD_HEADER_SIZE > page.header.data_len {
                return None;
            }
            let tid = page.data[offset..].read_u16();
            let len = page.data[offset + 2..].read_u16() as usize;
            Some((tid, page.data[offset + 4..offset + 4 + len].to_vec()))
        })?
        else {
            return Ok(None);
        };
        self.last_tid = tid;
        self.offset = offset + RECORD_HEADER_SIZE + data.len();
        Ok(Some(Record {
            address: create_pointer(num, tid),
            data,
        }))
    }

    /// Drop the record most recently returned from its page's accounting.
    /// Draining the page unlinks it and moves the iterator to its
    /// successor. Failures are logged; the iterator then stops.
    pub fn remove(&mut self) {
        if let Err(err) = self.remove_step() {
            log::warn!("iterator remove failed: {err}");
            self.page = -1;
        }
    }

    fn remove_step(&mut self) -> Result<()> {
        if self.page < 0 {
            return Ok(());
        }
        let lock = self.store.lock();
        lock.acquire(self.owner, LockMode::Exclusive)?;
        lock.enter(self.owner);
        let result = (|| {
            let num = self.page as u32;
            let mut cache = self.store.cache.lock();
            let (records, next, prev) = self.store.with_page(&mut cache, num, 1, |page| {
                page.header.records = page.header.records.saturating_sub(1);
                page.dirty = true;
                (
                    page.header.records,
                    page.header.next_page,
                    page.header.prev_page,
                )
            })?;
            if records == 0 {
                self.store.drop_page(&mut cache, num, prev, next)?;
                self.page = next;
                self.offset = 0;
            }
            Ok(())
        })();
        lock.release(self.owner);
        result
    }

    fn position_at(&mut self, pointer: u64) -> Result<()> {
        let mut cache = self.store.cache.lock();
        match self.store.find_value_position(&mut cache, pointer)? {
            Some(rec) => {
                self.page = rec.page as i64;
                self.offset = rec.offset - 2;
            }
            None => self.page = -1,
        }
        Ok(())
    }
}

impl Iterator for RecordIterator<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        match self.step() {
            Ok(record) => record,
            Err(err) => {
                log::warn!("iterator stopped: {err}");
                self.page = -1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(settings: Settings) -> (tempfile::TempDir, DomStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DomStore::open(&dir.path().join("dom.db"), settings).unwrap();
        (dir, store)
    }

    fn page_header(store: &DomStore, num: u32) -> (u16, usize, i64, i64, u16) {
        let mut cache = store.cache.lock();
        store
            .with_page(&mut cache, num, 1, |page| {
                (
                    page.header.records,
                    page.header.data_len,
                    page.header.next_page,
                    page.header.prev_page,
                    page.header.tid,
                )
            })
            .unwrap()
    }

    #[test]
    fn test_add_assigns_sequential_tids() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        let a = store.add(owner, &[1u8; 100]).unwrap();
        let b = store.add(owner, &[2u8; 200]).unwrap();
        let c = store.add(owner, &[3u8; 300]).unwrap();

        assert_eq!(page_from_pointer(a), page_from_pointer(b));
        assert_eq!(page_from_pointer(b), page_from_pointer(c));
        assert_eq!(1, tid_from_pointer(a));
        assert_eq!(2, tid_from_pointer(b));
        assert_eq!(3, tid_from_pointer(c));

        assert_eq!(vec![1u8; 100], store.get_at(a).unwrap());
        assert_eq!(vec![2u8; 200], store.get_at(b).unwrap());
        assert_eq!(vec![3u8; 300], store.get_at(c).unwrap());

        let (records, data_len, _, _, _) = page_header(&store, page_from_pointer(a));
        assert_eq!(3, records);
        assert_eq!(100 + 200 + 300 + 12, data_len);
    }

    #[test]
    fn test_add_links_new_page_when_full() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        let first = store.add(owner, &[0u8; 500]).unwrap();
        let old_page = page_from_pointer(first);
        let mut last = first;
        while page_from_pointer(last) == old_page {
            last = store.add(owner, &[0u8; 500]).unwrap();
        }

        let new_page = page_from_pointer(last);
        assert_eq!(1, tid_from_pointer(last));

        let (_, _, old_next, _, _) = page_header(&store, old_page);
        let (_, _, _, new_prev, _) = page_header(&store, new_page);
        assert_eq!(new_page as i64, old_next);
        assert_eq!(old_page as i64, new_prev);
    }

    #[test]
    fn test_value_filling_whole_work_area() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();
        let work = store.work_size();

        let full = vec![9u8; work - RECORD_HEADER_SIZE];
        let p = store.add(owner, &full).unwrap();
        assert_eq!(full, store.get_at(p).unwrap());
        let (_, data_len, _, _, _) = page_header(&store, page_from_pointer(p));
        assert_eq!(work, data_len);

        let over = vec![9u8; work - RECORD_HEADER_SIZE + 1];
        assert!(matches!(
            store.add(owner, &over),
            Err(StoreError::InvalidArgument(_))
        ));

        // the full page forces the next record onto a fresh page
        let q = store.add(owner, b"next").unwrap();
        assert_ne!(page_from_pointer(p), page_from_pointer(q));
    }

    #[test]
    fn test_insert_after_shifts_in_page() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        let r1 = store.add(owner, b"first record").unwrap();
        let r2 = store.add(owner, b"second record").unwrap();
        let r3 = store.add(owner, b"third record").unwrap();

        let (_, before, _, _, _) = page_header(&store, page_from_pointer(r2));
        let inserted = store.insert_after(r2, b"in between").unwrap();
        let (records, after, _, _, _) = page_header(&store, page_from_pointer(r2));

        assert_eq!(page_from_pointer(r2), page_from_pointer(inserted));
        assert_eq!(before + b"in between".len() + RECORD_HEADER_SIZE, after);
        assert_eq!(4, records);

        assert_eq!(b"first record".to_vec(), store.get_at(r1).unwrap());
        assert_eq!(b"third record".to_vec(), store.get_at(r3).unwrap());
        assert_eq!(b"in between".to_vec(), store.get_at(inserted).unwrap());

        let order: Vec<Vec<u8>> = store.iterator_at(owner, r1).map(|r| r.data).collect();
        assert_eq!(
            vec![
                b"first record".to_vec(),
                b"second record".to_vec(),
                b"in between".to_vec(),
                b"third record".to_vec(),
            ],
            order
        );
    }

    #[test]
    fn test_insert_after_first_record() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        let r1 = store.add(owner, b"head").unwrap();
        let r2 = store.add(owner, b"tail").unwrap();
        let inserted = store.insert_after(r1, b"middle").unwrap();

        let order: Vec<Vec<u8>> = store.iterator_at(owner, r1).map(|r| r.data).collect();
        assert_eq!(
            vec![b"head".to_vec(), b"middle".to_vec(), b"tail".to_vec()],
            order
        );
        assert_eq!(b"tail".to_vec(), store.get_at(r2).unwrap());
        assert_eq!(b"middle".to_vec(), store.get_at(inserted).unwrap());
    }

    #[test]
    fn test_insert_after_splits_full_page() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        // ten records of 400 bytes fill a 4066-byte work area
        let mut addrs = Vec::new();
        for i in 0..10u8 {
            addrs.push(store.add(owner, &[i; 400]).unwrap());
        }
        let old_page = page_from_pointer(addrs[0]);
        assert!(addrs.iter().all(|&a| page_from_pointer(a) == old_page));

        let inserted = store.insert_after(addrs[4], &[99u8; 300]).unwrap();
        assert_eq!(old_page, page_from_pointer(inserted));

        // the tail records moved to the split page but keep their addresses
        let (old_records, old_len, old_next, _, _) = page_header(&store, old_page);
        assert!(old_next > -1);
        let split_page = old_next as u32;
        let (split_records, split_len, _, split_prev, split_tid) =
            page_header(&store, split_page);

        assert_eq!(6, old_records);
        assert_eq!(5, split_records);
        assert_eq!(old_page as i64, split_prev);
        assert_eq!(6 * 404 - 100, old_len);
        assert_eq!(5 * 404, split_len);
        // the split page inherited the tid allocator; the new record's tid
        // continues the old page's sequence
        assert_eq!(10, split_tid);
        assert_eq!(11, tid_from_pointer(inserted));

        for (i, &addr) in addrs.iter().enumerate() {
            assert_eq!(vec![i as u8; 400], store.get_at(addr).unwrap(), "record {i}");
        }
        assert_eq!(vec![99u8; 300], store.get_at(inserted).unwrap());

        let order: Vec<u64> = store.iterator_at(owner, addrs[0]).map(|r| r.address).collect();
        let mut expected = addrs[..5].to_vec();
        expected.push(inserted);
        expected.extend_from_slice(&addrs[5..]);
        assert_eq!(expected, order);
    }

    #[test]
    fn test_insert_after_last_record_of_full_page() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        let mut addrs = Vec::new();
        for i in 0..10u8 {
            addrs.push(store.add(owner, &[i; 400]).unwrap());
        }
        let old_page = page_from_pointer(addrs[0]);

        let inserted = store.insert_after(addrs[9], &[7u8; 300]).unwrap();
        let new_page = page_from_pointer(inserted);
        assert_ne!(old_page, new_page);
        assert_eq!(1, tid_from_pointer(inserted));

        let (_, _, old_next, _, _) = page_header(&store, old_page);
        let (_, _, _, new_prev, _) = page_header(&store, new_page);
        assert_eq!(new_page as i64, old_next);
        assert_eq!(old_page as i64, new_prev);
        assert_eq!(vec![7u8; 300], store.get_at(inserted).unwrap());
    }

    #[test]
    fn test_update_length_contract() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        store.put(owner, b"k", b"abc").unwrap();
        assert!(store.update(b"k", b"xyz").unwrap());
        assert_eq!(Some(b"xyz".to_vec()), store.get(b"k"));

        assert!(matches!(
            store.update(b"k", b"longer"),
            Err(StoreError::InvalidArgument(msg)) if msg == "value too long"
        ));
        assert!(matches!(
            store.update(b"k", b"xy"),
            Err(StoreError::InvalidArgument(msg)) if msg == "value shrunk"
        ));
        assert!(!store.update(b"unknown", b"xyz").unwrap());
    }

    #[test]
    fn test_remove_drains_page_and_unlinks_chain() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        // three pages in one chain
        let a = store.add(owner, &[1u8; 3000]).unwrap();
        let b = store.add(owner, &[2u8; 3000]).unwrap();
        let c = store.add(owner, &[3u8; 3000]).unwrap();
        let (pa, pb, pc) = (
            page_from_pointer(a),
            page_from_pointer(b),
            page_from_pointer(c),
        );
        assert!(pa != pb && pb != pc);

        let freed_before = store.file.page_count();
        store.remove_at(b).unwrap();
        assert_eq!(freed_before - 1, store.file.page_count());

        // the chain now skips the drained page in both directions
        let (_, _, a_next, _, _) = page_header(&store, pa);
        let (_, _, _, c_prev, _) = page_header(&store, pc);
        assert_eq!(pc as i64, a_next);
        assert_eq!(pa as i64, c_prev);

        assert_eq!(vec![1u8; 3000], store.get_at(a).unwrap());
        assert_eq!(vec![3u8; 3000], store.get_at(c).unwrap());

        // the freed page is recycled
        assert_eq!(pb, store.file.get_free_page().unwrap());
    }

    #[test]
    fn test_tids_are_not_reused_after_remove() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        let a = store.add(owner, b"aaa").unwrap();
        let b = store.add(owner, b"bbb").unwrap();
        assert_eq!(2, tid_from_pointer(b));

        store.remove_at(b).unwrap();
        let c = store.add(owner, b"ccc").unwrap();
        assert_eq!(page_from_pointer(a), page_from_pointer(c));
        assert_eq!(3, tid_from_pointer(c));
        assert!(store.get_at(create_pointer(page_from_pointer(a), 2)).is_err());
    }

    #[test]
    fn test_eviction_writes_back_under_pressure() {
        let settings = Settings {
            data_buffers: 16,
            ..Settings::default()
        };
        let (_dir, store) = test_store(settings);
        let owner = store.new_owner();

        // far more pages than buffers
        let mut addrs = Vec::new();
        for i in 0..200u32 {
            let value = vec![(i % 251) as u8; 2000];
            addrs.push((store.add(owner, &value).unwrap(), value));
        }
        for (addr, value) in &addrs {
            assert_eq!(value, &store.get_at(*addr).unwrap());
        }
        assert!(store.data_buffer_stats().used <= 17);
    }

    #[test]
    fn test_flush_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dom.db");
        let addr;
        {
            let store = DomStore::open(&path, Settings::default()).unwrap();
            let owner = store.new_owner();
            addr = store.put(owner, b"key1", b"hello dom").unwrap();
            store.flush().unwrap();
        }

        let store = DomStore::open(&path, Settings::default()).unwrap();
        assert_eq!(Some(b"hello dom".to_vec()), store.get(b"key1"));
        assert_eq!(b"hello dom".to_vec(), store.get_at(addr).unwrap());
    }

    #[test]
    fn test_migrated_record_found_from_origin_page() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        let mut addrs = Vec::new();
        for i in 0..10u8 {
            addrs.push(store.add(owner, &[i; 400]).unwrap());
        }
        // push the tail of the page away twice
        store.insert_after(addrs[0], &[50u8; 350]).unwrap();
        store.insert_after(addrs[1], &[60u8; 350]).unwrap();

        // address still names the origin page; the record lives further
        // down the chain and is found by following next links
        for (i, &addr) in addrs.iter().enumerate() {
            assert_eq!(vec![i as u8; 400], store.get_at(addr).unwrap(), "record {i}");
        }
    }

    #[test]
    fn test_read_only_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dom.db");
        {
            let store = DomStore::open(&path, Settings::default()).unwrap();
            let owner = store.new_owner();
            store.put(owner, b"k", b"v").unwrap();
            store.flush().unwrap();
        }

        let settings = Settings {
            read_only: true,
            ..Settings::default()
        };
        let store = DomStore::open(&path, settings).unwrap();
        let owner = store.new_owner();
        assert_eq!(Some(b"v".to_vec()), store.get(b"k"));
        assert!(matches!(
            store.add(owner, b"x"),
            Err(StoreError::ReadOnly)
        ));
        assert!(matches!(store.remove(b"k"), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn test_separate_owners_write_separate_chains() {
        let (_dir, store) = test_store(Settings::default());
        let owner1 = store.new_owner();
        let owner2 = store.new_owner();

        let a = store.add(owner1, b"first chain").unwrap();
        let b = store.add(owner2, b"second chain").unwrap();
        assert_ne!(page_from_pointer(a), page_from_pointer(b));

        store.close_document(owner1);
        let c = store.add(owner1, b"new chain").unwrap();
        assert_ne!(page_from_pointer(a), page_from_pointer(c));
    }

    #[test]
    fn test_iterator_remove_unlinks_drained_page() {
        let (_dir, store) = test_store(Settings::default());
        let owner = store.new_owner();

        let a = store.add(owner, &[1u8; 3000]).unwrap();
        let b = store.add(owner, &[2u8; 3000]).unwrap();
        let pb = page_from_pointer(b);

        let mut iter = store.iterator_at(owner, b);
        iter.next().unwrap();
        iter.remove();

        let (_, _, a_next, _, _) = page_header(&store, page_from_pointer(a));
        assert_eq!(-1, a_next);
        assert_eq!(pb, store.file.get_free_page().unwrap());
    }
}
