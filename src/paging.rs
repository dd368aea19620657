use crate::bins::{SliceExt, SliceMutExt};
use crate::error::{Result, StoreError};
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub(crate) const DEFAULT_PAGE_SIZE: usize = 0x1000;
const MINIMUM_PAGE_SIZE: usize = 256;
const MAXIMUM_PAGE_SIZE: usize = 0x4000;

const MAGIC_HEADER: &[u8] = b"domstor1";
const FORMAT_VERSION: u16 = 1;

// page statuses
pub(crate) const STATUS_FREE: u8 = 0;
pub(crate) const STATUS_LEAF: u8 = 1;
pub(crate) const STATUS_BRANCH: u8 = 2;
pub(crate) const STATUS_RECORD: u8 = 20;

// every page starts with: status u8, dirty u8, record_len i32
pub(crate) const PAGE_HEADER_SIZE: usize = 6;
pub(crate) const PAGE_HEADER_STATUS: usize = 0;
pub(crate) const PAGE_HEADER_DIRTY: usize = 1;
pub(crate) const PAGE_HEADER_RECORD_LEN: usize = 2;

// free pages keep the next free-list entry right after the common header
const FREE_PAGE_NEXT: usize = PAGE_HEADER_SIZE;

const HEADER_MAGIC_END: usize = 8;
const HEADER_VERSION: usize = 8;
const HEADER_PAGE_SIZE: usize = 10;
const HEADER_PAGE_COUNT: usize = 14;
const HEADER_TOTAL_COUNT: usize = 22;
const HEADER_KEY_LEN: usize = 30;
const HEADER_FREE_LIST: usize = 32;
const HEADER_BTREE_ROOT: usize = 40;
const HEADER_RESERVED_COUNT: usize = 48;
const HEADER_FIXED_SIZE: usize = 52;

/// File header, persisted in the first `page_size` bytes of the file.
/// Guarded by a crc64 checksum; a mismatch on open is reported as
/// corruption rather than silently reinitialized.
pub(crate) struct FileHeader {
    pub(crate) page_size: u32,
    pub(crate) page_count: i64,
    pub(crate) total_count: i64,
    pub(crate) key_len: i16,
    pub(crate) free_list_head: i64,
    pub(crate) btree_root: i64,
    pub(crate) reserved: Vec<i64>,
    dirty: bool,
}

impl FileHeader {
    fn new(page_size: u32) -> Self {
        Self {
            page_size,
            page_count: 0,
            total_count: 0,
            key_len: -1,
            free_list_head: -1,
            btree_root: -1,
            reserved: Vec::new(),
            dirty: true,
        }
    }

    fn encode(&self, buff: &mut [u8]) {
        buff[..HEADER_MAGIC_END].copy_from_slice(MAGIC_HEADER);
        buff[HEADER_VERSION..].write_u16(FORMAT_VERSION);
        buff[HEADER_PAGE_SIZE..].write_u32(self.page_size);
        buff[HEADER_PAGE_COUNT..].write_i64(self.page_count);
        buff[HEADER_TOTAL_COUNT..].write_i64(self.total_count);
        buff[HEADER_KEY_LEN..].write_i16(self.key_len);
        buff[HEADER_FREE_LIST..].write_i64(self.free_list_head);
        buff[HEADER_BTREE_ROOT..].write_i64(self.btree_root);
        buff[HEADER_RESERVED_COUNT..].write_i32(self.reserved.len() as i32);
        let mut off = HEADER_FIXED_SIZE;
        for &page in &self.reserved {
            buff[off..].write_i64(page);
            off += 8;
        }
        let checksum = crc64::crc64(0x1d0f, &buff[..off]);
        buff[off..].write_u64(checksum);
    }

    fn decode(buff: &[u8]) -> Result<Self> {
        if buff.len() < HEADER_FIXED_SIZE + 8 {
            return Err(StoreError::Corruption("file header truncated".into()));
        }
        if buff[..HEADER_MAGIC_END] != *MAGIC_HEADER {
            return Err(StoreError::Corruption("not a dom storage file".into()));
        }
        let version = buff[HEADER_VERSION..].read_u16();
        if version != FORMAT_VERSION {
            return Err(StoreError::Corruption(format!(
                "unsupported format version {version}"
            )));
        }
        let page_size = buff[HEADER_PAGE_SIZE..].read_u32();
        let reserved_count = buff[HEADER_RESERVED_COUNT..].read_i32();
        if reserved_count < 0
            || HEADER_FIXED_SIZE + reserved_count as usize * 8 + 8 > buff.len()
        {
            return Err(StoreError::Corruption(format!(
                "invalid reserved page count {reserved_count}"
            )));
        }
        let mut reserved = Vec::with_capacity(reserved_count as usize);
        let mut off = HEADER_FIXED_SIZE;
        for _ in 0..reserved_count {
            reserved.push(buff[off..].read_i64());
            off += 8;
        }
        let checksum = crc64::crc64(0x1d0f, &buff[..off]);
        if checksum != buff[off..].read_u64() {
            return Err(StoreError::Corruption("file header checksum mismatch".into()));
        }
        Ok(Self {
            page_size,
            page_count: buff[HEADER_PAGE_COUNT..].read_i64(),
            total_count: buff[HEADER_TOTAL_COUNT..].read_i64(),
            key_len: buff[HEADER_KEY_LEN..].read_i16(),
            free_list_head: buff[HEADER_FREE_LIST..].read_i64(),
            btree_root: buff[HEADER_BTREE_ROOT..].read_i64(),
            reserved,
            dirty: false,
        })
    }
}

/// Fixed-size pages over a single file. Page `n` lives at byte offset
/// `(n + 1) * page_size`; the first page-sized block holds the file header.
/// Freed pages are chained into a free list rooted in the header.
pub(crate) struct PageFile {
    file: Mutex<File>,
    page_size: usize,
    header: RwLock<FileHeader>,
}

impl PageFile {
    /// Open the file at `path`, creating it with an empty header if it does
    /// not exist yet. Returns the file and whether it was created.
    pub(crate) fn open(path: &Path, page_size: usize) -> Result<(Self, bool)> {
        Self::check_page_size(page_size)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let created = len == 0;
        let header = if created {
            let header = FileHeader::new(page_size as u32);
            let mut buff = vec![0u8; page_size];
            header.encode(&mut buff);
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&buff)?;
            header
        } else {
            if len < MINIMUM_PAGE_SIZE as u64 {
                return Err(StoreError::Corruption("file header truncated".into()));
            }
            // the header never outgrows the first page, which is at most
            // MAXIMUM_PAGE_SIZE bytes
            let mut buff = vec![0u8; MAXIMUM_PAGE_SIZE.min(len as usize)];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buff)?;
            let header = FileHeader::decode(&buff)?;
            Self::check_page_size(header.page_size as usize)?;
            header
        };

        let page_size = header.page_size as usize;
        Ok((
            Self {
                file: Mutex::new(file),
                page_size,
                header: RwLock::new(header),
            },
            created,
        ))
    }

    fn check_page_size(page_size: usize) -> Result<()> {
        if page_size.count_ones() != 1
            || !(MINIMUM_PAGE_SIZE..=MAXIMUM_PAGE_SIZE).contains(&page_size)
        {
            return Err(StoreError::InvalidArgument(format!(
                "page size must be a power of 2 between {MINIMUM_PAGE_SIZE} and \
                 {MAXIMUM_PAGE_SIZE}, but got {page_size}"
            )));
        }
        Ok(())
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_offset(&self, num: u32) -> u64 {
        (num as u64 + 1) * self.page_size as u64
    }

    /// Read the raw contents of page `num`.
    pub(crate) fn read_page(&self, num: u32) -> Result<Vec<u8>> {
        let mut buff = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.page_offset(num)))?;
        file.read_exact(&mut buff)?;
        Ok(buff)
    }

    /// Write the raw contents of page `num`.
    pub(crate) fn write_page(&self, num: u32, buff: &[u8]) -> Result<()> {
        assert_eq!(self.page_size, buff.len(), "page buffer size mismatch");
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.page_offset(num)))?;
        file.write_all(buff)?;
        Ok(())
    }

    /// Take a page off the free list, extending the file if the list is
    /// empty. The caller owns the page's initialization.
    pub(crate) fn get_free_page(&self) -> Result<u32> {
        let mut header = self.header.write();
        let num = if header.free_list_head > -1 {
            let num = header.free_list_head as u32;
            let buff = self.read_page(num)?;
            if buff[PAGE_HEADER_STATUS] != STATUS_FREE {
                return Err(StoreError::Corruption(format!(
                    "free list points at live page {num}"
                )));
            }
            header.free_list_head = buff[FREE_PAGE_NEXT..].read_i64();
            num
        } else {
            if header.total_count > u32::MAX as i64 {
                return Err(StoreError::InvalidArgument("page space exhausted".into()));
            }
            let num = header.total_count as u32;
            header.total_count += 1;
            num
        };
        header.page_count += 1;
        header.dirty = true;
        Ok(num)
    }

    /// Reset page `num` to the free state and push it onto the free list.
    pub(crate) fn unlink_page(&self, num: u32) -> Result<()> {
        let mut header = self.header.write();
        let mut buff = vec![0u8; self.page_size];
        buff[PAGE_HEADER_STATUS] = STATUS_FREE;
        buff[FREE_PAGE_NEXT..].write_i64(header.free_list_head);
        self.write_page(num, &buff)?;
        header.free_list_head = num as i64;
        header.page_count -= 1;
        header.dirty = true;
        Ok(())
    }

    /// Persist the header if it changed. Safe to call repeatedly.
    pub(crate) fn flush_header(&self) -> Result<()> {
        let mut header = self.header.write();
        if !header.dirty {
            return Ok(());
        }
        let mut buff = vec![0u8; self.page_size];
        header.encode(&mut buff);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&buff)?;
        header.dirty = false;
        Ok(())
    }

    pub(crate) fn btree_root(&self) -> Option<u32> {
        let root = self.header.read().btree_root;
        (root > -1).then_some(root as u32)
    }

    pub(crate) fn set_btree_root(&self, num: u32) {
        let mut header = self.header.write();
        header.btree_root = num as i64;
        header.dirty = true;
    }

    pub(crate) fn key_len(&self) -> Option<u16> {
        let len = self.header.read().key_len;
        (len > 0).then_some(len as u16)
    }

    pub(crate) fn set_key_len(&self, len: u16) {
        let mut header = self.header.write();
        header.key_len = len as i16;
        header.dirty = true;
    }

    pub(crate) fn page_count(&self) -> i64 {
        self.header.read().page_count
    }

    pub(crate) fn total_count(&self) -> i64 {
        self.header.read().total_count
    }

    /// Remember a page set aside for structural use; the list is persisted
    /// with the header.
    pub(crate) fn add_reserved_page(&self, num: u32) {
        let mut header = self.header.write();
        header.reserved.push(num as i64);
        header.dirty = true;
    }

    pub(crate) fn take_reserved_page(&self) -> Option<u32> {
        let mut header = self.header.write();
        let page = header.reserved.pop()?;
        header.dirty = true;
        Some(page as u32)
    }
}
