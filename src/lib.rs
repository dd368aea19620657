// TODO: reclaim underfull btree leaves with a compaction pass
// TODO: batch header writes when many pages are freed at once

mod addr;
mod bins;
mod btree;
mod cache;
mod error;
mod lock;
mod node;
mod paging;
mod store;

pub use addr::{create_pointer, format_address, page_from_pointer, tid_from_pointer};
pub use btree::IndexQuery;
pub use cache::BufferStats;
pub use error::{Result, StoreError};
pub use lock::{LockMode, OwnerId, TimeoutLock};
pub use node::{node_key, Document, NodeProxy, NODE_KEY_LEN};
pub use store::{DomStore, Record, RecordIterator, Settings};
