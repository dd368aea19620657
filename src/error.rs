use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("btree error: {0}")]
    BTree(String),

    #[error("lock acquisition timed out")]
    LockTimeout,

    #[error("file is read-only")]
    ReadOnly,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupted file: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
