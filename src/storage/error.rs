use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),

    #[error("non-zero data past the end of the store at offset {offset}")]
    NonZeroPastEnd { offset: u64 },

    #[error("file worker is gone")]
    WorkerGone,
}
