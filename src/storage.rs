//! Block storage.
//!
//! A torrent's files are treated as one flat byte range. Peers never touch
//! the files directly: they send [`FileRequest`]s to a single [`FileWorker`]
//! task that owns the [`FileStore`].
//!
//! # Examples
//!
//! ```no_run
//! use bitswarm::storage::{self, FileEntry, FileStore, FileWorker};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let files = FileEntry::layout([("album/01.flac", 30_000_000), ("album/cover.jpg", 250_000)]);
//! let store = FileStore::open("./downloads", files).await?;
//! let (requests, _worker) = FileWorker::spawn(store, 64);
//!
//! let block = storage::read(&requests, 16_384, 16_384).await?;
//! assert_eq!(block.len(), 16_384);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! File paths containing `..` or absolute paths are rejected when the store
//! opens.

mod error;
mod file;
mod store;
mod worker;

pub use error::StorageError;
pub use file::FileEntry;
pub use store::FileStore;
pub use worker::{read, write, FileRequest, FileWorker};
