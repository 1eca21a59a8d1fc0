use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::error::StorageError;
use super::store::FileStore;

/// A read or write against the file store, answered on `reply`.
#[derive(Debug)]
pub enum FileRequest {
    Read {
        offset: u64,
        length: usize,
        reply: oneshot::Sender<Result<Bytes, StorageError>>,
    },
    Write {
        offset: u64,
        data: Bytes,
        reply: oneshot::Sender<Result<usize, StorageError>>,
    },
}

/// Serializes access to a [`FileStore`] behind a channel.
pub struct FileWorker {
    store: FileStore,
    requests: mpsc::Receiver<FileRequest>,
}

impl FileWorker {
    pub fn new(store: FileStore, requests: mpsc::Receiver<FileRequest>) -> Self {
        Self { store, requests }
    }

    /// Starts a worker on its own task and returns the sender peers use.
    pub fn spawn(store: FileStore, depth: usize) -> (mpsc::Sender<FileRequest>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(depth);
        let handle = tokio::spawn(Self::new(store, rx).run());
        (tx, handle)
    }

    /// Runs until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            match request {
                FileRequest::Read {
                    offset,
                    length,
                    reply,
                } => {
                    trace!(offset, length, "file read");
                    let _ = reply.send(self.store.read_at(offset, length).await);
                }
                FileRequest::Write {
                    offset,
                    data,
                    reply,
                } => {
                    trace!(offset, length = data.len(), "file write");
                    let _ = reply.send(self.store.write_at(offset, &data).await);
                }
            }
        }

        if let Err(err) = self.store.flush().await {
            debug!(%err, "final flush failed");
        }
        debug!("file worker stopped");
    }
}

/// Reads through a worker's channel.
pub async fn read(
    files: &mpsc::Sender<FileRequest>,
    offset: u64,
    length: usize,
) -> Result<Bytes, StorageError> {
    let (reply, response) = oneshot::channel();
    files
        .send(FileRequest::Read {
            offset,
            length,
            reply,
        })
        .await
        .map_err(|_| StorageError::WorkerGone)?;
    response.await.map_err(|_| StorageError::WorkerGone)?
}

/// Writes through a worker's channel.
pub async fn write(
    files: &mpsc::Sender<FileRequest>,
    offset: u64,
    data: Bytes,
) -> Result<usize, StorageError> {
    let (reply, response) = oneshot::channel();
    files
        .send(FileRequest::Write {
            offset,
            data,
            reply,
        })
        .await
        .map_err(|_| StorageError::WorkerGone)?;
    response.await.map_err(|_| StorageError::WorkerGone)?
}
