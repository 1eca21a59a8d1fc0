use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::error::StorageError;
use super::file::FileEntry;

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

struct OpenFile {
    entry: FileEntry,
    file: File,
}

/// The torrent's files seen as one contiguous byte range.
///
/// Every file is created (and sized) when the store opens. Bytes past the
/// last file read as zeros and may only be written as zeros.
pub struct FileStore {
    base_path: PathBuf,
    files: Vec<OpenFile>,
    total_length: u64,
}

impl FileStore {
    /// Opens or creates every file under `base_path`.
    ///
    /// `entries` must be laid out back to back, as [`FileEntry::layout`]
    /// does. Existing files keep their contents and are resized to their
    /// declared length.
    pub async fn open(
        base_path: impl Into<PathBuf>,
        entries: Vec<FileEntry>,
    ) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        for entry in &entries {
            validate_file_path(&entry.path)?;
        }

        let mut files = Vec::with_capacity(entries.len());
        let mut total_length = 0;
        for entry in entries {
            let path = base_path.join(&entry.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;
            file.set_len(entry.length).await?;

            total_length = total_length.max(entry.end());
            files.push(OpenFile { entry, file });
        }

        debug!(
            base = %base_path.display(),
            files = files.len(),
            total_length,
            "file store opened"
        );

        Ok(Self {
            base_path,
            files,
            total_length,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Index of the file holding `offset`, or `files.len()` past the end.
    fn locate(&self, offset: u64) -> usize {
        self.files.partition_point(|f| f.entry.end() <= offset)
    }

    pub async fn read_at(&mut self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        let mut data = vec![0u8; length];
        let mut filled = 0usize;
        let mut position = offset;
        let mut index = self.locate(offset);

        while filled < length && index < self.files.len() {
            let open = &mut self.files[index];
            let file_offset = position - open.entry.offset;
            let take = (open.entry.length - file_offset).min((length - filled) as u64) as usize;

            if take > 0 {
                open.file.seek(SeekFrom::Start(file_offset)).await?;
                open.file.read_exact(&mut data[filled..filled + take]).await?;
                filled += take;
                position += take as u64;
            }
            index += 1;
        }

        // Anything left over lies past the last file and stays zero.
        Ok(Bytes::from(data))
    }

    /// Writes `data` at `offset` and returns its length.
    ///
    /// The part of `data` that falls past the end must be zeros; otherwise
    /// nothing is written.
    pub async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, StorageError> {
        let inside = self.total_length.saturating_sub(offset).min(data.len() as u64) as usize;
        if let Some(pos) = data[inside..].iter().position(|&b| b != 0) {
            return Err(StorageError::NonZeroPastEnd {
                offset: offset + (inside + pos) as u64,
            });
        }

        let mut written = 0usize;
        let mut position = offset;
        let mut index = self.locate(offset);

        while written < inside && index < self.files.len() {
            let open = &mut self.files[index];
            let file_offset = position - open.entry.offset;
            let take = (open.entry.length - file_offset).min((inside - written) as u64) as usize;

            if take > 0 {
                open.file.seek(SeekFrom::Start(file_offset)).await?;
                open.file.write_all(&data[written..written + take]).await?;
                open.file.flush().await?;
                written += take;
                position += take as u64;
            }
            index += 1;
        }

        Ok(data.len())
    }

    pub async fn flush(&mut self) -> Result<(), StorageError> {
        for open in &mut self.files {
            open.file.flush().await?;
        }
        Ok(())
    }
}
