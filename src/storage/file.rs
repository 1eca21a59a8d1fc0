use std::ops::Range;
use std::path::PathBuf;

/// One file of a torrent and its place in the flat byte space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the store's base directory.
    pub path: PathBuf,
    pub length: u64,
    /// Offset of the file's first byte in the torrent.
    pub offset: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }

    /// Lays files out back to back in the given order.
    pub fn layout<I, P>(files: I) -> Vec<FileEntry>
    where
        I: IntoIterator<Item = (P, u64)>,
        P: Into<PathBuf>,
    {
        let mut offset = 0;
        files
            .into_iter()
            .map(|(path, length)| {
                let entry = FileEntry::new(path.into(), length, offset);
                offset += length;
                entry
            })
            .collect()
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.end()
    }
}
