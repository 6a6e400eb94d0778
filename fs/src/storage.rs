//! Positional access to the backing file shared by a file and its streams.

use core::sync::atomic::{AtomicU8, Ordering};
use std::fs;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use rewind_hal::SpinLock;

use crate::error::{FsError, FsResult};
use crate::format::{self, ChunkDescriptor, CHUNK_PREFIX_SIZE};

/// Whether a recording is being produced or consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileMode {
    /// Streams append data
    Write = 0,
    /// Streams consume data
    Read = 1,
}

impl FileMode {
    fn from_u8(value: u8) -> Self {
        if value == FileMode::Write as u8 {
            FileMode::Write
        } else {
            FileMode::Read
        }
    }

    pub(crate) fn describe(self) -> &'static str {
        match self {
            FileMode::Write => "writing",
            FileMode::Read => "reading",
        }
    }
}

#[derive(Debug)]
struct Layout {
    /// End of the data written so far
    write_offset: u64,
    /// Offset of the newest index block
    last_index: u64,
}

/// The backing file. Writers reserve space under a spin lock and then write
/// without holding it.
#[derive(Debug)]
pub(crate) struct Storage {
    path: PathBuf,
    file: fs::File,
    mode: AtomicU8,
    layout: SpinLock<Layout>,
}

impl Storage {
    pub(crate) fn create(path: &Path) -> FsResult<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let storage = Self::new(path, file, FileMode::Write, 0, format::FIRST_INDEX_OFFSET);
        storage.append(&format::encode_header())?;
        storage.append(&format::encode_index_block(&[]))?;
        Ok(storage)
    }

    pub(crate) fn open(path: &Path) -> FsResult<Self> {
        let file = fs::OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::new(path, file, FileMode::Read, len, format::FIRST_INDEX_OFFSET))
    }

    /// Reopen an existing file for appending after `write_offset`.
    pub(crate) fn reopen_for_append(path: &Path, write_offset: u64, last_index: u64) -> FsResult<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self::new(path, file, FileMode::Write, write_offset, last_index))
    }

    fn new(path: &Path, file: fs::File, mode: FileMode, write_offset: u64, last_index: u64) -> Self {
        Self {
            path: path.to_owned(),
            file,
            mode: AtomicU8::new(mode as u8),
            layout: SpinLock::new(Layout {
                write_offset,
                last_index,
            }),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn mode(&self) -> FileMode {
        FileMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub(crate) fn set_mode(&self, mode: FileMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    pub(crate) fn write_offset(&self) -> u64 {
        self.layout.lock().write_offset
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.layout.lock().last_index
    }

    /// Append `bytes` at the end of the file, returning their offset.
    pub(crate) fn append(&self, bytes: &[u8]) -> FsResult<u64> {
        let offset = {
            let mut layout = self.layout.lock();
            let offset = layout.write_offset;
            layout.write_offset += bytes.len() as u64;
            offset
        };
        self.file.write_all_at(bytes, offset)?;
        Ok(offset)
    }

    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> FsResult<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    /// Link a freshly written index block at `offset` into the chain.
    pub(crate) fn link_index_block(&self, offset: u64) -> FsResult<()> {
        let previous = {
            let mut layout = self.layout.lock();
            core::mem::replace(&mut layout.last_index, offset)
        };
        self.file.write_all_at(&offset.to_le_bytes(), previous)?;
        Ok(())
    }

    /// Compress `data` and append it as a chunk.
    pub(crate) fn write_chunk(&self, data: &[u8]) -> FsResult<ChunkDescriptor> {
        let compressed = lz4_flex::block::compress(data);
        let mut bytes = Vec::with_capacity(CHUNK_PREFIX_SIZE as usize + compressed.len());
        bytes.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&compressed);
        let offset = self.append(&bytes)?;
        Ok(ChunkDescriptor {
            offset,
            compressed: compressed.len() as u32,
            decompressed: data.len() as u32,
        })
    }

    /// Read and decompress a chunk into `out`, replacing its contents.
    pub(crate) fn read_chunk(&self, chunk: &ChunkDescriptor, out: &mut Vec<u8>) -> FsResult<()> {
        let mut prefix = [0u8; CHUNK_PREFIX_SIZE as usize];
        self.read_at(&mut prefix, chunk.offset)?;
        if format::read_u32(&prefix) != chunk.compressed {
            return Err(FsError::Corrupt(format!(
                "chunk at {} has length prefix {} but index says {}",
                chunk.offset,
                format::read_u32(&prefix),
                chunk.compressed
            )));
        }

        let mut compressed = vec![0u8; chunk.compressed as usize];
        self.read_at(&mut compressed, chunk.offset + CHUNK_PREFIX_SIZE)?;

        let expected = chunk.decompressed as usize;
        out.clear();
        out.resize(expected, 0);
        match lz4_flex::block::decompress_into(&compressed, out) {
            Ok(len) if len == expected => Ok(()),
            Ok(len) => Err(FsError::Decompress {
                expected,
                detail: format!("got {}", len),
            }),
            Err(err) => Err(FsError::Decompress {
                expected,
                detail: err.to_string(),
            }),
        }
    }

    pub(crate) fn sync(&self) -> FsResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
