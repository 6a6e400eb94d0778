//! Recording files: a set of streams sharing one backing file and one index
//! chain.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rewind_hal::{Rewindable, SnapshotId, SpinLock};

use crate::error::{FsError, FsResult};
use crate::format::{self, ChunkDescriptor, HEADER_SIZE, INDEX_ENTRY_SIZE, INDEX_HEADER_SIZE};
use crate::storage::Storage;
pub use crate::storage::FileMode;
use crate::stream::{Stream, StreamHandle, StreamKey, StreamName};

/// A recording, or a snapshot side file.
#[derive(Debug)]
pub struct File {
    storage: Arc<Storage>,
    streams: SpinLock<BTreeMap<StreamKey, StreamHandle>>,
    /// Serializes index block writes
    flush_lock: SpinLock<()>,
    /// Stream positions at each recorded snapshot
    saved_positions: SpinLock<BTreeMap<SnapshotId, Vec<(StreamKey, u64)>>>,
}

impl File {
    fn with_storage(storage: Storage, streams: BTreeMap<StreamKey, StreamHandle>) -> Self {
        Self {
            storage: Arc::new(storage),
            streams: SpinLock::new(streams),
            flush_lock: SpinLock::new(()),
            saved_positions: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Create (or truncate) `path` for writing.
    pub fn create(path: impl AsRef<Path>) -> FsResult<Self> {
        let storage = Storage::create(path.as_ref())?;
        log::debug!("created recording {}", path.as_ref().display());
        Ok(Self::with_storage(storage, BTreeMap::new()))
    }

    /// Open `path` for reading, rebuilding every stream's chunk list from
    /// the index chain.
    pub fn open(path: impl AsRef<Path>) -> FsResult<Self> {
        let storage = Storage::open(path.as_ref())?;

        let mut header = [0u8; HEADER_SIZE as usize];
        storage.read_at(&mut header, 0)?;
        format::decode_header(&header)?;

        let mut chunks: BTreeMap<StreamKey, Vec<ChunkDescriptor>> = BTreeMap::new();
        let mut offset = format::FIRST_INDEX_OFFSET;
        let mut blocks = 0usize;
        loop {
            let mut raw = [0u8; INDEX_HEADER_SIZE];
            storage.read_at(&mut raw, offset)?;
            let (next, count) = format::decode_index_header(&raw);

            let mut entries = vec![0u8; count * INDEX_ENTRY_SIZE];
            storage.read_at(&mut entries, offset + INDEX_HEADER_SIZE as u64)?;
            for entry in format::decode_index_entries(&entries)? {
                chunks
                    .entry((entry.name, entry.name_index as usize))
                    .or_default()
                    .push(entry.chunk);
            }

            blocks += 1;
            if next == 0 {
                break;
            }
            if next <= offset {
                return Err(FsError::Corrupt(format!(
                    "index block at {} links backwards to {}",
                    offset, next
                )));
            }
            offset = next;
        }

        let storage = Arc::new(storage);
        let streams = chunks
            .into_iter()
            .map(|(key, list)| {
                let stream = Stream::new(storage.clone(), key.0, key.1, list);
                (key, Arc::new(SpinLock::new(stream)))
            })
            .collect();
        log::debug!(
            "opened recording {} ({} index blocks)",
            path.as_ref().display(),
            blocks
        );
        Ok(Self {
            storage,
            streams: SpinLock::new(streams),
            flush_lock: SpinLock::new(()),
            saved_positions: SpinLock::new(BTreeMap::new()),
        })
    }

    /// Open the side file `"{prefix}_{n}"`.
    pub fn open_indexed(prefix: &str, n: usize, mode: FileMode) -> FsResult<Self> {
        let path = indexed_path(prefix, n);
        match mode {
            FileMode::Write => Self::create(path),
            FileMode::Read => Self::open(path),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    /// Current mode.
    pub fn mode(&self) -> FileMode {
        self.storage.mode()
    }

    /// Whether streams of this file append data.
    pub fn is_recording(&self) -> bool {
        self.mode() == FileMode::Write
    }

    /// The stream `(name, index)`, created empty if it does not exist.
    pub fn open_stream(&self, name: StreamName, index: usize) -> StreamHandle {
        let mut streams = self.streams.lock();
        streams
            .entry((name, index))
            .or_insert_with(|| {
                Arc::new(SpinLock::new(Stream::new(
                    self.storage.clone(),
                    name,
                    index,
                    Vec::new(),
                )))
            })
            .clone()
    }

    /// Keys of every stream known to this file.
    pub fn stream_keys(&self) -> Vec<StreamKey> {
        self.streams.lock().keys().copied().collect()
    }

    /// Current position of every stream.
    pub fn stream_positions(&self) -> Vec<(StreamKey, u64)> {
        self.handles()
            .into_iter()
            .map(|(key, stream)| (key, stream.lock().position()))
            .collect()
    }

    fn handles(&self) -> Vec<(StreamKey, StreamHandle)> {
        self.streams
            .lock()
            .iter()
            .map(|(key, stream)| (*key, stream.clone()))
            .collect()
    }

    /// Write out every stream's buffered data and append an index block
    /// describing the new chunks. Does nothing for a reading file.
    pub fn flush(&self) -> FsResult<()> {
        if !self.is_recording() {
            return Ok(());
        }
        let _guard = self.flush_lock.lock();

        let mut entries = Vec::new();
        for (_, stream) in self.handles() {
            entries.extend(stream.lock().take_unindexed()?);
        }
        if entries.is_empty() {
            return Ok(());
        }

        let block = format::encode_index_block(&entries);
        let offset = self.storage.append(&block)?;
        self.storage.link_index_block(offset)?;
        log::trace!(
            "{}: index block at {} with {} chunks",
            self.path().display(),
            offset,
            entries.len()
        );
        Ok(())
    }

    /// Flush and sync a writing file.
    pub fn close(self) -> FsResult<()> {
        self.flush()?;
        if self.is_recording() {
            self.storage.sync()?;
        }
        Ok(())
    }

    /// Turn a writing file into a reading one. Every stream stays at its
    /// current position, which is now the end of its data.
    pub fn switch_to_replay(&self) -> FsResult<()> {
        if !self.is_recording() {
            return Ok(());
        }
        self.flush()?;
        self.storage.set_mode(FileMode::Read);
        for (_, stream) in self.handles() {
            let mut stream = stream.lock();
            let position = stream.position();
            stream.seek(position)?;
        }
        log::info!("{}: switched from recording to replaying", self.path().display());
        Ok(())
    }

    /// Flush, then clone everything written so far into `path`. The copy is
    /// returned in write mode so more streams can be appended to it.
    pub fn save_copy(&self, path: impl AsRef<Path>) -> FsResult<File> {
        if !self.is_recording() {
            return Err(FsError::WrongMode { actual: "reading" });
        }
        self.flush()?;
        let (length, last_index) = {
            let _guard = self.flush_lock.lock();
            (self.storage.write_offset(), self.storage.last_index())
        };

        let source = std::fs::File::open(self.path())?;
        let mut target = std::fs::File::create(path.as_ref())?;
        let copied = io::copy(&mut source.take(length), &mut target)?;
        if copied != length {
            return Err(FsError::Corrupt(format!(
                "copied {} of {} bytes of {}",
                copied,
                length,
                self.path().display()
            )));
        }
        drop(target);

        let storage = Storage::reopen_for_append(path.as_ref(), length, last_index)?;
        Ok(Self::with_storage(storage, BTreeMap::new()))
    }
}

/// Path of side file `n` for `prefix`.
pub fn indexed_path(prefix: &str, n: usize) -> PathBuf {
    PathBuf::from(format!("{}_{}", prefix, n))
}

impl Rewindable for File {
    type Error = FsError;

    fn save_state(&self, snapshot: SnapshotId) {
        let positions = self.stream_positions();
        self.saved_positions.lock().insert(snapshot, positions);
    }

    fn restore_state(&self, snapshot: SnapshotId) -> FsResult<()> {
        self.switch_to_replay()?;

        let positions = {
            let mut saved = self.saved_positions.lock();
            saved.retain(|id, _| *id <= snapshot);
            saved.get(&snapshot).cloned().ok_or_else(|| {
                FsError::Corrupt(format!("no stream positions saved for snapshot {}", snapshot))
            })?
        };
        let positions: BTreeMap<StreamKey, u64> = positions.into_iter().collect();

        // Streams first opened after the snapshot go back to their start.
        for (key, stream) in self.handles() {
            let position = positions.get(&key).copied().unwrap_or(0);
            stream.lock().seek(position)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn streams_survive_multiple_flushes() {
        let dir = scratch();
        let path = dir.path().join("recording");
        let file = File::create(&path).unwrap();
        let a = file.open_stream(StreamName::Event, 2);
        let b = file.open_stream(StreamName::Event, 3);

        a.lock().write_scalar(1).unwrap();
        b.lock().write_scalar(10).unwrap();
        file.flush().unwrap();
        a.lock().write_scalar(2).unwrap();
        file.flush().unwrap();
        file.flush().unwrap();
        b.lock().write_scalar(20).unwrap();
        file.close().unwrap();

        let file = File::open(&path).unwrap();
        assert_eq!(
            file.stream_keys(),
            vec![(StreamName::Event, 2), (StreamName::Event, 3)]
        );
        let a = file.open_stream(StreamName::Event, 2);
        let b = file.open_stream(StreamName::Event, 3);
        assert_eq!(a.lock().read_scalar().unwrap(), 1);
        assert_eq!(a.lock().read_scalar().unwrap(), 2);
        assert!(a.lock().at_end());
        assert_eq!(b.lock().read_scalar().unwrap(), 10);
        assert_eq!(b.lock().read_scalar().unwrap(), 20);
        assert!(b.lock().at_end());
    }

    #[test]
    fn unflushed_data_is_invisible_to_readers() {
        let dir = scratch();
        let path = dir.path().join("recording");
        let file = File::create(&path).unwrap();
        let stream = file.open_stream(StreamName::Main, 0);
        stream.lock().write_scalar(1).unwrap();
        file.flush().unwrap();
        stream.lock().write_scalar(2).unwrap();

        let reader = File::open(&path).unwrap();
        let stream = reader.open_stream(StreamName::Main, 0);
        assert_eq!(stream.lock().read_scalar().unwrap(), 1);
        assert!(stream.lock().at_end());
    }

    #[test]
    fn switch_to_replay_and_rewind_positions() {
        let dir = scratch();
        let file = File::create(dir.path().join("recording")).unwrap();
        let events = file.open_stream(StreamName::Event, 2);
        events.lock().write_scalar(5).unwrap();
        file.save_state(0);
        events.lock().write_scalar(6).unwrap();
        events.lock().write_scalar(7).unwrap();
        file.save_state(1);
        let late = file.open_stream(StreamName::Lock, 2);
        late.lock().write_scalar(3).unwrap();

        file.restore_state(0).unwrap();
        assert!(!file.is_recording());
        assert_eq!(events.lock().read_scalar().unwrap(), 6);
        assert_eq!(events.lock().read_scalar().unwrap(), 7);
        assert!(events.lock().at_end());
        assert_eq!(late.lock().read_scalar().unwrap(), 3);

        // Snapshot 1 was discarded by the rewind to 0.
        assert!(matches!(file.restore_state(1), Err(FsError::Corrupt(_))));
        file.restore_state(0).unwrap();
        assert_eq!(events.lock().position(), 1);
    }

    #[test]
    fn save_copy_appends_independently() {
        let dir = scratch();
        let file = File::create(dir.path().join("recording")).unwrap();
        file.open_stream(StreamName::Event, 2).lock().write_scalar(42).unwrap();

        let copy_path = dir.path().join("saved");
        let copy = file.save_copy(&copy_path).unwrap();
        copy.open_stream(StreamName::WeakPointer, 0)
            .lock()
            .write_scalar(9)
            .unwrap();
        copy.close().unwrap();

        // The original keeps recording.
        file.open_stream(StreamName::Event, 2).lock().write_scalar(43).unwrap();
        file.flush().unwrap();

        let saved = File::open(&copy_path).unwrap();
        let events = saved.open_stream(StreamName::Event, 2);
        assert_eq!(events.lock().read_scalar().unwrap(), 42);
        assert!(events.lock().at_end());
        let table = saved.open_stream(StreamName::WeakPointer, 0);
        assert_eq!(table.lock().read_scalar().unwrap(), 9);
    }

    #[test]
    fn corrupt_chunk_prefix_is_detected() {
        let dir = scratch();
        let path = dir.path().join("recording");
        let file = File::create(&path).unwrap();
        file.open_stream(StreamName::Main, 0).lock().write_scalar(1).unwrap();
        file.close().unwrap();

        // The first chunk follows the header and the empty index block.
        let mut bytes = std::fs::read(&path).unwrap();
        let chunk = (HEADER_SIZE as usize) + INDEX_HEADER_SIZE;
        bytes[chunk] ^= 0x40;
        std::fs::write(&path, bytes).unwrap();

        let file = File::open(&path).unwrap();
        let stream = file.open_stream(StreamName::Main, 0);
        assert!(matches!(stream.lock().read_scalar(), Err(FsError::Corrupt(_))));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = scratch();
        let path = dir.path().join("junk");
        std::fs::write(&path, [0u8; 64]).unwrap();
        assert!(matches!(File::open(&path), Err(FsError::BadHeader { .. })));
    }

    #[test]
    fn indexed_side_files() {
        let dir = scratch();
        let prefix = dir.path().join("snap").display().to_string();
        let file = File::open_indexed(&prefix, 3, FileMode::Write).unwrap();
        file.open_stream(StreamName::Main, 0).lock().write_scalar(77).unwrap();
        file.close().unwrap();
        assert!(dir.path().join("snap_3").exists());

        let file = File::open_indexed(&prefix, 3, FileMode::Read).unwrap();
        assert_eq!(
            file.open_stream(StreamName::Main, 0).lock().read_scalar().unwrap(),
            77
        );
    }
}
