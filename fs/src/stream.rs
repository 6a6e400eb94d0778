//! Buffered, chunk-compressed streams.
//!
//! A stream is identified by a [`StreamName`] and a per-name index (the
//! recorded thread id for Event and Assert streams, the lock id for Lock
//! streams). Writes accumulate in an in-memory buffer that is compressed
//! into a chunk once it fills; reads decompress one chunk at a time.

use std::sync::Arc;

use rewind_hal::SpinLock;

use crate::error::{FsError, FsResult};
use crate::format::{ChunkDescriptor, IndexEntry};
use crate::storage::{FileMode, Storage};

/// Largest amount of data buffered before a chunk is written.
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Initial buffer capacity; the buffer doubles up to [`BUFFER_SIZE`].
pub const INITIAL_BUFFER_SIZE: usize = 256;

/// The closed set of stream kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum StreamName {
    /// Process-wide data
    Main = 0,
    /// Per-lock acquisition order
    Lock = 1,
    /// Per-thread events
    Event = 2,
    /// Per-thread assertions
    Assert = 3,
    /// Weak pointer hit counts
    WeakPointer = 4,
}

impl StreamName {
    /// Every stream kind, in tag order.
    pub const ALL: [StreamName; 5] = [
        StreamName::Main,
        StreamName::Lock,
        StreamName::Event,
        StreamName::Assert,
        StreamName::WeakPointer,
    ];

    /// Decode an on-disk tag.
    pub fn from_u32(tag: u32) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }
}

/// Identity of a stream within its file.
pub type StreamKey = (StreamName, usize);

/// Shared handle to a stream owned by a [`File`](crate::File).
pub type StreamHandle = Arc<SpinLock<Stream>>;

/// One logical stream of a recording.
#[derive(Debug)]
pub struct Stream {
    storage: Arc<Storage>,
    name: StreamName,
    index: usize,
    /// Pending data when writing, the current chunk when reading
    buffer: Vec<u8>,
    /// Read cursor within `buffer`
    buffer_pos: usize,
    /// Every chunk of this stream known so far, in order
    chunks: Vec<ChunkDescriptor>,
    /// Chunks written but not yet listed in an index block
    unindexed: Vec<ChunkDescriptor>,
    /// Next chunk to load when reading
    chunk_index: usize,
    /// Bytes written or consumed so far
    position: u64,
}

impl Stream {
    pub(crate) fn new(
        storage: Arc<Storage>,
        name: StreamName,
        index: usize,
        chunks: Vec<ChunkDescriptor>,
    ) -> Self {
        Self {
            storage,
            name,
            index,
            buffer: Vec::with_capacity(INITIAL_BUFFER_SIZE),
            buffer_pos: 0,
            chunks,
            unindexed: Vec::new(),
            chunk_index: 0,
            position: 0,
        }
    }

    /// Stream kind.
    pub fn name(&self) -> StreamName {
        self.name
    }

    /// Per-name index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Bytes written or consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether the owning file is producing a recording.
    pub fn is_recording(&self) -> bool {
        self.storage.mode() == FileMode::Write
    }

    fn require(&self, mode: FileMode) -> FsResult<()> {
        let actual = self.storage.mode();
        if actual == mode {
            Ok(())
        } else {
            Err(FsError::WrongMode {
                actual: actual.describe(),
            })
        }
    }

    fn end_of_stream(&self) -> FsError {
        FsError::EndOfStream {
            name: self.name,
            index: self.index,
        }
    }

    // ========================================================================
    // Raw bytes
    // ========================================================================

    /// Append `data`.
    pub fn write_bytes(&mut self, mut data: &[u8]) -> FsResult<()> {
        self.require(FileMode::Write)?;
        self.position += data.len() as u64;
        while !data.is_empty() {
            let room = BUFFER_SIZE - self.buffer.len();
            let (now, rest) = data.split_at(room.min(data.len()));
            if self.buffer.capacity() < self.buffer.len() + now.len() {
                let wanted = (self.buffer.capacity() * 2)
                    .max(self.buffer.len() + now.len())
                    .min(BUFFER_SIZE);
                self.buffer.reserve_exact(wanted - self.buffer.len());
            }
            self.buffer.extend_from_slice(now);
            data = rest;
            if self.buffer.len() == BUFFER_SIZE {
                self.write_chunk()?;
            }
        }
        Ok(())
    }

    /// Fill `out` with the next bytes of the stream.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> FsResult<()> {
        self.require(FileMode::Read)?;
        let mut filled = 0;
        while filled < out.len() {
            if self.buffer_pos == self.buffer.len() {
                self.load_next_chunk()?;
            }
            let available = self.buffer.len() - self.buffer_pos;
            let n = available.min(out.len() - filled);
            out[filled..filled + n]
                .copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + n]);
            self.buffer_pos += n;
            self.position += n as u64;
            filled += n;
        }
        Ok(())
    }

    /// Consume `count` bytes without looking at them.
    pub fn skip(&mut self, mut count: usize) -> FsResult<()> {
        self.require(FileMode::Read)?;
        while count > 0 {
            if self.buffer_pos == self.buffer.len() {
                self.load_next_chunk()?;
            }
            let n = (self.buffer.len() - self.buffer_pos).min(count);
            self.buffer_pos += n;
            self.position += n as u64;
            count -= n;
        }
        Ok(())
    }

    /// Consume everything left in a reading stream.
    pub fn read_remaining(&mut self) -> FsResult<Vec<u8>> {
        self.require(FileMode::Read)?;
        let mut out = Vec::new();
        loop {
            out.extend_from_slice(&self.buffer[self.buffer_pos..]);
            self.position += (self.buffer.len() - self.buffer_pos) as u64;
            self.buffer_pos = self.buffer.len();
            if self.chunk_index == self.chunks.len() {
                return Ok(out);
            }
            self.load_next_chunk()?;
        }
    }

    /// True once a reading stream has consumed every chunk.
    pub fn at_end(&self) -> bool {
        !self.is_recording()
            && self.buffer_pos == self.buffer.len()
            && self.chunk_index == self.chunks.len()
    }

    // ========================================================================
    // Scalars
    // ========================================================================

    /// Append `value` as 7-bit groups, low bits first, high bit set on every
    /// byte but the last.
    pub fn write_scalar(&mut self, mut value: u64) -> FsResult<()> {
        let mut bytes = [0u8; 10];
        let mut len = 0;
        loop {
            let bits = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                bytes[len] = bits;
                len += 1;
                break;
            }
            bytes[len] = bits | 0x80;
            len += 1;
        }
        self.write_bytes(&bytes[..len])
    }

    /// Read a value written by [`write_scalar`](Self::write_scalar).
    pub fn read_scalar(&mut self) -> FsResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let mut byte = [0u8; 1];
            self.read_bytes(&mut byte)?;
            if shift > 63 {
                return Err(FsError::Corrupt(format!(
                    "scalar in {:?} stream {} is too long",
                    self.name, self.index
                )));
            }
            value |= u64::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Record `value`, or check it against the recording.
    pub fn check_input(&mut self, value: u64) -> FsResult<()> {
        if self.is_recording() {
            return self.write_scalar(value);
        }
        let recorded = self.read_scalar()?;
        if recorded != value {
            return Err(FsError::InputMismatch {
                recorded,
                replayed: value,
            });
        }
        Ok(())
    }

    /// Record `*value`, or overwrite it with the recorded value.
    pub fn record_or_replay_scalar(&mut self, value: &mut u64) -> FsResult<()> {
        if self.is_recording() {
            self.write_scalar(*value)
        } else {
            *value = self.read_scalar()?;
            Ok(())
        }
    }

    /// Record `data`, or overwrite it with the recorded bytes.
    pub fn record_or_replay_bytes(&mut self, data: &mut [u8]) -> FsResult<()> {
        if self.is_recording() {
            self.write_bytes(data)
        } else {
            self.read_bytes(data)
        }
    }

    // ========================================================================
    // Chunk management
    // ========================================================================

    fn write_chunk(&mut self) -> FsResult<()> {
        let chunk = self.storage.write_chunk(&self.buffer)?;
        self.chunks.push(chunk);
        self.unindexed.push(chunk);
        self.buffer.clear();
        Ok(())
    }

    fn load_next_chunk(&mut self) -> FsResult<()> {
        let chunk = *self
            .chunks
            .get(self.chunk_index)
            .ok_or_else(|| self.end_of_stream())?;
        self.storage.read_chunk(&chunk, &mut self.buffer)?;
        self.chunk_index += 1;
        self.buffer_pos = 0;
        Ok(())
    }

    /// Write out buffered data and hand back the chunks that still need an
    /// index entry.
    pub(crate) fn take_unindexed(&mut self) -> FsResult<Vec<IndexEntry>> {
        if !self.is_recording() {
            return Ok(Vec::new());
        }
        if !self.buffer.is_empty() {
            self.write_chunk()?;
        }
        let (name, name_index) = (self.name, self.index as u32);
        Ok(self
            .unindexed
            .drain(..)
            .map(|chunk| IndexEntry {
                name,
                name_index,
                chunk,
            })
            .collect())
    }

    /// Reposition a reading stream at `position`.
    pub fn seek(&mut self, position: u64) -> FsResult<()> {
        self.require(FileMode::Read)?;
        let available: u64 = self.chunks.iter().map(|c| u64::from(c.decompressed)).sum();
        if position > available {
            return Err(FsError::SeekPastEnd {
                name: self.name,
                index: self.index,
                position,
                available,
            });
        }

        self.buffer.clear();
        self.buffer_pos = 0;
        self.chunk_index = 0;
        self.position = 0;

        let mut start = 0u64;
        for (i, chunk) in self.chunks.iter().enumerate() {
            let end = start + u64::from(chunk.decompressed);
            if position < end {
                self.chunk_index = i;
                self.position = start;
                self.load_next_chunk()?;
                let offset = (position - start) as usize;
                self.buffer_pos = offset;
                self.position = position;
                return Ok(());
            }
            start = end;
        }

        // Exactly at the end of the data.
        self.chunk_index = self.chunks.len();
        self.position = position;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::File;
    use proptest::prelude::*;

    fn recording() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording");
        (dir, path)
    }

    #[test]
    fn scalars_use_seven_bit_groups() {
        let (_dir, path) = recording();
        let file = File::create(&path).unwrap();
        let stream = file.open_stream(StreamName::Main, 0);
        {
            let mut stream = stream.lock();
            stream.write_scalar(0).unwrap();
            stream.write_scalar(127).unwrap();
            stream.write_scalar(128).unwrap();
            stream.write_scalar(300).unwrap();
            assert_eq!(stream.position(), 1 + 1 + 2 + 2);
        }
        file.close().unwrap();

        let file = File::open(&path).unwrap();
        let stream = file.open_stream(StreamName::Main, 0);
        let mut stream = stream.lock();
        let mut raw = [0u8; 6];
        stream.read_bytes(&mut raw).unwrap();
        assert_eq!(raw, [0x00, 0x7f, 0x80, 0x01, 0xac, 0x02]);
        assert!(stream.at_end());
    }

    #[test]
    fn check_input_reports_mismatch() {
        let (_dir, path) = recording();
        let file = File::create(&path).unwrap();
        file.open_stream(StreamName::Event, 1).lock().check_input(4).unwrap();
        file.close().unwrap();

        let file = File::open(&path).unwrap();
        let stream = file.open_stream(StreamName::Event, 1);
        let err = stream.lock().check_input(5).unwrap_err();
        assert!(matches!(
            err,
            FsError::InputMismatch {
                recorded: 4,
                replayed: 5
            }
        ));
    }

    #[test]
    fn running_off_the_end() {
        let (_dir, path) = recording();
        let file = File::create(&path).unwrap();
        file.open_stream(StreamName::Event, 2).lock().write_scalar(9).unwrap();
        file.close().unwrap();

        let file = File::open(&path).unwrap();
        let event = file.open_stream(StreamName::Event, 2);
        let mut event = event.lock();
        assert_eq!(event.read_scalar().unwrap(), 9);
        assert!(event.at_end());
        let err = event.read_scalar().unwrap_err();
        assert!(err.is_end_of_recording());

        let lock = file.open_stream(StreamName::Lock, 7);
        let err = lock.lock().read_scalar().unwrap_err();
        assert!(matches!(err, FsError::EndOfStream { name: StreamName::Lock, index: 7 }));
        assert!(!err.is_end_of_recording());
    }

    #[test]
    fn large_writes_span_chunks() {
        let (_dir, path) = recording();
        let file = File::create(&path).unwrap();
        let data: Vec<u8> = (0..BUFFER_SIZE * 2 + 1000).map(|i| (i % 251) as u8).collect();
        file.open_stream(StreamName::Main, 0).lock().write_bytes(&data).unwrap();
        file.close().unwrap();

        let file = File::open(&path).unwrap();
        let stream = file.open_stream(StreamName::Main, 0);
        let mut stream = stream.lock();
        assert_eq!(stream.chunks.len(), 3);
        let mut out = vec![0u8; data.len()];
        stream.read_bytes(&mut out).unwrap();
        assert_eq!(out, data);
        assert!(stream.at_end());
    }

    #[test]
    fn seek_within_and_at_end() {
        let (_dir, path) = recording();
        let file = File::create(&path).unwrap();
        let data: Vec<u8> = (0..BUFFER_SIZE + 10).map(|i| (i % 13) as u8).collect();
        file.open_stream(StreamName::Main, 0).lock().write_bytes(&data).unwrap();
        file.close().unwrap();

        let file = File::open(&path).unwrap();
        let stream = file.open_stream(StreamName::Main, 0);
        let mut stream = stream.lock();

        stream.seek(BUFFER_SIZE as u64 + 3).unwrap();
        let mut byte = [0u8; 1];
        stream.read_bytes(&mut byte).unwrap();
        assert_eq!(byte[0], data[BUFFER_SIZE + 3]);

        stream.seek(5).unwrap();
        stream.read_bytes(&mut byte).unwrap();
        assert_eq!(byte[0], data[5]);

        stream.seek(data.len() as u64).unwrap();
        assert!(stream.at_end());
        assert!(matches!(
            stream.seek(data.len() as u64 + 1),
            Err(FsError::SeekPastEnd { .. })
        ));
    }

    #[test]
    fn writing_a_reading_stream_fails() {
        let (_dir, path) = recording();
        File::create(&path).unwrap().close().unwrap();
        let file = File::open(&path).unwrap();
        let stream = file.open_stream(StreamName::Main, 0);
        assert!(matches!(
            stream.lock().write_scalar(1),
            Err(FsError::WrongMode { actual: "reading" })
        ));
    }

    proptest! {
        #[test]
        fn scalar_sequences_replay_in_order(values in proptest::collection::vec(any::<u64>(), 0..64)) {
            let (_dir, path) = recording();
            let file = File::create(&path).unwrap();
            {
                let stream = file.open_stream(StreamName::Event, 3);
                let mut stream = stream.lock();
                for value in &values {
                    stream.write_scalar(*value).unwrap();
                }
            }
            file.close().unwrap();

            let file = File::open(&path).unwrap();
            let stream = file.open_stream(StreamName::Event, 3);
            let mut stream = stream.lock();
            for value in &values {
                prop_assert_eq!(stream.read_scalar().unwrap(), *value);
            }
            prop_assert!(stream.at_end());
        }
    }
}
