//! On-disk layout of a recording.
//!
//! ```text
//! offset 0   magic u32 | version u32
//! offset 8   index block #0 (empty)
//!            chunk | chunk | index block | chunk | ... | index block
//!
//! index block: next u64 | count u32 | count x entry
//! entry:       name u32 | name_index u32 | offset u64 | compressed u32 | decompressed u32
//! chunk:       compressed length u32 | LZ4 block
//! ```
//!
//! All integers are little endian. Index blocks form a chain through `next`
//! (0 terminates it), so a reader reconstructs every stream's chunk list
//! without touching chunk payloads.

use crate::error::{FsError, FsResult};
use crate::stream::StreamName;

/// First word of every recording.
pub const MAGIC: u32 = 0xd3e7_f5fa;

/// Current format version.
pub const VERSION: u32 = 1;

/// Bytes in the file header.
pub const HEADER_SIZE: u64 = 8;

/// Offset of index block #0.
pub const FIRST_INDEX_OFFSET: u64 = HEADER_SIZE;

/// Bytes before the entries of an index block.
pub const INDEX_HEADER_SIZE: usize = 12;

/// Bytes per index entry.
pub const INDEX_ENTRY_SIZE: usize = 24;

/// Bytes in a chunk's length prefix.
pub const CHUNK_PREFIX_SIZE: u64 = 4;

/// Location of one compressed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// File offset of the chunk's length prefix
    pub offset: u64,
    /// Compressed payload size
    pub compressed: u32,
    /// Size once decompressed
    pub decompressed: u32,
}

/// One index entry: a chunk and the stream it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Owning stream kind
    pub name: StreamName,
    /// Owning stream's per-name index
    pub name_index: u32,
    /// Chunk location
    pub chunk: ChunkDescriptor,
}

/// Encode the file header.
pub fn encode_header() -> [u8; HEADER_SIZE as usize] {
    let mut bytes = [0u8; HEADER_SIZE as usize];
    bytes[..4].copy_from_slice(&MAGIC.to_le_bytes());
    bytes[4..].copy_from_slice(&VERSION.to_le_bytes());
    bytes
}

/// Validate a file header.
pub fn decode_header(bytes: &[u8; HEADER_SIZE as usize]) -> FsResult<()> {
    let magic = read_u32(&bytes[..4]);
    let version = read_u32(&bytes[4..]);
    if magic != MAGIC || version != VERSION {
        return Err(FsError::BadHeader { magic, version });
    }
    Ok(())
}

/// Encode an index block with a zero `next` field.
pub fn encode_index_block(entries: &[IndexEntry]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(INDEX_HEADER_SIZE + entries.len() * INDEX_ENTRY_SIZE);
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for entry in entries {
        bytes.extend_from_slice(&(entry.name as u32).to_le_bytes());
        bytes.extend_from_slice(&entry.name_index.to_le_bytes());
        bytes.extend_from_slice(&entry.chunk.offset.to_le_bytes());
        bytes.extend_from_slice(&entry.chunk.compressed.to_le_bytes());
        bytes.extend_from_slice(&entry.chunk.decompressed.to_le_bytes());
    }
    bytes
}

/// Decode the `(next, count)` header of an index block.
pub fn decode_index_header(bytes: &[u8; INDEX_HEADER_SIZE]) -> (u64, usize) {
    (read_u64(&bytes[..8]), read_u32(&bytes[8..]) as usize)
}

/// Decode the entries following an index block header.
pub fn decode_index_entries(bytes: &[u8]) -> FsResult<Vec<IndexEntry>> {
    bytes
        .chunks_exact(INDEX_ENTRY_SIZE)
        .map(|raw| {
            let name = read_u32(&raw[0..4]);
            let name = StreamName::from_u32(name)
                .ok_or_else(|| FsError::Corrupt(format!("unknown stream name {}", name)))?;
            Ok(IndexEntry {
                name,
                name_index: read_u32(&raw[4..8]),
                chunk: ChunkDescriptor {
                    offset: read_u64(&raw[8..16]),
                    compressed: read_u32(&raw[16..20]),
                    decompressed: read_u32(&raw[20..24]),
                },
            })
        })
        .collect()
}

pub(crate) fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_rejects_foreign_files() {
        assert!(decode_header(&encode_header()).is_ok());
        let mut bytes = encode_header();
        bytes[0] ^= 1;
        assert!(matches!(decode_header(&bytes), Err(FsError::BadHeader { .. })));
    }

    #[test]
    fn index_block_layout() {
        let entry = IndexEntry {
            name: StreamName::Event,
            name_index: 3,
            chunk: ChunkDescriptor {
                offset: 0x1234,
                compressed: 10,
                decompressed: 40,
            },
        };
        let bytes = encode_index_block(&[entry, entry]);
        assert_eq!(bytes.len(), INDEX_HEADER_SIZE + 2 * INDEX_ENTRY_SIZE);

        let mut header = [0u8; INDEX_HEADER_SIZE];
        header.copy_from_slice(&bytes[..INDEX_HEADER_SIZE]);
        assert_eq!(decode_index_header(&header), (0, 2));
        assert_eq!(
            decode_index_entries(&bytes[INDEX_HEADER_SIZE..]).unwrap(),
            vec![entry, entry]
        );
    }
}
