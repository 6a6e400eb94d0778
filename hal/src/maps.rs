//! `/proc/self/maps` parsing.

use std::fs;

use crate::error::{HalError, HalResult};

bitflags::bitflags! {
    /// Permission column of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u8 {
        /// `r`
        const READ = 1 << 0;
        /// `w`
        const WRITE = 1 << 1;
        /// `x`
        const EXEC = 1 << 2;
        /// `s` (shared rather than private)
        const SHARED = 1 << 3;
    }
}

/// One line of the process memory map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRegion {
    /// First byte of the mapping
    pub start: usize,
    /// One past the last byte
    pub end: usize,
    /// Access rights
    pub flags: MapFlags,
    /// Backing path or pseudo-name (`[stack]`, `[heap]`), if any
    pub path: Option<String>,
}

impl MappedRegion {
    /// Mapping size in bytes.
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Private writable mapping that could hold tracked data.
    pub fn is_private_writable(&self) -> bool {
        self.flags.contains(MapFlags::WRITE) && !self.flags.contains(MapFlags::SHARED)
    }
}

fn parse_line(line: &str) -> HalResult<MappedRegion> {
    let malformed = || HalError::MalformedMap(line.to_owned());
    let mut fields = line.split_whitespace();

    let range = fields.next().ok_or_else(malformed)?;
    let perms = fields.next().ok_or_else(malformed)?;
    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let start = usize::from_str_radix(start, 16).map_err(|_| malformed())?;
    let end = usize::from_str_radix(end, 16).map_err(|_| malformed())?;

    let mut flags = MapFlags::empty();
    for (byte, flag) in perms.bytes().zip([MapFlags::READ, MapFlags::WRITE, MapFlags::EXEC]) {
        if byte != b'-' {
            flags |= flag;
        }
    }
    if perms.as_bytes().get(3) == Some(&b's') {
        flags |= MapFlags::SHARED;
    }

    // offset, device, inode
    let path = fields.nth(3).map(str::to_owned);
    Ok(MappedRegion {
        start,
        end,
        flags,
        path,
    })
}

/// Parse the text of a maps file.
pub fn parse_maps(text: &str) -> HalResult<Vec<MappedRegion>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

/// Read and parse the calling process's memory map.
pub fn read_self_maps() -> HalResult<Vec<MappedRegion>> {
    parse_maps(&fs::read_to_string("/proc/self/maps")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d4c8a00000-55d4c8a21000 r--p 00000000 08:01 1835021                    /usr/bin/cat
55d4c8c21000-55d4c8c22000 rw-p 00021000 08:01 1835021                    /usr/bin/cat
7f1b2c000000-7f1b2c021000 rw-p 00000000 00:00 0
7f1b2d400000-7f1b2d600000 r-xp 00000000 08:01 2621449                    /usr/lib/libc.so.6
7f1b2d800000-7f1b2d801000 rw-s 00000000 00:05 12                         /dev/shm/x
7ffd1c9f0000-7ffd1ca11000 rw-p 00000000 00:00 0                          [stack]
";

    #[test]
    fn parses_ranges_flags_and_paths() {
        let regions = parse_maps(SAMPLE).unwrap();
        assert_eq!(regions.len(), 6);
        assert_eq!(regions[0].start, 0x55d4c8a00000);
        assert_eq!(regions[0].flags, MapFlags::READ);
        assert_eq!(regions[2].path, None);
        assert_eq!(regions[2].size(), 0x21000);
        assert!(regions[3].flags.contains(MapFlags::EXEC));
        assert!(!regions[4].is_private_writable());
        assert_eq!(regions[5].path.as_deref(), Some("[stack]"));
        assert!(regions[5].is_private_writable());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_maps("not a map line").is_err());
    }

    #[test]
    fn reads_own_map() {
        let regions = read_self_maps().unwrap();
        let probe = &regions as *const _ as usize;
        assert!(regions.iter().any(|r| r.start <= probe && probe < r.end));
    }
}
