//! Size-indexed sets of unused, already-mapped memory.
//!
//! Memory released after the first snapshot is never unmapped. It is kept
//! here so a later allocation can reuse it, and so rewinding to a point where
//! it was live never needs to map or protect anything again.

use std::collections::{BTreeMap, BTreeSet};

use rewind_hal::memory::{memory_intersects, PAGE_SIZE};

/// Free ranges ordered by `(size, base)` for best fit, and by base for
/// hints and merging. Adjacent ranges are always merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeRegionSet {
    by_size: BTreeSet<(usize, usize)>,
    by_base: BTreeMap<usize, usize>,
}

impl FreeRegionSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the page-aligned range `[base, base + size)`, merging it with
    /// the free ranges right before and after it.
    pub fn insert(&mut self, mut base: usize, mut size: usize) {
        debug_assert!(base % PAGE_SIZE == 0 && size % PAGE_SIZE == 0 && size > 0);
        debug_assert!(!self.intersects(base, size), "double free of {:#x}", base);

        if let Some((&before, &len)) = self.by_base.range(..base).next_back() {
            if before + len == base {
                self.take(before, len);
                base = before;
                size += len;
            }
        }
        if let Some(&len) = self.by_base.get(&(base + size)) {
            self.take(base + size, len);
            size += len;
        }
        self.put(base, size);
    }

    fn put(&mut self, base: usize, size: usize) {
        self.by_size.insert((size, base));
        self.by_base.insert(base, size);
    }

    fn take(&mut self, base: usize, size: usize) {
        self.by_size.remove(&(size, base));
        self.by_base.remove(&base);
    }

    /// Remove `size` bytes from the set. With a hint, the region containing
    /// `[hint, hint + size)` is split around it; otherwise (or if no region
    /// contains the hint) the smallest region that fits is used, lowest
    /// address first, and its tail stays free. The caller zeroes the
    /// returned memory.
    pub fn extract(&mut self, hint: Option<usize>, size: usize) -> Option<usize> {
        if let Some(addr) = hint {
            let found = self
                .by_base
                .range(..=addr)
                .next_back()
                .map(|(&base, &len)| (base, len))
                .filter(|&(base, len)| base + len >= addr + size);
            if let Some((base, len)) = found {
                self.take(base, len);
                if base < addr {
                    self.put(base, addr - base);
                }
                if base + len > addr + size {
                    self.put(addr + size, base + len - (addr + size));
                }
                return Some(addr);
            }
        }

        let (len, base) = self.by_size.range((size, 0)..).next().copied()?;
        self.take(base, len);
        if len > size {
            self.put(base + size, len - size);
        }
        Some(base)
    }

    /// Whether any free range overlaps `[base, base + size)`.
    pub fn intersects(&self, base: usize, size: usize) -> bool {
        // Ranges are disjoint: only the last one starting before the end
        // can reach into the query.
        self.by_base
            .range(..base + size)
            .next_back()
            .is_some_and(|(&start, &len)| memory_intersects(start, len, base, size))
    }

    /// Number of free ranges.
    pub fn len(&self) -> usize {
        self.by_base.len()
    }

    /// Whether nothing is free.
    pub fn is_empty(&self) -> bool {
        self.by_base.is_empty()
    }

    /// Total free bytes.
    pub fn bytes(&self) -> usize {
        self.by_base.values().sum()
    }

    /// Free ranges as `(base, size)`, ordered by size.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.by_size.iter().map(|&(len, base)| (base, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const P: usize = PAGE_SIZE;

    #[test]
    fn best_fit_keeps_the_tail() {
        let mut set = FreeRegionSet::new();
        set.insert(0x100000, 4 * P);
        set.insert(0x200000, 2 * P);

        assert_eq!(set.extract(None, P), Some(0x200000));
        assert!(set.intersects(0x201000, P));
        assert_eq!(set.extract(None, 3 * P), Some(0x100000));
        assert_eq!(set.bytes(), 2 * P);
        assert_eq!(set.extract(None, 2 * P), None);
    }

    #[test]
    fn hint_splits_around_the_request() {
        let mut set = FreeRegionSet::new();
        set.insert(0x100000, 8 * P);

        assert_eq!(set.extract(Some(0x100000 + 3 * P), 2 * P), Some(0x103000));
        assert!(!set.intersects(0x103000, 2 * P));
        assert!(set.intersects(0x100000, P));
        assert!(set.intersects(0x105000, P));
        assert_eq!(set.len(), 2);

        // A hint nothing contains falls back to best fit; the two
        // leftovers are the same size, so the lower one goes first.
        assert_eq!(set.extract(Some(0x900000), P), Some(0x100000));
        assert_eq!(set.extract(Some(0x106000), P), Some(0x106000));
        assert!(set.intersects(0x105000, P) && set.intersects(0x107000, P));
    }

    #[test]
    fn released_neighbours_merge() {
        let mut set = FreeRegionSet::new();
        set.insert(0x100000, P);
        set.insert(0x102000, P);
        assert_eq!(set.len(), 2);
        assert_eq!(set.extract(None, 3 * P), None);

        // Filling the gap joins all three.
        set.insert(0x101000, P);
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![(0x100000, 3 * P)]);
        assert_eq!(set.extract(None, 3 * P), Some(0x100000));
        assert!(set.is_empty());

        // Repeated allocate/free cycles do not fragment.
        set.insert(0x200000, 8 * P);
        for _ in 0..16 {
            let a = set.extract(None, P).unwrap();
            let b = set.extract(None, 2 * P).unwrap();
            set.insert(a, P);
            set.insert(b, 2 * P);
        }
        assert_eq!(set.len(), 1);
        assert_eq!(set.extract(None, 8 * P), Some(0x200000));
    }

    proptest! {
        #[test]
        fn extracted_ranges_never_overlap(
            sizes in proptest::collection::vec(1usize..6, 1..12),
            requests in proptest::collection::vec((1usize..4, any::<bool>(), 0usize..40), 1..24),
        ) {
            let mut set = FreeRegionSet::new();
            let mut free = Vec::new();
            let mut next = 0x1000_0000usize;
            for pages in sizes {
                set.insert(next, pages * P);
                free.push((next, pages * P));
                next += (pages + 1) * P;
            }
            let total = set.bytes();

            let mut taken: Vec<(usize, usize)> = Vec::new();
            for (pages, hinted, slot) in requests {
                let size = pages * P;
                let hint = hinted.then(|| 0x1000_0000 + slot * P);
                if let Some(base) = set.extract(hint, size) {
                    prop_assert!(free.iter().any(|&(b, s)| base >= b && base + size <= b + s));
                    prop_assert!(taken.iter().all(|&(b, s)| !memory_intersects(b, s, base, size)));
                    prop_assert!(!set.intersects(base, size));
                    taken.push((base, size));
                }
            }
            let used: usize = taken.iter().map(|&(_, s)| s).sum();
            prop_assert_eq!(set.bytes() + used, total);
        }
    }
}
