//! Registry of tracked memory regions.

use std::collections::BTreeMap;

use rewind_hal::memory::memory_contains;

/// A range of tracked memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedRegion {
    /// Page-aligned base
    pub base: usize,
    /// Page-aligned size
    pub size: usize,
    /// Whether the pages are mapped executable
    pub executable: bool,
}

impl TrackedRegion {
    /// End address (exclusive).
    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Whether `[addr, addr + len)` lies inside this region.
    #[inline]
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        memory_contains(self.base, self.size, addr, len)
    }
}

/// Tracked regions indexed by address and kept in allocation order.
///
/// Regions are never removed once the first snapshot exists, so the
/// allocation order tells which regions were added after any snapshot.
#[derive(Debug, Default)]
pub struct RegionRegistry {
    by_base: BTreeMap<usize, TrackedRegion>,
    by_order: Vec<TrackedRegion>,
    pages: usize,
}

impl RegionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region.
    pub fn insert(&mut self, region: TrackedRegion) {
        self.by_base.insert(region.base, region);
        self.by_order.push(region);
        self.pages += region.size / rewind_hal::memory::PAGE_SIZE;
    }

    /// Remove the region starting at `base`. Only valid before the first
    /// snapshot.
    pub fn remove(&mut self, base: usize) -> Option<TrackedRegion> {
        let region = self.by_base.remove(&base)?;
        self.by_order.retain(|r| r.base != base);
        self.pages -= region.size / rewind_hal::memory::PAGE_SIZE;
        Some(region)
    }

    /// Region containing `addr`, if any.
    pub fn lookup(&self, addr: usize) -> Option<TrackedRegion> {
        self.by_base
            .range(..=addr)
            .next_back()
            .map(|(_, region)| *region)
            .filter(|region| region.contains(addr, 1))
    }

    /// Whether `[addr, addr + len)` is entirely inside one region.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        self.lookup(addr).is_some_and(|region| region.contains(addr, len))
    }

    /// Whether every byte of `[addr, addr + len)` is in some region. Free
    /// ranges merge across adjacent regions, so an allocation may span
    /// several.
    pub fn covers(&self, addr: usize, len: usize) -> bool {
        let end = addr + len;
        let mut next = addr;
        while next < end {
            match self.lookup(next) {
                Some(region) => next = region.end(),
                None => return false,
            }
        }
        true
    }

    /// Regions in allocation order.
    pub fn in_order(&self) -> &[TrackedRegion] {
        &self.by_order
    }

    /// Mutable access for updating region attributes in place.
    pub(crate) fn update(&mut self, index: usize, executable: bool) {
        let region = &mut self.by_order[index];
        region.executable = executable;
        let base = region.base;
        if let Some(entry) = self.by_base.get_mut(&base) {
            entry.executable = executable;
        }
    }

    /// Number of regions.
    pub fn len(&self) -> usize {
        self.by_order.len()
    }

    /// Whether no region is registered.
    pub fn is_empty(&self) -> bool {
        self.by_order.is_empty()
    }

    /// Total tracked pages.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind_hal::memory::PAGE_SIZE;

    fn region(base: usize, pages: usize) -> TrackedRegion {
        TrackedRegion {
            base,
            size: pages * PAGE_SIZE,
            executable: false,
        }
    }

    #[test]
    fn lookup_by_address() {
        let mut registry = RegionRegistry::new();
        registry.insert(region(0x10000, 2));
        registry.insert(region(0x40000, 1));

        assert_eq!(registry.lookup(0x10000).map(|r| r.base), Some(0x10000));
        assert_eq!(registry.lookup(0x11fff).map(|r| r.base), Some(0x10000));
        assert_eq!(registry.lookup(0x12000), None);
        assert_eq!(registry.lookup(0x40010).map(|r| r.base), Some(0x40000));
        assert_eq!(registry.lookup(0x0fff), None);
        assert!(registry.contains(0x10800, PAGE_SIZE));
        assert!(!registry.contains(0x11800, PAGE_SIZE));
        assert_eq!(registry.pages(), 3);

        registry.insert(region(0x12000, 1));
        assert!(!registry.contains(0x11000, 2 * PAGE_SIZE));
        assert!(registry.covers(0x11000, 2 * PAGE_SIZE));
        assert!(!registry.covers(0x12000, 2 * PAGE_SIZE));
    }

    #[test]
    fn allocation_order_is_kept() {
        let mut registry = RegionRegistry::new();
        registry.insert(region(0x50000, 1));
        registry.insert(region(0x20000, 1));
        registry.insert(region(0x30000, 1));
        assert!(registry.remove(0x20000).is_some());
        let order: Vec<_> = registry.in_order().iter().map(|r| r.base).collect();
        assert_eq!(order, vec![0x50000, 0x30000]);
        assert_eq!(registry.len(), 2);
    }
}
