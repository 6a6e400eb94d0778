//! Dirty page bookkeeping usable from the fault handler.
//!
//! Nothing here allocates from the Rust heap on the fault path: page copies
//! come from a pool of anonymous mappings threaded onto an intrusive free
//! list, and the active dirty set is an open-addressing table whose storage
//! is grown ahead of time, outside the handler.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use rewind_hal::memory::{map_anonymous, PAGE_SIZE};
use rewind_hal::SpinLock;

use crate::error::MemoryResult;

// ============================================================================
// Page copies
// ============================================================================

/// One page of untracked memory holding the pre-write contents of a tracked
/// page. Owned by exactly one dirty set or worklist entry at a time.
#[derive(Debug)]
pub struct PageCopy(NonNull<u8>);

// SAFETY: a page copy is uniquely owned and only touched by its owner
unsafe impl Send for PageCopy {}

impl PageCopy {
    /// Give up ownership, returning the page.
    #[inline]
    pub fn into_raw(self) -> NonNull<u8> {
        self.0
    }

    /// Take back ownership of a page returned by [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    /// `page` must come from `into_raw` and not be owned elsewhere.
    #[inline]
    pub unsafe fn from_raw(page: NonNull<u8>) -> Self {
        Self(page)
    }

    /// Start of the page.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Contents of the page.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the copy is a live, uniquely owned pool page
        unsafe { core::slice::from_raw_parts(self.0.as_ptr(), PAGE_SIZE) }
    }

    /// Fill this copy from the tracked page at `page`.
    ///
    /// # Safety
    /// `page` must be a readable, page-aligned address.
    #[inline]
    pub unsafe fn fill_from(&mut self, page: usize) {
        // SAFETY: caller guarantees the source page is readable; the copy is ours
        unsafe { core::ptr::copy_nonoverlapping(page as *const u8, self.0.as_ptr(), PAGE_SIZE) };
    }

    /// Write this copy back over the tracked page at `page`.
    ///
    /// # Safety
    /// `page` must be a writable, page-aligned address no reference points into.
    #[inline]
    pub unsafe fn write_to(&self, page: usize) {
        // SAFETY: caller guarantees the destination page is writable
        unsafe { core::ptr::copy_nonoverlapping(self.0.as_ptr(), page as *mut u8, PAGE_SIZE) };
    }
}

/// Pages mapped at once when the pool runs dry.
pub const POOL_CHUNK_PAGES: usize = 64;

#[derive(Debug)]
struct PoolState {
    /// Head of the free list, 0 if empty
    free: usize,
    /// Copies handed out
    in_use: usize,
    /// Pages mapped for the pool
    mapped: usize,
}

/// Source of [`PageCopy`] pages, tracking memory pressure.
///
/// Pressure starts when the number of live copies reaches the high mark and
/// ends once it falls to the low mark. Snapshot workers write copies to disk
/// only while under pressure.
#[derive(Debug)]
pub struct PageCopyPool {
    state: SpinLock<PoolState>,
    pressure: AtomicBool,
    high_mark: usize,
    low_mark: usize,
}

impl PageCopyPool {
    /// Pool with the given pressure marks, in pages.
    pub const fn new(high_mark: usize, low_mark: usize) -> Self {
        Self {
            state: SpinLock::new(PoolState {
                free: 0,
                in_use: 0,
                mapped: 0,
            }),
            pressure: AtomicBool::new(false),
            high_mark,
            low_mark,
        }
    }

    /// Take a page. The flag is true when this allocation started a period
    /// of memory pressure.
    pub fn allocate(&self) -> MemoryResult<(PageCopy, bool)> {
        let mut state = self.state.lock();
        if state.free == 0 {
            let chunk = map_anonymous(POOL_CHUNK_PAGES * PAGE_SIZE)?.as_ptr() as usize;
            for i in (0..POOL_CHUNK_PAGES).rev() {
                let page = chunk + i * PAGE_SIZE;
                // SAFETY: freshly mapped, writable, unused page
                unsafe { (page as *mut usize).write(state.free) };
                state.free = page;
            }
            state.mapped += POOL_CHUNK_PAGES;
        }

        let page = state.free;
        // SAFETY: free list entries are pool pages whose first word links the list
        state.free = unsafe { (page as *const usize).read() };
        state.in_use += 1;

        let started = state.in_use >= self.high_mark && !self.pressure.load(Ordering::Relaxed);
        if started {
            self.pressure.store(true, Ordering::Release);
        }
        // SAFETY: pool pages are never null
        let copy = PageCopy(unsafe { NonNull::new_unchecked(page as *mut u8) });
        Ok((copy, started))
    }

    /// Return a page.
    pub fn free(&self, copy: PageCopy) {
        let mut state = self.state.lock();
        let page = copy.as_ptr() as usize;
        // SAFETY: the copy was handed out by this pool and is no longer used
        unsafe { (page as *mut usize).write(state.free) };
        state.free = page;
        state.in_use -= 1;
        if state.in_use <= self.low_mark {
            self.pressure.store(false, Ordering::Release);
        }
    }

    /// Whether workers should move copies to disk.
    #[inline]
    pub fn under_pressure(&self) -> bool {
        self.pressure.load(Ordering::Acquire)
    }

    /// Copies currently handed out.
    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    /// Pages mapped for the pool.
    pub fn mapped(&self) -> usize {
        self.state.lock().mapped
    }
}

// ============================================================================
// Active dirty set
// ============================================================================

/// A tracked page written since the last snapshot.
#[derive(Debug)]
pub struct DirtyPage {
    /// Page base address
    pub base: usize,
    /// Contents at the last snapshot
    pub original: PageCopy,
    /// Whether the page is executable
    pub executable: bool,
}

/// Smallest table size.
pub const MIN_SLOTS: usize = 64;

/// Open-addressing table of dirty pages keyed by page address.
#[derive(Debug)]
pub struct DirtyPageTable {
    slots: Vec<Option<DirtyPage>>,
    len: usize,
}

impl DirtyPageTable {
    /// Table with [`MIN_SLOTS`] slots.
    pub fn new() -> Self {
        Self {
            slots: Self::storage(MIN_SLOTS),
            len: 0,
        }
    }

    /// Slot count that keeps the load factor at or below one half for
    /// `pages` tracked pages.
    pub fn slots_for(pages: usize) -> usize {
        pages.saturating_mul(2).next_power_of_two().max(MIN_SLOTS)
    }

    /// Empty storage with `slots` slots. Allocates; never call from the
    /// fault handler.
    pub fn storage(slots: usize) -> Vec<Option<DirtyPage>> {
        let mut storage = Vec::with_capacity(slots);
        storage.resize_with(slots, || None);
        storage
    }

    #[inline]
    fn home(&self, base: usize) -> usize {
        let hash = (base / PAGE_SIZE).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        (hash >> 16) & (self.slots.len() - 1)
    }

    fn find(&self, base: usize) -> Result<usize, usize> {
        let mask = self.slots.len() - 1;
        let mut slot = self.home(base);
        loop {
            match &self.slots[slot] {
                Some(page) if page.base == base => return Ok(slot),
                Some(_) => slot = (slot + 1) & mask,
                None => return Err(slot),
            }
        }
    }

    /// Whether `base` is dirty.
    #[inline]
    pub fn contains(&self, base: usize) -> bool {
        self.find(base).is_ok()
    }

    /// The dirty page at `base`.
    pub fn get(&self, base: usize) -> Option<&DirtyPage> {
        self.find(base).ok().and_then(|slot| self.slots[slot].as_ref())
    }

    /// Add a page. Hands it back if the table is too full to take it.
    pub fn insert(&mut self, page: DirtyPage) -> Result<(), DirtyPage> {
        if (self.len + 1) * 2 > self.slots.len() {
            return Err(page);
        }
        match self.find(page.base) {
            Ok(_) => Err(page),
            Err(slot) => {
                self.slots[slot] = Some(page);
                self.len += 1;
                Ok(())
            }
        }
    }

    /// Move every entry into `fresh` (which must be empty and larger) and
    /// return the old storage so it can be dropped outside any lock.
    pub fn rehash(&mut self, fresh: Vec<Option<DirtyPage>>) -> Vec<Option<DirtyPage>> {
        debug_assert!(fresh.len().is_power_of_two() && fresh.len() >= self.slots.len());
        let mut old = core::mem::replace(&mut self.slots, fresh);
        for page in old.iter_mut().filter_map(Option::take) {
            let slot = self.find(page.base).unwrap_or_else(|slot| slot);
            self.slots[slot] = Some(page);
        }
        old
    }

    /// Remove every entry, ordered by address.
    pub fn drain(&mut self) -> Vec<DirtyPage> {
        let mut pages: Vec<DirtyPage> = self.slots.iter_mut().filter_map(Option::take).collect();
        pages.sort_unstable_by_key(|page| page.base);
        self.len = 0;
        pages
    }

    /// Number of dirty pages.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no page is dirty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl Default for DirtyPageTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_and_tracks_pressure() {
        let pool = PageCopyPool::new(3, 1);
        let (a, started) = pool.allocate().unwrap();
        assert!(!started);
        let (b, _) = pool.allocate().unwrap();
        let (c, started) = pool.allocate().unwrap();
        assert!(started);
        assert!(pool.under_pressure());
        assert_eq!(pool.mapped(), POOL_CHUNK_PAGES);

        pool.free(c);
        assert!(pool.under_pressure());
        let reused = b.as_ptr();
        pool.free(b);
        assert!(!pool.under_pressure());

        // Last in, first out.
        let (d, _) = pool.allocate().unwrap();
        assert_eq!(d.as_ptr(), reused);
        assert_eq!(pool.in_use(), 2);
        pool.free(a);
        pool.free(d);
        assert_eq!(pool.in_use(), 0);
    }

    fn page(pool: &PageCopyPool, base: usize) -> DirtyPage {
        DirtyPage {
            base,
            original: pool.allocate().unwrap().0,
            executable: false,
        }
    }

    #[test]
    fn table_insert_lookup_drain() {
        let pool = PageCopyPool::new(usize::MAX, 0);
        let mut table = DirtyPageTable::new();
        for i in (0..20).rev() {
            table.insert(page(&pool, 0x7000_0000 + i * PAGE_SIZE)).unwrap();
        }
        assert_eq!(table.len(), 20);
        assert!(table.contains(0x7000_0000 + 7 * PAGE_SIZE));
        assert!(!table.contains(0x7000_0000 + 20 * PAGE_SIZE));

        let duplicate = page(&pool, 0x7000_0000);
        let duplicate = table.insert(duplicate).unwrap_err();
        pool.free(duplicate.original);

        let drained = table.drain();
        assert!(table.is_empty());
        assert!(drained.windows(2).all(|w| w[0].base < w[1].base));
        for page in drained {
            pool.free(page.original);
        }
    }

    #[test]
    fn table_refuses_to_fill_and_grows_by_rehash() {
        let pool = PageCopyPool::new(usize::MAX, 0);
        let mut table = DirtyPageTable::new();
        for i in 0..MIN_SLOTS / 2 {
            table.insert(page(&pool, i * PAGE_SIZE)).unwrap();
        }
        let rejected = table.insert(page(&pool, 0x100 * PAGE_SIZE)).unwrap_err();

        let old = table.rehash(DirtyPageTable::storage(DirtyPageTable::slots_for(100)));
        drop(old);
        assert_eq!(table.capacity(), 256);
        table.insert(rejected).unwrap();
        for i in 0..MIN_SLOTS / 2 {
            assert!(table.contains(i * PAGE_SIZE));
        }
        for page in table.drain() {
            pool.free(page.original);
        }
    }
}
