//! Copy-on-write snapshots of tracked memory.
//!
//! After the first snapshot every tracked page is write-protected. The first
//! write to a page faults into [`MemorySnapshots::handle_fault`], which saves
//! the page's contents into a [`PageCopy`] and unprotects it. Taking a diff
//! snapshot hands the saved copies to the snapshot workers and protects the
//! pages again; restoring copies them back.
//!
//! ```text
//!   recorded:    #0 (full) ─── #1 (diff) ─── #2 (diff) ─── now
//!                         pages@#0       pages@#1     active dirty set
//!
//!   restore_to_active()        now → #2
//!   restore_to_last_diff(2)    #2  → #1
//! ```

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::thread;

use rewind_hal::fault::install_fault_handler;
use rewind_hal::maps::{read_self_maps, MapFlags, MappedRegion};
use rewind_hal::memory::{
    map_anonymous, memory_intersects, page_base, protect, protect_quiet, round_up, unmap,
    Protection, PAGE_SIZE,
};
use rewind_hal::pipe::Pipe;
use rewind_hal::stack::{current_thread_stack, StackBounds};
use rewind_hal::{Rewindable, RwSpinLock, SnapshotId, SpinLock};

use crate::dirty::{DirtyPage, DirtyPageTable, PageCopy, PageCopyPool};
use crate::error::{MemoryError, MemoryResult};
use crate::free::FreeRegionSet;
use crate::kind::{Backing, MemoryKind};
use crate::region::{RegionRegistry, TrackedRegion};
use crate::worker::{self, DirtyPageSet, SnapshotCondition, Worker, WorklistPage};

// ============================================================================
// Configuration
// ============================================================================

/// Number of snapshot workers.
pub const DEFAULT_WORKERS: usize = 8;

/// Page copies kept in memory before workers start writing them out.
pub const DEFAULT_HIGH_MARK_PAGES: usize = 300 * 1024 * 1024 / PAGE_SIZE;

/// Page copies at which workers stop writing them out.
pub const DEFAULT_LOW_MARK_PAGES: usize = 280 * 1024 * 1024 / PAGE_SIZE;

/// Recent fault addresses kept for diagnostics.
pub const FAULT_HISTORY: usize = 50;

/// Memory snapshot settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryConfig {
    /// Snapshot worker count
    pub workers: usize,
    /// Pressure high mark, in page copies
    pub high_mark_pages: usize,
    /// Pressure low mark, in page copies
    pub low_mark_pages: usize,
    /// Prefix of worker side files
    pub side_file_prefix: String,
}

impl MemoryConfig {
    /// Defaults with side files under `side_file_prefix`.
    pub fn new(side_file_prefix: impl Into<String>) -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            high_mark_pages: DEFAULT_HIGH_MARK_PAGES,
            low_mark_pages: DEFAULT_LOW_MARK_PAGES,
            side_file_prefix: side_file_prefix.into(),
        }
    }

    /// Use `workers` snapshot workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the pressure marks, in page copies.
    pub fn with_marks(mut self, high: usize, low: usize) -> Self {
        self.high_mark_pages = high;
        self.low_mark_pages = low.min(high);
        self
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Tracked regions
    pub tracked_regions: usize,
    /// Tracked pages
    pub tracked_pages: usize,
    /// Pages dirtied since the last snapshot
    pub dirty_pages: usize,
    /// Page copies held in memory
    pub page_copies: usize,
    /// Free tracked bytes
    pub free_tracked_bytes: usize,
    /// Whether workers are writing copies out
    pub under_pressure: bool,
}

#[derive(Debug)]
struct FaultRing {
    addrs: [usize; FAULT_HISTORY],
    next: usize,
    total: usize,
}

#[derive(Debug, Clone)]
struct SavedAllocator {
    free: FreeRegionSet,
    regions: usize,
}

// ============================================================================
// MemorySnapshots
// ============================================================================

/// Tracked memory, its snapshots, and the allocator serving it.
#[derive(Debug)]
pub struct MemorySnapshots {
    config: MemoryConfig,
    regions: RwSpinLock<RegionRegistry>,
    tracked_free: SpinLock<FreeRegionSet>,
    untracked_free: SpinLock<FreeRegionSet>,
    dirty: SpinLock<DirtyPageTable>,
    pub(crate) pool: PageCopyPool,
    pub(crate) workers: Vec<Worker>,
    pub(crate) coordinator: Pipe,
    pub(crate) should_restore: SnapshotCondition,
    pub(crate) should_idle: SnapshotCondition,
    restore_target: AtomicUsize,
    taken: AtomicBool,
    changes_allowed: AtomicBool,
    saved: SpinLock<BTreeMap<SnapshotId, SavedAllocator>>,
    stacks: SpinLock<Vec<StackBounds>>,
    faults: SpinLock<FaultRing>,
    failure: SpinLock<Option<MemoryError>>,
}

/// Instance receiving write faults.
static ACTIVE: AtomicPtr<MemorySnapshots> = AtomicPtr::new(core::ptr::null_mut());

fn dispatch_fault(addr: usize) -> bool {
    let active = ACTIVE.load(Ordering::Acquire);
    if active.is_null() {
        return false;
    }
    // SAFETY: only `&'static MemorySnapshots` values are stored in ACTIVE
    let memory = unsafe { &*active };
    if memory.handle_fault(addr) {
        return true;
    }

    // Leave memory writable so a debugger can inspect the process.
    let tracked = memory.is_tracked(addr);
    memory.unprotect_all();
    if tracked {
        // Retrying would silently write a tracked page nobody saved.
        std::process::abort();
    }
    false
}

impl MemorySnapshots {
    /// Create the snapshot state. Workers start with the first snapshot.
    pub fn new(config: MemoryConfig) -> MemoryResult<Self> {
        let workers = (0..config.workers.max(1))
            .map(|_| Worker::new())
            .collect::<MemoryResult<Vec<_>>>()?;
        Ok(Self {
            pool: PageCopyPool::new(config.high_mark_pages, config.low_mark_pages),
            config,
            regions: RwSpinLock::new(RegionRegistry::new()),
            tracked_free: SpinLock::new(FreeRegionSet::new()),
            untracked_free: SpinLock::new(FreeRegionSet::new()),
            dirty: SpinLock::new(DirtyPageTable::new()),
            workers,
            coordinator: Pipe::new()?,
            should_restore: SnapshotCondition::new(),
            should_idle: SnapshotCondition::new(),
            restore_target: AtomicUsize::new(0),
            taken: AtomicBool::new(false),
            changes_allowed: AtomicBool::new(true),
            saved: SpinLock::new(BTreeMap::new()),
            stacks: SpinLock::new(Vec::new()),
            faults: SpinLock::new(FaultRing {
                addrs: [0; FAULT_HISTORY],
                next: 0,
                total: 0,
            }),
            failure: SpinLock::new(None),
        })
    }

    /// Settings in use.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Whether the first snapshot has been taken.
    #[inline]
    pub fn has_taken_snapshot(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }

    /// Whether tracked memory may currently be dirtied.
    #[inline]
    pub fn memory_changes_allowed(&self) -> bool {
        self.changes_allowed.load(Ordering::Acquire)
    }

    fn set_memory_changes_allowed(&self, allowed: bool) {
        self.changes_allowed.store(allowed, Ordering::Release);
    }

    pub(crate) fn restore_target(&self) -> SnapshotId {
        self.restore_target.load(Ordering::Acquire)
    }

    pub(crate) fn latch_worker_failure(&self, worker: usize, err: MemoryError) {
        log::error!("snapshot worker {}: {}", worker, err);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(MemoryError::Worker {
                worker,
                source: Box::new(err),
            });
        }
    }

    fn check_workers(&self) -> MemoryResult<()> {
        match self.failure.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn notify_workers(&self) {
        for worker in &self.workers {
            worker.pipe.notify();
        }
    }

    /// Exclude a thread's stack from tracking.
    pub fn note_thread_stack(&self, stack: StackBounds) {
        self.stacks.lock().push(stack);
    }

    // ========================================================================
    // Regions
    // ========================================================================

    /// Whether `addr` lies in tracked memory.
    pub fn is_tracked(&self, addr: usize) -> bool {
        self.regions.read().lookup(addr).is_some()
    }

    /// Whether the page containing `addr` was written since the last snapshot.
    pub fn is_dirty(&self, addr: usize) -> bool {
        self.dirty.lock().contains(page_base(addr))
    }

    /// Grow the dirty table so it can hold every tracked page. Never called
    /// from the fault handler.
    fn reserve_dirty(&self, pages: usize) {
        let wanted = DirtyPageTable::slots_for(pages);
        if self.dirty.lock().capacity() >= wanted {
            return;
        }
        let fresh = DirtyPageTable::storage(wanted);
        let old = {
            let mut dirty = self.dirty.lock();
            if dirty.capacity() >= wanted {
                return;
            }
            dirty.rehash(fresh)
        };
        drop(old);
    }

    fn add_tracked(&self, region: TrackedRegion) -> MemoryResult<()> {
        let pages = self.regions.read().pages() + region.size / PAGE_SIZE;
        self.reserve_dirty(pages);
        if self.has_taken_snapshot() {
            protect(region.base, region.size, Protection::tracked(region.executable))?;
        }
        self.regions.write().insert(region);
        Ok(())
    }

    /// Track existing memory. After the first snapshot the range is
    /// write-protected immediately.
    pub fn register_region(&self, base: usize, size: usize, executable: bool) -> MemoryResult<()> {
        if base % PAGE_SIZE != 0 || size == 0 {
            return Err(MemoryError::BadRequest("tracked regions must be page aligned"));
        }
        let size = round_up(size, PAGE_SIZE);
        {
            let regions = self.regions.read();
            if regions
                .in_order()
                .iter()
                .any(|r| memory_intersects(r.base, r.size, base, size))
            {
                return Err(MemoryError::Untrackable {
                    base,
                    size,
                    reason: "overlaps a tracked region",
                });
            }
        }
        if self
            .stacks
            .lock()
            .iter()
            .any(|s| memory_intersects(s.base, s.size(), base, size))
        {
            return Err(MemoryError::Untrackable {
                base,
                size,
                reason: "overlaps a thread stack",
            });
        }
        self.add_tracked(TrackedRegion {
            base,
            size,
            executable,
        })
    }

    /// Verify that caller-managed memory is tracked and in use.
    pub fn check_fixed_memory(&self, base: usize, size: usize) -> MemoryResult<()> {
        if !self.has_taken_snapshot() {
            return Ok(());
        }
        if !self.regions.read().contains(base, size) {
            return Err(MemoryError::FixedMemory {
                base,
                size,
                problem: "not tracked",
            });
        }
        if self.tracked_free.lock().intersects(base, size) {
            return Err(MemoryError::FixedMemory {
                base,
                size,
                problem: "currently free",
            });
        }
        Ok(())
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate `size` bytes of `kind` memory, zeroed.
    pub fn allocate(&self, size: usize, kind: MemoryKind) -> MemoryResult<NonNull<u8>> {
        self.allocate_at(None, size, kind)
    }

    /// Allocate, preferring the address `hint` when it is free.
    pub fn allocate_at(
        &self,
        hint: Option<usize>,
        size: usize,
        kind: MemoryKind,
    ) -> MemoryResult<NonNull<u8>> {
        if size == 0 {
            return Err(MemoryError::BadRequest("empty allocation"));
        }
        let size = round_up(size, PAGE_SIZE);

        if kind.policy().backing == Backing::PagePool {
            if size != PAGE_SIZE {
                return Err(MemoryError::BadRequest("page copies are a single page"));
            }
            let (copy, started) = self.pool.allocate()?;
            if started {
                self.notify_workers();
            }
            return Ok(copy.into_raw());
        }

        if self.has_taken_snapshot() {
            let free = if kind.is_tracked() {
                &self.tracked_free
            } else {
                &self.untracked_free
            };
            let found = free.lock().extract(hint.map(page_base), size);
            if let Some(base) = found {
                // Outside the lock: zeroing tracked memory faults.
                // SAFETY: the range was free, so nothing else uses it
                unsafe { core::ptr::write_bytes(base as *mut u8, 0, size) };
                // SAFETY: free regions never start at address zero
                return Ok(unsafe { NonNull::new_unchecked(base as *mut u8) });
            }
        }

        let memory = map_anonymous(size)?;
        if kind.is_tracked() {
            let region = TrackedRegion {
                base: memory.as_ptr() as usize,
                size,
                executable: false,
            };
            if let Err(err) = self.add_tracked(region) {
                // SAFETY: the mapping was never handed out
                let _ = unsafe { unmap(region.base, size) };
                return Err(err);
            }
        }
        Ok(memory)
    }

    /// Release memory from [`allocate`](Self::allocate). Before the first
    /// snapshot it is unmapped; afterwards it joins a free region set.
    ///
    /// # Safety
    /// No live reference may point into the range.
    pub unsafe fn deallocate(&self, addr: usize, size: usize, kind: MemoryKind) -> MemoryResult<()> {
        let base = page_base(addr);
        let size = round_up(size + (addr - base), PAGE_SIZE);
        if base == 0 || size == 0 {
            return Ok(());
        }

        if kind.policy().backing == Backing::PagePool {
            let page = NonNull::new(base as *mut u8).ok_or(MemoryError::BadRequest("null page"))?;
            // SAFETY: caller returns a page obtained from `allocate`
            self.pool.free(unsafe { PageCopy::from_raw(page) });
            return Ok(());
        }

        if !self.has_taken_snapshot() {
            if kind.is_tracked() {
                let mut regions = self.regions.write();
                match regions.lookup(base) {
                    Some(region) if region.base == base && region.size == size => {
                        regions.remove(base);
                    }
                    _ => {
                        return Err(MemoryError::BadRequest(
                            "tracked memory must be released whole before the first snapshot",
                        ))
                    }
                }
            }
            // SAFETY: caller guarantees the range is unused
            unsafe { unmap(base, size)? };
            return Ok(());
        }

        if kind.is_tracked() {
            if !self.regions.read().covers(base, size) {
                log::warn!("ignoring release of untracked range {:#x}+{:#x}", base, size);
                return Ok(());
            }
            self.tracked_free.lock().insert(base, size);
        } else {
            self.untracked_free.lock().insert(base, size);
        }
        Ok(())
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Handle a write fault at `addr`. Runs in signal context.
    pub fn handle_fault(&self, addr: usize) -> bool {
        {
            let mut ring = self.faults.lock();
            let slot = ring.next;
            ring.addrs[slot] = addr;
            ring.next = (slot + 1) % FAULT_HISTORY;
            ring.total += 1;
        }

        if !self.memory_changes_allowed() {
            return false;
        }

        let base = page_base(addr);
        let mut dirty = self.dirty.lock();

        // Several threads may fault on the same page before it is unprotected.
        if dirty.contains(base) {
            return true;
        }

        let Some(region) = self.regions.read().lookup(base) else {
            return false;
        };

        let Ok((mut original, started)) = self.pool.allocate() else {
            return false;
        };
        // SAFETY: tracked pages stay readable while protected
        unsafe { original.fill_from(base) };
        if let Err(page) = dirty.insert(DirtyPage {
            base,
            original,
            executable: region.executable,
        }) {
            self.pool.free(page.original);
            return false;
        }
        if started {
            self.notify_workers();
        }
        protect_quiet(base, PAGE_SIZE, Protection::writable(region.executable))
    }

    /// Most recent fault addresses, newest first.
    pub fn recent_faults(&self) -> Vec<usize> {
        let ring = self.faults.lock();
        let count = ring.total.min(FAULT_HISTORY);
        (1..=count)
            .map(|back| ring.addrs[(ring.next + FAULT_HISTORY - back) % FAULT_HISTORY])
            .collect()
    }

    /// Touch every byte of a range so it is dirtied now rather than later.
    ///
    /// # Safety
    /// The range must be mapped and writable once unprotected.
    pub unsafe fn notify_dirty_memory(&self, addr: usize, size: usize) {
        for offset in 0..size {
            let byte = (addr + offset) as *mut u8;
            // SAFETY: caller guarantees the range is mapped
            unsafe { byte.write_volatile(byte.read_volatile()) };
        }
    }

    /// Make all tracked memory writable after an unrecoverable failure.
    pub fn unprotect_all(&self) {
        let regions = self.regions.read();
        for region in regions.in_order() {
            protect_quiet(region.base, region.size, Protection::writable(region.executable));
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Validate every tracked region against the process map, start the
    /// workers, install the fault handler and protect all tracked memory.
    pub fn take_first(&'static self) -> MemoryResult<()> {
        if self.has_taken_snapshot() {
            return Err(MemoryError::AlreadyTaken);
        }

        let maps = read_self_maps()?;
        let mut stacks = self.stacks.lock().clone();
        stacks.push(current_thread_stack()?);
        {
            let mut regions = self.regions.write();
            for i in 0..regions.len() {
                let region = regions.in_order()[i];
                if stacks
                    .iter()
                    .any(|s| memory_intersects(s.base, s.size(), region.base, region.size))
                {
                    return Err(MemoryError::Untrackable {
                        base: region.base,
                        size: region.size,
                        reason: "overlaps a thread stack",
                    });
                }
                let executable = mapping_is_executable(&maps, &region)?;
                regions.update(i, executable);
            }
        }

        for index in 0..self.workers.len() {
            thread::Builder::new()
                .name(format!("rewind-snapshot-{}", index))
                .spawn(move || worker::run(self, index))
                .map_err(MemoryError::Spawn)?;
        }

        ACTIVE.store(self as *const Self as *mut Self, Ordering::Release);
        install_fault_handler(dispatch_fault)?;

        self.set_memory_changes_allowed(false);
        let result = {
            let regions = self.regions.read();
            regions.in_order().iter().try_for_each(|region| {
                protect(region.base, region.size, Protection::tracked(region.executable))
            })
        };
        self.taken.store(true, Ordering::Release);
        self.set_memory_changes_allowed(true);
        result?;

        let stats = self.stats();
        log::info!(
            "first memory snapshot: {} regions, {} pages, {} workers",
            stats.tracked_regions,
            stats.tracked_pages,
            self.workers.len()
        );
        Ok(())
    }

    /// Record the pages dirtied since the previous recorded snapshot as the
    /// diff of `snapshot`, and protect them again.
    pub fn take_diff(&self, snapshot: SnapshotId) -> MemoryResult<()> {
        if !self.has_taken_snapshot() {
            return Err(MemoryError::NotTaken);
        }
        self.check_workers()?;

        self.set_memory_changes_allowed(false);
        self.should_idle.activate_begin(&self.workers, &self.coordinator);

        for worker in &self.workers {
            worker.worklist.lock().push_back(DirtyPageSet::new(snapshot));
        }

        let pages = self.dirty.lock().drain();
        let count = pages.len();
        let mut unchanged = 0usize;
        let mut result = Ok(());
        for page in pages {
            // SAFETY: the page is tracked and currently writable
            let live = unsafe { core::slice::from_raw_parts(page.base as *const u8, PAGE_SIZE) };
            if live == page.original.bytes() {
                unchanged += 1;
                self.pool.free(page.original);
            } else {
                let worker = &self.workers[(page.base / PAGE_SIZE) % self.workers.len()];
                if let Some(set) = worker.worklist.lock().back_mut() {
                    set.pages.push(WorklistPage {
                        base: page.base,
                        original: Some(page.original),
                        executable: page.executable,
                    });
                }
            }
            if let Err(err) = protect(page.base, PAGE_SIZE, Protection::tracked(page.executable)) {
                result = Err(err.into());
            }
        }

        self.should_idle.activate_end(&self.workers, &self.coordinator);
        self.set_memory_changes_allowed(true);

        log::debug!(
            "diff snapshot {}: {} dirty pages, {} unchanged",
            snapshot,
            count,
            unchanged
        );
        result
    }

    /// Revert every page dirtied since the last recorded snapshot (or the
    /// last restore). A second call without intervening writes does nothing.
    pub fn restore_to_active(&self) -> MemoryResult<()> {
        self.set_memory_changes_allowed(false);
        let pages = self.dirty.lock().drain();
        let count = pages.len();
        let mut result = Ok(());
        for page in pages {
            // SAFETY: dirty pages are writable and every recorded thread is idle
            unsafe { page.original.write_to(page.base) };
            self.pool.free(page.original);
            if let Err(err) = protect(page.base, PAGE_SIZE, Protection::tracked(page.executable)) {
                result = Err(err.into());
            }
        }
        self.set_memory_changes_allowed(true);
        log::debug!("restored {} dirty pages", count);
        result
    }

    /// Revert memory from recorded snapshot `snapshot` to the recorded
    /// snapshot before it. The active dirty set must be empty.
    pub fn restore_to_last_diff(&self, snapshot: SnapshotId) -> MemoryResult<()> {
        if !self.has_taken_snapshot() {
            return Err(MemoryError::NotTaken);
        }
        if !self.dirty.lock().is_empty() {
            return Err(MemoryError::BadRequest("dirty pages remain; restore the active snapshot first"));
        }
        self.check_workers()?;

        self.set_memory_changes_allowed(false);
        self.restore_target.store(snapshot, Ordering::Release);
        self.should_restore.activate_begin(&self.workers, &self.coordinator);
        self.should_restore.activate_end(&self.workers, &self.coordinator);
        self.set_memory_changes_allowed(true);

        log::debug!("restored diff snapshot {}", snapshot);
        self.check_workers()
    }

    /// Current counters.
    pub fn stats(&self) -> MemoryStats {
        let (tracked_regions, tracked_pages) = {
            let regions = self.regions.read();
            (regions.len(), regions.pages())
        };
        MemoryStats {
            tracked_regions,
            tracked_pages,
            dirty_pages: self.dirty.lock().len(),
            page_copies: self.pool.in_use(),
            free_tracked_bytes: self.tracked_free.lock().bytes(),
            under_pressure: self.pool.under_pressure(),
        }
    }

    /// Snapshots each worker still holds sets for, per worker.
    pub fn pending_snapshots(&self) -> Vec<Vec<SnapshotId>> {
        self.workers.iter().map(Worker::pending_snapshots).collect()
    }
}

/// Check that `region` is fully covered by private writable mappings and
/// report whether any of them is executable.
fn mapping_is_executable(maps: &[MappedRegion], region: &TrackedRegion) -> MemoryResult<bool> {
    let mut cursor = region.base;
    let mut executable = false;
    for map in maps {
        if cursor >= region.end() {
            break;
        }
        if map.end <= cursor {
            continue;
        }
        if map.start > cursor {
            break;
        }
        if !map.is_private_writable() {
            return Err(MemoryError::Untrackable {
                base: region.base,
                size: region.size,
                reason: "not privately writable",
            });
        }
        executable |= map.flags.contains(MapFlags::EXEC);
        cursor = map.end;
    }
    if cursor < region.end() {
        return Err(MemoryError::Untrackable {
            base: region.base,
            size: region.size,
            reason: "not mapped",
        });
    }
    Ok(executable)
}

impl Rewindable for MemorySnapshots {
    type Error = MemoryError;

    fn save_state(&self, snapshot: SnapshotId) {
        let state = SavedAllocator {
            free: self.tracked_free.lock().clone(),
            regions: self.regions.read().len(),
        };
        self.saved.lock().insert(snapshot, state);
    }

    /// Everything allocated after `snapshot` becomes free again.
    fn restore_state(&self, snapshot: SnapshotId) -> MemoryResult<()> {
        let state = {
            let mut saved = self.saved.lock();
            saved.retain(|id, _| *id <= snapshot);
            saved.get(&snapshot).cloned()
        }
        .ok_or(MemoryError::NoSavedState(snapshot))?;

        let mut free = state.free;
        {
            let regions = self.regions.read();
            for region in regions.in_order().iter().skip(state.regions) {
                free.insert(region.base, region.size);
            }
        }
        *self.tracked_free.lock() = free;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// The fault handler is process-wide.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn snapshots(dir: &tempfile::TempDir, config: impl FnOnce(MemoryConfig) -> MemoryConfig) -> &'static MemorySnapshots {
        let prefix = dir.path().join("memory").display().to_string();
        let config = config(MemoryConfig::new(prefix).with_workers(2));
        Box::leak(Box::new(MemorySnapshots::new(config).unwrap()))
    }

    fn fill(addr: NonNull<u8>, len: usize, value: u8) {
        // SAFETY: test buffers are tracked allocations of at least `len` bytes
        unsafe { core::ptr::write_bytes(addr.as_ptr(), value, len) };
    }

    fn all(addr: NonNull<u8>, len: usize, value: u8) -> bool {
        // SAFETY: see `fill`
        unsafe { core::slice::from_raw_parts(addr.as_ptr(), len) }
            .iter()
            .all(|&b| b == value)
    }

    #[test]
    fn restore_one_page_through_a_diff() {
        let _serial = SERIAL.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = snapshots(&dir, |c| c);

        let buffer = memory.allocate(PAGE_SIZE, MemoryKind::Tracked).unwrap();
        fill(buffer, PAGE_SIZE, 0xaa);
        memory.take_first().unwrap();
        memory.save_state(0);

        fill(buffer, PAGE_SIZE, 0xbb);
        assert!(memory.is_dirty(buffer.as_ptr() as usize));
        memory.take_diff(1).unwrap();
        memory.save_state(1);
        assert!(!memory.is_dirty(buffer.as_ptr() as usize));

        memory.restore_to_active().unwrap();
        memory.restore_to_last_diff(1).unwrap();
        memory.restore_state(0).unwrap();
        assert!(all(buffer, PAGE_SIZE, 0xaa));
        assert_eq!(memory.stats().page_copies, 0);
    }

    #[test]
    fn restoring_the_active_snapshot_twice() {
        let _serial = SERIAL.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = snapshots(&dir, |c| c);

        let buffer = memory.allocate(3 * PAGE_SIZE, MemoryKind::Tracked).unwrap();
        fill(buffer, 3 * PAGE_SIZE, 1);
        memory.take_first().unwrap();

        fill(buffer, PAGE_SIZE + 10, 2);
        assert_eq!(memory.stats().dirty_pages, 2);
        memory.restore_to_active().unwrap();
        assert!(all(buffer, 3 * PAGE_SIZE, 1));
        assert_eq!(memory.stats().dirty_pages, 0);

        memory.restore_to_active().unwrap();
        assert!(all(buffer, 3 * PAGE_SIZE, 1));
        assert_eq!(memory.stats().page_copies, 0);
    }

    #[test]
    fn diffs_restore_byte_for_byte_from_disk() {
        let _serial = SERIAL.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        // Any page copy puts the workers under pressure.
        let memory = snapshots(&dir, |c| c.with_marks(1, 0));

        let pages = 8;
        let buffer = memory.allocate(pages * PAGE_SIZE, MemoryKind::Tracked).unwrap();
        // SAFETY: freshly allocated tracked buffer
        let bytes = unsafe { core::slice::from_raw_parts_mut(buffer.as_ptr(), pages * PAGE_SIZE) };
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i % 253) as u8;
        }
        let at_first: Vec<u8> = bytes.to_vec();
        memory.take_first().unwrap();
        memory.save_state(0);

        for i in (0..bytes.len()).step_by(PAGE_SIZE / 2 + 7) {
            bytes[i] = bytes[i].wrapping_add(1);
        }
        let at_second: Vec<u8> = bytes.to_vec();
        memory.take_diff(1).unwrap();
        memory.save_state(1);

        for i in (0..bytes.len()).step_by(PAGE_SIZE + 3) {
            bytes[i] ^= 0xff;
        }
        memory.take_diff(2).unwrap();
        memory.save_state(2);

        // Give the workers a chance to move pages to disk.
        for _ in 0..200 {
            if memory.pending_snapshots().iter().all(Vec::is_empty) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        bytes[5] = 99;
        memory.restore_to_active().unwrap();
        memory.restore_to_last_diff(2).unwrap();
        assert_eq!(&bytes[..], &at_second[..]);
        memory.restore_to_last_diff(1).unwrap();
        assert_eq!(&bytes[..], &at_first[..]);
        memory.restore_state(0).unwrap();
    }

    #[test]
    fn allocations_after_a_snapshot_are_freed_by_rewind() {
        let _serial = SERIAL.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = snapshots(&dir, |c| c);

        let live = memory.allocate(2 * PAGE_SIZE, MemoryKind::Tracked).unwrap();
        memory.take_first().unwrap();
        memory.save_state(0);

        let later = memory.allocate(4 * PAGE_SIZE, MemoryKind::Tracked).unwrap();
        fill(later, 4 * PAGE_SIZE, 7);
        let later = later.as_ptr() as usize;
        assert!(memory.is_tracked(later));

        memory.restore_to_active().unwrap();
        memory.restore_state(0).unwrap();
        assert_eq!(memory.stats().free_tracked_bytes, 4 * PAGE_SIZE);

        let again = memory.allocate(4 * PAGE_SIZE, MemoryKind::Tracked).unwrap();
        assert_eq!(again.as_ptr() as usize, later);
        assert!(all(again, 4 * PAGE_SIZE, 0));
        let live = live.as_ptr() as usize;
        assert!(!memory_intersects(live, 2 * PAGE_SIZE, later, 4 * PAGE_SIZE));
        assert!(memory.check_fixed_memory(live, 2 * PAGE_SIZE).is_ok());
    }

    #[test]
    fn released_memory_is_recycled_not_unmapped() {
        let _serial = SERIAL.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = snapshots(&dir, |c| c);

        let before = memory.allocate(PAGE_SIZE, MemoryKind::Generic).unwrap();
        // SAFETY: never used
        unsafe { memory.deallocate(before.as_ptr() as usize, PAGE_SIZE, MemoryKind::Generic) }.unwrap();

        memory.take_first().unwrap();
        let tracked = memory.allocate(2 * PAGE_SIZE, MemoryKind::Tracked).unwrap();
        let base = tracked.as_ptr() as usize;
        // SAFETY: nothing references the buffer any more
        unsafe { memory.deallocate(base, 2 * PAGE_SIZE, MemoryKind::Tracked) }.unwrap();
        assert!(matches!(
            memory.check_fixed_memory(base, PAGE_SIZE),
            Err(MemoryError::FixedMemory { problem: "currently free", .. })
        ));
        let reused = memory.allocate_at(Some(base + PAGE_SIZE), PAGE_SIZE, MemoryKind::Tracked).unwrap();
        assert_eq!(reused.as_ptr() as usize, base + PAGE_SIZE);

        // Zeroing the reused page dirtied it, which took a copy of its own.
        let copies = memory.stats().page_copies;
        let copy = memory.allocate(PAGE_SIZE, MemoryKind::PageCopy).unwrap();
        assert_eq!(memory.stats().page_copies, copies + 1);
        // SAFETY: the page came from `allocate`
        unsafe { memory.deallocate(copy.as_ptr() as usize, PAGE_SIZE, MemoryKind::PageCopy) }.unwrap();
        assert_eq!(memory.stats().page_copies, copies);
    }

    #[test]
    fn registration_refuses_stacks_and_overlaps() {
        let _serial = SERIAL.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = snapshots(&dir, |c| c);

        let stack = current_thread_stack().unwrap();
        memory.note_thread_stack(stack);
        let base = page_base(stack.end - 1);
        assert!(matches!(
            memory.register_region(base, PAGE_SIZE, false),
            Err(MemoryError::Untrackable { reason: "overlaps a thread stack", .. })
        ));

        let buffer = map_anonymous(2 * PAGE_SIZE).unwrap().as_ptr() as usize;
        memory.register_region(buffer, 2 * PAGE_SIZE, false).unwrap();
        assert!(matches!(
            memory.register_region(buffer + PAGE_SIZE, PAGE_SIZE, false),
            Err(MemoryError::Untrackable { reason: "overlaps a tracked region", .. })
        ));
        assert!(matches!(
            memory.register_region(buffer + 1, PAGE_SIZE, false),
            Err(MemoryError::BadRequest(_))
        ));
    }

    #[test]
    fn mapping_coverage() {
        let maps = vec![
            MappedRegion {
                start: 0x1000,
                end: 0x3000,
                flags: MapFlags::READ | MapFlags::WRITE,
                path: None,
            },
            MappedRegion {
                start: 0x3000,
                end: 0x4000,
                flags: MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC,
                path: None,
            },
            MappedRegion {
                start: 0x5000,
                end: 0x6000,
                flags: MapFlags::READ | MapFlags::WRITE | MapFlags::SHARED,
                path: None,
            },
        ];
        let region = |base, size| TrackedRegion {
            base,
            size,
            executable: false,
        };
        assert!(!mapping_is_executable(&maps, &region(0x1000, 0x1000)).unwrap());
        assert!(mapping_is_executable(&maps, &region(0x2000, 0x2000)).unwrap());
        assert!(mapping_is_executable(&maps, &region(0x3000, 0x2000)).is_err());
        assert!(mapping_is_executable(&maps, &region(0x5000, 0x1000)).is_err());
    }

    #[test]
    fn fault_history_is_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let memory = snapshots(&dir, |c| c);
        for addr in 1..=(FAULT_HISTORY + 3) {
            // Untracked addresses are refused without touching memory.
            assert!(!memory.handle_fault(addr * PAGE_SIZE));
        }
        let recent = memory.recent_faults();
        assert_eq!(recent.len(), FAULT_HISTORY);
        assert_eq!(recent[0], (FAULT_HISTORY + 3) * PAGE_SIZE);
        assert_eq!(recent[FAULT_HISTORY - 1], 4 * PAGE_SIZE);
    }
}
