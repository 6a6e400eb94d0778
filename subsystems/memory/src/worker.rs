//! Snapshot workers.
//!
//! Each worker owns the dirty pages whose page number hashes to its index,
//! so the same page always lands on the same worker across snapshots. A
//! worker keeps one [`DirtyPageSet`] per recorded diff snapshot, oldest
//! first. Under memory pressure it moves the oldest set to its side file
//! `"{prefix}_{snapshot * workers + index}"` one page at a time: the page
//! index first, then every page's contents in index order.
//!
//! The coordinator drives workers through two [`SnapshotCondition`]s: one to
//! hold them idle while their worklists change, one to make each of them
//! restore its share of the most recent diff.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::collections::VecDeque;

use rewind_hal::memory::{protect, Protection, PAGE_SIZE};
use rewind_hal::pipe::Pipe;
use rewind_hal::{SnapshotId, SpinLock};
use rewindfs::{File, FileMode, FsError, StreamHandle, StreamName};

use crate::dirty::PageCopy;
use crate::error::{MemoryError, MemoryResult};
use crate::snapshot::MemorySnapshots;

// ============================================================================
// Worklists
// ============================================================================

/// A page of a diff snapshot.
#[derive(Debug)]
pub struct WorklistPage {
    /// Page base address
    pub base: usize,
    /// Contents at the previous recorded snapshot, `None` once on disk
    pub original: Option<PageCopy>,
    /// Whether the page is executable
    pub executable: bool,
}

/// One worker's share of a diff snapshot.
#[derive(Debug)]
pub struct DirtyPageSet {
    /// Recorded snapshot the diff belongs to
    pub snapshot: SnapshotId,
    /// Pages in address order
    pub pages: Vec<WorklistPage>,
}

impl DirtyPageSet {
    /// Empty set for `snapshot`.
    pub fn new(snapshot: SnapshotId) -> Self {
        Self {
            snapshot,
            pages: Vec::new(),
        }
    }
}

/// A snapshot worker's shared state.
#[derive(Debug)]
pub struct Worker {
    pub(crate) pipe: Pipe,
    pub(crate) worklist: SpinLock<VecDeque<DirtyPageSet>>,
}

impl Worker {
    pub(crate) fn new() -> MemoryResult<Self> {
        Ok(Self {
            pipe: Pipe::new()?,
            worklist: SpinLock::new(VecDeque::new()),
        })
    }

    /// Snapshots with pages still held in memory or partially written.
    pub fn pending_snapshots(&self) -> Vec<SnapshotId> {
        self.worklist.lock().iter().map(|set| set.snapshot).collect()
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// A request every worker acknowledges before the coordinator proceeds.
#[derive(Debug, Default)]
pub struct SnapshotCondition {
    active: AtomicBool,
    count: AtomicUsize,
}

impl SnapshotCondition {
    /// Inactive condition.
    pub const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            count: AtomicUsize::new(0),
        }
    }

    /// Whether workers should act on this condition.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Activate and wait until every worker is parked on the condition.
    pub(crate) fn activate_begin(&self, workers: &[Worker], coordinator: &Pipe) {
        debug_assert!(!self.is_active());
        self.active.store(true, Ordering::SeqCst);
        for worker in workers {
            worker.pipe.notify();
        }
        while self.count.load(Ordering::SeqCst) != workers.len() {
            coordinator.wait();
        }
    }

    /// Deactivate and wait until every worker has left the condition.
    pub(crate) fn activate_end(&self, workers: &[Worker], coordinator: &Pipe) {
        debug_assert!(self.is_active());
        self.active.store(false, Ordering::SeqCst);
        for worker in workers {
            worker.pipe.notify();
        }
        while self.count.load(Ordering::SeqCst) != 0 {
            coordinator.wait();
        }
    }

    /// Called by a worker that saw the condition active.
    pub(crate) fn wait_until_inactive(&self, worker: &Worker, total: usize, coordinator: &Pipe) {
        if self.count.fetch_add(1, Ordering::SeqCst) + 1 == total {
            coordinator.notify();
        }
        while self.is_active() {
            worker.pipe.wait();
        }
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            coordinator.notify();
        }
    }
}

// ============================================================================
// Worker thread
// ============================================================================

/// The side file a worker is currently writing.
struct PageWriter {
    file: File,
    stream: StreamHandle,
    /// Next page of the oldest set to write
    next: usize,
}

fn side_file_index(memory: &MemorySnapshots, snapshot: SnapshotId, index: usize) -> usize {
    snapshot * memory.workers.len() + index
}

/// Body of worker thread `index`.
pub(crate) fn run(memory: &'static MemorySnapshots, index: usize) {
    let worker = &memory.workers[index];
    let total = memory.workers.len();
    let mut writer: Option<PageWriter> = None;
    let mut failed = false;

    log::debug!("snapshot worker {} started", index);

    loop {
        if memory.should_restore.is_active() {
            // A partially written last set is finished from disk by the
            // restore itself; an older set keeps its writer.
            if writer.as_ref().is_some_and(|w| w.next > 0) && worker.worklist.lock().len() == 1 {
                if let Some(open) = writer.take() {
                    if let Err(err) = open.file.close() {
                        memory.latch_worker_failure(index, err.into());
                    }
                }
            }
            if let Err(err) = restore_last_diff(memory, index) {
                memory.latch_worker_failure(index, err);
            }
            memory
                .should_restore
                .wait_until_inactive(worker, total, &memory.coordinator);
        }

        if memory.should_idle.is_active() {
            memory
                .should_idle
                .wait_until_inactive(worker, total, &memory.coordinator);
        }

        // The pressure flag is only a heuristic; reading it unlocked is fine.
        let has_work = !worker.worklist.lock().is_empty();
        if failed || !has_work || !memory.pool.under_pressure() {
            worker.pipe.wait();
            continue;
        }

        if let Err(err) = write_next_page(memory, index, &mut writer) {
            memory.latch_worker_failure(index, err);
            writer = None;
            failed = true;
        }
    }
}

fn write_page_index(stream: &StreamHandle, set: &DirtyPageSet) -> Result<(), FsError> {
    let mut stream = stream.lock();
    stream.write_scalar(set.pages.len() as u64)?;
    for page in &set.pages {
        stream.write_scalar(page.base as u64)?;
        stream.write_scalar(u64::from(page.executable))?;
    }
    Ok(())
}

fn read_page_index(stream: &StreamHandle, snapshot: SnapshotId) -> Result<DirtyPageSet, FsError> {
    let mut stream = stream.lock();
    let count = stream.read_scalar()? as usize;
    let mut set = DirtyPageSet::new(snapshot);
    set.pages.reserve(count);
    for _ in 0..count {
        let base = stream.read_scalar()? as usize;
        let executable = stream.read_scalar()? != 0;
        set.pages.push(WorklistPage {
            base,
            original: None,
            executable,
        });
    }
    Ok(set)
}

/// Move the next page of the oldest set to disk.
fn write_next_page(
    memory: &MemorySnapshots,
    index: usize,
    writer: &mut Option<PageWriter>,
) -> MemoryResult<()> {
    let worker = &memory.workers[index];

    if writer.is_none() {
        let worklist = worker.worklist.lock();
        let Some(set) = worklist.front() else {
            return Ok(());
        };
        let file = File::open_indexed(
            &memory.config().side_file_prefix,
            side_file_index(memory, set.snapshot, index),
            FileMode::Write,
        )?;
        let stream = file.open_stream(StreamName::Main, 0);
        write_page_index(&stream, set)?;
        log::trace!(
            "worker {}: writing {} pages of snapshot {}",
            index,
            set.pages.len(),
            set.snapshot
        );
        *writer = Some(PageWriter {
            file,
            stream,
            next: 0,
        });
    }

    let Some(open) = writer.as_mut() else {
        return Ok(());
    };

    let copy = {
        let mut worklist = worker.worklist.lock();
        worklist
            .front_mut()
            .and_then(|set| set.pages.get_mut(open.next))
            .and_then(|page| page.original.take())
    };
    if let Some(copy) = copy {
        open.stream.lock().write_bytes(copy.bytes())?;
        memory.pool.free(copy);
        open.next += 1;
    }

    let finished = worker
        .worklist
        .lock()
        .front()
        .map_or(true, |set| open.next >= set.pages.len());
    if finished {
        if let Some(done) = writer.take() {
            done.file.close()?;
        }
        worker.worklist.lock().pop_front();
    }
    Ok(())
}

/// Restore this worker's pages of the most recent diff snapshot.
fn restore_last_diff(memory: &MemorySnapshots, index: usize) -> MemoryResult<()> {
    let worker = &memory.workers[index];
    let snapshot = memory.restore_target();
    let mut worklist = worker.worklist.lock();

    // Either the whole set is on disk and gone from the worklist, or a prefix
    // of its pages was written before the restore began.
    let use_file = worklist
        .back()
        .map_or(true, |set| set.pages.first().is_some_and(|p| p.original.is_none()));

    let mut stream = None;
    let mut file_set = None;
    if use_file {
        let file = File::open_indexed(
            &memory.config().side_file_prefix,
            side_file_index(memory, snapshot, index),
            FileMode::Read,
        )?;
        let handle = file.open_stream(StreamName::Main, 0);
        file_set = Some(read_page_index(&handle, snapshot)?);
        stream = Some((file, handle));
    }

    let set = match worklist.pop_back() {
        Some(set) => set,
        None => file_set.take().ok_or(MemoryError::NotTaken)?,
    };
    if set.snapshot != snapshot {
        return Err(FsError::Corrupt(format!(
            "worker {} holds snapshot {} while restoring {}",
            index, set.snapshot, snapshot
        ))
        .into());
    }
    drop(worklist);

    for page in set.pages {
        protect(page.base, PAGE_SIZE, Protection::writable(page.executable))?;
        match page.original {
            Some(copy) => {
                // SAFETY: the page was just made writable and all threads are idle
                unsafe { copy.write_to(page.base) };
                memory.pool.free(copy);
            }
            None => {
                let Some((_, handle)) = stream.as_ref() else {
                    return Err(FsError::Corrupt(format!(
                        "page {:#x} of snapshot {} is neither in memory nor on disk",
                        page.base, snapshot
                    ))
                    .into());
                };
                // SAFETY: the page is writable and nothing references it while
                // every recorded thread is idle
                let contents =
                    unsafe { core::slice::from_raw_parts_mut(page.base as *mut u8, PAGE_SIZE) };
                handle.lock().read_bytes(contents)?;
            }
        }
        protect(page.base, PAGE_SIZE, Protection::tracked(page.executable))?;
    }
    Ok(())
}
