//! Leaked thread, lock and assertion tables for unit tests.

use std::sync::Arc;

use rewind_execution::{Locks, ThreadConfig, Threads};
use rewindfs::File;

use crate::assert::Assertions;
pub(crate) use crate::engine::leak;

pub(crate) struct Fixture {
    pub(crate) threads: &'static Threads,
    pub(crate) locks: &'static Locks,
    pub(crate) asserts: &'static Assertions,
}

impl Fixture {
    /// Tables whose main thread is the calling test thread. Records to
    /// `dir/name` the first time and replays it afterwards.
    pub(crate) fn new(dir: &tempfile::TempDir, name: &str) -> Self {
        let path = dir.path().join(name);
        let file = if path.exists() {
            File::open(&path).unwrap()
        } else {
            File::create(&path).unwrap()
        };
        let stacks = dir.path().join(format!("{}-stack", name)).display().to_string();
        let config = ThreadConfig::new(stacks)
            .with_recorded_threads(3)
            .with_call_event_helpers(0);
        let threads = leak(Threads::new(config, Arc::new(file)).unwrap());
        threads.initialize().unwrap();
        let locks = leak(Locks::new(threads).unwrap());
        let asserts = leak(Assertions::new(threads));
        Self {
            threads,
            locks,
            asserts,
        }
    }

    /// Make everything recorded so far readable.
    pub(crate) fn finish(&self) {
        self.threads.file().flush().unwrap();
    }
}
