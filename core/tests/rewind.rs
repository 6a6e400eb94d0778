//! Recording, rewinding and replaying past the end of the recording, in a
//! single process. The engine is a process singleton, so everything runs in
//! one test; progress across rewinds is kept in statics, which live outside
//! tracked memory.

use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rewind_core::{EngineConfig, EngineHooks, Mode};
use rewind_hal::memory::PAGE_SIZE;
use rewind_memory::MemoryKind;

static PASS: AtomicUsize = AtomicUsize::new(0);
static ENDS: AtomicUsize = AtomicUsize::new(0);
static SAVED: AtomicUsize = AtomicUsize::new(0);

struct CountingHooks;

impl EngineHooks for CountingHooks {
    fn on_save_recording(&self, _path: &Path) {
        SAVED.fetch_add(1, Ordering::SeqCst);
    }

    fn on_end_of_recording(&self) {
        ENDS.fetch_add(1, Ordering::SeqCst);
    }
}

fn page(buffer: NonNull<u8>) -> &'static mut [u8] {
    // SAFETY: the buffer is a tracked page that is never freed
    unsafe { std::slice::from_raw_parts_mut(buffer.as_ptr(), PAGE_SIZE) }
}

#[test]
fn rewinds_to_one_snapshot_repeatedly_and_replays_until_the_end() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig::new(Mode::Record(dir.path().join("recording")))
        .with_temp_dir(dir.path())
        .with_snapshot_interval(Duration::ZERO)
        .with_recorded_threads(2)
        .with_call_event_helpers(0)
        .with_snapshot_workers(2);
    let engine = rewind_core::initialize(config, Box::new(CountingHooks))
        .unwrap()
        .unwrap();
    assert!(engine.is_recording());

    let buffer = engine.memory().allocate(PAGE_SIZE, MemoryKind::Tracked).unwrap();
    page(buffer).fill(0xAA);

    if engine.take_snapshot(false, false) {
        assert_eq!(PASS.load(Ordering::SeqCst), 0);
        page(buffer).fill(0xBB);
        assert_eq!(engine.record_replay_value(7), 7);
        assert_eq!(engine.record_replay_value(8), 8);
        assert!(engine.take_snapshot(false, false));
        assert_eq!(engine.last_recorded_snapshot(), Some(1));
        PASS.store(1, Ordering::SeqCst);
        engine.restore_snapshot_and_resume(0);
    }

    match PASS.load(Ordering::SeqCst) {
        1 => {
            // Back at snapshot 0, now replaying.
            assert!(page(buffer).iter().all(|byte| *byte == 0xAA));
            assert!(!engine.is_recording());
            assert_eq!(SAVED.load(Ordering::SeqCst), 1);
            assert_eq!(engine.last_recorded_snapshot(), Some(0));
            assert_eq!(engine.last_snapshot(), Some(0));
            assert!(!engine.threads().main_thread().pass_through());

            PASS.store(2, Ordering::SeqCst);
            assert_eq!(engine.record_replay_value(70), 7);
            assert_eq!(engine.record_replay_value(80), 8);
            // Nothing more was recorded: this rewinds to snapshot 0.
            engine.record_replay_value(9);
            unreachable!("replay continued past the end of the recording");
        }
        2 => {
            // Snapshot 0 again, after running off the end.
            assert_eq!(ENDS.load(Ordering::SeqCst), 1);
            assert!(page(buffer).iter().all(|byte| *byte == 0xAA));
            assert_eq!(rewind_core::engine_state(), rewind_core::EngineState::Running);
            assert!(!engine.threads().main_thread().pass_through());

            page(buffer).fill(0xCC);
            assert_eq!(engine.record_replay_value(700), 7);
            PASS.store(3, Ordering::SeqCst);
            engine.restore_snapshot_and_resume(0);
        }
        3 => {
            // A third restore of the same snapshot replays the same values.
            assert_eq!(ENDS.load(Ordering::SeqCst), 1);
            assert!(page(buffer).iter().all(|byte| *byte == 0xAA));
            assert!(!engine.threads().main_thread().pass_through());
            assert_eq!(engine.record_replay_value(7000), 7);
            assert_eq!(engine.record_replay_value(8000), 8);
            assert_eq!(engine.last_snapshot(), Some(0));
        }
        pass => panic!("unexpected pass {}", pass),
    }
}
