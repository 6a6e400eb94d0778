//! # Engine Configuration
//!
//! The engine is configured from the environment at startup, or built
//! programmatically:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `RECORD=<path>` | record to `path` (`*` for a fresh temporary file) |
//! | `REPLAY=<path>` | replay `path` |
//! | `MIDDLEMAN_RECORD`, `MIDDLEMAN_REPLAY` | this process is the middleman |
//! | `RECORD_REPLAY_SPEW` | debug level logging |
//! | `DUMP_RECORDING=<path>` | log the assertions stored in a recording |
//! | `RECORD_REPLAY_SNAPSHOT_INTERVAL_MS` | snapshot recording throttle |

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use rewind_execution::thread::{
    DEFAULT_CALL_EVENT_HELPERS, DEFAULT_MAX_NON_RECORDED_THREADS, DEFAULT_MAX_RECORDED_THREAD_ID,
};
use rewind_execution::ThreadConfig;
use rewind_hal::memory::PAGE_SIZE;
use rewind_memory::snapshot::{DEFAULT_HIGH_MARK_PAGES, DEFAULT_LOW_MARK_PAGES, DEFAULT_WORKERS};
use rewind_memory::MemoryConfig;

use crate::error::{EngineError, EngineResult};

/// Record to the named file.
pub const ENV_RECORD: &str = "RECORD";
/// Replay the named file.
pub const ENV_REPLAY: &str = "REPLAY";
/// Middleman for a recording child.
pub const ENV_MIDDLEMAN_RECORD: &str = "MIDDLEMAN_RECORD";
/// Middleman for a replaying child.
pub const ENV_MIDDLEMAN_REPLAY: &str = "MIDDLEMAN_REPLAY";
/// Verbose logging.
pub const ENV_SPEW: &str = "RECORD_REPLAY_SPEW";
/// Dump a recording's assertions at startup.
pub const ENV_DUMP_RECORDING: &str = "DUMP_RECORDING";
/// Minimum time between recorded snapshots, in milliseconds.
pub const ENV_SNAPSHOT_INTERVAL: &str = "RECORD_REPLAY_SNAPSHOT_INTERVAL_MS";

/// Path standing for a fresh temporary recording.
pub const TEMPORARY_RECORDING: &str = "*";

/// Default minimum time between recorded snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(3000);

/// What this process does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Neither recording nor replaying
    Inactive,
    /// Relaying between a recording or replaying child and its controller
    Middleman,
    /// Recording to a file
    Record(PathBuf),
    /// Replaying a file
    Replay(PathBuf),
}

impl Mode {
    /// Whether the engine runs in this mode.
    pub fn is_active(&self) -> bool {
        matches!(self, Mode::Record(_) | Mode::Replay(_))
    }
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Process mode
    pub mode: Mode,
    /// Log at debug level
    pub spew: bool,
    /// Recording whose assertions are dumped at startup
    pub dump_recording: Option<PathBuf>,
    /// Minimum time between recorded snapshots. Temporary and final
    /// snapshots are always recorded.
    pub snapshot_interval: Duration,
    /// Highest recorded thread id
    pub max_recorded_thread_id: usize,
    /// Non-recorded thread slots
    pub max_non_recorded_threads: usize,
    /// Call event helper threads
    pub call_event_helpers: usize,
    /// Memory snapshot workers
    pub snapshot_workers: usize,
    /// Page copy bytes above which workers write copies out
    pub page_copy_high_mark: usize,
    /// Page copy bytes below which workers stop writing
    pub page_copy_low_mark: usize,
    /// Directory for temporary recordings and snapshot side files
    pub temp_dir: PathBuf,
}

impl EngineConfig {
    /// Defaults for `mode`.
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            spew: false,
            dump_recording: None,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            max_recorded_thread_id: DEFAULT_MAX_RECORDED_THREAD_ID,
            max_non_recorded_threads: DEFAULT_MAX_NON_RECORDED_THREADS,
            call_event_helpers: DEFAULT_CALL_EVENT_HELPERS,
            snapshot_workers: DEFAULT_WORKERS,
            page_copy_high_mark: DEFAULT_HIGH_MARK_PAGES * PAGE_SIZE,
            page_copy_low_mark: DEFAULT_LOW_MARK_PAGES * PAGE_SIZE,
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Read the process environment.
    pub fn from_env() -> EngineResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build from `(name, value)` pairs.
    pub fn from_vars<I, K, V>(vars: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut record = None;
        let mut replay = None;
        let mut middleman = false;
        let mut config = Self::new(Mode::Inactive);

        for (name, value) in vars {
            let value = value.as_ref();
            match name.as_ref() {
                ENV_RECORD => record = Some(value.to_owned()),
                ENV_REPLAY => replay = Some(value.to_owned()),
                ENV_MIDDLEMAN_RECORD | ENV_MIDDLEMAN_REPLAY => middleman = true,
                ENV_SPEW => config.spew = true,
                ENV_DUMP_RECORDING => config.dump_recording = Some(PathBuf::from(value)),
                ENV_SNAPSHOT_INTERVAL => {
                    let millis = value.trim().parse::<u64>().map_err(|_| {
                        EngineError::Config(format!("{}={} is not a number", ENV_SNAPSHOT_INTERVAL, value))
                    })?;
                    config.snapshot_interval = Duration::from_millis(millis);
                }
                _ => {}
            }
        }

        config.mode = match (record, replay) {
            (Some(_), Some(_)) => {
                return Err(EngineError::Config(format!(
                    "{} and {} are both set",
                    ENV_RECORD, ENV_REPLAY
                )))
            }
            _ if middleman => Mode::Middleman,
            (Some(path), None) if path == TEMPORARY_RECORDING => {
                Mode::Record(config.temporary_path("recording"))
            }
            (Some(path), None) => Mode::Record(PathBuf::from(path)),
            (None, Some(path)) if path == TEMPORARY_RECORDING => {
                return Err(EngineError::Config(format!(
                    "{} needs an existing recording",
                    ENV_REPLAY
                )))
            }
            (None, Some(path)) => Mode::Replay(PathBuf::from(path)),
            (None, None) => Mode::Inactive,
        };
        Ok(config)
    }

    /// Use `mode`.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Record a snapshot at most once per `interval`.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Use recorded ids `1..=max_id`.
    pub fn with_recorded_threads(mut self, max_id: usize) -> Self {
        self.max_recorded_thread_id = max_id;
        self
    }

    /// Use `count` call event helpers.
    pub fn with_call_event_helpers(mut self, count: usize) -> Self {
        self.call_event_helpers = count;
        self
    }

    /// Use `count` memory snapshot workers.
    pub fn with_snapshot_workers(mut self, count: usize) -> Self {
        self.snapshot_workers = count;
        self
    }

    /// Page copy pressure marks, in bytes.
    pub fn with_page_copy_marks(mut self, high: usize, low: usize) -> Self {
        self.page_copy_high_mark = high;
        self.page_copy_low_mark = low;
        self
    }

    /// Put temporary files under `dir`.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Dump the assertions of `path` at startup.
    pub fn with_dump_recording(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_recording = Some(path.into());
        self
    }

    /// A fresh, randomly named path under the temporary directory.
    pub fn temporary_path(&self, what: &str) -> PathBuf {
        let tag: u64 = rand::thread_rng().gen();
        self.temp_dir.join(format!("rewind-{}-{}-{:016x}", what, std::process::id(), tag))
    }

    /// Thread table settings, with stack files under a fresh prefix.
    pub fn thread_config(&self) -> ThreadConfig {
        let mut config = ThreadConfig::new(prefix(&self.temporary_path("stacks")))
            .with_recorded_threads(self.max_recorded_thread_id)
            .with_call_event_helpers(self.call_event_helpers);
        config.max_non_recorded_threads = self.max_non_recorded_threads;
        config
    }

    /// Memory snapshot settings, with side files under a fresh prefix.
    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig::new(prefix(&self.temporary_path("memory")))
            .with_workers(self.snapshot_workers)
            .with_marks(
                self.page_copy_high_mark / PAGE_SIZE,
                self.page_copy_low_mark / PAGE_SIZE,
            )
    }
}

fn prefix(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> EngineResult<EngineConfig> {
        EngineConfig::from_vars(pairs.iter().copied())
    }

    #[test]
    fn empty_environment_is_inactive() {
        let config = vars(&[("HOME", "/root")]).unwrap();
        assert_eq!(config.mode, Mode::Inactive);
        assert!(!config.mode.is_active());
        assert_eq!(config.snapshot_interval, DEFAULT_SNAPSHOT_INTERVAL);
        assert!(!config.spew);
    }

    #[test]
    fn record_and_replay_paths() {
        let config = vars(&[(ENV_RECORD, "/tmp/a.rec")]).unwrap();
        assert_eq!(config.mode, Mode::Record(PathBuf::from("/tmp/a.rec")));
        let config = vars(&[(ENV_REPLAY, "/tmp/a.rec"), (ENV_SPEW, "1")]).unwrap();
        assert_eq!(config.mode, Mode::Replay(PathBuf::from("/tmp/a.rec")));
        assert!(config.spew);
    }

    #[test]
    fn wildcard_records_to_a_temporary_file() {
        let first = vars(&[(ENV_RECORD, "*")]).unwrap();
        let second = vars(&[(ENV_RECORD, "*")]).unwrap();
        let (Mode::Record(a), Mode::Record(b)) = (&first.mode, &second.mode) else {
            panic!("expected record mode");
        };
        assert!(a.starts_with(&first.temp_dir));
        assert_ne!(a, b);
        assert!(vars(&[(ENV_REPLAY, "*")]).is_err());
    }

    #[test]
    fn middleman_stays_inactive() {
        let config = vars(&[(ENV_MIDDLEMAN_RECORD, "1"), (ENV_RECORD, "/tmp/x")]).unwrap();
        assert_eq!(config.mode, Mode::Middleman);
        assert!(!config.mode.is_active());
    }

    #[test]
    fn snapshot_interval_is_tunable() {
        let config = vars(&[(ENV_SNAPSHOT_INTERVAL, "250")]).unwrap();
        assert_eq!(config.snapshot_interval, Duration::from_millis(250));
        assert!(matches!(
            vars(&[(ENV_SNAPSHOT_INTERVAL, "soon")]),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn conflicting_modes_are_refused() {
        assert!(vars(&[(ENV_RECORD, "/a"), (ENV_REPLAY, "/b")]).is_err());
    }

    #[test]
    fn derived_subsystem_settings() {
        let config = EngineConfig::new(Mode::Inactive)
            .with_recorded_threads(4)
            .with_call_event_helpers(2)
            .with_snapshot_workers(3)
            .with_page_copy_marks(64 * PAGE_SIZE, 32 * PAGE_SIZE)
            .with_temp_dir("/scratch");
        let threads = config.thread_config();
        assert_eq!(threads.max_recorded_thread_id, 4);
        assert_eq!(threads.call_event_helpers, 2);
        assert!(threads.stack_file_prefix.starts_with("/scratch/rewind-stacks-"));
        let memory = config.memory_config();
        assert_eq!(memory.workers, 3);
        assert_eq!(memory.high_mark_pages, 64);
        assert_eq!(memory.low_mark_pages, 32);
    }
}
