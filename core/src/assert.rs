//! Record/replay assertions.
//!
//! Assertions live in a per-thread Assert stream next to the Event stream,
//! so turning them on or off never changes the shape of the events. Each
//! entry is:
//!
//! ```text
//!   scalar  event stream position when the assertion was made
//!   scalar  (length << 1) | 1 for text, length << 1 for bytes
//!   bytes   length
//! ```
//!
//! Replay checks the position and the text (the recorded text may carry
//! extra detail after the replayed text) or the exact bytes.

use std::path::Path;

use rewind_execution::{Thread, Threads};
use rewindfs::{File, Stream, StreamName};

use crate::error::{EngineError, EngineResult};

/// Tag bit marking a text assertion.
const TEXT_BIT: u64 = 1;

/// Byte mismatches printed before giving up.
const MAX_MISMATCHES: usize = 100;

/// Largest assertion read back from a recording.
const MAX_ASSERTION_BYTES: usize = 16 << 20;

/// Assertion checking for a thread table.
#[derive(Debug)]
pub struct Assertions {
    threads: &'static Threads,
}

impl Assertions {
    /// Assertions for the threads of `threads`.
    pub fn new(threads: &'static Threads) -> Self {
        Self { threads }
    }

    /// The calling thread if it checks assertions.
    fn asserting_thread(&self) -> EngineResult<Option<&'static Thread>> {
        let Some(thread) = self.threads.current() else {
            return Ok(None);
        };
        if thread.pass_through() || self.threads.has_diverged() {
            return Ok(None);
        }
        if thread.events_disallowed() {
            return Err(rewind_execution::ExecError::EventsDisallowed(thread.id()).into());
        }
        Ok(Some(thread))
    }

    /// Record `text`, or check it against the recording.
    pub fn assert(&self, text: &str) -> EngineResult<()> {
        let Some(thread) = self.asserting_thread()? else {
            return Ok(());
        };
        let position = thread.events()?.lock().position();
        {
            let mut asserts = thread.asserts()?.lock();
            if asserts.is_recording() {
                asserts.write_scalar(position)?;
                asserts.write_scalar(((text.len() as u64) << 1) | TEXT_BIT)?;
                asserts.write_bytes(text.as_bytes())?;
            } else {
                let (recorded_position, tag, recorded) = read_entry(&mut asserts)?;
                let matches = recorded_position == position
                    && tag & TEXT_BIT != 0
                    && recorded.starts_with(text.as_bytes());
                if !matches {
                    drop(asserts);
                    for (i, recent) in thread.recent_asserts().iter().enumerate() {
                        log::error!("Thread {} Recent {}: {}", thread.id(), i, recent);
                    }
                    return Err(EngineError::AssertionMismatch {
                        thread: thread.id(),
                        recorded: String::from_utf8_lossy(&recorded).into_owned(),
                        recorded_position,
                        replayed: text.to_owned(),
                        replayed_position: position,
                    });
                }
            }
        }
        thread.note_assert(text.to_owned());
        Ok(())
    }

    /// Record `data`, or require the recording to hold the same bytes.
    pub fn assert_bytes(&self, data: &[u8]) -> EngineResult<()> {
        self.assert("AssertBytes")?;
        let Some(thread) = self.asserting_thread()? else {
            return Ok(());
        };
        let position = thread.events()?.lock().position();
        let mut asserts = thread.asserts()?.lock();
        if asserts.is_recording() {
            asserts.write_scalar(position)?;
            asserts.write_scalar((data.len() as u64) << 1)?;
            asserts.write_bytes(data)?;
            return Ok(());
        }

        let (recorded_position, tag, recorded) = read_entry(&mut asserts)?;
        let matches =
            recorded_position == position && tag & TEXT_BIT == 0 && recorded.as_slice() == data;
        if matches {
            return Ok(());
        }
        if recorded.len() == data.len() {
            let mut mismatches = 0;
            for (i, (old, new)) in recorded.iter().zip(data).enumerate() {
                if old != new {
                    log::error!("Position {}: {} {}", i, old, new);
                    mismatches += 1;
                    if mismatches == MAX_MISMATCHES {
                        log::error!("Position ...");
                        break;
                    }
                }
            }
        }
        Err(EngineError::ByteMismatch {
            recorded_position,
            replayed_position: position,
            recorded_len: recorded.len(),
            replayed_len: data.len(),
        })
    }
}

fn read_entry(stream: &mut Stream) -> EngineResult<(u64, u64, Vec<u8>)> {
    let position = stream.read_scalar()?;
    let tag = stream.read_scalar()?;
    let len = usize::try_from(tag >> 1)
        .ok()
        .filter(|len| *len <= MAX_ASSERTION_BYTES)
        .ok_or_else(|| rewindfs::FsError::Corrupt(format!("assertion of {} bytes", tag >> 1)))?;
    let mut bytes = vec![0u8; len];
    stream.read_bytes(&mut bytes)?;
    Ok((position, tag, bytes))
}

/// Log every text assertion stored in the recording at `path`, thread by
/// thread. Returns how many were logged.
pub fn dump_recording_assertions(path: &Path) -> EngineResult<usize> {
    let file = File::open(path)?;
    let mut threads: Vec<usize> = file
        .stream_keys()
        .into_iter()
        .filter(|(name, _)| *name == StreamName::Assert)
        .map(|(_, index)| index)
        .collect();
    threads.sort_unstable();

    let mut dumped = 0;
    for id in threads {
        let stream = file.open_stream(StreamName::Assert, id);
        let mut stream = stream.lock();
        while !stream.at_end() {
            let (position, tag, bytes) = read_entry(&mut stream)?;
            if tag & TEXT_BIT != 0 {
                log::info!(
                    "Thread {} [{}]: {}",
                    id,
                    position,
                    String::from_utf8_lossy(&bytes)
                );
                dumped += 1;
            }
        }
    }
    Ok(dumped)
}
