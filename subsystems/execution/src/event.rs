//! Thread events.
//!
//! Every recorded operation starts by writing its [`ThreadEvent`] tag to the
//! issuing thread's event stream. Replay reads the tag back first, so a
//! thread that strays from its recorded path fails on the first operation
//! that differs instead of misinterpreting the payload that follows.

use std::borrow::Cow;

use rewindfs::Stream;

use crate::error::{ExecError, ExecResult};

/// Kinds of recorded thread events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ThreadEvent {
    /// A thread slot was given a start routine
    CreateThread = 0,
    /// A native lock was registered
    CreateLock,
    /// A lock acquisition
    Lock,
    /// A lock acquisition attempt that may fail
    TryLock,
    /// A timed condition variable wait
    WaitForCvarUntil,
    /// A recorded value
    Value,
    /// Recorded bytes
    Bytes,
    /// A callback invoked from native code
    ExecuteCallback,
    /// End of the callbacks of a pass-through section
    CallbacksFinished,
    /// Callback data restored through its value index
    RestoreCallbackData,
    /// A trigger object was registered
    RegisterTrigger,
    /// An activated trigger ran
    ExecuteTrigger,
    /// No more activated triggers
    ExecuteTriggersFinished,
}

impl ThreadEvent {
    /// Every event, in tag order.
    pub const ALL: [ThreadEvent; 13] = [
        ThreadEvent::CreateThread,
        ThreadEvent::CreateLock,
        ThreadEvent::Lock,
        ThreadEvent::TryLock,
        ThreadEvent::WaitForCvarUntil,
        ThreadEvent::Value,
        ThreadEvent::Bytes,
        ThreadEvent::ExecuteCallback,
        ThreadEvent::CallbacksFinished,
        ThreadEvent::RestoreCallbackData,
        ThreadEvent::RegisterTrigger,
        ThreadEvent::ExecuteTrigger,
        ThreadEvent::ExecuteTriggersFinished,
    ];

    /// Decode a recorded tag.
    pub fn from_u64(tag: u64) -> Option<Self> {
        Self::ALL.get(usize::try_from(tag).ok()?).copied()
    }

    /// Name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            ThreadEvent::CreateThread => "CreateThread",
            ThreadEvent::CreateLock => "CreateLock",
            ThreadEvent::Lock => "Lock",
            ThreadEvent::TryLock => "TryLock",
            ThreadEvent::WaitForCvarUntil => "WaitForCvarUntil",
            ThreadEvent::Value => "Value",
            ThreadEvent::Bytes => "Bytes",
            ThreadEvent::ExecuteCallback => "ExecuteCallback",
            ThreadEvent::CallbacksFinished => "CallbacksFinished",
            ThreadEvent::RestoreCallbackData => "RestoreCallbackData",
            ThreadEvent::RegisterTrigger => "RegisterTrigger",
            ThreadEvent::ExecuteTrigger => "ExecuteTrigger",
            ThreadEvent::ExecuteTriggersFinished => "ExecuteTriggersFinished",
        }
    }

    /// Name of a raw tag, which may not be a known event.
    pub fn describe(tag: u64) -> Cow<'static, str> {
        match Self::from_u64(tag) {
            Some(event) => Cow::Borrowed(event.name()),
            None => Cow::Owned(format!("#{}", tag)),
        }
    }
}

/// Write `event` while recording, or read the next event and require it to
/// be `event` while replaying.
pub fn record_or_replay_event(stream: &mut Stream, event: ThreadEvent) -> ExecResult<()> {
    if stream.is_recording() {
        stream.write_scalar(event as u64)?;
        return Ok(());
    }
    let recorded = stream.read_scalar()?;
    if recorded != event as u64 {
        return Err(ExecError::EventMismatch {
            recorded,
            replayed: event,
        });
    }
    Ok(())
}

/// Read the next event tag without requiring a particular event. Used where
/// replay branches on what was recorded.
pub fn replay_any_event(stream: &mut Stream) -> ExecResult<u64> {
    Ok(stream.read_scalar()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewindfs::{File, StreamName};

    #[test]
    fn tags_round_trip_through_names() {
        for (i, event) in ThreadEvent::ALL.iter().enumerate() {
            assert_eq!(*event as usize, i);
            assert_eq!(ThreadEvent::from_u64(i as u64), Some(*event));
        }
        assert_eq!(ThreadEvent::from_u64(13), None);
        assert_eq!(ThreadEvent::describe(2), "Lock");
        assert_eq!(ThreadEvent::describe(40), "#40");
    }

    #[test]
    fn replay_detects_a_different_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events");
        {
            let file = File::create(&path).unwrap();
            let stream = file.open_stream(StreamName::Event, 1);
            let mut stream = stream.lock();
            record_or_replay_event(&mut stream, ThreadEvent::CreateLock).unwrap();
            record_or_replay_event(&mut stream, ThreadEvent::Lock).unwrap();
            drop(stream);
            file.close().unwrap();
        }

        let file = File::open(&path).unwrap();
        let stream = file.open_stream(StreamName::Event, 1);
        let mut stream = stream.lock();
        record_or_replay_event(&mut stream, ThreadEvent::CreateLock).unwrap();
        let err = record_or_replay_event(&mut stream, ThreadEvent::Value).unwrap_err();
        assert!(matches!(
            err,
            ExecError::EventMismatch {
                recorded: 2,
                replayed: ThreadEvent::Value
            }
        ));
        assert!(record_or_replay_event(&mut stream, ThreadEvent::Value)
            .unwrap_err()
            .is_end_of_recording());
    }
}
