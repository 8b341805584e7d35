//! Exchange process state.
//!
//! A single tagged value, moved out of `Running` exactly once by
//! compare-and-set. States are never combined.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Process state of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProcessState {
    Running = 0,
    Done = 1,
    Timeout = 2,
    Interrupted = 3,
    Exception = 4,
    ConnectionClosed = 5,
    Rejected = 6,
    RequestBufferOverflow = 7,
    ResponseBufferOverflow = 8,
    /// Decoded from a raw value that matches no known state.
    Unknown = u8::MAX,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
            Self::Exception => "exception",
            Self::ConnectionClosed => "connection_closed",
            Self::Rejected => "rejected",
            Self::RequestBufferOverflow => "request_buffer_overflow",
            Self::ResponseBufferOverflow => "response_buffer_overflow",
            Self::Unknown => "unknown",
        }
    }
}

impl From<u8> for ProcessState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Done,
            2 => Self::Timeout,
            3 => Self::Interrupted,
            4 => Self::Exception,
            5 => Self::ConnectionClosed,
            6 => Self::Rejected,
            7 => Self::RequestBufferOverflow,
            8 => Self::ResponseBufferOverflow,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic cell holding a [`ProcessState`].
#[derive(Debug)]
pub struct AtomicProcessState {
    raw: AtomicU8,
}

impl AtomicProcessState {
    pub fn new() -> Self {
        Self { raw: AtomicU8::new(ProcessState::Running as u8) }
    }

    pub fn load(&self) -> ProcessState {
        ProcessState::from(self.raw.load(Ordering::Acquire))
    }

    /// Move from `Running` to `terminal`. Returns false if another writer
    /// already recorded a terminal state, or if `terminal` is `Running`.
    pub fn finish(&self, terminal: ProcessState) -> bool {
        if !terminal.is_terminal() {
            return false;
        }
        self.raw
            .compare_exchange(
                ProcessState::Running as u8,
                terminal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for AtomicProcessState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_terminal_writer_wins() {
        let state = AtomicProcessState::new();
        assert!(state.finish(ProcessState::Timeout));
        assert!(!state.finish(ProcessState::Done));
        assert_eq!(state.load(), ProcessState::Timeout);
    }

    #[test]
    fn running_is_not_a_terminal_transition() {
        let state = AtomicProcessState::new();
        assert!(!state.finish(ProcessState::Running));
        assert_eq!(state.load(), ProcessState::Running);
    }

    #[test]
    fn unknown_raw_values_decode_to_unknown() {
        assert_eq!(ProcessState::from(42), ProcessState::Unknown);
        assert_eq!(ProcessState::from(6), ProcessState::Rejected);
    }

    #[test]
    fn concurrent_writers_leave_exactly_one_winner() {
        let state = Arc::new(AtomicProcessState::new());
        let candidates = [
            ProcessState::Done,
            ProcessState::Timeout,
            ProcessState::Exception,
            ProcessState::Interrupted,
        ];
        let handles: Vec<_> = candidates
            .into_iter()
            .map(|s| {
                let state = state.clone();
                thread::spawn(move || state.finish(s))
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert!(candidates.contains(&state.load()));
    }
}
