//! Reserved negative heartbeat values marking terminal task states.
//!
//! Heartbeat values greater than zero are monotonic millisecond timestamps;
//! these three reserved values are written instead when a task worker
//! or its signal handler reaches a terminal state, and are the authoritative
//! completion signal observed by the task monitor.

/// A reserved heartbeat value distinguishable from any real timestamp.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i64)]
pub enum HeartbeatSentinel {
    Success = -1,
    Failed = -2,
    Cancelled = -3,
}

impl HeartbeatSentinel {
    pub fn as_value(self) -> i64 {
        self as i64
    }

    /// Parse a raw heartbeat sample back into a sentinel, if it is one.
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            -1 => Some(Self::Success),
            -2 => Some(Self::Failed),
            -3 => Some(Self::Cancelled),
            _ => None,
        }
    }
}
