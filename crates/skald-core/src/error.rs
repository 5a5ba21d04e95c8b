//! The error taxonomy.
//!
//! `ErrorKind` names six broad categories; `SkaldError` is a thin wrapper
//! carrying a kind plus a source error, with hand-rolled `Display`/`source`
//! implementations rather than pulling in a derive macro for a handful of
//! variants.

use std::fmt;

/// A classification, not a type hierarchy: adapter crates convert their
/// driver-specific errors into one of these kinds via `SkaldError::new`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// KV/BUS/DB timeout or connection refused. Logged at WARN, retried next
    /// tick with backoff; never fatal to the loop that hit it.
    TransientIo,

    /// Un-parseable bus message, non-integer heartbeat, missing required
    /// field. Logged at ERROR, the message/sample is dropped.
    MalformedPayload,

    /// Unknown `className`, wrong `executor`, duplicate task id. Logged at
    /// WARN, no action taken (or, for a duplicate assign, heartbeat/exception
    /// keys are reset).
    PolicyRejection,

    /// A task subprocess exited non-zero or was signalled.
    SubprocessFailure,

    /// Registering two worker classes under one `className`, double-starting
    /// a singleton loop. Raised at startup, aborts the process.
    ProgrammerError,

    /// The controller or node cannot reach a required external collaborator
    /// at startup, or loses it permanently mid-run.
    FatalResourceLoss,
}

impl ErrorKind {
    /// Whether this kind indicates the caller should retry with backoff
    /// rather than give up.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::TransientIo)
    }
}

pub struct SkaldError {
    kind: ErrorKind,
    source: anyhow::Error,
}

impl SkaldError {
    pub fn new(kind: ErrorKind, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        Self::new(ErrorKind::TransientIo, source)
    }

    pub fn malformed(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::MalformedPayload, anyhow::anyhow!("{message}"))
    }

    pub fn policy(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::PolicyRejection, anyhow::anyhow!("{message}"))
    }
}

impl fmt::Debug for SkaldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkaldError")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for SkaldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.source)
    }
}

impl std::error::Error for SkaldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::TransientIo.is_retryable());
        assert!(!ErrorKind::PolicyRejection.is_retryable());
        assert!(!ErrorKind::ProgrammerError.is_retryable());
    }
}
